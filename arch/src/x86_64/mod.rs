// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

pub mod ept;
pub mod mtrr;
pub mod paging;
pub mod vmx;

use hypervisor::arch::x86::cpuid::{
    CPUID_1_ECX_VMX, CPUID_1_EDX_PAE, CPUID_1_EDX_PSE, CPUID_1_EDX_PSE36,
    CPUID_80000001_EDX_PAGE1GB, CPUID_LEAF_ADDRESS_SIZES, CPUID_LEAF_EXT_FEATURES,
    CPUID_LEAF_FEATURES,
};
use hypervisor::arch::x86::msr_index::{ApicBase, VmxEptVpidCap};
use hypervisor::arch::x86::regs::{ControlRegister, Cr0, Cr4, Efer};
use hypervisor::arch::x86::DEFAULT_PHYS_BITS;
use hypervisor::RegisterPort;
use serde::{Deserialize, Serialize};

/// Physical address bits assumed when neither CPUID leaf 0x8000_0008 nor
/// PAE is available.
const LEGACY_PHYS_BITS: u8 = 32;

/// Widest MAXPHYADDR the paging structures can express.
pub const MAX_PHYS_BITS: u8 = 52;

/// Processor-derived values the translation and memory-type code depends on.
///
/// Built once from the register port and threaded explicitly into every
/// walk, so the walkers stay pure functions of their arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// MAXPHYADDR.
    pub max_phys_bits: u8,
    /// 4 MiB pages in 32-bit paging.
    pub pse: bool,
    /// Physical bits above 31 in 4 MiB 32-bit pages.
    pub pse36: bool,
    /// 1 GiB pages in IA-32e paging.
    pub page_1gb: bool,
    /// 1 GiB pages in EPT paging.
    pub ept_1gb: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            max_phys_bits: DEFAULT_PHYS_BITS,
            pse: true,
            pse36: true,
            page_1gb: false,
            ept_1gb: false,
        }
    }
}

impl PlatformConfig {
    pub fn from_port<P: RegisterPort>(port: &P) -> Self {
        let features = port.cpuid(CPUID_LEAF_FEATURES, 0);

        let max_phys_bits = if port.is_cpuid_leaf_supported(CPUID_LEAF_ADDRESS_SIZES) {
            port.cpuid(CPUID_LEAF_ADDRESS_SIZES, 0)
                .physical_address_bits()
        } else if features.edx & CPUID_1_EDX_PAE != 0 {
            DEFAULT_PHYS_BITS
        } else {
            LEGACY_PHYS_BITS
        };

        let page_1gb = port.is_cpuid_leaf_supported(CPUID_LEAF_EXT_FEATURES)
            && port.cpuid(CPUID_LEAF_EXT_FEATURES, 0).edx & CPUID_80000001_EDX_PAGE1GB != 0;

        // IA32_VMX_EPT_VPID_CAP only exists when VMX does.
        let ept_1gb = features.ecx & CPUID_1_ECX_VMX != 0
            && match port.read::<VmxEptVpidCap>() {
                Ok(cap) => cap.pdpte_1g_pages(),
                Err(e) => {
                    debug!("EPT capabilities unavailable: {}", e);
                    false
                }
            };

        let config = PlatformConfig {
            max_phys_bits,
            pse: features.edx & CPUID_1_EDX_PSE != 0,
            pse36: features.edx & CPUID_1_EDX_PSE36 != 0,
            page_1gb,
            ept_1gb,
        };
        debug!("Platform configuration: {:?}", config);
        config
    }

    /// MAXPHYADDR clamped to what the paging structures can hold.
    pub fn phys_bits(&self) -> u8 {
        self.max_phys_bits.min(MAX_PHYS_BITS)
    }

    /// Highest physical address the processor can generate.
    pub fn max_phys_address(&self) -> u64 {
        (1u64 << self.phys_bits()) - 1
    }
}

/// Paging mode selected by CR0.PG, CR4.PAE and IA32_EFER.LMA.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum PagingMode {
    Disabled,
    Bit32,
    Pae,
    Ia32e,
}

impl PagingMode {
    pub fn from_registers(cr0: Cr0, cr4: Cr4, efer: Efer) -> Self {
        if !cr0.contains(Cr0::PAGING) {
            PagingMode::Disabled
        } else if !cr4.contains(Cr4::PHYSICAL_ADDRESS_EXTENSION) {
            PagingMode::Bit32
        } else if efer.contains(Efer::LONG_MODE_ACTIVE) {
            PagingMode::Ia32e
        } else {
            PagingMode::Pae
        }
    }

    /// Reads CR0, CR4 and IA32_EFER once and decodes the active mode.
    pub fn current<P: RegisterPort>(port: &P) -> hypervisor::Result<Self> {
        let cr0 = Cr0::from_bits_retain(port.read_control_register(ControlRegister::Cr0));
        let cr4 = Cr4::from_bits_retain(port.read_control_register(ControlRegister::Cr4));
        let efer = port.read::<Efer>()?;
        Ok(Self::from_registers(cr0, cr4, efer))
    }
}

/// Whether the executing processor is the bootstrap processor.
pub fn is_bsp<P: RegisterPort>(port: &P) -> hypervisor::Result<bool> {
    Ok(port.read::<ApicBase>()?.bootstrap_processor())
}

#[cfg(test)]
mod tests {
    use hypervisor::arch::x86::cpuid::CpuidResult;
    use hypervisor::arch::x86::msr_index::{
        MSR_IA32_APIC_BASE, MSR_IA32_EFER, MSR_IA32_VMX_EPT_VPID_CAP,
    };
    use hypervisor::arch::x86::regs::{CR0_PE, CR0_PG, CR4_PAE, EFER_LMA, EFER_LME};
    use hypervisor::InMemoryPort;

    use super::*;

    #[test]
    fn config_from_address_size_leaf() {
        let port = InMemoryPort::new()
            .with_cpuid(0, 0, CpuidResult::new(0x16, 0, 0, 0))
            .with_cpuid(1, 0, CpuidResult::new(0, 0, 0, CPUID_1_EDX_PSE | CPUID_1_EDX_PAE))
            .with_cpuid(0x8000_0000, 0, CpuidResult::new(0x8000_0008, 0, 0, 0))
            .with_cpuid(
                0x8000_0001,
                0,
                CpuidResult::new(0, 0, 0, CPUID_80000001_EDX_PAGE1GB),
            )
            .with_cpuid(0x8000_0008, 0, CpuidResult::new(0x3027, 0, 0, 0));

        let config = PlatformConfig::from_port(&port);
        assert_eq!(config.max_phys_bits, 39);
        assert!(config.pse);
        assert!(!config.pse36);
        assert!(config.page_1gb);
        assert_eq!(config.max_phys_address(), (1 << 39) - 1);
    }

    #[test]
    fn config_without_address_size_leaf() {
        let pae = InMemoryPort::new()
            .with_cpuid(0, 0, CpuidResult::new(1, 0, 0, 0))
            .with_cpuid(1, 0, CpuidResult::new(0, 0, 0, CPUID_1_EDX_PAE));
        assert_eq!(PlatformConfig::from_port(&pae).max_phys_bits, 36);

        let legacy = InMemoryPort::new().with_cpuid(0, 0, CpuidResult::new(1, 0, 0, 0));
        let config = PlatformConfig::from_port(&legacy);
        assert_eq!(config.max_phys_bits, 32);
        assert!(!config.page_1gb);
        assert!(!config.ept_1gb);
    }

    #[test]
    fn ept_huge_pages_from_vmx_capabilities() {
        // EPT 1 GiB pages without guest-paging 1 GiB pages.
        let port = InMemoryPort::new()
            .with_cpuid(0, 0, CpuidResult::new(1, 0, 0, 0))
            .with_cpuid(1, 0, CpuidResult::new(0, 0, CPUID_1_ECX_VMX, CPUID_1_EDX_PAE))
            .with_msr(MSR_IA32_VMX_EPT_VPID_CAP, (1 << 17) | (1 << 16) | (1 << 6));
        let config = PlatformConfig::from_port(&port);
        assert!(config.ept_1gb);
        assert!(!config.page_1gb);

        // The capability MSR is not consulted without VMX.
        let port = InMemoryPort::new()
            .with_cpuid(1, 0, CpuidResult::new(0, 0, 0, CPUID_1_EDX_PAE))
            .with_msr(MSR_IA32_VMX_EPT_VPID_CAP, 1 << 17);
        assert!(!PlatformConfig::from_port(&port).ept_1gb);

        // VMX advertised but the MSR cannot be read.
        let port =
            InMemoryPort::new().with_cpuid(1, 0, CpuidResult::new(0, 0, CPUID_1_ECX_VMX, 0));
        assert!(!PlatformConfig::from_port(&port).ept_1gb);
    }

    #[test]
    fn config_document() {
        let config: PlatformConfig =
            serde_json::from_str(r#"{"max_phys_bits": 46, "page_1gb": true}"#).unwrap();
        assert_eq!(config.max_phys_bits, 46);
        assert!(config.pse);
        assert!(config.page_1gb);
        assert!(!config.ept_1gb);

        let text = serde_json::to_string(&PlatformConfig::default()).unwrap();
        let back: PlatformConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, PlatformConfig::default());
    }

    #[test]
    fn paging_modes() {
        let none = Efer::empty();
        let lma = Efer::from_bits_retain(EFER_LME | EFER_LMA);
        let pg = Cr0::from_bits_retain(CR0_PE | CR0_PG);
        let pae = Cr4::from_bits_retain(CR4_PAE);

        assert_eq!(
            PagingMode::from_registers(Cr0::PROTECTION_ENABLE, pae, lma),
            PagingMode::Disabled
        );
        assert_eq!(
            PagingMode::from_registers(pg, Cr4::empty(), none),
            PagingMode::Bit32
        );
        assert_eq!(PagingMode::from_registers(pg, pae, none), PagingMode::Pae);
        assert_eq!(PagingMode::from_registers(pg, pae, lma), PagingMode::Ia32e);
    }

    #[test]
    fn current_mode_and_bsp() {
        let port = InMemoryPort::new()
            .with_control_register(ControlRegister::Cr0, CR0_PE | CR0_PG)
            .with_control_register(ControlRegister::Cr4, CR4_PAE)
            .with_msr(MSR_IA32_EFER, EFER_LME | EFER_LMA)
            .with_msr(MSR_IA32_APIC_BASE, 0xfee0_0900);
        assert_eq!(PagingMode::current(&port).unwrap(), PagingMode::Ia32e);
        assert!(is_bsp(&port).unwrap());

        assert!(PagingMode::current(&InMemoryPort::new()).is_err());
    }
}
