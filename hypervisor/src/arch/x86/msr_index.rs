// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Model-specific register indices and typed views of the registers this
//! crate interprets.

use crate::arch::x86::regs::Efer;

pub const MSR_IA32_APIC_BASE: u32 = 0x0000_001b;
pub const MSR_IA32_FEATURE_CONTROL: u32 = 0x0000_003a;
pub const MSR_IA32_MTRRCAP: u32 = 0x0000_00fe;

pub const MSR_IA32_MTRR_PHYSBASE0: u32 = 0x0000_0200;
pub const MSR_IA32_MTRR_PHYSMASK0: u32 = 0x0000_0201;
pub const MSR_IA32_MTRR_FIX64K_00000: u32 = 0x0000_0250;
pub const MSR_IA32_MTRR_FIX16K_80000: u32 = 0x0000_0258;
pub const MSR_IA32_MTRR_FIX16K_A0000: u32 = 0x0000_0259;
pub const MSR_IA32_MTRR_FIX4K_C0000: u32 = 0x0000_0268;
pub const MSR_IA32_MTRR_FIX4K_C8000: u32 = 0x0000_0269;
pub const MSR_IA32_MTRR_FIX4K_D0000: u32 = 0x0000_026a;
pub const MSR_IA32_MTRR_FIX4K_D8000: u32 = 0x0000_026b;
pub const MSR_IA32_MTRR_FIX4K_E0000: u32 = 0x0000_026c;
pub const MSR_IA32_MTRR_FIX4K_E8000: u32 = 0x0000_026d;
pub const MSR_IA32_MTRR_FIX4K_F0000: u32 = 0x0000_026e;
pub const MSR_IA32_MTRR_FIX4K_F8000: u32 = 0x0000_026f;
pub const MSR_IA32_MTRR_DEF_TYPE: u32 = 0x0000_02ff;

pub const MSR_IA32_VMX_BASIC: u32 = 0x0000_0480;
pub const MSR_IA32_VMX_PINBASED_CTLS: u32 = 0x0000_0481;
pub const MSR_IA32_VMX_PROCBASED_CTLS: u32 = 0x0000_0482;
pub const MSR_IA32_VMX_EXIT_CTLS: u32 = 0x0000_0483;
pub const MSR_IA32_VMX_ENTRY_CTLS: u32 = 0x0000_0484;
pub const MSR_IA32_VMX_CR0_FIXED0: u32 = 0x0000_0486;
pub const MSR_IA32_VMX_CR0_FIXED1: u32 = 0x0000_0487;
pub const MSR_IA32_VMX_CR4_FIXED0: u32 = 0x0000_0488;
pub const MSR_IA32_VMX_CR4_FIXED1: u32 = 0x0000_0489;
pub const MSR_IA32_VMX_PROCBASED_CTLS2: u32 = 0x0000_048b;
pub const MSR_IA32_VMX_EPT_VPID_CAP: u32 = 0x0000_048c;
pub const MSR_IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x0000_048d;
pub const MSR_IA32_VMX_TRUE_PROCBASED_CTLS: u32 = 0x0000_048e;
pub const MSR_IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x0000_048f;
pub const MSR_IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x0000_0490;
pub const MSR_IA32_VMX_VMFUNC: u32 = 0x0000_0491;

pub const MSR_IA32_EFER: u32 = 0xc000_0080;

/// Index of the variable-range base MSR for range `n`.
pub const fn mtrr_physbase(n: u32) -> u32 {
    MSR_IA32_MTRR_PHYSBASE0 + 2 * n
}

/// Index of the variable-range mask MSR for range `n`.
pub const fn mtrr_physmask(n: u32) -> u32 {
    MSR_IA32_MTRR_PHYSMASK0 + 2 * n
}

///
/// A model-specific register with a fixed index and a typed value.
///
/// Implementors are plain images of the 64-bit register contents; reading
/// and writing them goes through `RegisterPort::read` and
/// `RegisterPort::write`.
///
pub trait Msr: Copy {
    /// Index passed to `rdmsr`/`wrmsr`.
    const INDEX: u32;

    fn from_raw(raw: u64) -> Self;

    fn raw(&self) -> u64;
}

impl Msr for Efer {
    const INDEX: u32 = MSR_IA32_EFER;

    fn from_raw(raw: u64) -> Self {
        Efer::from_bits_retain(raw)
    }

    fn raw(&self) -> u64 {
        self.bits()
    }
}

macro_rules! define_msr {
    ($(#[$attr:meta])* $name:ident, $index:expr) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl Msr for $name {
            const INDEX: u32 = $index;

            fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

fn bit(raw: u64, shift: u32) -> bool {
    raw & (1 << shift) != 0
}

fn field(raw: u64, shift: u32, width: u32) -> u64 {
    (raw >> shift) & ((1 << width) - 1)
}

define_msr!(
    /// IA32_APIC_BASE.
    ApicBase,
    MSR_IA32_APIC_BASE
);

impl ApicBase {
    pub fn bootstrap_processor(&self) -> bool {
        bit(self.0, 8)
    }

    pub fn x2apic_enabled(&self) -> bool {
        bit(self.0, 10)
    }

    pub fn enabled(&self) -> bool {
        bit(self.0, 11)
    }

    pub fn base_address(&self) -> u64 {
        self.0 & 0x000f_ffff_ffff_f000
    }
}

define_msr!(
    /// IA32_FEATURE_CONTROL.
    FeatureControl,
    MSR_IA32_FEATURE_CONTROL
);

impl FeatureControl {
    pub const LOCKED: u64 = 1 << 0;
    pub const VMXON_INSIDE_SMX: u64 = 1 << 1;
    pub const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

    pub fn locked(&self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    pub fn vmxon_inside_smx(&self) -> bool {
        self.0 & Self::VMXON_INSIDE_SMX != 0
    }

    pub fn vmxon_outside_smx(&self) -> bool {
        self.0 & Self::VMXON_OUTSIDE_SMX != 0
    }
}

define_msr!(
    /// IA32_MTRRCAP: MTRR capabilities.
    MtrrCap,
    MSR_IA32_MTRRCAP
);

impl MtrrCap {
    /// Number of variable ranges implemented (VCNT).
    pub fn variable_range_count(&self) -> u8 {
        field(self.0, 0, 8) as u8
    }

    pub fn fixed_ranges_supported(&self) -> bool {
        bit(self.0, 8)
    }

    pub fn write_combining_supported(&self) -> bool {
        bit(self.0, 10)
    }

    pub fn smrr_supported(&self) -> bool {
        bit(self.0, 11)
    }
}

define_msr!(
    /// IA32_MTRR_DEF_TYPE: default memory type and MTRR enables.
    MtrrDefType,
    MSR_IA32_MTRR_DEF_TYPE
);

impl MtrrDefType {
    pub const FIXED_ENABLE: u64 = 1 << 10;
    pub const ENABLE: u64 = 1 << 11;

    pub fn new(default_type: u8, enabled: bool, fixed_enabled: bool) -> Self {
        let mut raw = u64::from(default_type);
        if enabled {
            raw |= Self::ENABLE;
        }
        if fixed_enabled {
            raw |= Self::FIXED_ENABLE;
        }
        MtrrDefType(raw)
    }

    pub fn default_type(&self) -> u8 {
        field(self.0, 0, 8) as u8
    }

    pub fn fixed_enabled(&self) -> bool {
        self.0 & Self::FIXED_ENABLE != 0
    }

    pub fn enabled(&self) -> bool {
        self.0 & Self::ENABLE != 0
    }
}

define_msr!(
    /// IA32_VMX_BASIC: VMX revision, region size and capability flags.
    VmxBasic,
    MSR_IA32_VMX_BASIC
);

impl VmxBasic {
    pub fn revision_id(&self) -> u32 {
        field(self.0, 0, 31) as u32
    }

    /// Bytes to allocate for the VMXON region and each VMCS.
    pub fn region_size(&self) -> u16 {
        field(self.0, 32, 13) as u16
    }

    /// Whether VMXON, VMCS and related addresses are limited to 32 bits.
    pub fn physical_address_width_32(&self) -> bool {
        bit(self.0, 48)
    }

    pub fn dual_monitor(&self) -> bool {
        bit(self.0, 49)
    }

    pub fn memory_type(&self) -> u8 {
        field(self.0, 50, 4) as u8
    }

    pub fn ins_outs_reporting(&self) -> bool {
        bit(self.0, 54)
    }

    /// Whether the IA32_VMX_TRUE_*_CTLS capability MSRs are implemented.
    pub fn true_controls(&self) -> bool {
        bit(self.0, 55)
    }
}

define_msr!(
    /// IA32_VMX_EPT_VPID_CAP.
    VmxEptVpidCap,
    MSR_IA32_VMX_EPT_VPID_CAP
);

impl VmxEptVpidCap {
    pub fn execute_only(&self) -> bool {
        bit(self.0, 0)
    }

    pub fn page_walk_length_4(&self) -> bool {
        bit(self.0, 6)
    }

    pub fn uncacheable_paging_structures(&self) -> bool {
        bit(self.0, 8)
    }

    pub fn write_back_paging_structures(&self) -> bool {
        bit(self.0, 14)
    }

    pub fn pde_2m_pages(&self) -> bool {
        bit(self.0, 16)
    }

    pub fn pdpte_1g_pages(&self) -> bool {
        bit(self.0, 17)
    }

    pub fn invept(&self) -> bool {
        bit(self.0, 20)
    }

    pub fn accessed_dirty_flags(&self) -> bool {
        bit(self.0, 21)
    }

    pub fn invept_single_context(&self) -> bool {
        bit(self.0, 25)
    }

    pub fn invept_all_context(&self) -> bool {
        bit(self.0, 26)
    }

    pub fn invvpid(&self) -> bool {
        bit(self.0, 32)
    }

    pub fn invvpid_individual_address(&self) -> bool {
        bit(self.0, 40)
    }

    pub fn invvpid_single_context(&self) -> bool {
        bit(self.0, 41)
    }

    pub fn invvpid_all_context(&self) -> bool {
        bit(self.0, 42)
    }

    pub fn invvpid_single_context_retaining_globals(&self) -> bool {
        bit(self.0, 43)
    }
}

macro_rules! define_fixed_msr {
    ($(#[$attr:meta])* $name:ident, $index:expr) => {
        define_msr!($(#[$attr])* $name, $index);

        impl $name {
            pub fn bits(&self) -> u64 {
                self.0
            }
        }
    };
}

define_fixed_msr!(
    /// IA32_VMX_CR0_FIXED0: CR0 bits that must be 1 in VMX operation.
    VmxCr0Fixed0,
    MSR_IA32_VMX_CR0_FIXED0
);
define_fixed_msr!(
    /// IA32_VMX_CR0_FIXED1: CR0 bits that may be 1 in VMX operation.
    VmxCr0Fixed1,
    MSR_IA32_VMX_CR0_FIXED1
);
define_fixed_msr!(
    /// IA32_VMX_CR4_FIXED0: CR4 bits that must be 1 in VMX operation.
    VmxCr4Fixed0,
    MSR_IA32_VMX_CR4_FIXED0
);
define_fixed_msr!(
    /// IA32_VMX_CR4_FIXED1: CR4 bits that may be 1 in VMX operation.
    VmxCr4Fixed1,
    MSR_IA32_VMX_CR4_FIXED1
);
