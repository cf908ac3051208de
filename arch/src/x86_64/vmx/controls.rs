// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! VM-execution, VM-exit and VM-entry control groups and the negotiation of
//! their values against the capability MSRs.

use bitflags::bitflags;
use hypervisor::arch::x86::msr_index::{
    VmxBasic, MSR_IA32_VMX_ENTRY_CTLS, MSR_IA32_VMX_EXIT_CTLS, MSR_IA32_VMX_PINBASED_CTLS,
    MSR_IA32_VMX_PROCBASED_CTLS, MSR_IA32_VMX_PROCBASED_CTLS2, MSR_IA32_VMX_TRUE_ENTRY_CTLS,
    MSR_IA32_VMX_TRUE_EXIT_CTLS, MSR_IA32_VMX_TRUE_PINBASED_CTLS,
    MSR_IA32_VMX_TRUE_PROCBASED_CTLS,
};
use hypervisor::arch::x86::vmx::{VmcsField, VmxResult};
use hypervisor::RegisterPort;

use super::{Error, Result};

/// A 32-bit VMX control field and the MSRs reporting its allowed settings.
pub trait VmxControl: Copy {
    /// Capability MSR consulted when IA32_VMX_BASIC[55] is clear.
    const CAPABILITY_MSR: u32;
    /// Capability MSR consulted when IA32_VMX_BASIC[55] is set.
    const TRUE_CAPABILITY_MSR: u32;
    /// VMCS field holding the control.
    const VMCS_FIELD: VmcsField;

    fn from_raw(raw: u32) -> Self;

    fn raw(&self) -> u32;
}

macro_rules! vmx_controls {
    (
        $(#[$attr:meta])*
        $name:ident: $capability:expr, $true_capability:expr, $field:ident {
            $($(#[$flag_attr:meta])* const $flag:ident = $value:expr;)*
        }
    ) => {
        bitflags! {
            $(#[$attr])*
            #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
            pub struct $name: u32 {
                $($(#[$flag_attr])* const $flag = $value;)*
            }
        }

        impl VmxControl for $name {
            const CAPABILITY_MSR: u32 = $capability;
            const TRUE_CAPABILITY_MSR: u32 = $true_capability;
            const VMCS_FIELD: VmcsField = VmcsField::$field;

            fn from_raw(raw: u32) -> Self {
                $name::from_bits_retain(raw)
            }

            fn raw(&self) -> u32 {
                self.bits()
            }
        }
    };
}

vmx_controls! {
    /// Pin-based VM-execution controls.
    PinBasedControls: MSR_IA32_VMX_PINBASED_CTLS, MSR_IA32_VMX_TRUE_PINBASED_CTLS, PinBasedControls {
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        const NMI_EXITING = 1 << 3;
        const VIRTUAL_NMIS = 1 << 5;
        const PREEMPTION_TIMER = 1 << 6;
        const POSTED_INTERRUPTS = 1 << 7;
    }
}

vmx_controls! {
    /// Primary processor-based VM-execution controls.
    PrimaryProcessorControls:
        MSR_IA32_VMX_PROCBASED_CTLS, MSR_IA32_VMX_TRUE_PROCBASED_CTLS, PrimaryProcessorControls {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const USE_TSC_OFFSETTING = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const INVLPG_EXITING = 1 << 9;
        const MWAIT_EXITING = 1 << 10;
        const RDPMC_EXITING = 1 << 11;
        const RDTSC_EXITING = 1 << 12;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const CR8_LOAD_EXITING = 1 << 19;
        const CR8_STORE_EXITING = 1 << 20;
        const USE_TPR_SHADOW = 1 << 21;
        const NMI_WINDOW_EXITING = 1 << 22;
        const MOV_DR_EXITING = 1 << 23;
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        const USE_IO_BITMAPS = 1 << 25;
        const MONITOR_TRAP_FLAG = 1 << 27;
        const USE_MSR_BITMAPS = 1 << 28;
        const MONITOR_EXITING = 1 << 29;
        const PAUSE_EXITING = 1 << 30;
        const ACTIVATE_SECONDARY_CONTROLS = 1 << 31;
    }
}

// There is no "true" variant of the secondary capability MSR.
vmx_controls! {
    /// Secondary processor-based VM-execution controls.
    SecondaryProcessorControls:
        MSR_IA32_VMX_PROCBASED_CTLS2, MSR_IA32_VMX_PROCBASED_CTLS2, SecondaryProcessorControls {
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        const ENABLE_EPT = 1 << 1;
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        const ENABLE_RDTSCP = 1 << 3;
        const VIRTUALIZE_X2APIC = 1 << 4;
        const ENABLE_VPID = 1 << 5;
        const WBINVD_EXITING = 1 << 6;
        const UNRESTRICTED_GUEST = 1 << 7;
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        const PAUSE_LOOP_EXITING = 1 << 10;
        const RDRAND_EXITING = 1 << 11;
        const ENABLE_INVPCID = 1 << 12;
        const ENABLE_VM_FUNCTIONS = 1 << 13;
        const VMCS_SHADOWING = 1 << 14;
        const ENCLS_EXITING = 1 << 15;
        const RDSEED_EXITING = 1 << 16;
        const ENABLE_PML = 1 << 17;
        const EPT_VIOLATION_VE = 1 << 18;
        const CONCEAL_FROM_PT = 1 << 19;
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
        const MODE_BASED_EXECUTE_CONTROL = 1 << 22;
        const USE_TSC_SCALING = 1 << 25;
    }
}

vmx_controls! {
    /// VM-exit controls.
    ExitControls: MSR_IA32_VMX_EXIT_CTLS, MSR_IA32_VMX_TRUE_EXIT_CTLS, ExitControls {
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const LOAD_PERF_GLOBAL_CTRL = 1 << 12;
        const ACKNOWLEDGE_INTERRUPT_ON_EXIT = 1 << 15;
        const SAVE_PAT = 1 << 18;
        const LOAD_PAT = 1 << 19;
        const SAVE_EFER = 1 << 20;
        const LOAD_EFER = 1 << 21;
        const SAVE_PREEMPTION_TIMER = 1 << 22;
        const CLEAR_BNDCFGS = 1 << 23;
        const CONCEAL_FROM_PT = 1 << 24;
    }
}

vmx_controls! {
    /// VM-entry controls.
    EntryControls: MSR_IA32_VMX_ENTRY_CTLS, MSR_IA32_VMX_TRUE_ENTRY_CTLS, EntryControls {
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        const IA32E_MODE_GUEST = 1 << 9;
        const ENTRY_TO_SMM = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        const LOAD_PERF_GLOBAL_CTRL = 1 << 13;
        const LOAD_PAT = 1 << 14;
        const LOAD_EFER = 1 << 15;
        const LOAD_BNDCFGS = 1 << 16;
        const CONCEAL_FROM_PT = 1 << 17;
    }
}

/// Allowed settings reported by a control capability MSR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllowedSettings {
    /// Bits that must be 1 (low half of the MSR).
    pub allowed0: u32,
    /// Bits that may be 1 (high half of the MSR).
    pub allowed1: u32,
}

impl AllowedSettings {
    pub fn from_msr(raw: u64) -> Self {
        AllowedSettings {
            allowed0: raw as u32,
            allowed1: (raw >> 32) as u32,
        }
    }

    /// Forces the mandatory bits on and the unsupported bits off.
    pub fn adjust(&self, wanted: u32) -> u32 {
        (wanted & self.allowed1) | self.allowed0
    }

    /// Every mandatory bit is set and no unsupported bit is.
    pub fn is_valid(&self, wanted: u32) -> bool {
        wanted & self.allowed0 == self.allowed0 && wanted & !self.allowed1 == 0
    }

    /// Bits the processor lets software choose freely.
    pub fn optional(&self) -> u32 {
        !self.allowed0 & self.allowed1
    }

    /// `wanted` only uses freely selectable bits.
    pub fn is_supported(&self, wanted: u32) -> bool {
        wanted & !self.optional() == 0
    }
}

/// Reads the allowed settings of `T`, from the "true" capability MSR when
/// IA32_VMX_BASIC advertises it.
pub fn controls_allowed<T: VmxControl, P: RegisterPort>(port: &P) -> Result<AllowedSettings> {
    let basic = port.read::<VmxBasic>().map_err(Error::ReadMsr)?;
    let index = if basic.true_controls() {
        T::TRUE_CAPABILITY_MSR
    } else {
        T::CAPABILITY_MSR
    };
    let raw = port.read_msr(index).map_err(Error::ReadMsr)?;
    Ok(AllowedSettings::from_msr(raw))
}

pub fn adjust_vm_controls<P: RegisterPort, T: VmxControl>(port: &P, wanted: T) -> Result<T> {
    let adjusted = controls_allowed::<T, P>(port)?.adjust(wanted.raw());
    if adjusted != wanted.raw() {
        debug!(
            "Adjusted {:?} controls from {:#x} to {:#x}",
            T::VMCS_FIELD,
            wanted.raw(),
            adjusted
        );
    }
    Ok(T::from_raw(adjusted))
}

pub fn are_controls_valid<P: RegisterPort, T: VmxControl>(port: &P, wanted: T) -> Result<bool> {
    Ok(controls_allowed::<T, P>(port)?.is_valid(wanted.raw()))
}

pub fn are_vm_controls_supported<P: RegisterPort, T: VmxControl>(
    port: &P,
    wanted: T,
) -> Result<bool> {
    Ok(controls_allowed::<T, P>(port)?.is_supported(wanted.raw()))
}

/// Writes `controls` to their VMCS field in the current VMCS.
pub fn write_controls<P: RegisterPort, T: VmxControl>(port: &mut P, controls: T) -> VmxResult<()> {
    port.vmwrite(T::VMCS_FIELD, u64::from(controls.raw()))
}

#[cfg(test)]
mod tests {
    use hypervisor::arch::x86::msr_index::MSR_IA32_VMX_BASIC;
    use hypervisor::InMemoryPort;

    use super::*;

    const TRUE_CONTROLS: u64 = 1 << 55;

    // Deterministic spread of 32-bit values.
    fn samples() -> impl Iterator<Item = u32> {
        let mut state: u32 = 0x1234_5678;
        (0..512).map(move |_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        })
    }

    fn settings(allowed0: u32, allowed1: u32) -> AllowedSettings {
        AllowedSettings {
            allowed0,
            allowed1: allowed1 | allowed0,
        }
    }

    #[test]
    fn adjust_is_idempotent_and_valid() {
        let pairs: Vec<u32> = samples().collect();
        for window in pairs.windows(3) {
            let allowed = settings(window[0] & window[1], window[2]);
            for wanted in [0, u32::MAX, window[0], window[1] ^ window[2]] {
                let adjusted = allowed.adjust(wanted);
                assert_eq!(allowed.adjust(adjusted), adjusted);
                assert!(allowed.is_valid(adjusted));
            }
        }
    }

    // Negotiates sampled requests for `T` through the port, on both the
    // legacy and the true capability MSR.
    fn check_negotiation<T: VmxControl>() {
        let values: Vec<u32> = samples().collect();
        for window in values.windows(3).step_by(8) {
            let allowed0 = window[0] & window[1];
            let allowed1 = window[2] | allowed0;
            let capability = (u64::from(allowed1) << 32) | u64::from(allowed0);

            let legacy = InMemoryPort::new()
                .with_msr(MSR_IA32_VMX_BASIC, 0)
                .with_msr(T::CAPABILITY_MSR, capability);
            // Everything mandatory in the legacy MSR, so reading it by
            // mistake shows up in the adjusted value.
            let with_true = InMemoryPort::new()
                .with_msr(MSR_IA32_VMX_BASIC, TRUE_CONTROLS)
                .with_msr(T::CAPABILITY_MSR, u64::MAX)
                .with_msr(T::TRUE_CAPABILITY_MSR, capability);

            for port in [&legacy, &with_true] {
                for wanted in [0, u32::MAX, window[0], window[1] ^ window[2]] {
                    let adjusted = adjust_vm_controls(port, T::from_raw(wanted)).unwrap();
                    assert_eq!(adjusted.raw(), (wanted & allowed1) | allowed0);
                    assert_eq!(
                        adjust_vm_controls(port, adjusted).unwrap().raw(),
                        adjusted.raw()
                    );
                    assert!(are_controls_valid(port, adjusted).unwrap());
                }
            }
        }
    }

    #[test]
    fn pin_based_negotiation() {
        check_negotiation::<PinBasedControls>();
    }

    #[test]
    fn primary_processor_negotiation() {
        check_negotiation::<PrimaryProcessorControls>();
    }

    #[test]
    fn secondary_processor_negotiation() {
        check_negotiation::<SecondaryProcessorControls>();
    }

    #[test]
    fn exit_negotiation() {
        check_negotiation::<ExitControls>();
    }

    #[test]
    fn entry_negotiation() {
        check_negotiation::<EntryControls>();
    }

    #[test]
    fn validity_and_support() {
        let allowed = AllowedSettings::from_msr(0x0000_00ff_0000_0016);
        assert_eq!(allowed.allowed0, 0x16);
        assert_eq!(allowed.allowed1, 0xff);
        assert_eq!(allowed.optional(), 0xe9);

        assert!(allowed.is_valid(0x16));
        assert!(allowed.is_valid(0x9f));
        assert!(!allowed.is_valid(0x06));
        assert!(!allowed.is_valid(0x116));

        assert!(allowed.is_supported(0x81));
        assert!(!allowed.is_supported(0x02));
        assert!(!allowed.is_supported(0x100));
    }

    #[test]
    fn capability_msr_selection() {
        // Legacy MSR forces HLT exiting, the true MSR does not.
        let legacy = InMemoryPort::new()
            .with_msr(MSR_IA32_VMX_BASIC, 0)
            .with_msr(MSR_IA32_VMX_PROCBASED_CTLS, 0xffff_ffff_0000_0080)
            .with_msr(MSR_IA32_VMX_TRUE_PROCBASED_CTLS, 0xffff_ffff_0000_0000);
        let with_true = legacy.clone().with_msr(MSR_IA32_VMX_BASIC, TRUE_CONTROLS);

        let wanted = PrimaryProcessorControls::USE_MSR_BITMAPS;
        assert_eq!(
            adjust_vm_controls(&legacy, wanted).unwrap(),
            wanted | PrimaryProcessorControls::HLT_EXITING
        );
        assert_eq!(adjust_vm_controls(&with_true, wanted).unwrap(), wanted);
        assert!(!are_controls_valid(&legacy, wanted).unwrap());
        assert!(are_controls_valid(&with_true, wanted).unwrap());
    }

    #[test]
    fn secondary_controls_share_one_msr() {
        assert_eq!(
            SecondaryProcessorControls::CAPABILITY_MSR,
            SecondaryProcessorControls::TRUE_CAPABILITY_MSR
        );
        let port = InMemoryPort::new()
            .with_msr(MSR_IA32_VMX_BASIC, TRUE_CONTROLS)
            .with_msr(MSR_IA32_VMX_PROCBASED_CTLS2, 0x0000_00a2_0000_0000);

        let wanted = SecondaryProcessorControls::ENABLE_EPT
            | SecondaryProcessorControls::ENABLE_VPID
            | SecondaryProcessorControls::ENABLE_RDTSCP;
        assert_eq!(
            adjust_vm_controls(&port, wanted).unwrap(),
            SecondaryProcessorControls::ENABLE_EPT | SecondaryProcessorControls::ENABLE_VPID
        );
        assert!(!are_vm_controls_supported(&port, wanted).unwrap());
        assert!(are_vm_controls_supported(
            &port,
            SecondaryProcessorControls::UNRESTRICTED_GUEST
        )
        .unwrap());
    }

    #[test]
    fn unknown_bits_survive_conversion() {
        let raw = 0x8000_0001;
        assert_eq!(ExitControls::from_raw(raw).raw(), raw);
        assert_eq!(EntryControls::VMCS_FIELD, VmcsField::EntryControls);
        assert_eq!(PinBasedControls::VMCS_FIELD.encoding(), 0x4000);
    }

    #[test]
    fn missing_capability_msr() {
        let port = InMemoryPort::new().with_msr(MSR_IA32_VMX_BASIC, 0);
        assert!(matches!(
            controls_allowed::<EntryControls, _>(&port),
            Err(Error::ReadMsr(_))
        ));
    }

    #[test]
    fn controls_written_to_vmcs() {
        let mut port = InMemoryPort::new();
        port.vmxon(0x1000).unwrap();
        port.vmptrld(0x2000).unwrap();
        write_controls(&mut port, ExitControls::HOST_ADDRESS_SPACE_SIZE).unwrap();
        assert_eq!(port.vmread(VmcsField::ExitControls).unwrap(), 1 << 9);
    }
}
