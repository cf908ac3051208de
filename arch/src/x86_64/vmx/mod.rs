// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! VMX capability handling: support detection, control negotiation and the
//! CR0/CR4 bits fixed in VMX operation.

pub mod controls;
pub mod segments;

use std::result;

use hypervisor::arch::x86::cpuid::{CPUID_1_ECX_VMX, CPUID_LEAF_FEATURES};
use hypervisor::arch::x86::msr_index::{
    FeatureControl, VmxCr0Fixed0, VmxCr0Fixed1, VmxCr4Fixed0, VmxCr4Fixed1,
};
use hypervisor::arch::x86::regs::{CR0_PE, CR0_PG};
use hypervisor::{PortError, RegisterPort};
use thiserror::Error;

pub use self::controls::{
    adjust_vm_controls, are_controls_valid, are_vm_controls_supported, controls_allowed,
    write_controls, AllowedSettings, EntryControls, ExitControls, PinBasedControls,
    PrimaryProcessorControls, SecondaryProcessorControls, VmxControl,
};
pub use self::segments::{
    segment_access_rights, segment_fields, write_guest_segment, SegmentAccessRights,
    SegmentFields,
};

#[derive(Debug, Error)]
pub enum Error {
    /// Reading a VMX capability MSR failed.
    #[error("Failed to read VMX capability MSR")]
    ReadMsr(#[source] PortError),
}

pub type Result<T> = result::Result<T, Error>;

/// CPUID.1:ECX.VMX.
pub fn is_vmx_supported<P: RegisterPort>(port: &P) -> bool {
    port.cpuid(CPUID_LEAF_FEATURES, 0).ecx & CPUID_1_ECX_VMX != 0
}

/// Whether firmware left VMXON usable outside SMX operation. A clear lock
/// bit means software may still enable it.
pub fn is_vmxon_allowed<P: RegisterPort>(port: &P) -> Result<bool> {
    let control = port.read::<FeatureControl>().map_err(Error::ReadMsr)?;
    Ok(!control.locked() || control.vmxon_outside_smx())
}

/// CR0 bits that must be set in VMX operation.
///
/// An unrestricted guest may run with paging or protection disabled, so
/// PE and PG are dropped from the mask in that case.
pub fn cr0_fixed_bits<P: RegisterPort>(port: &P, unrestricted_guest: bool) -> Result<u64> {
    let fixed0 = port.read::<VmxCr0Fixed0>().map_err(Error::ReadMsr)?;
    let fixed1 = port.read::<VmxCr0Fixed1>().map_err(Error::ReadMsr)?;
    let mut fixed = fixed0.bits() & fixed1.bits();
    if unrestricted_guest {
        fixed &= !(CR0_PE | CR0_PG);
    }
    Ok(fixed)
}

/// CR4 bits that must be set in VMX operation.
pub fn cr4_fixed_bits<P: RegisterPort>(port: &P) -> Result<u64> {
    let fixed0 = port.read::<VmxCr4Fixed0>().map_err(Error::ReadMsr)?;
    let fixed1 = port.read::<VmxCr4Fixed1>().map_err(Error::ReadMsr)?;
    Ok(fixed0.bits() & fixed1.bits())
}

pub fn adjust_cr0<P: RegisterPort>(port: &P, cr0: u64, unrestricted_guest: bool) -> Result<u64> {
    Ok(cr0 | cr0_fixed_bits(port, unrestricted_guest)?)
}

pub fn adjust_cr4<P: RegisterPort>(port: &P, cr4: u64) -> Result<u64> {
    Ok(cr4 | cr4_fixed_bits(port)?)
}
