// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A deterministic register file held in memory.
//!
//! `InMemoryPort` answers MSR, CPUID and register reads from tables the
//! caller fills in, and models the VMX instruction state machine closely
//! enough to exercise VMfailInvalid and VMfailValid paths.

use std::collections::{BTreeMap, BTreeSet};

use crate::arch::x86::cpuid::CpuidResult;
use crate::arch::x86::msr_index::{MSR_IA32_MTRRCAP, MSR_IA32_VMX_BASIC, MSR_IA32_VMX_VMFUNC};
use crate::arch::x86::regs::{
    ControlRegister, DescriptorTableRegister, SegmentRegister, SegmentSelector, TableRegister,
};
use crate::arch::x86::vmx::{
    InveptDescriptor, InveptType, InvvpidDescriptor, InvvpidType, VmFail, VmInstructionError,
    VmcsField, VmxResult,
};
use crate::port::{PortError, RegisterPort, Result};

/// A TLB invalidation issued through the port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invalidation {
    Ept(InveptType, InveptDescriptor),
    Vpid(InvvpidType, InvvpidDescriptor),
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryPort {
    msrs: BTreeMap<u32, u64>,
    cpuid: BTreeMap<(u32, u32), CpuidResult>,
    control_registers: BTreeMap<ControlRegister, u64>,
    rflags: u64,
    selectors: BTreeMap<SegmentRegister, SegmentSelector>,
    tables: BTreeMap<DescriptorTableRegister, TableRegister>,
    vmxon_region: Option<u64>,
    current_vmcs: Option<u64>,
    vmcs: BTreeMap<u64, BTreeMap<VmcsField, u64>>,
    launched: BTreeSet<u64>,
    invalidations: Vec<Invalidation>,
}

impl InMemoryPort {
    pub fn new() -> Self {
        InMemoryPort {
            rflags: 0x2,
            ..Default::default()
        }
    }

    pub fn with_msr(mut self, index: u32, value: u64) -> Self {
        self.msrs.insert(index, value);
        self
    }

    pub fn with_cpuid(mut self, leaf: u32, subleaf: u32, result: CpuidResult) -> Self {
        self.cpuid.insert((leaf, subleaf), result);
        self
    }

    pub fn with_control_register(mut self, register: ControlRegister, value: u64) -> Self {
        self.control_registers.insert(register, value);
        self
    }

    pub fn with_segment_selector(
        mut self,
        register: SegmentRegister,
        selector: SegmentSelector,
    ) -> Self {
        self.selectors.insert(register, selector);
        self
    }

    pub fn set_msr(&mut self, index: u32, value: u64) {
        self.msrs.insert(index, value);
    }

    pub fn remove_msr(&mut self, index: u32) {
        self.msrs.remove(&index);
    }

    pub fn in_vmx_operation(&self) -> bool {
        self.vmxon_region.is_some()
    }

    pub fn is_launched(&self, vmcs: u64) -> bool {
        self.launched.contains(&vmcs)
    }

    /// Invalidations issued so far, oldest first.
    pub fn invalidations(&self) -> &[Invalidation] {
        &self.invalidations
    }

    fn vmx_guard(&self) -> VmxResult<()> {
        if self.vmxon_region.is_none() {
            return Err(VmFail::Invalid);
        }
        Ok(())
    }

    // Records `error` in the current VMCS when there is one.
    fn fail(&mut self, error: VmInstructionError) -> VmFail {
        match self.current_vmcs {
            Some(current) => {
                let number = error.number().map(u64::from).unwrap_or_default();
                self.vmcs
                    .entry(current)
                    .or_default()
                    .insert(VmcsField::VmInstructionError, number);
                VmFail::Valid
            }
            None => VmFail::Invalid,
        }
    }
}

// Capability MSRs raise #GP on write.
fn is_read_only_msr(index: u32) -> bool {
    index == MSR_IA32_MTRRCAP || (MSR_IA32_VMX_BASIC..=MSR_IA32_VMX_VMFUNC).contains(&index)
}

fn is_page_aligned(address: u64) -> bool {
    address & 0xfff == 0
}

impl RegisterPort for InMemoryPort {
    fn read_msr(&self, index: u32) -> Result<u64> {
        self.msrs
            .get(&index)
            .copied()
            .ok_or_else(|| PortError::ReadMsr {
                index,
                source: anyhow!("MSR is not implemented"),
            })
    }

    fn write_msr(&mut self, index: u32, value: u64) -> Result<()> {
        if is_read_only_msr(index) {
            return Err(PortError::WriteMsr {
                index,
                source: anyhow!("MSR is read-only"),
            });
        }
        self.msrs.insert(index, value);
        Ok(())
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }

    fn read_control_register(&self, register: ControlRegister) -> u64 {
        self.control_registers
            .get(&register)
            .copied()
            .unwrap_or_default()
    }

    fn write_control_register(&mut self, register: ControlRegister, value: u64) {
        self.control_registers.insert(register, value);
    }

    fn read_rflags(&self) -> u64 {
        self.rflags
    }

    fn read_segment_selector(&self, register: SegmentRegister) -> SegmentSelector {
        self.selectors.get(&register).copied().unwrap_or_default()
    }

    fn read_table_register(&self, register: DescriptorTableRegister) -> TableRegister {
        self.tables.get(&register).copied().unwrap_or_default()
    }

    fn write_table_register(&mut self, register: DescriptorTableRegister, value: &TableRegister) {
        self.tables.insert(register, *value);
    }

    fn vmxon(&mut self, region: u64) -> VmxResult<()> {
        if self.vmxon_region.is_some() {
            return Err(self.fail(VmInstructionError::VmxonInVmxRoot));
        }
        if !is_page_aligned(region) {
            return Err(VmFail::Invalid);
        }
        self.vmxon_region = Some(region);
        Ok(())
    }

    fn vmxoff(&mut self) -> VmxResult<()> {
        self.vmx_guard()?;
        self.vmxon_region = None;
        self.current_vmcs = None;
        Ok(())
    }

    fn vmclear(&mut self, vmcs: u64) -> VmxResult<()> {
        self.vmx_guard()?;
        if !is_page_aligned(vmcs) {
            return Err(self.fail(VmInstructionError::VmclearInvalidAddress));
        }
        if self.vmxon_region == Some(vmcs) {
            return Err(self.fail(VmInstructionError::VmclearVmxonPointer));
        }
        self.launched.remove(&vmcs);
        if self.current_vmcs == Some(vmcs) {
            self.current_vmcs = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, vmcs: u64) -> VmxResult<()> {
        self.vmx_guard()?;
        if !is_page_aligned(vmcs) {
            return Err(self.fail(VmInstructionError::VmptrldInvalidAddress));
        }
        if self.vmxon_region == Some(vmcs) {
            return Err(self.fail(VmInstructionError::VmptrldVmxonPointer));
        }
        self.vmcs.entry(vmcs).or_default();
        self.current_vmcs = Some(vmcs);
        Ok(())
    }

    fn vmptrst(&self) -> VmxResult<u64> {
        self.vmx_guard()?;
        Ok(self.current_vmcs.unwrap_or(u64::MAX))
    }

    fn vmread(&self, field: VmcsField) -> VmxResult<u64> {
        self.vmx_guard()?;
        let current = self.current_vmcs.ok_or(VmFail::Invalid)?;
        Ok(self
            .vmcs
            .get(&current)
            .and_then(|fields| fields.get(&field))
            .copied()
            .unwrap_or_default())
    }

    fn vmwrite(&mut self, field: VmcsField, value: u64) -> VmxResult<()> {
        self.vmx_guard()?;
        let current = self.current_vmcs.ok_or(VmFail::Invalid)?;
        if field.is_read_only() {
            return Err(self.fail(VmInstructionError::VmwriteReadOnlyComponent));
        }
        self.vmcs.entry(current).or_default().insert(field, value);
        Ok(())
    }

    fn vmlaunch(&mut self) -> VmxResult<()> {
        self.vmx_guard()?;
        let current = self.current_vmcs.ok_or(VmFail::Invalid)?;
        if self.launched.contains(&current) {
            return Err(self.fail(VmInstructionError::VmlaunchNonClearVmcs));
        }
        self.launched.insert(current);
        Ok(())
    }

    fn invept(&mut self, kind: InveptType, descriptor: &InveptDescriptor) -> VmxResult<()> {
        self.vmx_guard()?;
        self.invalidations
            .push(Invalidation::Ept(kind, *descriptor));
        Ok(())
    }

    fn invvpid(&mut self, kind: InvvpidType, descriptor: &InvvpidDescriptor) -> VmxResult<()> {
        self.vmx_guard()?;
        if kind != InvvpidType::AllContext && descriptor.vpid() == 0 {
            return Err(self.fail(VmInstructionError::InvalidInveptInvvpidOperand));
        }
        self.invalidations
            .push(Invalidation::Vpid(kind, *descriptor));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::msr_index::{MtrrCap, MtrrDefType};

    #[test]
    fn unknown_msr_fails() {
        let port = InMemoryPort::new().with_msr(MSR_IA32_MTRRCAP, 0x508);
        assert_eq!(port.read_msr(MSR_IA32_MTRRCAP).unwrap(), 0x508);
        assert_eq!(port.read::<MtrrCap>().unwrap().variable_range_count(), 8);
        assert!(matches!(
            port.read_msr(0x1234),
            Err(PortError::ReadMsr { index: 0x1234, .. })
        ));
    }

    #[test]
    fn capability_msrs_are_read_only() {
        let mut port = InMemoryPort::new();
        assert!(matches!(
            port.write_msr(MSR_IA32_VMX_BASIC, 0),
            Err(PortError::WriteMsr { index: 0x480, .. })
        ));
        port.write(MtrrDefType::new(6, true, true)).unwrap();
        assert_eq!(port.read::<MtrrDefType>().unwrap().0, 0xc06);
    }

    #[test]
    fn vmread_without_current_vmcs() {
        let mut port = InMemoryPort::new();
        assert_eq!(port.vmread(VmcsField::GuestRip), Err(VmFail::Invalid));
        port.vmxon(0x1000).unwrap();
        assert_eq!(port.vmread(VmcsField::GuestRip), Err(VmFail::Invalid));
        assert_eq!(
            port.vm_instruction_error(),
            VmInstructionError::FailedRetrieval
        );
        assert_eq!(port.vmptrst(), Ok(u64::MAX));
    }

    #[test]
    fn vmx_lifecycle() {
        let mut port = InMemoryPort::new();
        port.vmxon(0x1000).unwrap();
        assert!(port.in_vmx_operation());

        assert_eq!(port.vmptrld(0x1000), Err(VmFail::Invalid));
        port.vmclear(0x2000).unwrap();
        port.vmptrld(0x2000).unwrap();
        assert_eq!(port.vmptrst(), Ok(0x2000));

        port.vmwrite(VmcsField::GuestRip, 0xfff0).unwrap();
        assert_eq!(port.vmread(VmcsField::GuestRip), Ok(0xfff0));

        assert_eq!(
            port.vmwrite(VmcsField::ExitReason, 1),
            Err(VmFail::Valid)
        );
        assert_eq!(
            port.vm_instruction_error(),
            VmInstructionError::VmwriteReadOnlyComponent
        );

        port.vmlaunch().unwrap();
        assert!(port.is_launched(0x2000));
        assert_eq!(port.vmlaunch(), Err(VmFail::Valid));
        assert_eq!(
            port.vm_instruction_error(),
            VmInstructionError::VmlaunchNonClearVmcs
        );

        assert_eq!(port.vmxon(0x3000), Err(VmFail::Valid));
        assert_eq!(port.vm_instruction_error(), VmInstructionError::VmxonInVmxRoot);

        port.vmclear(0x2000).unwrap();
        assert!(!port.is_launched(0x2000));
        assert_eq!(port.vmptrst(), Ok(u64::MAX));
        port.vmxoff().unwrap();
        assert_eq!(port.vmxoff(), Err(VmFail::Invalid));
    }

    #[test]
    fn invalidations_are_recorded() {
        let mut port = InMemoryPort::new();
        let descriptor = InveptDescriptor::new(0x5000 | 0x1e);
        assert_eq!(
            port.invept(InveptType::SingleContext, &descriptor),
            Err(VmFail::Invalid)
        );

        port.vmxon(0x1000).unwrap();
        port.invept(InveptType::SingleContext, &descriptor).unwrap();
        port.invvpid(InvvpidType::AllContext, &InvvpidDescriptor::default())
            .unwrap();
        assert_eq!(
            port.invalidations(),
            &[
                Invalidation::Ept(InveptType::SingleContext, descriptor),
                Invalidation::Vpid(InvvpidType::AllContext, InvvpidDescriptor::default()),
            ]
        );
    }

    #[test]
    fn cpuid_leaf_range() {
        let port = InMemoryPort::new()
            .with_cpuid(0, 0, CpuidResult::new(0xd, 0, 0, 0))
            .with_cpuid(0x8000_0000, 0, CpuidResult::new(0x8000_0008, 0, 0, 0));
        assert!(port.is_cpuid_leaf_supported(1));
        assert!(!port.is_cpuid_leaf_supported(0x14));
        assert!(port.is_cpuid_leaf_supported(0x8000_0008));
        assert!(!port.is_cpuid_leaf_supported(0x8000_001f));
    }
}
