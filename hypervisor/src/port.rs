// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use thiserror::Error;

use crate::arch::x86::cpuid::{CpuidResult, CPUID_LEAF_MAX_BASIC, CPUID_LEAF_MAX_EXTENDED};
use crate::arch::x86::msr_index::Msr;
use crate::arch::x86::regs::{
    ControlRegister, DescriptorTableRegister, SegmentRegister, SegmentSelector, TableRegister,
};
use crate::arch::x86::vmx::{
    InveptDescriptor, InveptType, InvvpidDescriptor, InvvpidType, VmInstructionError, VmcsField,
    VmxResult,
};

#[derive(Error, Debug)]
///
/// Enum for register port error
///
pub enum PortError {
    ///
    /// Reading an MSR failed
    ///
    #[error("Failed to read MSR {index:#x}: {source}")]
    ReadMsr {
        index: u32,
        #[source]
        source: anyhow::Error,
    },
    ///
    /// Writing an MSR failed
    ///
    #[error("Failed to write MSR {index:#x}: {source}")]
    WriteMsr {
        index: u32,
        #[source]
        source: anyhow::Error,
    },
}

///
/// Result type for returning from a function
///
pub type Result<T> = anyhow::Result<T, PortError>;

///
/// Trait to represent the register file of one logical processor
///
/// This is the boundary through which every hardware-derived value enters
/// the translation, memory-type and VMX negotiation code. Implementations
/// take no locks; callers running on several logical processors must
/// serialize access themselves.
///
pub trait RegisterPort {
    ///
    /// Read a model-specific register
    ///
    fn read_msr(&self, index: u32) -> Result<u64>;
    ///
    /// Write a model-specific register
    ///
    fn write_msr(&mut self, index: u32, value: u64) -> Result<()>;
    ///
    /// Execute CPUID for a leaf and subleaf
    ///
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
    ///
    /// Read a control register
    ///
    fn read_control_register(&self, register: ControlRegister) -> u64;
    ///
    /// Write a control register
    ///
    fn write_control_register(&mut self, register: ControlRegister, value: u64);
    ///
    /// Read RFLAGS
    ///
    fn read_rflags(&self) -> u64;
    ///
    /// Read the selector held by a segment register
    ///
    fn read_segment_selector(&self, register: SegmentRegister) -> SegmentSelector;
    ///
    /// Read GDTR or IDTR
    ///
    fn read_table_register(&self, register: DescriptorTableRegister) -> TableRegister;
    ///
    /// Load GDTR or IDTR
    ///
    fn write_table_register(&mut self, register: DescriptorTableRegister, value: &TableRegister);
    ///
    /// Enter VMX root operation with the given VMXON region
    ///
    fn vmxon(&mut self, region: u64) -> VmxResult<()>;
    ///
    /// Leave VMX operation
    ///
    fn vmxoff(&mut self) -> VmxResult<()>;
    ///
    /// Clear the VMCS at the given physical address
    ///
    fn vmclear(&mut self, vmcs: u64) -> VmxResult<()>;
    ///
    /// Make the VMCS at the given physical address current
    ///
    fn vmptrld(&mut self, vmcs: u64) -> VmxResult<()>;
    ///
    /// Physical address of the current VMCS, all ones when there is none
    ///
    fn vmptrst(&self) -> VmxResult<u64>;
    ///
    /// Read a field of the current VMCS
    ///
    fn vmread(&self, field: VmcsField) -> VmxResult<u64>;
    ///
    /// Write a field of the current VMCS
    ///
    fn vmwrite(&mut self, field: VmcsField, value: u64) -> VmxResult<()>;
    ///
    /// Launch the guest described by the current VMCS. Only returns on
    /// failure on real hardware.
    ///
    fn vmlaunch(&mut self) -> VmxResult<()>;
    ///
    /// Invalidate EPT-derived translations
    ///
    fn invept(&mut self, kind: InveptType, descriptor: &InveptDescriptor) -> VmxResult<()>;
    ///
    /// Invalidate VPID-tagged translations
    ///
    fn invvpid(&mut self, kind: InvvpidType, descriptor: &InvvpidDescriptor) -> VmxResult<()>;

    ///
    /// Read a typed MSR
    ///
    fn read<T: Msr>(&self) -> Result<T>
    where
        Self: Sized,
    {
        self.read_msr(T::INDEX).map(T::from_raw)
    }
    ///
    /// Write a typed MSR
    ///
    fn write<T: Msr>(&mut self, value: T) -> Result<()>
    where
        Self: Sized,
    {
        self.write_msr(T::INDEX, value.raw())
    }
    ///
    /// Whether the basic or extended CPUID range reaches `leaf`
    ///
    fn is_cpuid_leaf_supported(&self, leaf: u32) -> bool {
        let max = if leaf >= CPUID_LEAF_MAX_EXTENDED {
            self.cpuid(CPUID_LEAF_MAX_EXTENDED, 0).eax
        } else {
            self.cpuid(CPUID_LEAF_MAX_BASIC, 0).eax
        };
        leaf <= max
    }
    ///
    /// Read the VM-instruction error field of the current VMCS
    ///
    fn vm_instruction_error(&self) -> VmInstructionError {
        match self.vmread(VmcsField::VmInstructionError) {
            Ok(raw) => VmInstructionError::from_raw(raw),
            Err(e) => {
                debug!("Failed to read the VM-instruction error field: {e}");
                VmInstructionError::FailedRetrieval
            }
        }
    }
}
