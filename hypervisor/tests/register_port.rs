// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use hypervisor::arch::x86::gdt::{self, gdt_entry, GateDescriptor};
use hypervisor::arch::x86::msr_index::{
    MtrrDefType, VmxBasic, MSR_IA32_MTRR_DEF_TYPE, MSR_IA32_VMX_BASIC,
};
use hypervisor::arch::x86::regs::{
    DescriptorTableRegister, SegmentSelector, TableIndicator, TableRegister,
};
use hypervisor::arch::x86::vmx::{
    vmx_result, InvvpidDescriptor, InvvpidType, VmFail, VmInstructionError, VmcsField,
};
use hypervisor::arch::x86::SYSTEM_TYPE_INTERRUPT_GATE;
use hypervisor::{InMemoryPort, Invalidation, RegisterPort};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

const VMXON_REGION: u64 = 0x1000;
const VMCS: u64 = 0x2000;

#[test]
fn test_vmcs_lifecycle() {
    let mut port = InMemoryPort::new().with_msr(MSR_IA32_VMX_BASIC, 0x00d8_1000_0000_0004);
    let basic = port.read::<VmxBasic>().unwrap();
    assert_eq!(basic.revision_id(), 4);

    // Nothing works before VMXON.
    assert_eq!(port.vmptrld(VMCS), Err(VmFail::Invalid));

    port.vmxon(VMXON_REGION).unwrap();
    port.vmclear(VMCS).unwrap();
    port.vmptrld(VMCS).unwrap();
    assert_eq!(port.vmptrst().unwrap(), VMCS);

    port.vmwrite(VmcsField::GuestRip, 0xfff0).unwrap();
    port.vmwrite(VmcsField::HostRsp, 0x8000).unwrap();
    assert_eq!(port.vmread(VmcsField::GuestRip).unwrap(), 0xfff0);

    port.vmlaunch().unwrap();
    assert_eq!(port.vmlaunch(), Err(VmFail::Valid));
    assert_eq!(
        port.vm_instruction_error(),
        VmInstructionError::VmlaunchNonClearVmcs
    );

    // Exit-information fields are read-only.
    assert_eq!(port.vmwrite(VmcsField::ExitReason, 1), Err(VmFail::Valid));
    assert_eq!(
        port.vm_instruction_error(),
        VmInstructionError::VmwriteReadOnlyComponent
    );

    // Clearing the VMCS makes it launchable again.
    port.vmclear(VMCS).unwrap();
    assert_eq!(
        port.vm_instruction_error(),
        VmInstructionError::FailedRetrieval
    );
    port.vmptrld(VMCS).unwrap();
    port.vmlaunch().unwrap();

    port.vmxoff().unwrap();
    assert!(!port.in_vmx_operation());
}

#[test]
fn test_vpid_invalidation() {
    let mut port = InMemoryPort::new();
    port.vmxon(VMXON_REGION).unwrap();

    let descriptor = InvvpidDescriptor::new(1, 0x7000);
    port.invvpid(InvvpidType::IndividualAddress, &descriptor)
        .unwrap();
    // VPID 0 is only accepted for an all-context invalidation.
    let host = InvvpidDescriptor::new(0, 0);
    assert!(port.invvpid(InvvpidType::SingleContext, &host).is_err());
    port.invvpid(InvvpidType::AllContext, &host).unwrap();

    assert_eq!(
        port.invalidations(),
        &[
            Invalidation::Vpid(InvvpidType::IndividualAddress, descriptor),
            Invalidation::Vpid(InvvpidType::AllContext, host),
        ]
    );
}

#[test]
fn test_rflags_outcomes() {
    assert_eq!(vmx_result(0x2), Ok(()));
    assert_eq!(vmx_result(0x3), Err(VmFail::Invalid));
    assert_eq!(vmx_result(0x42), Err(VmFail::Valid));
}

#[test]
fn test_typed_msr_round_trip() {
    let mut port = InMemoryPort::new().with_msr(MSR_IA32_MTRR_DEF_TYPE, 0);
    port.write(MtrrDefType::new(6, true, false)).unwrap();
    assert_eq!(port.read_msr(MSR_IA32_MTRR_DEF_TYPE).unwrap(), 0x806);

    let def_type = port.read::<MtrrDefType>().unwrap();
    assert!(def_type.enabled());
    assert!(!def_type.fixed_enabled());
    assert_eq!(def_type.default_type(), 6);
}

#[test]
fn test_descriptor_tables_from_memory() {
    let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x4000)]).unwrap();
    let mut port = InMemoryPort::new();

    let gdt_base = 0x1000;
    let entries = [
        0,
        gdt_entry(0xa09b, 0, 0xfffff),
        gdt_entry(0xc093, 0, 0xfffff),
    ];
    for (i, entry) in entries.iter().enumerate() {
        mem.write_obj(*entry, GuestAddress(gdt_base + i as u64 * 8))
            .unwrap();
    }
    port.write_table_register(
        DescriptorTableRegister::Gdtr,
        &TableRegister {
            base: gdt_base,
            limit: (entries.len() * 8 - 1) as u16,
        },
    );

    let gdtr = port.read_table_register(DescriptorTableRegister::Gdtr);
    let code = gdt::read_segment_descriptor(
        &mem,
        &gdtr,
        SegmentSelector::new(1, TableIndicator::Gdt, 0),
    )
    .unwrap()
    .unwrap();
    assert!(code.long());
    assert_eq!(code.segment_type(), 0xb);
    assert!(gdt::read_segment_descriptor(
        &mem,
        &gdtr,
        SegmentSelector::new(3, TableIndicator::Gdt, 0)
    )
    .unwrap()
    .is_none());

    let idt_base = 0x2000;
    let gate = GateDescriptor::new(
        0xffff_8000_0012_3456,
        SegmentSelector::new(1, TableIndicator::Gdt, 0),
        SYSTEM_TYPE_INTERRUPT_GATE,
        0,
        1,
    );
    mem.write_obj(gate.low, GuestAddress(idt_base + 14 * 16))
        .unwrap();
    mem.write_obj(gate.high, GuestAddress(idt_base + 14 * 16 + 8))
        .unwrap();
    port.write_table_register(
        DescriptorTableRegister::Idtr,
        &TableRegister {
            base: idt_base,
            limit: 0xfff,
        },
    );

    let idtr = port.read_table_register(DescriptorTableRegister::Idtr);
    let read = gdt::read_gate_descriptor(&mem, &idtr, 14).unwrap().unwrap();
    assert_eq!(read.offset(), 0xffff_8000_0012_3456);
    assert_eq!(read.ist(), 1);
    assert!(read.present());
}
