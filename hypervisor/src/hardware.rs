// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::arch::asm;
use std::arch::x86_64::__cpuid_count;

use crate::arch::x86::cpuid::CpuidResult;
use crate::arch::x86::regs::{
    ControlRegister, DescriptorTableRegister, SegmentRegister, SegmentSelector, TableRegister,
};
use crate::arch::x86::vmx::{
    vmx_result, InveptDescriptor, InveptType, InvvpidDescriptor, InvvpidType, VmcsField,
    VmxResult,
};
use crate::port::{RegisterPort, Result};

#[repr(C, packed)]
#[derive(Default)]
struct DescriptorTablePointer {
    limit: u16,
    base: u64,
}

/// Register port backed by the logical processor executing the code.
#[derive(Debug)]
pub struct HardwarePort {
    _private: (),
}

impl HardwarePort {
    /// # Safety
    ///
    /// The caller must run at CPL 0 on the processor whose registers are
    /// accessed, and every physical address passed to a VMX instruction must
    /// reference memory reserved for that purpose.
    pub unsafe fn new() -> Self {
        HardwarePort { _private: () }
    }
}

impl RegisterPort for HardwarePort {
    fn read_msr(&self, index: u32) -> Result<u64> {
        let (high, low): (u32, u32);
        // SAFETY: CPL 0 is guaranteed by the constructor contract.
        unsafe {
            asm!(
                "rdmsr",
                in("ecx") index,
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags)
            );
        }
        Ok((u64::from(high) << 32) | u64::from(low))
    }

    fn write_msr(&mut self, index: u32, value: u64) -> Result<()> {
        let low = value as u32;
        let high = (value >> 32) as u32;
        // SAFETY: CPL 0 is guaranteed by the constructor contract.
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") index,
                in("eax") low,
                in("edx") high,
                options(nostack, preserves_flags)
            );
        }
        Ok(())
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        // SAFETY: cpuid is available on every x86-64 processor.
        let result = unsafe { __cpuid_count(leaf, subleaf) };
        CpuidResult::new(result.eax, result.ebx, result.ecx, result.edx)
    }

    fn read_control_register(&self, register: ControlRegister) -> u64 {
        let value: u64;
        // SAFETY: reading a control register has no side effects.
        unsafe {
            match register {
                ControlRegister::Cr0 => {
                    asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags))
                }
                ControlRegister::Cr2 => {
                    asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags))
                }
                ControlRegister::Cr3 => {
                    asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags))
                }
                ControlRegister::Cr4 => {
                    asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags))
                }
                ControlRegister::Cr8 => {
                    asm!("mov {}, cr8", out(reg) value, options(nomem, nostack, preserves_flags))
                }
            }
        }
        value
    }

    fn write_control_register(&mut self, register: ControlRegister, value: u64) {
        // SAFETY: CPL 0 is guaranteed by the constructor contract.
        unsafe {
            match register {
                ControlRegister::Cr0 => asm!("mov cr0, {}", in(reg) value, options(nostack)),
                ControlRegister::Cr2 => asm!("mov cr2, {}", in(reg) value, options(nostack)),
                ControlRegister::Cr3 => asm!("mov cr3, {}", in(reg) value, options(nostack)),
                ControlRegister::Cr4 => asm!("mov cr4, {}", in(reg) value, options(nostack)),
                ControlRegister::Cr8 => asm!("mov cr8, {}", in(reg) value, options(nostack)),
            }
        }
    }

    fn read_rflags(&self) -> u64 {
        let rflags: u64;
        // SAFETY: pushfq/pop only touch the stack slot they allocate.
        unsafe {
            asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        rflags
    }

    fn read_segment_selector(&self, register: SegmentRegister) -> SegmentSelector {
        let value: u16;
        // SAFETY: reading a selector has no side effects.
        unsafe {
            match register {
                SegmentRegister::Es => asm!(
                    "mov {0:x}, es",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
                SegmentRegister::Cs => asm!(
                    "mov {0:x}, cs",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
                SegmentRegister::Ss => asm!(
                    "mov {0:x}, ss",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
                SegmentRegister::Ds => asm!(
                    "mov {0:x}, ds",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
                SegmentRegister::Fs => asm!(
                    "mov {0:x}, fs",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
                SegmentRegister::Gs => asm!(
                    "mov {0:x}, gs",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
                SegmentRegister::Ldtr => asm!(
                    "sldt {0:x}",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
                SegmentRegister::Tr => asm!(
                    "str {0:x}",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                ),
            }
        }
        SegmentSelector(value)
    }

    fn read_table_register(&self, register: DescriptorTableRegister) -> TableRegister {
        let mut pointer = DescriptorTablePointer::default();
        // SAFETY: the store targets a local of the architected size.
        unsafe {
            match register {
                DescriptorTableRegister::Gdtr => asm!(
                    "sgdt [{}]",
                    in(reg) &mut pointer as *mut DescriptorTablePointer,
                    options(nostack, preserves_flags)
                ),
                DescriptorTableRegister::Idtr => asm!(
                    "sidt [{}]",
                    in(reg) &mut pointer as *mut DescriptorTablePointer,
                    options(nostack, preserves_flags)
                ),
            }
        }
        TableRegister {
            limit: pointer.limit,
            base: pointer.base,
        }
    }

    fn write_table_register(&mut self, register: DescriptorTableRegister, value: &TableRegister) {
        let pointer = DescriptorTablePointer {
            limit: value.limit,
            base: value.base,
        };
        // SAFETY: CPL 0 is guaranteed by the constructor contract.
        unsafe {
            match register {
                DescriptorTableRegister::Gdtr => asm!(
                    "lgdt [{}]",
                    in(reg) &pointer as *const DescriptorTablePointer,
                    options(readonly, nostack, preserves_flags)
                ),
                DescriptorTableRegister::Idtr => asm!(
                    "lidt [{}]",
                    in(reg) &pointer as *const DescriptorTablePointer,
                    options(readonly, nostack, preserves_flags)
                ),
            }
        }
    }

    fn vmxon(&mut self, region: u64) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: the region is reserved by the constructor contract.
        unsafe {
            asm!(
                "vmxon [{region}]",
                "pushfq",
                "pop {rflags}",
                region = in(reg) &region as *const u64,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags)
    }

    fn vmxoff(&mut self) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: CPL 0 is guaranteed by the constructor contract.
        unsafe {
            asm!("vmxoff", "pushfq", "pop {}", out(reg) rflags);
        }
        vmx_result(rflags)
    }

    fn vmclear(&mut self, vmcs: u64) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: the VMCS region is reserved by the constructor contract.
        unsafe {
            asm!(
                "vmclear [{vmcs}]",
                "pushfq",
                "pop {rflags}",
                vmcs = in(reg) &vmcs as *const u64,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags)
    }

    fn vmptrld(&mut self, vmcs: u64) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: the VMCS region is reserved by the constructor contract.
        unsafe {
            asm!(
                "vmptrld [{vmcs}]",
                "pushfq",
                "pop {rflags}",
                vmcs = in(reg) &vmcs as *const u64,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags)
    }

    fn vmptrst(&self) -> VmxResult<u64> {
        let mut vmcs: u64 = 0;
        let rflags: u64;
        // SAFETY: the store targets a local quadword.
        unsafe {
            asm!(
                "vmptrst [{vmcs}]",
                "pushfq",
                "pop {rflags}",
                vmcs = in(reg) &mut vmcs as *mut u64,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags).map(|()| vmcs)
    }

    fn vmread(&self, field: VmcsField) -> VmxResult<u64> {
        let value: u64;
        let rflags: u64;
        // SAFETY: vmread only reads the current VMCS.
        unsafe {
            asm!(
                "vmread {value}, {field}",
                "pushfq",
                "pop {rflags}",
                field = in(reg) u64::from(field.encoding()),
                value = out(reg) value,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags).map(|()| value)
    }

    fn vmwrite(&mut self, field: VmcsField, value: u64) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: vmwrite only modifies the current VMCS.
        unsafe {
            asm!(
                "vmwrite {field}, {value}",
                "pushfq",
                "pop {rflags}",
                field = in(reg) u64::from(field.encoding()),
                value = in(reg) value,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags)
    }

    fn vmlaunch(&mut self) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: on success control transfers to the guest and returns
        // through the host state held in the current VMCS.
        unsafe {
            asm!("vmlaunch", "pushfq", "pop {}", out(reg) rflags);
        }
        vmx_result(rflags)
    }

    fn invept(&mut self, kind: InveptType, descriptor: &InveptDescriptor) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: the descriptor is a 128-bit value in local memory.
        unsafe {
            asm!(
                "invept {kind}, [{descriptor}]",
                "pushfq",
                "pop {rflags}",
                kind = in(reg) kind as u64,
                descriptor = in(reg) descriptor as *const InveptDescriptor,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags)
    }

    fn invvpid(&mut self, kind: InvvpidType, descriptor: &InvvpidDescriptor) -> VmxResult<()> {
        let rflags: u64;
        // SAFETY: the descriptor is a 128-bit value in local memory.
        unsafe {
            asm!(
                "invvpid {kind}, [{descriptor}]",
                "pushfq",
                "pop {rflags}",
                kind = in(reg) kind as u64,
                descriptor = in(reg) descriptor as *const InvvpidDescriptor,
                rflags = out(reg) rflags,
            );
        }
        vmx_result(rflags)
    }
}
