//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::num::NonZeroUsize;

use bitflags::bitflags;

// EFER (technically not a register) bits
pub const EFER_SCE: u64 = 0x1;
pub const EFER_LME: u64 = 0x100;
pub const EFER_LMA: u64 = 0x400;
pub const EFER_NXE: u64 = 0x800;

// CR0 bits
pub const CR0_PE: u64 = 0x1;
pub const CR0_NE: u64 = 0x20;
pub const CR0_WP: u64 = 0x10000;
pub const CR0_PG: u64 = 0x80000000;

// CR4 bits
pub const CR4_PSE: u64 = 0x10;
pub const CR4_PAE: u64 = 0x20;
pub const CR4_LA57: u64 = 0x1000;
pub const CR4_VMXE: u64 = 0x2000;

// RFlags bits
pub const CF_SHIFT: usize = 0;
pub const PF_SHIFT: usize = 2;
pub const AF_SHIFT: usize = 4;
pub const ZF_SHIFT: usize = 6;
pub const SF_SHIFT: usize = 7;
pub const DF_SHIFT: usize = 10;
pub const OF_SHIFT: usize = 11;

pub const CF: u64 = 1 << CF_SHIFT;
pub const PF: u64 = 1 << PF_SHIFT;
pub const AF: u64 = 1 << AF_SHIFT;
pub const ZF: u64 = 1 << ZF_SHIFT;
pub const SF: u64 = 1 << SF_SHIFT;
pub const DF: u64 = 1 << DF_SHIFT;
pub const OF: u64 = 1 << OF_SHIFT;

bitflags! {
    /// CR0 control bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Cr0: u64 {
        const PROTECTION_ENABLE = CR0_PE;
        const MONITOR_COPROCESSOR = 1 << 1;
        const EMULATE_FPU = 1 << 2;
        const TASK_SWITCHED = 1 << 3;
        const EXTENSION_TYPE = 1 << 4;
        const NUMERIC_ERROR = CR0_NE;
        const WRITE_PROTECT = CR0_WP;
        const ALIGNMENT_MASK = 1 << 18;
        const NOT_WRITE_THROUGH = 1 << 29;
        const CACHE_DISABLE = 1 << 30;
        const PAGING = CR0_PG;
    }
}

bitflags! {
    /// CR4 control bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Cr4: u64 {
        const VIRTUAL_8086_EXTENSIONS = 1 << 0;
        const PROTECTED_MODE_VIRTUAL_INTERRUPTS = 1 << 1;
        const TIMESTAMP_DISABLE = 1 << 2;
        const DEBUGGING_EXTENSIONS = 1 << 3;
        const PAGE_SIZE_EXTENSION = CR4_PSE;
        const PHYSICAL_ADDRESS_EXTENSION = CR4_PAE;
        const MACHINE_CHECK = 1 << 6;
        const PAGE_GLOBAL = 1 << 7;
        const PERFORMANCE_COUNTER = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const USER_MODE_INSTRUCTION_PREVENTION = 1 << 11;
        const LA57 = CR4_LA57;
        const VMX_ENABLE = CR4_VMXE;
        const SMX_ENABLE = 1 << 14;
        const FSGSBASE = 1 << 16;
        const PCID = 1 << 17;
        const OSXSAVE = 1 << 18;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
        const PROTECTION_KEYS = 1 << 22;
    }
}

bitflags! {
    /// IA32_EFER bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Efer: u64 {
        const SYSCALL_ENABLE = EFER_SCE;
        const LONG_MODE_ENABLE = EFER_LME;
        const LONG_MODE_ACTIVE = EFER_LMA;
        const NO_EXECUTE_ENABLE = EFER_NXE;
    }
}

bitflags! {
    /// RFLAGS bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RFlags: u64 {
        const CARRY = CF;
        const PARITY = PF;
        const AUXILIARY_CARRY = AF;
        const ZERO = ZF;
        const SIGN = SF;
        const TRAP = 1 << 8;
        const INTERRUPT_ENABLE = 1 << 9;
        const DIRECTION = DF;
        const OVERFLOW = OF;
        const IOPL_LOW = 1 << 12;
        const IOPL_HIGH = 1 << 13;
        const NESTED_TASK = 1 << 14;
        const RESUME = 1 << 16;
        const VIRTUAL_8086 = 1 << 17;
        const ALIGNMENT_CHECK = 1 << 18;
        const VIRTUAL_INTERRUPT = 1 << 19;
        const VIRTUAL_INTERRUPT_PENDING = 1 << 20;
        const ID = 1 << 21;
    }
}

/// A CR3 image, decoupled from the live register so that page-table walks can
/// be driven from synthetic values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cr3(pub u64);

impl Cr3 {
    const PWT: u64 = 1 << 3;
    const PCD: u64 = 1 << 4;

    /// Builds a CR3 image pointing at a 4 KiB aligned paging structure.
    pub fn from_table_address(address: u64) -> Self {
        Cr3(address & !0xfff)
    }

    /// Physical address of the top-level paging structure in 32-bit and
    /// IA-32e paging (bits 51:12).
    pub fn table_address(&self) -> u64 {
        self.0 & 0x000f_ffff_ffff_f000
    }

    /// Physical address of the page-directory-pointer table in PAE paging
    /// (bits 31:5).
    pub fn pae_table_address(&self) -> u64 {
        self.0 & 0xffff_ffe0
    }

    pub fn page_write_through(&self) -> bool {
        self.0 & Self::PWT != 0
    }

    pub fn page_cache_disable(&self) -> bool {
        self.0 & Self::PCD != 0
    }
}

/// Control registers reachable through `mov crN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlRegister {
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Cr8,
}

/// Segment registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentRegister {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

/// Descriptor-table registers loaded with `lgdt`/`lidt`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorTableRegister {
    Gdtr,
    Idtr,
}

/// The pseudo-descriptor stored by `sgdt`/`sidt`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableRegister {
    pub limit: u16,
    pub base: u64,
}

impl TableRegister {
    /// Number of `entry_size` byte entries the limit covers.
    pub fn entry_count(&self, entry_size: NonZeroUsize) -> usize {
        (usize::from(self.limit) + 1) / entry_size.get()
    }
}

/// Which descriptor table a selector indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableIndicator {
    Gdt,
    Ldt,
}

/// A 16-bit segment selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SegmentSelector(pub u16);

impl SegmentSelector {
    pub fn new(index: u16, table: TableIndicator, rpl: u8) -> Self {
        let ti = match table {
            TableIndicator::Gdt => 0,
            TableIndicator::Ldt => 1 << 2,
        };
        SegmentSelector((index << 3) | ti | (rpl as u16 & 0x3))
    }

    pub fn rpl(&self) -> u8 {
        (self.0 & 0x3) as u8
    }

    pub fn table(&self) -> TableIndicator {
        if self.0 & (1 << 2) == 0 {
            TableIndicator::Gdt
        } else {
            TableIndicator::Ldt
        }
    }

    pub fn index(&self) -> u16 {
        self.0 >> 3
    }
}
