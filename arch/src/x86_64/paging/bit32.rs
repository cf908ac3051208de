// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! 32-bit paging: a page directory of 4-byte entries mapping 4 KiB pages
//! through page tables, or 4 MiB pages directly when CR4.PSE is set.

use hypervisor::arch::x86::regs::Cr3;
use vm_memory::GuestMemory;

use super::{read_entry32, EntryFlags, Error, PageSize, Result};
use crate::x86_64::PlatformConfig;

// CR3 bits 31:12.
const DIRECTORY_ADDRESS_MASK: u64 = 0xffff_f000;

const PRESENT: u32 = 1 << 0;
const PAGE_SIZE: u32 = 1 << 7;
const TABLE_ADDRESS_MASK: u32 = 0xffff_f000;
const PAGE_4M_ADDRESS_MASK: u32 = 0xffc0_0000;
// PDE bits 20:13 hold physical address bits 39:32 of a 4 MiB page.
const PAGE_4M_HIGH_SHIFT: u32 = 13;
const PAGE_4M_HIGH_MASK: u32 = 0xff << PAGE_4M_HIGH_SHIFT;

// Physical bits above 31 a 4 MiB PDE can supply under `config`.
fn pse36_high_mask(config: &PlatformConfig) -> u64 {
    if !config.pse36 {
        return 0;
    }
    let bits = config.phys_bits().saturating_sub(32).min(8);
    (1u64 << bits) - 1
}

/// A page-directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pde(pub u32);

impl Pde {
    /// An entry referencing a page table.
    pub fn new_table(address: u64, flags: EntryFlags) -> Self {
        let mut pde = Pde((flags.bits() as u32) & !PAGE_SIZE);
        pde.set_table_address(address);
        pde
    }

    /// An entry mapping a 4 MiB page.
    pub fn new_page(address: u64, flags: EntryFlags, config: &PlatformConfig) -> Self {
        let mut pde = Pde((flags.bits() as u32) | PAGE_SIZE);
        pde.set_page_address(address, config);
        pde
    }

    pub fn present(&self) -> bool {
        self.0 & PRESENT != 0
    }

    /// PS: maps a 4 MiB page when CR4.PSE is set.
    pub fn large(&self) -> bool {
        self.0 & PAGE_SIZE != 0
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(u64::from(self.0))
    }

    pub fn table_address(&self) -> u64 {
        u64::from(self.0 & TABLE_ADDRESS_MASK)
    }

    pub fn set_table_address(&mut self, address: u64) {
        self.0 = (self.0 & !TABLE_ADDRESS_MASK) | (address as u32 & TABLE_ADDRESS_MASK);
    }

    /// Physical address of the 4 MiB page, including the PSE-36 bits the
    /// processor honours.
    pub fn page_address(&self, config: &PlatformConfig) -> u64 {
        let low = u64::from(self.0 & PAGE_4M_ADDRESS_MASK);
        let high = u64::from((self.0 & PAGE_4M_HIGH_MASK) >> PAGE_4M_HIGH_SHIFT);
        low | ((high & pse36_high_mask(config)) << 32)
    }

    pub fn set_page_address(&mut self, address: u64, config: &PlatformConfig) {
        let low = address as u32 & PAGE_4M_ADDRESS_MASK;
        let high = ((address >> 32) & pse36_high_mask(config)) as u32;
        self.0 = (self.0 & !(PAGE_4M_ADDRESS_MASK | PAGE_4M_HIGH_MASK))
            | low
            | (high << PAGE_4M_HIGH_SHIFT);
    }
}

/// A page-table entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pte(pub u32);

impl Pte {
    pub fn new(address: u64, flags: EntryFlags) -> Self {
        let mut pte = Pte(flags.bits() as u32);
        pte.set_page_address(address);
        pte
    }

    pub fn present(&self) -> bool {
        self.0 & PRESENT != 0
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(u64::from(self.0))
    }

    pub fn page_address(&self) -> u64 {
        u64::from(self.0 & TABLE_ADDRESS_MASK)
    }

    pub fn set_page_address(&mut self, address: u64) {
        self.0 = (self.0 & !TABLE_ADDRESS_MASK) | (address as u32 & TABLE_ADDRESS_MASK);
    }
}

/// A 32-bit linear address split into directory, table and offset fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinearAddress(pub u32);

impl LinearAddress {
    pub fn from_parts_4k(directory: u32, table: u32, offset: u32) -> Self {
        LinearAddress(((directory & 0x3ff) << 22) | ((table & 0x3ff) << 12) | (offset & 0xfff))
    }

    pub fn from_parts_4m(directory: u32, offset: u32) -> Self {
        LinearAddress(((directory & 0x3ff) << 22) | (offset & 0x3f_ffff))
    }

    pub fn directory_index(&self) -> u64 {
        u64::from(self.0 >> 22)
    }

    pub fn table_index(&self) -> u64 {
        u64::from((self.0 >> 12) & 0x3ff)
    }

    pub fn offset(&self, size: PageSize) -> u64 {
        u64::from(self.0) & size.offset_mask()
    }
}

/// Walks the 32-bit paging structures rooted at `cr3`.
pub fn to_physical<M: GuestMemory + ?Sized>(
    mem: &M,
    cr3: Cr3,
    linear: LinearAddress,
    config: &PlatformConfig,
) -> Result<Option<u64>> {
    let directory = cr3.table_address() & DIRECTORY_ADDRESS_MASK;
    let pde = Pde(
        read_entry32(mem, directory, linear.directory_index()).map_err(Error::ReadPde)?,
    );
    if !pde.present() {
        return Ok(None);
    }
    if config.pse && pde.large() {
        return Ok(Some(
            pde.page_address(config) | linear.offset(PageSize::Size4M),
        ));
    }

    let pte = Pte(read_entry32(mem, pde.table_address(), linear.table_index())
        .map_err(Error::ReadPte)?);
    if !pte.present() {
        return Ok(None);
    }
    Ok(Some(pte.page_address() | linear.offset(PageSize::Size4K)))
}
