// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! 4-level IA-32e paging with 4 KiB, 2 MiB and 1 GiB pages.

use hypervisor::arch::x86::regs::Cr3;
use vm_memory::GuestMemory;

use super::{
    read_entry, with_address, within_phys_range, EntryFlags, Error, PageSize, Result,
    ADDRESS_MASK_1G, ADDRESS_MASK_2M, ADDRESS_MASK_4K,
};
use crate::x86_64::PlatformConfig;

const INDEX_MASK: u64 = 0x1ff;

/// A PML4 entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pml4e(pub u64);

impl Pml4e {
    pub fn new(address: u64, flags: EntryFlags) -> Self {
        Pml4e(with_address(flags.bits(), address, ADDRESS_MASK_4K))
    }

    pub fn present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn table_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_table_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }
}

/// A page-directory-pointer-table entry, referencing a page directory or
/// mapping a 1 GiB page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pdpte(pub u64);

impl Pdpte {
    pub fn new_table(address: u64, flags: EntryFlags) -> Self {
        Pdpte(with_address(
            (flags - EntryFlags::PAGE_SIZE).bits(),
            address,
            ADDRESS_MASK_4K,
        ))
    }

    pub fn new_page(address: u64, flags: EntryFlags) -> Self {
        Pdpte(with_address(
            (flags | EntryFlags::PAGE_SIZE).bits(),
            address,
            ADDRESS_MASK_1G,
        ))
    }

    pub fn present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    /// PS: the entry maps a 1 GiB page.
    pub fn huge(&self) -> bool {
        self.flags().contains(EntryFlags::PAGE_SIZE)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn table_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_table_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }

    pub fn page_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_1G
    }

    pub fn set_page_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_1G);
    }
}

/// A page-directory entry, referencing a page table or mapping a 2 MiB page.
///
/// PAE paging uses the same layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pde(pub u64);

impl Pde {
    pub fn new_table(address: u64, flags: EntryFlags) -> Self {
        Pde(with_address(
            (flags - EntryFlags::PAGE_SIZE).bits(),
            address,
            ADDRESS_MASK_4K,
        ))
    }

    pub fn new_page(address: u64, flags: EntryFlags) -> Self {
        Pde(with_address(
            (flags | EntryFlags::PAGE_SIZE).bits(),
            address,
            ADDRESS_MASK_2M,
        ))
    }

    pub fn present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    /// PS: the entry maps a 2 MiB page.
    pub fn large(&self) -> bool {
        self.flags().contains(EntryFlags::PAGE_SIZE)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn table_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_table_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }

    pub fn page_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_2M
    }

    pub fn set_page_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_2M);
    }
}

/// A page-table entry. PAE paging uses the same layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pte(pub u64);

impl Pte {
    pub fn new(address: u64, flags: EntryFlags) -> Self {
        Pte(with_address(flags.bits(), address, ADDRESS_MASK_4K))
    }

    pub fn present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn page_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_page_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }
}

/// A 48-bit linear address split into four 9-bit indices and a page offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinearAddress(pub u64);

impl LinearAddress {
    /// Assembles an address from its fields, sign-extending bit 47.
    pub fn from_parts(pml4: u64, pdpt: u64, directory: u64, table: u64, offset: u64) -> Self {
        let address = ((pml4 & INDEX_MASK) << 39)
            | ((pdpt & INDEX_MASK) << 30)
            | ((directory & INDEX_MASK) << 21)
            | ((table & INDEX_MASK) << 12)
            | (offset & PageSize::Size4K.offset_mask());
        LinearAddress(sign_extend_48(address))
    }

    pub fn pml4_index(&self) -> u64 {
        (self.0 >> 39) & INDEX_MASK
    }

    pub fn pdpt_index(&self) -> u64 {
        (self.0 >> 30) & INDEX_MASK
    }

    pub fn directory_index(&self) -> u64 {
        (self.0 >> 21) & INDEX_MASK
    }

    pub fn table_index(&self) -> u64 {
        (self.0 >> 12) & INDEX_MASK
    }

    pub fn offset(&self, size: PageSize) -> u64 {
        self.0 & size.offset_mask()
    }

    /// Bits 63:48 all equal bit 47.
    pub fn is_canonical(&self) -> bool {
        sign_extend_48(self.0) == self.0
    }
}

fn sign_extend_48(address: u64) -> u64 {
    (((address << 16) as i64) >> 16) as u64
}

// Resolves the page-directory and page-table levels shared by PAE and
// IA-32e paging. `linear` supplies bits 29:0.
pub(super) fn walk_directory<M: GuestMemory + ?Sized>(
    mem: &M,
    directory: u64,
    linear: u64,
    config: &PlatformConfig,
) -> Result<Option<u64>> {
    if !within_phys_range(config, directory) {
        return Ok(None);
    }
    let pde = Pde(
        read_entry(mem, directory, (linear >> 21) & INDEX_MASK).map_err(Error::ReadPde)?,
    );
    if !pde.present() {
        return Ok(None);
    }
    if pde.large() {
        let address = pde.page_address();
        if !within_phys_range(config, address) {
            return Ok(None);
        }
        return Ok(Some(address | (linear & PageSize::Size2M.offset_mask())));
    }

    let table = pde.table_address();
    if !within_phys_range(config, table) {
        return Ok(None);
    }
    let pte = Pte(read_entry(mem, table, (linear >> 12) & INDEX_MASK).map_err(Error::ReadPte)?);
    if !pte.present() {
        return Ok(None);
    }
    let address = pte.page_address();
    if !within_phys_range(config, address) {
        return Ok(None);
    }
    Ok(Some(address | (linear & PageSize::Size4K.offset_mask())))
}

/// Walks the 4-level paging structures rooted at `cr3`.
///
/// Non-canonical addresses are rejected before any structure is read.
pub fn to_physical<M: GuestMemory + ?Sized>(
    mem: &M,
    cr3: Cr3,
    linear: LinearAddress,
    config: &PlatformConfig,
) -> Result<Option<u64>> {
    if !linear.is_canonical() {
        return Err(Error::NonCanonicalAddress(linear.0));
    }

    let pml4 = cr3.table_address();
    if !within_phys_range(config, pml4) {
        return Ok(None);
    }
    let pml4e = Pml4e(read_entry(mem, pml4, linear.pml4_index()).map_err(Error::ReadPml4e)?);
    if !pml4e.present() {
        return Ok(None);
    }

    let pdpt = pml4e.table_address();
    if !within_phys_range(config, pdpt) {
        return Ok(None);
    }
    let pdpte = Pdpte(read_entry(mem, pdpt, linear.pdpt_index()).map_err(Error::ReadPdpte)?);
    if !pdpte.present() {
        return Ok(None);
    }
    if pdpte.huge() {
        if !config.page_1gb {
            debug!("1 GiB mapping at {:#x} without 1 GiB page support", linear.0);
            return Ok(None);
        }
        let address = pdpte.page_address();
        if !within_phys_range(config, address) {
            return Ok(None);
        }
        return Ok(Some(address | linear.offset(PageSize::Size1G)));
    }

    walk_directory(mem, pdpte.table_address(), linear.0, config)
}
