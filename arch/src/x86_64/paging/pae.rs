// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! PAE paging: four PDPTE registers loaded from CR3, then 64-bit page
//! directories and page tables mapping 2 MiB or 4 KiB pages.

use hypervisor::arch::x86::regs::Cr3;
use vm_memory::GuestMemory;

pub use super::ia32e::{Pde, Pte};
use super::{
    ia32e, read_entry, with_address, within_phys_range, EntryFlags, Error, PageSize, Result,
    ADDRESS_MASK_4K,
};
use crate::x86_64::PlatformConfig;

pub const PDPTE_COUNT: usize = 4;

/// A PDPTE register image. Only PRESENT, PWT and PCD are defined flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pdpte(pub u64);

impl Pdpte {
    pub fn new(address: u64, flags: EntryFlags) -> Self {
        let defined =
            EntryFlags::PRESENT | EntryFlags::WRITE_THROUGH | EntryFlags::CACHE_DISABLE;
        let flags = flags & defined;
        Pdpte(with_address(flags.bits(), address, ADDRESS_MASK_4K))
    }

    pub fn present(&self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub fn table_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_table_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }
}

/// A 32-bit linear address split into PDPT, directory and table indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinearAddress(pub u32);

impl LinearAddress {
    pub fn from_parts(pdpt: u32, directory: u32, table: u32, offset: u32) -> Self {
        LinearAddress(
            ((pdpt & 0x3) << 30)
                | ((directory & 0x1ff) << 21)
                | ((table & 0x1ff) << 12)
                | (offset & 0xfff),
        )
    }

    pub fn pdpt_index(&self) -> usize {
        (self.0 >> 30) as usize
    }

    pub fn directory_index(&self) -> u64 {
        u64::from((self.0 >> 21) & 0x1ff)
    }

    pub fn table_index(&self) -> u64 {
        u64::from((self.0 >> 12) & 0x1ff)
    }

    pub fn offset(&self, size: PageSize) -> u64 {
        u64::from(self.0) & size.offset_mask()
    }
}

/// Reads the four PDPTEs the processor loads when CR3 is written in PAE
/// mode.
pub fn load_pdptes<M: GuestMemory + ?Sized>(mem: &M, cr3: Cr3) -> Result<[Pdpte; PDPTE_COUNT]> {
    let table = cr3.pae_table_address();
    let mut pdptes = [Pdpte::default(); PDPTE_COUNT];
    for (index, pdpte) in pdptes.iter_mut().enumerate() {
        *pdpte = Pdpte(read_entry(mem, table, index as u64).map_err(Error::ReadPdpte)?);
    }
    Ok(pdptes)
}

/// Translates `linear` using an already loaded set of PDPTEs.
pub fn to_physical_with_pdptes<M: GuestMemory + ?Sized>(
    mem: &M,
    pdptes: &[Pdpte; PDPTE_COUNT],
    linear: LinearAddress,
    config: &PlatformConfig,
) -> Result<Option<u64>> {
    let pdpte = pdptes[linear.pdpt_index()];
    if !pdpte.present() {
        return Ok(None);
    }
    ia32e::walk_directory(mem, pdpte.table_address(), u64::from(linear.0), config)
}

/// Loads the PDPTEs from `cr3` and walks the structures they reference.
pub fn to_physical<M: GuestMemory + ?Sized>(
    mem: &M,
    cr3: Cr3,
    linear: LinearAddress,
    config: &PlatformConfig,
) -> Result<Option<u64>> {
    if !within_phys_range(config, cr3.pae_table_address()) {
        return Ok(None);
    }
    let pdptes = load_pdptes(mem, cr3)?;
    to_physical_with_pdptes(mem, &pdptes, linear, config)
}
