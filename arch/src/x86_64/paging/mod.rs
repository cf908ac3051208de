// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Software walkers for the paging structures the processor uses to
//! translate linear addresses.
//!
//! Each walker reads the structures through a `GuestMemory` view of physical
//! memory, starting from a CR3 image, and yields `Ok(None)` when the address
//! is not mapped.

pub mod bit32;
pub mod ia32e;
pub mod pae;

use std::result;

use bitflags::bitflags;
use hypervisor::arch::x86::regs::Cr3;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryError};

use crate::x86_64::{PagingMode, PlatformConfig};

#[derive(Debug, Error)]
pub enum Error {
    /// Reading a PML4 entry failed.
    #[error("Reading a PML4 entry failed")]
    ReadPml4e(#[source] GuestMemoryError),
    /// Reading a page-directory-pointer-table entry failed.
    #[error("Reading a page-directory-pointer-table entry failed")]
    ReadPdpte(#[source] GuestMemoryError),
    /// Reading a page-directory entry failed.
    #[error("Reading a page-directory entry failed")]
    ReadPde(#[source] GuestMemoryError),
    /// Reading a page-table entry failed.
    #[error("Reading a page-table entry failed")]
    ReadPte(#[source] GuestMemoryError),
    /// Linear address is not canonical.
    #[error("Linear address {0:#x} is not canonical")]
    NonCanonicalAddress(u64),
    /// Guest-physical address is wider than the translation supports.
    #[error("Address {0:#x} is beyond the translated range")]
    AddressOutOfRange(u64),
    /// EPT pointer requests an unsupported page-walk length.
    #[error("Unsupported page-walk length {0}")]
    UnsupportedWalkLength(u8),
}

pub type Result<T> = result::Result<T, Error>;

bitflags! {
    /// Flags shared by 32-bit, PAE and IA-32e paging-structure entries.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Sizes of the pages a translation can end in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size4M,
    Size1G,
}

impl PageSize {
    pub fn shift(self) -> u32 {
        match self {
            PageSize::Size4K => 12,
            PageSize::Size2M => 21,
            PageSize::Size4M => 22,
            PageSize::Size1G => 30,
        }
    }

    pub fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// Mask selecting the page offset.
    pub fn offset_mask(self) -> u64 {
        self.bytes() - 1
    }
}

pub fn is_page_aligned(address: u64, size: PageSize) -> bool {
    address & size.offset_mask() == 0
}

// Bits 51:12 of a 64-bit entry.
pub(crate) const ADDRESS_MASK_4K: u64 = 0x000f_ffff_ffff_f000;
// Bits 51:21 of a 64-bit entry.
pub(crate) const ADDRESS_MASK_2M: u64 = 0x000f_ffff_ffe0_0000;
// Bits 51:30 of a 64-bit entry.
pub(crate) const ADDRESS_MASK_1G: u64 = 0x000f_ffff_c000_0000;

pub(crate) fn with_address(entry: u64, address: u64, mask: u64) -> u64 {
    (entry & !mask) | (address & mask)
}

pub(crate) fn read_entry<M: GuestMemory + ?Sized>(
    mem: &M,
    table: u64,
    index: u64,
) -> result::Result<u64, GuestMemoryError> {
    mem.read_obj(GuestAddress(table + index * 8))
}

pub(crate) fn read_entry32<M: GuestMemory + ?Sized>(
    mem: &M,
    table: u64,
    index: u64,
) -> result::Result<u32, GuestMemoryError> {
    mem.read_obj(GuestAddress(table + index * 4))
}

// A reference above MAXPHYADDR sets reserved bits in the entry.
pub(crate) fn within_phys_range(config: &PlatformConfig, address: u64) -> bool {
    if address > config.max_phys_address() {
        debug!(
            "Paging-structure entry references {:#x} beyond MAXPHYADDR {}",
            address, config.max_phys_bits
        );
        return false;
    }
    true
}

/// Translates `linear` in `mode`, starting from `cr3`.
///
/// With paging disabled the linear address is the physical address. 32-bit
/// and PAE paging only see the low 32 bits of `linear`.
pub fn translate<M: GuestMemory + ?Sized>(
    mem: &M,
    mode: PagingMode,
    cr3: Cr3,
    linear: u64,
    config: &PlatformConfig,
) -> Result<Option<u64>> {
    match mode {
        PagingMode::Disabled => Ok(Some(linear)),
        PagingMode::Bit32 => {
            bit32::to_physical(mem, cr3, bit32::LinearAddress(linear as u32), config)
        }
        PagingMode::Pae => pae::to_physical(mem, cr3, pae::LinearAddress(linear as u32), config),
        PagingMode::Ia32e => ia32e::to_physical(mem, cr3, ia32e::LinearAddress(linear), config),
    }
}

#[cfg(test)]
mod tests {
    use vm_memory::GuestMemoryMmap;

    use super::*;

    #[test]
    fn page_sizes() {
        assert_eq!(PageSize::Size4K.bytes(), 0x1000);
        assert_eq!(PageSize::Size2M.bytes(), 0x20_0000);
        assert_eq!(PageSize::Size4M.bytes(), 0x40_0000);
        assert_eq!(PageSize::Size1G.bytes(), 0x4000_0000);
        assert!(is_page_aligned(0x60_0000, PageSize::Size2M));
        assert!(!is_page_aligned(0x60_0000, PageSize::Size4M));
    }

    #[test]
    fn address_injection() {
        let flags = (EntryFlags::PRESENT | EntryFlags::NO_EXECUTE).bits();
        let entry = with_address(flags, 0xdead_beef_f123, ADDRESS_MASK_4K);
        assert_eq!(entry & ADDRESS_MASK_4K, 0xdead_beef_f000);
        assert_eq!(entry & !ADDRESS_MASK_4K, flags);

        // Replacing the address keeps the flags.
        let entry = with_address(entry, 0x1000, ADDRESS_MASK_4K);
        assert_eq!(entry, flags | 0x1000);
    }

    #[test]
    fn paging_disabled_is_identity() {
        let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        let config = PlatformConfig::default();
        assert_eq!(
            translate(&mem, PagingMode::Disabled, Cr3(0), 0x1234_5678, &config).unwrap(),
            Some(0x1234_5678)
        );
    }
}
