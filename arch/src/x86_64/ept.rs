// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Extended page tables: guest-physical to host-physical translation.
//!
//! The walker only reads the structures. After changing any entry a caller
//! must flush cached translations with INVEPT (and INVVPID where VPIDs are
//! in use), for instance through [`invalidate_context`].

use bitflags::bitflags;
use hypervisor::arch::x86::vmx::{InveptDescriptor, InveptType, VmxResult};
use hypervisor::RegisterPort;
use vm_memory::GuestMemory;

use crate::x86_64::mtrr::MemoryType;
use crate::x86_64::paging::{
    read_entry, with_address, within_phys_range, Error, PageSize, Result, ADDRESS_MASK_1G,
    ADDRESS_MASK_2M, ADDRESS_MASK_4K,
};
use crate::x86_64::PlatformConfig;

/// The only page-walk length a 4-level EPT supports.
pub const EPT_WALK_LENGTH: u8 = 4;

/// Guest-physical addresses a 4-level EPT translates are below 2^48.
pub const EPT_ADDRESS_BITS: u32 = 48;

const INDEX_MASK: u64 = 0x1ff;
const LARGE: u64 = 1 << 7;
const MEMORY_TYPE_SHIFT: u64 = 3;
const MEMORY_TYPE_MASK: u64 = 0x7 << MEMORY_TYPE_SHIFT;
const IGNORE_PAT: u64 = 1 << 6;

bitflags! {
    /// Access rights of an EPT entry. An entry granting none is not present.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EptPermissions: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const ACCESSED = 1 << 8;
        const DIRTY = 1 << 9;
        const USER_EXECUTE = 1 << 10;
        const SUPPRESS_VE = 1 << 63;
    }
}

impl EptPermissions {
    pub fn all_access() -> Self {
        EptPermissions::READ | EptPermissions::WRITE | EptPermissions::EXECUTE
    }
}

fn present(entry: u64) -> bool {
    EptPermissions::from_bits_truncate(entry).intersects(EptPermissions::all_access())
}

fn leaf_memory_type(entry: u64) -> Option<MemoryType> {
    MemoryType::from_raw(((entry & MEMORY_TYPE_MASK) >> MEMORY_TYPE_SHIFT) as u8)
}

fn leaf_bits(memory_type: MemoryType) -> u64 {
    u64::from(memory_type.raw()) << MEMORY_TYPE_SHIFT
}

/// The EPT pointer VMCS field (EPTP).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EptPointer(pub u64);

impl EptPointer {
    const MEMORY_TYPE_MASK: u64 = 0x7;
    const WALK_LENGTH_SHIFT: u64 = 3;
    const WALK_LENGTH_MASK: u64 = 0x7 << Self::WALK_LENGTH_SHIFT;
    const ACCESS_DIRTY: u64 = 1 << 6;

    /// A 4-level EPT pointer to the PML4 table at `address`.
    pub fn new(address: u64, memory_type: MemoryType, access_dirty: bool) -> Self {
        let mut raw = u64::from(memory_type.raw())
            | (u64::from(EPT_WALK_LENGTH - 1) << Self::WALK_LENGTH_SHIFT);
        if access_dirty {
            raw |= Self::ACCESS_DIRTY;
        }
        EptPointer(with_address(raw, address, ADDRESS_MASK_4K))
    }

    /// Memory type used to access the EPT structures.
    pub fn memory_type(&self) -> Option<MemoryType> {
        MemoryType::from_raw((self.0 & Self::MEMORY_TYPE_MASK) as u8)
    }

    /// Number of levels in the walk.
    pub fn walk_length(&self) -> u8 {
        ((self.0 & Self::WALK_LENGTH_MASK) >> Self::WALK_LENGTH_SHIFT) as u8 + 1
    }

    pub fn access_dirty_enabled(&self) -> bool {
        self.0 & Self::ACCESS_DIRTY != 0
    }

    pub fn address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }

    pub fn invept_descriptor(&self) -> InveptDescriptor {
        InveptDescriptor::new(self.0)
    }
}

/// An EPT PML4 entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pml4e(pub u64);

impl Pml4e {
    pub fn new(address: u64, permissions: EptPermissions) -> Self {
        Pml4e(with_address(permissions.bits(), address, ADDRESS_MASK_4K))
    }

    pub fn present(&self) -> bool {
        present(self.0)
    }

    pub fn permissions(&self) -> EptPermissions {
        EptPermissions::from_bits_truncate(self.0)
    }

    pub fn table_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_table_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }
}

/// An EPT PDPTE, referencing a page directory or mapping a 1 GiB page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pdpte(pub u64);

impl Pdpte {
    pub fn new_table(address: u64, permissions: EptPermissions) -> Self {
        Pdpte(with_address(permissions.bits(), address, ADDRESS_MASK_4K))
    }

    pub fn new_page(address: u64, permissions: EptPermissions, memory_type: MemoryType) -> Self {
        let raw = permissions.bits() | LARGE | leaf_bits(memory_type);
        Pdpte(with_address(raw, address, ADDRESS_MASK_1G))
    }

    pub fn present(&self) -> bool {
        present(self.0)
    }

    pub fn huge(&self) -> bool {
        self.0 & LARGE != 0
    }

    pub fn permissions(&self) -> EptPermissions {
        EptPermissions::from_bits_truncate(self.0)
    }

    /// Memory type of a 1 GiB mapping.
    pub fn memory_type(&self) -> Option<MemoryType> {
        leaf_memory_type(self.0)
    }

    pub fn table_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn page_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_1G
    }

    pub fn set_page_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_1G);
    }
}

/// An EPT PDE, referencing a page table or mapping a 2 MiB page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pde(pub u64);

impl Pde {
    pub fn new_table(address: u64, permissions: EptPermissions) -> Self {
        Pde(with_address(permissions.bits(), address, ADDRESS_MASK_4K))
    }

    pub fn new_page(address: u64, permissions: EptPermissions, memory_type: MemoryType) -> Self {
        let raw = permissions.bits() | LARGE | leaf_bits(memory_type);
        Pde(with_address(raw, address, ADDRESS_MASK_2M))
    }

    pub fn present(&self) -> bool {
        present(self.0)
    }

    pub fn large(&self) -> bool {
        self.0 & LARGE != 0
    }

    pub fn permissions(&self) -> EptPermissions {
        EptPermissions::from_bits_truncate(self.0)
    }

    pub fn memory_type(&self) -> Option<MemoryType> {
        leaf_memory_type(self.0)
    }

    pub fn table_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn page_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_2M
    }

    pub fn set_page_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_2M);
    }
}

/// An EPT PTE mapping a 4 KiB page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pte(pub u64);

impl Pte {
    pub fn new(address: u64, permissions: EptPermissions, memory_type: MemoryType) -> Self {
        let raw = permissions.bits() | leaf_bits(memory_type);
        Pte(with_address(raw, address, ADDRESS_MASK_4K))
    }

    pub fn present(&self) -> bool {
        present(self.0)
    }

    pub fn permissions(&self) -> EptPermissions {
        EptPermissions::from_bits_truncate(self.0)
    }

    pub fn memory_type(&self) -> Option<MemoryType> {
        leaf_memory_type(self.0)
    }

    pub fn ignore_pat(&self) -> bool {
        self.0 & IGNORE_PAT != 0
    }

    pub fn page_address(&self) -> u64 {
        self.0 & ADDRESS_MASK_4K
    }

    pub fn set_page_address(&mut self, address: u64) {
        self.0 = with_address(self.0, address, ADDRESS_MASK_4K);
    }
}

/// A guest-physical address split into 9-bit indices and a page offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestPhysicalAddress(pub u64);

impl GuestPhysicalAddress {
    pub fn from_parts(pml4: u64, pdpt: u64, directory: u64, table: u64, offset: u64) -> Self {
        GuestPhysicalAddress(
            ((pml4 & INDEX_MASK) << 39)
                | ((pdpt & INDEX_MASK) << 30)
                | ((directory & INDEX_MASK) << 21)
                | ((table & INDEX_MASK) << 12)
                | (offset & PageSize::Size4K.offset_mask()),
        )
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
}

/// Translates `address` through the EPT hierarchy `eptp` points at.
pub fn to_physical<M: GuestMemory + ?Sized>(
    mem: &M,
    eptp: EptPointer,
    address: GuestPhysicalAddress,
    config: &PlatformConfig,
) -> Result<Option<u64>> {
    if eptp.walk_length() != EPT_WALK_LENGTH {
        return Err(Error::UnsupportedWalkLength(eptp.walk_length()));
    }
    if address.0 >> EPT_ADDRESS_BITS != 0 {
        return Err(Error::AddressOutOfRange(address.0));
    }

    let pml4 = eptp.address();
    if !within_phys_range(config, pml4) {
        return Ok(None);
    }
    let pml4e = Pml4e(read_entry(mem, pml4, address.pml4_index()).map_err(Error::ReadPml4e)?);
    if !pml4e.present() {
        return Ok(None);
    }

    let pdpt = pml4e.table_address();
    if !within_phys_range(config, pdpt) {
        return Ok(None);
    }
    let pdpte = Pdpte(read_entry(mem, pdpt, address.pdpt_index()).map_err(Error::ReadPdpte)?);
    if !pdpte.present() {
        return Ok(None);
    }
    if pdpte.huge() {
        if !config.ept_1gb {
            debug!("EPT 1 GiB mapping at {:#x} without 1 GiB page support", address.0);
            return Ok(None);
        }
        let page = pdpte.page_address();
        if !within_phys_range(config, page) {
            return Ok(None);
        }
        return Ok(Some(page | address.offset(PageSize::Size1G)));
    }

    let directory = pdpte.table_address();
    if !within_phys_range(config, directory) {
        return Ok(None);
    }
    let pde = Pde(read_entry(mem, directory, address.directory_index()).map_err(Error::ReadPde)?);
    if !pde.present() {
        return Ok(None);
    }
    if pde.large() {
        let page = pde.page_address();
        if !within_phys_range(config, page) {
            return Ok(None);
        }
        return Ok(Some(page | address.offset(PageSize::Size2M)));
    }

    let table = pde.table_address();
    if !within_phys_range(config, table) {
        return Ok(None);
    }
    let pte = Pte(read_entry(mem, table, address.table_index()).map_err(Error::ReadPte)?);
    if !pte.present() {
        return Ok(None);
    }
    let page = pte.page_address();
    if !within_phys_range(config, page) {
        return Ok(None);
    }
    Ok(Some(page | address.offset(PageSize::Size4K)))
}

/// Flushes the translations derived from `eptp` with a single-context
/// INVEPT.
pub fn invalidate_context<P: RegisterPort>(port: &mut P, eptp: EptPointer) -> VmxResult<()> {
    port.invept(InveptType::SingleContext, &eptp.invept_descriptor())
}
