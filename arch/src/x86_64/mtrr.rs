// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Memory type range registers.
//!
//! `MtrrCache` snapshots the fixed and variable MTRRs once and answers
//! memory-type queries for 4 KiB pages, 2 MiB pages and arbitrary ranges
//! without touching the hardware again.

use std::result;

use hypervisor::arch::x86::msr_index::{
    mtrr_physbase, mtrr_physmask, MtrrCap, MtrrDefType, MSR_IA32_MTRR_FIX16K_80000,
    MSR_IA32_MTRR_FIX16K_A0000, MSR_IA32_MTRR_FIX4K_C0000, MSR_IA32_MTRR_FIX4K_C8000,
    MSR_IA32_MTRR_FIX4K_D0000, MSR_IA32_MTRR_FIX4K_D8000, MSR_IA32_MTRR_FIX4K_E0000,
    MSR_IA32_MTRR_FIX4K_E8000, MSR_IA32_MTRR_FIX4K_F0000, MSR_IA32_MTRR_FIX4K_F8000,
    MSR_IA32_MTRR_FIX64K_00000, MSR_IA32_MTRR_DEF_TYPE,
};
use hypervisor::RegisterPort;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Reading an MTRR MSR failed.
    #[error("Reading an MTRR MSR failed")]
    ReadMsr(#[source] hypervisor::PortError),
    /// An MTRR MSR holds a reserved memory type encoding.
    #[error("MSR {index:#x} holds reserved memory type {value:#x}")]
    ReservedMemoryType { index: u32, value: u8 },
}

pub type Result<T> = result::Result<T, Error>;

/// Memory types an MTRR can assign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MemoryType::Uncacheable),
            1 => Some(MemoryType::WriteCombining),
            4 => Some(MemoryType::WriteThrough),
            5 => Some(MemoryType::WriteProtected),
            6 => Some(MemoryType::WriteBack),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// Type reported for every address while MTRRs are disabled.
pub const DISABLED_MEMORY_TYPE: MemoryType = MemoryType::Uncacheable;

/// Combines the types of two overlapping ranges.
///
/// Returns `None` when the architecture leaves the combination undefined.
pub fn type_with_precedence(first: MemoryType, second: MemoryType) -> Option<MemoryType> {
    use MemoryType::*;

    match (first, second) {
        (a, b) if a == b => Some(a),
        (Uncacheable, _) | (_, Uncacheable) => Some(Uncacheable),
        (WriteBack, WriteThrough) | (WriteThrough, WriteBack) => Some(WriteThrough),
        _ => None,
    }
}

/// Most fixed-range entries a cache holds.
pub const MAX_FIXED_RANGES: usize = 16;
/// Most variable-range entries a cache holds.
pub const MAX_VARIABLE_RANGES: usize = 16;

const PAGE_SIZE_4K: u64 = 0x1000;
const PAGE_SIZE_2M: u64 = 0x20_0000;
const FIXED_RANGE_LIMIT: u64 = 0x10_0000;

// Bits 51:12 of IA32_MTRR_PHYSBASEn and IA32_MTRR_PHYSMASKn.
const PHYS_FIELD_MASK: u64 = 0x000f_ffff_ffff_f000;
const PHYSMASK_VALID: u64 = 1 << 11;
const PHYS_ADDRESS_LIMIT: u64 = 1 << 52;

/// A fixed-range MTRR MSR: eight consecutive sub-ranges of `size` bytes
/// starting at `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedRangeMsr {
    pub index: u32,
    pub base: u64,
    pub size: u64,
}

pub const FIXED_RANGE_MSRS: [FixedRangeMsr; 11] = [
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX64K_00000,
        base: 0x00000,
        size: 0x10000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX16K_80000,
        base: 0x80000,
        size: 0x4000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX16K_A0000,
        base: 0xa0000,
        size: 0x4000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_C0000,
        base: 0xc0000,
        size: 0x1000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_C8000,
        base: 0xc8000,
        size: 0x1000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_D0000,
        base: 0xd0000,
        size: 0x1000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_D8000,
        base: 0xd8000,
        size: 0x1000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_E0000,
        base: 0xe0000,
        size: 0x1000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_E8000,
        base: 0xe8000,
        size: 0x1000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_F0000,
        base: 0xf0000,
        size: 0x1000,
    },
    FixedRangeMsr {
        index: MSR_IA32_MTRR_FIX4K_F8000,
        base: 0xf8000,
        size: 0x1000,
    },
];

/// Decoded contents of one fixed-range MTRR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedRange {
    pub base: u64,
    pub size: u64,
    pub types: [MemoryType; 8],
}

impl FixedRange {
    /// Decodes the eight type bytes of a fixed-range MSR image.
    pub fn from_msr(msr: &FixedRangeMsr, raw: u64) -> Result<Self> {
        let mut types = [MemoryType::Uncacheable; 8];
        for (i, memory_type) in types.iter_mut().enumerate() {
            let value = (raw >> (8 * i)) as u8;
            *memory_type = MemoryType::from_raw(value).ok_or(Error::ReservedMemoryType {
                index: msr.index,
                value,
            })?;
        }
        Ok(FixedRange {
            base: msr.base,
            size: msr.size,
            types,
        })
    }

    // Type of the sub-range fully containing [start, end], if any.
    fn type_for(&self, start: u64, end: u64) -> Option<MemoryType> {
        (0..8u64).find_map(|j| {
            let range_start = self.base + self.size * j;
            let range_end = range_start + self.size;
            (start >= range_start && end <= range_end).then_some(self.types[j as usize])
        })
    }
}

/// Decoded contents of one IA32_MTRR_PHYSBASEn/IA32_MTRR_PHYSMASKn pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariableRange {
    pub enabled: bool,
    pub memory_type: MemoryType,
    /// Physical base address, bits 51:12.
    pub base: u64,
    /// Physical mask, bits 51:12.
    pub mask: u64,
    /// Inclusive lower bound.
    pub min: u64,
    /// Inclusive upper bound.
    pub max: u64,
}

impl VariableRange {
    pub fn new(memory_type: MemoryType, base: u64, mask: u64, enabled: bool) -> Self {
        let base = base & PHYS_FIELD_MASK;
        let mask = mask & PHYS_FIELD_MASK;
        // The lowest set mask bit gives the power-of-two size of the range.
        let max = 1u64
            .checked_shl(mask.trailing_zeros())
            .map_or(u64::MAX, |size| base.saturating_add(size - 1));
        VariableRange {
            enabled,
            memory_type,
            base,
            mask,
            min: base,
            max,
        }
    }

    /// Decodes a base/mask MSR pair for range `n`.
    ///
    /// A pair whose valid bit is clear is ignored by the processor, so its
    /// base image is not decoded and `None` is returned.
    pub fn from_msrs(n: u32, base: u64, mask: u64) -> Result<Option<Self>> {
        if mask & PHYSMASK_VALID == 0 {
            return Ok(None);
        }
        let value = (base & 0xff) as u8;
        let memory_type = MemoryType::from_raw(value).ok_or(Error::ReservedMemoryType {
            index: mtrr_physbase(n),
            value,
        })?;
        Ok(Some(Self::new(memory_type, base, mask, true)))
    }

    /// Whether `address` falls in the range by the mask comparison.
    pub fn matches(&self, address: u64) -> bool {
        (address & self.mask) == (self.base & self.mask)
    }

    /// Whether `[start, end]` lies within `[min, max]`.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        start >= self.min && end <= self.max
    }

    // Lowest address above `address` at which `matches` may change.
    fn next_boundary(&self, address: u64) -> u64 {
        if self.mask == 0 {
            return u64::MAX;
        }
        let low = self.mask.trailing_zeros();
        let run = self.mask >> low;
        if run & (run + 1) != 0 {
            // Holes in the mask: the match can only change between blocks.
            return next_multiple(address, 1 << low);
        }

        // A contiguous mask matches one block per period of the highest
        // mask bit.
        let period = 1u64.checked_shl(64 - self.mask.leading_zeros());
        let period_base = period.map_or(0, |period| address & !(period - 1));
        let first = self.base & self.mask;
        [first.checked_add(1 << low), Some(first), period]
            .into_iter()
            .flatten()
            .filter_map(|offset| period_base.checked_add(offset))
            .filter(|&boundary| boundary > address)
            .min()
            .unwrap_or(u64::MAX)
    }
}

fn next_multiple(address: u64, size: u64) -> u64 {
    (address | (size - 1)).checked_add(1).unwrap_or(u64::MAX)
}

/// A snapshot of the MTRR state of one logical processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MtrrCache {
    enabled: bool,
    default_type: MemoryType,
    fixed_enabled: bool,
    fixed: Vec<FixedRange>,
    variable: Vec<VariableRange>,
}

impl MtrrCache {
    /// A cache with MTRRs disabled.
    pub fn disabled() -> Self {
        MtrrCache {
            enabled: false,
            default_type: DISABLED_MEMORY_TYPE,
            fixed_enabled: false,
            fixed: Vec::new(),
            variable: Vec::new(),
        }
    }

    /// Builds a cache from already decoded state.
    ///
    /// Entries beyond `MAX_FIXED_RANGES` and `MAX_VARIABLE_RANGES` are
    /// dropped. Fixed ranges are ignored unless `fixed_enabled` is set.
    pub fn from_parts(
        default_type: MemoryType,
        fixed_enabled: bool,
        fixed: &[FixedRange],
        variable: &[VariableRange],
    ) -> Self {
        if variable.len() > MAX_VARIABLE_RANGES {
            warn!(
                "Ignoring {} variable MTRRs beyond the first {}",
                variable.len() - MAX_VARIABLE_RANGES,
                MAX_VARIABLE_RANGES
            );
        }
        let fixed = if fixed_enabled {
            fixed.iter().take(MAX_FIXED_RANGES).copied().collect()
        } else {
            Vec::new()
        };
        MtrrCache {
            enabled: true,
            default_type,
            fixed_enabled,
            fixed,
            variable: variable
                .iter()
                .take(MAX_VARIABLE_RANGES)
                .copied()
                .collect(),
        }
    }

    /// Reads IA32_MTRRCAP, IA32_MTRR_DEF_TYPE and the range MSRs they
    /// enable.
    pub fn from_port<P: RegisterPort>(port: &P) -> Result<Self> {
        let cap = port.read::<MtrrCap>().map_err(Error::ReadMsr)?;
        let def = port.read::<MtrrDefType>().map_err(Error::ReadMsr)?;

        if !def.enabled() {
            debug!("MTRRs are disabled");
            return Ok(Self::disabled());
        }

        let default_type =
            MemoryType::from_raw(def.default_type()).ok_or(Error::ReservedMemoryType {
                index: MSR_IA32_MTRR_DEF_TYPE,
                value: def.default_type(),
            })?;

        let fixed_enabled = cap.fixed_ranges_supported() && def.fixed_enabled();
        let mut fixed = Vec::new();
        if fixed_enabled {
            for msr in FIXED_RANGE_MSRS.iter() {
                let raw = port.read_msr(msr.index).map_err(Error::ReadMsr)?;
                fixed.push(FixedRange::from_msr(msr, raw)?);
            }
        }

        let count = cap.variable_range_count() as usize;
        if count > MAX_VARIABLE_RANGES {
            warn!(
                "Processor reports {} variable MTRRs, only the first {} are used",
                count, MAX_VARIABLE_RANGES
            );
        }
        let mut variable = Vec::new();
        for n in 0..count.min(MAX_VARIABLE_RANGES) as u32 {
            let base = port.read_msr(mtrr_physbase(n)).map_err(Error::ReadMsr)?;
            let mask = port.read_msr(mtrr_physmask(n)).map_err(Error::ReadMsr)?;
            match VariableRange::from_msrs(n, base, mask)? {
                Some(range) => variable.push(range),
                None => debug!("Variable MTRR {} is not valid", n),
            }
        }

        debug!(
            "MTRRs enabled: default type {:?}, fixed ranges {}, variable ranges {}",
            default_type,
            fixed.len(),
            variable.len()
        );

        Ok(MtrrCache {
            enabled: true,
            default_type,
            fixed_enabled,
            fixed,
            variable,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn fixed_enabled(&self) -> bool {
        self.fixed_enabled
    }

    pub fn default_type(&self) -> MemoryType {
        self.default_type
    }

    pub fn fixed_ranges(&self) -> &[FixedRange] {
        &self.fixed
    }

    pub fn variable_ranges(&self) -> &[VariableRange] {
        &self.variable
    }

    /// Memory type of the 4 KiB page containing `address`.
    ///
    /// Below 1 MiB the fixed ranges win when enabled. Otherwise the first
    /// enabled variable range matching the address decides, and the default
    /// type applies when none does.
    pub fn type_for_4k(&self, address: u64) -> MemoryType {
        if !self.enabled {
            return DISABLED_MEMORY_TYPE;
        }

        let start = address & !(PAGE_SIZE_4K - 1);
        let end = start + (PAGE_SIZE_4K - 1);

        if self.fixed_enabled && start < FIXED_RANGE_LIMIT {
            if let Some(memory_type) = self.fixed.iter().find_map(|range| range.type_for(start, end))
            {
                return memory_type;
            }
        }

        self.variable
            .iter()
            .find(|range| range.enabled && range.matches(start))
            .map_or(self.default_type, |range| range.memory_type)
    }

    /// Memory type of the 2 MiB page containing `address`, or `None` when
    /// the ranges covering it combine to an undefined type.
    ///
    /// The fixed ranges are consulted only for the page starting at 0, in
    /// which case all of their sub-range types are combined.
    pub fn type_for_2m(&self, address: u64) -> Option<MemoryType> {
        if !self.enabled {
            return Some(DISABLED_MEMORY_TYPE);
        }

        let start = address & !(PAGE_SIZE_2M - 1);
        let end = start + (PAGE_SIZE_2M - 1);

        if self.fixed_enabled && start == 0 {
            let mut combined: Option<MemoryType> = None;
            for memory_type in self.fixed.iter().flat_map(|range| range.types) {
                combined = Some(match combined {
                    Some(current) => type_with_precedence(current, memory_type)?,
                    None => memory_type,
                });
            }
            return Some(combined.unwrap_or(self.default_type));
        }

        let mut combined: Option<MemoryType> = None;
        for range in self
            .variable
            .iter()
            .filter(|range| range.enabled && range.contains(start, end))
        {
            combined = Some(match combined {
                Some(current) => type_with_precedence(current, range.memory_type)?,
                None => range.memory_type,
            });
        }
        Some(combined.unwrap_or(self.default_type))
    }

    // Lowest page above `page` whose type may differ from the type of
    // `page`.
    fn next_boundary(&self, page: u64) -> u64 {
        let mut boundary = self
            .variable
            .iter()
            .filter(|range| range.enabled)
            .map(|range| range.next_boundary(page))
            .min()
            .unwrap_or(u64::MAX);

        if self.fixed_enabled && page < FIXED_RANGE_LIMIT {
            boundary = boundary.min(FIXED_RANGE_LIMIT);
            for range in self.fixed.iter() {
                if let Some(edge) = (0..=8u64)
                    .map(|j| range.base + range.size * j)
                    .find(|&edge| edge > page)
                {
                    boundary = boundary.min(edge);
                }
            }
        }
        boundary
    }

    /// Memory type shared by every 4 KiB page touched by
    /// `[address, address + size)`, or `None` when two of them combine to an
    /// undefined type.
    ///
    /// The range is folded one run of identically typed pages at a time.
    /// Pages beyond the 52-bit physical address space are not considered.
    pub fn type_for_range(&self, address: u64, size: u64) -> Option<MemoryType> {
        if !self.enabled {
            return Some(DISABLED_MEMORY_TYPE);
        }

        let start = address & !(PAGE_SIZE_4K - 1);
        let end = address
            .checked_add(size)
            .and_then(|end| end.checked_add(PAGE_SIZE_4K - 1))
            .map_or(PHYS_ADDRESS_LIMIT, |end| {
                (end & !(PAGE_SIZE_4K - 1)).min(PHYS_ADDRESS_LIMIT)
            });

        let mut memory_type = self.type_for_4k(start);
        let mut page = start;
        loop {
            let next = self.next_boundary(page);
            if next >= end {
                break;
            }
            memory_type = type_with_precedence(self.type_for_4k(next), memory_type)?;
            page = next;
        }
        Some(memory_type)
    }
}

#[cfg(test)]
mod tests {
    use hypervisor::arch::x86::msr_index::{MSR_IA32_MTRRCAP, MSR_IA32_MTRR_DEF_TYPE};
    use hypervisor::InMemoryPort;

    use super::*;

    const ALL_TYPES: [MemoryType; 5] = [
        MemoryType::Uncacheable,
        MemoryType::WriteCombining,
        MemoryType::WriteThrough,
        MemoryType::WriteProtected,
        MemoryType::WriteBack,
    ];

    fn fixed_ranges(memory_type: MemoryType) -> Vec<FixedRange> {
        FIXED_RANGE_MSRS
            .iter()
            .map(|msr| FixedRange {
                base: msr.base,
                size: msr.size,
                types: [memory_type; 8],
            })
            .collect()
    }

    #[test]
    fn precedence_table() {
        for x in ALL_TYPES {
            assert_eq!(type_with_precedence(x, x), Some(x));
            assert_eq!(
                type_with_precedence(MemoryType::Uncacheable, x),
                Some(MemoryType::Uncacheable)
            );
            assert_eq!(
                type_with_precedence(x, MemoryType::Uncacheable),
                Some(MemoryType::Uncacheable)
            );
        }
        assert_eq!(
            type_with_precedence(MemoryType::WriteBack, MemoryType::WriteThrough),
            Some(MemoryType::WriteThrough)
        );
        assert_eq!(
            type_with_precedence(MemoryType::WriteThrough, MemoryType::WriteBack),
            Some(MemoryType::WriteThrough)
        );

        for a in ALL_TYPES {
            for b in ALL_TYPES {
                let defined = a == b
                    || a == MemoryType::Uncacheable
                    || b == MemoryType::Uncacheable
                    || matches!(
                        (a, b),
                        (MemoryType::WriteBack, MemoryType::WriteThrough)
                            | (MemoryType::WriteThrough, MemoryType::WriteBack)
                    );
                assert_eq!(type_with_precedence(a, b).is_some(), defined, "{a:?} {b:?}");
            }
        }
    }

    #[test]
    fn variable_range_bounds() {
        // 256 MiB write-combining range at 3 GiB.
        let range = VariableRange::new(
            MemoryType::WriteCombining,
            0xc000_0000,
            0xf_f000_0000,
            true,
        );
        assert_eq!(range.min, 0xc000_0000);
        assert_eq!(range.max, 0xcfff_ffff);
        assert!(range.matches(0xc123_4000));
        assert!(!range.matches(0xd000_0000));
        assert!(range.contains(0xc000_0000, 0xc01f_ffff));

        let everything = VariableRange::new(MemoryType::WriteBack, 0, 0, true);
        assert_eq!(everything.max, u64::MAX);
    }

    #[test]
    fn disabled_cache_is_uncacheable() {
        let cache = MtrrCache::disabled();
        assert_eq!(cache.type_for_4k(0x1000), MemoryType::Uncacheable);
        assert_eq!(cache.type_for_2m(0x4000_0000), Some(MemoryType::Uncacheable));
        assert_eq!(
            cache.type_for_range(0, 0x1_0000_0000),
            Some(MemoryType::Uncacheable)
        );
    }

    #[test]
    fn fixed_ranges_below_1m() {
        let mut fixed = fixed_ranges(MemoryType::WriteBack);
        // 0xa0000..0xc0000 is the legacy VGA window.
        fixed[2].types = [MemoryType::Uncacheable; 8];
        let variable = [VariableRange::new(
            MemoryType::WriteThrough,
            0,
            0xf_8000_0000,
            true,
        )];
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, true, &fixed, &variable);

        assert_eq!(cache.type_for_4k(0x9f000), MemoryType::WriteBack);
        assert_eq!(cache.type_for_4k(0xb8000), MemoryType::Uncacheable);
        // Above 1 MiB the variable range applies.
        assert_eq!(cache.type_for_4k(0x10_0000), MemoryType::WriteThrough);
        // Beyond the variable range the default applies.
        assert_eq!(cache.type_for_4k(0x8000_0000), MemoryType::Uncacheable);

        // Disabling the fixed ranges hands low memory to the variable ones.
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, false, &fixed, &variable);
        assert_eq!(cache.type_for_4k(0xb8000), MemoryType::WriteThrough);
    }

    #[test]
    fn first_2m_combines_fixed_ranges() {
        let mut fixed = fixed_ranges(MemoryType::WriteBack);
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, true, &fixed, &[]);
        assert_eq!(cache.type_for_2m(0x1234), Some(MemoryType::WriteBack));

        fixed[3].types[1] = MemoryType::WriteThrough;
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, true, &fixed, &[]);
        assert_eq!(cache.type_for_2m(0), Some(MemoryType::WriteThrough));

        fixed[4].types[0] = MemoryType::WriteCombining;
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, true, &fixed, &[]);
        assert_eq!(cache.type_for_2m(0), None);
        // Only the page at 0 consults the fixed ranges.
        assert_eq!(cache.type_for_2m(0x20_0000), Some(MemoryType::Uncacheable));
    }

    #[test]
    fn variable_2m_pages() {
        let variable = [
            VariableRange::new(MemoryType::WriteBack, 0, 0xf_0000_0000, true),
            VariableRange::new(MemoryType::WriteThrough, 0x4000_0000, 0xf_c000_0000, true),
            VariableRange::new(MemoryType::WriteCombining, 0x8000_0000, 0xf_c000_0000, true),
            VariableRange::new(MemoryType::Uncacheable, 0xc000_0000, 0xf_c000_0000, false),
        ];
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, false, &[], &variable);

        assert_eq!(cache.type_for_2m(0x20_0000), Some(MemoryType::WriteBack));
        assert_eq!(cache.type_for_2m(0x4020_0000), Some(MemoryType::WriteThrough));
        assert_eq!(cache.type_for_2m(0x8000_0000), None);
        // The disabled range is skipped.
        assert_eq!(cache.type_for_2m(0xc000_0000), Some(MemoryType::WriteBack));
        // Nothing covers 4 GiB and above.
        assert_eq!(cache.type_for_2m(0x1_0000_0000), Some(MemoryType::Uncacheable));
    }

    #[test]
    fn ranges_fold_per_page() {
        let variable = [
            VariableRange::new(MemoryType::WriteBack, 0, 0xf_0000_0000, true),
            VariableRange::new(MemoryType::WriteThrough, 0x10_0000, 0xf_ffff_f000, true),
        ];
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, false, &[], &variable);

        // The first matching variable range wins for each page.
        assert_eq!(cache.type_for_4k(0x10_0000), MemoryType::WriteBack);
        assert_eq!(cache.type_for_range(0x800, 0x1000), Some(MemoryType::WriteBack));

        let variable = [
            VariableRange::new(MemoryType::WriteThrough, 0x10_0000, 0xf_ffff_f000, true),
            VariableRange::new(MemoryType::WriteCombining, 0x20_0000, 0xf_ffff_f000, true),
            VariableRange::new(MemoryType::WriteBack, 0, 0xf_0000_0000, true),
        ];
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, false, &[], &variable);
        assert_eq!(
            cache.type_for_range(0xff000, 0x2000),
            Some(MemoryType::WriteThrough)
        );
        assert_eq!(cache.type_for_range(0x1ff000, 0x2000), None);
        assert_eq!(cache.type_for_range(0x30_0000, 0), Some(MemoryType::WriteBack));
    }

    #[test]
    fn ranges_fold_by_runs() {
        let mut fixed = fixed_ranges(MemoryType::WriteBack);
        fixed[2].types = [MemoryType::Uncacheable; 8];
        let variable = [
            VariableRange::new(MemoryType::WriteBack, 0, 0xf_0000_0000, true),
            VariableRange::new(MemoryType::WriteThrough, 0x1_0000_0000, 0xf_0000_0000, true),
        ];
        let cache = MtrrCache::from_parts(MemoryType::Uncacheable, true, &fixed, &variable);

        // Whole address space: WB and WT runs, UC fixed ranges and the UC
        // default above 8 GiB.
        assert_eq!(
            cache.type_for_range(0, u64::MAX),
            Some(MemoryType::Uncacheable)
        );
        assert_eq!(
            cache.type_for_range(0x10_0000, 0x1_0000_0000),
            Some(MemoryType::WriteThrough)
        );
        assert_eq!(
            cache.type_for_range(0xc0000, 0xfff4_0000),
            Some(MemoryType::WriteBack)
        );
        assert_eq!(
            cache.type_for_range(0x1_8000_0000, 0x8000_0000),
            Some(MemoryType::WriteThrough)
        );

        let combining = [VariableRange::new(
            MemoryType::WriteCombining,
            0x8_0000_0000,
            0xf_ffff_f000,
            true,
        )];
        let cache = MtrrCache::from_parts(MemoryType::WriteBack, false, &[], &combining);
        // A single WC page deep inside a huge WB range.
        assert_eq!(cache.type_for_range(0, u64::MAX), None);
        assert_eq!(
            cache.type_for_range(0x8_0000_1000, 0x10_0000),
            Some(MemoryType::WriteBack)
        );
    }

    #[test]
    fn variable_range_boundaries() {
        let range = VariableRange::new(MemoryType::WriteBack, 0x4000_0000, 0xf_c000_0000, true);
        assert_eq!(range.next_boundary(0), 0x4000_0000);
        assert_eq!(range.next_boundary(0x4000_0000), 0x8000_0000);
        assert_eq!(range.next_boundary(0x8000_0000), 0x10_0000_0000);

        // Bit 31 missing from the mask: every 1 GiB block may differ.
        let holes = VariableRange::new(MemoryType::WriteBack, 0, 0xf_7000_0000, true);
        assert_eq!(holes.next_boundary(0x1000), 0x1000_0000);
    }

    #[test]
    fn snapshot_from_port() {
        let port = InMemoryPort::new()
            .with_msr(MSR_IA32_MTRRCAP, 0x502)
            .with_msr(MSR_IA32_MTRR_DEF_TYPE, 0xc00)
            .with_msr(MSR_IA32_MTRR_FIX64K_00000, 0x0606_0606_0606_0606)
            .with_msr(MSR_IA32_MTRR_FIX16K_80000, 0x0606_0606_0606_0606)
            .with_msr(MSR_IA32_MTRR_FIX16K_A0000, 0)
            .with_msr(MSR_IA32_MTRR_FIX4K_C0000, 0x0505_0505_0505_0505)
            .with_msr(MSR_IA32_MTRR_FIX4K_C8000, 0x0505_0505_0505_0505)
            .with_msr(MSR_IA32_MTRR_FIX4K_D0000, 0)
            .with_msr(MSR_IA32_MTRR_FIX4K_D8000, 0)
            .with_msr(MSR_IA32_MTRR_FIX4K_E0000, 0)
            .with_msr(MSR_IA32_MTRR_FIX4K_E8000, 0)
            .with_msr(MSR_IA32_MTRR_FIX4K_F0000, 0x0505_0505_0505_0505)
            .with_msr(MSR_IA32_MTRR_FIX4K_F8000, 0x0505_0505_0505_0505)
            .with_msr(mtrr_physbase(0), 0x6)
            .with_msr(mtrr_physmask(0), 0xf_8000_0800)
            .with_msr(mtrr_physbase(1), 0x8000_0000)
            .with_msr(mtrr_physmask(1), 0xf_c000_0000);

        let cache = MtrrCache::from_port(&port).unwrap();
        assert!(cache.enabled());
        assert!(cache.fixed_enabled());
        assert_eq!(cache.default_type(), MemoryType::Uncacheable);
        assert_eq!(cache.fixed_ranges().len(), 11);
        // The second pair is not valid and is left out.
        assert_eq!(cache.variable_ranges().len(), 1);

        assert_eq!(cache.type_for_4k(0x0), MemoryType::WriteBack);
        assert_eq!(cache.type_for_4k(0xa0000), MemoryType::Uncacheable);
        assert_eq!(cache.type_for_4k(0xc1000), MemoryType::WriteProtected);
        assert_eq!(cache.type_for_4k(0x4000_0000), MemoryType::WriteBack);
        assert_eq!(cache.type_for_4k(0x8000_0000), MemoryType::Uncacheable);
    }

    #[test]
    fn snapshot_errors() {
        // A missing fixed-range MSR surfaces the port error.
        let port = InMemoryPort::new()
            .with_msr(MSR_IA32_MTRRCAP, 0x100)
            .with_msr(MSR_IA32_MTRR_DEF_TYPE, 0xc06);
        assert!(matches!(MtrrCache::from_port(&port), Err(Error::ReadMsr(_))));

        let port = InMemoryPort::new()
            .with_msr(MSR_IA32_MTRRCAP, 0x1)
            .with_msr(MSR_IA32_MTRR_DEF_TYPE, 0x806)
            .with_msr(mtrr_physbase(0), 0x2)
            .with_msr(mtrr_physmask(0), 0x800);
        assert!(matches!(
            MtrrCache::from_port(&port),
            Err(Error::ReservedMemoryType {
                index: 0x200,
                value: 2
            })
        ));

        // Invalid pairs are not decoded.
        let port = InMemoryPort::new()
            .with_msr(MSR_IA32_MTRRCAP, 0x2)
            .with_msr(MSR_IA32_MTRR_DEF_TYPE, 0x800)
            .with_msr(mtrr_physbase(0), 0x2)
            .with_msr(mtrr_physmask(0), 0)
            .with_msr(mtrr_physbase(1), 0x4000_0006)
            .with_msr(mtrr_physmask(1), 0xf_c000_0800);
        let cache = MtrrCache::from_port(&port).unwrap();
        assert_eq!(
            cache.variable_ranges(),
            &[VariableRange::new(
                MemoryType::WriteBack,
                0x4000_0000,
                0xf_c000_0000,
                true
            )]
        );
        assert_eq!(cache.type_for_4k(0x4000_0000), MemoryType::WriteBack);
        assert_eq!(cache.type_for_4k(0), MemoryType::Uncacheable);

        // Disabled MTRRs never read the range MSRs.
        let port = InMemoryPort::new()
            .with_msr(MSR_IA32_MTRRCAP, 0x508)
            .with_msr(MSR_IA32_MTRR_DEF_TYPE, 0x6);
        assert_eq!(MtrrCache::from_port(&port).unwrap(), MtrrCache::disabled());
    }
}
