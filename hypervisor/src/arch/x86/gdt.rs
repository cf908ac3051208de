// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Segment, system and gate descriptors as stored in the GDT, LDT and IDT.

use std::result;

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryError};

use crate::arch::x86::regs::{SegmentSelector, TableIndicator, TableRegister};
use crate::arch::x86::{
    segment_type_code, segment_type_expand_down, segment_type_readable, segment_type_writable,
};

#[derive(Debug, Error)]
pub enum Error {
    /// Reading a descriptor from memory failed.
    #[error("Reading a descriptor from memory failed")]
    ReadDescriptor(#[source] GuestMemoryError),
    /// Selector references the LDT.
    #[error("Selector {0:#x} references the LDT")]
    LocalDescriptorTable(u16),
}

pub type Result<T> = result::Result<T, Error>;

/// Builds an 8-byte descriptor from packed flags, a base and a limit.
///
/// `flags` holds the access byte in bits 7:0 and the G/DB/L/AVL nibble in
/// bits 15:12.
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000u64) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ffu64) << 40)
        | ((u64::from(limit) & 0x000f_0000u64) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffffu64) << 16)
        | (u64::from(limit) & 0x0000_ffffu64)
}

/// An 8-byte code, data or legacy system segment descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentDescriptor(pub u64);

impl SegmentDescriptor {
    pub fn base(&self) -> u32 {
        (((self.0 >> 16) & 0x00ff_ffff) | ((self.0 >> 32) & 0xff00_0000)) as u32
    }

    /// Raw 20-bit limit field.
    pub fn limit(&self) -> u32 {
        ((self.0 & 0xffff) | ((self.0 >> 32) & 0x000f_0000)) as u32
    }

    /// Limit in bytes, scaled by the granularity bit.
    pub fn effective_limit(&self) -> u32 {
        if self.granularity() {
            (self.limit() << 12) | 0xfff
        } else {
            self.limit()
        }
    }

    pub fn segment_type(&self) -> u8 {
        ((self.0 >> 40) & 0xf) as u8
    }

    /// S flag: set for code and data segments, clear for system segments.
    pub fn is_code_or_data(&self) -> bool {
        self.0 & (1 << 44) != 0
    }

    pub fn is_code(&self) -> bool {
        self.is_code_or_data() && segment_type_code(self.segment_type())
    }

    pub fn is_readable(&self) -> bool {
        self.is_code_or_data() && segment_type_readable(self.segment_type())
    }

    pub fn is_writable(&self) -> bool {
        self.is_code_or_data() && segment_type_writable(self.segment_type())
    }

    pub fn is_expand_down(&self) -> bool {
        self.is_code_or_data() && segment_type_expand_down(self.segment_type())
    }

    pub fn dpl(&self) -> u8 {
        ((self.0 >> 45) & 0x3) as u8
    }

    pub fn present(&self) -> bool {
        self.0 & (1 << 47) != 0
    }

    pub fn avl(&self) -> bool {
        self.0 & (1 << 52) != 0
    }

    pub fn long(&self) -> bool {
        self.0 & (1 << 53) != 0
    }

    pub fn db(&self) -> bool {
        self.0 & (1 << 54) != 0
    }

    pub fn granularity(&self) -> bool {
        self.0 & (1 << 55) != 0
    }
}

/// A 16-byte LDT or TSS descriptor in IA-32e mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SystemDescriptor {
    pub low: SegmentDescriptor,
    pub high: u64,
}

impl SystemDescriptor {
    pub fn base(&self) -> u64 {
        u64::from(self.low.base()) | ((self.high & 0xffff_ffff) << 32)
    }
}

/// A 16-byte interrupt, trap or call gate in IA-32e mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateDescriptor {
    pub low: u64,
    pub high: u64,
}

impl GateDescriptor {
    pub fn new(offset: u64, selector: SegmentSelector, gate_type: u8, dpl: u8, ist: u8) -> Self {
        let low = (offset & 0xffff)
            | (u64::from(selector.0) << 16)
            | (u64::from(ist & 0x7) << 32)
            | (u64::from(gate_type & 0xf) << 40)
            | (u64::from(dpl & 0x3) << 45)
            | (1 << 47)
            | ((offset & 0xffff_0000) << 32);
        GateDescriptor {
            low,
            high: offset >> 32,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.low & 0xffff) | ((self.low >> 32) & 0xffff_0000) | ((self.high & 0xffff_ffff) << 32)
    }

    pub fn selector(&self) -> SegmentSelector {
        SegmentSelector(((self.low >> 16) & 0xffff) as u16)
    }

    pub fn ist(&self) -> u8 {
        ((self.low >> 32) & 0x7) as u8
    }

    pub fn gate_type(&self) -> u8 {
        ((self.low >> 40) & 0xf) as u8
    }

    pub fn dpl(&self) -> u8 {
        ((self.low >> 45) & 0x3) as u8
    }

    pub fn present(&self) -> bool {
        self.low & (1 << 47) != 0
    }
}

fn read_quad<M: GuestMemory + ?Sized>(mem: &M, address: u64) -> Result<u64> {
    mem.read_obj(GuestAddress(address))
        .map_err(Error::ReadDescriptor)
}

fn gdt_offset(table: &TableRegister, selector: SegmentSelector, size: u64) -> Result<Option<u64>> {
    if selector.table() == TableIndicator::Ldt {
        return Err(Error::LocalDescriptorTable(selector.0));
    }
    let offset = u64::from(selector.index()) * 8;
    if offset + size - 1 > u64::from(table.limit) {
        return Ok(None);
    }
    Ok(Some(table.base + offset))
}

/// Reads the descriptor `selector` references in the table described by
/// `gdtr`.
///
/// Returns `None` for a selector beyond the table limit. The null selector
/// yields the null descriptor.
pub fn read_segment_descriptor<M: GuestMemory + ?Sized>(
    mem: &M,
    gdtr: &TableRegister,
    selector: SegmentSelector,
) -> Result<Option<SegmentDescriptor>> {
    match gdt_offset(gdtr, selector, 8)? {
        Some(address) => Ok(Some(SegmentDescriptor(read_quad(mem, address)?))),
        None => Ok(None),
    }
}

/// Reads a 16-byte LDT or TSS descriptor.
pub fn read_system_descriptor<M: GuestMemory + ?Sized>(
    mem: &M,
    gdtr: &TableRegister,
    selector: SegmentSelector,
) -> Result<Option<SystemDescriptor>> {
    match gdt_offset(gdtr, selector, 16)? {
        Some(address) => Ok(Some(SystemDescriptor {
            low: SegmentDescriptor(read_quad(mem, address)?),
            high: read_quad(mem, address + 8)?,
        })),
        None => Ok(None),
    }
}

/// Reads the gate for `vector` from the IDT described by `idtr`.
pub fn read_gate_descriptor<M: GuestMemory + ?Sized>(
    mem: &M,
    idtr: &TableRegister,
    vector: u8,
) -> Result<Option<GateDescriptor>> {
    let offset = u64::from(vector) * 16;
    if offset + 15 > u64::from(idtr.limit) {
        return Ok(None);
    }
    let address = idtr.base + offset;
    Ok(Some(GateDescriptor {
        low: read_quad(mem, address)?,
        high: read_quad(mem, address + 8)?,
    }))
}
