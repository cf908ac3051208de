// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

pub mod cpuid;
pub mod gdt;
pub mod msr_index;
pub mod regs;
pub mod vmx;

// Code segment
pub const CODE_SEGMENT_TYPE: u8 = 0x8;

// Writable data or readable code segment
pub const RWRX_SEGMENT_TYPE: u8 = 0x2;

// Expand down segment
pub const EXPAND_DOWN_SEGMENT_TYPE: u8 = 0x4;

// Accessed segment
pub const ACCESSED_SEGMENT_TYPE: u8 = 0x1;

pub fn segment_type_code(t: u8) -> bool {
    t & CODE_SEGMENT_TYPE != 0
}

pub fn segment_type_readable(t: u8) -> bool {
    !segment_type_code(t) || t & RWRX_SEGMENT_TYPE != 0
}

pub fn segment_type_writable(t: u8) -> bool {
    !segment_type_code(t) && t & RWRX_SEGMENT_TYPE != 0
}

pub fn segment_type_expand_down(t: u8) -> bool {
    !segment_type_code(t) && (t & EXPAND_DOWN_SEGMENT_TYPE != 0)
}

// System segment and gate types (S = 0) in IA-32e mode.
pub const SYSTEM_TYPE_LDT: u8 = 0x2;
pub const SYSTEM_TYPE_TSS_AVAILABLE: u8 = 0x9;
pub const SYSTEM_TYPE_TSS_BUSY: u8 = 0xb;
pub const SYSTEM_TYPE_CALL_GATE: u8 = 0xc;
pub const SYSTEM_TYPE_INTERRUPT_GATE: u8 = 0xe;
pub const SYSTEM_TYPE_TRAP_GATE: u8 = 0xf;

/// Physical address width used when CPUID leaf 0x8000_0008 is unavailable.
pub const DEFAULT_PHYS_BITS: u8 = 36;
