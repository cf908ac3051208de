// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

// Leaves
pub const CPUID_LEAF_MAX_BASIC: u32 = 0x0;
pub const CPUID_LEAF_FEATURES: u32 = 0x1;
pub const CPUID_LEAF_MAX_EXTENDED: u32 = 0x8000_0000;
pub const CPUID_LEAF_EXT_FEATURES: u32 = 0x8000_0001;
pub const CPUID_LEAF_ADDRESS_SIZES: u32 = 0x8000_0008;

// Leaf 0x1 ECX
pub const CPUID_1_ECX_VMX_SHIFT: u32 = 5;
pub const CPUID_1_ECX_VMX: u32 = 1 << CPUID_1_ECX_VMX_SHIFT;

// Leaf 0x1 EDX
pub const CPUID_1_EDX_PSE_SHIFT: u32 = 3;
pub const CPUID_1_EDX_MSR_SHIFT: u32 = 5;
pub const CPUID_1_EDX_PAE_SHIFT: u32 = 6;
pub const CPUID_1_EDX_MTRR_SHIFT: u32 = 12;
pub const CPUID_1_EDX_PSE36_SHIFT: u32 = 17;
pub const CPUID_1_EDX_PSE: u32 = 1 << CPUID_1_EDX_PSE_SHIFT;
pub const CPUID_1_EDX_MSR: u32 = 1 << CPUID_1_EDX_MSR_SHIFT;
pub const CPUID_1_EDX_PAE: u32 = 1 << CPUID_1_EDX_PAE_SHIFT;
pub const CPUID_1_EDX_MTRR: u32 = 1 << CPUID_1_EDX_MTRR_SHIFT;
pub const CPUID_1_EDX_PSE36: u32 = 1 << CPUID_1_EDX_PSE36_SHIFT;

// Leaf 0x8000_0001 EDX
pub const CPUID_80000001_EDX_NX_SHIFT: u32 = 20;
pub const CPUID_80000001_EDX_PAGE1GB_SHIFT: u32 = 26;
pub const CPUID_80000001_EDX_LM_SHIFT: u32 = 29;
pub const CPUID_80000001_EDX_NX: u32 = 1 << CPUID_80000001_EDX_NX_SHIFT;
pub const CPUID_80000001_EDX_PAGE1GB: u32 = 1 << CPUID_80000001_EDX_PAGE1GB_SHIFT;
pub const CPUID_80000001_EDX_LM: u32 = 1 << CPUID_80000001_EDX_LM_SHIFT;

/// Register values returned by a single `cpuid` execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidResult {
    pub fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        CpuidResult { eax, ebx, ecx, edx }
    }

    /// Physical address width reported by leaf 0x8000_0008.
    pub fn physical_address_bits(&self) -> u8 {
        (self.eax & 0xff) as u8
    }

    /// Linear address width reported by leaf 0x8000_0008.
    pub fn linear_address_bits(&self) -> u8 {
        ((self.eax >> 8) & 0xff) as u8
    }
}
