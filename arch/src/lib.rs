// Copyright 2020 Arm Limited (or its affiliates). All rights reserved.
// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Implements platform specific functionality.
//! Supported platforms: x86_64.
//!
//! Software page-table walkers for 32-bit, PAE, IA-32e and EPT paging, the
//! MTRR memory-type engine and VMX control negotiation, all driven through
//! `hypervisor::RegisterPort` and a `vm_memory::GuestMemory` view of
//! physical memory.
#![allow(clippy::unreadable_literal, clippy::cast_lossless)]

#[macro_use]
extern crate log;

extern crate vm_memory;

/// x86_64 specific code
pub mod x86_64;

pub use crate::x86_64::{PagingMode, PlatformConfig};
