// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//
// Copyright © 2020, Microsoft Corporation
//

//! A register-level abstraction of the x86-64 processor for bare-metal
//! hypervisor bring-up.
//!
//! This crate offers the `RegisterPort` trait, through which the rest of the
//! stack reads and writes model-specific registers, control registers and
//! descriptor-table registers, queries CPUID and issues VMX instructions.
//!
//! # Implementations
//!
//! - `HardwarePort`: the executing processor, through inline assembly.
//! - `InMemoryPort`: a deterministic in-memory model for tests and offline
//!   analysis.
//!

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;
extern crate thiserror;

/// Architecture specific definitions
pub mod arch;

/// Register port trait
mod port;

/// In-memory register port
mod fake;

/// Processor-backed register port
#[cfg(target_arch = "x86_64")]
mod hardware;

pub use crate::fake::{InMemoryPort, Invalidation};
#[cfg(target_arch = "x86_64")]
pub use crate::hardware::HardwarePort;
pub use crate::port::{PortError, RegisterPort, Result};
