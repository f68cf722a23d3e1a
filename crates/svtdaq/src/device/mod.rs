// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Register and command objects exchanged with the link engine.
//!
//! The device tree that owns these objects is external; this module only
//! carries the read contract the engine needs (`address`, `size`, `data`,
//! `stale`, `status`, `opcode`).

mod command;
mod register;

pub use command::Command;
pub use register::{Register, STATUS_FAILED};
