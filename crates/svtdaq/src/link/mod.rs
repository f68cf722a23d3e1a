// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link engine: transaction slots, worker threads and data fan-out.
//!
//! # Architecture
//!
//! ```text
//!  callers ──queue_register/queue_command──┐
//!                                          v
//!                          +-------------------------------+
//!                          | LinkShared                    |
//!                          |  register slot  command slot  |
//!                          |  run slot       counters      |
//!                          +-------------------------------+
//!                             ^ TxCursor           | complete()
//!                             |                    |
//!                          +-------------------------------+
//!                          | LinkDriver threads (tx / rx)  |---> sockets
//!                          +-------------------------------+
//!                                          | DataQueue (bounded)
//!                                          v
//!                          +-------------------------------+
//!                          | Data thread                   |
//!                          |  callback -> monitor -> file  |
//!                          +-------------------------------+
//! ```
//!
//! Each slot holds one outstanding request. Callers of the same slot are
//! serialized for the whole transaction; the three slots are independent.

mod counters;
mod data;
mod driver;
mod engine;
mod loopback;
mod slot;

pub use counters::{LinkCounters, LinkCountersSnapshot};
pub use data::{DataCallback, DataItem, DataQueue, DataRecord};
pub use driver::{DriverContext, DriverHandles, LinkDriver, LinkShared, Outgoing, TxCursor};
pub use engine::{CommLink, RunMarker};
pub use loopback::LoopbackDriver;
