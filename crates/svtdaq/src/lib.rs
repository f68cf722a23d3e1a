// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # svtdaq - detector readout communications core
//!
//! Talks to front-end readout boards over UDP: register reads and writes,
//! commands and software run triggers go out; register echoes and event
//! data come back. Event data fans out to a callback, a monitoring socket
//! and a capture file, and can be relayed to a separate readout process
//! through shared memory.
//!
//! ## Quick Start
//!
//! ```rust
//! use svtdaq::{CommLink, Error, LinkConfig, LoopbackDriver, Register};
//!
//! let link = CommLink::new(LinkConfig::default());
//! link.open(LoopbackDriver::new())?;
//!
//! let mut reg = Register::new("Control", 0x0000_0010, 1);
//! reg.data_mut()[0] = 0x1;
//! link.queue_register(0, &mut reg, true, true)?;
//! assert!(!reg.stale());
//! link.close();
//! # Ok::<(), Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                      System (run / poll)                            |
//! |   <system> XML in -> variables, commands, DeviceTree -> XML out     |
//! +---------------------------------------------------------------------+
//! |                           CommLink                                  |
//! |   register slot | command slot | run slot | counters | data queue   |
//! +---------------------------------------------------------------------+
//! |                       LinkDriver                                    |
//! |   Loopback | UDP (one socket per host) | Tracker (UDP + data ring)  |
//! +---------------------------------------------------------------------+
//! |            Data thread: callback -> monitor socket -> capture       |
//! +---------------------------------------------------------------------+
//! |            Shared memory: data ring | command mailbox | status      |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`link`] - transaction engine and data fan-out
//! - [`transport`] - wire codec, UDP and Tracker drivers
//! - [`shm`] - shared-memory relay segments
//! - [`capture`] - capture file records, reader and timeline
//! - [`system`] - run/poll orchestrator

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod shm;
pub mod system;
pub mod transport;

pub use capture::{CaptureError, CaptureReader, CaptureRecord, CaptureTimeline, CaptureWriter, RecordKind};
pub use config::LinkConfig;
pub use device::{Command, Register, STATUS_FAILED};
pub use error::{Error, Result};
pub use link::{CommLink, DataCallback, DataRecord, LinkCountersSnapshot, LinkDriver, LoopbackDriver, RunMarker};
pub use system::{DeviceTree, NullDevice, System};
pub use transport::{TrackerDriver, UdpDriver};
