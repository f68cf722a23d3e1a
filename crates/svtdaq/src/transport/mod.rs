// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire codec and network drivers.
//!
//! - [`codec`]: datagram mini-header, framing and reassembly
//! - [`message`]: register/command words and response matching
//! - [`UdpDriver`]: one socket per host, data copied into the data queue
//! - [`TrackerDriver`]: same sockets, data received into shared-memory slots

pub mod codec;
pub mod message;
mod tracker;
mod udp;

pub use codec::{encode_frames, Completed, FrameAssembler, FrameError, FrameHeader, Message, Reassembler};
pub use message::{CommandRequest, InFlight, RegisterRequest, RegisterResponse};
pub use tracker::TrackerDriver;
pub use udp::UdpDriver;
