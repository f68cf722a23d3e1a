// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory relay between the network process and the readout process.
//!
//! Three segments, none backed by a kernel lock:
//!
//! ```text
//! +--------------------+        /svtdaq_data         +--------------------+
//! |  network process   |  free list  ->  claim       |  readout process   |
//! |                    |  slots[N]   <-  recv        |                    |
//! |  RingClaimer       |  rx lists   ->  pop/copy    |  RingConsumer      |
//! |  RingPublisher     |  free list  <-  release     |                    |
//! |  RingAcker         |  ack flag   <-  request     |                    |
//! |                    |                             |                    |
//! |  CommandReceiver   |  <- /svtdaq_control -       |  CommandSender     |
//! |  StatusWriter      |  -- /svtdaq_status  ->      |  StatusReader      |
//! +--------------------+                             +--------------------+
//! ```
//!
//! Every mutable field in a segment has exactly one writer. The handle types
//! encode that split: a field is only reachable through the handle of the side
//! allowed to write it. Waiting is done by polling with a fixed sleep, never
//! by spinning.

mod mailbox;
mod ring;
mod segment;
mod status;

pub use mailbox::{CommandReceiver, CommandSender, ControlMailbox, ControlSnapshot};
pub use ring::{
    DataRing, RingAcker, RingClaimer, RingConsumer, RingHandles, RingLayout, RingPublisher, RingSnapshot,
    SlotClaim, MAX_RX_LISTS,
};
pub use segment::ShmSegment;
pub use status::{StatusMailbox, StatusReader, StatusSnapshot, StatusWriter};

use std::fmt;
use std::io;

/// Magic word at offset 0 of every relay segment ("SVTQ").
pub const SEGMENT_MAGIC: u32 = 0x5356_5451;

/// Layout version of the relay segments.
pub const SEGMENT_VERSION: u32 = 1;

/// Segment kind tag stored after the magic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentKind {
    DataRing = 1,
    Control = 2,
    Status = 3,
}

/// Errors that can occur in shared-memory relay operations
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),

    /// Shared memory segment open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Invalid segment name
    InvalidName(String),

    /// Segment not found
    NotFound(String),

    /// Segment exists but its header does not describe the expected layout
    BadHeader {
        name: String,
        reason: String,
    },

    /// Invalid ring geometry
    InvalidLayout(String),

    /// Text or payload does not fit the mailbox buffer
    TooLarge { size: usize, capacity: usize },

    /// Index outside a fixed-size array
    OutOfRange { index: usize, len: usize },
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::BadHeader { name, reason } => write!(f, "Bad segment header in {name}: {reason}"),
            Self::InvalidLayout(msg) => write!(f, "Invalid ring layout: {msg}"),
            Self::TooLarge { size, capacity } => {
                write!(f, "Payload too large: {size} bytes exceeds capacity {capacity}")
            }
            Self::OutOfRange { index, len } => {
                write!(f, "Index {index} out of range (len {len})")
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Common header written at the start of every relay segment.
#[repr(C)]
pub(crate) struct SegmentHeader {
    pub magic: u32,
    pub kind: u32,
    pub version: u32,
    pub reserved: u32,
}

impl SegmentHeader {
    pub(crate) fn init(&mut self, kind: SegmentKind) {
        self.kind = kind as u32;
        self.version = SEGMENT_VERSION;
        self.reserved = 0;
        // magic last: a reader seeing it sees a complete header
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        self.magic = SEGMENT_MAGIC;
    }

    pub(crate) fn check(&self, name: &str, kind: SegmentKind) -> Result<()> {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        let reason = if self.magic != SEGMENT_MAGIC {
            format!("magic 0x{:08x}", self.magic)
        } else if self.kind != kind as u32 {
            format!("kind {} (expected {})", self.kind, kind as u32)
        } else if self.version != SEGMENT_VERSION {
            format!("version {} (expected {})", self.version, SEGMENT_VERSION)
        } else {
            return Ok(());
        };
        Err(ShmError::BadHeader {
            name: name.to_string(),
            reason,
        })
    }
}

/// Size of the header prefix, padded to a cache line.
pub(crate) const HEADER_SPACE: usize = 64;

#[cfg(test)]
pub(crate) fn unique_name(tag: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!(
        "/svtdaq_test_{tag}_{}_{ts}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ShmError::TooLarge {
            size: 20000,
            capacity: 10240,
        };
        assert_eq!(
            e.to_string(),
            "Payload too large: 20000 bytes exceeds capacity 10240"
        );
    }

    #[test]
    fn test_header_check() {
        let mut hdr = SegmentHeader {
            magic: 0,
            kind: 0,
            version: 0,
            reserved: 0,
        };
        assert!(hdr.check("/x", SegmentKind::Control).is_err());
        hdr.init(SegmentKind::Control);
        assert!(hdr.check("/x", SegmentKind::Control).is_ok());
        assert!(matches!(
            hdr.check("/x", SegmentKind::Status),
            Err(ShmError::BadHeader { .. })
        ));
    }
}
