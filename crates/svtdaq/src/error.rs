// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type.
//!
//! Errors returned from blocking calls (transaction timeout, oversize request,
//! transport open failure) surface here. Framing errors and unmatched
//! responses never do: worker threads count them and keep running.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::capture::CaptureError;
use crate::shm::ShmError;

/// Errors produced by the link engine, relay and orchestrator.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Transaction Errors
    // ========================================================================
    /// No matching response arrived before the deadline.
    Timeout {
        /// What was being waited for ("register 0x00000010", "command Reset", ...)
        what: String,
        /// Deadline that expired.
        after: Duration,
    },
    /// Request does not fit the configured maximum transfer unit.
    Oversize {
        /// Words the request would need on the wire.
        words: usize,
        /// Configured limit in words.
        max: usize,
    },

    // ========================================================================
    // State Errors
    // ========================================================================
    /// Operation requires a closed link.
    LinkOpen,
    /// Operation requires an open link.
    LinkClosed,
    /// Invalid argument supplied by the caller.
    InvalidArgument(String),
    /// Invalid configuration value.
    Config(String),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Socket creation, bind or address resolution failed while opening a link.
    Transport(String, io::Error),
    /// I/O error with underlying cause.
    Io(io::Error),

    // ========================================================================
    // Subsystem Errors
    // ========================================================================
    /// Shared memory relay failure.
    Shm(ShmError),
    /// Capture file format failure.
    Capture(CaptureError),
    /// Malformed XML envelope or document.
    Xml(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout { what, after } => {
                write!(f, "Timeout waiting for {} after {:?}", what, after)
            }
            Error::Oversize { words, max } => {
                write!(f, "Request of {} words exceeds max transfer {} words", words, max)
            }
            Error::LinkOpen => write!(f, "Link is open"),
            Error::LinkClosed => write!(f, "Link is not open"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Transport(ctx, e) => write!(f, "Transport open failed ({}): {}", ctx, e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Shm(e) => write!(f, "Shared memory error: {}", e),
            Error::Capture(e) => write!(f, "Capture error: {}", e),
            Error::Xml(msg) => write!(f, "XML error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(_, e) | Error::Io(e) => Some(e),
            Error::Shm(e) => Some(e),
            Error::Capture(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Error::Shm(e)
    }
}

impl From<CaptureError> for Error {
    fn from(e: CaptureError) -> Self {
        Error::Capture(e)
    }
}

impl From<roxmltree::Error> for Error {
    fn from(e: roxmltree::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_timeout() {
        let e = Error::Timeout {
            what: "register 0x00000010".into(),
            after: Duration::from_millis(1),
        };
        assert_eq!(
            e.to_string(),
            "Timeout waiting for register 0x00000010 after 1ms"
        );
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error as _;
        let e = Error::Transport(
            "bind 0.0.0.0:8192".into(),
            io::Error::new(io::ErrorKind::AddrInUse, "busy"),
        );
        assert!(e.source().is_some());
        assert!(Error::LinkOpen.source().is_none());
    }
}
