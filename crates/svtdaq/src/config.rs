// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Centralized configuration for svtdaq.
//!
//! Protocol constants, relay geometry and the runtime [`LinkConfig`]. Values
//! that must agree with the remote hardware or with the readout process live
//! here so they are not duplicated across modules.
//!
//! # Environment Variables
//!
//! `LinkConfig::from_env()` applies these overrides on top of the defaults:
//!
//! - `SVTDAQ_MAX_RX_TX=<words>` - maximum transfer unit in 32-bit words
//! - `SVTDAQ_TIMEOUT_US=<us>` - register/command transaction timeout
//! - `SVTDAQ_RCVBUF=<bytes>` - socket receive buffer size
//! - `SVTDAQ_DATA_MASK=<mask>` - data channel mask (decimal or `0x` hex)

use std::time::Duration;

// ============================================================================
// Wire Protocol
// ============================================================================

/// Start-of-frame flag in header byte 0.
pub const HEADER_SOF: u8 = 0x80;

/// End-of-frame flag in header byte 0.
pub const HEADER_EOF: u8 = 0x40;

/// Channel field mask in header byte 0 (bits 5:4).
pub const HEADER_CHANNEL_MASK: u8 = 0x30;

/// Size of the datagram mini-header in bytes.
pub const HEADER_LEN: usize = 2;

/// Largest value of the 12-bit count field.
pub const HEADER_COUNT_MAX: u16 = 0x0FFF;

/// Number of addressable channels.
pub const CHANNEL_COUNT: usize = 4;

/// Write flag in the second word of a register request.
pub const REG_WRITE_FLAG: u32 = 0x4000_0000;

/// Address bits carried in the second word of a register request.
pub const REG_ADDRESS_MASK: u32 = 0x00FF_FFFF;

/// Words added around the register payload (two header words + status).
pub const REG_OVERHEAD_WORDS: usize = 3;

// ============================================================================
// Link Engine Defaults
// ============================================================================

/// Default maximum transfer unit in 32-bit words.
pub const DEFAULT_MAX_RX_TX: usize = 4;

/// Default transaction timeout (register and command).
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_millis(1);

/// Default bound on `add_config`/`add_status` waiting for the data thread.
pub const DEFAULT_INJECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Depth of the bounded data queue between receive and data threads.
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;

/// Socket receive buffer requested from the kernel.
pub const DEFAULT_RECV_BUFFER: usize = 5_000_000;

/// Largest datagram (header included) transmitted by the UDP links.
pub const DEFAULT_MAX_DATAGRAM: usize = 8002;

/// Interval between checks of running flags and shared-memory counters.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Minimum interval between per-second data summaries in debug output.
pub const DATA_SUMMARY_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Shared-Memory Relay
// ============================================================================

/// Data ring segment name.
pub const DATA_RING_NAME: &str = "/svtdaq_data";

/// Command mailbox segment name.
pub const CONTROL_MAILBOX_NAME: &str = "/svtdaq_control";

/// Status mailbox segment name.
pub const STATUS_MAILBOX_NAME: &str = "/svtdaq_status";

/// Default ring slot count (power of two).
pub const RING_SLOT_COUNT: u32 = 512;

/// Default ring slot size in 32-bit words.
pub const RING_SLOT_WORDS: u32 = 8192;

/// Number of receive lists (one per socket/lane).
pub const RING_RX_LISTS: u32 = 8;

/// Command mailbox text capacity, terminator included.
pub const CONTROL_TEXT_SIZE: usize = 10240;

/// Number of `f64` values in the status mailbox.
pub const STATUS_VALUE_COUNT: usize = 128;

/// Trigger acknowledgment datagram sent on socket 0 in tracker mode.
pub const TRIGGER_ACK_FRAME: [u8; 18] = [
    0xC0, 0x08, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0,
];

// ============================================================================
// Run Control
// ============================================================================

/// Default number of software triggers per run.
pub const DEFAULT_RUN_COUNT: u32 = 1000;

/// Lower bound on the software trigger period.
pub const MIN_RUN_PERIOD: Duration = Duration::from_micros(1);

/// How long `SetRunState Running` waits for the timer thread to report.
pub const RUN_START_TIMEOUT: Duration = Duration::from_millis(100);

/// Runtime settings for a [`CommLink`](crate::link::CommLink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Maximum transfer unit in 32-bit words (register payload + 3).
    pub max_rx_tx: usize,
    /// Register/command transaction timeout.
    pub transaction_timeout: Duration,
    /// Bound on waiting for the data thread to take a config/status record.
    pub inject_timeout: Duration,
    /// Bounded data queue depth.
    pub queue_depth: usize,
    /// Kernel receive buffer in bytes.
    pub recv_buffer_bytes: usize,
    /// Largest transmitted datagram, header included.
    pub max_datagram_bytes: usize,
    /// Bit `n` set means channel `n` carries event data.
    pub data_mask: u32,
    /// Convert event data words from network order.
    pub data_order_fix: bool,
    /// Sleep between checks in polling loops.
    pub poll_interval: Duration,
    /// Amount the remote end adds to the header count field.
    ///
    /// Some firmware reports one more half-word than the datagram carries.
    pub rx_count_offset: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_rx_tx: DEFAULT_MAX_RX_TX,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            inject_timeout: DEFAULT_INJECT_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            recv_buffer_bytes: DEFAULT_RECV_BUFFER,
            max_datagram_bytes: DEFAULT_MAX_DATAGRAM,
            data_mask: 0,
            data_order_fix: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            rx_count_offset: 0,
        }
    }
}

impl LinkConfig {
    #[must_use]
    pub fn with_max_rx_tx(mut self, words: usize) -> Self {
        self.max_rx_tx = words;
        self
    }

    #[must_use]
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_inject_timeout(mut self, timeout: Duration) -> Self {
        self.inject_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    #[must_use]
    pub fn with_recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_max_datagram(mut self, bytes: usize) -> Self {
        self.max_datagram_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_data_mask(mut self, mask: u32) -> Self {
        self.data_mask = mask;
        self
    }

    #[must_use]
    pub fn with_data_order_fix(mut self, enable: bool) -> Self {
        self.data_order_fix = enable;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_rx_count_offset(mut self, offset: u16) -> Self {
        self.rx_count_offset = offset;
        self
    }

    /// Defaults with `SVTDAQ_*` environment overrides applied.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_number("SVTDAQ_MAX_RX_TX") {
            config.max_rx_tx = v as usize;
        }
        if let Some(v) = env_number("SVTDAQ_TIMEOUT_US") {
            config.transaction_timeout = Duration::from_micros(v);
        }
        if let Some(v) = env_number("SVTDAQ_RCVBUF") {
            config.recv_buffer_bytes = v as usize;
        }
        if let Some(v) = env_number("SVTDAQ_DATA_MASK") {
            config.data_mask = v as u32;
        }

        config
    }

    /// Largest payload a single transmitted datagram may carry.
    #[must_use]
    pub fn max_frame_payload(&self) -> usize {
        self.max_datagram_bytes.saturating_sub(HEADER_LEN)
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match parse_number(&raw) {
        Some(v) => Some(v),
        None => {
            log::warn!("[CONFIG] Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
#[must_use]
pub fn parse_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}
