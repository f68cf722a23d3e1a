// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link health counters.
//!
//! Each counter has one writing thread; readers load without locking.
//!
//! - `data_file_count`: data records written to the capture file
//! - `data_rx_count`: data items taken by the Data thread
//! - `reg_rx_count`: register responses applied
//! - `timeout_count`: register/command transactions that timed out
//! - `error_count`: framing and receive errors
//! - `unexpected_count`: responses matching no outstanding request
//! - `data_drop_count`: data items dropped on a full queue

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LinkCounters {
    pub data_file_count: AtomicU64,
    pub data_rx_count: AtomicU64,
    pub reg_rx_count: AtomicU64,
    pub timeout_count: AtomicU64,
    pub error_count: AtomicU64,
    pub unexpected_count: AtomicU64,
    pub data_drop_count: AtomicU64,
}

impl LinkCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data_file_count: AtomicU64::new(0),
            data_rx_count: AtomicU64::new(0),
            reg_rx_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            unexpected_count: AtomicU64::new(0),
            data_drop_count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_data_file(&self) {
        self.data_file_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_data_rx(&self) {
        self.data_rx_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reg_rx(&self) {
        self.reg_rx_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_timeout(&self) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unexpected(&self) {
        self.unexpected_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_data_drop(&self) {
        self.data_drop_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter.
    pub fn clear(&self) {
        for c in [
            &self.data_file_count,
            &self.data_rx_count,
            &self.reg_rx_count,
            &self.timeout_count,
            &self.error_count,
            &self.unexpected_count,
            &self.data_drop_count,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LinkCountersSnapshot {
        LinkCountersSnapshot {
            data_file_count: self.data_file_count.load(Ordering::Relaxed),
            data_rx_count: self.data_rx_count.load(Ordering::Relaxed),
            reg_rx_count: self.reg_rx_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            unexpected_count: self.unexpected_count.load(Ordering::Relaxed),
            data_drop_count: self.data_drop_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LinkCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCountersSnapshot {
    pub data_file_count: u64,
    pub data_rx_count: u64,
    pub reg_rx_count: u64,
    pub timeout_count: u64,
    pub error_count: u64,
    pub unexpected_count: u64,
    pub data_drop_count: u64,
}

impl std::fmt::Display for LinkCountersSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "file={} rx={} reg={} timeout={} error={} unexpected={} drop={}",
            self.data_file_count,
            self.data_rx_count,
            self.reg_rx_count,
            self.timeout_count,
            self.error_count,
            self.unexpected_count,
            self.data_drop_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_snapshot_clear() {
        let c = LinkCounters::new();
        c.inc_timeout();
        c.inc_timeout();
        c.inc_error();
        c.inc_data_drop();
        let snap = c.snapshot();
        assert_eq!(snap.timeout_count, 2);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.data_drop_count, 1);
        assert_eq!(snap.reg_rx_count, 0);

        c.clear();
        assert_eq!(c.snapshot(), LinkCountersSnapshot::default());
    }

    #[test]
    fn test_display() {
        let snap = LinkCountersSnapshot {
            reg_rx_count: 3,
            ..Default::default()
        };
        assert!(snap.to_string().contains("reg=3"));
    }
}
