// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status/telemetry mailbox: a fixed array of `f64` values published as a unit.

use super::mailbox::MailboxMap;
use super::{Result, SegmentKind, ShmError};
use crate::config::STATUS_VALUE_COUNT;
use std::sync::atomic::{AtomicU64, Ordering};

const PAYLOAD_BYTES: usize = STATUS_VALUE_COUNT * 8;

/// Counters and values of a status mailbox, for monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub ready: u32,
    pub ack: u32,
    pub values: Vec<f64>,
}

/// Entry points for the status mailbox.
pub struct StatusMailbox;

impl StatusMailbox {
    /// Create the mailbox; the creator publishes values.
    pub fn create_writer(name: &str) -> Result<StatusWriter> {
        Ok(StatusWriter {
            map: MailboxMap::create(name, SegmentKind::Status, PAYLOAD_BYTES)?,
        })
    }

    /// Attach to an existing mailbox as the polling reader.
    pub fn open_reader(name: &str) -> Result<StatusReader> {
        Ok(StatusReader {
            map: MailboxMap::open(name, SegmentKind::Status, PAYLOAD_BYTES)?,
        })
    }

    pub fn snapshot(name: &str) -> Result<StatusSnapshot> {
        let map = MailboxMap::open(name, SegmentKind::Status, PAYLOAD_BYTES)?;
        let c = map.counters();
        Ok(StatusSnapshot {
            ready: c.ready.load(Ordering::Acquire),
            ack: c.ack.load(Ordering::Acquire),
            values: (0..STATUS_VALUE_COUNT).map(|i| value(&map, i).load()).collect(),
        })
    }
}

struct Cell<'a>(&'a AtomicU64);

impl Cell<'_> {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

fn value(map: &MailboxMap, index: usize) -> Cell<'_> {
    // SAFETY: index < STATUS_VALUE_COUNT at every call site; the payload is
    // 64-byte aligned and holds STATUS_VALUE_COUNT 8-byte cells.
    Cell(unsafe { &*map.payload().add(index * 8).cast::<AtomicU64>() })
}

fn check(index: usize) -> Result<()> {
    if index < STATUS_VALUE_COUNT {
        Ok(())
    } else {
        Err(ShmError::OutOfRange {
            index,
            len: STATUS_VALUE_COUNT,
        })
    }
}

/// Writing side of the status mailbox.
pub struct StatusWriter {
    map: MailboxMap,
}

impl StatusWriter {
    pub fn set(&mut self, index: usize, v: f64) -> Result<()> {
        check(index)?;
        value(&self.map, index).store(v);
        Ok(())
    }

    /// Mark the current values as a new sample.
    pub fn publish(&mut self) {
        self.map.counters().ready.fetch_add(1, Ordering::Release);
    }

    /// Whether the last published sample has not been taken yet.
    pub fn is_pending(&self) -> bool {
        self.map.pending()
    }
}

/// Polling side of the status mailbox.
pub struct StatusReader {
    map: MailboxMap,
}

impl StatusReader {
    pub fn get(&self, index: usize) -> Result<f64> {
        check(index)?;
        Ok(value(&self.map, index).load())
    }

    pub fn pending(&self) -> bool {
        self.map.pending()
    }

    /// Copy out a newly published sample and ack it.
    pub fn take(&mut self) -> Option<Vec<f64>> {
        let c = self.map.counters();
        let ready = c.ready.load(Ordering::Acquire);
        if ready == c.ack.load(Ordering::Relaxed) {
            return None;
        }
        let values = (0..STATUS_VALUE_COUNT).map(|i| value(&self.map, i).load()).collect();
        c.ack.store(ready, Ordering::Release);
        Some(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{unique_name, ShmSegment};

    #[test]
    fn test_publish_and_take() {
        let name = unique_name("status");
        let mut writer = StatusMailbox::create_writer(&name).expect("create");
        let mut reader = StatusMailbox::open_reader(&name).expect("open");

        writer.set(0, 12.5).expect("set");
        writer.set(127, -3.0).expect("set");
        assert!(reader.take().is_none());

        writer.publish();
        assert!(writer.is_pending());
        let values = reader.take().expect("sample");
        assert_eq!(values.len(), STATUS_VALUE_COUNT);
        assert_eq!(values[0], 12.5);
        assert_eq!(values[127], -3.0);
        assert!(!writer.is_pending());
        assert!(reader.take().is_none());
        assert_eq!(reader.get(0).expect("get"), 12.5);

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_index_bounds() {
        let name = unique_name("status_oob");
        let mut writer = StatusMailbox::create_writer(&name).expect("create");
        assert!(matches!(
            writer.set(STATUS_VALUE_COUNT, 1.0),
            Err(ShmError::OutOfRange { .. })
        ));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let name = unique_name("status_kind");
        let _rx = crate::shm::ControlMailbox::create_receiver(&name).expect("create");
        assert!(matches!(
            StatusMailbox::open_reader(&name),
            Err(ShmError::BadHeader { .. })
        ));
        ShmSegment::unlink(&name).ok();
    }
}
