// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data queue and fan-out.
//!
//! Receive paths push [`DataItem`]s into one bounded queue. The Data thread
//! drains it in order and hands each item to the sinks: the user callback,
//! then the monitor socket, then the capture file. Config/status snapshots
//! and run markers travel through the same queue so their position relative
//! to event data is preserved.

use super::driver::LinkShared;
use crate::capture::{CaptureWriter, RecordKind};
use crate::config::DATA_SUMMARY_INTERVAL;
use crate::shm::{RingPublisher, SlotClaim};
use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A record as seen by the sinks.
#[derive(Debug, Clone, Copy)]
pub struct DataRecord<'a> {
    pub kind: RecordKind,
    /// Payload in capture byte order.
    pub payload: &'a [u8],
}

impl DataRecord<'_> {
    /// Payload as 32-bit words (data records).
    pub fn words(&self) -> Vec<u32> {
        self.payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// User callback invoked on the Data thread.
pub type DataCallback = Box<dyn FnMut(&DataRecord<'_>) + Send>;

/// Unit of work for the Data thread.
pub enum DataItem {
    /// Event data words in host order.
    Words(Vec<u32>),
    /// Event data received straight into a ring slot.
    Slot { claim: SlotClaim, list: usize, words: u32 },
    /// Config/status snapshot or run marker; `done` is signalled once written.
    Record {
        kind: RecordKind,
        text: String,
        done: Sender<()>,
    },
}

/// Producer handle onto the bounded data queue.
#[derive(Clone)]
pub struct DataQueue {
    tx: Sender<DataItem>,
    shared: Arc<LinkShared>,
    poll_interval: Duration,
}

impl DataQueue {
    pub(crate) fn new(tx: Sender<DataItem>, shared: Arc<LinkShared>, poll_interval: Duration) -> Self {
        Self {
            tx,
            shared,
            poll_interval,
        }
    }

    /// Queue event words; a full queue drops them and counts the drop.
    pub fn push_words(&self, words: Vec<u32>) -> bool {
        match self.tx.try_send(DataItem::Words(words)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shared.counters.inc_data_drop();
                if self.shared.debug() {
                    log::warn!("[DATA] Queue full, dropping data item");
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue a filled ring slot, waiting for room while the link runs.
    pub fn push_slot(&self, claim: SlotClaim, list: usize, words: u32) -> bool {
        let mut item = DataItem::Slot { claim, list, words };
        loop {
            match self.tx.send_timeout(item, self.poll_interval) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) if self.shared.running() => item = back,
                Err(_) => return false,
            }
        }
    }
}

/// Outputs of the Data thread.
#[derive(Default)]
pub(crate) struct DataSinks {
    pub callback: Option<DataCallback>,
    pub net: Option<(UdpSocket, SocketAddr)>,
    pub file: Option<CaptureWriter<BufWriter<File>>>,
}

impl DataSinks {
    pub fn close_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                log::warn!("[DATA] Flushing capture file on close failed: {}", e);
            }
        }
    }

    fn dispatch(&mut self, record: &DataRecord<'_>, shared: &LinkShared) {
        if let Some(cb) = self.callback.as_mut() {
            cb(record);
        }

        if let Some((socket, target)) = &self.net {
            match record.kind.header(record.payload.len()) {
                Ok(header) => {
                    let sent = socket
                        .send_to(&header.to_le_bytes(), target)
                        .and_then(|_| socket.send_to(record.payload, target));
                    if let Err(e) = sent {
                        if shared.debug() {
                            log::debug!("[DATA] Monitor send to {} failed: {}", target, e);
                        }
                    }
                }
                Err(e) => log::warn!("[DATA] Not sending {} record: {}", record.kind, e),
            }
        }

        if let Some(file) = self.file.as_mut() {
            match file.write_record(record.kind, record.payload) {
                Ok(()) => {
                    if record.kind == RecordKind::Data {
                        shared.counters.inc_data_file();
                    } else if let Err(e) = file.flush() {
                        log::warn!("[DATA] Capture flush failed: {}", e);
                    }
                }
                Err(e) => log::error!("[DATA] Capture write failed: {}", e),
            }
        }
    }
}

/// Data thread body.
pub(crate) struct DataWorker {
    pub rx: Receiver<DataItem>,
    pub shared: Arc<LinkShared>,
    pub sinks: Arc<Mutex<DataSinks>>,
    pub ring: Option<RingPublisher>,
    pub poll_interval: Duration,
}

impl DataWorker {
    pub fn run(mut self) {
        let mut scratch: Vec<u8> = Vec::new();
        let mut summary_at = Instant::now();
        let mut items: u64 = 0;
        let mut bytes: u64 = 0;

        log::debug!("[DATA] Data thread started");
        loop {
            let item = match self.rx.recv_timeout(self.poll_interval) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => {
                    if !self.shared.running() {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match item {
                DataItem::Words(words) => {
                    scratch.clear();
                    scratch.reserve(words.len() * 4);
                    for w in &words {
                        scratch.extend_from_slice(&w.to_le_bytes());
                    }
                    self.deliver(RecordKind::Data, &scratch);
                    self.shared.counters.inc_data_rx();
                    items += 1;
                    bytes += scratch.len() as u64;
                }
                DataItem::Slot { claim, list, words } => {
                    self.deliver_slot(claim, list, words);
                    self.shared.counters.inc_data_rx();
                    items += 1;
                    bytes += u64::from(words) * 4;
                }
                DataItem::Record { kind, text, done } => {
                    self.deliver(kind, text.as_bytes());
                    let _ = done.send(());
                }
            }

            if self.shared.debug() && summary_at.elapsed() >= DATA_SUMMARY_INTERVAL {
                log::debug!("[DATA] {} items, {} bytes in the last {:?}", items, bytes, summary_at.elapsed());
                items = 0;
                bytes = 0;
                summary_at = Instant::now();
            }
        }

        // Leftover slots go back to the claimer; dropped records disconnect their waiters.
        while let Ok(item) = self.rx.try_recv() {
            if let DataItem::Slot { claim, .. } = item {
                if let Some(ring) = self.ring.as_ref() {
                    ring.recycle(claim);
                }
            }
        }
        // The capture file outlives the link; only close_data_file closes it.
        if let Some(file) = self.sinks.lock().file.as_mut() {
            if let Err(e) = file.flush() {
                log::warn!("[DATA] Capture flush on stop failed: {}", e);
            }
        }
        log::debug!("[DATA] Data thread stopped");
    }

    fn deliver(&self, kind: RecordKind, payload: &[u8]) {
        self.sinks.lock().dispatch(&DataRecord { kind, payload }, &self.shared);
    }

    fn deliver_slot(&mut self, claim: SlotClaim, list: usize, words: u32) {
        let Some(ring) = self.ring.as_mut() else {
            log::error!("[DATA] Slot item without a ring publisher");
            return;
        };
        {
            let payload = ring.contents(&claim, words);
            self.sinks
                .lock()
                .dispatch(&DataRecord { kind: RecordKind::Data, payload }, &self.shared);
        }
        if ring.listen_active() {
            if let Err(e) = ring.publish(claim, list, words) {
                log::warn!("[DATA] Publishing slot to list {} failed: {}", list, e);
            }
        } else {
            ring.recycle(claim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    #[test]
    fn test_push_words_counts_drops() {
        let shared = Arc::new(LinkShared::new(0));
        let (tx, rx) = bounded(1);
        let queue = DataQueue::new(tx, Arc::clone(&shared), Duration::from_micros(100));
        assert!(queue.push_words(vec![1]));
        assert!(!queue.push_words(vec![2]));
        assert_eq!(shared.counters.snapshot().data_drop_count, 1);
        assert!(matches!(rx.try_recv(), Ok(DataItem::Words(w)) if w == vec![1]));
    }

    #[test]
    fn test_worker_dispatches_in_order() {
        let shared = Arc::new(LinkShared::new(0));
        shared.set_running(true);
        let (tx, rx) = bounded(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sinks = Arc::new(Mutex::new(DataSinks::default()));
        {
            let seen = Arc::clone(&seen);
            sinks.lock().callback = Some(Box::new(move |rec: &DataRecord<'_>| {
                seen.lock().push((rec.kind, rec.payload.to_vec()));
            }));
        }

        let worker = DataWorker {
            rx,
            shared: Arc::clone(&shared),
            sinks,
            ring: None,
            poll_interval: Duration::from_millis(1),
        };
        let handle = std::thread::spawn(move || worker.run());

        let (done_tx, done_rx) = bounded(1);
        tx.send(DataItem::Record {
            kind: RecordKind::Config,
            text: "<config/>".into(),
            done: done_tx,
        })
        .expect("send");
        tx.send(DataItem::Words(vec![0x0403_0201])).expect("send");
        done_rx.recv_timeout(Duration::from_secs(2)).expect("record written");

        let deadline = Instant::now() + Duration::from_secs(2);
        while shared.counters.snapshot().data_rx_count == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        shared.set_running(false);
        drop(tx);
        handle.join().expect("data thread");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (RecordKind::Config, b"<config/>".to_vec()));
        assert_eq!(seen[1], (RecordKind::Data, vec![1, 2, 3, 4]));
    }
}
