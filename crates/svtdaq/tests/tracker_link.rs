// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters

//! Tracker link end-to-end: event data lands in the shared-memory ring and
//! consumer ack requests come back out as trigger-ack datagrams.

use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use svtdaq::config::TRIGGER_ACK_FRAME;
use svtdaq::shm::{DataRing, RingLayout, ShmSegment};
use svtdaq::transport::codec::{encode_frames, put_words_be, words_from_be, Reassembler};
use svtdaq::{CommLink, LinkConfig, Register, TrackerDriver};

fn unique_name(tag: &str) -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    format!(
        "/svtdaq_trk_{}_{}_{}_{}",
        tag,
        std::process::id(),
        ts,
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Echoes register writes and keeps every raw datagram it sees.
struct EchoBoard {
    socket: UdpSocket,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    raw: Arc<Mutex<Vec<Vec<u8>>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EchoBoard {
    fn spawn() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        socket
            .set_read_timeout(Some(Duration::from_millis(5)))
            .expect("timeout");
        let peer = Arc::new(Mutex::new(None));
        let raw = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let socket = socket.try_clone().expect("clone");
            let (peer, raw, stop) = (Arc::clone(&peer), Arc::clone(&raw), Arc::clone(&stop));
            thread::spawn(move || {
                let mut buf = [0u8; 9000];
                let mut reassembler = Reassembler::new(64 * 1024);
                while !stop.load(Ordering::Relaxed) {
                    let Ok((n, from)) = socket.recv_from(&mut buf) else {
                        continue;
                    };
                    *peer.lock() = Some(from);
                    raw.lock().push(buf[..n].to_vec());
                    let Ok(Some(msg)) = reassembler.push(&buf[..n]) else {
                        continue;
                    };
                    let mut words = words_from_be(&msg.payload);
                    if words.len() < 4 || words[1] & 0x4000_0000 == 0 {
                        continue;
                    }
                    let last = words.len() - 1;
                    words[last] = 0;
                    let mut payload = Vec::new();
                    put_words_be(&words, &mut payload);
                    for frame in encode_frames(msg.channel, &payload, 64) {
                        let _ = socket.send_to(&frame, from);
                    }
                }
            })
        };
        Self {
            socket,
            peer,
            raw,
            stop,
            handle: Some(handle),
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().expect("addr").port()
    }

    fn send_data(&self, channel: u8, words: &[u32]) {
        let peer = self.peer.lock().expect("peer known");
        let mut payload = Vec::new();
        put_words_be(words, &mut payload);
        for frame in encode_frames(channel, &payload, 64) {
            self.socket.send_to(&frame, peer).expect("send");
        }
    }
}

impl Drop for EchoBoard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_event_data_reaches_ring_consumer() {
    let board = EchoBoard::spawn();
    let name = unique_name("data");
    let layout = RingLayout {
        slot_count: 8,
        slot_words: 256,
        rx_lists: 1,
    };
    let ring = DataRing::create(&name, layout).expect("ring");
    let mut consumer = DataRing::open(&name).expect("consumer");
    consumer.set_listen_active(true);

    let config = LinkConfig::default()
        .with_max_rx_tx(256)
        .with_data_mask(0b1000)
        .with_transaction_timeout(Duration::from_millis(500));
    let link = CommLink::new(config.clone());
    link.open(TrackerDriver::connect(board.port(), &["127.0.0.1"], &config, ring).expect("connect"))
        .expect("open");

    // a register write teaches the board our address
    let mut reg = Register::new("Ctrl", 0x10, 1);
    link.queue_register(0, &mut reg, true, true).expect("write");
    assert!(!reg.stale());

    let event: Vec<u32> = (0..100).map(|i| 0xE000_0000 + i).collect();
    board.send_data(3, &event);

    let mut popped = None;
    wait_for("ring slot", || {
        popped = consumer.pop(0);
        popped.is_some()
    });
    let claim = popped.expect("claim");
    assert_eq!(consumer.words(&claim), 100);
    assert_eq!(consumer.read_words(&claim), event);
    consumer.release(claim);
    assert_eq!(link.counters().data_rx_count, 1);

    link.close();
    let _ = ShmSegment::unlink(&name);
}

#[test]
fn test_consumer_ack_request_sends_trigger_ack() {
    let board = EchoBoard::spawn();
    let name = unique_name("ack");
    let layout = RingLayout {
        slot_count: 4,
        slot_words: 64,
        rx_lists: 1,
    };
    let ring = DataRing::create(&name, layout).expect("ring");
    let mut consumer = DataRing::open(&name).expect("consumer");

    let config = LinkConfig::default().with_max_rx_tx(64);
    let link = CommLink::new(config.clone());
    link.open(TrackerDriver::connect(board.port(), &["127.0.0.1"], &config, ring).expect("connect"))
        .expect("open");

    consumer.request_ack();
    wait_for("trigger ack", || {
        board
            .raw
            .lock()
            .iter()
            .any(|d| d.as_slice() == TRIGGER_ACK_FRAME.as_slice())
    });
    wait_for("ack marked sent", || {
        let snap = consumer.snapshot();
        snap.ack_sent == snap.ack_request
    });

    link.close();
    let _ = ShmSegment::unlink(&name);
}

#[test]
fn test_full_ring_stalls_until_consumer_releases() {
    let board = EchoBoard::spawn();
    let name = unique_name("stall");
    let layout = RingLayout {
        slot_count: 4,
        slot_words: 64,
        rx_lists: 1,
    };
    let ring = DataRing::create(&name, layout).expect("ring");
    let mut consumer = DataRing::open(&name).expect("consumer");
    consumer.set_listen_active(true);

    let config = LinkConfig::default()
        .with_max_rx_tx(64)
        .with_data_mask(0b1000)
        .with_transaction_timeout(Duration::from_millis(500));
    let link = CommLink::new(config.clone());
    link.open(TrackerDriver::connect(board.port(), &["127.0.0.1"], &config, ring).expect("connect"))
        .expect("open");

    let mut reg = Register::new("Ctrl", 0x10, 1);
    link.queue_register(0, &mut reg, true, true).expect("write");

    let events: Vec<Vec<u32>> = (0..5u32)
        .map(|e| (0..20).map(|i| (e << 16) | i).collect())
        .collect();

    // four events fill every slot; the receiver is left without a claim
    for event in &events[..4] {
        board.send_data(3, event);
    }
    wait_for("ring full", || consumer.rx_count(0) == 4);
    assert_eq!(consumer.free_count(), 0);

    board.send_data(3, &events[4]);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(consumer.rx_count(0), 4, "received without a free slot");

    let first = consumer.pop(0).expect("first event");
    assert_eq!(consumer.read_words(&first), events[0]);
    consumer.release(first);

    wait_for("stalled event", || consumer.rx_count(0) == 4);
    for event in &events[1..] {
        let claim = consumer.pop(0).expect("queued event");
        assert_eq!(&consumer.read_words(&claim), event);
        consumer.release(claim);
    }
    assert!(consumer.pop(0).is_none());

    wait_for("data counter", || link.counters().data_rx_count == 5);
    assert_eq!(link.counters().data_drop_count, 0);

    link.close();
    let _ = ShmSegment::unlink(&name);
}
