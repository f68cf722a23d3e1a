// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tracker link: the UDP link with zero-copy event data.
//!
//! Every socket keeps one claimed ring slot as its reassembly buffer.
//! Datagram bodies are scattered straight into that slot. A completed data
//! message hands the slot to the Data thread and the socket claims a fresh
//! one; a completed register response is decoded and the slot is reused.

use super::codec::{words_from_be, FrameAssembler};
use super::udp::{recv_scatter, rx_error, tx_loop, Endpoints, Received, WireState, RX_POLL_TIMEOUT};
use crate::config::{LinkConfig, TRIGGER_ACK_FRAME};
use crate::error::{Error, Result};
use crate::link::{DriverContext, DriverHandles, LinkDriver, LinkShared};
use crate::shm::{RingAcker, RingClaimer, RingHandles, SlotClaim};
use mio::{Events, Poll};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;

/// UDP transport feeding a shared-memory data ring.
pub struct TrackerDriver {
    endpoints: Endpoints,
    ring: RingHandles,
}

impl TrackerDriver {
    /// One socket per host; receive list `n` carries the data of `hosts[n]`.
    pub fn connect(port: u16, hosts: &[&str], config: &LinkConfig, ring: RingHandles) -> Result<Self> {
        let lists = ring.claimer.layout().rx_lists as usize;
        if hosts.len() > lists {
            return Err(Error::InvalidArgument(format!(
                "{} hosts but the data ring has {} receive lists",
                hosts.len(),
                lists
            )));
        }
        Ok(Self {
            endpoints: Endpoints::connect(port, hosts, config)?,
            ring,
        })
    }
}

impl LinkDriver for TrackerDriver {
    fn name(&self) -> &'static str {
        "tracker"
    }

    fn start(self, ctx: DriverContext) -> Result<DriverHandles> {
        let poll = Poll::new()?;
        self.endpoints.register(&poll)?;

        let RingHandles {
            claimer,
            publisher,
            acker,
        } = self.ring;
        let endpoints = Arc::new(self.endpoints);
        let wire = Arc::new(WireState::default());
        let ctx = Arc::new(ctx);

        let rx = {
            let (endpoints, wire, ctx) = (Arc::clone(&endpoints), Arc::clone(&wire), Arc::clone(&ctx));
            thread::Builder::new()
                .name("svtdaq-tracker-rx".to_string())
                .spawn(move || rx_loop(poll, claimer, &endpoints, &wire, &ctx))?
        };
        let tx = thread::Builder::new()
            .name("svtdaq-tracker-tx".to_string())
            .spawn(move || {
                let mut acker = acker;
                tx_loop(&endpoints, &wire, &ctx, |endpoints, shared| service_ack(&mut acker, endpoints, shared));
            })?;

        Ok(DriverHandles {
            threads: vec![tx, rx],
            ring: Some(publisher),
        })
    }
}

fn service_ack(acker: &mut RingAcker, endpoints: &Endpoints, shared: &LinkShared) {
    if acker.ack_pending() {
        endpoints.send_raw(0, &TRIGGER_ACK_FRAME, shared);
        acker.mark_ack_sent();
        if shared.debug() {
            log::debug!("[TRACKER] Trigger ack sent");
        }
    }
}

struct SocketState {
    assembler: FrameAssembler,
    claim: Option<SlotClaim>,
}

fn rx_loop(mut poll: Poll, mut claimer: RingClaimer, endpoints: &Endpoints, wire: &WireState, ctx: &DriverContext) {
    let shared = &ctx.shared;
    let capacity = claimer.layout().slot_bytes().min(ctx.config.max_rx_tx * 4);
    let mut sockets: Vec<SocketState> = (0..endpoints.len())
        .map(|_| SocketState {
            assembler: FrameAssembler::new(ctx.config.rx_count_offset),
            claim: None,
        })
        .collect();
    let mut events = Events::with_capacity(endpoints.len().max(1));
    let mut stalled = false;

    while shared.running() {
        // Every socket needs a slot before it may read.
        let mut starved = false;
        for state in sockets.iter_mut().filter(|s| s.claim.is_none()) {
            state.claim = claimer.claim();
            starved |= state.claim.is_none();
        }
        if starved {
            if !stalled {
                log::warn!("[TRACKER] No free ring slot, waiting for the consumer");
                stalled = true;
            }
            thread::sleep(ctx.config.poll_interval);
            continue;
        }
        if stalled {
            log::info!("[TRACKER] Ring slots available again");
            stalled = false;
        }

        if let Err(e) = poll.poll(&mut events, Some(RX_POLL_TIMEOUT)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::error!("[TRACKER] Poll failed: {}", e);
                thread::sleep(ctx.config.poll_interval);
            }
            continue;
        }

        for (index, socket) in endpoints.sockets.iter().enumerate() {
            drain_socket(index, socket.as_raw_fd(), &mut sockets[index], &mut claimer, capacity, wire, ctx);
        }
    }

    // Claims still held go back with the segment; nothing was published from them.
    log::debug!("[TRACKER] Receive thread stopped");
}

fn drain_socket(
    index: usize,
    fd: std::os::unix::io::RawFd,
    state: &mut SocketState,
    claimer: &mut RingClaimer,
    capacity: usize,
    wire: &WireState,
    ctx: &DriverContext,
) {
    let shared = &ctx.shared;
    loop {
        let Some(claim) = state.claim.as_ref() else {
            return;
        };
        let fill = state.assembler.fill();
        let buffer = &mut claimer.buffer_mut(claim)[..capacity];
        let received = match recv_scatter(fd, &mut buffer[fill..]) {
            Ok(r) => r,
            Err(e) => {
                rx_error(shared, index, &e);
                return;
            }
        };
        let done = match received {
            Received::Empty => return,
            Received::Runt(n) => {
                state.assembler.reset();
                rx_error(shared, index, &format_args!("runt datagram of {} bytes", n));
                continue;
            }
            Received::Datagram {
                header,
                body_len,
                truncated,
            } => match state.assembler.accept(header, body_len, truncated, capacity) {
                Ok(Some(done)) => done,
                Ok(None) => continue,
                Err(e) => {
                    rx_error(shared, index, &e);
                    continue;
                }
            },
        };

        let bytes = &mut buffer[..done.len];
        if shared.is_data_channel(done.channel) {
            if ctx.config.data_order_fix {
                swap_to_native(bytes);
            }
            let words = (done.len / 4) as u32;
            if let Some(claim) = state.claim.take() {
                if !ctx.data.push_slot(claim, index, words) {
                    return;
                }
            }
            state.claim = claimer.claim();
        } else {
            wire.handle_response(index, &words_from_be(bytes), shared);
        }
    }
}

/// Convert big-endian words to host order in place.
fn swap_to_native(bytes: &mut [u8]) {
    for chunk in bytes.chunks_exact_mut(4) {
        let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{unique_name, DataRing, RingLayout, ShmSegment};

    #[test]
    fn test_swap_to_native() {
        let mut bytes = [0x12, 0x34, 0x56, 0x78, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        swap_to_native(&mut bytes);
        assert_eq!(&bytes[..4], &0x1234_5678u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &0xAABB_CCDDu32.to_ne_bytes());
        assert_eq!(bytes[8], 0xEE);
    }

    #[test]
    fn test_connect_checks_list_count() {
        let name = unique_name("trk_lists");
        let layout = RingLayout {
            slot_count: 4,
            slot_words: 16,
            rx_lists: 1,
        };
        let ring = DataRing::create(&name, layout).expect("create");
        let result = TrackerDriver::connect(8192, &["127.0.0.1", "127.0.0.1"], &LinkConfig::default(), ring);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let _ = ShmSegment::unlink(&name);
    }
}
