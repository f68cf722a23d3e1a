// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP link: one socket per remote host, a transmit thread and a receive
//! thread.
//!
//! The destination id of a request selects the socket. The receive thread
//! waits on all sockets through one `mio::Poll`, scatters each datagram into
//! a 2-byte header and the tail of that socket's reassembly buffer, and
//! classifies completed messages by channel: data channels go to the data
//! queue, everything else is matched against the register request on the
//! wire.

use super::codec::{encode_frames, put_words_be, words_from_be, words_from_ne, FrameAssembler, FrameHeader};
use super::message::InFlight;
use crate::config::{LinkConfig, HEADER_LEN};
use crate::error::{Error, Result};
use crate::link::{DriverContext, DriverHandles, LinkDriver, LinkShared, Outgoing, TxCursor};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on one receive-thread wait.
pub(crate) const RX_POLL_TIMEOUT: Duration = Duration::from_micros(500);

// ============================================================================
// Sockets
// ============================================================================

/// Sockets and remote addresses, indexed by destination id.
pub(crate) struct Endpoints {
    pub sockets: Vec<UdpSocket>,
    pub targets: Vec<SocketAddr>,
}

impl Endpoints {
    /// Open one non-blocking socket per host, all talking to `port`.
    pub fn connect(port: u16, hosts: &[&str], config: &LinkConfig) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::InvalidArgument("at least one host is required".into()));
        }
        let mut sockets = Vec::with_capacity(hosts.len());
        let mut targets = Vec::with_capacity(hosts.len());
        for host in hosts {
            let target = resolve(host, port)?;
            sockets.push(open_socket(config.recv_buffer_bytes).map_err(|e| Error::Transport(format!("socket for {}", host), e))?);
            targets.push(target);
            log::debug!("[UDP] Destination {} -> {}", targets.len() - 1, target);
        }
        Ok(Self { sockets, targets })
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Register every socket with `poll`, token = destination id.
    pub fn register(&self, poll: &Poll) -> io::Result<()> {
        for (i, socket) in self.sockets.iter().enumerate() {
            let fd = socket.as_raw_fd();
            poll.registry().register(&mut SourceFd(&fd), Token(i), Interest::READABLE)?;
        }
        Ok(())
    }

    /// Frame `words` big-endian on `channel` and send them to `dest`.
    pub fn send_words(&self, dest: usize, channel: u8, words: &[u32], config: &LinkConfig, shared: &LinkShared) {
        let mut payload = Vec::with_capacity(words.len() * 4);
        put_words_be(words, &mut payload);
        self.send_frames(dest, channel, &payload, config, shared);
    }

    pub fn send_frames(&self, dest: usize, channel: u8, payload: &[u8], config: &LinkConfig, shared: &LinkShared) {
        let (Some(socket), Some(target)) = (self.sockets.get(dest), self.targets.get(dest)) else {
            log::warn!("[UDP] No socket for destination {} ({} configured)", dest, self.len());
            return;
        };
        for frame in encode_frames(channel, payload, config.max_datagram_bytes) {
            self.send_raw_to(socket, target, &frame, shared);
        }
    }

    /// Send a prebuilt datagram on socket `dest`.
    pub fn send_raw(&self, dest: usize, datagram: &[u8], shared: &LinkShared) {
        if let (Some(socket), Some(target)) = (self.sockets.get(dest), self.targets.get(dest)) {
            self.send_raw_to(socket, target, datagram, shared);
        }
    }

    fn send_raw_to(&self, socket: &UdpSocket, target: &SocketAddr, datagram: &[u8], shared: &LinkShared) {
        if let Err(e) = socket.send_to(datagram, target) {
            log::warn!("[UDP] Send to {} failed: {}", target, e);
            shared.counters.inc_error();
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Transport(format!("resolve {}:{}", host, port), e))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::InvalidArgument(format!("no IPv4 address for {}", host)))
}

fn open_socket(recv_buffer: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(recv_buffer)?;
    let actual = socket.recv_buffer_size()?;
    if actual < recv_buffer {
        log::warn!("[UDP] Receive buffer: wanted {} bytes, got {}", recv_buffer, actual);
    }
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

// ============================================================================
// Scatter receive
// ============================================================================

/// Outcome of one non-blocking scatter receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// Nothing queued on the socket.
    Empty,
    /// A datagram shorter than the mini-header.
    Runt(usize),
    /// Header plus `body_len` bytes stored at the start of the body buffer.
    Datagram {
        header: FrameHeader,
        body_len: usize,
        truncated: bool,
    },
}

/// Receive one datagram: the header into a local array, the rest into `body`.
pub(crate) fn recv_scatter(fd: RawFd, body: &mut [u8]) -> io::Result<Received> {
    let mut head = [0u8; HEADER_LEN];
    let mut iov = [
        libc::iovec {
            iov_base: head.as_mut_ptr().cast(),
            iov_len: head.len(),
        },
        libc::iovec {
            iov_base: body.as_mut_ptr().cast(),
            iov_len: body.len(),
        },
    ];
    // SAFETY: an all-zero msghdr is valid (no name, no control data).
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;

    // SAFETY: both iovecs point at live, writable buffers of the given length.
    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(Received::Empty),
            io::ErrorKind::Interrupted => Ok(Received::Empty),
            _ => Err(err),
        };
    }
    let n = n as usize;
    if n < HEADER_LEN {
        return Ok(Received::Runt(n));
    }
    Ok(Received::Datagram {
        header: FrameHeader::decode(head),
        body_len: n - HEADER_LEN,
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
    })
}

// ============================================================================
// Register correlation
// ============================================================================

/// The register request last put on the wire, and the socket it went to.
#[derive(Default)]
pub(crate) struct WireState {
    flight: Mutex<Option<(usize, InFlight)>>,
}

impl WireState {
    pub fn record(&self, dest: usize, flight: InFlight) {
        *self.flight.lock() = Some((dest, flight));
    }

    /// Match a response message received on socket `socket`.
    pub fn handle_response(&self, socket: usize, words: &[u32], shared: &LinkShared) {
        let matched = {
            let mut slot = self.flight.lock();
            let hit = match *slot {
                Some((dest, flight)) if dest == socket => flight.match_response(words).map(|r| (flight.seq, r)),
                _ => None,
            };
            if hit.is_some() {
                *slot = None;
            }
            hit
        };

        if let Some((seq, resp)) = matched {
            if shared.registers.complete(seq, resp) {
                return;
            }
        }

        shared.counters.inc_unexpected();
        if shared.debug() {
            let expected = self.flight.lock().as_ref().map(|(_, f)| f.correlation);
            log::debug!(
                "[UDP] Unexpected frame on socket {}: words={:08x?} expected={:08x?} len={}",
                socket,
                &words[..words.len().min(2)],
                expected,
                words.len()
            );
        }
    }
}

/// Count and log a receive-side framing or socket error.
pub(crate) fn rx_error(shared: &LinkShared, socket: usize, what: &dyn std::fmt::Display) {
    shared.counters.inc_error();
    log::warn!("[UDP] Socket {}: {}", socket, what);
}

// ============================================================================
// Transmit loop
// ============================================================================

/// Transmit requests until the link stops; `idle` runs once per iteration.
pub(crate) fn tx_loop(
    endpoints: &Endpoints,
    wire: &WireState,
    ctx: &DriverContext,
    mut idle: impl FnMut(&Endpoints, &LinkShared),
) {
    let shared = &ctx.shared;
    let config = &ctx.config;
    let mut cursor = TxCursor::new();

    while shared.running() {
        idle(endpoints, shared);
        for out in cursor.take(shared) {
            match out {
                Outgoing::Run(req) => {
                    endpoints.send_words(req.dest, req.channel(), &req.words(), config, shared);
                }
                Outgoing::Register { seq, request } => {
                    wire.record(request.dest, request.in_flight(seq));
                    endpoints.send_words(request.dest, request.channel(), &request.words(), config, shared);
                }
                Outgoing::Command { seq, request } => {
                    endpoints.send_words(request.dest, request.channel(), &request.words(), config, shared);
                    shared.commands.complete(seq, ());
                }
            }
        }
        cursor.wait(shared, config.poll_interval);
    }
}

// ============================================================================
// UDP driver
// ============================================================================

/// Plain UDP transport; data messages are copied into the data queue.
pub struct UdpDriver {
    endpoints: Endpoints,
}

impl UdpDriver {
    /// Create one socket per host; destination id `n` is `hosts[n]`.
    pub fn connect(port: u16, hosts: &[&str], config: &LinkConfig) -> Result<Self> {
        Ok(Self {
            endpoints: Endpoints::connect(port, hosts, config)?,
        })
    }

    /// Local address of destination `dest`'s socket.
    pub fn local_addr(&self, dest: usize) -> Option<SocketAddr> {
        self.endpoints.sockets.get(dest).and_then(|s| s.local_addr().ok())
    }
}

impl LinkDriver for UdpDriver {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn start(self, ctx: DriverContext) -> Result<DriverHandles> {
        let poll = Poll::new()?;
        self.endpoints.register(&poll)?;

        let endpoints = Arc::new(self.endpoints);
        let wire = Arc::new(WireState::default());
        let ctx = Arc::new(ctx);

        let rx = {
            let (endpoints, wire, ctx) = (Arc::clone(&endpoints), Arc::clone(&wire), Arc::clone(&ctx));
            thread::Builder::new()
                .name("svtdaq-udp-rx".to_string())
                .spawn(move || rx_loop(poll, &endpoints, &wire, &ctx))?
        };
        let tx = thread::Builder::new()
            .name("svtdaq-udp-tx".to_string())
            .spawn(move || tx_loop(&endpoints, &wire, &ctx, |_, _| {}))?;

        Ok(DriverHandles {
            threads: vec![tx, rx],
            ring: None,
        })
    }
}

struct RxBuffer {
    assembler: FrameAssembler,
    bytes: Vec<u8>,
}

fn rx_loop(mut poll: Poll, endpoints: &Endpoints, wire: &WireState, ctx: &DriverContext) {
    let shared = &ctx.shared;
    let capacity = ctx.config.max_rx_tx * 4;
    let mut buffers: Vec<RxBuffer> = (0..endpoints.len())
        .map(|_| RxBuffer {
            assembler: FrameAssembler::new(ctx.config.rx_count_offset),
            bytes: vec![0u8; capacity],
        })
        .collect();
    let mut events = Events::with_capacity(endpoints.len().max(1));

    while shared.running() {
        if let Err(e) = poll.poll(&mut events, Some(RX_POLL_TIMEOUT)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::error!("[UDP] Poll failed: {}", e);
                thread::sleep(ctx.config.poll_interval);
            }
            continue;
        }

        // Drain every socket: mio readiness is edge-triggered.
        for (index, socket) in endpoints.sockets.iter().enumerate() {
            let buf = &mut buffers[index];
            loop {
                let fill = buf.assembler.fill();
                let received = match recv_scatter(socket.as_raw_fd(), &mut buf.bytes[fill..]) {
                    Ok(r) => r,
                    Err(e) => {
                        rx_error(shared, index, &e);
                        break;
                    }
                };
                match received {
                    Received::Empty => break,
                    Received::Runt(n) => {
                        buf.assembler.reset();
                        rx_error(shared, index, &format_args!("runt datagram of {} bytes", n));
                    }
                    Received::Datagram {
                        header,
                        body_len,
                        truncated,
                    } => match buf.assembler.accept(header, body_len, truncated, capacity) {
                        Ok(Some(done)) => {
                            dispatch(index, done.channel, &buf.bytes[..done.len], wire, ctx);
                        }
                        Ok(None) => {}
                        Err(e) => rx_error(shared, index, &e),
                    },
                }
            }
        }
    }
    log::debug!("[UDP] Receive thread stopped");
}

fn dispatch(socket: usize, channel: u8, bytes: &[u8], wire: &WireState, ctx: &DriverContext) {
    let shared = &ctx.shared;
    if shared.is_data_channel(channel) {
        let words = if ctx.config.data_order_fix {
            words_from_be(bytes)
        } else {
            words_from_ne(bytes)
        };
        ctx.data.push_words(words);
    } else {
        wire.handle_response(socket, &words_from_be(bytes), shared);
    }
}
