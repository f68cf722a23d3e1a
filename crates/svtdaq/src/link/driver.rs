// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Seam between the link engine and a transport.
//!
//! The engine owns a [`LinkShared`] block (slots, flags, counters). A
//! [`LinkDriver`] starts the transport threads against it and hands back their
//! join handles. Drivers walk the slots with a [`TxCursor`], which yields at
//! most one run, one register and one command request per iteration, in that
//! order.

use super::counters::LinkCounters;
use super::data::DataQueue;
use super::slot::{RunSlot, TransactionSlot, WorkSignal};
use crate::config::LinkConfig;
use crate::error::Result;
use crate::shm::RingPublisher;
use crate::transport::message::{CommandRequest, RegisterRequest, RegisterResponse};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// State shared between callers, the transport threads and the Data thread.
pub struct LinkShared {
    running: AtomicBool,
    debug: AtomicBool,
    data_mask: AtomicU32,
    warned_channels: AtomicU32,
    pub(crate) registers: TransactionSlot<RegisterRequest, RegisterResponse>,
    pub(crate) commands: TransactionSlot<CommandRequest, ()>,
    pub(crate) run: RunSlot,
    pub(crate) work: WorkSignal,
    pub counters: LinkCounters,
}

impl LinkShared {
    pub(crate) fn new(data_mask: u32) -> Self {
        Self {
            running: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            data_mask: AtomicU32::new(data_mask),
            warned_channels: AtomicU32::new(0),
            registers: TransactionSlot::new(),
            commands: TransactionSlot::new(),
            run: RunSlot::new(),
            work: WorkSignal::new(),
            counters: LinkCounters::new(),
        }
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
        self.work.raise();
    }

    #[inline]
    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub(crate) fn set_debug(&self, enable: bool) {
        self.debug.store(enable, Ordering::Relaxed);
    }

    #[inline]
    pub fn data_mask(&self) -> u32 {
        self.data_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn set_data_mask(&self, mask: u32) {
        self.data_mask.store(mask, Ordering::Relaxed);
        self.warned_channels.store(0, Ordering::Relaxed);
    }

    /// Whether messages on `channel` are event data.
    #[inline]
    pub fn is_data_channel(&self, channel: u8) -> bool {
        self.data_mask() & (1 << channel) != 0
    }

    /// Warn once per channel when register traffic uses a data channel.
    pub(crate) fn check_overlap(&self, channel: u8) {
        if !self.is_data_channel(channel) {
            return;
        }
        let bit = 1 << channel;
        if self.warned_channels.fetch_or(bit, Ordering::Relaxed) & bit == 0 {
            log::warn!(
                "[LINK] Data mask 0x{:x} covers register channel {}; responses will be misclassified",
                self.data_mask(),
                channel
            );
        }
    }
}

/// One request taken from the slots for transmission.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Run(CommandRequest),
    Register { seq: u64, request: RegisterRequest },
    Command { seq: u64, request: CommandRequest },
}

/// Per-thread record of the last request seen in each slot.
#[derive(Debug, Default)]
pub struct TxCursor {
    run: u64,
    register: u64,
    command: u64,
    work: u64,
}

impl TxCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// New requests since the last call, in transmit priority order.
    ///
    /// One pass may return a run, a register and a command together.
    pub fn take(&mut self, shared: &LinkShared) -> Vec<Outgoing> {
        let mut out = Vec::new();
        if let Some(req) = shared.run.next_request(&mut self.run) {
            out.push(Outgoing::Run(req));
        }
        if let Some((seq, request)) = shared.registers.next_request(&mut self.register) {
            out.push(Outgoing::Register { seq, request });
        }
        if let Some((seq, request)) = shared.commands.next_request(&mut self.command) {
            out.push(Outgoing::Command { seq, request });
        }
        out
    }

    /// Sleep until a request is posted or `timeout` passes.
    pub fn wait(&mut self, shared: &LinkShared, timeout: Duration) {
        shared.work.wait(&mut self.work, timeout);
    }
}

/// Everything a driver needs to run.
pub struct DriverContext {
    pub shared: Arc<LinkShared>,
    pub config: LinkConfig,
    pub data: DataQueue,
}

/// Threads started by a driver.
#[derive(Default)]
pub struct DriverHandles {
    pub threads: Vec<JoinHandle<()>>,
    /// Publisher for ring slots referenced by queued data items.
    pub ring: Option<RingPublisher>,
}

/// A transport the link engine can run over.
pub trait LinkDriver: Send {
    fn name(&self) -> &'static str;

    /// Spawn the transport threads. They must exit once
    /// [`LinkShared::running`] turns false.
    fn start(self, ctx: DriverContext) -> Result<DriverHandles>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, Register};

    #[test]
    fn test_cursor_priority_order() {
        let shared = LinkShared::new(0);
        let reg = Register::new("r", 0x10, 1);
        shared.commands.post(CommandRequest::new(0, &Command::new("Reset", 0x1)));
        shared.registers.post(RegisterRequest::new(0, &reg, false));
        shared.run.set(0, Some(&Command::new("Trigger", 0x2)));
        shared.run.queue();

        let mut cursor = TxCursor::new();
        let out = cursor.take(&shared);
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0], Outgoing::Run(_)));
        assert!(matches!(out[1], Outgoing::Register { seq: 1, .. }));
        assert!(matches!(out[2], Outgoing::Command { seq: 1, .. }));
        assert!(cursor.take(&shared).is_empty());
    }

    #[test]
    fn test_data_channel_mask() {
        let shared = LinkShared::new(0b0100);
        assert!(shared.is_data_channel(2));
        assert!(!shared.is_data_channel(0));
        shared.set_data_mask(0b0001);
        assert!(shared.is_data_channel(0));
        shared.check_overlap(0);
        shared.check_overlap(0);
        assert_eq!(shared.warned_channels.load(Ordering::Relaxed), 1);
    }
}
