// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The link engine.
//!
//! [`CommLink`] turns register, command and run requests into transactions
//! on whatever transport [`LinkDriver`] it was opened with, and owns the Data
//! thread that fans received data out to the sinks.

use super::counters::LinkCountersSnapshot;
use super::data::{DataCallback, DataItem, DataQueue, DataSinks, DataWorker};
use super::driver::{DriverContext, LinkDriver, LinkShared};
use crate::capture::{CaptureWriter, RecordKind};
use crate::config::{LinkConfig, REG_OVERHEAD_WORDS};
use crate::device::{Command, Register, STATUS_FAILED};
use crate::error::{Error, Result};
use crate::transport::message::{CommandRequest, RegisterRequest};
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::net::{ToSocketAddrs, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Run boundary marker written into the data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMarker {
    Start,
    Stop,
}

impl RunMarker {
    fn kind(self) -> RecordKind {
        match self {
            RunMarker::Start => RecordKind::RunStart,
            RunMarker::Stop => RecordKind::RunStop,
        }
    }
}

struct LinkState {
    config: LinkConfig,
    threads: Vec<JoinHandle<()>>,
    data_tx: Option<Sender<DataItem>>,
    driver: &'static str,
}

/// Transport-agnostic request/response engine.
///
/// All methods take `&self`; share the link through an `Arc`.
///
/// # Example
///
/// ```no_run
/// use svtdaq::{CommLink, LinkConfig, LoopbackDriver, Register};
///
/// let link = CommLink::new(LinkConfig::default());
/// link.open(LoopbackDriver::new())?;
/// let mut reg = Register::new("Control", 0x0000_0010, 1);
/// link.queue_register(0, &mut reg, false, true)?;
/// assert!(!reg.stale());
/// # Ok::<(), svtdaq::Error>(())
/// ```
pub struct CommLink {
    shared: Arc<LinkShared>,
    state: Mutex<LinkState>,
    sinks: Arc<Mutex<DataSinks>>,
}

impl CommLink {
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        Self {
            shared: Arc::new(LinkShared::new(config.data_mask)),
            state: Mutex::new(LinkState {
                config,
                threads: Vec::new(),
                data_tx: None,
                driver: "none",
            }),
            sinks: Arc::new(Mutex::new(DataSinks::default())),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start `driver`'s transport threads, then the Data thread.
    pub fn open<D: LinkDriver>(&self, driver: D) -> Result<()> {
        let mut state = self.state.lock();
        if state.data_tx.is_some() {
            return Err(Error::LinkOpen);
        }

        let name = driver.name();
        let config = state.config.clone();
        let (tx, rx) = bounded(config.queue_depth.max(1));

        self.shared.set_running(true);
        let ctx = DriverContext {
            shared: Arc::clone(&self.shared),
            config: config.clone(),
            data: DataQueue::new(tx.clone(), Arc::clone(&self.shared), config.poll_interval),
        };
        let handles = match driver.start(ctx) {
            Ok(h) => h,
            Err(e) => {
                self.shared.set_running(false);
                log::error!("[LINK] Opening {} link failed: {}", name, e);
                return Err(e);
            }
        };

        let worker = DataWorker {
            rx,
            shared: Arc::clone(&self.shared),
            sinks: Arc::clone(&self.sinks),
            ring: handles.ring,
            poll_interval: config.poll_interval,
        };
        let mut threads = handles.threads;
        match thread::Builder::new()
            .name("svtdaq-data".to_string())
            .spawn(move || worker.run())
        {
            Ok(h) => threads.push(h),
            Err(e) => {
                self.shared.set_running(false);
                join_all(threads);
                return Err(Error::Io(e));
            }
        }

        state.threads = threads;
        state.data_tx = Some(tx);
        state.driver = name;
        log::info!(
            "[LINK] Opened {} link (max_rx_tx={} words, timeout={:?})",
            name,
            config.max_rx_tx,
            config.transaction_timeout
        );
        Ok(())
    }

    /// Stop and join all link threads. Safe to call repeatedly.
    pub fn close(&self) {
        let (threads, driver) = {
            let mut state = self.state.lock();
            if state.data_tx.is_none() && state.threads.is_empty() {
                return;
            }
            self.shared.set_running(false);
            state.data_tx = None;
            (std::mem::take(&mut state.threads), state.driver)
        };
        // Joined without the state lock: a data callback may still query the link.
        join_all(threads);
        log::info!("[LINK] Closed {} link", driver);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().data_tx.is_some()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Read or write `reg` on destination `dest`.
    ///
    /// With `wait`, blocks until the matching response arrives or the
    /// transaction timeout passes. A timeout fills the payload with ones,
    /// sets the status to [`STATUS_FAILED`] and counts it. Without `wait`
    /// the request is counted and the register marked fresh at submission.
    pub fn queue_register(&self, dest: usize, reg: &mut Register, write: bool, wait: bool) -> Result<()> {
        let (max, timeout) = {
            let state = self.state.lock();
            (state.config.max_rx_tx, state.config.transaction_timeout)
        };
        let words = reg.size() + REG_OVERHEAD_WORDS;
        if words > max {
            return Err(Error::Oversize { words, max });
        }
        self.shared.check_overlap(reg.channel());

        let slot = &self.shared.registers;
        let _caller = slot.lock_caller();
        let seq = slot.post(RegisterRequest::new(dest, reg, write));
        self.shared.work.raise();

        if !wait {
            reg.clear_stale();
            self.shared.counters.inc_reg_rx();
            return Ok(());
        }

        match slot.wait(seq, Instant::now() + timeout) {
            Some(resp) => {
                if let Some(data) = resp.data {
                    reg.load(&data);
                }
                reg.set_status(resp.status);
                reg.clear_stale();
                self.shared.counters.inc_reg_rx();
                Ok(())
            }
            None => {
                reg.fill(u32::MAX);
                reg.set_status(STATUS_FAILED);
                self.shared.counters.inc_timeout();
                if self.shared.debug() {
                    log::debug!("[LINK] Register {} (0x{:08x}) timed out", reg.name(), reg.address());
                }
                Err(Error::Timeout {
                    what: format!("register 0x{:08x}", reg.address()),
                    after: timeout,
                })
            }
        }
    }

    /// Send `cmd` to destination `dest` and wait for it to go out.
    pub fn queue_command(&self, dest: usize, cmd: &Command) -> Result<()> {
        let timeout = self.state.lock().config.transaction_timeout;
        let slot = &self.shared.commands;
        let _caller = slot.lock_caller();
        let seq = slot.post(CommandRequest::new(dest, cmd));
        self.shared.work.raise();

        if slot.wait(seq, Instant::now() + timeout).is_some() {
            return Ok(());
        }
        self.shared.counters.inc_timeout();
        if self.shared.debug() {
            log::debug!("[LINK] Command {} timed out", cmd.name());
        }
        Err(Error::Timeout {
            what: format!("command {}", cmd.name()),
            after: timeout,
        })
    }

    /// Set (or clear) the command sent on each run trigger.
    pub fn set_run_command(&self, dest: usize, cmd: Option<&Command>) {
        self.shared.run.set(dest, cmd);
    }

    /// Fire one run trigger; returns false when no run command is set.
    pub fn queue_run_command(&self) -> bool {
        let queued = self.shared.run.queue();
        if queued {
            self.shared.work.raise();
        }
        queued
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn config(&self) -> LinkConfig {
        self.state.lock().config.clone()
    }

    /// Change the maximum transfer unit (words). Only while closed.
    pub fn set_max_rx_tx(&self, words: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.data_tx.is_some() {
            return Err(Error::LinkOpen);
        }
        if words <= REG_OVERHEAD_WORDS {
            return Err(Error::InvalidArgument(format!(
                "max_rx_tx must exceed {} words",
                REG_OVERHEAD_WORDS
            )));
        }
        state.config.max_rx_tx = words;
        Ok(())
    }

    /// Bit `n` set marks channel `n` as event data.
    pub fn set_data_mask(&self, mask: u32) {
        self.state.lock().config.data_mask = mask;
        self.shared.set_data_mask(mask);
    }

    pub fn data_mask(&self) -> u32 {
        self.shared.data_mask()
    }

    pub fn set_debug(&self, enable: bool) {
        self.shared.set_debug(enable);
    }

    pub fn debug(&self) -> bool {
        self.shared.debug()
    }

    // ========================================================================
    // Data sinks
    // ========================================================================

    /// Install (or remove) the callback run on the Data thread for every record.
    pub fn set_data_callback(&self, callback: Option<DataCallback>) {
        self.sinks.lock().callback = callback;
    }

    /// Open a capture file for appending, closing any open one.
    pub fn open_data_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut sinks = self.sinks.lock();
        sinks.close_file();
        sinks.file = Some(CaptureWriter::new(BufWriter::new(file)));
        log::info!("[DATA] Capture file {} open", path.display());
        Ok(())
    }

    pub fn close_data_file(&self) {
        let mut sinks = self.sinks.lock();
        if sinks.file.is_some() {
            sinks.close_file();
            log::info!("[DATA] Capture file closed");
        }
    }

    pub fn data_file_open(&self) -> bool {
        self.sinks.lock().file.is_some()
    }

    /// Mirror every record to `host:port` over UDP.
    pub fn open_data_net(&self, host: &str, port: u16) -> Result<()> {
        let target = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Transport(format!("resolve {}:{}", host, port), e))?
            .next()
            .ok_or_else(|| Error::InvalidArgument(format!("no address for {}:{}", host, port)))?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).map_err(|e| Error::Transport(format!("bind {}", bind), e))?;
        self.sinks.lock().net = Some((socket, target));
        log::info!("[DATA] Monitor stream to {}", target);
        Ok(())
    }

    pub fn close_data_net(&self) {
        self.sinks.lock().net = None;
    }

    /// Insert a config snapshot into the data stream.
    pub fn add_config(&self, text: &str) -> Result<()> {
        self.inject(RecordKind::Config, text)
    }

    /// Insert a status snapshot into the data stream.
    pub fn add_status(&self, text: &str) -> Result<()> {
        self.inject(RecordKind::Status, text)
    }

    pub fn add_run_marker(&self, marker: RunMarker, text: &str) -> Result<()> {
        self.inject(marker.kind(), text)
    }

    /// Queue a record behind any pending data and wait until it is written.
    fn inject(&self, kind: RecordKind, text: &str) -> Result<()> {
        let (tx, timeout) = {
            let state = self.state.lock();
            (state.data_tx.clone().ok_or(Error::LinkClosed)?, state.config.inject_timeout)
        };
        let deadline = Instant::now() + timeout;
        let timed_out = || Error::Timeout {
            what: format!("{} record", kind),
            after: timeout,
        };

        let (done_tx, done_rx) = bounded(1);
        let item = DataItem::Record {
            kind,
            text: text.to_string(),
            done: done_tx,
        };
        tx.send_timeout(item, timeout).map_err(|_| timed_out())?;
        done_rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .map_err(|_| timed_out())
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub fn counters(&self) -> LinkCountersSnapshot {
        self.shared.counters.snapshot()
    }

    pub fn clear_counters(&self) {
        self.shared.counters.clear();
    }
}

impl Drop for CommLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn join_all(threads: Vec<JoinHandle<()>>) {
    for handle in threads {
        let name = handle.thread().name().unwrap_or("link").to_string();
        if handle.join().is_err() {
            log::error!("[LINK] Thread {} panicked", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{DataRecord, LoopbackDriver};
    use std::time::Duration;

    fn loopback() -> CommLink {
        let link = CommLink::new(
            LinkConfig::default()
                .with_max_rx_tx(64)
                .with_transaction_timeout(Duration::from_secs(1)),
        );
        link.open(LoopbackDriver::new()).expect("open");
        link
    }

    #[test]
    fn test_open_twice_fails() {
        let link = loopback();
        assert!(matches!(link.open(LoopbackDriver::new()), Err(Error::LinkOpen)));
        link.close();
        link.close();
        assert!(!link.is_open());
    }

    #[test]
    fn test_oversize_rejected_before_io() {
        let link = CommLink::new(LinkConfig::default());
        let mut reg = Register::new("Wide", 0x10, 2);
        assert!(matches!(
            link.queue_register(0, &mut reg, true, true),
            Err(Error::Oversize { words: 5, max: 4 })
        ));
        assert_eq!(link.counters().timeout_count, 0);
        assert!(reg.stale());
    }

    #[test]
    fn test_loopback_register_and_command() {
        let link = loopback();
        let mut reg = Register::new("Ctrl", 0x20, 4);
        reg.data_mut().copy_from_slice(&[1, 2, 3, 4]);
        link.queue_register(0, &mut reg, true, true).expect("write");
        assert!(!reg.stale());
        assert_eq!(reg.data(), &[1, 2, 3, 4]);
        assert_eq!(reg.status(), 0);

        link.queue_command(0, &Command::new("Reset", 0x3)).expect("command");
        assert_eq!(link.counters().reg_rx_count, 1);
        assert_eq!(link.counters().timeout_count, 0);
    }

    #[test]
    fn test_timeout_sets_sentinel() {
        let link = CommLink::new(LinkConfig::default().with_max_rx_tx(16));
        let mut reg = Register::new("Status", 0x30, 3);
        let err = link.queue_register(0, &mut reg, false, true).expect_err("no transport");
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(reg.data(), &[u32::MAX; 3]);
        assert_eq!(reg.status(), STATUS_FAILED);
        assert_eq!(link.counters().timeout_count, 1);
        assert!(reg.stale());
    }

    #[test]
    fn test_set_max_rx_tx_requires_closed_link() {
        let link = loopback();
        assert!(matches!(link.set_max_rx_tx(128), Err(Error::LinkOpen)));
        link.close();
        link.set_max_rx_tx(128).expect("closed");
        assert_eq!(link.config().max_rx_tx, 128);
        assert!(link.set_max_rx_tx(3).is_err());
    }

    #[test]
    fn test_run_command_needs_setting() {
        let link = loopback();
        assert!(!link.queue_run_command());
        link.set_run_command(0, Some(&Command::new("Trigger", 0x1)));
        assert!(link.queue_run_command());
        link.set_run_command(0, None);
        assert!(!link.queue_run_command());
    }

    #[test]
    fn test_inject_requires_open_link() {
        let link = CommLink::new(LinkConfig::default());
        assert!(matches!(link.add_config("<config/>"), Err(Error::LinkClosed)));
    }

    #[test]
    fn test_callback_sees_injected_records() {
        let link = loopback();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        {
            let kinds = Arc::clone(&kinds);
            link.set_data_callback(Some(Box::new(move |rec: &DataRecord<'_>| kinds.lock().push(rec.kind))));
        }
        link.add_status("<status/>").expect("status");
        link.add_run_marker(RunMarker::Start, "").expect("marker");
        assert_eq!(*kinds.lock(), vec![RecordKind::Status, RecordKind::RunStart]);
    }
}
