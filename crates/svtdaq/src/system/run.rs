// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Software run timer: queues the link's run command at a fixed period.

use crate::config::{MIN_RUN_PERIOD, RUN_START_TIMEOUT};
use crate::error::{Error, Result};
use crate::link::CommLink;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest single sleep, so a stop request is seen promptly at slow rates.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(10);

/// Period for a `RunRate` value such as `"120Hz"`. `0Hz` clamps to the
/// minimum tick.
pub fn parse_run_rate(rate: &str) -> Result<Duration> {
    let hz: u64 = rate
        .trim()
        .strip_suffix("Hz")
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| Error::Config(format!("bad run rate '{}'", rate)))?;
    if hz == 0 {
        return Ok(MIN_RUN_PERIOD);
    }
    Ok(Duration::from_nanos(1_000_000_000 / hz).max(MIN_RUN_PERIOD))
}

#[derive(Default)]
struct RunFlags {
    enable: AtomicBool,
    running: AtomicBool,
    /// Percent of the trigger count issued.
    progress: AtomicU32,
    issued: AtomicU32,
}

/// At most one timer thread at a time.
#[derive(Default)]
pub struct RunTimer {
    flags: Arc<RunFlags>,
    handle: Option<JoinHandle<()>>,
}

impl RunTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run of `count` triggers and wait for the thread to report.
    pub fn start(&mut self, link: Arc<CommLink>, period: Duration, count: u32) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::InvalidArgument("run already active".into()));
        }
        if count == 0 {
            return Err(Error::Config("RunCount must be greater than 0".into()));
        }
        let period = period.max(MIN_RUN_PERIOD);

        self.flags.progress.store(0, Ordering::Relaxed);
        self.flags.issued.store(0, Ordering::Relaxed);
        self.flags.running.store(false, Ordering::Release);
        self.flags.enable.store(true, Ordering::Release);

        let flags = Arc::clone(&self.flags);
        let handle = thread::Builder::new()
            .name("svtdaq-run".to_string())
            .spawn(move || run_loop(&flags, &link, period, count))
            .inspect_err(|_| self.flags.enable.store(false, Ordering::Release))?;
        self.handle = Some(handle);

        let deadline = Instant::now() + RUN_START_TIMEOUT;
        while !self.flags.running.load(Ordering::Acquire) && !handle_done(&self.handle) {
            if Instant::now() >= deadline {
                self.stop();
                return Err(Error::Timeout {
                    what: "run thread start".into(),
                    after: RUN_START_TIMEOUT,
                });
            }
            thread::sleep(Duration::from_micros(100));
        }
        Ok(())
    }

    /// Ask the thread to stop; it exits at its next tick.
    pub fn request_stop(&self) {
        self.flags.enable.store(false, Ordering::Release);
    }

    /// Request a stop and join the thread.
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Whether a thread was started and has not been collected yet.
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Join the thread if it has ended. Returns true once per finished run.
    pub fn collect_finished(&mut self) -> bool {
        if self.handle.is_some() && handle_done(&self.handle) {
            self.join();
            true
        } else {
            false
        }
    }

    pub fn progress(&self) -> u32 {
        self.flags.progress.load(Ordering::Relaxed)
    }

    /// Run commands queued by the current or last run.
    pub fn issued(&self) -> u32 {
        self.flags.issued.load(Ordering::Relaxed)
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[SYSTEM] Run thread panicked");
            }
        }
    }
}

impl Drop for RunTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_done(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(JoinHandle::is_finished)
}

fn run_loop(flags: &RunFlags, link: &CommLink, period: Duration, count: u32) {
    flags.running.store(true, Ordering::Release);
    log::info!("[SYSTEM] Run started: count={} period={:?}", count, period);

    let mut issued = 0u32;
    let mut next = Instant::now() + period;
    while flags.enable.load(Ordering::Acquire) && issued < count {
        let now = Instant::now();
        if now < next {
            thread::sleep((next - now).min(STOP_CHECK_SLICE));
            continue;
        }
        next += period;
        if next < now {
            // fell behind, do not burst to catch up
            next = now + period;
        }

        link.queue_run_command();
        issued += 1;
        flags.issued.store(issued, Ordering::Relaxed);
        flags
            .progress
            .store((u64::from(issued) * 100 / u64::from(count)) as u32, Ordering::Relaxed);
    }

    log::info!("[SYSTEM] Run stopped after {} of {} triggers", issued, count);
    flags.running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::device::Command;
    use crate::link::LoopbackDriver;

    #[test]
    fn test_parse_run_rate() {
        assert_eq!(parse_run_rate("1Hz").expect("1Hz"), Duration::from_secs(1));
        assert_eq!(parse_run_rate("120Hz").expect("120Hz"), Duration::from_nanos(8_333_333));
        assert_eq!(parse_run_rate("0Hz").expect("0Hz"), MIN_RUN_PERIOD);
        assert!(parse_run_rate("fast").is_err());
        assert!(parse_run_rate("10").is_err());
    }

    #[test]
    fn test_run_to_completion() {
        let link = Arc::new(CommLink::new(LinkConfig::default()));
        link.open(LoopbackDriver::new()).expect("open");
        link.set_run_command(0, Some(&Command::new("Trigger", 0x10)));

        let mut timer = RunTimer::new();
        timer.start(Arc::clone(&link), Duration::from_micros(200), 20).expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !timer.collect_finished() {
            assert!(Instant::now() < deadline, "run did not finish");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(timer.issued(), 20);
        assert_eq!(timer.progress(), 100);
        assert!(!timer.is_active());
    }

    #[test]
    fn test_stop_request() {
        let link = Arc::new(CommLink::new(LinkConfig::default()));
        let mut timer = RunTimer::new();
        timer.start(Arc::clone(&link), Duration::from_secs(1), 1000).expect("start");
        assert!(timer.is_active());
        timer.stop();
        assert!(!timer.is_active());
        assert!(timer.issued() < 1000);
    }

    #[test]
    fn test_zero_count_rejected() {
        let link = Arc::new(CommLink::new(LinkConfig::default()));
        let mut timer = RunTimer::new();
        assert!(matches!(
            timer.start(link, Duration::from_millis(1), 0),
            Err(Error::Config(_))
        ));
    }
}
