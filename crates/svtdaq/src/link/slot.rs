// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transaction slots: one outstanding request per category.
//!
//! A caller holds the slot's caller lock for the whole transaction, posts a
//! request (bumping the request counter), and waits on a condition variable
//! until the I/O side completes that request (catching the response counter
//! up) or the deadline passes. The I/O side polls for requests newer than the
//! last one it transmitted.

use crate::device::Command;
use crate::transport::message::CommandRequest;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct SlotState<Req, Resp> {
    request: Option<Req>,
    req_count: u64,
    resp_count: u64,
    response: Option<Resp>,
}

pub(crate) struct TransactionSlot<Req, Resp> {
    caller: Mutex<()>,
    state: Mutex<SlotState<Req, Resp>>,
    changed: Condvar,
}

impl<Req: Clone, Resp> TransactionSlot<Req, Resp> {
    pub fn new() -> Self {
        Self {
            caller: Mutex::new(()),
            state: Mutex::new(SlotState {
                request: None,
                req_count: 0,
                resp_count: 0,
                response: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Serialize callers; keep the guard until the transaction ends.
    pub fn lock_caller(&self) -> MutexGuard<'_, ()> {
        self.caller.lock()
    }

    /// Post a request and return its sequence number.
    pub fn post(&self, request: Req) -> u64 {
        let mut st = self.state.lock();
        st.request = Some(request);
        st.response = None;
        st.req_count += 1;
        st.req_count
    }

    /// Wait for the response to `seq`; `None` on timeout.
    pub fn wait(&self, seq: u64, deadline: Instant) -> Option<Resp> {
        let mut st = self.state.lock();
        loop {
            if st.resp_count >= seq {
                return st.response.take();
            }
            if self.changed.wait_until(&mut st, deadline).timed_out() {
                return if st.resp_count >= seq {
                    st.response.take()
                } else {
                    None
                };
            }
        }
    }

    /// I/O side: the request newer than `seen`, if any.
    pub fn next_request(&self, seen: &mut u64) -> Option<(u64, Req)> {
        let st = self.state.lock();
        if st.req_count == *seen {
            return None;
        }
        *seen = st.req_count;
        st.request.clone().map(|r| (st.req_count, r))
    }

    /// I/O side: complete request `seq`. Returns false when `seq` is no longer
    /// the outstanding request or was already answered.
    pub fn complete(&self, seq: u64, response: Resp) -> bool {
        let mut st = self.state.lock();
        if seq != st.req_count || st.resp_count >= seq {
            return false;
        }
        st.resp_count = seq;
        st.response = Some(response);
        self.changed.notify_all();
        true
    }

    /// (request counter, response counter)
    pub fn counts(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.req_count, st.resp_count)
    }
}

/// Fire-and-forget trigger slot.
///
/// Requests are only counted while a run command is configured.
pub(crate) struct RunSlot {
    command: Mutex<Option<CommandRequest>>,
    req_count: AtomicU64,
}

impl RunSlot {
    pub fn new() -> Self {
        Self {
            command: Mutex::new(None),
            req_count: AtomicU64::new(0),
        }
    }

    pub fn set(&self, dest: usize, command: Option<&Command>) {
        *self.command.lock() = command.map(|c| CommandRequest::new(dest, c));
    }

    /// Returns whether a trigger was queued.
    pub fn queue(&self) -> bool {
        if self.command.lock().is_none() {
            return false;
        }
        self.req_count.fetch_add(1, Ordering::Release);
        true
    }

    /// I/O side: the run command when triggers arrived since `seen`.
    ///
    /// Several triggers queued between two polls collapse into one.
    pub fn next_request(&self, seen: &mut u64) -> Option<CommandRequest> {
        let count = self.req_count.load(Ordering::Acquire);
        if count == *seen {
            return None;
        }
        *seen = count;
        self.command.lock().clone()
    }

    pub fn count(&self) -> u64 {
        self.req_count.load(Ordering::Acquire)
    }
}

/// Wakes the I/O thread when a request is posted.
pub(crate) struct WorkSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn raise(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    /// Block until raised past `seen` or `timeout` passes.
    pub fn wait(&self, seen: &mut u64, timeout: Duration) {
        let mut gen = self.generation.lock();
        if *gen == *seen {
            self.cond.wait_for(&mut gen, timeout);
        }
        *seen = *gen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_post_complete_wait() {
        let slot: TransactionSlot<u32, u32> = TransactionSlot::new();
        let seq = slot.post(7);
        let mut seen = 0;
        assert_eq!(slot.next_request(&mut seen), Some((1, 7)));
        assert_eq!(slot.next_request(&mut seen), None);
        assert!(slot.complete(seq, 70));
        assert!(!slot.complete(seq, 71));
        assert_eq!(slot.wait(seq, Instant::now()), Some(70));
        assert_eq!(slot.counts(), (1, 1));
    }

    #[test]
    fn test_wait_times_out() {
        let slot: TransactionSlot<u32, ()> = TransactionSlot::new();
        let seq = slot.post(1);
        let start = Instant::now();
        assert!(slot.wait(seq, start + Duration::from_millis(2)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn test_stale_completion_rejected() {
        let slot: TransactionSlot<u32, u32> = TransactionSlot::new();
        let first = slot.post(1);
        let second = slot.post(2);
        assert!(!slot.complete(first, 10));
        assert!(slot.complete(second, 20));
        assert_eq!(slot.wait(second, Instant::now()), Some(20));
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let slot: Arc<TransactionSlot<u32, u32>> = Arc::new(TransactionSlot::new());
        let seq = slot.post(3);
        let io = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                let mut seen = 0;
                loop {
                    if let Some((seq, req)) = slot.next_request(&mut seen) {
                        slot.complete(seq, req * 2);
                        return;
                    }
                    std::thread::sleep(Duration::from_micros(50));
                }
            })
        };
        let got = slot.wait(seq, Instant::now() + Duration::from_secs(2));
        io.join().expect("io thread");
        assert_eq!(got, Some(6));
    }

    #[test]
    fn test_run_slot_requires_command() {
        let run = RunSlot::new();
        assert!(!run.queue());
        run.set(1, Some(&Command::new("Trigger", 0x5)));
        assert!(run.queue());
        assert!(run.queue());
        let mut seen = 0;
        let req = run.next_request(&mut seen).expect("pending trigger");
        assert_eq!(req.dest, 1);
        assert_eq!(seen, 2);
        assert!(run.next_request(&mut seen).is_none());
    }

    #[test]
    fn test_work_signal() {
        let signal = WorkSignal::new();
        let mut seen = 0;
        signal.raise();
        let start = Instant::now();
        signal.wait(&mut seen, Duration::from_secs(5));
        assert_eq!(seen, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
