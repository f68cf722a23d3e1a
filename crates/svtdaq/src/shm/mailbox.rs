// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-slot command mailbox.
//!
//! ```text
//! +0    SegmentHeader
//! +64   ready: u32   (written by CommandSender)
//! +68   ack:   u32   (written by CommandReceiver)
//! +128  text[CONTROL_TEXT_SIZE], NUL-terminated
//! ```
//!
//! A command is pending while `ready != ack`. There is no queue: sending again
//! before the receiver has acked replaces the text.

use super::segment::ShmSegment;
use super::{Result, SegmentHeader, SegmentKind, ShmError, HEADER_SPACE};
use crate::config::CONTROL_TEXT_SIZE;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub(super) const PAYLOAD_OFFSET: usize = HEADER_SPACE + 64;

/// Ready/ack counter pair shared by both mailbox kinds.
#[repr(C)]
pub(super) struct MailboxCounters {
    pub ready: AtomicU32,
    pub ack: AtomicU32,
}

/// Mapping of a mailbox segment with a validated header.
pub(super) struct MailboxMap {
    pub segment: ShmSegment,
}

impl MailboxMap {
    pub fn create(name: &str, kind: SegmentKind, payload_bytes: usize) -> Result<Self> {
        let segment = ShmSegment::create(name, PAYLOAD_OFFSET + payload_bytes)?;
        // SAFETY: freshly created, zeroed segment; nobody else has seen the header.
        unsafe { &mut *segment.as_ptr().cast::<SegmentHeader>() }.init(kind);
        log::debug!("[SHM] Mailbox {} created", name);
        Ok(Self { segment })
    }

    pub fn open(name: &str, kind: SegmentKind, payload_bytes: usize) -> Result<Self> {
        let segment = ShmSegment::open_existing(name)?;
        if segment.size() < PAYLOAD_OFFSET + payload_bytes {
            return Err(ShmError::BadHeader {
                name: name.to_string(),
                reason: format!("size {} too small", segment.size()),
            });
        }
        // SAFETY: the segment is larger than the header (checked above).
        unsafe { &*segment.as_ptr().cast::<SegmentHeader>() }.check(name, kind)?;
        Ok(Self { segment })
    }

    pub fn counters(&self) -> &MailboxCounters {
        // SAFETY: HEADER_SPACE is inside the mapping and 4-byte aligned.
        unsafe { &*self.segment.as_ptr().add(HEADER_SPACE).cast::<MailboxCounters>() }
    }

    pub fn payload(&self) -> *mut u8 {
        // SAFETY: PAYLOAD_OFFSET + payload_bytes fits (checked at create/open).
        unsafe { self.segment.as_ptr().add(PAYLOAD_OFFSET) }
    }

    pub fn pending(&self) -> bool {
        let c = self.counters();
        c.ready.load(Ordering::Acquire) != c.ack.load(Ordering::Acquire)
    }
}

/// Counters of a control mailbox, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub ready: u32,
    pub ack: u32,
    pub text: String,
}

/// Entry points for the command mailbox.
pub struct ControlMailbox;

impl ControlMailbox {
    /// Create the mailbox; the creator consumes commands.
    pub fn create_receiver(name: &str) -> Result<CommandReceiver> {
        Ok(CommandReceiver {
            map: MailboxMap::create(name, SegmentKind::Control, CONTROL_TEXT_SIZE)?,
        })
    }

    /// Attach to an existing mailbox as the command producer.
    pub fn open_sender(name: &str) -> Result<CommandSender> {
        Ok(CommandSender {
            map: MailboxMap::open(name, SegmentKind::Control, CONTROL_TEXT_SIZE)?,
        })
    }

    pub fn snapshot(name: &str) -> Result<ControlSnapshot> {
        let map = MailboxMap::open(name, SegmentKind::Control, CONTROL_TEXT_SIZE)?;
        let c = map.counters();
        Ok(ControlSnapshot {
            ready: c.ready.load(Ordering::Acquire),
            ack: c.ack.load(Ordering::Acquire),
            text: read_text(&map),
        })
    }
}

fn read_text(map: &MailboxMap) -> String {
    // SAFETY: the payload holds CONTROL_TEXT_SIZE bytes.
    let bytes = unsafe { std::slice::from_raw_parts(map.payload(), CONTROL_TEXT_SIZE) };
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Producer side of the command mailbox.
pub struct CommandSender {
    map: MailboxMap,
}

impl CommandSender {
    /// Post `text`, replacing any command not yet acked.
    pub fn send(&mut self, text: &str) -> Result<()> {
        let bytes = text.as_bytes();
        if bytes.len() >= CONTROL_TEXT_SIZE {
            return Err(ShmError::TooLarge {
                size: bytes.len() + 1,
                capacity: CONTROL_TEXT_SIZE,
            });
        }
        if self.map.pending() {
            log::warn!("[SHM] Command mailbox overwritten before ack");
        }

        // SAFETY: bytes.len() + 1 <= CONTROL_TEXT_SIZE (checked above); the
        // receiver only reads the text after observing the ready increment.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.map.payload(), bytes.len());
            *self.map.payload().add(bytes.len()) = 0;
        }
        self.map.counters().ready.fetch_add(1, Ordering::Release);
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.map.pending()
    }

    /// Post `text` and poll until it is acked or `timeout` elapses.
    ///
    /// Returns whether the command was acked in time.
    pub fn send_and_wait(&mut self, text: &str, timeout: Duration, poll: Duration) -> Result<bool> {
        self.send(text)?;
        let deadline = Instant::now() + timeout;
        while self.map.pending() {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(poll);
        }
        Ok(true)
    }
}

/// Consumer side of the command mailbox.
pub struct CommandReceiver {
    map: MailboxMap,
}

impl CommandReceiver {
    pub fn pending(&self) -> bool {
        self.map.pending()
    }

    /// Copy out the pending command and ack it.
    pub fn take(&mut self) -> Option<String> {
        let c = self.map.counters();
        let ready = c.ready.load(Ordering::Acquire);
        if ready == c.ack.load(Ordering::Relaxed) {
            return None;
        }
        let text = read_text(&self.map);
        c.ack.store(ready, Ordering::Release);
        Some(text)
    }

    pub fn name(&self) -> &str {
        self.map.segment.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::unique_name;

    #[test]
    fn test_send_take_ack() {
        let name = unique_name("ctl");
        let mut rx = ControlMailbox::create_receiver(&name).expect("create");
        let mut tx = ControlMailbox::open_sender(&name).expect("open");

        assert!(rx.take().is_none());
        tx.send("<system><command><ReadStatus/></command></system>").expect("send");
        assert!(tx.is_pending());
        assert!(rx.pending());

        let text = rx.take().expect("pending command");
        assert_eq!(text, "<system><command><ReadStatus/></command></system>");
        assert!(!tx.is_pending());
        assert!(rx.take().is_none());

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_second_send_overwrites() {
        let name = unique_name("ctl_ow");
        let mut rx = ControlMailbox::create_receiver(&name).expect("create");
        let mut tx = ControlMailbox::open_sender(&name).expect("open");

        tx.send("first command").expect("send");
        tx.send("second").expect("send");
        assert_eq!(rx.take().as_deref(), Some("second"));
        assert!(!rx.pending());

        let snap = ControlMailbox::snapshot(&name).expect("snapshot");
        assert_eq!(snap.ready, 2);
        assert_eq!(snap.ack, 2);

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_oversize_rejected() {
        let name = unique_name("ctl_big");
        let _rx = ControlMailbox::create_receiver(&name).expect("create");
        let mut tx = ControlMailbox::open_sender(&name).expect("open");
        let text = "x".repeat(CONTROL_TEXT_SIZE);
        assert!(matches!(tx.send(&text), Err(ShmError::TooLarge { .. })));
        assert!(!tx.is_pending());
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_send_and_wait_times_out_without_receiver() {
        let name = unique_name("ctl_wait");
        let _rx = ControlMailbox::create_receiver(&name).expect("create");
        let mut tx = ControlMailbox::open_sender(&name).expect("open");
        let acked = tx
            .send_and_wait("noop", Duration::from_millis(5), Duration::from_micros(200))
            .expect("send");
        assert!(!acked);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_send_and_wait_acked_by_thread() {
        let name = unique_name("ctl_ack");
        let mut rx = ControlMailbox::create_receiver(&name).expect("create");
        let mut tx = ControlMailbox::open_sender(&name).expect("open");

        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if let Some(text) = rx.take() {
                    return Some(text);
                }
                std::thread::sleep(Duration::from_micros(100));
            }
            None
        });

        let acked = tx
            .send_and_wait("go", Duration::from_secs(2), Duration::from_micros(100))
            .expect("send");
        assert!(acked);
        assert_eq!(handle.join().expect("join").as_deref(), Some("go"));
        ShmSegment::unlink(&name).ok();
    }
}
