// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data ring: N fixed-size slots recycled between a free list and per-lane
//! receive lists.
//!
//! # Layout
//!
//! ```text
//! +0     SegmentHeader (magic, kind, version)
//! +64    RingControl   geometry, list pointers, ack + listen flags
//! +192   slot_size[N]
//!        free_list[N]
//!        rx_list[L][N]
//! (64B)  slots[N][W words]
//! ```
//!
//! List pointers are free-running `u32` counters; entries are addressed
//! modulo N (N is a power of two), so `write - read` is the list length even
//! across wrap and a list can hold all N indices.
//!
//! # Writers
//!
//! | Field          | Writer          |
//! |----------------|-----------------|
//! | `free_read`    | [`RingClaimer`] |
//! | `ack_sent`     | [`RingAcker`]   |
//! | `slot_size`    | [`RingPublisher`] |
//! | `rx_write[*]`  | [`RingPublisher`] |
//! | `free_write`   | [`RingConsumer`] |
//! | `rx_read[*]`   | [`RingConsumer`] |
//! | `ack_request`  | [`RingConsumer`] |
//! | `listen_active`| [`RingConsumer`] |
//!
//! Slot payload bytes belong to whoever holds the [`SlotClaim`] for it.

use super::segment::ShmSegment;
use super::{Result, SegmentHeader, SegmentKind, ShmError, HEADER_SPACE};
use crate::config::{RING_RX_LISTS, RING_SLOT_COUNT, RING_SLOT_WORDS};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Upper bound on receive lists stored in the control block.
pub const MAX_RX_LISTS: usize = 8;

const CONTROL_SPACE: usize = 128;
const ARRAYS_OFFSET: usize = HEADER_SPACE + CONTROL_SPACE;

#[repr(C)]
struct RingControl {
    slot_count: u32,
    slot_words: u32,
    rx_lists: u32,
    _pad0: u32,
    free_read: AtomicU32,
    free_write: AtomicU32,
    ack_request: AtomicU32,
    ack_sent: AtomicU32,
    listen_active: AtomicU32,
    _pad1: [u32; 3],
    rx_read: [AtomicU32; MAX_RX_LISTS],
    rx_write: [AtomicU32; MAX_RX_LISTS],
}

const _: () = assert!(std::mem::size_of::<RingControl>() <= CONTROL_SPACE);

/// Ring geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    /// Number of slots (power of two).
    pub slot_count: u32,
    /// Slot capacity in 32-bit words.
    pub slot_words: u32,
    /// Number of receive lists.
    pub rx_lists: u32,
}

impl Default for RingLayout {
    fn default() -> Self {
        Self {
            slot_count: RING_SLOT_COUNT,
            slot_words: RING_SLOT_WORDS,
            rx_lists: RING_RX_LISTS,
        }
    }
}

impl RingLayout {
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 || !self.slot_count.is_power_of_two() {
            return Err(ShmError::InvalidLayout(format!(
                "slot count {} must be a power of two",
                self.slot_count
            )));
        }
        if self.slot_words == 0 {
            return Err(ShmError::InvalidLayout("slot words must be > 0".into()));
        }
        if self.rx_lists == 0 || self.rx_lists as usize > MAX_RX_LISTS {
            return Err(ShmError::InvalidLayout(format!(
                "rx lists {} must be 1..={}",
                self.rx_lists, MAX_RX_LISTS
            )));
        }
        self.total_bytes().map(|_| ())
    }

    /// Slot capacity in bytes.
    #[must_use]
    pub fn slot_bytes(&self) -> usize {
        self.slot_words as usize * 4
    }

    fn sizes_offset(&self) -> usize {
        ARRAYS_OFFSET
    }

    fn free_offset(&self) -> usize {
        self.sizes_offset() + 4 * self.slot_count as usize
    }

    fn rx_offset(&self) -> usize {
        self.free_offset() + 4 * self.slot_count as usize
    }

    fn slots_offset(&self) -> usize {
        let end = self.rx_offset() + 4 * self.slot_count as usize * self.rx_lists as usize;
        (end + 63) & !63
    }

    /// Total segment size in bytes.
    pub fn total_bytes(&self) -> Result<usize> {
        (self.slot_count as usize)
            .checked_mul(self.slot_bytes())
            .and_then(|n| n.checked_add(self.slots_offset()))
            .ok_or_else(|| ShmError::InvalidLayout("ring too large".into()))
    }
}

/// Ownership token for one ring slot.
///
/// Move-only: exactly one holder may write, publish or release the slot.
/// Dropping a claim without handing it back leaks the slot.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotClaim {
    index: u32,
}

impl SlotClaim {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Point-in-time view of ring counters (for monitoring tools).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSnapshot {
    pub layout: RingLayout,
    pub free: u32,
    pub rx: Vec<u32>,
    pub ack_request: u32,
    pub ack_sent: u32,
    pub listen_active: bool,
}

struct RingMap {
    segment: ShmSegment,
    layout: RingLayout,
}

impl RingMap {
    fn control(&self) -> &RingControl {
        // SAFETY: the segment is at least total_bytes() long (checked at
        // create/open) and HEADER_SPACE is 64-byte aligned.
        unsafe { &*self.segment.as_ptr().add(HEADER_SPACE).cast::<RingControl>() }
    }

    fn cell(&self, offset: usize, index: usize) -> &AtomicU32 {
        // SAFETY: callers pass an array offset from RingLayout and an index
        // reduced modulo its length, so the cell lies inside the mapping.
        unsafe { &*self.segment.as_ptr().add(offset + 4 * index).cast::<AtomicU32>() }
    }

    fn mask(&self) -> u32 {
        self.layout.slot_count - 1
    }

    fn size_cell(&self, slot: u32) -> &AtomicU32 {
        self.cell(self.layout.sizes_offset(), (slot & self.mask()) as usize)
    }

    fn free_entry(&self, pos: u32) -> &AtomicU32 {
        self.cell(self.layout.free_offset(), (pos & self.mask()) as usize)
    }

    fn rx_entry(&self, list: usize, pos: u32) -> &AtomicU32 {
        let row = list * self.layout.slot_count as usize;
        self.cell(self.layout.rx_offset(), row + (pos & self.mask()) as usize)
    }

    fn slot_ptr(&self, slot: u32) -> *mut u8 {
        let offset = self.layout.slots_offset() + (slot & self.mask()) as usize * self.layout.slot_bytes();
        // SAFETY: offset addresses one of slot_count slots, all inside the mapping.
        unsafe { self.segment.as_ptr().add(offset) }
    }

    fn free_count(&self) -> u32 {
        let c = self.control();
        c.free_write
            .load(Ordering::Acquire)
            .wrapping_sub(c.free_read.load(Ordering::Acquire))
    }

    fn rx_count(&self, list: usize) -> u32 {
        let c = self.control();
        if list >= self.layout.rx_lists as usize {
            return 0;
        }
        c.rx_write[list]
            .load(Ordering::Acquire)
            .wrapping_sub(c.rx_read[list].load(Ordering::Acquire))
    }

    /// Single-writer push: the caller owns `write`.
    fn push<'a>(
        &'a self,
        read: &AtomicU32,
        write: &AtomicU32,
        entry: impl Fn(u32) -> &'a AtomicU32,
        slot: u32,
    ) -> bool {
        let w = write.load(Ordering::Relaxed);
        let r = read.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.layout.slot_count {
            return false;
        }
        entry(w).store(slot, Ordering::Relaxed);
        write.store(w.wrapping_add(1), Ordering::Release);
        true
    }

    /// Single-reader pop: the caller owns `read`.
    fn pop<'a>(
        &'a self,
        read: &AtomicU32,
        write: &AtomicU32,
        entry: impl Fn(u32) -> &'a AtomicU32,
    ) -> Option<u32> {
        let r = read.load(Ordering::Relaxed);
        if r == write.load(Ordering::Acquire) {
            return None;
        }
        let slot = entry(r).load(Ordering::Relaxed);
        read.store(r.wrapping_add(1), Ordering::Release);
        Some(slot & self.mask())
    }

    fn snapshot(&self) -> RingSnapshot {
        let c = self.control();
        RingSnapshot {
            layout: self.layout,
            free: self.free_count(),
            rx: (0..self.layout.rx_lists as usize).map(|l| self.rx_count(l)).collect(),
            ack_request: c.ack_request.load(Ordering::Acquire),
            ack_sent: c.ack_sent.load(Ordering::Acquire),
            listen_active: c.listen_active.load(Ordering::Acquire) != 0,
        }
    }
}

/// Network-side handles returned by [`DataRing::create`].
pub struct RingHandles {
    pub claimer: RingClaimer,
    pub publisher: RingPublisher,
    pub acker: RingAcker,
}

/// Entry points for creating and attaching to a data ring.
pub struct DataRing;

impl DataRing {
    /// Create the ring segment and return the network-side handles.
    ///
    /// The free list starts with every slot index.
    pub fn create(name: &str, layout: RingLayout) -> Result<RingHandles> {
        layout.validate()?;
        let segment = ShmSegment::create(name, layout.total_bytes()?)?;
        let map = RingMap { segment, layout };

        {
            // SAFETY: freshly created segment, no other mapping has seen the header yet.
            let header = unsafe { &mut *map.segment.as_ptr().cast::<SegmentHeader>() };
            // SAFETY: same as above, control block lies at HEADER_SPACE.
            let control = unsafe { &mut *map.segment.as_ptr().add(HEADER_SPACE).cast::<RingControl>() };
            control.slot_count = layout.slot_count;
            control.slot_words = layout.slot_words;
            control.rx_lists = layout.rx_lists;

            for slot in 0..layout.slot_count {
                map.free_entry(slot).store(slot, Ordering::Relaxed);
            }
            control.free_write.store(layout.slot_count, Ordering::Release);
            header.init(SegmentKind::DataRing);
        }

        log::info!(
            "[SHM] Data ring {} ready: {} slots x {} words, {} rx lists",
            name,
            layout.slot_count,
            layout.slot_words,
            layout.rx_lists
        );

        let map = Arc::new(map);
        let recycled = Arc::new(ArrayQueue::new(layout.slot_count as usize));
        Ok(RingHandles {
            claimer: RingClaimer {
                map: Arc::clone(&map),
                recycled: Arc::clone(&recycled),
            },
            publisher: RingPublisher {
                map: Arc::clone(&map),
                recycled,
            },
            acker: RingAcker { map },
        })
    }

    /// Attach to an existing ring as its consumer.
    pub fn open(name: &str) -> Result<RingConsumer> {
        Ok(RingConsumer {
            map: Self::attach(name)?,
        })
    }

    /// Read the ring counters without taking a handle.
    pub fn snapshot(name: &str) -> Result<RingSnapshot> {
        Ok(Self::attach(name)?.snapshot())
    }

    fn attach(name: &str) -> Result<RingMap> {
        let segment = ShmSegment::open_existing(name)?;
        let bad = |reason: String| ShmError::BadHeader {
            name: name.to_string(),
            reason,
        };

        let header = segment
            .at::<SegmentHeader>(0)
            .ok_or_else(|| bad("segment smaller than header".into()))?;
        // SAFETY: `at` checked bounds and alignment.
        unsafe { &*header }.check(name, SegmentKind::DataRing)?;

        let control = segment
            .at::<RingControl>(HEADER_SPACE)
            .ok_or_else(|| bad("segment smaller than control block".into()))?;
        // SAFETY: `at` checked bounds and alignment; geometry fields are
        // written once before the magic is published.
        let control = unsafe { &*control };
        let layout = RingLayout {
            slot_count: control.slot_count,
            slot_words: control.slot_words,
            rx_lists: control.rx_lists,
        };
        layout.validate()?;
        if segment.size() < layout.total_bytes()? {
            return Err(bad(format!(
                "size {} below layout size {}",
                segment.size(),
                layout.total_bytes()?
            )));
        }
        Ok(RingMap { segment, layout })
    }
}

/// Network receive side: takes free slots and fills them.
pub struct RingClaimer {
    map: Arc<RingMap>,
    recycled: Arc<ArrayQueue<u32>>,
}

impl RingClaimer {
    /// Take a free slot, preferring locally recycled ones.
    pub fn claim(&mut self) -> Option<SlotClaim> {
        if let Some(index) = self.recycled.pop() {
            return Some(SlotClaim { index });
        }
        let c = self.map.control();
        self.map
            .pop(&c.free_read, &c.free_write, |p| self.map.free_entry(p))
            .map(|index| SlotClaim { index })
    }

    /// Writable bytes of a claimed slot.
    pub fn buffer_mut(&mut self, claim: &SlotClaim) -> &mut [u8] {
        // SAFETY: the claim proves exclusive ownership of this slot; the
        // slice covers exactly one slot inside the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.map.slot_ptr(claim.index), self.map.layout.slot_bytes()) }
    }

    pub fn free_count(&self) -> u32 {
        self.map.free_count() + self.recycled.len() as u32
    }

    pub fn layout(&self) -> RingLayout {
        self.map.layout
    }
}

/// Network transmit side: answers the consumer's trigger-ack requests.
pub struct RingAcker {
    map: Arc<RingMap>,
}

impl RingAcker {
    /// Whether the consumer has asked for a trigger acknowledgment.
    pub fn ack_pending(&self) -> bool {
        let c = self.map.control();
        c.ack_request.load(Ordering::Acquire) != c.ack_sent.load(Ordering::Relaxed)
    }

    /// Record that the pending acknowledgment was transmitted.
    pub fn mark_ack_sent(&mut self) {
        let c = self.map.control();
        c.ack_sent.store(c.ack_request.load(Ordering::Acquire), Ordering::Release);
    }
}

/// Network data-thread side: publishes filled slots or recycles them.
pub struct RingPublisher {
    map: Arc<RingMap>,
    recycled: Arc<ArrayQueue<u32>>,
}

impl RingPublisher {
    /// First `words` words of a claimed slot as bytes.
    pub fn contents(&self, claim: &SlotClaim, words: u32) -> &[u8] {
        let len = (words as usize * 4).min(self.map.layout.slot_bytes());
        // SAFETY: the claim proves no writer is active on this slot.
        unsafe { std::slice::from_raw_parts(self.map.slot_ptr(claim.index), len) }
    }

    /// Whether a consumer is attached and draining receive lists.
    pub fn listen_active(&self) -> bool {
        self.map.control().listen_active.load(Ordering::Acquire) != 0
    }

    /// Tag the slot with its size and hand it to receive list `list`.
    ///
    /// On failure the slot is recycled locally.
    pub fn publish(&mut self, claim: SlotClaim, list: usize, words: u32) -> Result<()> {
        let lists = self.map.layout.rx_lists as usize;
        if list >= lists {
            self.recycle(claim);
            return Err(ShmError::OutOfRange { index: list, len: lists });
        }
        self.map.size_cell(claim.index).store(words, Ordering::Relaxed);
        let c = self.map.control();
        if self
            .map
            .push(&c.rx_read[list], &c.rx_write[list], |p| self.map.rx_entry(list, p), claim.index)
        {
            Ok(())
        } else {
            log::warn!("[SHM] Receive list {} full, recycling slot {}", list, claim.index);
            self.recycle(claim);
            Err(ShmError::OutOfRange {
                index: self.map.layout.slot_count as usize,
                len: self.map.layout.slot_count as usize,
            })
        }
    }

    /// Return a slot straight to the claimer without a consumer round trip.
    pub fn recycle(&self, claim: SlotClaim) {
        if let Err(index) = self.recycled.push(claim.index) {
            log::warn!("[SHM] Recycle queue full, slot {} leaked", index);
        }
    }

    pub fn layout(&self) -> RingLayout {
        self.map.layout
    }
}

/// Readout-process side: drains receive lists and returns slots.
pub struct RingConsumer {
    map: RingMap,
}

impl RingConsumer {
    /// Announce (or withdraw) a consumer draining the receive lists.
    pub fn set_listen_active(&mut self, active: bool) {
        self.map
            .control()
            .listen_active
            .store(u32::from(active), Ordering::Release);
    }

    /// Oldest slot on receive list `list`.
    pub fn pop(&mut self, list: usize) -> Option<SlotClaim> {
        if list >= self.map.layout.rx_lists as usize {
            return None;
        }
        let c = self.map.control();
        self.map
            .pop(&c.rx_read[list], &c.rx_write[list], |p| self.map.rx_entry(list, p))
            .map(|index| SlotClaim { index })
    }

    /// Size tag of a popped slot, in words.
    pub fn words(&self, claim: &SlotClaim) -> u32 {
        self.map
            .size_cell(claim.index)
            .load(Ordering::Relaxed)
            .min(self.map.layout.slot_words)
    }

    /// Payload bytes of a popped slot.
    pub fn contents(&self, claim: &SlotClaim) -> &[u8] {
        let len = self.words(claim) as usize * 4;
        // SAFETY: the claim proves the producer has finished with this slot.
        unsafe { std::slice::from_raw_parts(self.map.slot_ptr(claim.index), len) }
    }

    /// Copy a popped slot out as native-order words.
    pub fn read_words(&self, claim: &SlotClaim) -> Vec<u32> {
        self.contents(claim)
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Give a slot back to the free list.
    pub fn release(&mut self, claim: SlotClaim) {
        let c = self.map.control();
        if !self
            .map
            .push(&c.free_read, &c.free_write, |p| self.map.free_entry(p), claim.index)
        {
            log::warn!("[SHM] Free list full releasing slot {}", claim.index);
        }
    }

    /// Ask the network process to send a trigger acknowledgment.
    pub fn request_ack(&mut self) {
        self.map.control().ack_request.fetch_add(1, Ordering::Release);
    }

    pub fn rx_count(&self, list: usize) -> u32 {
        self.map.rx_count(list)
    }

    pub fn free_count(&self) -> u32 {
        self.map.free_count()
    }

    pub fn snapshot(&self) -> RingSnapshot {
        self.map.snapshot()
    }

    pub fn layout(&self) -> RingLayout {
        self.map.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::unique_name;

    fn small() -> RingLayout {
        RingLayout {
            slot_count: 8,
            slot_words: 16,
            rx_lists: 2,
        }
    }

    #[test]
    fn test_layout_validation() {
        assert!(small().validate().is_ok());
        assert!(RingLayout { slot_count: 6, ..small() }.validate().is_err());
        assert!(RingLayout { rx_lists: 9, ..small() }.validate().is_err());
        assert!(RingLayout { slot_words: 0, ..small() }.validate().is_err());
        assert_eq!(small().slots_offset() % 64, 0);
    }

    #[test]
    fn test_free_list_holds_every_slot() {
        let name = unique_name("ring_full");
        let RingHandles { mut claimer, .. } = DataRing::create(&name, small()).expect("create");
        assert_eq!(claimer.free_count(), 8);

        let claims: Vec<_> = std::iter::from_fn(|| claimer.claim()).collect();
        let mut indices: Vec<u32> = claims.iter().map(SlotClaim::index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert!(claimer.claim().is_none());

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_publish_pop_release_roundtrip() {
        let name = unique_name("ring_rt");
        let RingHandles {
            mut claimer,
            mut publisher,
            ..
        } = DataRing::create(&name, small()).expect("create");
        let mut consumer = DataRing::open(&name).expect("open");
        consumer.set_listen_active(true);
        assert!(publisher.listen_active());

        let claim = claimer.claim().expect("free slot");
        let index = claim.index();
        claimer.buffer_mut(&claim)[..8].copy_from_slice(&[1, 0, 0, 0, 2, 0, 0, 0]);
        publisher.publish(claim, 1, 2).expect("publish");
        assert_eq!(consumer.rx_count(1), 1);
        assert_eq!(consumer.free_count(), 7);

        let got = consumer.pop(1).expect("rx entry");
        assert_eq!(got.index(), index);
        assert_eq!(consumer.words(&got), 2);
        assert_eq!(consumer.read_words(&got), vec![u32::from_ne_bytes([1, 0, 0, 0]), u32::from_ne_bytes([2, 0, 0, 0])]);
        consumer.release(got);
        assert_eq!(consumer.free_count(), 8);
        assert!(consumer.pop(1).is_none());

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_recycle_is_claimed_first() {
        let name = unique_name("ring_recycle");
        let RingHandles {
            mut claimer,
            publisher,
            ..
        } = DataRing::create(&name, small()).expect("create");
        let first = claimer.claim().expect("slot");
        let index = first.index();
        publisher.recycle(first);
        assert_eq!(claimer.claim().expect("recycled").index(), index);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_publish_bad_list_recycles() {
        let name = unique_name("ring_badlist");
        let RingHandles {
            mut claimer,
            mut publisher,
            ..
        } = DataRing::create(&name, small()).expect("create");
        let claim = claimer.claim().expect("slot");
        assert!(publisher.publish(claim, 5, 1).is_err());
        assert_eq!(claimer.free_count(), 8);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_ack_handshake() {
        let name = unique_name("ring_ack");
        let RingHandles { mut acker, .. } = DataRing::create(&name, small()).expect("create");
        let mut consumer = DataRing::open(&name).expect("open");
        assert!(!acker.ack_pending());
        consumer.request_ack();
        assert!(acker.ack_pending());
        acker.mark_ack_sent();
        assert!(!acker.ack_pending());
        let snap = consumer.snapshot();
        assert_eq!(snap.ack_request, 1);
        assert_eq!(snap.ack_sent, 1);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_open_rejects_foreign_segment() {
        let name = unique_name("ring_foreign");
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(matches!(DataRing::open(&name), Err(ShmError::BadHeader { .. })));
        ShmSegment::unlink(&name).ok();
    }
}
