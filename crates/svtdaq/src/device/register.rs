// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hardware register with a locally cached payload.

use std::fmt;

/// Status value marking a failed or timed-out transaction.
pub const STATUS_FAILED: u32 = 0xFFFF_FFFF;

/// A remote register: address, cached payload words, stale flag and last status.
///
/// The top byte of the address selects the wire channel, the low 24 bits are
/// carried in the request.
#[derive(Clone, PartialEq, Eq)]
pub struct Register {
    name: String,
    address: u32,
    data: Vec<u32>,
    stale: bool,
    status: u32,
}

impl Register {
    /// Create a register with `size` zeroed payload words.
    ///
    /// A new register is stale until its first successful transaction.
    /// A zero size is raised to one word.
    pub fn new(name: impl Into<String>, address: u32, size: usize) -> Self {
        Self {
            name: name.into(),
            address,
            data: vec![0; size.max(1)],
            stale: true,
            status: 0,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Payload length in 32-bit words.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn data(&self) -> &[u32] {
        &self.data
    }

    /// Mutable payload; marks the register stale.
    pub fn data_mut(&mut self) -> &mut [u32] {
        self.stale = true;
        &mut self.data
    }

    /// Set a bit field in word `index`.
    ///
    /// The register goes stale only when the stored value changes.
    pub fn set(&mut self, index: usize, bit: u32, mask: u32, value: u32) {
        let Some(word) = self.data.get_mut(index) else {
            return;
        };
        let next = (*word & !(mask << bit)) | ((value & mask) << bit);
        if next != *word {
            *word = next;
            self.stale = true;
        }
    }

    /// Read a bit field from word `index` (0 when out of range).
    pub fn get(&self, index: usize, bit: u32, mask: u32) -> u32 {
        self.data.get(index).map_or(0, |w| (w >> bit) & mask)
    }

    /// Fill every payload word with `value` without touching the stale flag.
    pub fn fill(&mut self, value: u32) {
        self.data.iter_mut().for_each(|w| *w = value);
    }

    /// Replace the payload from a response (length-checked by the caller).
    pub(crate) fn load(&mut self, words: &[u32]) {
        let n = words.len().min(self.data.len());
        self.data[..n].copy_from_slice(&words[..n]);
    }

    #[inline]
    pub fn stale(&self) -> bool {
        self.stale
    }

    pub fn set_stale(&mut self) {
        self.stale = true;
    }

    pub fn clear_stale(&mut self) {
        self.stale = false;
    }

    /// Status word returned by the last transaction.
    #[inline]
    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn set_status(&mut self, status: u32) {
        self.status = status;
    }

    /// Wire channel encoded in the top address byte.
    #[inline]
    pub fn channel(&self) -> u8 {
        ((self.address >> 24) & 0x3) as u8
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Register")
            .field("name", &self.name)
            .field("address", &format_args!("0x{:08x}", self.address))
            .field("size", &self.data.len())
            .field("stale", &self.stale)
            .field("status", &format_args!("0x{:08x}", self.status))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_register_is_stale() {
        let reg = Register::new("Control", 0x0200_0010, 8);
        assert!(reg.stale());
        assert_eq!(reg.size(), 8);
        assert_eq!(reg.channel(), 2);
        assert!(reg.data().iter().all(|&w| w == 0));
    }

    #[test]
    fn test_set_field_marks_stale_on_change_only() {
        let mut reg = Register::new("Mode", 0x10, 1);
        reg.clear_stale();
        reg.set(0, 4, 0xF, 0);
        assert!(!reg.stale());
        reg.set(0, 4, 0xF, 0xA);
        assert!(reg.stale());
        assert_eq!(reg.data()[0], 0xA0);
        assert_eq!(reg.get(0, 4, 0xF), 0xA);
        assert_eq!(reg.get(3, 0, 0xFF), 0);
    }

    #[test]
    fn test_fill_keeps_stale_flag() {
        let mut reg = Register::new("Status", 0x20, 2);
        reg.clear_stale();
        reg.fill(STATUS_FAILED);
        assert!(!reg.stale());
        assert_eq!(reg.data(), &[0xFFFF_FFFF, 0xFFFF_FFFF]);
    }
}
