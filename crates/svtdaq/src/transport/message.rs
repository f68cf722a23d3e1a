// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Register and command messages as 32-bit words.
//!
//! ```text
//! register write   [0] [W|addr] [data 0 .. data n-1] [0]
//! register read    [0] [addr]   [(n-1) | (n-1)<<16]  [0]
//! response         [0] [W|addr] [data 0 .. data n-1] [status]
//! command / run    [0] [opcode & 0xFF] [0] [0]
//! ```
//!
//! A response is matched to the outstanding register request by its first two
//! words and its length; there is no transaction id.

use crate::config::{REG_ADDRESS_MASK, REG_OVERHEAD_WORDS, REG_WRITE_FLAG};
use crate::device::{Command, Register};

/// Snapshot of a register transaction handed to the I/O thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub dest: usize,
    pub address: u32,
    pub write: bool,
    /// Register payload length in words.
    pub size: usize,
    /// Payload to transmit (writes only).
    pub data: Vec<u32>,
}

impl RegisterRequest {
    pub fn new(dest: usize, reg: &Register, write: bool) -> Self {
        Self {
            dest,
            address: reg.address(),
            write,
            size: reg.size(),
            data: if write { reg.data().to_vec() } else { Vec::new() },
        }
    }

    /// The two words the hardware echoes back.
    #[must_use]
    pub fn correlation(&self) -> [u32; 2] {
        let flag = if self.write { REG_WRITE_FLAG } else { 0 };
        [0, flag | (self.address & REG_ADDRESS_MASK)]
    }

    #[must_use]
    pub fn channel(&self) -> u8 {
        ((self.address >> 24) & 0x3) as u8
    }

    /// Request words in host order.
    #[must_use]
    pub fn words(&self) -> Vec<u32> {
        let [w0, w1] = self.correlation();
        if self.write {
            let mut words = Vec::with_capacity(self.size + REG_OVERHEAD_WORDS);
            words.push(w0);
            words.push(w1);
            words.extend_from_slice(&self.data);
            words.push(0);
            words
        } else {
            let len = (self.size.saturating_sub(1) & 0x3FF) as u32;
            vec![w0, w1, len | (len << 16), 0]
        }
    }

    /// Correlation record kept by the I/O path once the request is on the wire.
    #[must_use]
    pub fn in_flight(&self, seq: u64) -> InFlight {
        InFlight {
            seq,
            correlation: self.correlation(),
            size: self.size,
            write: self.write,
        }
    }
}

/// Command or run request handed to the I/O thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub dest: usize,
    pub opcode: u32,
    pub name: String,
}

impl CommandRequest {
    pub fn new(dest: usize, cmd: &Command) -> Self {
        Self {
            dest,
            opcode: cmd.opcode(),
            name: cmd.name().to_string(),
        }
    }

    #[must_use]
    pub fn channel(&self) -> u8 {
        ((self.opcode >> 8) & 0x3) as u8
    }

    #[must_use]
    pub fn words(&self) -> [u32; 4] {
        [0, self.opcode & 0xFF, 0, 0]
    }
}

/// Outcome of a register transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    /// Trailing status word.
    pub status: u32,
    /// Payload to load into the register; `None` leaves it unchanged.
    pub data: Option<Vec<u32>>,
}

impl RegisterResponse {
    /// Completion that leaves register contents alone (loopback, writes).
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: 0,
            data: None,
        }
    }
}

/// The register request currently on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub seq: u64,
    pub correlation: [u32; 2],
    pub size: usize,
    pub write: bool,
}

impl InFlight {
    /// Match a host-order response against this request.
    ///
    /// Reads with status 0 carry the payload; reads with a nonzero status
    /// yield an all-ones payload. Writes never touch the register.
    #[must_use]
    pub fn match_response(&self, words: &[u32]) -> Option<RegisterResponse> {
        if words.len() < REG_OVERHEAD_WORDS
            || words[..2] != self.correlation
            || words.len() - REG_OVERHEAD_WORDS != self.size
        {
            return None;
        }
        let status = words[words.len() - 1];
        let data = if self.write {
            None
        } else if status == 0 {
            Some(words[2..2 + self.size].to_vec())
        } else {
            Some(vec![u32::MAX; self.size])
        };
        Some(RegisterResponse { status, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_request_layout() {
        let mut reg = Register::new("Ctrl", 0x0200_0010, 3);
        reg.data_mut().copy_from_slice(&[7, 8, 9]);
        let req = RegisterRequest::new(2, &reg, true);
        assert_eq!(req.channel(), 2);
        assert_eq!(req.words(), vec![0, 0x4000_0010, 7, 8, 9, 0]);
    }

    #[test]
    fn test_read_request_layout() {
        let reg = Register::new("Status", 0x0000_0123, 8);
        let req = RegisterRequest::new(0, &reg, false);
        assert_eq!(req.words(), vec![0, 0x123, 0x0007_0007, 0]);
    }

    #[test]
    fn test_command_layout() {
        let cmd = Command::new("Trigger", 0x0102);
        let req = CommandRequest::new(1, &cmd);
        assert_eq!(req.words(), [0, 0x02, 0, 0]);
        assert_eq!(req.channel(), 1);
    }

    #[test]
    fn test_match_read_response() {
        let reg = Register::new("Status", 0x10, 2);
        let flight = RegisterRequest::new(0, &reg, false).in_flight(5);

        let ok = flight.match_response(&[0, 0x10, 0xAA, 0xBB, 0]).expect("match");
        assert_eq!(ok.status, 0);
        assert_eq!(ok.data, Some(vec![0xAA, 0xBB]));

        let failed = flight.match_response(&[0, 0x10, 0xAA, 0xBB, 3]).expect("match");
        assert_eq!(failed.status, 3);
        assert_eq!(failed.data, Some(vec![u32::MAX, u32::MAX]));
    }

    #[test]
    fn test_mismatch_rejected() {
        let reg = Register::new("Status", 0x10, 2);
        let flight = RegisterRequest::new(0, &reg, false).in_flight(1);
        assert!(flight.match_response(&[0, 0x11, 1, 2, 0]).is_none());
        assert!(flight.match_response(&[0, 0x4000_0010, 1, 2, 0]).is_none());
        assert!(flight.match_response(&[0, 0x10, 1, 0]).is_none());
        assert!(flight.match_response(&[0, 0x10]).is_none());
    }

    #[test]
    fn test_write_response_keeps_payload() {
        let reg = Register::new("Ctrl", 0x20, 1);
        let flight = RegisterRequest::new(0, &reg, true).in_flight(1);
        let resp = flight.match_response(&[0, 0x4000_0020, 5, 0]).expect("match");
        assert_eq!(resp.data, None);
    }
}
