// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

/// An opcode command.
///
/// Bits 11:8 of the opcode select the wire channel, bits 7:0 are transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    opcode: u32,
    takes_arg: bool,
    description: String,
}

impl Command {
    pub fn new(name: impl Into<String>, opcode: u32) -> Self {
        Self {
            name: name.into(),
            opcode,
            takes_arg: false,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self) -> Self {
        self.takes_arg = true;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn takes_arg(&self) -> bool {
        self.takes_arg
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Wire channel encoded in bits 11:8 of the opcode.
    pub fn channel(&self) -> u8 {
        ((self.opcode >> 8) & 0x3) as u8
    }
}
