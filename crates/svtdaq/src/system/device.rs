// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device tree collaborator hosted by a [`System`](super::System).

use crate::error::{Error, Result};
use crate::link::CommLink;

/// Hardware description below the system level.
///
/// The XML methods return element content only (no `<config>`/`<status>`
/// wrapper); the system adds its own variables and the wrapper. Hardware
/// operations talk to the board through `link`.
pub trait DeviceTree: Send {
    fn config_xml(&self) -> String;

    fn status_xml(&self) -> String;

    fn structure_xml(&self) -> String;

    fn read_status(&mut self, link: &CommLink) -> Result<()>;

    fn read_config(&mut self, link: &CommLink) -> Result<()>;

    /// Push configuration to hardware; `force` rewrites unchanged registers.
    fn write_config(&mut self, link: &CommLink, force: bool) -> Result<()>;

    fn verify_config(&mut self, link: &CommLink) -> Result<()>;

    fn hard_reset(&mut self, link: &CommLink) -> Result<()>;

    fn soft_reset(&mut self, link: &CommLink) -> Result<()>;

    fn count_reset(&mut self, link: &CommLink) -> Result<()>;

    fn set_defaults(&mut self, link: &CommLink) -> Result<()>;

    /// Apply a `<config>` element. Returns whether anything changed.
    fn apply_config(&mut self, xml: &str) -> Result<bool>;

    /// Execute a device command (`outer:inner` name for nested devices).
    fn command(&mut self, link: &CommLink, name: &str, arg: &str) -> Result<()> {
        let _ = (link, arg);
        Err(Error::InvalidArgument(format!("unknown command {}", name)))
    }

    /// Device-specific state text; `Some` overrides the system's own line.
    fn local_state(&self) -> Option<String> {
        None
    }
}

/// Device tree with no hardware below the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevice;

impl DeviceTree for NullDevice {
    fn config_xml(&self) -> String {
        String::new()
    }

    fn status_xml(&self) -> String {
        String::new()
    }

    fn structure_xml(&self) -> String {
        String::new()
    }

    fn read_status(&mut self, _link: &CommLink) -> Result<()> {
        Ok(())
    }

    fn read_config(&mut self, _link: &CommLink) -> Result<()> {
        Ok(())
    }

    fn write_config(&mut self, _link: &CommLink, _force: bool) -> Result<()> {
        Ok(())
    }

    fn verify_config(&mut self, _link: &CommLink) -> Result<()> {
        Ok(())
    }

    fn hard_reset(&mut self, _link: &CommLink) -> Result<()> {
        Ok(())
    }

    fn soft_reset(&mut self, _link: &CommLink) -> Result<()> {
        Ok(())
    }

    fn count_reset(&mut self, _link: &CommLink) -> Result<()> {
        Ok(())
    }

    fn set_defaults(&mut self, _link: &CommLink) -> Result<()> {
        Ok(())
    }

    fn apply_config(&mut self, _xml: &str) -> Result<bool> {
        Ok(false)
    }
}
