// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Run/Poll orchestrator.
//!
//! A [`System`] owns the top-level variables, the software run timer and a
//! [`DeviceTree`]. The hosting process feeds it `<system>` documents through
//! [`System::parse_xml_string`] and calls [`System::poll`] on a fixed
//! cadence; `poll` returns a `<system>` message only when something changed.
//!
//! ```text
//!  parse_xml_string ─> <config>  ─> system vars, then DeviceTree::apply_config
//!                  └─> <command> ─> built-in command or DeviceTree::command
//!
//!  poll ─> run completion ─> status read ─> SystemState ─> 1 Hz counters
//!       ─> <system> message ─> config/status records into the capture file
//! ```

mod device;
mod run;
pub mod xml;

pub use device::{DeviceTree, NullDevice};
pub use run::{parse_run_rate, RunTimer};

use crate::config::DEFAULT_RUN_COUNT;
use crate::error::{Error, Result};
use crate::link::{CommLink, RunMarker};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use xml::{push_element, push_error, Directive};

/// Run rates offered to operators; any `<n>Hz` is accepted.
pub const RUN_RATES: [&str; 4] = ["1Hz", "10Hz", "100Hz", "120Hz"];

pub const STATE_STOPPED: &str = "Stopped";
pub const STATE_RUNNING: &str = "Running";

const MSG_NOT_CONFIGURED: &str = "System Is Not Configured. Set Defaults Or Load Settings!";
const MSG_ERROR: &str = "A System Error Has Occurred! Please HardReset and then configure!";
const MSG_READY: &str = "System Ready To Take Data.";
const MSG_RUNNING: &str = "System Is Running.";

/// Configuration variables owned by the system itself.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SystemConfig {
    run_rate: String,
    run_count: u32,
    data_file: String,
    debug_enable: bool,
    debug_cmd_time: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            run_rate: RUN_RATES[0].to_string(),
            run_count: DEFAULT_RUN_COUNT,
            data_file: String::new(),
            debug_enable: true,
            debug_cmd_time: true,
        }
    }
}

/// Per-second counter with rate.
#[derive(Debug, Default, Clone, Copy)]
struct RateCounter {
    last: u64,
    text_count: u64,
    rate: u64,
}

impl RateCounter {
    fn update(&mut self, current: u64) {
        self.rate = current.saturating_sub(self.last);
        self.last = current;
        self.text_count = current;
    }

    fn text(&self) -> String {
        format!("{} - {} Hz", self.text_count, self.rate)
    }
}

/// Top-level orchestrator around one link and one device tree.
pub struct System {
    link: Arc<CommLink>,
    device: Box<dyn DeviceTree>,
    config: SystemConfig,
    timer: RunTimer,

    run_state: &'static str,
    /// State to return to when the current run ends.
    run_return: &'static str,
    data_open: bool,
    configure_msg: String,
    error_state: bool,
    defaults_file: Option<String>,

    data_file_count: RateCounter,
    data_rx_count: RateCounter,
    reg_rx_count: u64,
    timeout_count: u64,
    error_count: u64,
    unexpected_count: u64,
    last_second: u64,

    errors: String,
    top_status_req: bool,
    all_status_req: bool,
    all_config_req: bool,
}

impl System {
    pub fn new(link: Arc<CommLink>, device: Box<dyn DeviceTree>) -> Self {
        let config = SystemConfig::default();
        link.set_debug(config.debug_enable);
        Self {
            link,
            device,
            config,
            timer: RunTimer::new(),
            run_state: STATE_STOPPED,
            run_return: STATE_STOPPED,
            data_open: false,
            configure_msg: MSG_NOT_CONFIGURED.to_string(),
            error_state: false,
            defaults_file: None,
            data_file_count: RateCounter::default(),
            data_rx_count: RateCounter::default(),
            reg_rx_count: 0,
            timeout_count: 0,
            error_count: 0,
            unexpected_count: 0,
            last_second: 0,
            errors: String::new(),
            top_status_req: false,
            all_status_req: false,
            all_config_req: false,
        }
    }

    pub fn link(&self) -> &Arc<CommLink> {
        &self.link
    }

    pub fn device(&self) -> &dyn DeviceTree {
        self.device.as_ref()
    }

    /// File applied by the `SetDefaults` command.
    pub fn set_defaults_file(&mut self, path: impl Into<String>) {
        self.defaults_file = Some(path.into());
    }

    pub fn run_state(&self) -> &'static str {
        self.run_state
    }

    pub fn run_progress(&self) -> u32 {
        self.timer.progress()
    }

    pub fn data_open(&self) -> bool {
        self.data_open
    }

    /// Current `SystemState` text.
    pub fn system_state(&self) -> String {
        let line = if self.error_state {
            MSG_ERROR.to_string()
        } else if let Some(local) = self.device.local_state() {
            local
        } else if self.run_state == STATE_RUNNING {
            MSG_RUNNING.to_string()
        } else {
            MSG_READY.to_string()
        };
        if self.error_state {
            line
        } else {
            format!("{}\n{}", self.configure_msg, line)
        }
    }

    // ========================================================================
    // Variables
    // ========================================================================

    /// Set one system configuration variable. Returns whether it changed.
    pub fn set_variable(&mut self, name: &str, value: &str) -> Result<bool> {
        let value = value.trim();
        let changed = match name {
            "RunRate" => {
                parse_run_rate(value)?;
                replace(&mut self.config.run_rate, value.to_string())
            }
            "RunCount" => {
                let count = crate::config::parse_number(value)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| Error::Config(format!("bad RunCount '{}'", value)))?;
                replace(&mut self.config.run_count, count)
            }
            "DataFile" => replace(&mut self.config.data_file, value.to_string()),
            "DebugEnable" => {
                let on = parse_bool(value)?;
                self.link.set_debug(on);
                replace(&mut self.config.debug_enable, on)
            }
            "DebugCmdTime" => replace(&mut self.config.debug_cmd_time, parse_bool(value)?),
            _ => return Err(Error::InvalidArgument(format!("unknown system variable {}", name))),
        };
        Ok(changed)
    }

    /// Read a system variable (configuration or status) as text.
    pub fn variable(&self, name: &str) -> Option<String> {
        Some(match name {
            "RunRate" => self.config.run_rate.clone(),
            "RunCount" => self.config.run_count.to_string(),
            "DataFile" => self.config.data_file.clone(),
            "DebugEnable" => bool_text(self.config.debug_enable).to_string(),
            "DebugCmdTime" => bool_text(self.config.debug_cmd_time).to_string(),
            "RunState" => self.run_state.to_string(),
            "RunProgress" => self.timer.progress().to_string(),
            "DataOpen" => bool_text(self.data_open).to_string(),
            "DataFileCount" => self.data_file_count.text(),
            "DataRxCount" => self.data_rx_count.text(),
            "RegRxCount" => self.reg_rx_count.to_string(),
            "TimeoutCount" => self.timeout_count.to_string(),
            "ErrorCount" => self.error_count.to_string(),
            "UnexpectedCount" => self.unexpected_count.to_string(),
            "SystemState" => self.system_state(),
            _ => return None,
        })
    }

    const CONFIG_VARS: [&'static str; 5] = ["RunRate", "RunCount", "DataFile", "DebugEnable", "DebugCmdTime"];

    const STATUS_VARS: [&'static str; 10] = [
        "RunState",
        "RunProgress",
        "DataOpen",
        "DataFileCount",
        "DataRxCount",
        "RegRxCount",
        "TimeoutCount",
        "ErrorCount",
        "UnexpectedCount",
        "SystemState",
    ];

    /// `<config>` with the system variables and, if `full`, the device tree.
    pub fn config_string(&self, full: bool) -> String {
        let mut out = String::from("<config>\n");
        for name in Self::CONFIG_VARS {
            if let Some(value) = self.variable(name) {
                push_element(&mut out, name, &value);
            }
        }
        if full {
            out.push_str(&self.device.config_xml());
        }
        out.push_str("</config>\n");
        out
    }

    /// `<status>` with the system variables and, if `full`, the device tree.
    pub fn status_string(&self, full: bool) -> String {
        let mut out = String::from("<status>\n");
        for name in Self::STATUS_VARS {
            if let Some(value) = self.variable(name) {
                push_element(&mut out, name, &value);
            }
        }
        if full {
            out.push_str(&self.device.status_xml());
        }
        out.push_str("</status>\n");
        out
    }

    pub fn structure_string(&self) -> String {
        format!(
            "<system>\n<structure>\n{}</structure>\n</system>\n",
            self.device.structure_xml()
        )
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Execute a built-in command, or hand it to the device tree.
    pub fn command(&mut self, name: &str, arg: &str) -> Result<()> {
        let start = Instant::now();
        let result = self.dispatch(name, arg);
        if self.config.debug_cmd_time {
            log::info!("[SYSTEM] Command {} took {:?}", name, start.elapsed());
        }
        result
    }

    fn dispatch(&mut self, name: &str, arg: &str) -> Result<()> {
        let link = Arc::clone(&self.link);
        match name {
            "SetDefaults" => {
                self.device.set_defaults(&link)?;
                match self.defaults_file.clone() {
                    Some(path) => self.parse_xml_file(&path)?,
                    None => {
                        self.all_config_req = true;
                        self.all_status_req = true;
                    }
                }
            }
            "ReadXmlFile" => self.parse_xml_file(arg)?,
            "WriteConfigXml" => {
                self.device.read_config(&link)?;
                write_file(arg, &format!("<system>\n{}</system>\n", self.config_string(true)))?;
            }
            "WriteStatusXml" => {
                self.device.read_status(&link)?;
                write_file(arg, &format!("<system>\n{}</system>\n", self.status_string(true)))?;
            }
            "WriteStructureXml" => write_file(arg, &self.structure_string())?,
            "OpenDataFile" => self.open_data_file()?,
            "CloseDataFile" => self.close_data_file()?,
            "ReadConfig" => {
                self.device.read_config(&link)?;
                self.all_config_req = true;
            }
            "ReadStatus" | "RefreshState" => self.all_status_req = true,
            "VerifyConfig" => {
                self.device.verify_config(&link)?;
                self.all_status_req = true;
            }
            "ResetCount" => {
                link.clear_counters();
                self.device.count_reset(&link)?;
            }
            "SetRunState" => self.set_run_state(arg)?,
            "HardReset" => {
                self.configure_msg = MSG_NOT_CONFIGURED.to_string();
                self.error_state = false;
                self.stop_run();
                self.close_data_file()?;
                self.device.hard_reset(&link)?;
                self.top_status_req = true;
            }
            "SoftReset" => {
                self.stop_run();
                self.close_data_file()?;
                self.device.soft_reset(&link)?;
                self.all_status_req = true;
            }
            _ => self.device.command(&link, name, arg)?,
        }
        Ok(())
    }

    fn open_data_file(&mut self) -> Result<()> {
        self.close_data_file()?;
        if self.config.data_file.is_empty() {
            return Err(Error::Config("DataFile is not set".into()));
        }
        self.link.open_data_file(&self.config.data_file)?;
        self.link.add_config(&self.config_string(true))?;
        self.device.read_status(&self.link)?;
        self.link.add_status(&self.status_string(true))?;
        self.data_open = true;
        if self.run_state == STATE_RUNNING {
            self.link.add_run_marker(RunMarker::Start, &self.status_string(false))?;
        }
        Ok(())
    }

    fn close_data_file(&mut self) -> Result<()> {
        if !self.data_open {
            return Ok(());
        }
        self.data_open = false;
        let result = self
            .device
            .read_status(&self.link)
            .and_then(|()| self.link.add_status(&self.status_string(true)));
        self.link.close_data_file();
        result
    }

    /// `"Running"` starts a software run, `"Stopped"` requests its end.
    pub fn set_run_state(&mut self, state: &str) -> Result<()> {
        match state.trim() {
            STATE_STOPPED => {
                self.timer.request_stop();
                Ok(())
            }
            STATE_RUNNING if self.timer.is_active() => Ok(()),
            STATE_RUNNING => self.start_run(),
            other => Err(Error::InvalidArgument(format!("bad run state '{}'", other))),
        }
    }

    fn start_run(&mut self) -> Result<()> {
        let period = parse_run_rate(&self.config.run_rate)?;
        self.run_return = self.run_state;
        self.emit_marker(RunMarker::Start);
        self.run_state = STATE_RUNNING;
        if let Err(e) = self.timer.start(Arc::clone(&self.link), period, self.config.run_count) {
            self.run_state = self.run_return;
            self.emit_marker(RunMarker::Stop);
            return Err(e);
        }
        Ok(())
    }

    /// Stop a running run now and restore the previous state.
    fn stop_run(&mut self) {
        if self.timer.is_active() {
            self.timer.stop();
            self.finish_run();
        }
    }

    fn finish_run(&mut self) {
        self.run_state = self.run_return;
        self.all_status_req = true;
        self.emit_marker(RunMarker::Stop);
        log::info!("[SYSTEM] Run ended after {} triggers", self.timer.issued());
    }

    fn emit_marker(&mut self, marker: RunMarker) {
        if !self.data_open {
            return;
        }
        if let Err(e) = self.link.add_run_marker(marker, &self.status_string(false)) {
            log::warn!("[SYSTEM] Run marker not recorded: {}", e);
        }
    }

    // ========================================================================
    // XML input
    // ========================================================================

    fn parse_xml(&mut self, text: &str, force: bool) -> Result<bool> {
        let mut updated = false;
        for directive in xml::parse_envelope(text)? {
            match directive {
                Directive::Config { leaves, xml } => {
                    let mut changed = false;
                    for (name, value) in &leaves {
                        if Self::CONFIG_VARS.contains(&name.as_str()) {
                            changed |= self.set_variable(name, value)?;
                        }
                    }
                    changed |= self.device.apply_config(&xml)?;
                    if changed || force {
                        self.device.write_config(&self.link, force)?;
                        if force {
                            self.device.verify_config(&self.link)?;
                        }
                        updated = true;
                    }
                }
                Directive::Command { name, arg } => self.command(&name, &arg)?,
            }
        }
        Ok(updated)
    }

    /// Apply a `<system>` document; failures are reported by the next `poll`.
    pub fn parse_xml_string(&mut self, text: &str) {
        match self.parse_xml(text, false) {
            Ok(true) => self.all_config_req = true,
            Ok(false) => {}
            Err(e) => self.record_error(&e),
        }
        self.top_status_req = true;
    }

    /// Stop any run, close the data file and apply `path` with force.
    pub fn parse_xml_file(&mut self, path: &str) -> Result<()> {
        self.stop_run();
        self.close_data_file()?;
        let text = fs::read_to_string(path).map_err(|e| Error::InvalidArgument(format!("cannot read {}: {}", path, e)))?;
        self.parse_xml(&text, true)?;

        let name = Path::new(path)
            .file_name()
            .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned());
        self.configure_msg = format!("System Configured From {}.", name);
        log::info!("[SYSTEM] {}", self.configure_msg);
        self.all_status_req = true;
        self.all_config_req = true;
        Ok(())
    }

    fn record_error(&mut self, error: &Error) {
        log::warn!("[SYSTEM] {}", error);
        push_error(&mut self.errors, &error.to_string());
        self.error_state = true;
    }

    // ========================================================================
    // Poll
    // ========================================================================

    /// One orchestrator tick. Returns the outgoing `<system>` message, if any.
    pub fn poll(&mut self) -> Option<String> {
        if self.link.debug() != self.config.debug_enable {
            self.link.set_debug(self.config.debug_enable);
        }

        if self.timer.collect_finished() {
            self.finish_run();
        }

        if self.all_status_req {
            if let Err(e) = self.device.read_status(&self.link) {
                self.record_error(&e);
            }
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        if now != self.last_second {
            self.last_second = now;
            self.refresh_counters();
            self.top_status_req = true;
        }

        let mut send = false;
        let mut msg = String::from("<system>\n");
        if !self.errors.is_empty() {
            msg.push_str(&std::mem::take(&mut self.errors));
            send = true;
        }
        if self.top_status_req || self.all_status_req {
            msg.push_str(&self.status_string(self.all_status_req));
            send = true;
        }
        if self.all_config_req {
            msg.push_str(&self.config_string(true));
            send = true;
        }
        msg.push_str("</system>\n");

        if self.data_open {
            let mut inject = Ok(());
            if self.all_config_req {
                inject = self.link.add_config(&self.config_string(true));
            }
            if inject.is_ok() && (self.all_status_req || self.all_config_req) {
                inject = self.link.add_status(&self.status_string(true));
            }
            if let Err(e) = inject {
                log::warn!("[SYSTEM] Snapshot not recorded: {}", e);
            }
        }

        self.top_status_req = false;
        self.all_status_req = false;
        self.all_config_req = false;

        send.then_some(msg)
    }

    fn refresh_counters(&mut self) {
        let c = self.link.counters();
        self.reg_rx_count = c.reg_rx_count;
        self.timeout_count = c.timeout_count;
        self.error_count = c.error_count;
        self.unexpected_count = c.unexpected_count;
        self.data_file_count.update(c.data_file_count);
        self.data_rx_count.update(c.data_rx_count);
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.stop_run();
        if let Err(e) = self.close_data_file() {
            log::warn!("[SYSTEM] Closing data file: {}", e);
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "True" | "true" | "1" => Ok(true),
        "False" | "false" | "0" => Ok(false),
        other => Err(Error::Config(format!("expected True or False, got '{}'", other))),
    }
}

fn bool_text(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn write_file(path: &str, text: &str) -> Result<()> {
    fs::write(path, text).map_err(|e| Error::InvalidArgument(format!("cannot write {}: {}", path, e)))
}
