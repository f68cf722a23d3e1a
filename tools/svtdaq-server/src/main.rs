// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! svtdaq-server - readout control daemon
//!
//! Hosts a `System` over a UDP or Tracker link:
//! - `<system>` documents arrive through the command mailbox
//! - link counters are published to the status mailbox once per second
//! - event data goes to the monitoring socket, and in Tracker mode to the
//!   shared-memory data ring
//!
//! # Usage
//!
//! ```bash
//! # Two boards, plain UDP link
//! svtdaq-server --host 192.168.0.16 --host 192.168.0.17
//!
//! # Tracker mode with a defaults file applied at startup
//! svtdaq-server --tracker --defaults defaults.xml --log-level debug
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use svtdaq::config::{CONTROL_MAILBOX_NAME, DATA_RING_NAME, STATUS_MAILBOX_NAME};
use svtdaq::shm::{ControlMailbox, DataRing, RingLayout, ShmSegment, StatusMailbox, StatusWriter};
use svtdaq::{Command, CommLink, LinkConfig, NullDevice, System, TrackerDriver, UdpDriver};

/// Readout control daemon
#[derive(Parser, Debug)]
#[command(name = "svtdaq-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Board UDP port
    #[arg(short, long, default_value = "8192")]
    port: u16,

    /// Board address, one socket per host (repeatable)
    #[arg(long = "host", default_value = "192.168.0.16")]
    hosts: Vec<String>,

    /// Largest register transfer in words
    #[arg(long, default_value = "500000")]
    max_rx_tx: usize,

    /// Relay event data through the shared-memory data ring
    #[arg(long)]
    tracker: bool,

    /// Monitoring socket destination (HOST:PORT)
    #[arg(long, default_value = "127.0.0.1:8099")]
    data_net: String,

    /// Configuration file applied at startup and on SetDefaults
    #[arg(long)]
    defaults: Option<PathBuf>,

    /// Software trigger opcode sent on every run tick
    #[arg(long, value_parser = parse_opcode)]
    run_opcode: Option<u32>,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "100")]
    poll_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_opcode(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("bad opcode '{}': {}", s, e))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let (net_host, net_port) = args
        .data_net
        .rsplit_once(':')
        .context("--data-net must be HOST:PORT")?;
    let net_port: u16 = net_port.parse().context("--data-net port")?;
    if args.hosts.is_empty() {
        bail!("at least one --host is required");
    }
    let hosts: Vec<&str> = args.hosts.iter().map(String::as_str).collect();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut control = ControlMailbox::create_receiver(CONTROL_MAILBOX_NAME).context("control mailbox")?;
    let mut status = StatusMailbox::create_writer(STATUS_MAILBOX_NAME).context("status mailbox")?;

    let config = LinkConfig::from_env().with_max_rx_tx(args.max_rx_tx);
    let link = Arc::new(CommLink::new(config.clone()));
    if args.tracker {
        let ring = DataRing::create(DATA_RING_NAME, RingLayout::default()).context("data ring")?;
        link.open(TrackerDriver::connect(args.port, &hosts, &config, ring)?)?;
    } else {
        link.open(UdpDriver::connect(args.port, &hosts, &config)?)?;
    }
    link.open_data_net(net_host, net_port)?;
    if let Some(opcode) = args.run_opcode {
        link.set_run_command(0, Some(&Command::new("RunTrigger", opcode)));
    }

    log::info!("+----------------------------------------------------+");
    log::info!("|  svtdaq-server v{:35}|", env!("CARGO_PKG_VERSION"));
    log::info!("+----------------------------------------------------+");
    log::info!("|  Link:    {:41}|", if args.tracker { "tracker" } else { "udp" });
    log::info!("|  Boards:  {:41}|", format!("{} on port {}", args.hosts.join(","), args.port));
    log::info!("|  Monitor: {:41}|", args.data_net);
    log::info!("+----------------------------------------------------+");

    let mut system = System::new(Arc::clone(&link), Box::new(NullDevice));
    if let Some(path) = &args.defaults {
        let path = path.to_string_lossy().into_owned();
        system.set_defaults_file(path.clone());
        system
            .parse_xml_file(&path)
            .with_context(|| format!("applying defaults {}", path))?;
    }

    let poll_interval = Duration::from_millis(args.poll_ms.max(1));
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(poll_interval);

        if let Some(text) = control.take() {
            log::debug!("[SERVER] Command document:\n{}", text);
            system.parse_xml_string(&text);
        }
        if let Some(msg) = system.poll() {
            log::debug!("[SERVER] Outgoing:\n{}", msg);
        }
        if last_status.elapsed() >= Duration::from_secs(1) {
            last_status = Instant::now();
            if let Err(e) = publish_status(&mut status, &system) {
                log::warn!("[SERVER] Status not published: {}", e);
            }
        }
    }

    log::info!("[SERVER] Shutting down");
    drop(system);
    link.close();
    for name in [CONTROL_MAILBOX_NAME, STATUS_MAILBOX_NAME, DATA_RING_NAME] {
        if let Err(e) = ShmSegment::unlink(name) {
            log::warn!("[SERVER] Unlink {}: {}", name, e);
        }
    }
    Ok(())
}

/// Status mailbox layout, one f64 per index.
fn publish_status(writer: &mut StatusWriter, system: &System) -> svtdaq::shm::Result<()> {
    let c = system.link().counters();
    let values = [
        c.data_rx_count as f64,
        c.data_file_count as f64,
        c.reg_rx_count as f64,
        c.timeout_count as f64,
        c.error_count as f64,
        c.unexpected_count as f64,
        c.data_drop_count as f64,
        f64::from(system.run_progress()),
        if system.run_state() == "Running" { 1.0 } else { 0.0 },
        if system.data_open() { 1.0 } else { 0.0 },
    ];
    for (index, v) in values.into_iter().enumerate() {
        writer.set(index, v)?;
    }
    writer.publish();
    Ok(())
}
