// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! svtdaq-shm-viewer - Inspect the shared-memory relay segments
//!
//! Displays the data ring occupancy, the command mailbox handshake and the
//! status mailbox values.

use clap::{Parser, Subcommand};
use colored::*;
use std::time::Duration;
use svtdaq::config::{CONTROL_MAILBOX_NAME, DATA_RING_NAME, STATUS_MAILBOX_NAME};
use svtdaq::shm::{ControlMailbox, DataRing, ShmSegment, StatusMailbox};

/// Inspect svtdaq shared-memory relay segments
#[derive(Parser, Debug)]
#[command(name = "svtdaq-shm-viewer")]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    segment: Option<Segment>,

    /// Re-render every N milliseconds until interrupted
    #[arg(short, long, value_name = "MS", global = true)]
    watch: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
enum Segment {
    /// Data ring: free list, receive lists, trigger ack
    Ring {
        #[arg(long, default_value = DATA_RING_NAME)]
        name: String,
    },
    /// Command mailbox: handshake counters and last text
    Control {
        #[arg(long, default_value = CONTROL_MAILBOX_NAME)]
        name: String,
    },
    /// Status mailbox: handshake counters and values
    Status {
        #[arg(long, default_value = STATUS_MAILBOX_NAME)]
        name: String,

        /// Show all values, including zeros
        #[arg(short, long)]
        all: bool,
    },
}

fn main() {
    let args = Args::parse();

    loop {
        if args.watch.is_some() {
            // clear screen, cursor home
            print!("\x1B[2J\x1B[H");
        }
        if let Err(e) = render(args.segment.as_ref()) {
            eprintln!("{}: {}", "Error".red().bold(), e);
            if args.watch.is_none() {
                std::process::exit(1);
            }
        }
        match args.watch {
            Some(ms) => std::thread::sleep(Duration::from_millis(ms.max(10))),
            None => break,
        }
    }
}

fn render(segment: Option<&Segment>) -> Result<(), Box<dyn std::error::Error>> {
    match segment {
        Some(Segment::Ring { name }) => print_ring(name),
        Some(Segment::Control { name }) => print_control(name),
        Some(Segment::Status { name, all }) => print_status(name, *all),
        None => {
            println!();
            println!("{}", "=== svtdaq Shared Memory Segments ===".bold());
            println!();
            for name in [DATA_RING_NAME, CONTROL_MAILBOX_NAME, STATUS_MAILBOX_NAME] {
                let badge = if ShmSegment::exists(name) {
                    "PRESENT".green()
                } else {
                    "ABSENT".yellow()
                };
                println!("  {} {}", badge, name.cyan());
            }
            println!();
            Ok(())
        }
    }
}

fn print_ring(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snap = DataRing::snapshot(name)?;
    let layout = snap.layout;
    let queued: u32 = snap.rx.iter().sum();
    let in_flight = layout.slot_count.saturating_sub(snap.free + queued);

    println!();
    println!("{} {}", "DATA RING".green(), name.cyan());
    println!(
        "      Slots: {} x {} words ({})",
        layout.slot_count,
        layout.slot_words,
        format_size(u64::from(layout.slot_count) * layout.slot_bytes() as u64)
    );
    println!(
        "      Free: {}  Queued: {}  Held: {}",
        snap.free.to_string().green(),
        queued.to_string().yellow(),
        in_flight
    );
    let listen = if snap.listen_active {
        "ACTIVE".green()
    } else {
        "IDLE".dimmed()
    };
    println!("      Consumer: [{}]", listen);
    for (list, count) in snap.rx.iter().enumerate() {
        let pct = f64::from(*count) / f64::from(layout.slot_count.max(1)) * 100.0;
        println!("      rx[{}]: {:>6} ({:.1}%)", list, count, pct);
    }
    let ack = if snap.ack_request == snap.ack_sent {
        "idle".normal()
    } else {
        "PENDING".yellow()
    };
    println!(
        "      Trigger ack: {} (requested {}, sent {})",
        ack, snap.ack_request, snap.ack_sent
    );
    println!();
    Ok(())
}

fn print_control(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snap = ControlMailbox::snapshot(name)?;
    println!();
    println!("{} {}", "CONTROL".blue(), name.cyan());
    let state = if snap.ready == snap.ack {
        "taken".green()
    } else {
        "PENDING".yellow()
    };
    println!("      Handshake: {} (ready {}, ack {})", state, snap.ready, snap.ack);
    if snap.text.is_empty() {
        println!("      Last text: {}", "(none)".dimmed());
    } else {
        println!("      Last text ({} bytes):", snap.text.len());
        for line in snap.text.lines() {
            println!("        {}", line);
        }
    }
    println!();
    Ok(())
}

fn print_status(name: &str, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let snap = StatusMailbox::snapshot(name)?;
    println!();
    println!("{} {}", "STATUS".cyan(), name.cyan());
    let state = if snap.ready == snap.ack {
        "taken".green()
    } else {
        "PENDING".yellow()
    };
    println!("      Handshake: {} (ready {}, ack {})", state, snap.ready, snap.ack);
    let mut shown = 0;
    for (index, value) in snap.values.iter().enumerate() {
        if all || *value != 0.0 {
            println!("      [{:>3}] {}", index, value);
            shown += 1;
        }
    }
    if shown == 0 {
        println!("      {}", "all values zero".dimmed());
    }
    println!();
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
