// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! svtdaq-dump - print the record timeline of a capture file
//!
//! Data records show their word count and leading words; config and status
//! records show flattened `path = value` pairs, or their raw text.

use anyhow::Context;
use clap::Parser;
use colored::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use svtdaq::capture::flatten_xml;
use svtdaq::{CaptureReader, CaptureRecord, CaptureTimeline, RecordKind};

/// Print the records of a readout capture file
#[derive(Parser, Debug)]
#[command(name = "svtdaq-dump")]
#[command(version, about)]
struct Args {
    /// Capture file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Print config/status records as raw XML
    #[arg(long)]
    raw: bool,

    /// Print only per-kind record counts
    #[arg(short, long)]
    summary: bool,

    /// Leading words shown per data record
    #[arg(short, long, default_value = "8")]
    words: usize,

    /// Resynchronize past corrupt records instead of stopping
    #[arg(long)]
    lenient: bool,
}

#[derive(Default)]
struct Counts {
    per_kind: BTreeMap<&'static str, u64>,
    data_words: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file = File::open(&args.input).with_context(|| format!("opening {}", args.input.display()))?;
    let reader = if args.lenient {
        CaptureReader::lenient(BufReader::new(file))
    } else {
        CaptureReader::new(BufReader::new(file))
    };

    let mut timeline = CaptureTimeline::new(reader);
    let mut counts = Counts::default();
    let mut index = 0u64;
    while let Some(record) = timeline.next() {
        let record = record.with_context(|| format!("record {}", index))?;
        *counts.per_kind.entry(record.kind.name()).or_default() += 1;
        if record.kind == RecordKind::Data {
            counts.data_words += (record.payload.len() / 4) as u64;
        }
        if !args.summary {
            print_record(index, &record, timeline.running(), &args);
        }
        index += 1;
    }

    print_summary(&counts, index);
    Ok(())
}

fn print_record(index: u64, record: &CaptureRecord, running: bool, args: &Args) {
    let badge = match record.kind {
        RecordKind::Data => "DATA".green(),
        RecordKind::Config => "CONFIG".blue(),
        RecordKind::Status => "STATUS".cyan(),
        RecordKind::RunStart => "RUN START".yellow().bold(),
        RecordKind::RunStop => "RUN STOP".yellow().bold(),
    };
    let run = if running { "*".green() } else { " ".normal() };
    print!("{:>8} {} {:<9} ", index, run, badge);

    match record.kind {
        RecordKind::Data => {
            let words = record.words();
            let shown: Vec<String> = words
                .iter()
                .take(args.words)
                .map(|w| format!("{:08X}", w))
                .collect();
            let more = if words.len() > args.words { " ..." } else { "" };
            println!("{} words: {}{}", words.len(), shown.join(" "), more);
        }
        _ => {
            let text = record.text();
            if args.raw {
                println!();
                println!("{}", text.trim_end());
                return;
            }
            match flatten_xml(&text) {
                Ok(flat) if !flat.is_empty() => {
                    println!("{} values", flat.len());
                    for (path, value) in &flat {
                        println!("           {} = {}", path.dimmed(), value);
                    }
                }
                Ok(_) => println!("{} bytes", text.len()),
                Err(e) => println!("{}: {}", "unparsed".red(), e),
            }
        }
    }
}

fn print_summary(counts: &Counts, total: u64) {
    println!();
    println!("{}", "--- Summary ---".dimmed());
    println!("  Records: {}", total);
    for (kind, n) in &counts.per_kind {
        println!("  {:<10} {}", kind, n);
    }
    println!("  Data words: {}", counts.data_words);
}
