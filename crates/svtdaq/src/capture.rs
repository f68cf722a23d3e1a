// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Capture file and monitor stream framing.
//!
//! # Record Format
//!
//! ```text
//! +-----------------------------+---------------------------+
//! | header: u32 little-endian   | payload                   |
//! | tag (4 bits) | count (28)   | count words (Data) or     |
//! |                             | count bytes (other kinds) |
//! +-----------------------------+---------------------------+
//! ```
//!
//! Data payloads are 32-bit words in little-endian order. Config and status
//! payloads are XML text; run markers carry free text.
//!
//! The same framing goes to the capture file and to the monitor socket, so a
//! reader can rebuild the timeline of data interleaved with configuration.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Largest count representable in a record header.
pub const MAX_RECORD_COUNT: u32 = 0x0FFF_FFFF;

/// Record type tag (top 4 bits of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Data = 0,
    Config = 1,
    Status = 2,
    RunStart = 3,
    RunStop = 4,
}

impl RecordKind {
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Data),
            1 => Some(Self::Config),
            2 => Some(Self::Status),
            3 => Some(Self::RunStart),
            4 => Some(Self::RunStop),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Config => "config",
            Self::Status => "status",
            Self::RunStart => "run-start",
            Self::RunStop => "run-stop",
        }
    }

    /// Header for a payload of `len` bytes.
    pub fn header(self, len: usize) -> Result<u32, CaptureError> {
        let count = if self == Self::Data {
            if len % 4 != 0 {
                return Err(CaptureError::Misaligned { len });
            }
            len / 4
        } else {
            len
        };
        if count > MAX_RECORD_COUNT as usize {
            return Err(CaptureError::TooLarge { count });
        }
        Ok((u32::from(self.tag()) << 28) | count as u32)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Capture format errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Truncated record: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unknown record tag {tag}")]
    UnknownTag { tag: u8 },

    #[error("Data payload of {len} bytes is not a whole number of words")]
    Misaligned { len: usize },

    #[error("Record count {count} exceeds the 28-bit header field")]
    TooLarge { count: usize },

    #[error("XML error: {0}")]
    Xml(String),
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl CaptureRecord {
    /// Data payload as words.
    #[must_use]
    pub fn words(&self) -> Vec<u32> {
        self.payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Payload as text (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Writes framed records to any byte sink.
pub struct CaptureWriter<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    /// Write one record; `payload` is already in file byte order.
    pub fn write_record(&mut self, kind: RecordKind, payload: &[u8]) -> Result<(), CaptureError> {
        let header = kind.header(payload.len())?;
        self.inner.write_u32::<LittleEndian>(header)?;
        self.inner.write_all(payload)?;
        self.records += 1;
        Ok(())
    }

    pub fn write_words(&mut self, words: &[u32]) -> Result<(), CaptureError> {
        let mut payload = Vec::with_capacity(words.len() * 4);
        for w in words {
            payload.write_u32::<LittleEndian>(*w)?;
        }
        self.write_record(RecordKind::Data, &payload)
    }

    pub fn write_text(&mut self, kind: RecordKind, text: &str) -> Result<(), CaptureError> {
        self.write_record(kind, text.as_bytes())
    }

    /// Records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads framed records back.
///
/// A strict reader fails on an unknown tag; a lenient one skips it, treating
/// its count as bytes.
pub struct CaptureReader<R: Read> {
    inner: R,
    strict: bool,
    done: bool,
    skipped: u64,
}

impl<R: Read> CaptureReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            strict: true,
            done: false,
            skipped: 0,
        }
    }

    pub fn lenient(inner: R) -> Self {
        Self {
            strict: false,
            ..Self::new(inner)
        }
    }

    /// Records skipped for unknown tags.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next record, `Ok(None)` at a clean end of stream.
    pub fn read_record(&mut self) -> Result<Option<CaptureRecord>, CaptureError> {
        loop {
            let mut head = [0u8; 4];
            let got = read_full(&mut self.inner, &mut head)?;
            if got == 0 {
                return Ok(None);
            }
            if got < head.len() {
                return Err(CaptureError::Truncated { needed: 4, got });
            }
            let header = (&head[..]).read_u32::<LittleEndian>()?;
            let tag = (header >> 28) as u8;
            let count = (header & MAX_RECORD_COUNT) as usize;

            let kind = RecordKind::from_tag(tag);
            let len = match kind {
                Some(RecordKind::Data) => count * 4,
                _ => count,
            };
            let mut payload = vec![0u8; len];
            let got = read_full(&mut self.inner, &mut payload)?;
            if got < len {
                return Err(CaptureError::Truncated { needed: len, got });
            }

            match kind {
                Some(kind) => return Ok(Some(CaptureRecord { kind, payload })),
                None if self.strict => return Err(CaptureError::UnknownTag { tag }),
                None => {
                    log::debug!("[CAPTURE] Skipping record with tag {} ({} bytes)", tag, len);
                    self.skipped += 1;
                }
            }
        }
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<CaptureRecord, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Flatten a config/status snapshot into `outer:inner:leaf` keys.
///
/// The root element is not part of the key. Elements with an `index`
/// attribute contribute `name(index)`. Leaves hold their trimmed text.
pub fn flatten_xml(text: &str) -> Result<BTreeMap<String, String>, CaptureError> {
    let doc = roxmltree::Document::parse(text).map_err(|e| CaptureError::Xml(e.to_string()))?;
    let mut out = BTreeMap::new();
    let mut path = Vec::new();
    for child in doc.root_element().children().filter(roxmltree::Node::is_element) {
        flatten_node(child, &mut path, &mut out);
    }
    Ok(out)
}

fn flatten_node(node: roxmltree::Node<'_, '_>, path: &mut Vec<String>, out: &mut BTreeMap<String, String>) {
    let name = node.tag_name().name();
    path.push(match node.attribute("index") {
        Some(idx) => format!("{}({})", name, idx),
        None => name.to_string(),
    });

    let mut children = node.children().filter(roxmltree::Node::is_element).peekable();
    if children.peek().is_none() {
        out.insert(path.join(":"), node.text().unwrap_or("").trim().to_string());
    } else {
        for child in children {
            flatten_node(child, path, out);
        }
    }
    path.pop();
}

/// Replays a capture stream, tracking the configuration and status in
/// effect at each record.
///
/// Snapshots merge into the running state: a record only carries what
/// changed since the previous one.
pub struct CaptureTimeline<R: Read> {
    reader: CaptureReader<R>,
    config: BTreeMap<String, String>,
    status: BTreeMap<String, String>,
    running: bool,
    data_records: u64,
}

impl<R: Read> CaptureTimeline<R> {
    pub fn new(reader: CaptureReader<R>) -> Self {
        Self {
            reader,
            config: BTreeMap::new(),
            status: BTreeMap::new(),
            running: false,
            data_records: 0,
        }
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    pub fn status(&self) -> &BTreeMap<String, String> {
        &self.status
    }

    /// Whether the last run marker seen was a start.
    pub fn running(&self) -> bool {
        self.running
    }

    pub fn data_records(&self) -> u64 {
        self.data_records
    }

    fn apply(&mut self, rec: &CaptureRecord) {
        match rec.kind {
            RecordKind::Data => self.data_records += 1,
            RecordKind::Config => merge(&mut self.config, rec),
            RecordKind::Status => merge(&mut self.status, rec),
            RecordKind::RunStart => self.running = true,
            RecordKind::RunStop => self.running = false,
        }
    }
}

fn merge(state: &mut BTreeMap<String, String>, rec: &CaptureRecord) {
    match flatten_xml(&rec.text()) {
        Ok(values) => state.extend(values),
        Err(e) => log::warn!("[CAPTURE] Unreadable {} record: {}", rec.kind, e),
    }
}

impl<R: Read> Iterator for CaptureTimeline<R> {
    type Item = Result<CaptureRecord, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.reader.next()?;
        if let Ok(rec) = &item {
            self.apply(rec);
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        assert_eq!(RecordKind::Data.header(40).expect("header"), 10);
        assert_eq!(RecordKind::Config.header(9).expect("header"), 0x1000_0009);
        assert_eq!(RecordKind::RunStop.header(0).expect("header"), 0x4000_0000);
        assert!(matches!(
            RecordKind::Data.header(6),
            Err(CaptureError::Misaligned { len: 6 })
        ));
    }

    #[test]
    fn test_write_then_read_stream() {
        let mut w = CaptureWriter::new(Vec::new());
        w.write_text(RecordKind::Config, "<config/>").expect("write");
        w.write_words(&[1, 2, 0xDEAD_BEEF]).expect("write");
        assert_eq!(w.records(), 2);
        let bytes = w.into_inner();
        assert_eq!(&bytes[..4], &[9, 0, 0, 0x10]);

        let recs: Vec<_> = CaptureReader::new(Cursor::new(bytes))
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].kind, RecordKind::Config);
        assert_eq!(recs[0].text(), "<config/>");
        assert_eq!(recs[1].words(), vec![1, 2, 0xDEAD_BEEF]);
    }

    #[test]
    fn test_truncated_tail() {
        let mut w = CaptureWriter::new(Vec::new());
        w.write_words(&[1, 2, 3]).expect("write");
        let mut bytes = w.into_inner();
        bytes.truncate(bytes.len() - 2);
        let mut r = CaptureReader::new(Cursor::new(bytes));
        assert!(matches!(
            r.next(),
            Some(Err(CaptureError::Truncated { needed: 12, got: 10 }))
        ));
        assert!(r.next().is_none());
    }

    #[test]
    fn test_unknown_tag_strict_and_lenient() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(0x7000_0002u32).to_le_bytes());
        bytes.extend_from_slice(b"xy");
        bytes.extend_from_slice(&(0x2000_0001u32).to_le_bytes());
        bytes.push(b's');

        let mut strict = CaptureReader::new(Cursor::new(bytes.clone()));
        assert!(matches!(
            strict.next(),
            Some(Err(CaptureError::UnknownTag { tag: 7 }))
        ));

        let mut lenient = CaptureReader::lenient(Cursor::new(bytes));
        let rec = lenient.next().expect("record").expect("ok");
        assert_eq!(rec.kind, RecordKind::Status);
        assert_eq!(lenient.skipped(), 1);
    }

    #[test]
    fn test_flatten_indexed_structures() {
        let xml = r#"<config>
            <RunRate>10Hz</RunRate>
            <FebFpga index="3"><Temp> 41.5 </Temp><Hybrid index="1"><Bias>100</Bias></Hybrid></FebFpga>
        </config>"#;
        let flat = flatten_xml(xml).expect("flatten");
        assert_eq!(flat.get("RunRate").map(String::as_str), Some("10Hz"));
        assert_eq!(flat.get("FebFpga(3):Temp").map(String::as_str), Some("41.5"));
        assert_eq!(flat.get("FebFpga(3):Hybrid(1):Bias").map(String::as_str), Some("100"));
    }

    #[test]
    fn test_timeline_tracks_state() {
        let mut w = CaptureWriter::new(Vec::new());
        w.write_text(RecordKind::Config, "<config><RunRate>1Hz</RunRate><RunCount>5</RunCount></config>")
            .expect("write");
        w.write_text(RecordKind::RunStart, "").expect("write");
        w.write_words(&[0xA]).expect("write");
        w.write_text(RecordKind::Config, "<config><RunRate>10Hz</RunRate></config>")
            .expect("write");
        w.write_text(RecordKind::RunStop, "").expect("write");

        let mut timeline = CaptureTimeline::new(CaptureReader::new(Cursor::new(w.into_inner())));
        let mut seen_running_data = false;
        while let Some(rec) = timeline.next() {
            let rec = rec.expect("record");
            if rec.kind == RecordKind::Data {
                seen_running_data = timeline.running();
                assert_eq!(timeline.config()["RunRate"], "1Hz");
            }
        }
        assert!(seen_running_data);
        assert!(!timeline.running());
        assert_eq!(timeline.config()["RunRate"], "10Hz");
        assert_eq!(timeline.config()["RunCount"], "5");
        assert_eq!(timeline.data_records(), 1);
    }
}
