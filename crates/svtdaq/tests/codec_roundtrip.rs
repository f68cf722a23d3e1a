// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic

//! Framing round trip over random payload lengths and datagram sizes.

use svtdaq::transport::codec::{encode_frames, Reassembler};

#[test]
fn test_random_lengths_and_datagram_sizes() {
    let mut rng = fastrand::Rng::with_seed(0x5EED);
    let mut reassembler = Reassembler::new(64 * 1024);

    for case in 0..500 {
        let len = match case {
            0 => 0,
            1 => 1,
            _ => rng.usize(0..4096),
        };
        let max_datagram = rng.usize(3..600);
        let channel = rng.u8(0..4);
        let payload: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();

        let frames = encode_frames(channel, &payload, max_datagram);
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.len() <= max_datagram.max(2)));

        let mut out = None;
        for (i, frame) in frames.iter().enumerate() {
            let got = reassembler
                .push(frame)
                .unwrap_or_else(|e| panic!("case {} (L={}, M={}): frame {}: {}", case, len, max_datagram, i, e));
            assert_eq!(got.is_some(), i == frames.len() - 1, "case {}: EOF on frame {}", case, i);
            out = got;
        }
        let msg = out.expect("message");
        assert_eq!(msg.channel, channel);
        assert_eq!(msg.payload, payload, "case {} (L={}, M={})", case, len, max_datagram);
    }
}

#[test]
fn test_interleaved_sockets_reassemble_independently() {
    let a: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let b: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();
    let fa = encode_frames(1, &a, 64);
    let fb = encode_frames(2, &b, 40);

    let mut ra = Reassembler::new(4096);
    let mut rb = Reassembler::new(4096);
    let (mut got_a, mut got_b) = (None, None);
    for i in 0..fa.len().max(fb.len()) {
        if let Some(f) = fa.get(i) {
            got_a = ra.push(f).expect("a").or(got_a);
        }
        if let Some(f) = fb.get(i) {
            got_b = rb.push(f).expect("b").or(got_b);
        }
    }
    assert_eq!(got_a.expect("a done").payload, a);
    assert_eq!(got_b.expect("b done").payload, b);
}
