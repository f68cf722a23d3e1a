// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport-free driver: acknowledges every request immediately.

use super::driver::{DriverContext, DriverHandles, LinkDriver, Outgoing, TxCursor};
use crate::error::Result;
use crate::transport::message::RegisterResponse;
use crossbeam::channel::Receiver;
use std::thread;

/// Completes register and command requests without touching register
/// contents, and optionally forwards software-generated data buffers.
#[derive(Default)]
pub struct LoopbackDriver {
    data: Option<Receiver<Vec<u32>>>,
}

impl LoopbackDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward buffers received on `data` into the data queue.
    #[must_use]
    pub fn with_data(data: Receiver<Vec<u32>>) -> Self {
        Self { data: Some(data) }
    }
}

impl LinkDriver for LoopbackDriver {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn start(self, ctx: DriverContext) -> Result<DriverHandles> {
        let handle = thread::Builder::new()
            .name("svtdaq-loopback".to_string())
            .spawn(move || run(ctx, self.data))?;
        Ok(DriverHandles {
            threads: vec![handle],
            ring: None,
        })
    }
}

fn run(ctx: DriverContext, data: Option<Receiver<Vec<u32>>>) {
    let shared = &ctx.shared;
    let mut cursor = TxCursor::new();
    while shared.running() {
        for out in cursor.take(shared) {
            match out {
                Outgoing::Run(_) => {}
                Outgoing::Register { seq, .. } => {
                    shared.registers.complete(seq, RegisterResponse::ok());
                }
                Outgoing::Command { seq, .. } => {
                    shared.commands.complete(seq, ());
                }
            }
        }
        if let Some(rx) = &data {
            while let Ok(words) = rx.try_recv() {
                ctx.data.push_words(words);
            }
        }
        cursor.wait(shared, ctx.config.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::link::{CommLink, DataRecord};
    use crossbeam::channel::unbounded;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_forwards_software_data() {
        let (tx, rx) = unbounded();
        let link = CommLink::new(LinkConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            link.set_data_callback(Some(Box::new(move |rec: &DataRecord<'_>| seen.lock().push(rec.words()))));
        }
        link.open(LoopbackDriver::with_data(rx)).expect("open");
        tx.send(vec![1, 2, 3]).expect("send");
        tx.send(vec![4]).expect("send");

        let deadline = Instant::now() + Duration::from_secs(2);
        while link.counters().data_rx_count < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        link.close();
        assert_eq!(*seen.lock(), vec![vec![1, 2, 3], vec![4]]);
    }
}
