//! Subscriber-side receiver
//!
//! Turns the inbound byte stream back into per-source sample blocks.
//!
//! # Dispatch
//!
//! ```text
//! socket ─► LineBuffer ─► "! <id> ..." ─► per-source SampleBlock ─► ClientQueues
//!                     └─► anything else ─────────────────────────► reply channel
//! ```
//!
//! Sample lines of one read burst are coalesced into one block per source
//! before publishing. Reply lines are forwarded so protocol commands keep
//! working while data is streaming.

use crate::core::types::{ClientId, Continuity, SampleBlock, SequenceTracker};
use crate::error::Result;
use crate::streaming::wire;
use crate::streaming::{BoundedQueue, Burst, DropMonitor, LineBuffer, Put, WatchGate, read_burst};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest park on a closed gate before re-checking the running flag
const GATE_WAIT: Duration = Duration::from_secs(1);

/// Client-side queues, one per known source
pub struct ClientQueues {
    queues: Mutex<BTreeMap<ClientId, BoundedQueue<SampleBlock>>>,
    capacity: usize,
}

impl ClientQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Queue of `source`, created on first use
    pub fn ensure(&self, source: ClientId) -> BoundedQueue<SampleBlock> {
        self.queues
            .lock()
            .entry(source)
            .or_insert_with(|| BoundedQueue::new(self.capacity))
            .clone()
    }

    pub fn get(&self, source: ClientId) -> Option<BoundedQueue<SampleBlock>> {
        self.queues.lock().get(&source).cloned()
    }

    /// Drop the queues of sources not in `keep`
    pub fn retain(&self, keep: &[ClientId]) {
        self.queues.lock().retain(|id, _| keep.contains(id));
    }
}

/// Read side of a subscriber connection
pub struct InboundStream<R> {
    reader: R,
    buffer: LineBuffer,
    trackers: BTreeMap<ClientId, SequenceTracker>,
    drops: BTreeMap<ClientId, DropMonitor>,
    replies: Sender<String>,
    queues: Arc<ClientQueues>,
}

impl<R: Read> InboundStream<R> {
    pub fn new(reader: R, replies: Sender<String>, queues: Arc<ClientQueues>) -> Self {
        Self {
            reader,
            buffer: LineBuffer::new(),
            trackers: BTreeMap::new(),
            drops: BTreeMap::new(),
            replies,
            queues,
        }
    }

    /// Perform one bounded read and dispatch every completed line
    ///
    /// Errors only on EOF or a socket failure.
    pub fn read_once(&mut self) -> Result<()> {
        match read_burst(&mut self.reader, &mut self.buffer)? {
            Burst::Idle => {}
            Burst::Lines(lines) => self.dispatch(lines),
            Burst::Overflow(lines) => {
                log::warn!("Over-long line from broker discarded");
                self.dispatch(lines);
            }
        }
        Ok(())
    }

    /// Route reply lines and publish sample lines, one block per source
    pub fn dispatch(&mut self, lines: Vec<String>) {
        let mut blocks: BTreeMap<ClientId, SampleBlock> = BTreeMap::new();

        for line in lines {
            if !wire::is_sample_line(&line) {
                // The receiver side is dropped only when the client is gone
                let _ = self.replies.send(line);
                continue;
            }

            let batch = match wire::parse_broadcast_line(&line) {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("Wrong packet received: {}", e);
                    continue;
                }
            };
            let source = batch.source_id;
            let tracker = self.trackers.entry(source).or_default();
            match tracker.observe(batch.sequence, batch.channel_count()) {
                Ok(Continuity::InOrder) => {}
                Ok(Continuity::Gap { expected, actual }) => log::warn!(
                    "Source #{}: packet sequence error (expected {}, got {})",
                    source,
                    expected,
                    actual
                ),
                Err(e) => {
                    log::warn!("Source #{}: wrong packet length, line dropped: {}", source, e);
                    continue;
                }
            }

            let block = blocks
                .entry(source)
                .or_insert_with(|| SampleBlock::new(source, batch.channel_count()));
            if let Err(e) = block.push(batch.sequence, &batch.values) {
                log::warn!("Source #{}: {}", source, e);
            }
        }

        for (source, block) in blocks {
            let queue = self.queues.ensure(source);
            if queue.put(block) == Put::Dropped
                && let Some(count) = self
                    .drops
                    .entry(source)
                    .or_default()
                    .due(queue.dropped())
            {
                log::warn!("Source #{}: queue busy, dropped {} block(s)", source, count);
            }
        }
    }
}

/// Start the receiver worker
///
/// It reads only while `gate` is open and exits when `running` is cleared
/// or the connection fails; `alive` is cleared on exit.
pub fn spawn_receiver<R>(
    inbound: Arc<Mutex<InboundStream<R>>>,
    gate: Arc<WatchGate>,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    alive.store(true, Ordering::Relaxed);
    thread::Builder::new()
        .name("subscriber-receiver".to_string())
        .spawn(move || {
            while running.load(Ordering::Relaxed) {
                if !gate.wait_open(GATE_WAIT) {
                    continue;
                }
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let result = inbound.lock().read_once();
                if let Err(e) = result {
                    if !running.load(Ordering::Relaxed) {
                        log::debug!("Receiver closing: {}", e);
                    } else if e.is_disconnect() {
                        log::info!("Broker closed the connection");
                    } else {
                        log::error!("Receiver stopped: {}", e);
                    }
                    break;
                }
            }
            alive.store(false, Ordering::Relaxed);
        })
}
