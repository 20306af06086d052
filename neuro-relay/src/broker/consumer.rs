//! Broker-wide fan-out worker
//!
//! Waits on every source queue at once and writes each batch to the
//! current watchers of its source. A watcher whose write fails has its
//! socket shut down, which makes its commander exit and the registry reap
//! it; delivery to the remaining watchers continues.

use super::registry::ClientRegistry;
use crate::core::types::{ClientId, SampleBatch};
use crate::streaming::wire;
use crossbeam_channel::Select;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Upper bound on one wait for a ready queue
const SELECT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct FanoutConsumer {
    registry: Arc<ClientRegistry>,
    running: Arc<AtomicBool>,
    delivered: u64,
}

impl FanoutConsumer {
    pub fn new(registry: Arc<ClientRegistry>, running: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            running,
            delivered: 0,
        }
    }

    /// Worker entry point
    pub fn run(mut self) {
        log::info!("Fan-out consumer started");
        while self.running.load(Ordering::Relaxed) {
            self.step(SELECT_TIMEOUT);
            self.registry.reap_dead();
        }
        log::info!("Fan-out consumer stopped after {} line(s)", self.delivered);
    }

    /// Wait at most `timeout` for one batch and deliver it
    ///
    /// Returns whether a batch was taken from a queue.
    pub fn step(&mut self, timeout: Duration) -> bool {
        let queues = self.registry.source_queues();
        if queues.is_empty() {
            thread::sleep(timeout);
            return false;
        }

        let mut select = Select::new();
        for (_, queue) in &queues {
            select.recv(queue.receiver());
        }
        let Ok(index) = select.ready_timeout(timeout) else {
            return false;
        };

        let (source, queue) = &queues[index];
        match queue.try_get() {
            Some(batch) => {
                self.deliver(*source, &batch);
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, source: ClientId, batch: &SampleBatch) {
        let line = wire::format_broadcast_line(batch);
        for (watcher, socket) in self.registry.delivery_targets(source) {
            match socket.send(&line) {
                Ok(()) => self.delivered += 1,
                Err(e) => {
                    log::warn!(
                        "Failed to deliver source #{} to client #{} ({:?}): {}",
                        source,
                        watcher,
                        socket.peer_addr(),
                        e
                    );
                    socket.shutdown();
                }
            }
        }
    }
}
