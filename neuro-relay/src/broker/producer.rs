//! Local device producer
//!
//! One worker per in-process source. It idles while nobody watches its
//! source, then pulls batches from the device and feeds the source queue.

use super::registry::ClientRegistry;
use crate::core::device::SourceDevice;
use crate::core::types::{ClientId, Continuity, SampleBatch, SequenceTracker};
use crate::error::{Error, Result};
use crate::streaming::{BoundedQueue, DropMonitor, Put};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Longest wait for a watcher before re-checking the running flag
const WATCHER_WAIT: Duration = Duration::from_secs(1);

/// Longest wait for the device before re-checking the running flag
const BATCH_TIMEOUT: Duration = Duration::from_millis(500);

pub struct DeviceProducer {
    id: ClientId,
    registry: Arc<ClientRegistry>,
    device: Box<dyn SourceDevice>,
    running: Arc<AtomicBool>,
    tracker: SequenceTracker,
    drops: DropMonitor,
}

impl DeviceProducer {
    pub fn new(
        id: ClientId,
        registry: Arc<ClientRegistry>,
        device: Box<dyn SourceDevice>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            registry,
            device,
            running,
            tracker: SequenceTracker::new(),
            drops: DropMonitor::default(),
        }
    }

    /// Worker entry point; never panics on device or protocol faults
    pub fn run(mut self) {
        log::info!("Producer for source #{} started", self.id);
        match self.pump() {
            Ok(()) => log::info!("Producer for source #{} stopped", self.id),
            Err(e) => log::error!("Producer for source #{} terminated: {}", self.id, e),
        }
    }

    fn pump(&mut self) -> Result<()> {
        let queue = self
            .registry
            .queue(self.id)?
            .ok_or_else(|| Error::Other(format!("source #{} has no queue", self.id)))?;

        while self.running.load(Ordering::Relaxed) {
            if !self.registry.wait_for_watchers(self.id, WATCHER_WAIT) {
                continue;
            }
            if let Some(batch) = self.device.next_batch(BATCH_TIMEOUT)? {
                self.forward(&queue, batch)?;
            }
        }
        Ok(())
    }

    fn forward(&mut self, queue: &BoundedQueue<SampleBatch>, mut batch: SampleBatch) -> Result<()> {
        if let Continuity::Gap { expected, actual } = self
            .tracker
            .observe(batch.sequence, batch.channel_count())?
        {
            log::warn!(
                "Source #{}: sequence number not consistent (expected {}, got {})",
                self.id,
                expected,
                actual
            );
        }

        batch.source_id = self.id;
        if queue.put(batch) == Put::Dropped
            && let Some(count) = self.drops.due(queue.dropped())
        {
            log::warn!(
                "Source #{}: queue full, dropped {} batch(es)",
                self.id,
                count
            );
        }
        Ok(())
    }
}
