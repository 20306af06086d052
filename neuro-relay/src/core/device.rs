//! SourceDevice trait definition

use crate::core::types::SampleBatch;
use crate::error::Result;
use std::time::Duration;

/// Acquisition device feeding a source
///
/// The relay never looks inside the header; it is stored and forwarded
/// byte-for-byte.
pub trait SourceDevice: Send {
    /// Opaque descriptive header for the recording session
    fn header(&self) -> &str;

    /// Block until the next batch is available or `timeout` elapses
    ///
    /// Returns `Ok(None)` on timeout. Any `Err` is treated as a device
    /// failure and stops the worker that owns the device.
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<SampleBatch>>;
}
