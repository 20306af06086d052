//! Source client
//!
//! Streams a local device to a remote broker: declares the `eeg` role,
//! announces the header, then sends one sample line per tick and waits for
//! the broker's acknowledgement before the next.

use crate::config::RelayConfig;
use crate::core::device::SourceDevice;
use crate::core::types::{Continuity, SampleBatch, SequenceTracker};
use crate::error::{Error, Result};
use crate::streaming::wire::{self, Command};
use crate::streaming::{Burst, LineBuffer, read_burst};
use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest wait for the device before re-checking the running flag
const BATCH_TIMEOUT: Duration = Duration::from_millis(500);

pub struct SourceClient {
    stream: TcpStream,
    buffer: LineBuffer,
    pending: VecDeque<String>,
    tracker: SequenceTracker,
    reply_timeout: Duration,
    sent: u64,
}

impl SourceClient {
    /// Connect and declare the source role
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &RelayConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(config.network.read_timeout()))?;
        stream.set_write_timeout(Some(config.network.write_timeout()))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut client = Self {
            stream,
            buffer: LineBuffer::new(),
            pending: VecDeque::new(),
            tracker: SequenceTracker::new(),
            reply_timeout: config.client.reply_timeout(),
            sent: 0,
        };
        client.request(&Command::Eeg.to_line())?;
        Ok(client)
    }

    /// Announce the session header (`setheader`)
    pub fn send_header(&mut self, header: &str) -> Result<()> {
        if header.contains(['\r', '\n']) {
            return Err(Error::Protocol("header must be a single line".to_string()));
        }
        self.request(&Command::SetHeader(header.to_string()).to_line())
    }

    /// Send one tick and wait for its acknowledgement
    ///
    /// A sequence gap is logged and the batch is still sent; a channel
    /// count change is an error and nothing is sent.
    pub fn send_batch(&mut self, batch: &SampleBatch) -> Result<()> {
        if let Continuity::Gap { expected, actual } = self
            .tracker
            .observe(batch.sequence, batch.channel_count())?
        {
            log::warn!(
                "Sequence number not consistent (expected {}, got {})",
                expected,
                actual
            );
        }
        self.request(&wire::format_source_line(batch))?;
        self.sent += 1;
        Ok(())
    }

    /// Forward every batch of `device` until `running` is cleared
    ///
    /// Returns the number of batches sent.
    pub fn stream(&mut self, device: &mut dyn SourceDevice, running: &AtomicBool) -> Result<u64> {
        let start = self.sent;
        while running.load(Ordering::Relaxed) {
            if let Some(batch) = device.next_batch(BATCH_TIMEOUT)? {
                self.send_batch(&batch)?;
            }
        }
        Ok(self.sent - start)
    }

    /// Total batches acknowledged by the broker
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn close(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Socket shutdown failed: {}", e);
        }
    }

    fn request(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.flush()?;
        let reply = self.next_line()?;
        wire::expect_ok(&reply)
    }

    fn next_line(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(Error::BadResponse("timed out waiting for reply".to_string()));
            }
            match read_burst(&mut self.stream, &mut self.buffer)? {
                Burst::Idle => {}
                Burst::Lines(lines) | Burst::Overflow(lines) => self.pending.extend(lines),
            }
        }
    }
}
