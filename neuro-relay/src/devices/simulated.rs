//! Simulated acquisition device
//!
//! Stands in for real hardware: a generator thread produces `chunk_size`
//! ticks per wakeup at the configured sample rate, each channel carrying a
//! sine wave plus Gaussian noise. Ticks go through a bounded channel; when
//! nobody drains it, new ticks are dropped and the sequence jumps.
//!
//! # Thread Model
//!
//! ```text
//! ┌──────────────────┐  bounded   ┌────────────────────┐
//! │ simulated-device │ ─────────► │ next_batch(timeout) │
//! │  (generator)     │  channel   │ (producer / client) │
//! └──────────────────┘            └────────────────────┘
//! ```

use super::noise::ChannelNoise;
use crate::config::DeviceConfig;
use crate::core::device::SourceDevice;
use crate::core::types::SampleBatch;
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Parameters of the generated signal
#[derive(Debug, Clone)]
struct Waveform {
    sample_rate_hz: f64,
    channels: usize,
    chunk_size: usize,
    signal_hz: f64,
    amplitude: f64,
}

impl Waveform {
    fn from_config(config: &DeviceConfig) -> Self {
        Self {
            sample_rate_hz: config.sample_rate_hz,
            channels: config.channels,
            chunk_size: config.chunk_size,
            signal_hz: config.signal_hz,
            amplitude: config.amplitude,
        }
    }

    fn chunk_period(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate_hz)
    }

    /// Values of tick `sequence`; channels are phase-shifted copies
    fn tick(&self, sequence: u64, noise: &mut ChannelNoise) -> Vec<f64> {
        let t = sequence as f64 / self.sample_rate_hz;
        (0..self.channels)
            .map(|c| {
                let phase = TAU * c as f64 / self.channels as f64;
                self.amplitude * (TAU * self.signal_hz * t + phase).sin()
                    + noise.sample()
            })
            .collect()
    }
}

pub struct SimulatedDevice {
    header: String,
    rx: Receiver<SampleBatch>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    /// Start the generator thread
    pub fn start(config: &DeviceConfig) -> Result<Self> {
        if config.channels == 0 || config.chunk_size == 0 || config.sample_rate_hz <= 0.0 {
            return Err(Error::Config(
                "simulated device needs channels, chunk_size and sample_rate_hz above zero"
                    .to_string(),
            ));
        }

        let waveform = Waveform::from_config(config);
        let capacity = (waveform.sample_rate_hz as usize).max(waveform.chunk_size * 4);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let noise = ChannelNoise::new(config.noise_stddev, config.random_seed)?;

        log::info!(
            "Simulated device: {} channel(s) at {} Hz, {} tick(s) per chunk",
            waveform.channels,
            waveform.sample_rate_hz,
            waveform.chunk_size
        );

        let handle = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("simulated-device".to_string())
                .spawn(move || generate(waveform, noise, tx, shutdown))
                .map_err(|e| Error::Device(format!("Failed to spawn generator thread: {}", e)))?
        };

        Ok(Self {
            header: config.header.clone(),
            rx,
            shutdown,
            handle: Some(handle),
        })
    }
}

fn generate(
    waveform: Waveform,
    mut noise: ChannelNoise,
    tx: Sender<SampleBatch>,
    shutdown: Arc<AtomicBool>,
) {
    let period = waveform.chunk_period();
    let mut sequence: u64 = 0;
    let mut dropped: u64 = 0;
    let mut next_wake = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        for _ in 0..waveform.chunk_size {
            let batch = SampleBatch::new(sequence, waveform.tick(sequence, &mut noise));
            sequence += 1;
            match tx.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Disconnected(_)) => return,
            }
        }

        next_wake += period;
        let now = Instant::now();
        if next_wake > now {
            thread::sleep(next_wake - now);
        } else {
            // Fell behind (e.g. suspended); resynchronise instead of bursting
            next_wake = now;
        }
    }

    if dropped > 0 {
        log::debug!("Simulated device dropped {} tick(s) nobody consumed", dropped);
    }
}

impl SourceDevice for SimulatedDevice {
    fn header(&self) -> &str {
        &self.header
    }

    fn next_batch(&mut self, timeout: Duration) -> Result<Option<SampleBatch>> {
        match self.rx.recv_timeout(timeout) {
            Ok(batch) => Ok(Some(batch)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Device("simulated generator stopped".to_string()))
            }
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
