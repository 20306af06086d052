//! Configuration for neuro-relay
//!
//! Loaded from an optional TOML file. Every section and every field has a
//! default, so an empty file (or no file at all) yields a working broker on
//! `localhost:8336` with a simulated local source.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default broker port
pub const DEFAULT_PORT: u16 = 8336;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listen / connect address and socket timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Socket read timeout; bounds how long a worker can miss the shutdown flag
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Socket write timeout; a watcher slower than this is treated as dead
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_write_timeout_ms() -> u64 {
    1000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    /// `host:port` string suitable for bind/connect
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }
}

/// Broker-side settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Capacity of each source queue (batches)
    #[serde(default = "default_broker_queue_capacity")]
    pub queue_capacity: usize,
    /// Register the configured device as an in-process source at startup
    #[serde(default = "default_true")]
    pub local_device: bool,
}

fn default_broker_queue_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_broker_queue_capacity(),
            local_device: default_true(),
        }
    }
}

/// Subscriber client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Capacity of each client-side source queue (blocks)
    #[serde(default = "default_client_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound for one `get_data` call
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// How long to wait for the broker to answer a command
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

fn default_client_queue_capacity() -> usize {
    256
}

fn default_fetch_timeout_ms() -> u64 {
    1000
}

fn default_reply_timeout_ms() -> u64 {
    2000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_client_queue_capacity(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Local acquisition device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Device type: "simulated" or "none"
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: f64,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Ticks produced per wakeup
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Frequency of the generated sine wave
    #[serde(default = "default_signal_hz")]
    pub signal_hz: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    #[serde(default = "default_noise_stddev")]
    pub noise_stddev: f64,
    /// 0 = seed from OS entropy
    #[serde(default)]
    pub random_seed: u64,
    /// Opaque session header announced to subscribers
    #[serde(default = "default_header")]
    pub header: String,
}

fn default_device_type() -> String {
    "simulated".to_string()
}

fn default_sample_rate_hz() -> f64 {
    250.0
}

fn default_channels() -> usize {
    1
}

fn default_chunk_size() -> usize {
    10
}

fn default_signal_hz() -> f64 {
    10.0
}

fn default_amplitude() -> f64 {
    100.0
}

fn default_noise_stddev() -> f64 {
    5.0
}

fn default_header() -> String {
    "0       SIMULATED SOURCE".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type: default_device_type(),
            sample_rate_hz: default_sample_rate_hz(),
            channels: default_channels(),
            chunk_size: default_chunk_size(),
            signal_hz: default_signal_hz(),
            amplitude: default_amplitude(),
            noise_stddev: default_noise_stddev(),
            random_seed: 0,
            header: default_header(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```no_run
    /// use neuro_relay::config::RelayConfig;
    ///
    /// let config = RelayConfig::from_file("neuro-relay.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values that would make the relay misbehave
    pub fn validate(&self) -> Result<()> {
        if self.broker.queue_capacity == 0 || self.client.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".to_string()));
        }
        let device = &self.device;
        match device.device_type.as_str() {
            "none" => {}
            "simulated" => {
                if device.channels == 0 {
                    return Err(Error::Config("device.channels must be at least 1".to_string()));
                }
                if device.chunk_size == 0 {
                    return Err(Error::Config(
                        "device.chunk_size must be at least 1".to_string(),
                    ));
                }
                if !(device.sample_rate_hz.is_finite() && device.sample_rate_hz > 0.0) {
                    return Err(Error::Config(format!(
                        "device.sample_rate_hz must be positive, got {}",
                        device.sample_rate_hz
                    )));
                }
            }
            other => {
                return Err(Error::Config(format!("unknown device type: {}", other)));
            }
        }
        Ok(())
    }
}
