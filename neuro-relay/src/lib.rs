//! NeuroRelay - Real-time biosignal relay
//!
//! A broker accepts acquisition sources (`eeg`) and subscribers (`display`)
//! over a line-oriented TCP protocol and fans every source's samples out to
//! the subscribers watching it.
//!
//! - [`broker`]: registry, per-source producers, per-connection commanders
//!   and the fan-out consumer
//! - [`client`]: source and subscriber clients
//! - [`devices`]: local acquisition devices (simulated)
//! - [`streaming`]: wire format, line framing and bounded queues

pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod devices;
pub mod error;
pub mod streaming;

// Re-export commonly used types
pub use broker::BrokerServer;
pub use client::{SourceClient, SubscriberClient};
pub use config::RelayConfig;
pub use error::{Error, Result};
