//! Client side of the relay
//!
//! - [`SourceClient`]: streams a device to a broker
//! - [`SubscriberClient`]: watches sources and pulls their data
//! - [`receiver`]: the subscriber's background reader

pub mod receiver;
pub mod source;
pub mod subscriber;

pub use receiver::{ClientQueues, InboundStream};
pub use source::SourceClient;
pub use subscriber::{SourceInfo, SubscriberClient};
