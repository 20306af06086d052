//! Streaming primitives shared by the broker and the clients
//!
//! - [`wire`]: line protocol grammar
//! - [`lines`]: byte stream to line framing
//! - [`queue`]: bounded drop-newest per-source queue
//! - [`gate`]: watch gate for the subscriber receiver

pub mod gate;
pub mod lines;
pub mod queue;
pub mod wire;

pub use gate::WatchGate;
pub use lines::{Burst, LineBuffer, read_burst};
pub use queue::{BoundedQueue, DropMonitor, Put};
pub use wire::Command;
