//! Core abstractions shared by the broker and the clients.
//!
//! - [`device::SourceDevice`]: Trait to implement for new acquisition hardware
//! - [`types`]: Roles, sample batches and sequence tracking

pub mod device;
pub mod types;
