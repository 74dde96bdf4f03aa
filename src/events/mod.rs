//! Event handling module
//!
//! The generic [`EventBus`] and the event types shards publish on it.

pub mod bus;
pub mod types;

pub use bus::{BoxError, BusEvent, Delivery, EventBus, ListenerId, WaitError};
pub use types::{ClientEvent, Dispatch, EventKind, ShardEvent};
