//! Events produced by shard connections

use super::bus::BusEvent;
use crate::error::GatewayError;
use serde_json::Value;
use std::sync::Arc;

/// Subscription key shared by shard-level and client-level buses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A transport connection was opened
    Open,
    /// A non-fatal or fatal error was observed
    Error,
    /// A DISPATCH frame was received
    Dispatch,
    /// A raw text frame was received, before any interpretation
    Message,
}

/// A DISPATCH frame's event
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Event name, e.g. `MESSAGE_CREATE`
    pub name: Arc<str>,
    pub sequence: Option<u64>,
    pub data: Arc<Value>,
}

impl Dispatch {
    pub fn is(&self, name: &str) -> bool {
        &*self.name == name
    }
}

/// Event emitted on a single shard's bus
#[derive(Debug, Clone)]
pub enum ShardEvent {
    Open,
    Error(Arc<GatewayError>),
    Dispatch(Dispatch),
    Message(Arc<str>),
}

impl ShardEvent {
    pub fn as_dispatch(&self) -> Option<&Dispatch> {
        match self {
            Self::Dispatch(dispatch) => Some(dispatch),
            _ => None,
        }
    }
}

impl AsRef<ShardEvent> for ShardEvent {
    fn as_ref(&self) -> &ShardEvent {
        self
    }
}

impl BusEvent for ShardEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Error(_) => EventKind::Error,
            Self::Dispatch(_) => EventKind::Dispatch,
            Self::Message(_) => EventKind::Message,
        }
    }
}

/// A shard event re-emitted on the client bus, tagged with its shard
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub shard_id: u32,
    pub event: ShardEvent,
}

impl AsRef<ShardEvent> for ClientEvent {
    fn as_ref(&self) -> &ShardEvent {
        &self.event
    }
}

impl BusEvent for ClientEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        self.event.kind()
    }
}
