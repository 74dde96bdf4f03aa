//! Domain error types for the gateway client
//!
//! Every variant carries structured context fields for diagnostics, so
//! callers can match on the failure mode without parsing message strings.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.

use crate::control::ControlPlaneError;
use crate::events::WaitError;
use crate::protocol::GatewayCloseCode;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// A terminal close received from the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalClose {
    pub code: GatewayCloseCode,
    /// Reason text from the close frame, if any
    pub reason: String,
}

impl std::fmt::Display for FatalClose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

/// Gateway client errors
///
/// Example log output:
/// ```text
/// GatewayError::FatalClose { shard_id: 3, close: 4004 }
/// → "shard 3 closed by gateway: Authentication failed (4004): ..."
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport-level failure; the shard reconnects on its own
    #[error("shard {shard_id} transport error")]
    Transport {
        shard_id: u32,
        #[source]
        source: tungstenite::Error,
    },

    /// The gateway closed the connection with a non-recoverable code
    #[error("shard {shard_id} closed by gateway: {close}")]
    FatalClose { shard_id: u32, close: FatalClose },

    /// A one-shot event wait did not complete
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// More shards requested than the session start limit allows
    #[error(
        "session start limit exceeded: {requested} shards requested, limit is {total}, resets in {}s",
        reset_after.as_secs()
    )]
    SessionLimitExceeded {
        requested: usize,
        total: u64,
        reset_after: Duration,
    },

    /// Querying the control plane failed
    #[error("control plane request failed")]
    ControlPlane(#[from] ControlPlaneError),

    /// A gateway command was rejected before being sent
    #[error("invalid {command} command: {reason}")]
    InvalidCommand {
        command: &'static str,
        reason: String,
    },

    /// No transport is attached to the shard
    #[error("shard {shard_id} is not connected")]
    NotConnected { shard_id: u32 },

    /// No shard in this process owns the given shard id
    #[error("shard {shard_id} is not run by this client")]
    ShardNotFound { shard_id: u32 },

    /// `connect` or `run` was called while already running
    #[error("already running")]
    AlreadyRunning,

    /// An outbound frame could not be serialized
    #[error("failed to encode {op} frame")]
    Encode {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// An inbound frame could not be decoded
    #[error("shard {shard_id} received an undecodable frame")]
    Decode {
        shard_id: u32,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    pub(crate) fn invalid_command(command: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            command,
            reason: reason.into(),
        }
    }

    /// Whether the failure ends the affected shard (or startup) for good
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalClose { .. } | Self::SessionLimitExceeded { .. } | Self::ControlPlane(_)
        )
    }

    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::FatalClose { .. } => "fatal_close",
            Self::Wait(WaitError::Timeout) => "wait_timeout",
            Self::Wait(_) => "wait",
            Self::SessionLimitExceeded { .. } => "session_limit",
            Self::ControlPlane(_) => "control_plane",
            Self::InvalidCommand { .. } => "invalid_command",
            Self::NotConnected { .. } => "not_connected",
            Self::ShardNotFound { .. } => "shard_not_found",
            Self::AlreadyRunning => "already_running",
            Self::Encode { .. } => "encode",
            Self::Decode { .. } => "decode",
            Self::Config(_) => "config",
        }
    }
}
