//! Per-connection session and heartbeat bookkeeping

use std::time::Duration;
use tokio::time::Instant;

/// Resumable session state
///
/// Owned by one shard connection; everything else sees snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Last sequence number received
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    /// Endpoint to reconnect to when resuming
    pub resume_url: Option<String>,
}

impl Session {
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Forget everything; the next handshake identifies from scratch.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Record a sequence number. Stale (lower) numbers are ignored.
    pub fn observe_sequence(&mut self, sequence: u64) {
        if self.sequence.map_or(true, |current| sequence >= current) {
            self.sequence = Some(sequence);
        }
    }
}

/// Heartbeat timing for the current transport
#[derive(Debug, Clone, Default)]
pub struct HeartbeatState {
    pub last_sent: Option<Instant>,
    pub last_acked: Option<Instant>,
    /// Zero until HELLO has been received
    pub interval: Duration,
    /// When the next heartbeat is due
    pub next_due: Option<Instant>,
    /// Round trip of the most recent acknowledged heartbeat
    latency: Option<Duration>,
}

impl HeartbeatState {
    /// Start a new schedule after HELLO.
    ///
    /// Liveness tracking restarts with the transport; the last measured
    /// latency is kept until a new round trip replaces it.
    pub fn start(&mut self, interval: Duration, first_in: Duration, now: Instant) {
        self.interval = interval;
        self.last_sent = None;
        self.last_acked = None;
        self.next_due = Some(now + first_in);
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    /// A heartbeat was sent but has not been acknowledged yet.
    pub fn awaiting_ack(&self) -> bool {
        match (self.last_sent, self.last_acked) {
            (Some(sent), Some(acked)) => sent > acked,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
        if self.interval > Duration::ZERO {
            self.next_due = Some(now + self.interval);
        }
    }

    /// Record an acknowledgement; returns the round trip if one was pending.
    pub fn record_ack(&mut self, now: Instant) -> Option<Duration> {
        self.last_acked = Some(now);
        let sent = self.last_sent?;
        let round_trip = now.saturating_duration_since(sent);
        self.latency = Some(round_trip);
        Some(round_trip)
    }

    /// `None` until a heartbeat round trip has completed
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}
