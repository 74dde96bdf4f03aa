//! Shard state tracking
//!
//! Shared, lock-light view of every shard's lifecycle and counters, read by
//! the health endpoints and written by the connection tasks.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// No transport and no task
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open, waiting for HELLO
    AwaitingHello,
    /// IDENTIFY sent, waiting for READY
    Identifying,
    /// RESUME sent, waiting for RESUMED
    Resuming,
    /// Session established
    Ready,
    /// Heartbeat went unacknowledged; about to force a reconnect
    Degraded,
    /// Transport is being closed
    Closing,
    /// Stopped for good (fatal close or shutdown)
    Terminated,
}

impl ShardStatus {
    /// Returns true if the shard is up or on its way back up
    pub fn is_healthy(&self) -> bool {
        !matches!(self, Self::Degraded | Self::Terminated | Self::Disconnected)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        }
    }
}

/// State for a single shard
#[derive(Debug)]
struct ShardStateEntry {
    status: ShardStatus,
    events_received: AtomicU64,
    reconnects: AtomicU64,
    latency: Option<Duration>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            status: ShardStatus::Disconnected,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            latency: None,
        }
    }
}

/// Shared state across all shards of a client
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug, Default)]
struct ShardStateInner {
    shards: DashMap<u32, ShardStateEntry>,
    shard_count: AtomicU32,
}

impl ShardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the shards that will run; existing entries are kept
    pub fn register(&self, shard_ids: impl IntoIterator<Item = u32>, shard_count: u32) {
        for shard_id in shard_ids {
            self.inner.shards.entry(shard_id).or_default();
        }
        self.inner.shard_count.store(shard_count, Ordering::Relaxed);
    }

    /// Total shard count the shards identified with (0 when unsharded)
    pub fn total_shards(&self) -> u32 {
        self.inner.shard_count.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, shard_id: u32, status: ShardStatus) {
        self.inner.shards.entry(shard_id).or_default().status = status;
    }

    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        if let (Some(mut entry), Some(latency)) = (self.inner.shards.get_mut(&shard_id), latency) {
            entry.latency = Some(latency);
        }
    }

    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.inner.shards.get(&shard_id).map(|e| e.status)
    }

    pub fn reconnects(&self, shard_id: u32) -> u64 {
        self.inner
            .shards
            .get(&shard_id)
            .map_or(0, |e| e.reconnects.load(Ordering::Relaxed))
    }

    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Mean latency over shards that have measured one
    pub fn mean_latency(&self) -> Option<Duration> {
        let latencies: Vec<Duration> = self.inner.shards.iter().filter_map(|e| e.latency).collect();
        mean(&latencies)
    }

    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status.is_ready())
            .count()
    }

    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status.is_healthy())
            .count()
    }

    /// Number of shards tracked by this client
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// At least one shard is ready
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    pub fn is_healthy(&self) -> bool {
        self.shard_count() > 0 && self.healthy_shards() == self.shard_count()
    }
}

/// Arithmetic mean; `None` for an empty slice.
pub(crate) fn mean(values: &[Duration]) -> Option<Duration> {
    if values.is_empty() {
        return None;
    }
    let total: Duration = values.iter().sum();
    Some(total / values.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_and_counts() {
        let state = ShardState::new();
        state.register([0, 1, 2], 3);
        assert_eq!(state.shard_count(), 3);
        assert_eq!(state.total_shards(), 3);
        assert_eq!(state.status(1), Some(ShardStatus::Disconnected));
        assert!(!state.is_ready());

        state.set_status(0, ShardStatus::Ready);
        state.set_status(1, ShardStatus::Resuming);
        state.set_status(2, ShardStatus::Terminated);
        assert_eq!(state.ready_shards(), 1);
        assert_eq!(state.healthy_shards(), 2);
        assert!(state.is_ready());
        assert!(!state.is_healthy());
    }

    #[test]
    fn counters_ignore_unknown_shards() {
        let state = ShardState::new();
        state.register([0], 0);
        state.record_event(0);
        state.record_event(0);
        state.record_event(9);
        state.record_reconnect(0);
        assert_eq!(state.total_events_received(), 2);
        assert_eq!(state.reconnects(0), 1);
        assert_eq!(state.reconnects(9), 0);
    }

    #[test]
    fn mean_latency_skips_unmeasured_shards() {
        let state = ShardState::new();
        state.register([0, 1, 2], 3);
        assert_eq!(state.mean_latency(), None);

        state.record_heartbeat(0, Some(Duration::from_millis(100)));
        state.record_heartbeat(1, Some(Duration::from_millis(300)));
        state.record_heartbeat(2, None);
        assert_eq!(state.mean_latency(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn mean_of_empty_is_none() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[Duration::from_secs(2)]), Some(Duration::from_secs(2)));
    }
}
