//! Shard pool
//!
//! Resolves which shards to run, checks the session start budget, starts
//! the shards in paced groups and re-emits every shard event on one
//! client-wide bus. Shard-affine commands are routed with the same formula
//! the gateway uses to assign guilds to shards.

use crate::control::{ControlPlane, SessionStartLimit};
use crate::error::GatewayError;
use crate::events::{ClientEvent, Dispatch, EventBus, EventKind, ListenerId, ShardEvent};
use crate::metrics::GatewayMetrics;
use crate::protocol::{GuildMembersRequest, Presence, VoiceStateUpdate};
use crate::shard::connection::{self, ShardConfig, ShardConnection, ShardInfo};
use crate::shard::state::{mean, ShardState};
use crate::shard::transport::Connector;

use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pause between startup groups.
///
/// The identify rate limit window is 5 seconds per concurrency bucket.
pub const DEFAULT_GROUP_DELAY: Duration = Duration::from_secs(5);

/// How the pool decides which shards to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingMode {
    /// Use the shard count recommended by the control plane
    Auto,
    /// Run a single connection without the IDENTIFY `shard` field
    Disabled,
    /// Run `ids` out of `count` total shards; empty `ids` means all of them
    Manual { ids: Vec<u32>, count: u32 },
}

impl ShardingMode {
    /// Shard ids to run and the total count they identify with
    pub fn resolve(&self, recommended: u32) -> (Vec<u32>, u32) {
        match self {
            Self::Disabled => (vec![0], 0),
            Self::Auto => {
                let count = recommended.max(1);
                ((0..count).collect(), count)
            }
            Self::Manual { ids, count } if ids.is_empty() => ((0..*count).collect(), *count),
            Self::Manual { ids, count } => (ids.clone(), *count),
        }
    }
}

/// Shard index owning `key`.
///
/// Snowflakes carry their timestamp above bit 22, so this spreads entities
/// evenly. An unsharded bot has everything on shard 0.
pub fn shard_index(key: u64, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    ((key >> 22) % u64::from(shard_count)) as u32
}

/// Split shards into consecutive startup groups of `max_concurrency`
pub fn startup_groups<T>(shards: &[T], max_concurrency: u64) -> std::slice::Chunks<'_, T> {
    let size = usize::try_from(max_concurrency.max(1)).unwrap_or(usize::MAX);
    shards.chunks(size)
}

/// Check that `requested` shards fit within the session start limit.
///
/// The comparison is against the limit's `total`; `remaining` and the reset
/// time are only logged. With `ignore_limit` an overrun is only logged.
pub fn check_session_budget(
    requested: usize,
    limit: &SessionStartLimit,
    ignore_limit: bool,
) -> Result<(), GatewayError> {
    if requested as u64 <= limit.total {
        return Ok(());
    }

    if ignore_limit {
        warn!(
            requested,
            remaining = limit.remaining,
            total = limit.total,
            reset_after_secs = limit.reset_after.as_secs(),
            "Session start limit exceeded, starting anyway"
        );
        return Ok(());
    }

    error!(
        requested,
        remaining = limit.remaining,
        total = limit.total,
        reset_after_secs = limit.reset_after.as_secs(),
        "Session start limit exceeded; set IGNORE_SESSION_LIMIT to start anyway"
    );
    Err(GatewayError::SessionLimitExceeded {
        requested,
        total: limit.total,
        reset_after: limit.reset_after,
    })
}

/// Shards started by this pool
struct ShardSet {
    count: u32,
    connections: Vec<ShardConnection>,
}

/// Pool of shard connections sharing one client bus
pub struct ShardPool<C> {
    control: C,
    connector: Arc<dyn Connector>,
    config: Arc<ShardConfig>,
    mode: ShardingMode,
    ignore_session_limit: bool,
    group_delay: Duration,
    shards: OnceLock<ShardSet>,
    bus: EventBus<ClientEvent>,
    state: ShardState,
    metrics: GatewayMetrics,
    running: AtomicBool,
}

impl<C> fmt::Debug for ShardPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardPool")
            .field("mode", &self.mode)
            .field("ignore_session_limit", &self.ignore_session_limit)
            .field("group_delay", &self.group_delay)
            .field("shards", &self.shards().len())
            .finish_non_exhaustive()
    }
}

impl<C: ControlPlane> ShardPool<C> {
    pub fn new(
        control: C,
        connector: Arc<dyn Connector>,
        config: ShardConfig,
        mode: ShardingMode,
    ) -> Self {
        Self {
            control,
            connector,
            config: Arc::new(config),
            mode,
            ignore_session_limit: false,
            group_delay: DEFAULT_GROUP_DELAY,
            shards: OnceLock::new(),
            bus: EventBus::new(),
            state: ShardState::new(),
            metrics: GatewayMetrics::detached(),
            running: AtomicBool::new(false),
        }
    }

    /// Start even when the session start budget is too small
    pub fn ignore_session_limit(mut self, ignore: bool) -> Self {
        self.ignore_session_limit = ignore;
        self
    }

    pub fn with_group_delay(mut self, delay: Duration) -> Self {
        self.group_delay = delay;
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Start every shard, then wait until all of them have stopped.
    ///
    /// Returns the first shard error, if any.
    pub async fn run(&self) -> Result<(), GatewayError> {
        self.start().await?;

        let shards = self.shards();
        let results = join_all(shards.iter().map(|shard| shard.wait())).await;

        let mut first_error = None;
        for (shard, result) in shards.iter().zip(results) {
            if let Err(e) = result {
                error!(shard_id = shard.id(), error = %e, "Shard task failed");
                first_error.get_or_insert(e);
            }
        }

        info!("Shard pool shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// Start every shard and return once all have completed their first
    /// handshake.
    ///
    /// Shards are started `max_concurrency` at a time. Each group must
    /// settle before the next one begins, with [`DEFAULT_GROUP_DELAY`] (or
    /// the configured delay) in between. A fatal failure in a group stops
    /// the shards already started and is returned.
    pub async fn start(&self) -> Result<(), GatewayError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(GatewayError::AlreadyRunning);
        }

        let bot = self.control.gateway_bot().await?;
        let limit = bot.session_start_limit;
        let (ids, count) = self.mode.resolve(bot.shards);

        check_session_budget(ids.len(), &limit, self.ignore_session_limit)?;

        self.state.register(ids.iter().copied(), count);
        let connections: Vec<ShardConnection> = ids
            .iter()
            .map(|&id| {
                let shard = ShardConnection::with_telemetry(
                    ShardInfo::new(id, count),
                    Arc::clone(&self.config),
                    Arc::clone(&self.connector),
                    self.state.clone(),
                    self.metrics.clone(),
                );
                self.forward(&shard);
                shard
            })
            .collect();

        let shards: &[ShardConnection] = &self
            .shards
            .get_or_init(|| ShardSet { count, connections })
            .connections;

        info!(
            shards = shards.len(),
            shard_count = count,
            total = limit.total,
            remaining = limit.remaining,
            max_concurrency = limit.max_concurrency,
            "Starting shards"
        );

        for (group, batch) in startup_groups(shards, limit.max_concurrency).enumerate() {
            if group > 0 {
                tokio::time::sleep(self.group_delay).await;
            }

            let shard_ids: Vec<u32> = batch.iter().map(ShardConnection::id).collect();
            info!(group, shard_ids = ?shard_ids, "Starting shard group");

            let results = join_all(batch.iter().map(|shard| shard.connect())).await;
            if let Some(e) = results.into_iter().find_map(Result::err) {
                error!(group, error = %e, "Shard group failed to start");
                self.shutdown();
                return Err(e);
            }
        }

        info!(shards = shards.len(), "All shards ready");
        Ok(())
    }

    /// Re-emit a shard's events on the client bus
    fn forward(&self, shard: &ShardConnection) {
        let shard_id = shard.id();
        for kind in [
            EventKind::Open,
            EventKind::Error,
            EventKind::Dispatch,
            EventKind::Message,
        ] {
            let bus = self.bus.clone();
            shard.events().subscribe(kind, move |event: &ShardEvent| {
                bus.emit(ClientEvent {
                    shard_id,
                    event: event.clone(),
                });
            });
        }
    }
}

impl<C> ShardPool<C> {
    /// Connections started by this pool; empty before `start`
    pub fn shards(&self) -> &[ShardConnection] {
        self.shards
            .get()
            .map_or(&[], |set| set.connections.as_slice())
    }

    pub fn shard(&self, shard_id: u32) -> Option<&ShardConnection> {
        self.shards().iter().find(|shard| shard.id() == shard_id)
    }

    /// Total shard count the shards identified with (0 when unsharded)
    pub fn shard_count(&self) -> u32 {
        self.shards.get().map_or(0, |set| set.count)
    }

    /// Connection owning `key` (a guild id, usually)
    pub fn shard_for(&self, key: u64) -> Result<&ShardConnection, GatewayError> {
        let shard_id = shard_index(key, self.shard_count());
        self.shard(shard_id)
            .ok_or(GatewayError::ShardNotFound { shard_id })
    }

    /// Shared state, for health checks
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    /// Client-wide bus carrying every shard's events
    pub fn events(&self) -> &EventBus<ClientEvent> {
        &self.bus
    }

    /// Mean heartbeat latency across this pool's shards.
    ///
    /// Shards that have not completed a heartbeat round trip yet (including
    /// ones still connecting) are left out of the mean rather than counted
    /// as zero. `None` until at least one shard has a measurement.
    pub fn latency(&self) -> Option<Duration> {
        let latencies: Vec<Duration> = self
            .shards()
            .iter()
            .filter_map(ShardConnection::latency)
            .collect();
        mean(&latencies)
    }

    /// Route a voice state update to the shard owning the guild
    pub async fn update_voice_state(&self, update: VoiceStateUpdate) -> Result<(), GatewayError> {
        self.shard_for(update.guild_id)?
            .update_voice_state(update)
            .await
    }

    /// Route a member request to the shard owning the guild
    pub async fn request_guild_members(
        &self,
        request: GuildMembersRequest,
    ) -> Result<(), GatewayError> {
        self.shard_for(request.guild_id)?
            .request_guild_members(request)
            .await
    }

    /// Update the presence on every shard
    pub async fn update_presence(&self, presence: Presence) -> Result<(), GatewayError> {
        presence.validate()?;
        let results = join_all(
            self.shards()
                .iter()
                .map(|shard| shard.update_presence(presence.clone())),
        )
        .await;
        results.into_iter().collect()
    }

    /// Call `handler` for every dispatch named `name` from any shard
    pub fn listen<F>(&self, name: &str, handler: F) -> ListenerId
    where
        F: Fn(u32, &Dispatch) + Send + Sync + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        self.bus
            .subscribe(EventKind::Dispatch, move |event: &ClientEvent| {
                if let Some(dispatch) = event.event.as_dispatch().filter(|d| d.is(&name)) {
                    handler(event.shard_id, dispatch);
                }
            })
    }

    /// Wait for the next dispatch named `name`, from any shard, that passes
    /// `check`
    pub fn wait_for_dispatch<F>(
        &self,
        name: &str,
        check: F,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Dispatch, GatewayError>> + Send + 'static
    where
        F: FnMut(&Dispatch) -> bool + Send + 'static,
    {
        connection::wait_for_dispatch(&self.bus, name, check, timeout)
    }

    /// Stop every shard
    pub fn shutdown(&self) {
        for shard in self.shards() {
            shard.shutdown();
        }
    }
}
