//! Single shard connection
//!
//! A [`ShardConnection`] is a cheap, cloneable handle. The connection itself
//! is driven by one owning task (spawned by [`ShardConnection::connect`])
//! which is the only place transport messages and heartbeat ticks are
//! processed, so the handshake state machine never runs concurrently with
//! itself. Commands sent through the handle share the transport with that
//! task behind an async mutex, one whole frame at a time.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected → Connecting → AwaitingHello → Identifying | Resuming → Ready
//!                    ↑                                                  │
//!                    └──────── Degraded | Closing ←─────────────────────┘
//!                                      │
//!                                      └→ Terminated (fatal close, shutdown)
//! ```

use crate::error::{FatalClose, GatewayError};
use crate::events::{Dispatch, EventBus, EventKind, ListenerId, ShardEvent, WaitError};
use crate::metrics::GatewayMetrics;
use crate::protocol::close_codes::{
    ABNORMAL_CLOSE, CLIENT_FRESH_CLOSE, CLIENT_RESUME_CLOSE, NO_STATUS_CLOSE,
};
use crate::protocol::payloads::parse_data;
use crate::protocol::{
    classify, gateway_url, CloseDisposition, ConnectionProperties, GuildMembersRequest,
    HelloPayload, IdentifyPayload, InboundFrame, OpCode, OutboundFrame, Presence, ReadyPayload,
    ResumePayload, VoiceStateUpdate, DEFAULT_GATEWAY_URL,
};
use crate::shard::session::{HeartbeatState, Session};
use crate::shard::state::{ShardState, ShardStatus};
use crate::shard::transport::{Connector, WsStream};

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, error, info, trace, warn};
use twilight_model::gateway::Intents;

/// Position of a shard within the bot's shard set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    pub id: u32,
    /// Total shard count; 0 means sharding is disabled
    pub count: u32,
}

impl ShardInfo {
    pub const fn new(id: u32, count: u32) -> Self {
        Self { id, count }
    }

    /// The single shard of an unsharded bot
    pub const fn unsharded() -> Self {
        Self { id: 0, count: 0 }
    }

    pub const fn is_sharded(&self) -> bool {
        self.count > 0
    }

    /// Value of the IDENTIFY `shard` field
    fn identify_field(&self) -> Option<[u32; 2]> {
        self.is_sharded().then_some([self.id, self.count])
    }
}

/// Settings shared by every shard of a client
#[derive(Clone)]
pub struct ShardConfig {
    token: String,
    intents: Intents,
    properties: ConnectionProperties,
    large_threshold: Option<u32>,
    presence: Option<Presence>,
    gateway_url: String,
}

impl ShardConfig {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: ConnectionProperties::default(),
            large_threshold: None,
            presence: None,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
        }
    }

    pub fn with_properties(mut self, properties: ConnectionProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_large_threshold(mut self, threshold: u32) -> Self {
        self.large_threshold = Some(threshold);
        self
    }

    /// Presence sent with IDENTIFY
    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Base URL used when there is no resume endpoint
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    pub fn intents(&self) -> Intents {
        self.intents
    }

    pub fn gateway_url(&self) -> &str {
        &self.gateway_url
    }
}

impl fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("properties", &self.properties)
            .field("large_threshold", &self.large_threshold)
            .field("presence", &self.presence)
            .field("gateway_url", &self.gateway_url)
            .finish()
    }
}

/// Delay between failed connection attempts
///
/// Doubles from one second up to a minute; reset once a session is ready.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}

type ReadySender = oneshot::Sender<Result<Value, GatewayError>>;

/// How a transport ended
enum Closed {
    Shutdown,
    Code { code: u16, reason: String },
}

impl Closed {
    fn local(code: u16) -> Self {
        Self::Code {
            code,
            reason: String::new(),
        }
    }
}

type TaskHandle = JoinHandle<Result<(), GatewayError>>;

/// Connection task handle taken out by `wait`; put back if the wait is dropped
struct TaskClaim<'a> {
    slot: &'a Mutex<Option<TaskHandle>>,
    handle: Option<TaskHandle>,
}

impl Drop for TaskClaim<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            *self.slot.lock() = Some(handle);
        }
    }
}

struct ShardInner {
    info: ShardInfo,
    config: Arc<ShardConfig>,
    connector: Arc<dyn Connector>,
    sink: tokio::sync::Mutex<Option<crate::shard::transport::WsSink>>,
    session: RwLock<Session>,
    heartbeat: Mutex<HeartbeatState>,
    status: Mutex<ShardStatus>,
    /// Presence re-sent on every IDENTIFY; follows `update_presence`
    presence: RwLock<Option<Presence>>,
    bus: EventBus<ShardEvent>,
    ready: Mutex<Option<ReadySender>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<TaskHandle>>,
    running: AtomicBool,
    /// HELLO was received on the current transport
    greeted: AtomicBool,
    state: ShardState,
    metrics: GatewayMetrics,
}

/// Handle to one gateway shard
#[derive(Clone)]
pub struct ShardConnection {
    inner: Arc<ShardInner>,
}

impl fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConnection")
            .field("info", &self.inner.info)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ShardConnection {
    /// Create a standalone shard connection
    pub fn new(info: ShardInfo, config: ShardConfig, connector: Arc<dyn Connector>) -> Self {
        let state = ShardState::new();
        state.register([info.id], info.count);
        Self::with_telemetry(
            info,
            Arc::new(config),
            connector,
            state,
            GatewayMetrics::default(),
        )
    }

    pub(crate) fn with_telemetry(
        info: ShardInfo,
        config: Arc<ShardConfig>,
        connector: Arc<dyn Connector>,
        state: ShardState,
        metrics: GatewayMetrics,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let presence = config.presence.clone();
        Self {
            inner: Arc::new(ShardInner {
                info,
                config,
                connector,
                sink: tokio::sync::Mutex::new(None),
                session: RwLock::new(Session::default()),
                heartbeat: Mutex::new(HeartbeatState::default()),
                status: Mutex::new(ShardStatus::Disconnected),
                presence: RwLock::new(presence),
                bus: EventBus::new(),
                ready: Mutex::new(None),
                shutdown,
                task: Mutex::new(None),
                running: AtomicBool::new(false),
                greeted: AtomicBool::new(false),
                state,
                metrics,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.info.id
    }

    pub fn info(&self) -> ShardInfo {
        self.inner.info
    }

    /// Start the connection and wait for the first READY.
    ///
    /// Resolves with the READY payload once the first handshake completes,
    /// or fails with [`GatewayError::FatalClose`] if the gateway closes with
    /// a non-recoverable code first. Recoverable closes and connection
    /// failures are retried internally and never surface here. The
    /// connection keeps running after this returns; see [`wait`](Self::wait).
    pub async fn connect(&self) -> Result<Value, GatewayError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(GatewayError::AlreadyRunning);
        }

        let (resolve, ready) = oneshot::channel();
        self.inner.shutdown.send_replace(false);
        *self.inner.ready.lock() = Some(resolve);
        let handle = tokio::spawn(Arc::clone(&self.inner).run());
        *self.inner.task.lock() = Some(handle);

        match ready.await {
            Ok(result) => result,
            // The task stopped (shutdown) before any session was ready
            Err(_) => Err(GatewayError::NotConnected {
                shard_id: self.id(),
            }),
        }
    }

    /// Wait for the connection task to end.
    ///
    /// Returns `Ok` after [`shutdown`](Self::shutdown) and the fatal close
    /// error otherwise. Returns immediately if no task was started, the
    /// task was already awaited, or another `wait` is in progress. Dropping
    /// the future before the task ends leaves the task waitable.
    pub async fn wait(&self) -> Result<(), GatewayError> {
        let handle = self.inner.task.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let mut claim = TaskClaim {
            slot: &self.inner.task,
            handle: Some(handle),
        };
        let joined = match claim.handle.as_mut() {
            Some(handle) => handle.await,
            None => return Ok(()),
        };
        claim.handle = None;

        match joined {
            Ok(result) => result,
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(_) => Ok(()),
        }
    }

    /// Close the transport and stop reconnecting
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Send a raw frame.
    ///
    /// Fails with [`GatewayError::NotConnected`] when no transport is
    /// attached and rejects receive-only op codes.
    pub async fn send<T>(&self, op: OpCode, payload: &T) -> Result<(), GatewayError>
    where
        T: Serialize + ?Sized,
    {
        if !op.is_sendable() {
            return Err(GatewayError::invalid_command(
                op.name(),
                "op code is receive only",
            ));
        }
        self.inner.send_frame(op, payload).await
    }

    /// Send a heartbeat carrying the last sequence number
    pub async fn heartbeat(&self) -> Result<(), GatewayError> {
        self.inner.send_heartbeat().await
    }

    pub async fn identify(&self) -> Result<(), GatewayError> {
        self.inner.send_identify().await
    }

    /// Resume the held session; identifies when there is none
    pub async fn resume(&self) -> Result<(), GatewayError> {
        self.inner.send_resume().await
    }

    /// Ask for guild members; they arrive as `GUILD_MEMBERS_CHUNK` dispatches
    pub async fn request_guild_members(
        &self,
        request: GuildMembersRequest,
    ) -> Result<(), GatewayError> {
        let payload = request.into_payload()?;
        self.inner
            .send_frame(OpCode::RequestGuildMembers, &payload)
            .await
    }

    /// Join, move between or leave voice channels
    pub async fn update_voice_state(&self, update: VoiceStateUpdate) -> Result<(), GatewayError> {
        let payload = update.into_payload()?;
        self.inner.send_frame(OpCode::VoiceStateUpdate, &payload).await
    }

    /// Update the bot's presence.
    ///
    /// The presence is also remembered and sent with any later IDENTIFY.
    pub async fn update_presence(&self, presence: Presence) -> Result<(), GatewayError> {
        presence.validate()?;
        *self.inner.presence.write() = Some(presence.clone());
        self.inner.send_frame(OpCode::PresenceUpdate, &presence).await
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.inner.heartbeat.lock().latency()
    }

    /// Snapshot of the resumable session
    pub fn session(&self) -> Session {
        self.inner.session.read().clone()
    }

    pub fn status(&self) -> ShardStatus {
        *self.inner.status.lock()
    }

    /// This shard's event bus
    pub fn events(&self) -> &EventBus<ShardEvent> {
        &self.inner.bus
    }

    /// Call `handler` for every dispatch named `name` not claimed by a wait
    pub fn listen<F>(&self, name: &str, handler: F) -> ListenerId
    where
        F: Fn(&Dispatch) + Send + Sync + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        self.inner
            .bus
            .subscribe(EventKind::Dispatch, move |event: &ShardEvent| {
                if let Some(dispatch) = event.as_dispatch().filter(|d| d.is(&name)) {
                    handler(dispatch);
                }
            })
    }

    /// Wait for the next dispatch named `name` that passes `check`.
    ///
    /// Registered immediately; the matching dispatch is not delivered to
    /// listeners.
    pub fn wait_for_dispatch<F>(
        &self,
        name: &str,
        check: F,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Dispatch, GatewayError>> + Send + 'static
    where
        F: FnMut(&Dispatch) -> bool + Send + 'static,
    {
        wait_for_dispatch(&self.inner.bus, name, check, timeout)
    }
}

/// Register a one-shot wait for a named dispatch on any bus carrying them.
pub(crate) fn wait_for_dispatch<E, F>(
    bus: &EventBus<E>,
    name: &str,
    mut check: F,
    timeout: Option<Duration>,
) -> impl Future<Output = Result<Dispatch, GatewayError>> + Send + 'static
where
    E: crate::events::BusEvent<Kind = EventKind> + AsRef<ShardEvent>,
    F: FnMut(&Dispatch) -> bool + Send + 'static,
{
    let name = name.to_owned();
    let wait = bus.wait_for(
        EventKind::Dispatch,
        move |event: &E| {
            event
                .as_ref()
                .as_dispatch()
                .is_some_and(|dispatch| dispatch.is(&name) && check(dispatch))
        },
        timeout,
    );

    async move {
        let event = wait.await?;
        match event.as_ref() {
            ShardEvent::Dispatch(dispatch) => Ok(dispatch.clone()),
            _ => Err(GatewayError::Wait(WaitError::Closed)),
        }
    }
}

impl ShardInner {
    fn shard_id(&self) -> u32 {
        self.info.id
    }

    fn set_status(&self, status: ShardStatus) {
        *self.status.lock() = status;
        self.state.set_status(self.info.id, status);
    }

    /// Publish a non-terminal error on the bus
    fn report(&self, error: GatewayError) {
        self.metrics
            .record_error(self.shard_id(), error.error_type_label());
        self.bus.emit(ShardEvent::Error(Arc::new(error)));
    }

    fn resolve_ready(&self, data: &Value) {
        if let Some(resolve) = self.ready.lock().take() {
            let _ = resolve.send(Ok(data.clone()));
        }
    }

    async fn send_frame<T>(&self, op: OpCode, payload: &T) -> Result<(), GatewayError>
    where
        T: Serialize + ?Sized,
    {
        let json = OutboundFrame::new(op, payload)
            .to_json()
            .map_err(|source| GatewayError::Encode {
                op: op.name(),
                source,
            })?;

        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(GatewayError::NotConnected {
                shard_id: self.shard_id(),
            });
        };

        trace!(shard_id = self.shard_id(), op = op.name(), "Sending frame");
        sink.send(Message::text(json))
            .await
            .map_err(|source| GatewayError::Transport {
                shard_id: self.shard_id(),
                source,
            })
    }

    async fn send_heartbeat(&self) -> Result<(), GatewayError> {
        let sequence = self.session.read().sequence;
        self.heartbeat.lock().record_sent(Instant::now());
        self.send_frame(OpCode::Heartbeat, &sequence).await
    }

    async fn send_identify(&self) -> Result<(), GatewayError> {
        let presence = self.presence.read().clone();
        let payload = IdentifyPayload {
            token: self.config.token.clone(),
            properties: self.config.properties.clone(),
            intents: self.config.intents.bits(),
            large_threshold: self.config.large_threshold,
            shard: self.info.identify_field(),
            presence,
        };
        self.send_frame(OpCode::Identify, &payload).await
    }

    async fn send_resume(&self) -> Result<(), GatewayError> {
        let session = self.session.read().clone();
        let Some(session_id) = session.session_id else {
            return self.send_identify().await;
        };
        let payload = ResumePayload {
            token: self.config.token.clone(),
            session_id,
            seq: session.sequence,
        };
        self.send_frame(OpCode::Resume, &payload).await
    }

    /// Close the attached transport with `code`, if any
    async fn close_transport(&self, code: u16) {
        self.set_status(ShardStatus::Closing);
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: Utf8Bytes::from_static(""),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                debug!(shard_id = self.shard_id(), error = %e, "Close frame not delivered");
            }
            let _ = sink.close().await;
        }
    }

    async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        let result = self.run_loop().await;
        self.running.store(false, Ordering::Release);
        result
    }

    /// Connect, drive, classify the close, repeat.
    async fn run_loop(&self) -> Result<(), GatewayError> {
        let shard_id = self.shard_id();
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::default();

        info!(shard_id, shard_count = self.info.count, "Shard starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let resume_url = self.session.read().resume_url.clone();
            let url = gateway_url(resume_url.as_deref().unwrap_or(&self.config.gateway_url));

            self.set_status(ShardStatus::Connecting);
            debug!(shard_id, url = %url, "Connecting");

            let connected = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                result = self.connector.connect(&url) => result,
            };

            let (sink, stream) = match connected {
                Ok(halves) => halves,
                Err(source) => {
                    let delay = backoff.next_delay();
                    warn!(
                        shard_id,
                        error = %source,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection attempt failed"
                    );
                    self.set_status(ShardStatus::Disconnected);
                    self.report(GatewayError::Transport { shard_id, source });
                    tokio::select! {
                        biased;
                        _ = stopped(&mut shutdown) => break,
                        _ = sleep(delay) => continue,
                    }
                }
            };

            *self.sink.lock().await = Some(sink);
            self.greeted.store(false, Ordering::Release);
            self.set_status(ShardStatus::AwaitingHello);
            self.bus.emit(ShardEvent::Open);

            let closed = self.drive(stream, &mut shutdown, &mut backoff).await;

            self.sink.lock().await.take();
            self.heartbeat.lock().stop();
            self.set_status(ShardStatus::Disconnected);

            let (code, reason) = match closed {
                Closed::Shutdown => break,
                Closed::Code { code, reason } => (code, reason),
            };

            match classify(code) {
                CloseDisposition::Fresh => {
                    warn!(shard_id, code, "Session expired, reconnecting with a new session");
                    self.session.write().clear();
                }
                CloseDisposition::Resume => {
                    warn!(shard_id, code, reason = %reason, "Connection closed, reconnecting");
                }
                CloseDisposition::Fatal(close_code) => {
                    let close = FatalClose {
                        code: close_code,
                        reason,
                    };
                    error!(
                        shard_id,
                        code,
                        name = close_code.name(),
                        reason = %close.reason,
                        "Gateway closed the connection with a fatal code"
                    );
                    self.metrics.record_error(shard_id, "fatal_close");
                    self.set_status(ShardStatus::Terminated);

                    let pending = self.ready.lock().take();
                    let error = GatewayError::FatalClose {
                        shard_id,
                        close: close.clone(),
                    };
                    match pending {
                        Some(reject) => {
                            let _ = reject.send(Err(error));
                        }
                        None => {
                            self.bus.emit(ShardEvent::Error(Arc::new(error)));
                        }
                    }
                    return Err(GatewayError::FatalClose { shard_id, close });
                }
            }

            self.state.record_reconnect(shard_id);
            self.metrics.record_reconnect(shard_id);

            // A transport dropped before HELLO is treated like a failed connect
            if !self.greeted.load(Ordering::Acquire) {
                let delay = backoff.next_delay();
                debug!(shard_id, retry_in_ms = delay.as_millis() as u64, "Closed before hello");
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    _ = sleep(delay) => {}
                }
            }
        }

        self.set_status(ShardStatus::Terminated);
        // Dropping the sender fails a pending `connect` with NotConnected
        self.ready.lock().take();
        info!(shard_id, "Shard stopped");
        Ok(())
    }

    /// Process one transport until it closes
    async fn drive(
        &self,
        mut stream: WsStream,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Closed {
        let shard_id = self.shard_id();

        loop {
            let next_due = self.heartbeat.lock().next_due;
            let tick = async move {
                match next_due {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = stopped(shutdown) => {
                    self.close_transport(CLIENT_FRESH_CLOSE).await;
                    return Closed::Shutdown;
                }
                _ = tick => {
                    if let Some(code) = self.heartbeat_tick().await {
                        return Closed::local(code);
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(code) = self.handle_text(text.as_str(), backoff).await {
                            return Closed::local(code);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => Closed::Code {
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_owned(),
                            },
                            None => Closed::local(NO_STATUS_CLOSE),
                        };
                    }
                    Some(Ok(other)) => {
                        trace!(shard_id, kind = ?other, "Ignoring non-text message");
                    }
                    Some(Err(source)) => {
                        self.report(GatewayError::Transport { shard_id, source });
                        return Closed::local(ABNORMAL_CLOSE);
                    }
                    None => return Closed::local(ABNORMAL_CLOSE),
                },
            }
        }
    }

    /// Returns the close code when the connection was found zombied
    async fn heartbeat_tick(&self) -> Option<u16> {
        let shard_id = self.shard_id();
        let zombied = self.heartbeat.lock().awaiting_ack();
        if zombied {
            warn!(shard_id, "Heartbeat not acknowledged, forcing reconnect");
            self.heartbeat.lock().stop();
            self.set_status(ShardStatus::Degraded);
            self.close_transport(CLIENT_RESUME_CLOSE).await;
            return Some(CLIENT_RESUME_CLOSE);
        }

        if let Err(e) = self.send_heartbeat().await {
            warn!(shard_id, error = %e, "Failed to send heartbeat");
        }
        None
    }

    /// Returns the close code when the frame made us drop the connection
    async fn handle_text(&self, text: &str, backoff: &mut Backoff) -> Option<u16> {
        let shard_id = self.shard_id();
        self.bus.emit(ShardEvent::Message(Arc::from(text)));

        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(source) => {
                warn!(shard_id, error = %source, "Failed to decode frame");
                self.report(GatewayError::Decode { shard_id, source });
                return None;
            }
        };

        if let Some(sequence) = frame.s {
            self.session.write().observe_sequence(sequence);
        }

        match frame.opcode() {
            Some(OpCode::Dispatch) => {
                self.handle_dispatch(frame, backoff);
                None
            }
            Some(OpCode::Heartbeat) => {
                debug!(shard_id, "Gateway requested a heartbeat");
                if let Err(e) = self.send_heartbeat().await {
                    warn!(shard_id, error = %e, "Failed to send heartbeat");
                }
                None
            }
            Some(OpCode::Reconnect) => {
                info!(shard_id, "Gateway requested a reconnect");
                self.close_transport(CLIENT_RESUME_CLOSE).await;
                Some(CLIENT_RESUME_CLOSE)
            }
            Some(OpCode::InvalidSession) => {
                let resumable = frame.data().as_bool().unwrap_or(false);
                warn!(shard_id, resumable, "Session invalidated");
                if resumable {
                    self.close_transport(CLIENT_RESUME_CLOSE).await;
                    Some(CLIENT_RESUME_CLOSE)
                } else {
                    self.session.write().clear();
                    self.close_transport(CLIENT_FRESH_CLOSE).await;
                    Some(CLIENT_FRESH_CLOSE)
                }
            }
            Some(OpCode::Hello) => {
                self.handle_hello(&frame).await;
                None
            }
            Some(OpCode::HeartbeatAck) => {
                let latency = self.heartbeat.lock().record_ack(Instant::now());
                self.state.record_heartbeat(shard_id, latency);
                if let Some(latency) = latency {
                    trace!(shard_id, latency_ms = latency.as_millis() as u64, "Heartbeat acknowledged");
                    self.metrics.record_heartbeat(shard_id, latency);
                }
                None
            }
            _ => {
                debug!(shard_id, op = frame.op, "Ignoring unhandled op code");
                None
            }
        }
    }

    async fn handle_hello(&self, frame: &InboundFrame) {
        let shard_id = self.shard_id();
        let hello: HelloPayload = match parse_data(frame.data()) {
            Ok(hello) => hello,
            Err(source) => {
                self.report(GatewayError::Decode { shard_id, source });
                return;
            }
        };

        self.greeted.store(true, Ordering::Release);
        let interval = Duration::from_millis(hello.heartbeat_interval);
        let first_in = interval.mul_f64(rand::random::<f64>());
        self.heartbeat
            .lock()
            .start(interval, first_in, Instant::now());

        let resumable = self.session.read().can_resume();
        debug!(
            shard_id,
            heartbeat_interval_ms = hello.heartbeat_interval,
            resumable,
            "Received hello"
        );

        let sent = if resumable {
            self.set_status(ShardStatus::Resuming);
            self.send_resume().await
        } else {
            self.set_status(ShardStatus::Identifying);
            self.send_identify().await
        };
        if let Err(e) = sent {
            warn!(shard_id, error = %e, "Failed to send handshake");
            self.report(e);
        }
    }

    fn handle_dispatch(&self, frame: InboundFrame, backoff: &mut Backoff) {
        let shard_id = self.shard_id();
        let Some(name) = frame.t else {
            debug!(shard_id, "Dispatch without an event name");
            return;
        };
        let data = frame.d.unwrap_or(Value::Null);

        match name.as_str() {
            "READY" => match parse_data::<ReadyPayload>(&data) {
                Ok(ready) => {
                    info!(shard_id, session_id = %ready.session_id, "Shard ready");
                    {
                        let mut session = self.session.write();
                        session.session_id = Some(ready.session_id);
                        session.resume_url = ready.resume_gateway_url;
                    }
                    self.set_status(ShardStatus::Ready);
                    backoff.reset();
                    self.resolve_ready(&data);
                }
                Err(source) => {
                    self.report(GatewayError::Decode { shard_id, source });
                }
            },
            "RESUMED" => {
                info!(shard_id, seq = ?frame.s, "Shard resumed");
                self.set_status(ShardStatus::Ready);
                backoff.reset();
                self.resolve_ready(&data);
            }
            _ => {}
        }

        self.state.record_event(shard_id);
        self.metrics.record_event(shard_id, &name);

        self.bus.emit(ShardEvent::Dispatch(Dispatch {
            name: Arc::from(name),
            sequence: frame.s,
            data: Arc::new(data),
        }));
    }
}

/// Resolves once shutdown has been requested
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
