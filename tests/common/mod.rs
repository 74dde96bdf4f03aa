//! In-memory gateway used by the integration tests
//!
//! `FakeConnector` hands each shard one end of a channel pair; the test
//! holds the other end as a `ServerConn` and scripts the server side.

#![allow(dead_code)]

use futures::channel::mpsc as channel;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shardwire::control::{ControlPlane, ControlPlaneError, GatewayBotInfo, SessionStartLimit};
use shardwire::shard::{Connector, ShardConfig, WsSink, WsStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::{Error as WsError, Utf8Bytes};
use twilight_model::gateway::Intents;

pub const TOKEN: &str = "test-token";
pub const GATEWAY: &str = "wss://gateway.test";
pub const GATEWAY_URL: &str = "wss://gateway.test/?v=10&encoding=json";
pub const RESUME: &str = "wss://resume.test";
pub const RESUME_URL: &str = "wss://resume.test/?v=10&encoding=json";

pub fn shard_config() -> ShardConfig {
    ShardConfig::new(TOKEN, Intents::GUILDS | Intents::GUILD_MESSAGES).with_gateway_url(GATEWAY)
}

/// Connects shards to the test's `FakeGateway`
pub struct FakeConnector {
    accepted: mpsc::UnboundedSender<ServerConn>,
    failures: AtomicUsize,
}

impl FakeConnector {
    /// Make the next `count` connection attempts fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(WsSink, WsStream), WsError>> {
        Box::pin(async move {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(WsError::ConnectionClosed);
            }

            let (client_tx, from_client) = channel::unbounded::<Message>();
            let (to_client, client_rx) = channel::unbounded::<Result<Message, WsError>>();

            let accepted = self.accepted.send(ServerConn {
                url: url.to_owned(),
                opened_at: Instant::now(),
                to_client,
                from_client,
            });
            if accepted.is_err() {
                // The test's gateway is gone
                return Err(WsError::ConnectionClosed);
            }

            let sink: WsSink = Box::pin(client_tx.sink_map_err(|_| WsError::ConnectionClosed));
            let stream: WsStream = Box::pin(client_rx);
            Ok((sink, stream))
        })
    }
}

/// Server side of every connection opened through a `FakeConnector`
pub struct FakeGateway {
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

pub fn fake_gateway() -> (Arc<FakeConnector>, FakeGateway) {
    let (accepted_tx, accepted) = mpsc::unbounded_channel();
    (
        Arc::new(FakeConnector {
            accepted: accepted_tx,
            failures: AtomicUsize::new(0),
        }),
        FakeGateway { accepted },
    )
}

impl FakeGateway {
    pub async fn next_connection(&mut self) -> ServerConn {
        tokio::time::timeout(Duration::from_secs(600), self.accepted.recv())
            .await
            .expect("no connection within 600s")
            .expect("connector dropped")
    }

    pub fn try_next_connection(&mut self) -> Option<ServerConn> {
        self.accepted.try_recv().ok()
    }
}

/// What the client sent
#[derive(Debug)]
pub enum Received {
    Frame(Value),
    Close(Option<u16>),
    Ended,
}

/// One accepted connection, seen from the server
pub struct ServerConn {
    pub url: String,
    pub opened_at: Instant,
    to_client: channel::UnboundedSender<Result<Message, WsError>>,
    from_client: channel::UnboundedReceiver<Message>,
}

impl ServerConn {
    pub fn send(&self, frame: Value) {
        let _ = self
            .to_client
            .unbounded_send(Ok(Message::text(frame.to_string())));
    }

    pub fn hello(&self, heartbeat_interval: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval}}));
    }

    pub fn dispatch(&self, name: &str, seq: u64, data: Value) {
        self.send(json!({"op": 0, "s": seq, "t": name, "d": data}));
    }

    pub fn ready(&self, session_id: &str, seq: u64) {
        self.dispatch(
            "READY",
            seq,
            json!({"session_id": session_id, "resume_gateway_url": RESUME, "v": 10}),
        );
    }

    pub fn heartbeat_ack(&self) {
        self.send(json!({"op": 11}));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.unbounded_send(Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from_static("closed by test"),
        }))));
    }

    pub async fn recv(&mut self) -> Received {
        loop {
            match self.from_client.next().await {
                Some(Message::Text(text)) => {
                    let frame = serde_json::from_str(text.as_str()).expect("client sent invalid JSON");
                    return Received::Frame(frame);
                }
                Some(Message::Close(frame)) => {
                    return Received::Close(frame.map(|f| u16::from(f.code)));
                }
                Some(_) => continue,
                None => return Received::Ended,
            }
        }
    }

    /// Next frame with op code `op`, skipping heartbeats and anything else
    pub async fn next_op(&mut self, op: u64) -> Value {
        loop {
            match self.recv().await {
                Received::Frame(frame) if frame["op"] == op => return frame,
                Received::Frame(_) => continue,
                other => panic!("expected op {op}, got {other:?}"),
            }
        }
    }

    /// Skip frames until the client closes; returns the close code
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            match self.recv().await {
                Received::Frame(_) => continue,
                Received::Close(code) => return code,
                Received::Ended => return None,
            }
        }
    }

    /// HELLO, wait for IDENTIFY, answer READY; returns the IDENTIFY frame
    pub async fn handshake(&mut self, session_id: &str) -> Value {
        self.hello(45_000);
        let identify = self.next_op(2).await;
        self.ready(session_id, 1);
        identify
    }
}

/// Control plane answering with a fixed recommendation
#[derive(Debug, Clone)]
pub struct MockControl {
    pub info: Result<GatewayBotInfo, ControlPlaneError>,
}

impl MockControl {
    pub fn new(shards: u32, total: u64, max_concurrency: u64) -> Self {
        Self::with_limit(shards, total, total, max_concurrency)
    }

    pub fn with_limit(shards: u32, total: u64, remaining: u64, max_concurrency: u64) -> Self {
        Self {
            info: Ok(GatewayBotInfo {
                url: GATEWAY.to_string(),
                shards,
                session_start_limit: SessionStartLimit {
                    total,
                    remaining,
                    max_concurrency,
                    reset_after: Duration::from_secs(3600),
                },
            }),
        }
    }

    pub fn failing(error: ControlPlaneError) -> Self {
        Self { info: Err(error) }
    }
}

impl ControlPlane for MockControl {
    async fn gateway_bot(&self) -> Result<GatewayBotInfo, ControlPlaneError> {
        self.info.clone()
    }
}
