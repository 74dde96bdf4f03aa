//! ShardConnection state machine against a scripted gateway

mod common;

use common::*;
use serde_json::json;
use shardwire::error::GatewayError;
use shardwire::events::{EventKind, ShardEvent};
use shardwire::protocol::{GatewayCloseCode, GuildMembersRequest, OpCode, Presence, Status};
use shardwire::shard::{ShardConnection, ShardInfo, ShardStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn shard(connector: Arc<FakeConnector>, info: ShardInfo) -> ShardConnection {
    ShardConnection::new(info, shard_config(), connector)
}

#[tokio::test(start_paused = true)]
async fn test_identify_and_ready() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(2, 4));

    let (ready, (conn, identify)) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        let identify = conn.handshake("session-1").await;
        (conn, identify)
    });

    let ready = ready.unwrap();
    assert_eq!(ready["session_id"], "session-1");
    assert_eq!(conn.url, GATEWAY_URL);

    assert_eq!(identify["d"]["token"], TOKEN);
    assert_eq!(identify["d"]["intents"], 513);
    assert_eq!(identify["d"]["shard"], json!([2, 4]));

    let session = shard.session();
    assert_eq!(session.session_id.as_deref(), Some("session-1"));
    assert_eq!(session.resume_url.as_deref(), Some(RESUME));
    assert_eq!(session.sequence, Some(1));
    assert_eq!(shard.status(), ShardStatus::Ready);
    assert!(shard.latency().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unsharded_identify_omits_shard_field() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::unsharded());

    let (ready, (conn, identify)) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        let identify = conn.handshake("solo").await;
        (conn, identify)
    });

    ready.unwrap();
    assert!(identify["d"].get("shard").is_none());
    assert_eq!(conn.url, GATEWAY_URL);
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_is_rejected() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (first, conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s").await;
        conn
    });
    first.unwrap();

    assert!(matches!(shard.connect().await, Err(GatewayError::AlreadyRunning)));
    drop(conn);
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_codes_clear_session() {
    for code in [4009u16, 4007] {
        let (connector, mut gateway) = fake_gateway();
        let shard = shard(connector, ShardInfo::new(0, 1));

        let (ready, mut conn) = tokio::join!(shard.connect(), async {
            let mut conn = gateway.next_connection().await;
            conn.handshake("expiring").await;
            conn
        });
        ready.unwrap();
        conn.dispatch("MESSAGE_CREATE", 2, json!({}));
        conn.close(code);

        let mut next = gateway.next_connection().await;
        assert_eq!(next.url, GATEWAY_URL, "code {code} must not reuse the resume url");
        let session = shard.session();
        assert!(session.session_id.is_none());
        assert!(session.sequence.is_none());
        assert!(session.resume_url.is_none());

        next.hello(45_000);
        let identify = next.next_op(2).await;
        assert_eq!(identify["op"], 2);

        shard.shutdown();
        shard.wait().await.unwrap();
        drop(conn);
    }
}

#[tokio::test(start_paused = true)]
async fn test_fatal_close_rejects_connect_without_reconnect() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (result, ()) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.hello(45_000);
        conn.next_op(2).await;
        conn.close(4004);
    });

    match result {
        Err(GatewayError::FatalClose { shard_id, close }) => {
            assert_eq!(shard_id, 0);
            assert_eq!(close.code, GatewayCloseCode::AuthenticationFailed);
        }
        other => panic!("expected fatal close, got {other:?}"),
    }

    let ended = shard.wait().await;
    assert!(matches!(ended, Err(GatewayError::FatalClose { .. })));
    assert_eq!(shard.status(), ShardStatus::Terminated);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(gateway.try_next_connection().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_close_after_ready_is_emitted() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));
    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&errors);
    shard.events().subscribe(EventKind::Error, move |event| {
        if let ShardEvent::Error(e) = event {
            if matches!(**e, GatewayError::FatalClose { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let (ready, conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s").await;
        conn
    });
    ready.unwrap();

    conn.close(4014);
    assert!(shard.wait().await.is_err());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_close_resumes_on_resume_url() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("keep-me").await;
        conn
    });
    ready.unwrap();
    conn.dispatch("GUILD_CREATE", 5, json!({"id": "1"}));
    conn.close(4000);

    let mut next = gateway.next_connection().await;
    assert_eq!(next.url, RESUME_URL);
    next.hello(45_000);
    let resume = next.next_op(6).await;
    assert_eq!(resume["d"]["token"], TOKEN);
    assert_eq!(resume["d"]["session_id"], "keep-me");
    assert_eq!(resume["d"]["seq"], 5);

    assert_eq!(shard.status(), ShardStatus::Resuming);

    let resumed = shard.wait_for_dispatch("RESUMED", |_| true, Some(Duration::from_secs(5)));
    next.dispatch("RESUMED", 6, json!(null));
    resumed.await.unwrap();
    assert_eq!(shard.status(), ShardStatus::Ready);
    assert_eq!(shard.session().sequence, Some(6));
    drop(conn);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_request_keeps_session() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, mut conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s-7").await;
        conn
    });
    ready.unwrap();
    conn.dispatch("TYPING_START", 2, json!({}));
    conn.send(json!({"op": 7, "d": null}));

    assert_eq!(conn.expect_close().await, Some(4900));

    let mut next = gateway.next_connection().await;
    assert_eq!(next.url, RESUME_URL);
    next.hello(45_000);
    let resume = next.next_op(6).await;
    assert_eq!(resume["d"]["session_id"], "s-7");
    assert_eq!(resume["d"]["seq"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, mut conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s-9").await;
        conn
    });
    ready.unwrap();

    // Resumable: session survives
    conn.send(json!({"op": 9, "d": true}));
    assert_eq!(conn.expect_close().await, Some(4900));
    let mut second = gateway.next_connection().await;
    second.hello(45_000);
    second.next_op(6).await;

    // Not resumable: start fresh
    second.send(json!({"op": 9, "d": false}));
    assert_eq!(second.expect_close().await, Some(1000));
    assert!(shard.session().session_id.is_none());

    let mut third = gateway.next_connection().await;
    assert_eq!(third.url, GATEWAY_URL);
    third.hello(45_000);
    third.next_op(2).await;
}

#[tokio::test(start_paused = true)]
async fn test_zombie_heartbeat_forces_reconnect() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, mut conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.hello(1_000);
        conn.next_op(2).await;
        conn.ready("zombie", 3);
        conn
    });
    ready.unwrap();

    let heartbeat = conn.next_op(1).await;
    assert_eq!(heartbeat["d"], 3);
    assert!(shard.latency().is_none());

    // No ACK: the next tick closes the transport instead of heartbeating again
    assert_eq!(conn.expect_close().await, Some(4900));
    assert!(shard.latency().is_none());

    let mut next = gateway.next_connection().await;
    assert_eq!(next.url, RESUME_URL);
    next.hello(1_000);
    let resume = next.next_op(6).await;
    assert_eq!(resume["d"]["session_id"], "zombie");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ack_measures_latency() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, mut conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.hello(1_000);
        conn.next_op(2).await;
        conn.ready("alive", 1);
        conn
    });
    ready.unwrap();

    for _ in 0..3 {
        conn.next_op(1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        conn.heartbeat_ack();
    }
    conn.next_op(1).await;

    let latency = shard.latency().expect("latency after ack");
    assert!(latency >= Duration::from_millis(40) && latency < Duration::from_millis(41));
    assert!(gateway.try_next_connection().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_server_heartbeat_request_is_answered() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, mut conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s").await;
        conn
    });
    ready.unwrap();

    conn.send(json!({"op": 1, "d": null}));
    let heartbeat = conn.next_op(1).await;
    assert_eq!(heartbeat["d"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_back_off() {
    let (connector, mut gateway) = fake_gateway();
    connector.fail_next(3);
    let shard = shard(Arc::clone(&connector), ShardInfo::new(0, 1));
    let started = tokio::time::Instant::now();

    let (ready, conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("late").await;
        conn
    });
    ready.unwrap();

    // 1s + 2s + 4s of backoff before the fourth attempt
    assert_eq!(conn.opened_at - started, Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_waits_take_precedence_over_listeners() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));
    let listened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&listened);
    shard.listen("MESSAGE_CREATE", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (ready, conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s").await;
        conn
    });
    ready.unwrap();

    let reply = shard.wait_for_dispatch(
        "MESSAGE_CREATE",
        |dispatch| dispatch.data["author"] == "alice",
        Some(Duration::from_secs(10)),
    );
    conn.dispatch("MESSAGE_CREATE", 2, json!({"author": "bob"}));
    conn.dispatch("MESSAGE_CREATE", 3, json!({"author": "alice"}));

    let reply = reply.await.unwrap();
    assert_eq!(reply.sequence, Some(3));
    assert_eq!(listened.load(Ordering::SeqCst), 1);

    let timed_out = shard
        .wait_for_dispatch("NEVER", |_| true, Some(Duration::from_secs(1)))
        .await;
    assert!(matches!(timed_out, Err(GatewayError::Wait(_))));
}

#[tokio::test(start_paused = true)]
async fn test_commands() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let not_connected = shard.heartbeat().await;
    assert!(matches!(not_connected, Err(GatewayError::NotConnected { shard_id: 0 })));

    let (ready, mut conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s").await;
        conn
    });
    ready.unwrap();

    shard
        .request_guild_members(GuildMembersRequest::users(81384788765712384, [1, 2]))
        .await
        .unwrap();
    let request = conn.next_op(8).await;
    assert_eq!(request["d"]["guild_id"], "81384788765712384");
    assert_eq!(request["d"]["user_ids"], json!(["1", "2"]));

    let invalid = shard
        .request_guild_members(GuildMembersRequest::default())
        .await;
    assert!(matches!(invalid, Err(GatewayError::InvalidCommand { .. })));

    shard
        .update_presence(Presence::new(Status::Idle))
        .await
        .unwrap();
    let presence = conn.next_op(3).await;
    assert_eq!(presence["d"]["status"], "idle");

    let receive_only = shard.send(OpCode::Hello, &json!({})).await;
    assert!(matches!(receive_only, Err(GatewayError::InvalidCommand { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_reconnecting() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, mut conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s").await;
        conn
    });
    ready.unwrap();

    shard.shutdown();
    assert_eq!(conn.expect_close().await, Some(1000));
    shard.wait().await.unwrap();
    assert_eq!(shard.status(), ShardStatus::Terminated);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(gateway.try_next_connection().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_wait_keeps_task_waitable() {
    let (connector, mut gateway) = fake_gateway();
    let shard = shard(connector, ShardInfo::new(0, 1));

    let (ready, _conn) = tokio::join!(shard.connect(), async {
        let mut conn = gateway.next_connection().await;
        conn.handshake("s").await;
        conn
    });
    ready.unwrap();

    assert!(tokio::time::timeout(Duration::from_secs(1), shard.wait())
        .await
        .is_err());

    shard.shutdown();
    shard.wait().await.unwrap();
    assert_eq!(shard.status(), ShardStatus::Terminated);
}
