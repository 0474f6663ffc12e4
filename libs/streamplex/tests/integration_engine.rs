//! Integration tests for the engine event loop
//!
//! Each test runs a real engine against in-memory pipes and plays the server
//! side by hand, so every byte on the wire is under the test's control.

#[macro_use]
mod common;

use common::{next_event, Event, FakeServer, MemoryConnector, RecordingHandler, TEST_URL};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;
use streamplex::core::frame::{self, OpCode};
use streamplex::{
    BackoffKind, CloseReason, ConnectionStatus, EngineBuilder, EngineConfig, EngineHandle,
    Message, ReconnectConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn fast_config() -> EngineConfig {
    EngineConfig {
        reconnect: ReconnectConfig {
            backoff: BackoffKind::Fixed,
            initial_delay_ms: 50,
            max_delay_ms: 50,
            max_attempts: Some(3),
        },
        ..EngineConfig::default()
    }
}

fn start<const N: usize>(
    connector: MemoryConnector,
    config: EngineConfig,
    topics: [&str; N],
) -> (EngineHandle, mpsc::UnboundedReceiver<Event>, JoinHandle<()>) {
    let (handler, events) = RecordingHandler::new();
    let (engine, handle) = EngineBuilder::new()
        .url(TEST_URL)
        .handler(handler)
        .config(config)
        .topics(topics)
        .build_with_connector(connector)
        .unwrap();
    (handle, events, engine.spawn())
}

fn json(payload: &[u8]) -> Value {
    serde_json::from_slice(payload).unwrap()
}

async fn wait_for_status(handle: &EngineHandle, topic: &str, wanted: ConnectionStatus) {
    for _ in 0..200 {
        if handle.status(topic).await.unwrap() == Some(wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never reached {}", topic, wanted);
}

#[tokio::test]
async fn test_subscription_request_sent_on_open() {
    verbose_println!("Testing subscription request on open...");

    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    verbose_println!("  Request head:\n{}", server.request);
    assert!(server.request.starts_with("GET /ws HTTP/1.1\r\n"));
    assert!(server.request.contains("Host: stream.test:9443\r\n"));
    assert!(server.request.contains("Sec-WebSocket-Version: 13\r\n"));

    let request = server.recv_frame().await;
    assert_eq!(request.opcode, OpCode::Text);
    assert!(request.masked, "client frames must be masked");
    let value = json(&request.payload);
    assert_eq!(value["method"], "SUBSCRIBE");
    assert_eq!(value["params"][0], "btcusdt@trade");
    assert_eq!(value["id"].as_u64(), Some(1));

    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    assert_eq!(
        handle.status("btcusdt").await.unwrap(),
        Some(ConnectionStatus::Open)
    );
    assert_eq!(handle.metrics().connections_open, 1);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_messages_delivered_in_order_and_ack_consumed() {
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;

    server.send_text(r#"{"result":null,"id":1}"#).await;
    server.send_text(r#"{"e":"trade","p":"42000.5"}"#).await;
    server.send(OpCode::Binary, &[1, 2, 3], true).await;

    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("btcusdt".into(), Message::text(r#"{"e":"trade","p":"42000.5"}"#))
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("btcusdt".into(), Message::binary(vec![1, 2, 3]))
    );
    assert_eq!(handle.metrics().messages_received, 2);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_fragmented_message_with_interleaved_ping() {
    verbose_println!("Testing fragment reassembly around a Ping...");

    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["ethusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;

    server.send(OpCode::Text, b"hel", false).await;
    server.send(OpCode::Ping, b"are you there", true).await;
    server.send(OpCode::Continuation, b"lo", true).await;

    let pong = server.recv_opcode(OpCode::Pong).await;
    assert_eq!(pong.payload, b"are you there");
    assert!(pong.masked);

    assert_eq!(next_event(&mut events).await, Event::Opened("ethusdt".into()));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("ethusdt".into(), Message::text("hello"))
    );

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_frame_in_handshake_response_is_delivered() {
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let early = frame::encode_unmasked(OpCode::Text, b"early", true).unwrap();
    let _server = FakeServer::accept_with_trailing(accepted.recv().await.unwrap(), &early).await;

    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("btcusdt".into(), Message::text("early"))
    );

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_is_echoed_then_reconnected() {
    verbose_println!("Testing peer-initiated close...");

    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));

    server.send_close(1001, "going away").await;
    let echo = server.recv_opcode(OpCode::Close).await;
    assert_eq!(frame::parse_close_payload(&echo.payload).0, Some(1001));
    assert!(server.recv_until_hangup().await.is_empty());

    assert_eq!(
        next_event(&mut events).await,
        Event::Closed(
            "btcusdt".into(),
            CloseReason::PeerClosed {
                code: Some(1001),
                reason: "going away".into()
            }
        )
    );

    // Same topic comes back on a fresh connection with a fresh request id
    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    let request = server.recv_opcode(OpCode::Text).await;
    assert_eq!(json(&request.payload)["id"].as_u64(), Some(2));
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    assert_eq!(handle.metrics().reconnect_attempts, 1);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_hangup_triggers_reconnect() {
    let (connector, mut accepted) = MemoryConnector::new();
    let attempts = connector.attempts();
    let (handle, mut events, task) = start(connector, fast_config(), ["solusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("solusdt".into()));

    drop(server);
    assert_eq!(
        next_event(&mut events).await,
        Event::Closed("solusdt".into(), CloseReason::Hangup)
    );

    let _server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("solusdt".into()));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ping_evicts_dead_peer() {
    verbose_println!("Testing dead peer detection...");

    let config = EngineConfig {
        idle_tick_ms: 1_000,
        liveness_check_interval_ms: 500,
        dead_peer_timeout_ms: 2_000,
        ..fast_config()
    };
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, config, ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));

    // Idle tick sends a Ping that is never answered
    let ping = server.recv_opcode(OpCode::Ping).await;
    assert!(ping.payload.is_empty());

    assert_eq!(
        next_event(&mut events).await,
        Event::Closed("btcusdt".into(), CloseReason::DeadPeer)
    );
    assert!(handle.metrics().pings_sent >= 1);

    let _server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    assert_eq!(handle.metrics().reconnect_attempts, 1);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_peer_that_stops_reading_does_not_stall_other_connections() {
    verbose_println!("Testing a peer that never reads its Pongs...");

    let config = EngineConfig {
        write_timeout_ms: 200,
        ..fast_config()
    };
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, config, ["btcusdt", "ethusdt"]);

    let mut stuck = None;
    let mut healthy = None;
    for _ in 0..2 {
        let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
        let request = json(&server.recv_opcode(OpCode::Text).await.payload);
        if request["params"][0] == "btcusdt@trade" {
            stuck = Some(server);
        } else {
            healthy = Some(server);
        }
    }
    let mut stuck = stuck.unwrap();
    let mut healthy = healthy.unwrap();
    for _ in 0..2 {
        assert!(matches!(next_event(&mut events).await, Event::Opened(_)));
    }

    // The Pong replies fill the pipe because this server never reads again
    let flood = tokio::spawn(async move {
        let payload = [0x5Au8; 125];
        for _ in 0..1000 {
            if !stuck.try_send(OpCode::Ping, &payload, true).await {
                break;
            }
        }
    });
    healthy.send_text(r#"{"p":"42.0"}"#).await;

    let progressed = tokio::time::timeout(Duration::from_secs(3), async {
        let (mut delivered, mut evicted) = (false, false);
        while !(delivered && evicted) {
            match next_event(&mut events).await {
                Event::Message(topic, message) => {
                    assert_eq!(topic, "ethusdt");
                    assert_eq!(message, Message::text(r#"{"p":"42.0"}"#));
                    delivered = true;
                }
                Event::Closed(topic, CloseReason::Transport(detail)) => {
                    verbose_println!("  {} evicted: {}", topic, detail);
                    assert_eq!(topic, "btcusdt");
                    assert!(detail.contains("timed out"));
                    evicted = true;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    })
    .await;
    assert!(progressed.is_ok(), "engine loop stalled behind a blocked write");
    assert!(handle.metrics().reconnect_attempts >= 1);

    handle.shutdown();
    let close = healthy.recv_opcode(OpCode::Close).await;
    assert_eq!(frame::parse_close_payload(&close.payload).0, Some(1000));
    assert!(
        tokio::time::timeout(Duration::from_secs(3), task).await.is_ok(),
        "shutdown stalled"
    );
    flood.abort();
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_connection_open() {
    let config = EngineConfig {
        idle_tick_ms: 1_000,
        liveness_check_interval_ms: 500,
        dead_peer_timeout_ms: 2_000,
        ..fast_config()
    };
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, config, ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));

    for round in 0..5 {
        let ping = server.recv_opcode(OpCode::Ping).await;
        verbose_println!("  Ping {} answered", round + 1);
        server.send(OpCode::Pong, &ping.payload, true).await;
    }

    assert!(events.try_recv().is_err(), "no lifecycle change expected");
    assert_eq!(
        handle.status("btcusdt").await.unwrap(),
        Some(ConnectionStatus::Open)
    );
    assert!(handle.metrics().pongs_received >= 4);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_retry_exhaustion_is_terminal() {
    verbose_println!("Testing retry exhaustion...");

    let config = EngineConfig {
        reconnect: ReconnectConfig {
            backoff: BackoffKind::Fixed,
            initial_delay_ms: 10,
            max_delay_ms: 10,
            max_attempts: Some(2),
        },
        ..EngineConfig::default()
    };
    let (connector, _accepted) = MemoryConnector::refusing(usize::MAX);
    let attempts = connector.attempts();
    let (handle, mut events, task) = start(connector, config, ["btcusdt"]);

    match next_event(&mut events).await {
        Event::Closed(topic, CloseReason::RetryExhausted { attempts, last_error }) => {
            assert_eq!(topic, "btcusdt");
            assert_eq!(attempts, 2);
            assert!(last_error.contains("refused"), "{}", last_error);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Initial connect plus two retries
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        handle.status("btcusdt").await.unwrap(),
        Some(ConnectionStatus::Failed)
    );
    let metrics = handle.metrics();
    assert_eq!(metrics.reconnect_attempts, 2);
    assert_eq!(metrics.failed_subscriptions, 1);

    // A failed topic can be subscribed again
    handle.subscribe("btcusdt").unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        Event::Closed(_, CloseReason::RetryExhausted { .. })
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 6);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_recovers_after_refused_connects() {
    let (connector, mut accepted) = MemoryConnector::refusing(2);
    let attempts = connector.attempts();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let _server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(handle.metrics().reconnect_attempts, 2);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_sends_request_then_close() {
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));

    handle.unsubscribe("btcusdt").unwrap();

    let request = server.recv_frame().await;
    let value = json(&request.payload);
    assert_eq!(value["method"], "UNSUBSCRIBE");
    assert_eq!(value["id"].as_u64(), Some(2));

    let close = server.recv_frame().await;
    assert_eq!(close.opcode, OpCode::Close);
    assert_eq!(frame::parse_close_payload(&close.payload).0, Some(1000));
    assert!(server.recv_until_hangup().await.is_empty());

    assert_eq!(
        next_event(&mut events).await,
        Event::Closed("btcusdt".into(), CloseReason::Unsubscribed)
    );
    assert_eq!(handle.status("btcusdt").await.unwrap(), None);
    assert_eq!(handle.metrics().connections_open, 0);

    // Nothing reconnects an unsubscribed topic
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(accepted.try_recv().is_err());

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_status_follows_lifecycle() {
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), []);

    assert_eq!(handle.status("btcusdt").await.unwrap(), None);

    handle.subscribe("btcusdt").unwrap();
    handle.subscribe("btcusdt").unwrap();

    // Hold the handshake open until the status has been observed
    let pending = accepted.recv().await.unwrap();
    wait_for_status(&handle, "btcusdt", ConnectionStatus::WsHandshake).await;

    let _server = FakeServer::accept(pending).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    wait_for_status(&handle, "btcusdt", ConnectionStatus::Open).await;

    // The duplicate subscribe did not open a second connection
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(accepted.try_recv().is_err());

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    verbose_println!("Testing shutdown...");

    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt", "ethusdt"]);

    let mut servers = Vec::new();
    for _ in 0..2 {
        let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
        server.recv_opcode(OpCode::Text).await;
        servers.push(server);
    }
    for _ in 0..2 {
        assert!(matches!(next_event(&mut events).await, Event::Opened(_)));
    }
    assert_eq!(handle.metrics().connections_open, 2);

    handle.shutdown();

    for server in &mut servers {
        let close = server.recv_opcode(OpCode::Close).await;
        assert_eq!(frame::parse_close_payload(&close.payload).0, Some(1000));
    }
    task.await.unwrap();

    let mut closed = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            Event::Closed(topic, CloseReason::Shutdown) => closed.push(topic),
            other => panic!("unexpected event {:?}", other),
        }
    }
    closed.sort();
    assert_eq!(closed, vec!["btcusdt".to_string(), "ethusdt".to_string()]);
    assert!(!handle.is_running());
}

#[tokio::test]
async fn test_masked_server_frame_is_skipped() {
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;

    // Masked, empty Text frame: header only
    server.send_raw(&[0x81, 0x80, 0x01, 0x02, 0x03, 0x04]).await;
    server.send_text("after").await;

    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("btcusdt".into(), Message::text("after"))
    );
    assert_eq!(handle.metrics().protocol_violations, 1);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_receive_buffer_overflow_discards_and_continues() {
    verbose_println!("Testing receive buffer ceiling...");

    let config = EngineConfig {
        receive_buffer_ceiling: 4096,
        read_chunk_size: 1024,
        ..fast_config()
    };
    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, config, ["btcusdt"]);

    let mut server = FakeServer::accept(accepted.recv().await.unwrap()).await;
    server.recv_opcode(OpCode::Text).await;
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));

    // Header announcing 10_000 bytes, followed by only half of them
    let mut partial = vec![0x81, 126, 0x27, 0x10];
    partial.extend(std::iter::repeat(0u8).take(5_000));
    server.send_raw(&partial).await;

    for _ in 0..200 {
        if handle.metrics().buffer_overflows > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(handle.metrics().buffer_overflows, 1);

    server.send_text("after").await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("btcusdt".into(), Message::text("after"))
    );
    assert_eq!(
        handle.status("btcusdt").await.unwrap(),
        Some(ConnectionStatus::Open)
    );

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_interoperates_with_tungstenite_server() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    verbose_println!("Testing against tokio-tungstenite's server...");

    let (connector, mut accepted) = MemoryConnector::new();
    let (handle, mut events, task) = start(connector, fast_config(), ["btcusdt"]);

    let mut ws = tokio_tungstenite::accept_async(accepted.recv().await.unwrap())
        .await
        .unwrap();

    match ws.next().await {
        Some(Ok(WsMessage::Text(text))) => {
            assert_eq!(json(text.as_bytes())["method"], "SUBSCRIBE");
        }
        other => panic!("expected subscription request, got {:?}", other),
    }
    assert_eq!(next_event(&mut events).await, Event::Opened("btcusdt".into()));

    let large = "x".repeat(10_000);
    ws.send(WsMessage::Text(large.clone())).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("btcusdt".into(), Message::text(large))
    );

    ws.send(WsMessage::Ping(b"hb".to_vec())).await.unwrap();
    match ws.next().await {
        Some(Ok(WsMessage::Pong(payload))) => assert_eq!(payload, b"hb"),
        other => panic!("expected pong, got {:?}", other),
    }

    handle.shutdown();
    match ws.next().await {
        Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected close, got {:?}", other),
    }
    task.await.unwrap();
}
