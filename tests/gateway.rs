//
// Copyright 2026 Moltz Project. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! End-to-end tests against an in-process mock gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use moltgate::transport::{Candidate, CandidateSource, EstablishTimeouts, TransportMode, establish};
use moltgate::{
    ClientError, ConnectionStatus, ExponentialBackoff, GatewayClient, GatewayConfig,
    HandshakeError, NoReconnect, TransportError,
};

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

/// How the mock gateway answers the connect request.
#[derive(Debug, Clone, Copy, PartialEq)]
enum HandshakePolicy {
    /// Answer with `hello-ok`.
    Accept,
    /// Reject with an UNAUTHORIZED error.
    RejectAuth,
    /// Never answer.
    Ignore,
}

struct MockGateway {
    url: String,
    /// Transport connections accepted so far.
    connections: Arc<AtomicUsize>,
    /// First text frame received on each connection, in accept order.
    first_frames: Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockGateway {
    async fn spawn(policy: HandshakePolicy, drop_first_session: bool) -> Self {
        Self::spawn_with_protocol(policy, drop_first_session, 3).await
    }

    /// Like [`MockGateway::spawn`] but with a chosen protocol version in the
    /// `hello-ok` payload.
    async fn spawn_with_protocol(
        policy: HandshakePolicy,
        drop_first_session: bool,
        hello_protocol: i64,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let first_frames = Arc::new(std::sync::Mutex::new(Vec::new()));

        let conn_counter = connections.clone();
        let frames = first_frames.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let n = conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let kill_after_accept = drop_first_session && n == 1;
                tokio::spawn(serve_connection(
                    stream,
                    policy,
                    kill_after_accept,
                    hello_protocol,
                    frames.clone(),
                ));
            }
        });

        Self {
            url: format!("ws://{addr}"),
            connections,
            first_frames,
        }
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    stream: TcpStream,
    policy: HandshakePolicy,
    kill_after_accept: bool,
    hello_protocol: i64,
    first_frames: Arc<std::sync::Mutex<Vec<String>>>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let mut first = true;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        if first {
            first_frames.lock().unwrap().push(text.clone());
            first = false;
        }

        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        let id = frame["id"].as_str().unwrap_or_default().to_string();
        let method = frame["method"].as_str().unwrap_or_default().to_string();

        match method.as_str() {
            "connect" => match policy {
                HandshakePolicy::Accept => {
                    send(
                        &mut ws,
                        serde_json::json!({
                            "type": "res", "id": id, "ok": true,
                            "payload": {"type": "hello-ok", "protocol": hello_protocol},
                        }),
                    )
                    .await;
                    if kill_after_accept {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
                HandshakePolicy::RejectAuth => {
                    send(
                        &mut ws,
                        serde_json::json!({
                            "type": "res", "id": id, "ok": false,
                            "error": {"code": "UNAUTHORIZED", "message": "bad token"},
                        }),
                    )
                    .await;
                }
                HandshakePolicy::Ignore => {}
            },
            "echo" => {
                send(
                    &mut ws,
                    serde_json::json!({
                        "type": "res", "id": id, "ok": true,
                        "payload": frame["params"],
                    }),
                )
                .await;
            }
            "fail" => {
                send(
                    &mut ws,
                    serde_json::json!({
                        "type": "res", "id": id, "ok": false,
                        "error": {"code": "OVERLOADED", "message": "busy", "retryable": true},
                    }),
                )
                .await;
            }
            "stream.chunks" => {
                for seq in 1..=3 {
                    send(
                        &mut ws,
                        serde_json::json!({
                            "type": "res", "id": id, "ok": true,
                            "seq": seq, "done": false,
                            "payload": {"part": seq},
                        }),
                    )
                    .await;
                }
                send(
                    &mut ws,
                    serde_json::json!({
                        "type": "res", "id": id, "ok": true,
                        "seq": 4, "done": true,
                        "payload": {"complete": true},
                    }),
                )
                .await;
            }
            "stream.drop" => {
                send(
                    &mut ws,
                    serde_json::json!({
                        "type": "res", "id": id, "ok": true,
                        "seq": 1, "done": false,
                        "payload": {"part": 1},
                    }),
                )
                .await;
                let _ = ws.close(None).await;
                return;
            }
            "events.start" => {
                send(
                    &mut ws,
                    serde_json::json!({"type": "res", "id": id, "ok": true}),
                )
                .await;
                send(
                    &mut ws,
                    serde_json::json!({
                        "type": "evt", "event": "chat", "seq": 1,
                        "payload": {"message": "hi"},
                    }),
                )
                .await;
            }
            other => {
                send(
                    &mut ws,
                    serde_json::json!({
                        "type": "res", "id": id, "ok": false,
                        "error": {"code": "NOT_FOUND", "message": format!("no method {other}")},
                    }),
                )
                .await;
            }
        }
    }
}

async fn send(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    value: serde_json::Value,
) {
    let _ = ws.send(Message::Text(value.to_string())).await;
}

/// Hermetic config: fixed URL, no environment hints, no reconnection unless
/// a test opts in.
fn test_config(url: &str) -> GatewayConfig {
    init_tracing();
    GatewayConfig {
        url: Some(url.to_string()),
        token: Some("test-token".to_string()),
        use_env_hints: false,
        handshake_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ping_interval: Duration::from_secs(60),
        reconnect: Arc::new(NoReconnect),
        ..Default::default()
    }
}

#[tokio::test]
async fn connect_then_unary_request() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let client = GatewayClient::new(test_config(&gateway.url));

    let outcome = client.connect().await.unwrap();
    assert_eq!(outcome.protocol, 3);
    assert!(client.current_status().is_ready());

    let payload = client
        .request("echo", Some(serde_json::json!({"n": 7})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["n"], 7);
}

#[tokio::test]
async fn connect_frame_is_first_on_the_wire() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let client = GatewayClient::new(test_config(&gateway.url));

    client.connect().await.unwrap();
    client.request("echo", None).await.unwrap();

    let first_frames = gateway.first_frames.lock().unwrap().clone();
    assert_eq!(first_frames.len(), 1);
    assert!(
        first_frames[0].contains(r#""method":"connect""#),
        "first frame was not connect: {}",
        first_frames[0]
    );
}

#[tokio::test]
async fn request_error_surfaces_gateway_code() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let client = GatewayClient::new(test_config(&gateway.url));
    client.connect().await.unwrap();

    let err = client.request("fail", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Gateway { ref code, .. } if code == "OVERLOADED"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn streamed_response_delivers_chunks_then_terminal() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let client = GatewayClient::new(test_config(&gateway.url));
    client.connect().await.unwrap();

    let mut streaming = client.request_streaming("stream.chunks", None).unwrap();
    for expected in 1..=3 {
        let chunk = streaming.chunks.recv().await.unwrap();
        assert_eq!(chunk.seq, Some(expected));
        assert_eq!(chunk.payload["part"], expected);
    }
    let terminal = streaming.completion.wait().await.unwrap().unwrap();
    assert_eq!(terminal["complete"], true);
    assert!(streaming.chunks.recv().await.is_none());
}

#[tokio::test]
async fn mid_stream_disconnect_fails_the_request() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let client = GatewayClient::new(test_config(&gateway.url));
    client.connect().await.unwrap();

    let mut streaming = client.request_streaming("stream.drop", None).unwrap();
    let chunk = streaming.chunks.recv().await.unwrap();
    assert_eq!(chunk.seq, Some(1));

    let err = streaming.completion.wait().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed));

    // The session is gone; new requests are rejected, not queued.
    let err = client.request("echo", None).await.unwrap_err();
    assert!(matches!(err, ClientError::NotReady));
}

#[tokio::test]
async fn auth_rejection_is_terminal_and_never_retried() {
    let gateway = MockGateway::spawn(HandshakePolicy::RejectAuth, false).await;
    let mut config = test_config(&gateway.url);
    // A live retry policy must still refuse to retry a credential failure.
    config.reconnect = Arc::new(
        ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(20))
            .jitter(false)
            .build(),
    );
    let client = GatewayClient::new(config);

    let err = client.connect().await.unwrap_err();
    assert!(err.requires_reauth());
    assert!(matches!(
        err,
        ClientError::Handshake(HandshakeError::Rejected { .. })
    ));
    assert!(matches!(
        client.current_status(),
        ConnectionStatus::Failed {
            can_retry: false,
            ..
        }
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.connection_count(), 1, "auth failure must not be retried");
}

#[tokio::test]
async fn unanswered_handshake_times_out() {
    let gateway = MockGateway::spawn(HandshakePolicy::Ignore, false).await;
    let mut config = test_config(&gateway.url);
    config.handshake_timeout = Duration::from_millis(300);
    let client = GatewayClient::new(config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Handshake(HandshakeError::TimedOut { .. })
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn lost_session_reconnects_with_backoff() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, true).await;
    let mut config = test_config(&gateway.url);
    config.reconnect = Arc::new(
        ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(50))
            .jitter(false)
            .max_attempts(Some(5))
            .build(),
    );
    let client = GatewayClient::new(config);
    let mut status = client.status();

    let first = client.connect().await.unwrap();

    let ready_again = status.wait_for(|s| {
        matches!(s, ConnectionStatus::Ready { session_id, .. } if *session_id > first.session_id)
    });
    tokio::time::timeout(Duration::from_secs(5), ready_again)
        .await
        .expect("reconnection did not happen")
        .unwrap();

    assert!(gateway.connection_count() >= 2);
    let payload = client
        .request("echo", Some(serde_json::json!({"after": "reconnect"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["after"], "reconnect");
}

#[tokio::test]
async fn explicit_disconnect_suppresses_reconnection() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let mut config = test_config(&gateway.url);
    config.reconnect = Arc::new(
        ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(20))
            .jitter(false)
            .build(),
    );
    let client = GatewayClient::new(config);

    client.connect().await.unwrap();
    client.disconnect().await;
    assert_eq!(client.current_status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.connection_count(), 1, "disconnect must stop reconnection");

    let err = client.request("echo", None).await.unwrap_err();
    assert!(matches!(err, ClientError::NotReady));

    // An explicit connect lifts the suppression.
    client.connect().await.unwrap();
    assert!(client.current_status().is_ready());
    assert_eq!(gateway.connection_count(), 2);
}

#[tokio::test]
async fn concurrent_connect_calls_share_one_session() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let client = GatewayClient::new(test_config(&gateway.url));

    let (a, b) = tokio::join!(client.connect(), client.connect());
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.session_id, b.session_id);
    assert_eq!(gateway.connection_count(), 1);

    let first_frames = gateway.first_frames.lock().unwrap().clone();
    assert_eq!(first_frames.len(), 1, "exactly one handshake on the wire");
}

#[tokio::test]
async fn repeated_connect_reuses_live_session_and_its_protocol() {
    let gateway = MockGateway::spawn_with_protocol(HandshakePolicy::Accept, false, 7).await;
    let client = GatewayClient::new(test_config(&gateway.url));

    let first = client.connect().await.unwrap();
    assert_eq!(first.protocol, 7);
    assert!(matches!(
        client.current_status(),
        ConnectionStatus::Ready { protocol: 7, .. }
    ));

    // The second call short-circuits on the live session and must report
    // the negotiated protocol, not a compiled-in default.
    let second = client.connect().await.unwrap();
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.protocol, 7);
    assert_eq!(gateway.connection_count(), 1);
}

#[tokio::test]
async fn events_reach_subscribers() {
    let gateway = MockGateway::spawn(HandshakePolicy::Accept, false).await;
    let client = GatewayClient::new(test_config(&gateway.url));
    client.connect().await.unwrap();

    let mut chat = client.events("chat");
    client.request("events.start", None).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), chat.recv())
        .await
        .expect("no event arrived")
        .unwrap();
    assert_eq!(event.event, "chat");
    assert_eq!(event.payload.unwrap()["message"], "hi");
}

#[tokio::test]
async fn failed_plain_upgrade_falls_back_to_tls_and_surfaces_primary_error() {
    init_tracing();
    // Accept and immediately drop each connection so neither the WebSocket
    // upgrade nor a TLS handshake can complete.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let candidate = Candidate {
        url: format!("ws://{addr}"),
        mode: TransportMode::Standard,
        source: CandidateSource::Configured,
    };
    let timeouts = EstablishTimeouts {
        per_attempt: Duration::from_millis(500),
        overall: Duration::from_secs(2),
    };
    let err = establish(&candidate, timeouts).await.unwrap_err();

    assert_eq!(
        attempts.load(Ordering::SeqCst),
        2,
        "expected a plaintext attempt followed by a TLS attempt"
    );
    match err {
        TransportError::ConnectFailed { url, .. } | TransportError::ConnectTimeout { url, .. } => {
            assert!(
                url.starts_with("ws://"),
                "error should describe the configured plaintext URL, got {url}"
            );
        }
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test]
async fn connect_to_nothing_fails_with_transport_error() {
    // Bind-then-drop to get a port with no listener.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = test_config(&format!("ws://{addr}"));
    config.establish_timeouts.per_attempt = Duration::from_millis(500);
    let client = GatewayClient::new(config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
    assert!(err.is_retryable());
}
