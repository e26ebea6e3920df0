use std::sync::atomic::AtomicUsize;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::auth::MockAuthProvider;
use crate::ws::dial::MockDialer;
use crate::ws::testing::{fake_conn, FakeConnHandles};
use crate::ws::Frame;

// ============================================================================
// Harness
// ============================================================================

/// One client session wired to mock auth, mock contexts, and a mock dialer
/// that hands out channel-backed upstream connections.
struct Harness {
    mux: Arc<Multiplexer>,
    feed: Option<mpsc::UnboundedSender<Frame>>,
    out: mpsc::UnboundedReceiver<Frame>,
    upstreams: mpsc::UnboundedReceiver<FakeConnHandles>,
    dial_count: Arc<AtomicUsize>,
    dialed_tokens: Arc<StdMutex<Vec<Option<String>>>>,
    session: tokio::task::JoinHandle<()>,
    read_timeout: Duration,
}

fn default_contexts() -> crate::contexts::MockContextStore {
    let mut store = crate::contexts::MockContextStore::new();
    store.expect_rest_config().returning(|key| {
        if key.starts_with("bad") {
            Err(Error::UnknownCluster(key.to_string()))
        } else {
            Ok(RestConfig {
                host: format!("https://{key}.test:6443"),
                ..Default::default()
            })
        }
    });
    store
}

fn static_token(token: &str) -> MockAuthProvider {
    token_sequence(&[token])
}

/// Auth mock returning the given tokens in order, repeating the last one.
fn token_sequence(tokens: &[&str]) -> MockAuthProvider {
    let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    let calls = AtomicUsize::new(0);

    let mut auth = MockAuthProvider::new();
    auth.expect_bearer_token().returning(move |_| {
        let i = calls.fetch_add(1, Ordering::Relaxed).min(tokens.len() - 1);
        Ok(Zeroizing::new(tokens[i].clone()))
    });
    auth
}

fn start(config: MultiplexerConfig, auth: MockAuthProvider) -> Harness {
    start_with_contexts(config, auth, default_contexts())
}

fn start_with_contexts(
    config: MultiplexerConfig,
    auth: MockAuthProvider,
    contexts: crate::contexts::MockContextStore,
) -> Harness {
    let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
    let dial_count = Arc::new(AtomicUsize::new(0));
    let dialed_tokens: Arc<StdMutex<Vec<Option<String>>>> = Arc::new(StdMutex::new(Vec::new()));

    let mut dialer = MockDialer::new();
    {
        let dial_count = dial_count.clone();
        let dialed_tokens = dialed_tokens.clone();
        dialer
            .expect_dial()
            .returning(move |_config, path, _query, token| {
                if path == "/fail" {
                    return Err(Error::Dial("dial failure".into()));
                }

                dial_count.fetch_add(1, Ordering::Relaxed);
                dialed_tokens
                    .lock()
                    .unwrap()
                    .push(token.map(str::to_string));

                let (conn, handles) = fake_conn();
                upstream_tx.send(handles).unwrap();
                Ok(conn)
            });
    }

    let mux = Multiplexer::with_dialer(Arc::new(contexts), Arc::new(dialer), config);

    let (client_conn, client_handles) = fake_conn();
    let client = Arc::new(client_conn);
    let session = tokio::spawn(mux.clone().run_session(
        client,
        Arc::new(auth),
        "203.0.113.7".to_string(),
    ));

    Harness {
        mux,
        feed: Some(client_handles.incoming),
        out: client_handles.outgoing,
        upstreams: upstream_rx,
        dial_count,
        dialed_tokens,
        session,
        read_timeout: Duration::from_secs(5),
    }
}

impl Harness {
    fn send(&self, envelope: &Envelope) {
        let raw = serde_json::to_string(envelope).unwrap();
        self.feed
            .as_ref()
            .expect("client already disconnected")
            .send(Frame::Text(raw))
            .unwrap();
    }

    fn send_raw(&self, raw: &str) {
        self.feed
            .as_ref()
            .expect("client already disconnected")
            .send(Frame::Text(raw.into()))
            .unwrap();
    }

    /// Simulate the browser dropping the WebSocket.
    fn disconnect_client(&mut self) {
        self.feed = None;
    }

    async fn next_raw(&mut self) -> serde_json::Value {
        let frame = tokio::time::timeout(self.read_timeout, self.out.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client channel closed");

        match frame {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn next_out(&mut self) -> Envelope {
        serde_json::from_value(self.next_raw().await).unwrap()
    }

    async fn next_upstream(&mut self) -> FakeConnHandles {
        tokio::time::timeout(self.read_timeout, self.upstreams.recv())
            .await
            .expect("timed out waiting for upstream dial")
            .expect("dialer channel closed")
    }

    async fn await_session(self) {
        tokio::time::timeout(self.read_timeout, self.session)
            .await
            .expect("session did not terminate")
            .unwrap();
    }
}

fn request(cluster: &str, path: &str, user: &str, data: &str) -> Envelope {
    Envelope {
        cluster_id: cluster.into(),
        path: path.into(),
        query: "watch=true".into(),
        user_id: user.into(),
        data: data.into(),
        binary: false,
        frame_type: FrameType::Request,
    }
}

fn close_frame(cluster: &str, path: &str, user: &str) -> Envelope {
    Envelope {
        cluster_id: cluster.into(),
        path: path.into(),
        query: String::new(),
        user_id: user.into(),
        data: String::new(),
        binary: false,
        frame_type: FrameType::Close,
    }
}

fn status_state(envelope: &Envelope) -> String {
    let payload: serde_json::Value = serde_json::from_str(&envelope.data).unwrap();
    payload["state"].as_str().unwrap().to_string()
}

// ============================================================================
// Scenarios
// ============================================================================

// Story: a watch stream with resource-version change markers
#[tokio::test]
async fn story_watch_happy_path() {
    let mut h = start(MultiplexerConfig::default(), static_token("tok-1"));

    h.send(&request("c1", "/api/v1/pods", "u1", ""));

    let status = h.next_out().await;
    assert_eq!(status.frame_type, FrameType::Status);
    assert_eq!(status.cluster_id, "c1");
    assert_eq!(status_state(&status), "connected");

    let upstream = h.next_upstream().await;
    let event = r#"{"metadata":{"resourceVersion":"100"},"kind":"PodList"}"#;
    upstream.incoming.send(Frame::Text(event.into())).unwrap();

    let complete = h.next_out().await;
    assert_eq!(complete.frame_type, FrameType::Complete);
    assert_eq!(complete.cluster_id, "c1");

    let data = h.next_out().await;
    assert_eq!(data.frame_type, FrameType::Data);
    assert_eq!(data.data, event);
    assert!(!data.binary);

    // Second event with the same version: DATA only, no marker
    upstream.incoming.send(Frame::Text(event.into())).unwrap();
    let repeat = h.next_out().await;
    assert_eq!(repeat.frame_type, FrameType::Data);

    assert_eq!(h.dial_count.load(Ordering::Relaxed), 1);
}

// Story: upstream binary frames reach the client base64-encoded
#[tokio::test]
async fn story_binary_passthrough() {
    let mut h = start(MultiplexerConfig::default(), static_token("tok-1"));

    h.send(&request("c1", "/api/v1/pods/exec", "u1", ""));
    h.next_out().await; // connected

    let upstream = h.next_upstream().await;
    upstream
        .incoming
        .send(Frame::Binary(vec![0x01, 0x02, 0x03]))
        .unwrap();

    let data = h.next_out().await;
    assert_eq!(data.frame_type, FrameType::Data);
    assert!(data.binary);
    assert_eq!(data.data, "AQID");
}

// Story: REQUEST payloads are forwarded to the upstream as binary frames
#[tokio::test]
async fn story_request_payload_forwarding() {
    let mut h = start(MultiplexerConfig::default(), static_token("tok-1"));

    h.send(&request("c1", "/api/v1/pods/exec", "u1", ""));
    h.next_out().await; // connected
    let mut upstream = h.next_upstream().await;

    // The creating REQUEST forwards its (empty) payload
    assert_eq!(
        upstream.outgoing.recv().await.unwrap(),
        Frame::Binary(Vec::new())
    );

    h.send(&request("c1", "/api/v1/pods/exec", "u1", "stdin-bytes"));
    assert_eq!(
        upstream.outgoing.recv().await.unwrap(),
        Frame::Binary(b"stdin-bytes".to_vec())
    );

    // Same tuple reuses the connection
    assert_eq!(h.dial_count.load(Ordering::Relaxed), 1);
}

// Story: CLOSE tears down; a second CLOSE is a no-op; the tuple can be
// re-established afterwards
#[tokio::test]
async fn story_close_is_idempotent() {
    let mut h = start(MultiplexerConfig::default(), static_token("tok-1"));

    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    h.next_out().await; // connected
    let upstream = h.next_upstream().await;

    h.send(&close_frame("c1", "/api/v1/pods", "u1"));
    h.send(&close_frame("c1", "/api/v1/pods", "u1"));

    // A new REQUEST for the tuple dials again; the old socket is gone
    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    let status = h.next_out().await;
    assert_eq!(status_state(&status), "connected");

    assert!(upstream.closed.load(std::sync::atomic::Ordering::Acquire));
    assert_eq!(h.dial_count.load(Ordering::Relaxed), 2);
    assert_eq!(h.mux.connection_count().await, 1);
}

// Story: a fresh token on a later REQUEST replaces the cached one without
// reconnecting
#[tokio::test]
async fn story_token_refresh_updates_cache() {
    let mut h = start(MultiplexerConfig::default(), token_sequence(&["t1", "t2"]));

    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    h.next_out().await; // connected
    let mut upstream = h.next_upstream().await;
    upstream.outgoing.recv().await.unwrap(); // initial payload

    h.send(&request("c1", "/api/v1/pods", "u1", "x"));
    upstream.outgoing.recv().await.unwrap(); // second payload processed

    let conn = {
        let registry = h.mux.connections.read().await;
        registry.get("c1:/api/v1/pods:u1").cloned().unwrap()
    };
    assert_eq!(
        conn.cached_token().as_deref().map(String::as_str),
        Some("t2")
    );

    // Only the original dial happened, with the original token
    assert_eq!(h.dialed_tokens.lock().unwrap().clone(), vec![Some("t1".to_string())]);
}

// Story: a dead upstream is detected by the heartbeat and replaced; the
// reconnect dial carries the most recently supplied token
#[tokio::test(start_paused = true)]
async fn story_heartbeat_reconnect_with_latest_token() {
    let mut h = start(MultiplexerConfig::default(), token_sequence(&["t1", "t2"]));
    h.read_timeout = Duration::from_secs(600);

    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    h.next_out().await; // connected
    let mut upstream1 = h.next_upstream().await;
    upstream1.outgoing.recv().await.unwrap();

    // Refresh the token, then make the upstream unwritable
    h.send(&request("c1", "/api/v1/pods", "u1", "x"));
    upstream1.outgoing.recv().await.unwrap();
    upstream1
        .fail_writes
        .store(true, std::sync::atomic::Ordering::Release);

    // The next heartbeat ping fails and drives the reconnect
    let status_error = h.next_out().await;
    assert_eq!(status_error.frame_type, FrameType::Status);
    assert_eq!(status_state(&status_error), "error");

    let status_connected = h.next_out().await;
    assert_eq!(status_state(&status_connected), "connected");

    assert_eq!(h.dial_count.load(Ordering::Relaxed), 2);
    assert_eq!(
        h.dialed_tokens.lock().unwrap().clone(),
        vec![Some("t1".to_string()), Some("t2".to_string())]
    );
    assert!(upstream1.closed.load(std::sync::atomic::Ordering::Acquire));

    // Data flows through the replacement
    let upstream2 = h.next_upstream().await;
    upstream2
        .incoming
        .send(Frame::Text(r#"{"kind":"Status"}"#.into()))
        .unwrap();
    let data = h.next_out().await;
    assert_eq!(data.frame_type, FrameType::Data);
}

// Story: a closed tuple is not resurrected by its supervisor
#[tokio::test(start_paused = true)]
async fn story_supervisor_stops_after_close() {
    let mut h = start(MultiplexerConfig::default(), static_token("t"));
    h.read_timeout = Duration::from_secs(600);

    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    h.next_out().await; // connected
    let _upstream = h.next_upstream().await;

    h.send(&close_frame("c1", "/api/v1/pods", "u1"));

    // Ride past several heartbeat intervals; no reconnect may happen
    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(h.dial_count.load(Ordering::Relaxed), 1);
    assert_eq!(h.mux.connection_count().await, 0);
}

// Story: 200 back-to-back frames against a burst of 100 produce rate-limit
// errors with doubling backoff, and the tenth consecutive violation closes
// the session
#[tokio::test(start_paused = true)]
async fn story_rate_limit_cutoff() {
    let config = MultiplexerConfig {
        // No refill: the arithmetic is exact
        messages_per_second: 0.0,
        burst_size: 100.0,
        ip_messages_per_second: 0.0,
        ip_burst_size: 400.0,
        ..Default::default()
    };
    let mut h = start(config, static_token("t"));
    h.read_timeout = Duration::from_secs(600);

    let started = tokio::time::Instant::now();
    for _ in 0..200 {
        h.send(&close_frame("none", "/p", "u1"));
    }

    // The first 100 frames pass; then ten violations, each reported
    for i in 1..=10 {
        let error = h.next_raw().await;
        assert_eq!(error["type"], "error", "frame {i}");
        assert_eq!(error["error"], "rate_limit_exceeded", "frame {i}");
    }

    tokio::time::timeout(h.read_timeout, h.session)
        .await
        .expect("session should close after the violation cap")
        .unwrap();

    // Nine backoff sleeps: 100+200+400+800+1600+3200+5000+5000+5000 ms
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(21_300) && elapsed < Duration::from_millis(22_000),
        "unexpected total backoff: {elapsed:?}"
    );
}

// Story: a missing cluster cookie ends the whole session
#[tokio::test]
async fn story_missing_token_terminates_session() {
    let mut auth = MockAuthProvider::new();
    auth.expect_bearer_token()
        .returning(|_| Err(Error::Auth("no auth cookie for cluster c1".into())));

    let h = start(MultiplexerConfig::default(), auth);
    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    h.await_session().await;
}

// Story: an unknown cluster is reported per-request; the session survives
#[tokio::test]
async fn story_unknown_cluster_reports_error_and_continues() {
    let mut h = start(MultiplexerConfig::default(), static_token("t"));

    h.send(&request("bad", "/api/v1/pods", "u1", ""));
    let report = h.next_raw().await;
    assert_eq!(report["clusterId"], "bad");
    assert!(report["error"].as_str().unwrap().contains("cluster not found"));

    // Session still works
    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    let status = h.next_out().await;
    assert_eq!(status_state(&status), "connected");
}

// Story: a failed dial surfaces as STATUS error plus a connection error
// report
#[tokio::test]
async fn story_dial_failure_reports_status_and_error() {
    let mut h = start(MultiplexerConfig::default(), static_token("t"));

    h.send(&request("c1", "/fail", "u1", ""));

    let status = h.next_out().await;
    assert_eq!(status.frame_type, FrameType::Status);
    assert_eq!(status_state(&status), "error");

    let report = h.next_raw().await;
    assert_eq!(report["clusterId"], "c1");
    assert!(report["error"].as_str().unwrap().contains("dial failure"));

    assert_eq!(h.mux.connection_count().await, 0);
}

// Story: client disconnect closes every connection of the session
#[tokio::test]
async fn story_client_disconnect_tears_down_connections() {
    let mut h = start(MultiplexerConfig::default(), static_token("t"));

    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    h.next_out().await; // connected
    let upstream = h.next_upstream().await;

    h.disconnect_client();

    let session = std::mem::replace(&mut h.session, tokio::spawn(async {}));
    tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session should end on client disconnect")
        .unwrap();

    // Teardown announces the closed state, then nothing else
    let status = h.next_out().await;
    assert_eq!(status.frame_type, FrameType::Status);
    assert_eq!(status_state(&status), "closed");

    assert_eq!(h.mux.connection_count().await, 0);
    assert!(upstream.closed.load(std::sync::atomic::Ordering::Acquire));
}

// Story: malformed JSON ends the session with a best-effort error frame
#[tokio::test]
async fn story_malformed_envelope_terminates_session() {
    let mut h = start(MultiplexerConfig::default(), static_token("t"));

    h.send_raw("{this is not json");

    let error = h.next_raw().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"], "invalid_message");

    h.await_session().await;
}

// Story: an unrecognized frame type is an envelope-protocol error
#[tokio::test]
async fn story_unknown_frame_type_terminates_session() {
    let mut h = start(MultiplexerConfig::default(), static_token("t"));

    h.send_raw(r#"{"clusterId":"c1","type":"NONSENSE"}"#);

    let error = h.next_raw().await;
    assert_eq!(error["error"], "invalid_message");

    h.await_session().await;
}

// Story: a per-session dynamic cluster resolves through the combined
// clusterId + userId key
#[tokio::test]
async fn story_stateless_cluster_combined_key_fallback() {
    let mut contexts = crate::contexts::MockContextStore::new();
    contexts.expect_rest_config().returning(|key| {
        if key == "dyn1u1" {
            Ok(RestConfig {
                host: "https://dyn1.test:6443".into(),
                ..Default::default()
            })
        } else {
            Err(Error::UnknownCluster(key.to_string()))
        }
    });

    let mut h = start_with_contexts(MultiplexerConfig::default(), static_token("t"), contexts);

    h.send(&request("dyn1", "/api/v1/pods", "u1", ""));
    let status = h.next_out().await;
    assert_eq!(status_state(&status), "connected");
    assert_eq!(h.dial_count.load(Ordering::Relaxed), 1);
}

// Story: the real HTTP upgrade path enforces the origin rules
#[tokio::test]
async fn story_upgrade_requires_acceptable_origin() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mux = Multiplexer::new(
        Arc::new(crate::contexts::MemoryContextStore::new()),
        MultiplexerConfig::default(),
    );
    let app = axum::Router::new()
        .route("/wsMultiplexer", axum::routing::get(ws_handler))
        .with_state(mux);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // Missing Origin: the upgrade is refused outright
    let no_origin = tokio_tungstenite::connect_async(format!("ws://{addr}/wsMultiplexer")).await;
    assert!(no_origin.is_err());

    // Cross-origin: refused
    let mut request = format!("ws://{addr}/wsMultiplexer")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", "http://attacker.example".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    // Loopback-to-loopback: accepted
    let mut request = format!("ws://{addr}/wsMultiplexer")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", "http://127.0.0.2:3000".parse().unwrap());
    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("loopback origin should be accepted");
    drop(socket);
}

// Story: two tuples on one session get independent upstream connections
// but share the serialized client socket
#[tokio::test]
async fn story_two_tuples_two_upstreams() {
    let mut h = start(MultiplexerConfig::default(), static_token("t"));

    h.send(&request("c1", "/api/v1/pods", "u1", ""));
    h.next_out().await; // connected
    let upstream_pods = h.next_upstream().await;

    h.send(&request("c1", "/api/v1/nodes", "u1", ""));
    h.next_out().await; // connected
    let upstream_nodes = h.next_upstream().await;

    assert_eq!(h.dial_count.load(Ordering::Relaxed), 2);
    assert_eq!(h.mux.connection_count().await, 2);

    upstream_pods
        .incoming
        .send(Frame::Text(r#"{"kind":"Pod"}"#.into()))
        .unwrap();
    upstream_nodes
        .incoming
        .send(Frame::Text(r#"{"kind":"Node"}"#.into()))
        .unwrap();

    // Both frames arrive whole; cross-tuple order is unspecified
    let first = h.next_out().await;
    let second = h.next_out().await;
    let mut paths: Vec<String> = vec![first.path, second.path];
    paths.sort();
    assert_eq!(paths, vec!["/api/v1/nodes".to_string(), "/api/v1/pods".to_string()]);
}
