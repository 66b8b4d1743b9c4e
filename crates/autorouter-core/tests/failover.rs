use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use autorouter_common::{FailoverStrategy, Settings};
use autorouter_core::auth::AuthContext;
use autorouter_core::breaker::BreakerState;
use autorouter_core::crypto::CredentialCipher;
use autorouter_core::proxy_engine::{Finalizer, ProxyBody, ProxyEngine, ProxyRequest};
use autorouter_core::state::AppState;
use autorouter_core::upstream_client::{
    OutboundBody, OutboundRequest, OutboundResponse, SendError, StreamFault, TransportError,
    TransportErrorKind, UpstreamClient,
};
use autorouter_storage::{
    BillingSnapshotUpsert, BreakerPersist, ManualOverrideRow, RequestLogInsert, StorageSnapshot,
    Store, UpstreamRow,
};
use bytes::Bytes;
use http::Method;
use time::OffsetDateTime;
use tokio::sync::mpsc;

const KEY_MATERIAL: &str =
    "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

#[derive(Clone)]
enum Script {
    Status(u16, serde_json::Value),
    Transport,
    Ttft,
    Sse(Vec<String>),
    SseThenFault(Vec<String>, StreamFault),
}

struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(scripts: Vec<(&str, Vec<Script>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(host, list)| (host.to_string(), list.into_iter().collect()))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, SendError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .iter_mut()
                .find(|(host, _)| req.url.starts_with(host.as_str()))
                .and_then(|(_, queue)| queue.pop_front())
        };
        Box::pin(async move {
            match script {
                Some(Script::Status(status, body)) => Ok(OutboundResponse {
                    status,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: OutboundBody::Bytes(Bytes::from(serde_json::to_vec(&body).unwrap())),
                }),
                Some(Script::Transport) => Err(SendError::Transport(TransportError {
                    kind: TransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                })),
                Some(Script::Ttft) => Err(SendError::TtftTimeout),
                Some(Script::Sse(chunks)) => {
                    let (tx, rx) = mpsc::channel(chunks.len().max(1) + 1);
                    for chunk in chunks {
                        tx.try_send(Ok(Bytes::from(chunk))).unwrap();
                    }
                    drop(tx);
                    Ok(OutboundResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: OutboundBody::Stream(rx),
                    })
                }
                Some(Script::SseThenFault(chunks, fault)) => {
                    let (tx, rx) = mpsc::channel(chunks.len().max(1) + 2);
                    for chunk in chunks {
                        tx.try_send(Ok(Bytes::from(chunk))).unwrap();
                    }
                    tx.try_send(Err(fault)).unwrap();
                    drop(tx);
                    Ok(OutboundResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: OutboundBody::Stream(rx),
                    })
                }
                None => Err(SendError::Transport(TransportError {
                    kind: TransportErrorKind::Other,
                    message: "no script for url".to_string(),
                })),
            }
        })
    }
}

struct Harness {
    engine: ProxyEngine,
    state: Arc<AppState>,
    client: Arc<ScriptedClient>,
    log_rx: mpsc::Receiver<RequestLogInsert>,
    snapshot_rx: mpsc::Receiver<BillingSnapshotUpsert>,
    _breaker_rx: mpsc::Receiver<BreakerPersist>,
}

fn upstream_row(cipher: &CredentialCipher, id: i64, priority: i32) -> UpstreamRow {
    UpstreamRow {
        id,
        name: format!("upstream-{id}"),
        base_url: format!("https://u{id}.test"),
        sealed_credential: cipher.seal("sk-upstream").unwrap(),
        is_active: true,
        provider_type: "openai".to_string(),
        priority,
        weight: 1,
        timeout_secs: 30,
        capabilities_json: serde_json::json!(["openai_chat_compatible"]),
        allowed_models_json: None,
        model_redirects_json: serde_json::json!({}),
        affinity_json: None,
        exclude_status_codes_json: serde_json::json!([]),
        billing_input_multiplier: 1.0,
        billing_output_multiplier: 1.0,
        spending_limit: None,
        spending_period_type: None,
        spending_period_hours: None,
        circuit_json: serde_json::json!({}),
        updated_at: OffsetDateTime::UNIX_EPOCH,
    }
}

async fn harness(
    mutate_rows: impl FnOnce(&mut Vec<UpstreamRow>),
    scripts: Vec<(&str, Vec<Script>)>,
) -> Harness {
    let settings = Settings {
        host: "127.0.0.1".to_string(),
        port: 0,
        dsn: "sqlite::memory:".to_string(),
        admin_token: "admin".to_string(),
        encryption_key: KEY_MATERIAL.to_string(),
        allow_key_reveal: false,
        failover: FailoverStrategy::ExhaustAll,
        affinity_retention_secs: 1800,
    };
    let cipher = CredentialCipher::from_key_material(KEY_MATERIAL).unwrap();

    let mut rows = vec![upstream_row(&cipher, 1, 0), upstream_row(&cipher, 2, 1)];
    mutate_rows(&mut rows);

    let snapshot = StorageSnapshot {
        upstreams: rows,
        manual_overrides: vec![ManualOverrideRow {
            model: "gpt-4.1".to_string(),
            input_price_per_million: 2.0,
            output_price_per_million: 8.0,
            cache_read_price_per_million: None,
            cache_write_price_per_million: None,
        }],
        ..Default::default()
    };

    let store = Store::connect("sqlite::memory:").await.unwrap();
    store.sync().await.unwrap();

    let state = Arc::new(AppState::from_snapshot(settings, &snapshot, store).unwrap());
    let (log_tx, log_rx) = mpsc::channel(64);
    let (snapshot_tx, snapshot_rx) = mpsc::channel(64);
    let (breaker_tx, breaker_rx) = mpsc::channel(64);
    let finalizer = Finalizer::new(state.clone(), log_tx, snapshot_tx, breaker_tx);
    let client = ScriptedClient::new(scripts);
    let engine = ProxyEngine::new(state.clone(), client.clone(), finalizer);

    Harness {
        engine,
        state,
        client,
        log_rx,
        snapshot_rx,
        _breaker_rx: breaker_rx,
    }
}

fn request(body: serde_json::Value) -> ProxyRequest {
    let mut headers = http::HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    ProxyRequest {
        request_id: autorouter_common::new_request_id(),
        auth: AuthContext {
            api_key_id: 1,
            key_name: "test-key".to_string(),
            upstream_ids: Arc::new(vec![1, 2]),
        },
        method: Method::POST,
        path: "/v1/chat/completions".to_string(),
        query: None,
        headers,
        body: Bytes::from(serde_json::to_vec(&body).unwrap()),
    }
}

fn chat_body() -> serde_json::Value {
    serde_json::json!({ "model": "gpt-4.1" })
}

#[tokio::test]
async fn happy_path_proxies_and_bills() {
    let upstream_body = serde_json::json!({
        "choices": [{ "message": { "content": "hi" } }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 42 },
    });
    let mut h = harness(
        |rows| rows.truncate(1),
        vec![("https://u1.test", vec![Script::Status(200, upstream_body.clone())])],
    )
    .await;

    let response = h.engine.handle(request(chat_body())).await;
    assert_eq!(response.status.as_u16(), 200);
    let ProxyBody::Bytes(bytes) = response.body else {
        panic!("expected a buffered body");
    };
    let echoed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(echoed, upstream_body);

    let log = h.log_rx.try_recv().unwrap();
    assert_eq!(log.failover_attempts, 1);
    assert_eq!(log.status_code, Some(200));
    assert_eq!(log.routing_type, "weighted");
    assert_eq!(log.prompt_tokens, 10);
    assert_eq!(log.completion_tokens, 42);
    assert!(log.ttft_ms.is_some());

    let snapshot = h.snapshot_rx.try_recv().unwrap();
    assert_eq!(snapshot.billing_status, "billed");
    assert_eq!(snapshot.price_source.as_deref(), Some("manual"));
    assert!(snapshot.final_cost > 0.0);
    assert_eq!(snapshot.request_log_id, log.id);
}

#[tokio::test]
async fn single_failover_moves_to_the_next_candidate() {
    let ok_body = serde_json::json!({
        "usage": { "prompt_tokens": 1, "completion_tokens": 2 },
    });
    let mut h = harness(
        |_| {},
        vec![
            (
                "https://u1.test",
                vec![Script::Status(502, serde_json::json!({ "error": "bad gateway" }))],
            ),
            ("https://u2.test", vec![Script::Status(200, ok_body)]),
        ],
    )
    .await;

    let response = h.engine.handle(request(chat_body())).await;
    assert_eq!(response.status.as_u16(), 200);

    let log = h.log_rx.try_recv().unwrap();
    assert_eq!(log.failover_attempts, 2);
    assert_eq!(log.upstream_id, Some(2));
    assert_eq!(log.routing_type, "failover");
    let history = log.failover_history.as_array().unwrap();
    assert_eq!(history[0]["error_type"], "http_5xx");
    assert_eq!(history[0]["status_code"], 502);
    assert_eq!(history[1]["status_code"], 200);

    // One terminal failure recorded on upstream 1's breaker.
    let breaker = h.state.upstream(1).unwrap().breaker.snapshot();
    assert_eq!(breaker.failure_count, 1);
    assert_eq!(breaker.state, BreakerState::Closed);
}

#[tokio::test]
async fn fifth_consecutive_5xx_opens_the_circuit() {
    let failures = vec![
        Script::Status(502, serde_json::json!({})),
        Script::Status(503, serde_json::json!({})),
        Script::Status(500, serde_json::json!({})),
        Script::Status(502, serde_json::json!({})),
        Script::Status(502, serde_json::json!({})),
    ];
    let h = harness(|rows| rows.truncate(1), vec![("https://u1.test", failures)]).await;

    for _ in 0..5 {
        let response = h.engine.handle(request(chat_body())).await;
        // Sole candidate exhausted each time.
        assert_eq!(response.status.as_u16(), 503);
    }
    assert_eq!(
        h.state.upstream(1).unwrap().breaker.snapshot().state,
        BreakerState::Open
    );
    let calls_after_five = h.client.calls();
    assert_eq!(calls_after_five, 5);

    // Sixth request short-circuits without an outbound call.
    let response = h.engine.handle(request(chat_body())).await;
    assert_eq!(response.status.as_u16(), 503);
    let ProxyBody::Bytes(bytes) = response.body else {
        panic!("expected a buffered body");
    };
    let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope["error"]["code"], "ALL_UPSTREAMS_UNAVAILABLE");
    assert_eq!(envelope["error"]["reason"], "NO_HEALTHY_CANDIDATES");
    assert_eq!(envelope["did_send_upstream"], false);
    assert_eq!(h.client.calls(), calls_after_five);
}

#[tokio::test]
async fn quota_exceeded_upstream_is_bypassed() {
    let ok_body = serde_json::json!({
        "usage": { "prompt_tokens": 3, "completion_tokens": 4 },
    });
    let mut h = harness(
        |rows| {
            rows[0].spending_limit = Some(1.0);
            rows[0].spending_period_type = Some("daily".to_string());
        },
        vec![("https://u2.test", vec![Script::Status(200, ok_body)])],
    )
    .await;
    // Upstream 1 is already at its daily limit.
    h.state.quota.record(1, 1.0, OffsetDateTime::now_utc());

    let response = h.engine.handle(request(chat_body())).await;
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(h.client.calls(), 1);

    let log = h.log_rx.try_recv().unwrap();
    assert_eq!(log.upstream_id, Some(2));
    assert_eq!(log.failover_attempts, 1);
}

#[tokio::test]
async fn transport_errors_exhaust_into_service_unavailable() {
    let h = harness(
        |_| {},
        vec![
            ("https://u1.test", vec![Script::Transport]),
            ("https://u2.test", vec![Script::Transport]),
        ],
    )
    .await;

    let response = h.engine.handle(request(chat_body())).await;
    assert_eq!(response.status.as_u16(), 503);
    let ProxyBody::Bytes(bytes) = response.body else {
        panic!("expected a buffered body");
    };
    let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope["error"]["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(envelope["did_send_upstream"], true);
}

#[tokio::test]
async fn ttft_timeouts_exhaust_into_request_timeout() {
    let h = harness(
        |rows| rows.truncate(1),
        vec![("https://u1.test", vec![Script::Ttft])],
    )
    .await;

    let response = h.engine.handle(request(chat_body())).await;
    assert_eq!(response.status.as_u16(), 504);
    let ProxyBody::Bytes(bytes) = response.body else {
        panic!("expected a buffered body");
    };
    let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope["error"]["code"], "REQUEST_TIMEOUT");
    assert_eq!(envelope["error"]["type"], "timeout");
}

#[tokio::test]
async fn non_retryable_4xx_is_forwarded_as_is() {
    let error_body = serde_json::json!({ "error": { "message": "bad request" } });
    let mut h = harness(
        |_| {},
        vec![("https://u1.test", vec![Script::Status(400, error_body.clone())])],
    )
    .await;

    let response = h.engine.handle(request(chat_body())).await;
    assert_eq!(response.status.as_u16(), 400);
    let ProxyBody::Bytes(bytes) = response.body else {
        panic!("expected a buffered body");
    };
    let echoed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(echoed, error_body);
    // No retry happened.
    assert_eq!(h.client.calls(), 1);

    // Terminal 4xx still produces a snapshot (unbilled: no usage).
    let snapshot = h.snapshot_rx.try_recv().unwrap();
    assert_eq!(snapshot.billing_status, "unbilled");
    assert_eq!(snapshot.unbillable_reason.as_deref(), Some("usage_missing"));
    let _ = h.log_rx.try_recv().unwrap();
}

#[tokio::test]
async fn excluded_status_codes_do_not_fail_over() {
    let body = serde_json::json!({ "error": "overloaded" });
    let mut h = harness(
        |rows| {
            rows[0].exclude_status_codes_json = serde_json::json!([503]);
        },
        vec![("https://u1.test", vec![Script::Status(503, body)])],
    )
    .await;

    let response = h.engine.handle(request(chat_body())).await;
    // Forwarded as-is instead of retrying on upstream 2.
    assert_eq!(response.status.as_u16(), 503);
    assert_eq!(h.client.calls(), 1);
    let log = h.log_rx.try_recv().unwrap();
    assert_eq!(log.failover_attempts, 1);
    assert_eq!(log.upstream_id, Some(1));
}

#[tokio::test]
async fn streaming_tees_chunks_and_extracts_tail_usage() {
    let chunks = vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n".to_string(),
        "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n".to_string(),
        "data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":42}}\n\n".to_string(),
        "data: [DONE]\n\n".to_string(),
    ];
    let mut h = harness(
        |rows| rows.truncate(1),
        vec![("https://u1.test", vec![Script::Sse(chunks.clone())])],
    )
    .await;

    let body = serde_json::json!({ "model": "gpt-4.1", "stream": true });
    let response = h.engine.handle(request(body)).await;
    assert_eq!(response.status.as_u16(), 200);
    let ProxyBody::Stream(mut rx) = response.body else {
        panic!("expected a stream body");
    };

    let mut received = String::new();
    while let Some(chunk) = rx.recv().await {
        received.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    assert_eq!(received, chunks.concat());

    // Tee finalizes after EOF.
    let log = tokio::time::timeout(std::time::Duration::from_secs(1), h.log_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(log.is_stream);
    assert_eq!(log.prompt_tokens, 10);
    assert_eq!(log.completion_tokens, 42);
    assert!(log.ttft_ms.is_some());

    let snapshot = tokio::time::timeout(std::time::Duration::from_secs(1), h.snapshot_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.billing_status, "billed");
    assert_eq!(snapshot.prompt_tokens, 10);
}

#[tokio::test]
async fn interrupted_stream_appends_an_sse_error_frame() {
    let chunks = vec!["data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n".to_string()];
    let mut h = harness(
        |rows| rows.truncate(1),
        vec![(
            "https://u1.test",
            vec![Script::SseThenFault(chunks.clone(), StreamFault::IdleTimeout)],
        )],
    )
    .await;

    let body = serde_json::json!({ "model": "gpt-4.1", "stream": true });
    let response = h.engine.handle(request(body)).await;
    let ProxyBody::Stream(mut rx) = response.body else {
        panic!("expected a stream body");
    };

    let mut received = String::new();
    while let Some(chunk) = rx.recv().await {
        received.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    assert!(received.starts_with(chunks[0].as_str()));
    let tail = &received[chunks[0].len()..];
    assert!(tail.starts_with("event: error\ndata: "));
    assert!(tail.contains("STREAM_ERROR"));

    let log = tokio::time::timeout(std::time::Duration::from_secs(1), h.log_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.error_code.as_deref(), Some("STREAM_ERROR"));

    // A stream fault counts as a terminal failure on the breaker.
    assert_eq!(
        h.state.upstream(1).unwrap().breaker.snapshot().failure_count,
        1
    );
}

#[tokio::test]
async fn model_redirect_rewrites_the_outbound_body() {
    struct CaptureClient {
        seen: Mutex<Option<Bytes>>,
    }
    impl UpstreamClient for CaptureClient {
        fn send<'a>(
            &'a self,
            req: OutboundRequest,
        ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, SendError>> + Send + 'a>>
        {
            *self.seen.lock().unwrap() = req.body.clone();
            Box::pin(async move {
                Ok(OutboundResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: OutboundBody::Bytes(Bytes::from_static(b"{}")),
                })
            })
        }
    }

    let settings = Settings {
        host: "127.0.0.1".to_string(),
        port: 0,
        dsn: "sqlite::memory:".to_string(),
        admin_token: "admin".to_string(),
        encryption_key: KEY_MATERIAL.to_string(),
        allow_key_reveal: false,
        failover: FailoverStrategy::ExhaustAll,
        affinity_retention_secs: 1800,
    };
    let cipher = CredentialCipher::from_key_material(KEY_MATERIAL).unwrap();
    let mut row = upstream_row(&cipher, 1, 0);
    row.model_redirects_json = serde_json::json!({ "gpt-4.1": "gpt-4.1-mini" });

    let store = Store::connect("sqlite::memory:").await.unwrap();
    store.sync().await.unwrap();
    let snapshot = StorageSnapshot {
        upstreams: vec![row],
        ..Default::default()
    };
    let state = Arc::new(AppState::from_snapshot(settings, &snapshot, store).unwrap());
    let (log_tx, _log_rx) = mpsc::channel(8);
    let (snapshot_tx, _snapshot_rx) = mpsc::channel(8);
    let (breaker_tx, _breaker_rx) = mpsc::channel(8);
    let client = Arc::new(CaptureClient {
        seen: Mutex::new(None),
    });
    let engine = ProxyEngine::new(
        state.clone(),
        client.clone(),
        Finalizer::new(state, log_tx, snapshot_tx, breaker_tx),
    );

    let _ = engine.handle(request(chat_body())).await;
    let seen = client.seen.lock().unwrap().clone().unwrap();
    let forwarded: serde_json::Value = serde_json::from_slice(&seen).unwrap();
    assert_eq!(forwarded["model"], "gpt-4.1-mini");
}
