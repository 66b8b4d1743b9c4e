pub mod finalize;
mod headers;
mod stream;
pub mod types;

use std::sync::Arc;

use autorouter_protocol::{RouteCapability, classify_request, extract_usage};
use bytes::Bytes;
use http::StatusCode;
use rand::SeedableRng;
use rand::rngs::StdRng;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::UpstreamConfig;
use crate::error::{ErrorCode, ErrorEnvelope};
use crate::selector::{CandidateSelector, SelectionEmpty};
use crate::state::AppState;
use crate::upstream_client::{OutboundBody, OutboundRequest, SendError, UpstreamClient};

pub use finalize::Finalizer;
pub use types::{AttemptErrorType, AttemptRecord, ProxyBody, ProxyRequest, ProxyResponse};

use types::{LogDraft, RoutingType};

const SESSION_HEADER: &str = "x-session-id";

pub struct ProxyEngine {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
    finalizer: Finalizer,
}

/// Writes the request log if the handler future is dropped before a
/// terminal outcome, which only happens when the client disconnects.
struct CancelGuard {
    finalizer: Finalizer,
    draft: LogDraft,
    armed: bool,
}

impl CancelGuard {
    fn disarm(&mut self) -> LogDraft {
        self.armed = false;
        self.draft.clone()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut draft = self.draft.clone();
        draft.error_code = Some(ErrorCode::ClientDisconnected.as_str());
        self.finalizer.complete(draft, OffsetDateTime::now_utc());
    }
}

/// What one forward attempt produced, before failover policy is applied.
enum AttemptOutcome {
    Failoverable(AttemptErrorType, Option<u16>, String),
    Terminal(TerminalResponse),
}

struct TerminalResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: OutboundBody,
    ttft_ms: i64,
}

impl ProxyEngine {
    pub fn new(state: Arc<AppState>, client: Arc<dyn UpstreamClient>, finalizer: Finalizer) -> Self {
        Self {
            state,
            client,
            finalizer,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        let started_at = OffsetDateTime::now_utc();
        let mut guard = CancelGuard {
            finalizer: self.finalizer.clone(),
            draft: LogDraft::new(&request, started_at),
            armed: true,
        };

        let body_json = if request.body.is_empty() {
            None
        } else {
            serde_json::from_slice::<serde_json::Value>(&request.body).ok()
        };

        let Some(classified) = classify_request(&request.path, body_json.as_ref()) else {
            guard.draft.error_code = Some("NOT_FOUND");
            let draft = guard.disarm();
            self.finalizer.complete(draft, OffsetDateTime::now_utc());
            return ProxyResponse::not_found("no route family matches this request");
        };

        let capability = classified.capability;
        guard.draft.capability = Some(capability);
        guard.draft.model = classified.model.clone();
        guard.draft.is_stream = classified.is_stream;

        // Compensation is a pure function of the snapshot and the request,
        // so one evaluation serves every attempt.
        let rules = self.state.compensation.current().await;
        let compensated =
            crate::compensation::apply_rules(&rules, capability, &request.headers, body_json.as_ref());
        let session_key = compensated
            .iter()
            .find(|entry| entry.name == SESSION_HEADER)
            .map(|entry| entry.value.clone())
            .or_else(|| {
                request
                    .headers
                    .get(SESSION_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.to_string())
            });
        guard.draft.session_key = session_key.clone();

        let upstreams = self.state.upstreams.load_full();
        let mut selector = CandidateSelector::build(
            &request.auth,
            capability,
            classified.model.as_deref(),
            &upstreams,
            &self.state.quota,
            &self.state.affinity,
            session_key.as_deref(),
            started_at,
        );
        guard.draft.affinity_applied = selector.affinity_applied;
        guard.draft.affinity_migrated = selector.affinity_migrated;
        for skip in &selector.skips {
            info!(
                request_id = %request.request_id,
                upstream_id = skip.upstream_id,
                reason = skip.reason.as_str(),
                "candidate skipped"
            );
        }

        if let Some(empty) = selector.empty_verdict() {
            let envelope = match empty {
                SelectionEmpty::NoUpstreamsConfigured => ErrorEnvelope::new(
                    ErrorCode::NoUpstreamsConfigured,
                    "no upstreams are configured",
                    request.request_id.clone(),
                ),
                SelectionEmpty::NoAuthorizedUpstreams => ErrorEnvelope::new(
                    ErrorCode::NoAuthorizedUpstreams,
                    "this api key has no upstream authorized for the requested route",
                    request.request_id.clone(),
                )
                .with_hint("ask your administrator to bind an upstream to this key"),
                SelectionEmpty::NoHealthyCandidates => ErrorEnvelope::new(
                    ErrorCode::AllUpstreamsUnavailable,
                    "no upstream could accept the request",
                    request.request_id.clone(),
                )
                .with_reason("NO_HEALTHY_CANDIDATES"),
            };
            guard.draft.error_code = Some(envelope.code.as_str());
            let draft = guard.disarm();
            self.finalizer.complete(draft, OffsetDateTime::now_utc());
            return ProxyResponse::from_envelope(&envelope);
        }

        let attempt_cap = self.state.settings.failover.attempt_cap();
        let mut rng = StdRng::from_os_rng();
        let mut did_send_upstream = false;
        let mut last_error: Option<AttemptErrorType> = None;
        let affinity_upstream = selector.affinity_upstream_id();

        while let Some(candidate) = selector.next(&mut rng) {
            if let Some(cap) = attempt_cap
                && guard.draft.attempts.len() as u32 >= cap
            {
                break;
            }

            let attempt_at = OffsetDateTime::now_utc();
            let config = &candidate.config;

            let (breaker_guard, acquired_persist) = match candidate.breaker.try_acquire(attempt_at) {
                Ok(pair) => pair,
                Err(_) => {
                    // Opened (or probe taken) between selection and gate.
                    guard.draft.record_attempt(AttemptRecord {
                        upstream_id: config.id,
                        upstream_name: config.name.clone(),
                        attempted_at: attempt_at,
                        error_type: Some(AttemptErrorType::CircuitOpen),
                        error_message: Some("circuit breaker gate refused the attempt".to_string()),
                        status_code: None,
                    });
                    last_error = Some(AttemptErrorType::CircuitOpen);
                    continue;
                }
            };
            if let Some(persist) = acquired_persist {
                self.finalizer.persist_breaker(persist);
            }

            let credential = match self.state.cipher.open(&config.sealed_credential) {
                Ok(credential) => credential,
                Err(err) => {
                    warn!(upstream_id = config.id, error = %err, "credential unsealing failed");
                    guard.draft.record_attempt(AttemptRecord {
                        upstream_id: config.id,
                        upstream_name: config.name.clone(),
                        attempted_at: attempt_at,
                        error_type: Some(AttemptErrorType::ConnectionError),
                        error_message: Some("upstream credential could not be decrypted".to_string()),
                        status_code: None,
                    });
                    last_error = Some(AttemptErrorType::ConnectionError);
                    continue;
                }
            };

            let plan = headers::assemble(&request.headers, config.family, &credential, &compensated);
            guard.draft.header_diff = plan.diff.clone();

            let outbound_body = rewrite_model(&request.body, body_json.as_ref(), config);
            let url = match &request.query {
                Some(query) => format!("{}{}?{}", config.base_url, request.path, query),
                None => format!("{}{}", config.base_url, request.path),
            };

            info!(
                request_id = %request.request_id,
                upstream_id = config.id,
                attempt = guard.draft.attempts.len() + 1,
                probe = breaker_guard.is_probe(),
                "attempt started"
            );

            did_send_upstream = true;
            let started_instant = tokio::time::Instant::now();
            let outcome = self
                .attempt(
                    &request,
                    config,
                    plan.outbound,
                    outbound_body,
                    url,
                    classified.is_stream,
                    started_instant,
                )
                .await;

            match outcome {
                AttemptOutcome::Failoverable(error_type, status, message) => {
                    let resolved_at = OffsetDateTime::now_utc();
                    if let Some(persist) = breaker_guard.on_failure(resolved_at) {
                        self.finalizer.persist_breaker(persist);
                    }
                    guard.draft.record_attempt(AttemptRecord {
                        upstream_id: config.id,
                        upstream_name: config.name.clone(),
                        attempted_at: attempt_at,
                        error_type: Some(error_type),
                        error_message: Some(message),
                        status_code: status,
                    });
                    last_error = Some(error_type);
                    continue;
                }
                AttemptOutcome::Terminal(terminal) => {
                    guard.draft.record_attempt(AttemptRecord {
                        upstream_id: config.id,
                        upstream_name: config.name.clone(),
                        attempted_at: attempt_at,
                        error_type: None,
                        error_message: None,
                        status_code: Some(terminal.status),
                    });
                    guard.draft.upstream_id = Some(config.id);
                    guard.draft.status_code = Some(terminal.status);
                    guard.draft.priority_tier = Some(config.priority);
                    guard.draft.routing_type = if affinity_upstream == Some(config.id) {
                        RoutingType::Affinity
                    } else if guard.draft.attempts.len() == 1 {
                        RoutingType::Weighted
                    } else {
                        RoutingType::Failover
                    };

                    return self
                        .respond_terminal(&request, capability, guard, breaker_guard, terminal)
                        .await;
                }
            }
        }

        // Candidate stream exhausted (or attempt cap reached).
        let envelope = exhaustion_envelope(&request.request_id, last_error, did_send_upstream);
        guard.draft.error_code = Some(envelope.code.as_str());
        let draft = guard.disarm();
        self.finalizer.complete(draft, OffsetDateTime::now_utc());
        ProxyResponse::from_envelope(&envelope)
    }

    /// One forward: send, classify the outcome against the failover
    /// predicate, never retry here.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        request: &ProxyRequest,
        config: &UpstreamConfig,
        outbound_headers: Vec<(String, String)>,
        body: Bytes,
        url: String,
        want_stream: bool,
        started_instant: tokio::time::Instant,
    ) -> AttemptOutcome {
        let outbound = OutboundRequest {
            method: request.method.clone(),
            url,
            headers: outbound_headers,
            body: (!body.is_empty()).then_some(body),
            want_stream,
            timeout: config.timeout,
        };

        let response = match self.client.send(outbound).await {
            Ok(response) => response,
            Err(SendError::TtftTimeout) => {
                return AttemptOutcome::Failoverable(
                    AttemptErrorType::Timeout,
                    None,
                    "no first byte before the upstream deadline".to_string(),
                );
            }
            Err(SendError::Transport(err)) => {
                return AttemptOutcome::Failoverable(
                    AttemptErrorType::ConnectionError,
                    None,
                    err.message,
                );
            }
        };

        let ttft_ms = started_instant.elapsed().as_millis() as i64;
        match classify_status(config, response.status) {
            Some(error_type) => {
                let message = match &response.body {
                    OutboundBody::Bytes(bytes) => {
                        String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_string()
                    }
                    OutboundBody::Stream(_) => String::new(),
                };
                AttemptOutcome::Failoverable(error_type, Some(response.status), message)
            }
            None => AttemptOutcome::Terminal(TerminalResponse {
                status: response.status,
                headers: response.headers,
                body: response.body,
                ttft_ms,
            }),
        }
    }

    /// Terminal outcome: resolve the breaker, finalize bookkeeping and shape
    /// the client response (buffered or tee'd stream).
    async fn respond_terminal(
        &self,
        request: &ProxyRequest,
        capability: RouteCapability,
        mut guard: CancelGuard,
        breaker_guard: crate::breaker::BreakerGuard,
        terminal: TerminalResponse,
    ) -> ProxyResponse {
        let status =
            StatusCode::from_u16(terminal.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match terminal.body {
            OutboundBody::Bytes(bytes) => {
                guard.draft.ttft_ms = Some(terminal.ttft_ms);
                guard.draft.response_bytes = bytes.len() as i64;
                guard.draft.usage = extract_usage(capability, &bytes);

                let resolved_at = OffsetDateTime::now_utc();
                if let Some(persist) = breaker_guard.on_success(resolved_at) {
                    self.finalizer.persist_breaker(persist);
                }
                let draft = guard.disarm();
                self.finalizer.complete(draft, resolved_at);

                info!(
                    request_id = %request.request_id,
                    status = terminal.status,
                    is_stream = false,
                    "request completed"
                );
                ProxyResponse {
                    status,
                    headers: terminal.headers,
                    body: ProxyBody::Bytes(bytes),
                }
            }
            OutboundBody::Stream(upstream_rx) => {
                let (client_tx, client_rx) = mpsc::channel::<Bytes>(32);
                guard.draft.ttft_ms = Some(terminal.ttft_ms);
                let draft = guard.disarm();
                let tee = stream::StreamTee {
                    upstream_rx,
                    client_tx,
                    capability,
                    draft,
                    breaker: breaker_guard,
                    finalizer: self.finalizer.clone(),
                };
                tokio::spawn(stream::run(tee));

                info!(
                    request_id = %request.request_id,
                    status = terminal.status,
                    is_stream = true,
                    "request streaming"
                );
                ProxyResponse {
                    status,
                    headers: terminal.headers,
                    body: ProxyBody::Stream(client_rx),
                }
            }
        }
    }
}

/// Failover predicate on a received status: 5xx/429/408 retry unless the
/// upstream excluded the code; everything else is terminal.
fn classify_status(config: &UpstreamConfig, status: u16) -> Option<AttemptErrorType> {
    if config.excludes_status(status) {
        return None;
    }
    match status {
        429 => Some(AttemptErrorType::Http429),
        408 => Some(AttemptErrorType::Timeout),
        500..=599 => Some(AttemptErrorType::Http5xx),
        _ => None,
    }
}

fn exhaustion_envelope(
    request_id: &str,
    last_error: Option<AttemptErrorType>,
    did_send_upstream: bool,
) -> ErrorEnvelope {
    let envelope = match last_error {
        Some(AttemptErrorType::Timeout) => ErrorEnvelope::new(
            ErrorCode::RequestTimeout,
            "every candidate upstream timed out",
            request_id,
        ),
        Some(AttemptErrorType::ConnectionError) => ErrorEnvelope::new(
            ErrorCode::ServiceUnavailable,
            "no upstream connection could be established",
            request_id,
        ),
        Some(AttemptErrorType::CircuitOpen) => ErrorEnvelope::new(
            ErrorCode::AllUpstreamsUnavailable,
            "no upstream could accept the request",
            request_id,
        )
        .with_reason("NO_HEALTHY_CANDIDATES"),
        _ => ErrorEnvelope::new(
            ErrorCode::AllUpstreamsUnavailable,
            "every candidate upstream failed",
            request_id,
        ),
    };
    envelope.sent_upstream(did_send_upstream)
}

/// Applies the upstream's model redirect to a JSON body carrying `model`.
fn rewrite_model(
    body: &Bytes,
    body_json: Option<&serde_json::Value>,
    config: &UpstreamConfig,
) -> Bytes {
    let Some(json) = body_json else {
        return body.clone();
    };
    let Some(model) = json.get("model").and_then(|value| value.as_str()) else {
        return body.clone();
    };
    let redirected = config.redirect_model(model);
    if redirected == model {
        return body.clone();
    }
    let mut rewritten = json.clone();
    if let Some(object) = rewritten.as_object_mut() {
        object.insert(
            "model".to_string(),
            serde_json::Value::String(redirected.to_string()),
        );
    }
    match serde_json::to_vec(&rewritten) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_excludes(excludes: Vec<u16>) -> UpstreamConfig {
        let mut row = crate::config::tests_support::upstream_row_for_tests();
        row.exclude_status_codes_json = serde_json::json!(excludes);
        UpstreamConfig::from_row(&row).unwrap()
    }

    #[test]
    fn failover_predicate_retries_5xx_429_and_408() {
        let config = config_with_excludes(vec![]);
        assert_eq!(classify_status(&config, 502), Some(AttemptErrorType::Http5xx));
        assert_eq!(classify_status(&config, 429), Some(AttemptErrorType::Http429));
        assert_eq!(classify_status(&config, 408), Some(AttemptErrorType::Timeout));
        assert_eq!(classify_status(&config, 200), None);
        assert_eq!(classify_status(&config, 301), None);
        assert_eq!(classify_status(&config, 404), None);
    }

    #[test]
    fn excluded_status_codes_are_terminal() {
        let config = config_with_excludes(vec![503, 429]);
        assert_eq!(classify_status(&config, 503), None);
        assert_eq!(classify_status(&config, 429), None);
        assert_eq!(classify_status(&config, 500), Some(AttemptErrorType::Http5xx));
    }

    #[test]
    fn model_redirect_rewrites_the_body() {
        let mut row = crate::config::tests_support::upstream_row_for_tests();
        row.model_redirects_json = serde_json::json!({ "gpt-4.1": "gpt-4.1-mini" });
        let config = UpstreamConfig::from_row(&row).unwrap();

        let body = Bytes::from(r#"{"model":"gpt-4.1","stream":false}"#);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let rewritten = rewrite_model(&body, Some(&json), &config);
        let parsed: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(parsed["model"], "gpt-4.1-mini");

        let untouched = Bytes::from(r#"{"model":"o3"}"#);
        let json: serde_json::Value = serde_json::from_slice(&untouched).unwrap();
        assert_eq!(rewrite_model(&untouched, Some(&json), &config), untouched);
    }

    #[test]
    fn exhaustion_code_tracks_the_last_error_kind() {
        assert_eq!(
            exhaustion_envelope("r", Some(AttemptErrorType::Timeout), true).code,
            ErrorCode::RequestTimeout
        );
        assert_eq!(
            exhaustion_envelope("r", Some(AttemptErrorType::Http5xx), true).code,
            ErrorCode::AllUpstreamsUnavailable
        );
        assert_eq!(
            exhaustion_envelope("r", Some(AttemptErrorType::ConnectionError), true).code,
            ErrorCode::ServiceUnavailable
        );
        let envelope = exhaustion_envelope("r", Some(AttemptErrorType::CircuitOpen), false);
        assert_eq!(envelope.code, ErrorCode::AllUpstreamsUnavailable);
        assert_eq!(envelope.reason.as_deref(), Some("NO_HEALTHY_CANDIDATES"));
        assert!(!envelope.did_send_upstream);
    }
}
