use autorouter_protocol::{RouteCapability, UsageCounters};
use autorouter_storage::RequestLogInsert;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::auth::AuthContext;
use crate::error::ErrorEnvelope;
use crate::upstream_client::Headers;

/// One inbound request as the engine sees it, post-auth.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub auth: AuthContext,
    pub method: http::Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum ProxyBody {
    Bytes(Bytes),
    /// Tee output; already includes any trailing SSE error frame.
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: ProxyBody,
}

impl ProxyResponse {
    pub fn from_envelope(envelope: &ErrorEnvelope) -> Self {
        Self {
            status: envelope.http_status(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: ProxyBody::Bytes(Bytes::from(envelope.to_body())),
        }
    }

    pub fn not_found(message: &str) -> Self {
        let body = serde_json::json!({ "error": { "message": message, "type": "invalid_request_error" } });
        Self {
            status: StatusCode::NOT_FOUND,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: ProxyBody::Bytes(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())),
        }
    }
}

/// Error classes recorded per attempt in `failover_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorType {
    Timeout,
    #[serde(rename = "http_5xx")]
    Http5xx,
    #[serde(rename = "http_429")]
    Http429,
    ConnectionError,
    CircuitOpen,
    StreamError,
    ClientDisconnected,
}

/// One entry of `failover_history`; the terminal (successful) attempt has no
/// error fields but carries its status code.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub upstream_id: i64,
    pub upstream_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<AttemptErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// How the terminal upstream was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingType {
    Affinity,
    Weighted,
    Failover,
    None,
}

impl RoutingType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingType::Affinity => "affinity",
            RoutingType::Weighted => "weighted",
            RoutingType::Failover => "failover",
            RoutingType::None => "none",
        }
    }
}

/// Mutable per-request log state; finalized exactly once into a
/// `RequestLogInsert` row.
#[derive(Debug, Clone)]
pub struct LogDraft {
    pub request_id: String,
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub method: String,
    pub path: String,
    pub capability: Option<RouteCapability>,
    pub model: Option<String>,
    pub status_code: Option<u16>,
    pub started_at: OffsetDateTime,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    pub routing_type: RoutingType,
    pub priority_tier: Option<i32>,
    pub attempts: Vec<AttemptRecord>,
    pub header_diff: serde_json::Value,
    pub session_key: Option<String>,
    pub affinity_applied: bool,
    pub affinity_migrated: bool,
    pub usage: Option<UsageCounters>,
    /// Response payload size; the textual-length affinity metric.
    pub response_bytes: i64,
    pub error_code: Option<&'static str>,
}

pub const LB_STRATEGY: &str = "priority_weighted_random";

impl LogDraft {
    pub fn new(request: &ProxyRequest, started_at: OffsetDateTime) -> Self {
        Self {
            request_id: request.request_id.clone(),
            api_key_id: Some(request.auth.api_key_id),
            upstream_id: None,
            method: request.method.to_string(),
            path: request.path.clone(),
            capability: None,
            model: None,
            status_code: None,
            started_at,
            ttft_ms: None,
            is_stream: false,
            routing_type: RoutingType::None,
            priority_tier: None,
            attempts: Vec::new(),
            header_diff: serde_json::Value::Null,
            session_key: None,
            affinity_applied: false,
            affinity_migrated: false,
            usage: None,
            response_bytes: 0,
            error_code: None,
        }
    }

    pub fn record_attempt(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
    }

    pub fn finalize(&self, completed_at: OffsetDateTime) -> RequestLogInsert {
        let usage = self.usage.unwrap_or_default();
        RequestLogInsert {
            id: self.request_id.clone(),
            api_key_id: self.api_key_id,
            upstream_id: self.upstream_id,
            method: self.method.clone(),
            path: self.path.clone(),
            model: self.model.clone(),
            status_code: self.status_code.map(i32::from),
            duration_ms: ((completed_at - self.started_at).whole_milliseconds() as i64).max(0),
            ttft_ms: self.ttft_ms,
            is_stream: self.is_stream,
            routing_type: self.routing_type.as_str().to_string(),
            lb_strategy: LB_STRATEGY.to_string(),
            priority_tier: self.priority_tier,
            failover_attempts: self.attempts.len() as i32,
            failover_history: serde_json::to_value(&self.attempts)
                .unwrap_or(serde_json::Value::Null),
            header_diff: self.header_diff.clone(),
            session_key: self.session_key.clone(),
            affinity_applied: self.affinity_applied,
            affinity_migrated: self.affinity_migrated,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_write_tokens: usage.cache_write_tokens,
            error_code: self.error_code.map(|code| code.to_string()),
            created_at: completed_at,
        }
    }
}
