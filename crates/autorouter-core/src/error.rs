use http::StatusCode;
use serde::Serialize;

/// Coarse error classes surfaced in the envelope's `error.type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ServiceUnavailable,
    Timeout,
    ClientError,
    StreamError,
}

/// Stable machine-readable codes with a fixed HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AllUpstreamsUnavailable,
    NoAuthorizedUpstreams,
    NoUpstreamsConfigured,
    ServiceUnavailable,
    RequestTimeout,
    ClientDisconnected,
    StreamError,
}

impl ErrorCode {
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorCode::AllUpstreamsUnavailable
            | ErrorCode::NoUpstreamsConfigured
            | ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::NoAuthorizedUpstreams => StatusCode::FORBIDDEN,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            // Nginx's non-standard "client closed request".
            ErrorCode::ClientDisconnected => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ErrorCode::StreamError => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::AllUpstreamsUnavailable
            | ErrorCode::NoAuthorizedUpstreams
            | ErrorCode::NoUpstreamsConfigured
            | ErrorCode::ServiceUnavailable => ErrorKind::ServiceUnavailable,
            ErrorCode::RequestTimeout => ErrorKind::Timeout,
            ErrorCode::ClientDisconnected => ErrorKind::ClientError,
            ErrorCode::StreamError => ErrorKind::StreamError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AllUpstreamsUnavailable => "ALL_UPSTREAMS_UNAVAILABLE",
            ErrorCode::NoAuthorizedUpstreams => "NO_AUTHORIZED_UPSTREAMS",
            ErrorCode::NoUpstreamsConfigured => "NO_UPSTREAMS_CONFIGURED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::ClientDisconnected => "CLIENT_DISCONNECTED",
            ErrorCode::StreamError => "STREAM_ERROR",
        }
    }
}

/// The unified envelope returned whenever AutoRouter itself (not an
/// upstream) answers a proxied request.
///
/// Messages never name an upstream, its URL, or any provider-identifying
/// text.
#[derive(Debug, Clone)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    pub reason: Option<String>,
    pub did_send_upstream: bool,
    pub request_id: String,
    pub user_hint: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            reason: None,
            did_send_upstream: false,
            request_id: request_id.into(),
            user_hint: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.user_hint = Some(hint.into());
        self
    }

    pub fn sent_upstream(mut self, sent: bool) -> Self {
        self.did_send_upstream = sent;
        self
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "message": self.message,
            "type": self.code.kind(),
            "code": self.code.as_str(),
        });
        if let Some(reason) = &self.reason {
            error["reason"] = serde_json::Value::String(reason.clone());
        }
        serde_json::json!({
            "error": error,
            "did_send_upstream": self.did_send_upstream,
            "request_id": self.request_id,
            "user_hint": self.user_hint,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_json()).unwrap_or_else(|_| b"{}".to_vec())
    }

    /// `event: error` frame injected into an already-flushed SSE stream.
    pub fn to_sse_frame(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"event: error\ndata: ");
        frame.extend_from_slice(&self.to_body());
        frame.extend_from_slice(b"\n\n");
        frame
    }
}
