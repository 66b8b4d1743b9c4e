use std::convert::Infallible;
use std::sync::Arc;

use autorouter_common::new_request_id;
use autorouter_core::proxy_engine::{ProxyBody, ProxyEngine, ProxyRequest, ProxyResponse};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

const REQUEST_ID_HEADER: &str = "x-autorouter-request-id";

#[derive(Clone)]
struct RouterState {
    engine: Arc<ProxyEngine>,
}

/// The inbound proxy surface: every method+path funnels into the engine,
/// which classifies or rejects it.
pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(RouterState { engine })
}

async fn proxy_handler(
    State(state): State<RouterState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let now = OffsetDateTime::now_utc();

    let app = state.engine.state();
    let auth = match app.keys.authenticate(&headers, &app.cipher, now) {
        Ok(auth) => auth,
        Err(failure) => {
            info!(request_id = %request_id, reason = failure.message(), "request rejected");
            return auth_error_response(failure.status(), failure.message(), &request_id);
        }
    };

    let request = ProxyRequest {
        request_id: request_id.clone(),
        auth,
        method,
        path: uri.path().to_string(),
        query: uri.query().map(|query| query.to_string()),
        headers,
        body,
    };

    let response = state.engine.handle(request).await;
    to_axum_response(response, &request_id)
}

fn auth_error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": { "message": message, "type": "client_error" },
        "request_id": request_id,
    });
    let mut resp = (status, axum::Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    resp
}

fn to_axum_response(response: ProxyResponse, request_id: &str) -> Response {
    let is_sse_stream = matches!(response.body, ProxyBody::Stream(_))
        && response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false);

    let mut builder = Response::builder().status(response.status);
    if let Some(out) = builder.headers_mut() {
        for (name, value) in &response.headers {
            if is_hop_by_hop_or_framing(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                out.append(name, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            out.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
        if is_sse_stream {
            // Keep intermediaries from buffering the event stream.
            out.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            out.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let body = match response.body {
        ProxyBody::Bytes(bytes) => Body::from(bytes),
        ProxyBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            Body::from_stream(stream)
        }
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn is_hop_by_hop_or_framing(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}
