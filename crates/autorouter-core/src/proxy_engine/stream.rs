use autorouter_protocol::{RouteCapability, SseFrameParser, UsageTail};
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::debug;

use crate::breaker::BreakerGuard;
use crate::error::{ErrorCode, ErrorEnvelope};
use crate::proxy_engine::finalize::Finalizer;
use crate::proxy_engine::types::{AttemptErrorType, LogDraft};
use crate::upstream_client::StreamFault;

pub(super) struct StreamTee {
    pub upstream_rx: mpsc::Receiver<Result<Bytes, StreamFault>>,
    pub client_tx: mpsc::Sender<Bytes>,
    pub capability: RouteCapability,
    pub draft: LogDraft,
    pub breaker: BreakerGuard,
    pub finalizer: Finalizer,
}

/// Bi-directional copy with a usage-parsing tee: upstream chunks pass to the
/// client verbatim while a minimal SSE parser watches for the trailing usage
/// block. Runs detached so a client disconnect cannot cancel finalization.
pub(super) async fn run(mut tee: StreamTee) {
    let mut parser = SseFrameParser::new();
    let mut usage_tail = UsageTail::new(tee.capability);

    loop {
        let Some(item) = tee.upstream_rx.recv().await else {
            // Clean upstream EOF.
            for frame in parser.finish() {
                usage_tail.observe(&frame.data);
            }
            tee.draft.usage = usage_tail.finish();
            let now = OffsetDateTime::now_utc();
            if let Some(persist) = tee.breaker.on_success(now) {
                tee.finalizer.persist_breaker(persist);
            }
            tee.finalizer.complete(tee.draft, now);
            return;
        };

        match item {
            Ok(chunk) => {
                tee.draft.response_bytes += chunk.len() as i64;
                for frame in parser.feed(&chunk) {
                    usage_tail.observe(&frame.data);
                }
                if tee.client_tx.send(chunk).await.is_err() {
                    // Client went away mid-stream; tear down the upstream
                    // side and keep whatever usage already arrived.
                    debug!(request_id = %tee.draft.request_id, "client disconnected mid-stream");
                    tee.upstream_rx.close();
                    tee.draft.usage = usage_tail.finish();
                    tee.draft.error_code = Some(ErrorCode::ClientDisconnected.as_str());
                    record_tail_error(&mut tee.draft, AttemptErrorType::ClientDisconnected);
                    let now = OffsetDateTime::now_utc();
                    if let Some(persist) = tee.breaker.on_success(now) {
                        tee.finalizer.persist_breaker(persist);
                    }
                    tee.finalizer.complete(tee.draft, now);
                    return;
                }
            }
            Err(fault) => {
                // Stream died after bytes were flushed: surface the unified
                // envelope as a terminal SSE error event, then close.
                let envelope = ErrorEnvelope::new(
                    ErrorCode::StreamError,
                    "upstream stream was interrupted",
                    tee.draft.request_id.clone(),
                )
                .with_reason(match fault {
                    StreamFault::IdleTimeout => "STREAM_IDLE_TIMEOUT",
                    StreamFault::Transport => "UPSTREAM_TRANSPORT_ERROR",
                })
                .sent_upstream(true);
                let _ = tee.client_tx.send(Bytes::from(envelope.to_sse_frame())).await;

                tee.draft.usage = usage_tail.finish();
                tee.draft.error_code = Some(ErrorCode::StreamError.as_str());
                record_tail_error(&mut tee.draft, AttemptErrorType::StreamError);
                let now = OffsetDateTime::now_utc();
                if let Some(persist) = tee.breaker.on_failure(now) {
                    tee.finalizer.persist_breaker(persist);
                }
                tee.finalizer.complete(tee.draft, now);
                return;
            }
        }
    }
}

/// Annotates the terminal attempt entry with how the stream ended.
fn record_tail_error(draft: &mut LogDraft, error_type: AttemptErrorType) {
    if let Some(last) = draft.attempts.last_mut() {
        last.error_type = Some(error_type);
    }
}
