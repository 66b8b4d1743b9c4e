use std::sync::Arc;

use autorouter_storage::{BillingSnapshotUpsert, BreakerPersist, RequestLogInsert};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::warn;

use crate::billing::{self, BillingInput};
use crate::proxy_engine::types::LogDraft;
use crate::state::AppState;

/// Commits the terminal outcome of one request: the log row, the billing
/// snapshot (exactly one per log that carries a status code), the quota
/// delta and the affinity observation.
///
/// Everything here is synchronous (channel try_send + in-memory updates) so
/// it can also run from a drop guard when the client disconnects.
#[derive(Clone)]
pub struct Finalizer {
    state: Arc<AppState>,
    request_log_tx: mpsc::Sender<RequestLogInsert>,
    snapshot_tx: mpsc::Sender<BillingSnapshotUpsert>,
    breaker_tx: mpsc::Sender<BreakerPersist>,
}

impl Finalizer {
    pub fn new(
        state: Arc<AppState>,
        request_log_tx: mpsc::Sender<RequestLogInsert>,
        snapshot_tx: mpsc::Sender<BillingSnapshotUpsert>,
        breaker_tx: mpsc::Sender<BreakerPersist>,
    ) -> Self {
        Self {
            state,
            request_log_tx,
            snapshot_tx,
            breaker_tx,
        }
    }

    pub fn persist_breaker(&self, persist: BreakerPersist) {
        if self.breaker_tx.try_send(persist).is_err() {
            warn!("breaker persistence queue full; state write dropped");
        }
    }

    pub fn complete(&self, draft: LogDraft, now: OffsetDateTime) {
        let success = draft
            .status_code
            .map(|status| status < 400)
            .unwrap_or(false);

        // Sticky sessions only accumulate on requests the upstream served.
        if success
            && let (Some(session_key), Some(upstream_id)) =
                (draft.session_key.as_deref(), draft.upstream_id)
        {
            let tokens = draft.usage.map(|usage| usage.total()).unwrap_or(0);
            self.state
                .affinity
                .observe(session_key, upstream_id, tokens, draft.response_bytes, now);
        }

        if draft.status_code.is_some() {
            let upstream = draft
                .upstream_id
                .and_then(|id| self.state.upstream(id));
            let snapshot = billing::finalize(
                &self.state.pricing,
                upstream.as_ref().map(|rt| &rt.config),
                BillingInput {
                    request_log_id: draft.request_id.clone(),
                    api_key_id: draft.api_key_id,
                    upstream_id: draft.upstream_id,
                    model: draft.model.clone(),
                    usage: draft.usage,
                },
                now,
            );
            if snapshot.billing_status == "billed"
                && let Some(upstream_id) = draft.upstream_id
            {
                self.state.quota.record(upstream_id, snapshot.final_cost, now);
            }
            if self.snapshot_tx.try_send(snapshot).is_err() {
                warn!(request_id = %draft.request_id, "billing snapshot queue full; write dropped");
            }
        }

        if self.request_log_tx.try_send(draft.finalize(now)).is_err() {
            warn!(request_id = %draft.request_id, "request log queue full; write dropped");
        }
    }
}
