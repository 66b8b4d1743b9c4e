use std::collections::HashMap;
use std::sync::Arc;

use autorouter_core::breaker::BreakerState;
use autorouter_core::state::AppState;
use autorouter_storage::{CompensationRuleInput, CompensationRuleRow, Store};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::{get, post};
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::stats::{self, StatsRange};

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub store: Store,
}

/// Core-visible admin surface; the binary nests this under `/api/admin`.
pub fn admin_router(app: Arc<AppState>, store: Store) -> Router {
    let state = AdminState { app, store };

    Router::new()
        .route("/circuit-breakers", get(list_breakers))
        .route("/circuit-breakers/{upstream_id}", get(get_breaker))
        .route(
            "/circuit-breakers/{upstream_id}/force-open",
            post(force_open),
        )
        .route(
            "/circuit-breakers/{upstream_id}/force-close",
            post(force_close),
        )
        .route("/upstreams/quota", get(quota_status).post(quota_resync))
        .route("/reload", post(reload_config))
        .route("/stats/overview", get(stats_overview))
        .route("/stats/timeseries", get(stats_timeseries))
        .route("/stats/leaderboard", get(stats_leaderboard))
        .route(
            "/compensation-rules",
            get(list_rules).post(create_rule),
        )
        .route(
            "/compensation-rules/{id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    // Compare digests; blake3 hash equality is constant-time.
    let expected = blake3::hash(state.app.settings.admin_token.as_bytes());
    if blake3::hash(token.as_bytes()) != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

// ---- circuit breakers ----

#[derive(Debug, Deserialize)]
struct BreakerListQuery {
    state: Option<String>,
    page: Option<u64>,
    #[serde(rename = "pageSize")]
    page_size: Option<u64>,
}

async fn list_breakers(
    State(state): State<AdminState>,
    Query(query): Query<BreakerListQuery>,
) -> Response {
    let filter = match query.state.as_deref() {
        Some(value) => match BreakerState::parse(value) {
            Some(parsed) => Some(parsed),
            None => return error_response(StatusCode::BAD_REQUEST, "unknown breaker state"),
        },
        None => None,
    };

    let upstreams = state.app.upstreams.load();
    let mut rows: Vec<serde_json::Value> = upstreams
        .values()
        .filter_map(|runtime| {
            let snapshot = runtime.breaker.snapshot();
            if let Some(filter) = filter
                && snapshot.state != filter
            {
                return None;
            }
            Some(breaker_json(&runtime.config.name, &snapshot))
        })
        .collect();
    rows.sort_by_key(|row| row["upstream_id"].as_i64());

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 200);
    let total = rows.len() as u64;
    let total_pages = total.div_ceil(page_size).max(1);
    let start = ((page - 1) * page_size) as usize;
    let data: Vec<_> = rows.into_iter().skip(start).take(page_size as usize).collect();

    Json(serde_json::json!({
        "data": data,
        "pagination": {
            "page": page,
            "pageSize": page_size,
            "total": total,
            "totalPages": total_pages,
        },
    }))
    .into_response()
}

async fn get_breaker(State(state): State<AdminState>, Path(upstream_id): Path<i64>) -> Response {
    let Some(runtime) = state.app.upstream(upstream_id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown upstream");
    };
    Json(breaker_json(&runtime.config.name, &runtime.breaker.snapshot())).into_response()
}

async fn force_open(State(state): State<AdminState>, Path(upstream_id): Path<i64>) -> Response {
    force_transition(state, upstream_id, true).await
}

async fn force_close(State(state): State<AdminState>, Path(upstream_id): Path<i64>) -> Response {
    force_transition(state, upstream_id, false).await
}

async fn force_transition(state: AdminState, upstream_id: i64, open: bool) -> Response {
    let Some(runtime) = state.app.upstream(upstream_id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown upstream");
    };
    let now = OffsetDateTime::now_utc();
    let persist = if open {
        runtime.breaker.force_open(now)
    } else {
        runtime.breaker.force_close(now)
    };
    info!(upstream_id, state = %persist.state, "breaker forced");
    // Forced transitions persist immediately rather than via the batch bus.
    if let Err(err) = state.store.upsert_breaker_state(persist).await {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("breaker state write failed: {err}"),
        );
    }
    Json(breaker_json(&runtime.config.name, &runtime.breaker.snapshot())).into_response()
}

fn breaker_json(
    name: &str,
    snapshot: &autorouter_core::breaker::BreakerSnapshot,
) -> serde_json::Value {
    serde_json::json!({
        "upstream_id": snapshot.upstream_id,
        "upstream_name": name,
        "state": snapshot.state.as_str(),
        "failure_count": snapshot.failure_count,
        "success_count": snapshot.success_count,
        "last_failure_at": rfc3339(snapshot.last_failure_at),
        "opened_at": rfc3339(snapshot.opened_at),
        "last_probe_at": rfc3339(snapshot.last_probe_at),
        "config": {
            "failure_threshold": snapshot.config.failure_threshold,
            "success_threshold": snapshot.config.success_threshold,
            "open_duration_secs": snapshot.config.open_duration.as_secs(),
            "probe_interval_secs": snapshot.config.probe_interval.as_secs(),
        },
    })
}

// ---- quota ----

async fn quota_status(State(state): State<AdminState>) -> Response {
    let now = OffsetDateTime::now_utc();
    let upstreams = state.app.upstreams.load();
    let data: Vec<serde_json::Value> = state
        .app
        .quota
        .status(now)
        .into_iter()
        .map(|status| {
            let name = upstreams
                .get(&status.upstream_id)
                .map(|runtime| runtime.config.name.clone());
            serde_json::json!({
                "upstream_id": status.upstream_id,
                "upstream_name": name,
                "limit": status.limit,
                "period": period_json(status.period),
                "current_spend": status.current_spend,
                "exceeded": status.exceeded,
                "recovery_at": rfc3339(status.recovery_at),
                "recovery_drop": status.recovery_drop,
            })
        })
        .collect();
    Json(serde_json::json!({ "data": data })).into_response()
}

/// Re-materializes keys, upstreams, prices and rules from storage after
/// out-of-band mutations (key CRUD, upstream edits, catalog refresh).
async fn reload_config(State(state): State<AdminState>) -> Response {
    let snapshot = match state.store.load_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => return storage_error(err),
    };
    if let Err(err) = state.app.apply_snapshot(&snapshot) {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            &format!("snapshot rejected: {err}"),
        );
    }
    info!(
        api_keys = snapshot.api_keys.len(),
        upstreams = snapshot.upstreams.len(),
        "configuration reloaded"
    );
    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn quota_resync(State(state): State<AdminState>) -> Response {
    let now = OffsetDateTime::now_utc();
    match autorouter_core::resync_quota(&state.app, &state.store, now).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("quota resync failed: {err}"),
        ),
    }
}

fn period_json(period: autorouter_core::config::SpendingPeriod) -> serde_json::Value {
    use autorouter_core::config::SpendingPeriod;
    match period {
        SpendingPeriod::Daily => serde_json::json!({ "type": "daily" }),
        SpendingPeriod::Monthly => serde_json::json!({ "type": "monthly" }),
        SpendingPeriod::Rolling { hours } => {
            serde_json::json!({ "type": "rolling", "hours": hours })
        }
    }
}

// ---- stats ----

#[derive(Debug, Deserialize)]
struct StatsQuery {
    range: Option<String>,
}

async fn stats_overview(
    State(state): State<AdminState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    with_stats(state, query, stats::overview).await
}

async fn stats_timeseries(
    State(state): State<AdminState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    with_stats(state, query, stats::timeseries).await
}

async fn stats_leaderboard(
    State(state): State<AdminState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let Some(range) = StatsRange::parse(query.range.as_deref()) else {
        return error_response(StatusCode::BAD_REQUEST, "range must be today, 7d or 30d");
    };
    let since = range.since(OffsetDateTime::now_utc());
    let requests = match state.store.request_stats_since(since).await {
        Ok(rows) => rows,
        Err(err) => return storage_error(err),
    };
    let snapshots = match state.store.snapshot_stats_since(since).await {
        Ok(rows) => rows,
        Err(err) => return storage_error(err),
    };
    let names: HashMap<i64, String> = state
        .app
        .upstreams
        .load()
        .values()
        .map(|runtime| (runtime.config.id, runtime.config.name.clone()))
        .collect();
    Json(stats::leaderboard(range, &requests, &snapshots, &names)).into_response()
}

async fn with_stats(
    state: AdminState,
    query: StatsQuery,
    reduce: fn(
        StatsRange,
        &[autorouter_storage::RequestStatRow],
        &[autorouter_storage::SnapshotStatRow],
    ) -> serde_json::Value,
) -> Response {
    let Some(range) = StatsRange::parse(query.range.as_deref()) else {
        return error_response(StatusCode::BAD_REQUEST, "range must be today, 7d or 30d");
    };
    let since = range.since(OffsetDateTime::now_utc());
    let requests = match state.store.request_stats_since(since).await {
        Ok(rows) => rows,
        Err(err) => return storage_error(err),
    };
    let snapshots = match state.store.snapshot_stats_since(since).await {
        Ok(rows) => rows,
        Err(err) => return storage_error(err),
    };
    Json(reduce(range, &requests, &snapshots)).into_response()
}

// ---- compensation rules ----

#[derive(Debug, Deserialize)]
struct RulePayload {
    name: Option<String>,
    capabilities: Option<Vec<String>>,
    #[serde(rename = "targetHeader")]
    target_header: Option<String>,
    sources: Option<Vec<String>>,
    enabled: Option<bool>,
}

async fn list_rules(State(state): State<AdminState>) -> Response {
    match state.store.list_compensation_rules().await {
        Ok(rows) => {
            let data: Vec<_> = rows.iter().map(rule_json).collect();
            Json(serde_json::json!({ "data": data })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn get_rule(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.store.find_compensation_rule(id).await {
        Ok(Some(rule)) => Json(rule_json(&rule)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown compensation rule"),
        Err(err) => storage_error(err),
    }
}

async fn create_rule(
    State(state): State<AdminState>,
    Json(payload): Json<RulePayload>,
) -> Response {
    let Some(input) = payload_to_input(&payload) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "name, capabilities, targetHeader and sources are required",
        );
    };
    match state
        .store
        .compensation_rule_name_exists(&input.name, None)
        .await
    {
        Ok(true) => {
            return error_response(StatusCode::CONFLICT, "a rule with this name already exists");
        }
        Ok(false) => {}
        Err(err) => return storage_error(err),
    }
    match state
        .store
        .insert_compensation_rule(input, OffsetDateTime::now_utc())
        .await
    {
        Ok(rule) => {
            state.app.compensation.invalidate();
            (StatusCode::CREATED, Json(rule_json(&rule))).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn update_rule(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(payload): Json<RulePayload>,
) -> Response {
    let existing = match state.store.find_compensation_rule(id).await {
        Ok(Some(rule)) => rule,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "unknown compensation rule"),
        Err(err) => return storage_error(err),
    };

    if existing.is_builtin {
        // Built-in rows accept nothing but the enabled toggle.
        if payload.name.is_some()
            || payload.capabilities.is_some()
            || payload.target_header.is_some()
            || payload.sources.is_some()
        {
            return error_response(
                StatusCode::FORBIDDEN,
                "built-in rules only allow toggling enabled",
            );
        }
        let Some(enabled) = payload.enabled else {
            return error_response(StatusCode::BAD_REQUEST, "enabled is required");
        };
        return match state
            .store
            .set_compensation_rule_enabled(id, enabled, OffsetDateTime::now_utc())
            .await
        {
            Ok(Some(rule)) => {
                state.app.compensation.invalidate();
                Json(rule_json(&rule)).into_response()
            }
            Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown compensation rule"),
            Err(err) => storage_error(err),
        };
    }

    let Some(mut input) = payload_to_input(&payload) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "name, capabilities, targetHeader and sources are required",
        );
    };
    input.is_builtin = false;
    match state
        .store
        .compensation_rule_name_exists(&input.name, Some(id))
        .await
    {
        Ok(true) => {
            return error_response(StatusCode::CONFLICT, "a rule with this name already exists");
        }
        Ok(false) => {}
        Err(err) => return storage_error(err),
    }
    match state
        .store
        .update_compensation_rule(id, input, OffsetDateTime::now_utc())
        .await
    {
        Ok(Some(rule)) => {
            state.app.compensation.invalidate();
            Json(rule_json(&rule)).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown compensation rule"),
        Err(err) => storage_error(err),
    }
}

async fn delete_rule(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.store.find_compensation_rule(id).await {
        Ok(Some(rule)) if rule.is_builtin => {
            error_response(StatusCode::FORBIDDEN, "built-in rules cannot be deleted")
        }
        Ok(Some(_)) => match state.store.delete_compensation_rule(id).await {
            Ok(true) => {
                state.app.compensation.invalidate();
                Json(serde_json::json!({ "ok": true })).into_response()
            }
            Ok(false) => error_response(StatusCode::NOT_FOUND, "unknown compensation rule"),
            Err(err) => storage_error(err),
        },
        Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown compensation rule"),
        Err(err) => storage_error(err),
    }
}

fn payload_to_input(payload: &RulePayload) -> Option<CompensationRuleInput> {
    let name = payload.name.as_deref()?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let capabilities = payload.capabilities.as_ref()?;
    let target_header = payload.target_header.as_deref()?.trim().to_ascii_lowercase();
    if target_header.is_empty() {
        return None;
    }
    let sources = payload.sources.as_ref()?;
    if capabilities.is_empty() || sources.is_empty() {
        return None;
    }
    Some(CompensationRuleInput {
        name,
        capabilities: serde_json::json!(capabilities),
        target_header,
        sources: serde_json::json!(sources),
        mode: "missing_only".to_string(),
        is_builtin: false,
        enabled: payload.enabled.unwrap_or(true),
    })
}

fn rule_json(rule: &CompensationRuleRow) -> serde_json::Value {
    serde_json::json!({
        "id": rule.id,
        "name": rule.name,
        "capabilities": rule.capabilities_json,
        "targetHeader": rule.target_header,
        "sources": rule.sources_json,
        "mode": rule.mode,
        "isBuiltin": rule.is_builtin,
        "enabled": rule.enabled,
    })
}

// ---- helpers ----

fn rfc3339(value: Option<OffsetDateTime>) -> Option<String> {
    value.and_then(|at| at.format(&Rfc3339).ok())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": { "message": message } })),
    )
        .into_response()
}

fn storage_error(err: autorouter_storage::DbErr) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("storage error: {err}"),
    )
}
