#![allow(clippy::needless_update)]

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Schema,
};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::db::connect_shared;
use crate::entities;
use crate::snapshot::{
    ApiKeyRow, BindingRow, BreakerStateRow, CompensationRuleRow, ManualOverrideRow, ModelPriceRow,
    StorageSnapshot, UpstreamRow,
};

/// One request-log row ready for the batched insert.
#[derive(Debug, Clone)]
pub struct RequestLogInsert {
    pub id: String,
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub status_code: Option<i32>,
    pub duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    pub routing_type: String,
    pub lb_strategy: String,
    pub priority_tier: Option<i32>,
    pub failover_attempts: i32,
    pub failover_history: JsonValue,
    pub header_diff: JsonValue,
    pub session_key: Option<String>,
    pub affinity_applied: bool,
    pub affinity_migrated: bool,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub error_code: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Billing snapshot upsert payload; idempotent on `request_log_id`.
#[derive(Debug, Clone)]
pub struct BillingSnapshotUpsert {
    pub request_log_id: String,
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub model: Option<String>,
    pub billing_status: String,
    pub unbillable_reason: Option<String>,
    pub price_source: Option<String>,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
    pub input_multiplier: f64,
    pub output_multiplier: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub final_cost: f64,
    pub currency: String,
    pub created_at: OffsetDateTime,
}

/// Circuit-breaker state tuple written back after each transition.
#[derive(Debug, Clone)]
pub struct BreakerPersist {
    pub upstream_id: i64,
    pub state: String,
    pub failure_count: i32,
    pub success_count: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub opened_at: Option<OffsetDateTime>,
    pub last_probe_at: Option<OffsetDateTime>,
    pub config_json: JsonValue,
    pub updated_at: OffsetDateTime,
}

/// Billed spend replayed into the quota tracker at boot.
#[derive(Debug, Clone)]
pub struct BilledSpendRow {
    pub upstream_id: i64,
    pub final_cost: f64,
    pub created_at: OffsetDateTime,
}

/// Minimal request-log projection the stats reducers work over.
#[derive(Debug, Clone)]
pub struct RequestStatRow {
    pub upstream_id: Option<i64>,
    pub model: Option<String>,
    pub status_code: Option<i32>,
    pub duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    pub failover_attempts: i32,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct SnapshotStatRow {
    pub upstream_id: Option<i64>,
    pub model: Option<String>,
    pub billing_status: String,
    pub final_cost: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct CompensationRuleInput {
    pub name: String,
    pub capabilities: JsonValue,
    pub target_header: String,
    pub sources: JsonValue,
    pub mode: String,
    pub is_builtin: bool,
    pub enabled: bool,
}

#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub async fn connect(dsn: &str) -> Result<Self, DbErr> {
        let db = connect_shared(dsn).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ApiKeys)
            .register(entities::ApiKeyUpstreams)
            .register(entities::Upstreams)
            .register(entities::CircuitBreakerStates)
            .register(entities::BillingModelPrices)
            .register(entities::BillingManualOverrides)
            .register(entities::RequestLogs)
            .register(entities::RequestBillingSnapshots)
            .register(entities::CompensationRules)
            .sync(&self.db)
            .await
    }

    pub async fn health(&self) -> Result<(), DbErr> {
        entities::Upstreams::find()
            .order_by_asc(entities::upstreams::Column::Id)
            .one(&self.db)
            .await?;
        Ok(())
    }

    // ---- config snapshot ----

    pub async fn load_snapshot(&self) -> Result<StorageSnapshot, DbErr> {
        let api_keys = entities::ApiKeys::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| ApiKeyRow {
                id: row.id,
                key_hash: row.key_hash,
                key_prefix: row.key_prefix,
                sealed_secret: row.sealed_secret,
                name: row.name,
                is_active: row.is_active,
                expires_at: row.expires_at,
                created_at: row.created_at,
            })
            .collect();

        let bindings = entities::ApiKeyUpstreams::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| BindingRow {
                api_key_id: row.api_key_id,
                upstream_id: row.upstream_id,
            })
            .collect();

        let upstreams = entities::Upstreams::find()
            .order_by_asc(entities::upstreams::Column::Priority)
            .all(&self.db)
            .await?
            .into_iter()
            .map(upstream_row)
            .collect();

        let breaker_states = entities::CircuitBreakerStates::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(breaker_row)
            .collect();

        let compensation_rules = entities::CompensationRules::find()
            .order_by_asc(entities::compensation_rules::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(rule_row)
            .collect();

        let model_prices = entities::BillingModelPrices::find()
            .filter(entities::billing_model_prices::Column::IsActive.eq(true))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| ModelPriceRow {
                model: row.model,
                source: row.source,
                input_price_per_million: row.input_price_per_million,
                output_price_per_million: row.output_price_per_million,
                cache_read_price_per_million: row.cache_read_price_per_million,
                cache_write_price_per_million: row.cache_write_price_per_million,
                synced_at: row.synced_at,
            })
            .collect();

        let manual_overrides = entities::BillingManualOverrides::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| ManualOverrideRow {
                model: row.model,
                input_price_per_million: row.input_price_per_million,
                output_price_per_million: row.output_price_per_million,
                cache_read_price_per_million: row.cache_read_price_per_million,
                cache_write_price_per_million: row.cache_write_price_per_million,
            })
            .collect();

        Ok(StorageSnapshot {
            api_keys,
            bindings,
            upstreams,
            breaker_states,
            compensation_rules,
            model_prices,
            manual_overrides,
        })
    }

    // ---- request plane writes ----

    pub async fn insert_request_logs(&self, logs: Vec<RequestLogInsert>) -> Result<(), DbErr> {
        if logs.is_empty() {
            return Ok(());
        }
        let models = logs.into_iter().map(|log| entities::request_logs::ActiveModel {
            id: ActiveValue::Set(log.id),
            api_key_id: ActiveValue::Set(log.api_key_id),
            upstream_id: ActiveValue::Set(log.upstream_id),
            method: ActiveValue::Set(log.method),
            path: ActiveValue::Set(log.path),
            model: ActiveValue::Set(log.model),
            status_code: ActiveValue::Set(log.status_code),
            duration_ms: ActiveValue::Set(log.duration_ms),
            ttft_ms: ActiveValue::Set(log.ttft_ms),
            is_stream: ActiveValue::Set(log.is_stream),
            routing_type: ActiveValue::Set(log.routing_type),
            lb_strategy: ActiveValue::Set(log.lb_strategy),
            priority_tier: ActiveValue::Set(log.priority_tier),
            failover_attempts: ActiveValue::Set(log.failover_attempts),
            failover_history_json: ActiveValue::Set(log.failover_history),
            header_diff_json: ActiveValue::Set(log.header_diff),
            session_key: ActiveValue::Set(log.session_key),
            affinity_applied: ActiveValue::Set(log.affinity_applied),
            affinity_migrated: ActiveValue::Set(log.affinity_migrated),
            prompt_tokens: ActiveValue::Set(log.prompt_tokens),
            completion_tokens: ActiveValue::Set(log.completion_tokens),
            cache_read_tokens: ActiveValue::Set(log.cache_read_tokens),
            cache_write_tokens: ActiveValue::Set(log.cache_write_tokens),
            error_code: ActiveValue::Set(log.error_code),
            created_at: ActiveValue::Set(log.created_at),
            ..Default::default()
        });
        entities::RequestLogs::insert_many(models).exec(&self.db).await?;
        Ok(())
    }

    pub async fn upsert_billing_snapshot(
        &self,
        snapshot: BillingSnapshotUpsert,
    ) -> Result<(), DbErr> {
        use entities::request_billing_snapshots::Column;

        let active = entities::request_billing_snapshots::ActiveModel {
            id: ActiveValue::NotSet,
            request_log_id: ActiveValue::Set(snapshot.request_log_id),
            api_key_id: ActiveValue::Set(snapshot.api_key_id),
            upstream_id: ActiveValue::Set(snapshot.upstream_id),
            model: ActiveValue::Set(snapshot.model),
            billing_status: ActiveValue::Set(snapshot.billing_status),
            unbillable_reason: ActiveValue::Set(snapshot.unbillable_reason),
            price_source: ActiveValue::Set(snapshot.price_source),
            input_price_per_million: ActiveValue::Set(snapshot.input_price_per_million),
            output_price_per_million: ActiveValue::Set(snapshot.output_price_per_million),
            cache_read_price_per_million: ActiveValue::Set(snapshot.cache_read_price_per_million),
            cache_write_price_per_million: ActiveValue::Set(snapshot.cache_write_price_per_million),
            input_multiplier: ActiveValue::Set(snapshot.input_multiplier),
            output_multiplier: ActiveValue::Set(snapshot.output_multiplier),
            prompt_tokens: ActiveValue::Set(snapshot.prompt_tokens),
            completion_tokens: ActiveValue::Set(snapshot.completion_tokens),
            cache_read_tokens: ActiveValue::Set(snapshot.cache_read_tokens),
            cache_write_tokens: ActiveValue::Set(snapshot.cache_write_tokens),
            final_cost: ActiveValue::Set(snapshot.final_cost),
            currency: ActiveValue::Set(snapshot.currency),
            created_at: ActiveValue::Set(snapshot.created_at),
            ..Default::default()
        };

        entities::RequestBillingSnapshots::insert(active)
            .on_conflict(
                OnConflict::column(Column::RequestLogId)
                    .update_columns([
                        Column::ApiKeyId,
                        Column::UpstreamId,
                        Column::Model,
                        Column::BillingStatus,
                        Column::UnbillableReason,
                        Column::PriceSource,
                        Column::InputPricePerMillion,
                        Column::OutputPricePerMillion,
                        Column::CacheReadPricePerMillion,
                        Column::CacheWritePricePerMillion,
                        Column::InputMultiplier,
                        Column::OutputMultiplier,
                        Column::PromptTokens,
                        Column::CompletionTokens,
                        Column::CacheReadTokens,
                        Column::CacheWriteTokens,
                        Column::FinalCost,
                        Column::Currency,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn upsert_breaker_state(&self, persist: BreakerPersist) -> Result<(), DbErr> {
        use entities::circuit_breaker_states::Column;

        let active = entities::circuit_breaker_states::ActiveModel {
            id: ActiveValue::NotSet,
            upstream_id: ActiveValue::Set(persist.upstream_id),
            state: ActiveValue::Set(persist.state),
            failure_count: ActiveValue::Set(persist.failure_count),
            success_count: ActiveValue::Set(persist.success_count),
            last_failure_at: ActiveValue::Set(persist.last_failure_at),
            opened_at: ActiveValue::Set(persist.opened_at),
            last_probe_at: ActiveValue::Set(persist.last_probe_at),
            config_json: ActiveValue::Set(persist.config_json),
            updated_at: ActiveValue::Set(persist.updated_at),
            ..Default::default()
        };

        entities::CircuitBreakerStates::insert(active)
            .on_conflict(
                OnConflict::column(Column::UpstreamId)
                    .update_columns([
                        Column::State,
                        Column::FailureCount,
                        Column::SuccessCount,
                        Column::LastFailureAt,
                        Column::OpenedAt,
                        Column::LastProbeAt,
                        Column::ConfigJson,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ---- quota rebuild ----

    pub async fn billed_spend_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<BilledSpendRow>, DbErr> {
        use entities::request_billing_snapshots::Column;

        let rows = entities::RequestBillingSnapshots::find()
            .filter(Column::BillingStatus.eq("billed"))
            .filter(Column::CreatedAt.gte(since))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let upstream_id = row.upstream_id?;
                Some(BilledSpendRow {
                    upstream_id,
                    final_cost: row.final_cost,
                    created_at: row.created_at,
                })
            })
            .collect())
    }

    // ---- stats reducers (admin, read-only) ----

    pub async fn request_stats_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<RequestStatRow>, DbErr> {
        use entities::request_logs::Column;

        let rows = entities::RequestLogs::find()
            .filter(Column::CreatedAt.gte(since))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| RequestStatRow {
                upstream_id: row.upstream_id,
                model: row.model,
                status_code: row.status_code,
                duration_ms: row.duration_ms,
                ttft_ms: row.ttft_ms,
                is_stream: row.is_stream,
                failover_attempts: row.failover_attempts,
                created_at: row.created_at,
            })
            .collect())
    }

    pub async fn snapshot_stats_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<SnapshotStatRow>, DbErr> {
        use entities::request_billing_snapshots::Column;

        let rows = entities::RequestBillingSnapshots::find()
            .filter(Column::CreatedAt.gte(since))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| SnapshotStatRow {
                upstream_id: row.upstream_id,
                model: row.model,
                billing_status: row.billing_status,
                final_cost: row.final_cost,
                prompt_tokens: row.prompt_tokens,
                completion_tokens: row.completion_tokens,
                created_at: row.created_at,
            })
            .collect())
    }

    // ---- circuit breaker admin reads ----

    pub async fn list_breaker_states(
        &self,
        state_filter: Option<&str>,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<BreakerStateRow>, u64), DbErr> {
        use entities::circuit_breaker_states::Column;

        let mut query = entities::CircuitBreakerStates::find();
        if let Some(state) = state_filter {
            query = query.filter(Column::State.eq(state));
        }
        let paginator = query
            .order_by_asc(Column::UpstreamId)
            .paginate(&self.db, page_size.max(1));
        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((rows.into_iter().map(breaker_row).collect(), total))
    }

    pub async fn find_breaker_state(
        &self,
        upstream_id: i64,
    ) -> Result<Option<BreakerStateRow>, DbErr> {
        use entities::circuit_breaker_states::Column;

        Ok(entities::CircuitBreakerStates::find()
            .filter(Column::UpstreamId.eq(upstream_id))
            .one(&self.db)
            .await?
            .map(breaker_row))
    }

    // ---- compensation rules ----

    pub async fn list_compensation_rules(&self) -> Result<Vec<CompensationRuleRow>, DbErr> {
        Ok(entities::CompensationRules::find()
            .order_by_asc(entities::compensation_rules::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(rule_row)
            .collect())
    }

    pub async fn find_compensation_rule(
        &self,
        id: i64,
    ) -> Result<Option<CompensationRuleRow>, DbErr> {
        Ok(entities::CompensationRules::find_by_id(id)
            .one(&self.db)
            .await?
            .map(rule_row))
    }

    pub async fn compensation_rule_name_exists(
        &self,
        name: &str,
        exclude_id: Option<i64>,
    ) -> Result<bool, DbErr> {
        use entities::compensation_rules::Column;

        let mut query = entities::CompensationRules::find().filter(Column::Name.eq(name));
        if let Some(id) = exclude_id {
            query = query.filter(Column::Id.ne(id));
        }
        Ok(query.count(&self.db).await? > 0)
    }

    pub async fn insert_compensation_rule(
        &self,
        input: CompensationRuleInput,
        now: OffsetDateTime,
    ) -> Result<CompensationRuleRow, DbErr> {
        let active = entities::compensation_rules::ActiveModel {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(input.name),
            capabilities_json: ActiveValue::Set(input.capabilities),
            target_header: ActiveValue::Set(input.target_header),
            sources_json: ActiveValue::Set(input.sources),
            mode: ActiveValue::Set(input.mode),
            is_builtin: ActiveValue::Set(input.is_builtin),
            enabled: ActiveValue::Set(input.enabled),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let model = active.insert(&self.db).await?;
        Ok(rule_row(model))
    }

    pub async fn update_compensation_rule(
        &self,
        id: i64,
        input: CompensationRuleInput,
        now: OffsetDateTime,
    ) -> Result<Option<CompensationRuleRow>, DbErr> {
        let Some(existing) = entities::CompensationRules::find_by_id(id).one(&self.db).await?
        else {
            return Ok(None);
        };
        let mut active: entities::compensation_rules::ActiveModel = existing.into();
        active.name = ActiveValue::Set(input.name);
        active.capabilities_json = ActiveValue::Set(input.capabilities);
        active.target_header = ActiveValue::Set(input.target_header);
        active.sources_json = ActiveValue::Set(input.sources);
        active.mode = ActiveValue::Set(input.mode);
        active.enabled = ActiveValue::Set(input.enabled);
        active.updated_at = ActiveValue::Set(now);
        let model = active.update(&self.db).await?;
        Ok(Some(rule_row(model)))
    }

    pub async fn set_compensation_rule_enabled(
        &self,
        id: i64,
        enabled: bool,
        now: OffsetDateTime,
    ) -> Result<Option<CompensationRuleRow>, DbErr> {
        let Some(existing) = entities::CompensationRules::find_by_id(id).one(&self.db).await?
        else {
            return Ok(None);
        };
        let mut active: entities::compensation_rules::ActiveModel = existing.into();
        active.enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(now);
        let model = active.update(&self.db).await?;
        Ok(Some(rule_row(model)))
    }

    pub async fn delete_compensation_rule(&self, id: i64) -> Result<bool, DbErr> {
        let result = entities::CompensationRules::delete_by_id(id).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    /// Seeds built-in rules missing from the table; never touches existing
    /// rows (admins may have toggled them off).
    pub async fn ensure_builtin_rules(
        &self,
        defaults: &[CompensationRuleInput],
        now: OffsetDateTime,
    ) -> Result<(), DbErr> {
        let existing = self.list_compensation_rules().await?;
        for default in defaults {
            if existing.iter().any(|rule| rule.name == default.name) {
                continue;
            }
            self.insert_compensation_rule(default.clone(), now).await?;
        }
        Ok(())
    }
}

fn upstream_row(row: entities::upstreams::Model) -> UpstreamRow {
    UpstreamRow {
        id: row.id,
        name: row.name,
        base_url: row.base_url,
        sealed_credential: row.sealed_credential,
        is_active: row.is_active,
        provider_type: row.provider_type,
        priority: row.priority,
        weight: row.weight,
        timeout_secs: row.timeout_secs,
        capabilities_json: row.capabilities_json,
        allowed_models_json: row.allowed_models_json,
        model_redirects_json: row.model_redirects_json,
        affinity_json: row.affinity_json,
        exclude_status_codes_json: row.exclude_status_codes_json,
        billing_input_multiplier: row.billing_input_multiplier,
        billing_output_multiplier: row.billing_output_multiplier,
        spending_limit: row.spending_limit,
        spending_period_type: row.spending_period_type,
        spending_period_hours: row.spending_period_hours,
        circuit_json: row.circuit_json,
        updated_at: row.updated_at,
    }
}

fn breaker_row(row: entities::circuit_breaker_states::Model) -> BreakerStateRow {
    BreakerStateRow {
        upstream_id: row.upstream_id,
        state: row.state,
        failure_count: row.failure_count,
        success_count: row.success_count,
        last_failure_at: row.last_failure_at,
        opened_at: row.opened_at,
        last_probe_at: row.last_probe_at,
        config_json: row.config_json,
    }
}

fn rule_row(row: entities::compensation_rules::Model) -> CompensationRuleRow {
    CompensationRuleRow {
        id: row.id,
        name: row.name,
        capabilities_json: row.capabilities_json,
        target_header: row.target_header,
        sources_json: row.sources_json,
        mode: row.mode,
        is_builtin: row.is_builtin,
        enabled: row.enabled,
    }
}
