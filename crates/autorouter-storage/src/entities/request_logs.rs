use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Immutable record of one completed request. The id is a v7 uuid minted at
/// request start so the billing snapshot can reference it before the batched
/// insert lands.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(indexed)]
    pub api_key_id: Option<i64>,
    #[sea_orm(indexed)]
    pub upstream_id: Option<i64>,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub status_code: Option<i32>,
    pub duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    #[sea_orm(indexed)]
    pub routing_type: String,
    pub lb_strategy: String,
    pub priority_tier: Option<i32>,
    pub failover_attempts: i32,
    pub failover_history_json: Json,
    pub header_diff_json: Json,
    pub session_key: Option<String>,
    pub affinity_applied: bool,
    pub affinity_migrated: bool,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub error_code: Option<String>,
    #[sea_orm(indexed)]
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
