use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// 1:1 with a request log, written after it; the writer upserts on
/// `request_log_id` so replays are idempotent.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_billing_snapshots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "snapshot_request_log")]
    pub request_log_id: String,
    pub api_key_id: Option<i64>,
    #[sea_orm(indexed)]
    pub upstream_id: Option<i64>,
    #[sea_orm(indexed)]
    pub model: Option<String>,
    #[sea_orm(indexed)]
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
    #[sea_orm(indexed)]
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
