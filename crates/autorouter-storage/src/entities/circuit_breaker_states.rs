use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Exactly one row per upstream; created lazily with defaults on first
/// reference and rewritten after every transition.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "circuit_breaker_states")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "breaker_upstream")]
    pub upstream_id: i64,
    pub state: String,
    pub failure_count: i32,
    pub success_count: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub opened_at: Option<OffsetDateTime>,
    pub last_probe_at: Option<OffsetDateTime>,
    pub config_json: Json,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "upstream_id", to = "id", on_delete = "Cascade")]
    pub upstream: HasOne<super::upstreams::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
