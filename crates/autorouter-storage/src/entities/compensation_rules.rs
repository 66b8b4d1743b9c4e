use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Header-rewrite rule keyed by route capability. Built-in rows only accept
/// `enabled` toggles.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "compensation_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "rule_name")]
    pub name: String,
    pub capabilities_json: Json,
    pub target_header: String,
    /// Ordered `headers.<name>` / `body.<dotted.path>` sources.
    pub sources_json: Json,
    pub mode: String,
    pub is_builtin: bool,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
