use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Synced catalog row; immutable apart from refresh.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "billing_model_prices")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "price_model_source")]
    pub model: String,
    /// Catalog the row came from: `litellm` or `openrouter`.
    #[sea_orm(unique_key = "price_model_source")]
    pub source: String,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
    pub is_active: bool,
    pub synced_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
