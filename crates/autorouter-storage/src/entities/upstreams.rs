use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstreams")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "upstream_name")]
    pub name: String,
    pub base_url: String,
    /// AES-GCM sealed upstream credential.
    pub sealed_credential: String,
    pub is_active: bool,
    #[sea_orm(indexed)]
    pub provider_type: String,
    /// Lower is preferred; 0 is the top tier.
    #[sea_orm(indexed)]
    pub priority: i32,
    pub weight: i32,
    pub timeout_secs: i64,
    /// Declared capability tags; empty array expands to the family default.
    pub capabilities_json: Json,
    pub allowed_models_json: Option<Json>,
    pub model_redirects_json: Json,
    pub affinity_json: Option<Json>,
    pub exclude_status_codes_json: Json,
    pub billing_input_multiplier: f64,
    pub billing_output_multiplier: f64,
    pub spending_limit: Option<f64>,
    pub spending_period_type: Option<String>,
    pub spending_period_hours: Option<i64>,
    pub circuit_json: Json,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub bindings: HasMany<super::api_key_upstreams::Entity>,
    #[sea_orm(has_many)]
    pub breaker_states: HasMany<super::circuit_breaker_states::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
