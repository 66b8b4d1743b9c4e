use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: i64,
    pub key_hash: String,
    pub key_prefix: String,
    pub sealed_secret: Option<String>,
    pub name: String,
    pub is_active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct BindingRow {
    pub api_key_id: i64,
    pub upstream_id: i64,
}

#[derive(Debug, Clone)]
pub struct UpstreamRow {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub sealed_credential: String,
    pub is_active: bool,
    pub provider_type: String,
    pub priority: i32,
    pub weight: i32,
    pub timeout_secs: i64,
    pub capabilities_json: JsonValue,
    pub allowed_models_json: Option<JsonValue>,
    pub model_redirects_json: JsonValue,
    pub affinity_json: Option<JsonValue>,
    pub exclude_status_codes_json: JsonValue,
    pub billing_input_multiplier: f64,
    pub billing_output_multiplier: f64,
    pub spending_limit: Option<f64>,
    pub spending_period_type: Option<String>,
    pub spending_period_hours: Option<i64>,
    pub circuit_json: JsonValue,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct BreakerStateRow {
    pub upstream_id: i64,
    pub state: String,
    pub failure_count: i32,
    pub success_count: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub opened_at: Option<OffsetDateTime>,
    pub last_probe_at: Option<OffsetDateTime>,
    pub config_json: JsonValue,
}

#[derive(Debug, Clone)]
pub struct CompensationRuleRow {
    pub id: i64,
    pub name: String,
    pub capabilities_json: JsonValue,
    pub target_header: String,
    pub sources_json: JsonValue,
    pub mode: String,
    pub is_builtin: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ModelPriceRow {
    pub model: String,
    pub source: String,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
    pub synced_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ManualOverrideRow {
    pub model: String,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
}

/// Everything the engine materializes into memory at boot or on admin
/// invalidation.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub api_keys: Vec<ApiKeyRow>,
    pub bindings: Vec<BindingRow>,
    pub upstreams: Vec<UpstreamRow>,
    pub breaker_states: Vec<BreakerStateRow>,
    pub compensation_rules: Vec<CompensationRuleRow>,
    pub model_prices: Vec<ModelPriceRow>,
    pub manual_overrides: Vec<ManualOverrideRow>,
}
