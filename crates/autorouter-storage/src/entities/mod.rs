pub mod api_key_upstreams;
pub mod api_keys;
pub mod billing_manual_overrides;
pub mod billing_model_prices;
pub mod circuit_breaker_states;
pub mod compensation_rules;
pub mod request_billing_snapshots;
pub mod request_logs;
pub mod upstreams;

pub use api_key_upstreams::Entity as ApiKeyUpstreams;
pub use api_keys::Entity as ApiKeys;
pub use billing_manual_overrides::Entity as BillingManualOverrides;
pub use billing_model_prices::Entity as BillingModelPrices;
pub use circuit_breaker_states::Entity as CircuitBreakerStates;
pub use compensation_rules::Entity as CompensationRules;
pub use request_billing_snapshots::Entity as RequestBillingSnapshots;
pub use request_logs::Entity as RequestLogs;
pub use upstreams::Entity as Upstreams;
