use autorouter_protocol::UsageCounters;
use autorouter_storage::BillingSnapshotUpsert;
use time::OffsetDateTime;

use crate::config::UpstreamConfig;
use crate::pricing::{PriceResolver, ResolvedPrice};

const CURRENCY: &str = "USD";
const TOKENS_PER_PRICE_UNIT: f64 = 1_000_000.0;

/// Everything the recorder needs from one completed request.
#[derive(Debug, Clone)]
pub struct BillingInput {
    pub request_log_id: String,
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub model: Option<String>,
    pub usage: Option<UsageCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbillableReason {
    ModelMissing,
    UsageMissing,
    PriceNotFound,
}

impl UnbillableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnbillableReason::ModelMissing => "model_missing",
            UnbillableReason::UsageMissing => "usage_missing",
            UnbillableReason::PriceNotFound => "price_not_found",
        }
    }
}

/// Finalizes usage into a cost snapshot. Pure given the resolver lookup;
/// the caller forwards the snapshot to the storage bus and, when billed,
/// the cost delta to the quota tracker.
pub fn finalize(
    pricing: &PriceResolver,
    upstream: Option<&UpstreamConfig>,
    input: BillingInput,
    now: OffsetDateTime,
) -> BillingSnapshotUpsert {
    let usage = input.usage.unwrap_or_default();
    let input_multiplier = upstream.map(|u| u.billing_input_multiplier).unwrap_or(1.0);
    let output_multiplier = upstream.map(|u| u.billing_output_multiplier).unwrap_or(1.0);

    let base = BillingSnapshotUpsert {
        request_log_id: input.request_log_id,
        api_key_id: input.api_key_id,
        upstream_id: input.upstream_id,
        model: input.model.clone(),
        billing_status: "unbilled".to_string(),
        unbillable_reason: None,
        price_source: None,
        input_price_per_million: None,
        output_price_per_million: None,
        cache_read_price_per_million: None,
        cache_write_price_per_million: None,
        input_multiplier,
        output_multiplier,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        cache_read_tokens: usage.cache_read_tokens,
        cache_write_tokens: usage.cache_write_tokens,
        final_cost: 0.0,
        currency: CURRENCY.to_string(),
        created_at: now,
    };

    let Some(model) = input.model.as_deref() else {
        return unbilled(base, UnbillableReason::ModelMissing);
    };
    if input.usage.is_none() || usage.is_zero() {
        return unbilled(base, UnbillableReason::UsageMissing);
    }
    let Some(price) = pricing.resolve(model) else {
        return unbilled(base, UnbillableReason::PriceNotFound);
    };

    let final_cost = compute_cost(&usage, &price, input_multiplier, output_multiplier);

    BillingSnapshotUpsert {
        billing_status: "billed".to_string(),
        price_source: Some(price.source.as_str().to_string()),
        input_price_per_million: Some(price.input_per_million),
        output_price_per_million: Some(price.output_per_million),
        cache_read_price_per_million: price.cache_read_per_million,
        cache_write_price_per_million: price.cache_write_per_million,
        final_cost,
        ..base
    }
}

fn unbilled(base: BillingSnapshotUpsert, reason: UnbillableReason) -> BillingSnapshotUpsert {
    BillingSnapshotUpsert {
        unbillable_reason: Some(reason.as_str().to_string()),
        ..base
    }
}

fn compute_cost(
    usage: &UsageCounters,
    price: &ResolvedPrice,
    input_multiplier: f64,
    output_multiplier: f64,
) -> f64 {
    let mut cost = usage.prompt_tokens as f64 / TOKENS_PER_PRICE_UNIT
        * price.input_per_million
        * input_multiplier
        + usage.completion_tokens as f64 / TOKENS_PER_PRICE_UNIT
            * price.output_per_million
            * output_multiplier;
    if let Some(cache_read) = price.cache_read_per_million {
        cost += usage.cache_read_tokens as f64 / TOKENS_PER_PRICE_UNIT * cache_read;
    }
    if let Some(cache_write) = price.cache_write_per_million {
        cost += usage.cache_write_tokens as f64 / TOKENS_PER_PRICE_UNIT * cache_write;
    }
    cost
}
