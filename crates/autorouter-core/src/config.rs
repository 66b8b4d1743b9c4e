use std::collections::{HashMap, HashSet};
use std::time::Duration;

use autorouter_protocol::{ProviderFamily, RouteCapability};
use autorouter_storage::UpstreamRow;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamConfigError {
    #[error("upstream {0}: unknown provider type {1:?}")]
    UnknownProviderType(String, String),
    #[error("upstream {0}: unknown capability tag {1:?}")]
    UnknownCapability(String, String),
    #[error("upstream {0}: capabilities span more than one provider family")]
    MixedCapabilityFamilies(String),
    #[error("upstream {0}: capability {1:?} does not belong to provider family {2:?}")]
    CapabilityFamilyMismatch(String, String, String),
    #[error("upstream {0}: rolling spending period requires hours in 1..=8760, got {1}")]
    BadRollingHours(String, i64),
    #[error("upstream {0}: unknown spending period type {1:?}")]
    UnknownSpendingPeriod(String, String),
}

/// Circuit-breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub probe_interval: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
        }
    }
}

impl CircuitConfig {
    /// Older deployments stored durations in milliseconds; current ones use
    /// seconds. Values ≤300 (open) / ≤60 (probe) are seconds, larger values
    /// milliseconds.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let defaults = Self::default();
        let failure_threshold = value
            .get("failure_threshold")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(defaults.failure_threshold);
        let success_threshold = value
            .get("success_threshold")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(defaults.success_threshold);
        let open_duration = value
            .get("open_duration")
            .and_then(|v| v.as_u64())
            .map(|raw| normalize_duration(raw, 300))
            .unwrap_or(defaults.open_duration);
        let probe_interval = value
            .get("probe_interval")
            .and_then(|v| v.as_u64())
            .map(|raw| normalize_duration(raw, 60))
            .unwrap_or(defaults.probe_interval);
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_duration,
            probe_interval,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "failure_threshold": self.failure_threshold,
            "success_threshold": self.success_threshold,
            "open_duration": self.open_duration.as_secs(),
            "probe_interval": self.probe_interval.as_secs(),
        })
    }
}

fn normalize_duration(raw: u64, seconds_cutoff: u64) -> Duration {
    if raw <= seconds_cutoff {
        Duration::from_secs(raw)
    } else {
        Duration::from_millis(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityMetric {
    Tokens,
    #[default]
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffinityMigration {
    pub enabled: bool,
    pub metric: AffinityMetric,
    pub threshold: i64,
}

impl AffinityMigration {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        let enabled = value.get("enabled")?.as_bool()?;
        // `tokens` is explicit opt-in; anything else falls back to length.
        let metric = match value.get("metric").and_then(|v| v.as_str()) {
            Some("tokens") => AffinityMetric::Tokens,
            _ => AffinityMetric::Length,
        };
        let threshold = value.get("threshold").and_then(|v| v.as_i64())?;
        Some(Self {
            enabled,
            metric,
            threshold,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpendingPeriod {
    Daily,
    Monthly,
    Rolling { hours: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendingRule {
    pub limit: f64,
    pub period: SpendingPeriod,
}

/// Typed view of one upstream row, validated per the registry rules.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub sealed_credential: String,
    pub is_active: bool,
    pub family: ProviderFamily,
    pub priority: i32,
    pub weight: i32,
    pub timeout: Duration,
    /// Declared tags; empty means "everything the family offers".
    pub capabilities: Vec<RouteCapability>,
    pub allowed_models: Option<HashSet<String>>,
    pub model_redirects: HashMap<String, String>,
    pub affinity: Option<AffinityMigration>,
    pub exclude_status_codes: Vec<u16>,
    pub billing_input_multiplier: f64,
    pub billing_output_multiplier: f64,
    pub spending: Option<SpendingRule>,
    pub circuit: CircuitConfig,
}

impl UpstreamConfig {
    pub fn from_row(row: &UpstreamRow) -> Result<Self, UpstreamConfigError> {
        let family = parse_family(&row.provider_type).ok_or_else(|| {
            UpstreamConfigError::UnknownProviderType(row.name.clone(), row.provider_type.clone())
        })?;

        let mut capabilities = Vec::new();
        if let Some(tags) = row.capabilities_json.as_array() {
            for tag in tags {
                let tag = tag.as_str().unwrap_or_default();
                let capability = RouteCapability::parse(tag).ok_or_else(|| {
                    UpstreamConfigError::UnknownCapability(row.name.clone(), tag.to_string())
                })?;
                capabilities.push(capability);
            }
        }
        validate_capabilities(&row.name, family, &capabilities)?;

        let allowed_models = row.allowed_models_json.as_ref().map(|value| {
            value
                .as_array()
                .map(|models| {
                    models
                        .iter()
                        .filter_map(|m| m.as_str())
                        .map(|m| m.to_string())
                        .collect::<HashSet<_>>()
                })
                .unwrap_or_default()
        });

        let model_redirects = row
            .model_redirects_json
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(from, to)| Some((from.clone(), to.as_str()?.to_string())))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();

        let exclude_status_codes = row
            .exclude_status_codes_json
            .as_array()
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(|c| c.as_u64())
                    .filter_map(|c| u16::try_from(c).ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let spending = match (&row.spending_limit, row.spending_period_type.as_deref()) {
            (Some(limit), Some(period_type)) => {
                let period = match period_type {
                    "daily" => SpendingPeriod::Daily,
                    "monthly" => SpendingPeriod::Monthly,
                    "rolling" => {
                        let hours = row.spending_period_hours.unwrap_or(0);
                        if !(1..=8760).contains(&hours) {
                            return Err(UpstreamConfigError::BadRollingHours(
                                row.name.clone(),
                                hours,
                            ));
                        }
                        SpendingPeriod::Rolling { hours }
                    }
                    other => {
                        return Err(UpstreamConfigError::UnknownSpendingPeriod(
                            row.name.clone(),
                            other.to_string(),
                        ));
                    }
                };
                Some(SpendingRule {
                    limit: *limit,
                    period,
                })
            }
            _ => None,
        };

        Ok(Self {
            id: row.id,
            name: row.name.clone(),
            base_url: row.base_url.trim_end_matches('/').to_string(),
            sealed_credential: row.sealed_credential.clone(),
            is_active: row.is_active,
            family,
            priority: row.priority,
            weight: row.weight,
            timeout: Duration::from_secs(row.timeout_secs.max(1) as u64),
            capabilities,
            allowed_models,
            model_redirects,
            affinity: row.affinity_json.as_ref().and_then(AffinityMigration::from_json),
            exclude_status_codes,
            billing_input_multiplier: row.billing_input_multiplier,
            billing_output_multiplier: row.billing_output_multiplier,
            spending,
            circuit: CircuitConfig::from_json(&row.circuit_json),
        })
    }

    /// Capability eligibility with default-by-provider expansion for an
    /// empty declared set.
    pub fn supports(&self, capability: RouteCapability) -> bool {
        if self.capabilities.is_empty() {
            self.family.capabilities().contains(&capability)
        } else {
            self.capabilities.contains(&capability)
        }
    }

    /// Upstream-side model name after redirection.
    pub fn redirect_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_redirects
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    /// Whitelist check on the post-redirect model name.
    pub fn allows_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            Some(allowed) => allowed.contains(self.redirect_model(model)),
            None => true,
        }
    }

    pub fn excludes_status(&self, status: u16) -> bool {
        self.exclude_status_codes.contains(&status)
    }
}

fn parse_family(value: &str) -> Option<ProviderFamily> {
    match value {
        "anthropic" => Some(ProviderFamily::Anthropic),
        "openai" => Some(ProviderFamily::Openai),
        "gemini" => Some(ProviderFamily::Gemini),
        _ => None,
    }
}

fn validate_capabilities(
    name: &str,
    family: ProviderFamily,
    capabilities: &[RouteCapability],
) -> Result<(), UpstreamConfigError> {
    let mut families: Vec<ProviderFamily> =
        capabilities.iter().map(|c| c.family()).collect();
    families.dedup();
    if families.len() > 1 {
        return Err(UpstreamConfigError::MixedCapabilityFamilies(name.to_string()));
    }
    for capability in capabilities {
        if capability.family() != family {
            return Err(UpstreamConfigError::CapabilityFamilyMismatch(
                name.to_string(),
                capability.as_str().to_string(),
                family.as_str().to_string(),
            ));
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn row() -> UpstreamRow {
        UpstreamRow {
            id: 1,
            name: "primary".to_string(),
            base_url: "https://upstream.example/".to_string(),
            sealed_credential: "sealed".to_string(),
            is_active: true,
            provider_type: "openai".to_string(),
            priority: 0,
            weight: 1,
            timeout_secs: 30,
            capabilities_json: serde_json::json!(["openai_chat_compatible"]),
            allowed_models_json: None,
            model_redirects_json: serde_json::json!({ "gpt-4.1": "gpt-4.1-mini" }),
            affinity_json: None,
            exclude_status_codes_json: serde_json::json!([529]),
            billing_input_multiplier: 1.0,
            billing_output_multiplier: 1.0,
            spending_limit: None,
            spending_period_type: None,
            spending_period_hours: None,
            circuit_json: serde_json::json!({}),
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn parses_and_normalizes_the_happy_row() {
        let config = UpstreamConfig::from_row(&row()).unwrap();
        assert_eq!(config.base_url, "https://upstream.example");
        assert_eq!(config.redirect_model("gpt-4.1"), "gpt-4.1-mini");
        assert!(config.supports(RouteCapability::OpenaiChatCompatible));
        assert!(!config.supports(RouteCapability::AnthropicMessages));
        assert!(config.excludes_status(529));
        assert_eq!(config.circuit, CircuitConfig::default());
    }

    #[test]
    fn empty_capability_set_expands_to_the_family() {
        let mut row = row();
        row.capabilities_json = serde_json::json!([]);
        let config = UpstreamConfig::from_row(&row).unwrap();
        assert!(config.supports(RouteCapability::OpenaiChatCompatible));
        assert!(config.supports(RouteCapability::CodexResponses));
        assert!(config.supports(RouteCapability::OpenaiExtended));
        assert!(!config.supports(RouteCapability::GeminiNativeGenerate));
    }

    #[test]
    fn cross_family_capability_is_rejected() {
        let mut row = row();
        row.capabilities_json =
            serde_json::json!(["openai_chat_compatible", "anthropic_messages"]);
        assert!(matches!(
            UpstreamConfig::from_row(&row),
            Err(UpstreamConfigError::MixedCapabilityFamilies(_))
        ));
    }

    #[test]
    fn capability_must_match_the_provider_type() {
        let mut row = row();
        row.capabilities_json = serde_json::json!(["anthropic_messages"]);
        assert!(matches!(
            UpstreamConfig::from_row(&row),
            Err(UpstreamConfigError::CapabilityFamilyMismatch(..))
        ));
    }

    #[test]
    fn rolling_hours_bounds_are_enforced() {
        let mut row = row();
        row.spending_limit = Some(5.0);
        row.spending_period_type = Some("rolling".to_string());
        row.spending_period_hours = Some(0);
        assert!(matches!(
            UpstreamConfig::from_row(&row),
            Err(UpstreamConfigError::BadRollingHours(_, 0))
        ));

        row.spending_period_hours = Some(8760);
        let config = UpstreamConfig::from_row(&row).unwrap();
        assert_eq!(
            config.spending.unwrap().period,
            SpendingPeriod::Rolling { hours: 8760 }
        );
    }

    #[test]
    fn legacy_millisecond_durations_are_normalized() {
        let config = CircuitConfig::from_json(&serde_json::json!({
            "open_duration": 30_000,
            "probe_interval": 10_000,
        }));
        assert_eq!(config.open_duration, Duration::from_secs(30));
        assert_eq!(config.probe_interval, Duration::from_secs(10));

        let config = CircuitConfig::from_json(&serde_json::json!({
            "open_duration": 300,
            "probe_interval": 60,
        }));
        assert_eq!(config.open_duration, Duration::from_secs(300));
        assert_eq!(config.probe_interval, Duration::from_secs(60));

        let config = CircuitConfig::from_json(&serde_json::json!({
            "open_duration": 301,
        }));
        assert_eq!(config.open_duration, Duration::from_millis(301));
    }

    #[test]
    fn allowed_models_checked_after_redirect() {
        let mut row = row();
        row.allowed_models_json = Some(serde_json::json!(["gpt-4.1-mini"]));
        let config = UpstreamConfig::from_row(&row).unwrap();
        // Requested name redirects into the whitelist.
        assert!(config.allows_model("gpt-4.1"));
        assert!(config.allows_model("gpt-4.1-mini"));
        assert!(!config.allows_model("gpt-3.5-turbo"));
    }

    #[test]
    fn affinity_metric_defaults_to_length() {
        let mut row = row();
        row.affinity_json = Some(serde_json::json!({ "enabled": true, "threshold": 4000 }));
        let config = UpstreamConfig::from_row(&row).unwrap();
        let affinity = config.affinity.unwrap();
        assert_eq!(affinity.metric, AffinityMetric::Length);

        row.affinity_json =
            Some(serde_json::json!({ "enabled": true, "metric": "tokens", "threshold": 4000 }));
        let config = UpstreamConfig::from_row(&row).unwrap();
        assert_eq!(config.affinity.unwrap().metric, AffinityMetric::Tokens);
    }
}
