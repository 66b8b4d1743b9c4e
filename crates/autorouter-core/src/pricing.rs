use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use autorouter_storage::{ManualOverrideRow, ModelPriceRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Manual,
    Litellm,
    Openrouter,
}

impl PriceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceSource::Manual => "manual",
            PriceSource::Litellm => "litellm",
            PriceSource::Openrouter => "openrouter",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(PriceSource::Manual),
            "litellm" => Some(PriceSource::Litellm),
            "openrouter" => Some(PriceSource::Openrouter),
            _ => None,
        }
    }
}

/// Model price in dollars per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: Option<f64>,
    pub cache_write_per_million: Option<f64>,
    pub source: PriceSource,
}

#[derive(Debug, Default)]
struct PriceCatalog {
    overrides: HashMap<String, ResolvedPrice>,
    synced: HashMap<String, ResolvedPrice>,
}

/// Manual override beats the synced catalog; within the catalog the most
/// recently synced active row wins.
#[derive(Default)]
pub struct PriceResolver {
    catalog: ArcSwap<PriceCatalog>,
}

impl PriceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, prices: &[ModelPriceRow], overrides: &[ManualOverrideRow]) {
        let mut catalog = PriceCatalog::default();

        let mut newest: HashMap<&str, &ModelPriceRow> = HashMap::new();
        for row in prices {
            match newest.get(row.model.as_str()) {
                Some(existing) if existing.synced_at >= row.synced_at => {}
                _ => {
                    newest.insert(row.model.as_str(), row);
                }
            }
        }
        for (model, row) in newest {
            let Some(source) = PriceSource::parse(&row.source) else {
                continue;
            };
            catalog.synced.insert(
                model.to_string(),
                ResolvedPrice {
                    input_per_million: row.input_price_per_million,
                    output_per_million: row.output_price_per_million,
                    cache_read_per_million: row.cache_read_price_per_million,
                    cache_write_per_million: row.cache_write_price_per_million,
                    source,
                },
            );
        }

        for row in overrides {
            catalog.overrides.insert(
                row.model.clone(),
                ResolvedPrice {
                    input_per_million: row.input_price_per_million,
                    output_per_million: row.output_price_per_million,
                    cache_read_per_million: row.cache_read_price_per_million,
                    cache_write_per_million: row.cache_write_price_per_million,
                    source: PriceSource::Manual,
                },
            );
        }

        self.catalog.store(Arc::new(catalog));
    }

    pub fn resolve(&self, model: &str) -> Option<ResolvedPrice> {
        let catalog = self.catalog.load();
        catalog
            .overrides
            .get(model)
            .or_else(|| catalog.synced.get(model))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn price_row(model: &str, source: &str, input: f64, synced_at: OffsetDateTime) -> ModelPriceRow {
        ModelPriceRow {
            model: model.to_string(),
            source: source.to_string(),
            input_price_per_million: input,
            output_price_per_million: input * 4.0,
            cache_read_price_per_million: None,
            cache_write_price_per_million: None,
            synced_at,
        }
    }

    #[test]
    fn manual_override_beats_synced_catalog() {
        let resolver = PriceResolver::new();
        resolver.replace(
            &[price_row("gpt-4.1", "litellm", 2.0, OffsetDateTime::UNIX_EPOCH)],
            &[ManualOverrideRow {
                model: "gpt-4.1".to_string(),
                input_price_per_million: 1.5,
                output_price_per_million: 6.0,
                cache_read_price_per_million: Some(0.5),
                cache_write_price_per_million: None,
            }],
        );
        let price = resolver.resolve("gpt-4.1").unwrap();
        assert_eq!(price.source, PriceSource::Manual);
        assert_eq!(price.input_per_million, 1.5);
        assert_eq!(price.cache_read_per_million, Some(0.5));
    }

    #[test]
    fn newest_synced_row_wins() {
        let resolver = PriceResolver::new();
        let older = OffsetDateTime::UNIX_EPOCH;
        let newer = older + time::Duration::days(1);
        resolver.replace(
            &[
                price_row("gpt-4.1", "litellm", 2.0, older),
                price_row("gpt-4.1", "openrouter", 3.0, newer),
            ],
            &[],
        );
        let price = resolver.resolve("gpt-4.1").unwrap();
        assert_eq!(price.source, PriceSource::Openrouter);
        assert_eq!(price.input_per_million, 3.0);
    }

    #[test]
    fn unknown_model_resolves_to_none() {
        let resolver = PriceResolver::new();
        resolver.replace(&[], &[]);
        assert!(resolver.resolve("unpriced-model").is_none());
    }
}
