use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use autorouter_common::Settings;
use autorouter_storage::{StorageSnapshot, Store};

use crate::affinity::AffinityTracker;
use crate::auth::KeyStore;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::compensation::CompensationEngine;
use crate::config::UpstreamConfig;
use crate::crypto::{CredentialCipher, CryptoError};
use crate::pricing::PriceResolver;
use crate::quota::QuotaTracker;

/// One upstream's hot-path state: parsed config plus its breaker. The
/// breaker instance survives config reloads so counters are not lost on
/// unrelated admin edits.
pub struct UpstreamRuntime {
    pub config: UpstreamConfig,
    pub breaker: Arc<CircuitBreaker>,
}

pub struct AppState {
    pub settings: Settings,
    pub cipher: CredentialCipher,
    pub keys: KeyStore,
    pub upstreams: ArcSwap<HashMap<i64, Arc<UpstreamRuntime>>>,
    pub quota: QuotaTracker,
    pub affinity: AffinityTracker,
    pub pricing: PriceResolver,
    pub compensation: CompensationEngine,
}

impl AppState {
    pub fn from_snapshot(
        settings: Settings,
        snapshot: &StorageSnapshot,
        store: Store,
    ) -> anyhow::Result<Self> {
        let cipher = CredentialCipher::from_key_material(&settings.encryption_key)
            .map_err(|err: CryptoError| anyhow::anyhow!(err))?;
        let keys = KeyStore::from_snapshot(snapshot);
        let upstreams = build_upstreams(snapshot, None)?;

        let quota = QuotaTracker::new();
        let configs: Vec<UpstreamConfig> =
            upstreams.values().map(|rt| rt.config.clone()).collect();
        quota.configure(&configs);

        let pricing = PriceResolver::new();
        pricing.replace(&snapshot.model_prices, &snapshot.manual_overrides);

        let affinity = AffinityTracker::new(Duration::from_secs(settings.affinity_retention_secs));
        let compensation = CompensationEngine::new(store, &snapshot.compensation_rules);

        Ok(Self {
            settings,
            cipher,
            keys,
            upstreams: ArcSwap::from_pointee(upstreams),
            quota,
            affinity,
            pricing,
            compensation,
        })
    }

    /// Re-materializes config-shaped state after an admin mutation.
    /// Breakers for surviving upstreams keep their in-memory state.
    pub fn apply_snapshot(&self, snapshot: &StorageSnapshot) -> anyhow::Result<()> {
        let previous = self.upstreams.load_full();
        let upstreams = build_upstreams(snapshot, Some(previous.as_ref()))?;

        let configs: Vec<UpstreamConfig> =
            upstreams.values().map(|rt| rt.config.clone()).collect();
        self.quota.configure(&configs);
        self.pricing
            .replace(&snapshot.model_prices, &snapshot.manual_overrides);
        self.keys.replace(snapshot);
        self.upstreams.store(Arc::new(upstreams));
        self.compensation.invalidate();
        Ok(())
    }

    pub fn upstream(&self, id: i64) -> Option<Arc<UpstreamRuntime>> {
        self.upstreams.load().get(&id).cloned()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.load().len()
    }

    /// Widest rolling horizon (hours) any configured rule needs; the quota
    /// rebuild scan uses `max(24h, month-to-date, this)`.
    pub fn max_rolling_hours(&self) -> i64 {
        self.upstreams
            .load()
            .values()
            .filter_map(|rt| rt.config.spending)
            .filter_map(|rule| match rule.period {
                crate::config::SpendingPeriod::Rolling { hours } => Some(hours),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }
}

fn build_upstreams(
    snapshot: &StorageSnapshot,
    previous: Option<&HashMap<i64, Arc<UpstreamRuntime>>>,
) -> anyhow::Result<HashMap<i64, Arc<UpstreamRuntime>>> {
    let mut upstreams = HashMap::with_capacity(snapshot.upstreams.len());
    for row in &snapshot.upstreams {
        let config = UpstreamConfig::from_row(row)?;
        let breaker = match previous.and_then(|map| map.get(&row.id)) {
            Some(existing) => existing.breaker.clone(),
            None => Arc::new(restore_breaker(snapshot, &config)),
        };
        upstreams.insert(
            row.id,
            Arc::new(UpstreamRuntime { config, breaker }),
        );
    }
    Ok(upstreams)
}

/// Rebuilds the breaker from its persisted tuple; absent rows start closed
/// with the upstream's configured (or default) circuit settings.
fn restore_breaker(snapshot: &StorageSnapshot, config: &UpstreamConfig) -> CircuitBreaker {
    let persisted = snapshot
        .breaker_states
        .iter()
        .find(|row| row.upstream_id == config.id);
    match persisted {
        Some(row) => {
            let state = BreakerState::parse(&row.state).unwrap_or(BreakerState::Closed);
            // The live upstream config wins over the tuple persisted next to
            // the state; only the counters and timestamps are restored.
            CircuitBreaker::restore(
                config.id,
                config.circuit,
                state,
                row.failure_count.max(0) as u32,
                row.success_count.max(0) as u32,
                row.last_failure_at,
                row.opened_at,
                row.last_probe_at,
            )
        }
        None => CircuitBreaker::new(config.id, config.circuit),
    }
}
