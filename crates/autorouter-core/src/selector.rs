use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use autorouter_protocol::RouteCapability;
use rand::Rng;
use time::OffsetDateTime;

use crate::affinity::AffinityTracker;
use crate::auth::AuthContext;
use crate::breaker::BreakerSkip;
use crate::config::AffinityMetric;
use crate::quota::QuotaTracker;
use crate::state::UpstreamRuntime;

/// Why a bound, capability-eligible upstream was not offered as a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CircuitOpen,
    ProbeBusy,
    QuotaExceeded,
    ModelNotAllowed,
    ZeroWeight,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::ProbeBusy => "probe_busy",
            SkipReason::QuotaExceeded => "quota_exceeded",
            SkipReason::ModelNotAllowed => "model_not_allowed",
            SkipReason::ZeroWeight => "zero_weight",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandidateSkip {
    pub upstream_id: i64,
    pub upstream_name: String,
    pub reason: SkipReason,
}

/// Why the selector produced no candidates at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionEmpty {
    /// Nothing in the upstream table at all.
    NoUpstreamsConfigured,
    /// The key's binding set contains no active, capability-eligible
    /// upstream for this route.
    NoAuthorizedUpstreams,
    /// Eligible upstreams existed but every one was filtered unhealthy
    /// (circuit, quota, model, weight).
    NoHealthyCandidates,
}

/// Pull-based ordered candidate stream: priority tiers ascending, weighted
/// random without replacement inside a tier, affinity pulled to the front of
/// its tier. Advances only when the failover loop asks for the next pick.
pub struct CandidateSelector {
    tiers: BTreeMap<i32, Vec<Arc<UpstreamRuntime>>>,
    /// Session-bound candidate, pulled to the front of its own tier.
    affinity_front: Option<(i32, Arc<UpstreamRuntime>)>,
    pub skips: Vec<CandidateSkip>,
    pub affinity_applied: bool,
    pub affinity_migrated: bool,
    empty_verdict: Option<SelectionEmpty>,
}

impl CandidateSelector {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        auth: &AuthContext,
        capability: RouteCapability,
        requested_model: Option<&str>,
        upstreams: &HashMap<i64, Arc<UpstreamRuntime>>,
        quota: &QuotaTracker,
        affinity: &AffinityTracker,
        session_key: Option<&str>,
        now: OffsetDateTime,
    ) -> Self {
        let mut skips = Vec::new();
        let mut tiers: BTreeMap<i32, Vec<Arc<UpstreamRuntime>>> = BTreeMap::new();
        let mut any_eligible = false;

        for upstream_id in auth.upstream_ids.iter() {
            let Some(runtime) = upstreams.get(upstream_id) else {
                continue;
            };
            let config = &runtime.config;
            if !config.is_active || !config.supports(capability) {
                continue;
            }
            any_eligible = true;

            if config.weight <= 0 {
                skips.push(skip(runtime, SkipReason::ZeroWeight));
                continue;
            }
            if let Some(model) = requested_model
                && !config.allows_model(model)
            {
                skips.push(skip(runtime, SkipReason::ModelNotAllowed));
                continue;
            }
            if let Err(gate) = runtime.breaker.would_admit(now) {
                let reason = match gate {
                    BreakerSkip::Open => SkipReason::CircuitOpen,
                    BreakerSkip::ProbeBusy => SkipReason::ProbeBusy,
                };
                skips.push(skip(runtime, reason));
                continue;
            }
            if quota.is_exceeded(config.id, now) {
                skips.push(skip(runtime, SkipReason::QuotaExceeded));
                continue;
            }

            tiers.entry(config.priority).or_default().push(runtime.clone());
        }

        let empty_verdict = if !tiers.is_empty() {
            None
        } else if upstreams.is_empty() {
            Some(SelectionEmpty::NoUpstreamsConfigured)
        } else if !any_eligible {
            Some(SelectionEmpty::NoAuthorizedUpstreams)
        } else {
            Some(SelectionEmpty::NoHealthyCandidates)
        };

        let mut selector = Self {
            tiers,
            affinity_front: None,
            skips,
            affinity_applied: false,
            affinity_migrated: false,
            empty_verdict,
        };
        selector.apply_affinity(affinity, session_key, now);
        selector
    }

    /// Sticky-session exception: a live binding to a still-eligible
    /// upstream moves to the front of its tier unless the session crossed
    /// its migration threshold, in which case the binding is dropped and
    /// normal ordering resumes.
    fn apply_affinity(
        &mut self,
        affinity: &AffinityTracker,
        session_key: Option<&str>,
        now: OffsetDateTime,
    ) {
        let Some(session_key) = session_key else {
            return;
        };
        let Some(hit) = affinity.lookup(session_key, now) else {
            return;
        };

        let Some((tier, index)) = self.tiers.iter().find_map(|(tier, candidates)| {
            candidates
                .iter()
                .position(|candidate| candidate.config.id == hit.upstream_id)
                .map(|index| (*tier, index))
        }) else {
            return;
        };

        let runtime = self.tiers.get(&tier).map(|c| c[index].clone());
        let Some(runtime) = runtime else { return };

        if let Some(migration) = runtime.config.affinity
            && migration.enabled
        {
            let observed = match migration.metric {
                AffinityMetric::Tokens => hit.total_tokens,
                AffinityMetric::Length => hit.total_chars,
            };
            if observed >= migration.threshold {
                affinity.drop_session(session_key);
                self.affinity_migrated = true;
                return;
            }
        }

        if let Some(candidates) = self.tiers.get_mut(&tier) {
            candidates.remove(index);
            if candidates.is_empty() {
                self.tiers.remove(&tier);
            }
        }
        self.affinity_front = Some((tier, runtime));
        self.affinity_applied = true;
    }

    pub fn empty_verdict(&self) -> Option<SelectionEmpty> {
        self.empty_verdict
    }

    /// Upstream the session is stuck to, when affinity applied.
    pub fn affinity_upstream_id(&self) -> Option<i64> {
        self.affinity_front
            .as_ref()
            .map(|(_, runtime)| runtime.config.id)
    }

    /// Draws the next candidate; proportional to weight among the untried
    /// members of the lowest remaining tier, with the affinity candidate
    /// served first within its own tier.
    pub fn next(&mut self, rng: &mut impl Rng) -> Option<Arc<UpstreamRuntime>> {
        let lowest_tier = self.tiers.keys().next().copied();
        if let Some((affinity_tier, _)) = &self.affinity_front
            && lowest_tier.map(|tier| *affinity_tier <= tier).unwrap_or(true)
        {
            return self.affinity_front.take().map(|(_, runtime)| runtime);
        }

        let tier = *self.tiers.keys().next()?;
        let candidates = self.tiers.get_mut(&tier)?;

        let total: i64 = candidates.iter().map(|c| c.config.weight as i64).sum();
        let index = if total <= 0 {
            0
        } else {
            let mut roll = rng.random_range(0..total);
            let mut chosen = 0;
            for (i, candidate) in candidates.iter().enumerate() {
                roll -= candidate.config.weight as i64;
                if roll < 0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        let picked = candidates.remove(index);
        if candidates.is_empty() {
            self.tiers.remove(&tier);
        }
        Some(picked)
    }

    /// Remaining candidate count (affinity front included).
    pub fn remaining(&self) -> usize {
        self.tiers.values().map(Vec::len).sum::<usize>()
            + usize::from(self.affinity_front.is_some())
    }
}

fn skip(runtime: &Arc<UpstreamRuntime>, reason: SkipReason) -> CandidateSkip {
    CandidateSkip {
        upstream_id: runtime.config.id,
        upstream_name: runtime.config.name.clone(),
        reason,
    }
}
