use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autorouter_core::affinity::AffinityTracker;
use autorouter_core::auth::AuthContext;
use autorouter_core::breaker::CircuitBreaker;
use autorouter_core::config::UpstreamConfig;
use autorouter_core::quota::QuotaTracker;
use autorouter_core::selector::{CandidateSelector, SelectionEmpty, SkipReason};
use autorouter_core::state::UpstreamRuntime;
use autorouter_protocol::RouteCapability;
use autorouter_storage::UpstreamRow;
use rand::SeedableRng;
use rand::rngs::StdRng;
use time::OffsetDateTime;

const T0: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

struct UpstreamSpec {
    id: i64,
    priority: i32,
    weight: i32,
}

fn runtime(spec: UpstreamSpec) -> Arc<UpstreamRuntime> {
    runtime_with(spec, |_| {})
}

fn runtime_with(
    spec: UpstreamSpec,
    mutate: impl FnOnce(&mut UpstreamRow),
) -> Arc<UpstreamRuntime> {
    let mut row = UpstreamRow {
        id: spec.id,
        name: format!("upstream-{}", spec.id),
        base_url: "https://upstream.example".to_string(),
        sealed_credential: "sealed".to_string(),
        is_active: true,
        provider_type: "openai".to_string(),
        priority: spec.priority,
        weight: spec.weight,
        timeout_secs: 30,
        capabilities_json: serde_json::json!(["openai_chat_compatible"]),
        allowed_models_json: None,
        model_redirects_json: serde_json::json!({}),
        affinity_json: None,
        exclude_status_codes_json: serde_json::json!([]),
        billing_input_multiplier: 1.0,
        billing_output_multiplier: 1.0,
        spending_limit: None,
        spending_period_type: None,
        spending_period_hours: None,
        circuit_json: serde_json::json!({}),
        updated_at: T0,
    };
    mutate(&mut row);
    let config = UpstreamConfig::from_row(&row).unwrap();
    let breaker = Arc::new(CircuitBreaker::new(config.id, config.circuit));
    Arc::new(UpstreamRuntime { config, breaker })
}

fn table(runtimes: Vec<Arc<UpstreamRuntime>>) -> HashMap<i64, Arc<UpstreamRuntime>> {
    runtimes
        .into_iter()
        .map(|runtime| (runtime.config.id, runtime))
        .collect()
}

fn auth(upstream_ids: Vec<i64>) -> AuthContext {
    AuthContext {
        api_key_id: 1,
        key_name: "test-key".to_string(),
        upstream_ids: Arc::new(upstream_ids),
    }
}

fn build<'a>(
    auth_ctx: &AuthContext,
    model: Option<&'a str>,
    upstreams: &HashMap<i64, Arc<UpstreamRuntime>>,
    quota: &QuotaTracker,
    affinity: &AffinityTracker,
    session: Option<&'a str>,
) -> CandidateSelector {
    CandidateSelector::build(
        auth_ctx,
        RouteCapability::OpenaiChatCompatible,
        model,
        upstreams,
        quota,
        affinity,
        session,
        T0,
    )
}

fn drain(selector: &mut CandidateSelector, rng: &mut StdRng) -> Vec<i64> {
    let mut order = Vec::new();
    while let Some(candidate) = selector.next(rng) {
        order.push(candidate.config.id);
    }
    order
}

#[test]
fn priority_tiers_drain_in_ascending_order() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 1, weight: 1 }),
        runtime(UpstreamSpec { id: 2, priority: 0, weight: 1 }),
        runtime(UpstreamSpec { id: 3, priority: 2, weight: 1 }),
        runtime(UpstreamSpec { id: 4, priority: 0, weight: 1 }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    let auth_ctx = auth(vec![1, 2, 3, 4]);

    let mut rng = StdRng::seed_from_u64(7);
    let mut selector = build(&auth_ctx, None, &upstreams, &quota, &affinity, None);
    let order = drain(&mut selector, &mut rng);

    assert_eq!(order.len(), 4);
    let tier_of = |id: i64| match id {
        2 | 4 => 0,
        1 => 1,
        _ => 2,
    };
    let tiers: Vec<i32> = order.iter().map(|id| tier_of(*id)).collect();
    let mut sorted = tiers.clone();
    sorted.sort_unstable();
    assert_eq!(tiers, sorted, "tiers must drain lowest-first: {order:?}");
}

#[test]
fn zero_weight_upstreams_are_excluded() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 0, weight: 0 }),
        runtime(UpstreamSpec { id: 2, priority: 0, weight: 1 }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    let auth_ctx = auth(vec![1, 2]);

    let mut rng = StdRng::seed_from_u64(1);
    let mut selector = build(&auth_ctx, None, &upstreams, &quota, &affinity, None);
    assert_eq!(drain(&mut selector, &mut rng), vec![2]);
    assert!(selector
        .skips
        .iter()
        .any(|skip| skip.upstream_id == 1 && skip.reason == SkipReason::ZeroWeight));
}

#[test]
fn equal_weights_pick_roughly_uniformly() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 0, weight: 1 }),
        runtime(UpstreamSpec { id: 2, priority: 0, weight: 1 }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    let auth_ctx = auth(vec![1, 2]);

    let mut rng = StdRng::seed_from_u64(42);
    let mut first_picks = [0u32; 2];
    for _ in 0..2000 {
        let mut selector = build(&auth_ctx, None, &upstreams, &quota, &affinity, None);
        let first = selector.next(&mut rng).unwrap().config.id;
        first_picks[(first - 1) as usize] += 1;
    }
    // 2000 draws at p=0.5; anything within a generous band passes.
    assert!(
        (800..=1200).contains(&first_picks[0]),
        "distribution skewed: {first_picks:?}"
    );
}

#[test]
fn heavier_weights_win_more_often() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 0, weight: 9 }),
        runtime(UpstreamSpec { id: 2, priority: 0, weight: 1 }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    let auth_ctx = auth(vec![1, 2]);

    let mut rng = StdRng::seed_from_u64(11);
    let mut heavy_first = 0u32;
    for _ in 0..1000 {
        let mut selector = build(&auth_ctx, None, &upstreams, &quota, &affinity, None);
        if selector.next(&mut rng).unwrap().config.id == 1 {
            heavy_first += 1;
        }
    }
    assert!(heavy_first > 800, "weight-9 picked first only {heavy_first}/1000");
}

#[test]
fn unbound_and_inactive_upstreams_never_appear() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 0, weight: 1 }),
        runtime_with(UpstreamSpec { id: 2, priority: 0, weight: 1 }, |row| {
            row.is_active = false;
        }),
        runtime(UpstreamSpec { id: 3, priority: 0, weight: 1 }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    // Key bound to 1 and 2 only; 2 is inactive.
    let auth_ctx = auth(vec![1, 2]);

    let mut rng = StdRng::seed_from_u64(3);
    let mut selector = build(&auth_ctx, None, &upstreams, &quota, &affinity, None);
    assert_eq!(drain(&mut selector, &mut rng), vec![1]);
}

#[test]
fn model_whitelist_filters_after_redirect() {
    let upstreams = table(vec![
        runtime_with(UpstreamSpec { id: 1, priority: 0, weight: 1 }, |row| {
            row.allowed_models_json = Some(serde_json::json!(["gpt-4.1-mini"]));
            row.model_redirects_json = serde_json::json!({ "gpt-4.1": "gpt-4.1-mini" });
        }),
        runtime_with(UpstreamSpec { id: 2, priority: 0, weight: 1 }, |row| {
            row.allowed_models_json = Some(serde_json::json!(["o3"]));
        }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    let auth_ctx = auth(vec![1, 2]);

    let mut rng = StdRng::seed_from_u64(5);
    let mut selector = build(&auth_ctx, Some("gpt-4.1"), &upstreams, &quota, &affinity, None);
    assert_eq!(drain(&mut selector, &mut rng), vec![1]);
    assert!(selector
        .skips
        .iter()
        .any(|skip| skip.upstream_id == 2 && skip.reason == SkipReason::ModelNotAllowed));
}

#[test]
fn quota_exceeded_upstreams_are_skipped_with_reason() {
    let upstreams = table(vec![
        runtime_with(UpstreamSpec { id: 1, priority: 0, weight: 1 }, |row| {
            row.spending_limit = Some(1.0);
            row.spending_period_type = Some("daily".to_string());
        }),
        runtime(UpstreamSpec { id: 2, priority: 0, weight: 1 }),
    ]);
    let quota = QuotaTracker::new();
    let configs: Vec<UpstreamConfig> = upstreams
        .values()
        .map(|runtime| runtime.config.clone())
        .collect();
    quota.configure(&configs);
    quota.record(1, 1.0, T0);

    let affinity = AffinityTracker::new(Duration::from_secs(60));
    let auth_ctx = auth(vec![1, 2]);

    let mut rng = StdRng::seed_from_u64(9);
    let mut selector = build(&auth_ctx, None, &upstreams, &quota, &affinity, None);
    assert_eq!(drain(&mut selector, &mut rng), vec![2]);
    assert!(selector
        .skips
        .iter()
        .any(|skip| skip.upstream_id == 1 && skip.reason == SkipReason::QuotaExceeded));
}

#[test]
fn open_circuit_filters_and_empty_verdicts_distinguish_causes() {
    let blown = runtime(UpstreamSpec { id: 1, priority: 0, weight: 1 });
    for i in 0..5 {
        let (guard, _) = blown.breaker.try_acquire(T0 + time::Duration::seconds(i)).unwrap();
        guard.on_failure(T0 + time::Duration::seconds(i));
    }
    let upstreams = table(vec![blown]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));

    // All candidates unhealthy.
    let selector = build(&auth(vec![1]), None, &upstreams, &quota, &affinity, None);
    assert_eq!(
        selector.empty_verdict(),
        Some(SelectionEmpty::NoHealthyCandidates)
    );
    assert!(selector
        .skips
        .iter()
        .any(|skip| skip.reason == SkipReason::CircuitOpen));

    // Key bound to nothing eligible.
    let selector = build(&auth(vec![99]), None, &upstreams, &quota, &affinity, None);
    assert_eq!(
        selector.empty_verdict(),
        Some(SelectionEmpty::NoAuthorizedUpstreams)
    );

    // Empty upstream table.
    let selector = build(&auth(vec![1]), None, &HashMap::new(), &quota, &affinity, None);
    assert_eq!(
        selector.empty_verdict(),
        Some(SelectionEmpty::NoUpstreamsConfigured)
    );
}

#[test]
fn affinity_pulls_the_bound_upstream_to_the_front() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 0, weight: 100 }),
        runtime(UpstreamSpec { id: 2, priority: 0, weight: 1 }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    affinity.observe("session-a", 2, 10, 100, T0);
    let auth_ctx = auth(vec![1, 2]);

    // Despite the lopsided weights, the session sticks to upstream 2.
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut selector = build(
            &auth_ctx,
            None,
            &upstreams,
            &quota,
            &affinity,
            Some("session-a"),
        );
        assert!(selector.affinity_applied);
        assert_eq!(selector.next(&mut rng).unwrap().config.id, 2);
    }
}

#[test]
fn affinity_front_is_scoped_to_its_own_tier() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 0, weight: 1 }),
        runtime(UpstreamSpec { id: 2, priority: 1, weight: 1 }),
        runtime(UpstreamSpec { id: 3, priority: 1, weight: 100 }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    // Session bound to a tier-1 upstream: tier 0 still goes first, but
    // within tier 1 the bound upstream beats the heavier sibling.
    affinity.observe("session-t", 2, 1, 1, T0);
    let auth_ctx = auth(vec![1, 2, 3]);

    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut selector = build(
            &auth_ctx,
            None,
            &upstreams,
            &quota,
            &affinity,
            Some("session-t"),
        );
        let order = drain(&mut selector, &mut rng);
        assert_eq!(order[0], 1, "tier 0 must still drain first: {order:?}");
        assert_eq!(order[1], 2, "affinity wins inside its tier: {order:?}");
    }
}

#[test]
fn affinity_is_dropped_past_the_migration_threshold() {
    let upstreams = table(vec![
        runtime(UpstreamSpec { id: 1, priority: 0, weight: 1 }),
        runtime_with(UpstreamSpec { id: 2, priority: 0, weight: 1 }, |row| {
            row.affinity_json = Some(serde_json::json!({
                "enabled": true,
                "threshold": 1000,
            }));
        }),
    ]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    // 1500 chars observed; the default metric is length.
    affinity.observe("session-b", 2, 10, 1500, T0);
    let auth_ctx = auth(vec![1, 2]);

    let selector = build(
        &auth_ctx,
        None,
        &upstreams,
        &quota,
        &affinity,
        Some("session-b"),
    );
    assert!(selector.affinity_migrated);
    assert!(!selector.affinity_applied);
    // The binding is gone for the next request too.
    assert!(affinity.lookup("session-b", T0).is_none());
}

#[test]
fn tokens_metric_requires_opt_in() {
    let upstreams = table(vec![runtime_with(
        UpstreamSpec { id: 1, priority: 0, weight: 1 },
        |row| {
            row.affinity_json = Some(serde_json::json!({
                "enabled": true,
                "metric": "tokens",
                "threshold": 100,
            }));
        },
    )]);
    let quota = QuotaTracker::new();
    let affinity = AffinityTracker::new(Duration::from_secs(60));
    // Few tokens, many chars: only the tokens metric keeps affinity alive.
    affinity.observe("session-c", 1, 50, 100_000, T0);
    let auth_ctx = auth(vec![1]);

    let selector = build(
        &auth_ctx,
        None,
        &upstreams,
        &quota,
        &affinity,
        Some("session-c"),
    );
    assert!(selector.affinity_applied);
    assert!(!selector.affinity_migrated);
}
