use std::sync::Arc;
use std::time::Duration;

use autorouter_core::breaker::{BreakerSkip, BreakerState, CircuitBreaker};
use autorouter_core::config::CircuitConfig;
use time::OffsetDateTime;

const T0: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

fn secs(value: i64) -> time::Duration {
    time::Duration::seconds(value)
}

fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(1, CircuitConfig::default()))
}

fn fail_once(breaker: &Arc<CircuitBreaker>, now: OffsetDateTime) {
    let (guard, _) = breaker.try_acquire(now).unwrap();
    guard.on_failure(now);
}

fn succeed_once(breaker: &Arc<CircuitBreaker>, now: OffsetDateTime) {
    let (guard, _) = breaker.try_acquire(now).unwrap();
    guard.on_success(now);
}

#[test]
fn opens_on_the_fifth_consecutive_failure() {
    let breaker = breaker();
    for i in 0..4 {
        fail_once(&breaker, T0 + secs(i));
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }
    assert_eq!(breaker.snapshot().failure_count, 4);

    fail_once(&breaker, T0 + secs(4));
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, BreakerState::Open);
    // Counters zero on the transition.
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.success_count, 0);
    assert_eq!(snapshot.opened_at, Some(T0 + secs(4)));

    // While open, the gate refuses.
    assert_eq!(breaker.try_acquire(T0 + secs(5)).unwrap_err(), BreakerSkip::Open);
}

#[test]
fn success_resets_the_failure_streak() {
    let breaker = breaker();
    for i in 0..4 {
        fail_once(&breaker, T0 + secs(i));
    }
    succeed_once(&breaker, T0 + secs(4));
    assert_eq!(breaker.snapshot().failure_count, 0);

    // Four more failures still do not open it.
    for i in 5..9 {
        fail_once(&breaker, T0 + secs(i));
    }
    assert_eq!(breaker.snapshot().state, BreakerState::Closed);
}

#[test]
fn half_open_probe_recovers_after_two_successes() {
    let breaker = breaker();
    for i in 0..5 {
        fail_once(&breaker, T0 + secs(i));
    }
    assert_eq!(breaker.snapshot().state, BreakerState::Open);

    // Before openDuration elapses the gate stays shut.
    assert!(breaker.try_acquire(T0 + secs(20)).is_err());

    // After openDuration the next admission is the probe.
    let probe_at = T0 + secs(35);
    let (guard, persist) = breaker.try_acquire(probe_at).unwrap();
    assert!(guard.is_probe());
    assert_eq!(persist.unwrap().state, "half_open");
    guard.on_success(probe_at);
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, BreakerState::HalfOpen);
    assert_eq!(snapshot.success_count, 1);

    // Second successful probe closes it and zeroes the counters.
    let (guard, _) = breaker.try_acquire(probe_at + secs(1)).unwrap();
    guard.on_success(probe_at + secs(1));
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, BreakerState::Closed);
    assert_eq!(snapshot.success_count, 0);
    assert_eq!(snapshot.opened_at, None);
}

#[test]
fn failed_probe_reopens_and_resets_opened_at() {
    let breaker = breaker();
    for i in 0..5 {
        fail_once(&breaker, T0 + secs(i));
    }
    let probe_at = T0 + secs(40);
    let (guard, _) = breaker.try_acquire(probe_at).unwrap();
    guard.on_failure(probe_at);

    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, BreakerState::Open);
    assert_eq!(snapshot.opened_at, Some(probe_at));

    // The fresh openedAt means the original window does not apply.
    assert!(breaker.try_acquire(probe_at + secs(10)).is_err());
    assert!(breaker.try_acquire(probe_at + secs(31)).is_ok());
}

#[test]
fn only_one_probe_may_be_in_flight() {
    let breaker = breaker();
    for i in 0..5 {
        fail_once(&breaker, T0 + secs(i));
    }
    let probe_at = T0 + secs(40);
    let (first, _) = breaker.try_acquire(probe_at).unwrap();
    // Second concurrent pick must skip while the probe is unresolved.
    assert_eq!(
        breaker.try_acquire(probe_at).unwrap_err(),
        BreakerSkip::ProbeBusy
    );
    assert!(breaker.would_admit(probe_at).is_err());

    first.on_success(probe_at);
    assert!(breaker.try_acquire(probe_at).is_ok());
}

#[test]
fn dropping_an_unresolved_probe_frees_the_slot() {
    let breaker = breaker();
    for i in 0..5 {
        fail_once(&breaker, T0 + secs(i));
    }
    let probe_at = T0 + secs(40);
    {
        let (guard, _) = breaker.try_acquire(probe_at).unwrap();
        assert!(guard.is_probe());
        // Client disconnected mid-probe; guard dropped without resolution.
    }
    assert!(breaker.try_acquire(probe_at).is_ok());
}

#[test]
fn force_transitions_are_legal_from_any_state() {
    let breaker = breaker();
    fail_once(&breaker, T0);

    let persist = breaker.force_open(T0 + secs(1));
    assert_eq!(persist.state, "open");
    assert_eq!(breaker.snapshot().state, BreakerState::Open);
    assert_eq!(breaker.snapshot().failure_count, 0);

    let persist = breaker.force_close(T0 + secs(2));
    assert_eq!(persist.state, "closed");
    assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    assert!(breaker.try_acquire(T0 + secs(3)).is_ok());
}

#[test]
fn restore_interprets_opened_at_as_wall_clock() {
    // Persisted open at T0; a restart 40s later is already past the window.
    let breaker = Arc::new(CircuitBreaker::restore(
        1,
        CircuitConfig::default(),
        BreakerState::Open,
        0,
        0,
        Some(T0),
        Some(T0),
        None,
    ));
    assert!(breaker.try_acquire(T0 + secs(10)).is_err());
    let (guard, _) = breaker.try_acquire(T0 + secs(40)).unwrap();
    assert!(guard.is_probe());
}

#[test]
fn restored_half_open_reenters_open() {
    // A half_open tuple means the in-flight probe died with the process.
    let breaker = Arc::new(CircuitBreaker::restore(
        1,
        CircuitConfig::default(),
        BreakerState::HalfOpen,
        0,
        1,
        None,
        Some(T0),
        Some(T0 + secs(31)),
        None,
    ));
    assert_eq!(breaker.snapshot().state, BreakerState::Open);
}

#[test]
fn transition_sequences_are_deterministic() {
    // The ending state is a function of the outcome sequence.
    let run = || {
        let breaker = breaker();
        fail_once(&breaker, T0);
        fail_once(&breaker, T0 + secs(1));
        succeed_once(&breaker, T0 + secs(2));
        for i in 3..8 {
            fail_once(&breaker, T0 + secs(i));
        }
        let snapshot = breaker.snapshot();
        (snapshot.state, snapshot.failure_count, snapshot.opened_at)
    };
    assert_eq!(run(), run());
    assert_eq!(run().0, BreakerState::Open);
}

#[test]
fn custom_thresholds_are_honored() {
    let config = CircuitConfig {
        failure_threshold: 2,
        success_threshold: 1,
        open_duration: Duration::from_secs(5),
        probe_interval: Duration::from_secs(1),
    };
    let breaker = Arc::new(CircuitBreaker::new(9, config));
    fail_once(&breaker, T0);
    fail_once(&breaker, T0 + secs(1));
    assert_eq!(breaker.snapshot().state, BreakerState::Open);

    let (guard, _) = breaker.try_acquire(T0 + secs(7)).unwrap();
    guard.on_success(T0 + secs(7));
    // One success suffices at threshold 1.
    assert_eq!(breaker.snapshot().state, BreakerState::Closed);
}
