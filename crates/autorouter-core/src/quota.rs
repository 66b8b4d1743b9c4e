use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use autorouter_storage::BilledSpendRow;
use time::{Date, OffsetDateTime, Time};

use crate::config::{SpendingPeriod, SpendingRule, UpstreamConfig};

#[derive(Debug)]
enum SpendWindow {
    /// Daily/monthly accumulation; resets when `at` leaves the period.
    Fixed {
        period_start: OffsetDateTime,
        total: f64,
    },
    /// Sliding window; events roll off once their age reaches the horizon.
    Rolling {
        events: VecDeque<(OffsetDateTime, f64)>,
        total: f64,
    },
}

#[derive(Debug)]
struct UpstreamSpend {
    rule: SpendingRule,
    window: SpendWindow,
}

/// Admin-facing view of one upstream's quota.
#[derive(Debug, Clone)]
pub struct QuotaStatus {
    pub upstream_id: i64,
    pub limit: f64,
    pub period: SpendingPeriod,
    pub current_spend: f64,
    pub exceeded: bool,
    /// For rolling rules: when the oldest in-window spend rolls off and by
    /// how much the counter will drop.
    pub recovery_at: Option<OffsetDateTime>,
    pub recovery_drop: Option<f64>,
}

/// Rolling/daily/monthly spend per upstream. The billing recorder is the
/// single writer per upstream; the selector reads `is_exceeded` inline.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    inner: Mutex<HashMap<i64, UpstreamSpend>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the current spending rules. Upstreams that lost their rule
    /// are dropped; retained rolling rules keep their event history.
    pub fn configure(&self, upstreams: &[UpstreamConfig]) {
        let mut inner = self.lock();
        let mut next: HashMap<i64, UpstreamSpend> = HashMap::new();
        for upstream in upstreams {
            let Some(rule) = upstream.spending else {
                continue;
            };
            let window = match inner.remove(&upstream.id) {
                Some(existing) if existing.rule.period == rule.period => existing.window,
                _ => empty_window(rule.period),
            };
            next.insert(upstream.id, UpstreamSpend { rule, window });
        }
        *inner = next;
    }

    /// Clears counters and replays persisted billed spend (boot / forced
    /// resync). Rows outside an upstream's window simply age out on replay.
    pub fn replay(&self, rows: &[BilledSpendRow], now: OffsetDateTime) {
        {
            let mut inner = self.lock();
            for spend in inner.values_mut() {
                spend.window = empty_window(spend.rule.period);
            }
        }
        for row in rows {
            self.record(row.upstream_id, row.final_cost, row.created_at);
        }
        // Settle fixed periods and roll-offs against the current clock.
        let mut inner = self.lock();
        for spend in inner.values_mut() {
            advance(spend, now);
        }
    }

    /// Commits a billed cost delta (called by the billing recorder).
    pub fn record(&self, upstream_id: i64, cost: f64, at: OffsetDateTime) {
        if cost <= 0.0 {
            return;
        }
        let mut inner = self.lock();
        let Some(spend) = inner.get_mut(&upstream_id) else {
            return;
        };
        advance(spend, at);
        match &mut spend.window {
            SpendWindow::Fixed { total, .. } => *total += cost,
            SpendWindow::Rolling { events, total } => {
                events.push_back((at, cost));
                *total += cost;
            }
        }
    }

    /// True iff the upstream's rule is at or over its limit right now.
    pub fn is_exceeded(&self, upstream_id: i64, at: OffsetDateTime) -> bool {
        let mut inner = self.lock();
        let Some(spend) = inner.get_mut(&upstream_id) else {
            return false;
        };
        advance(spend, at);
        current_total(spend) >= spend.rule.limit
    }

    pub fn current_spend(&self, upstream_id: i64, at: OffsetDateTime) -> Option<f64> {
        let mut inner = self.lock();
        let spend = inner.get_mut(&upstream_id)?;
        advance(spend, at);
        Some(current_total(spend))
    }

    pub fn status(&self, at: OffsetDateTime) -> Vec<QuotaStatus> {
        let mut inner = self.lock();
        let mut out: Vec<QuotaStatus> = inner
            .iter_mut()
            .map(|(upstream_id, spend)| {
                advance(spend, at);
                let current_spend = current_total(spend);
                let (recovery_at, recovery_drop) = match (&spend.window, spend.rule.period) {
                    (SpendWindow::Rolling { events, .. }, SpendingPeriod::Rolling { hours }) => {
                        match events.front() {
                            Some((oldest_at, oldest_cost)) => (
                                Some(*oldest_at + time::Duration::hours(hours)),
                                Some(*oldest_cost),
                            ),
                            None => (None, None),
                        }
                    }
                    _ => (None, None),
                };
                QuotaStatus {
                    upstream_id: *upstream_id,
                    limit: spend.rule.limit,
                    period: spend.rule.period,
                    current_spend,
                    exceeded: current_spend >= spend.rule.limit,
                    recovery_at,
                    recovery_drop,
                }
            })
            .collect();
        out.sort_by_key(|status| status.upstream_id);
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, UpstreamSpend>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn empty_window(period: SpendingPeriod) -> SpendWindow {
    match period {
        SpendingPeriod::Daily | SpendingPeriod::Monthly => SpendWindow::Fixed {
            period_start: OffsetDateTime::UNIX_EPOCH,
            total: 0.0,
        },
        SpendingPeriod::Rolling { .. } => SpendWindow::Rolling {
            events: VecDeque::new(),
            total: 0.0,
        },
    }
}

fn current_total(spend: &UpstreamSpend) -> f64 {
    match &spend.window {
        SpendWindow::Fixed { total, .. } => *total,
        SpendWindow::Rolling { total, .. } => *total,
    }
}

/// Slides the window forward to `at`: fixed periods reset on rollover,
/// rolling windows drop aged-out events.
fn advance(spend: &mut UpstreamSpend, at: OffsetDateTime) {
    match (&mut spend.window, spend.rule.period) {
        (SpendWindow::Fixed { period_start, total }, SpendingPeriod::Daily) => {
            let start = day_start(at);
            if *period_start != start {
                *period_start = start;
                *total = 0.0;
            }
        }
        (SpendWindow::Fixed { period_start, total }, SpendingPeriod::Monthly) => {
            let start = month_start(at);
            if *period_start != start {
                *period_start = start;
                *total = 0.0;
            }
        }
        (SpendWindow::Rolling { events, total }, SpendingPeriod::Rolling { hours }) => {
            let horizon = time::Duration::hours(hours);
            while let Some((event_at, cost)) = events.front().copied() {
                if at - event_at >= horizon {
                    events.pop_front();
                    *total -= cost;
                } else {
                    break;
                }
            }
            if events.is_empty() {
                *total = 0.0;
            }
        }
        // Rule/window shape mismatch only happens across a configure() race;
        // configure() rebuilds the window on the next pass.
        _ => {}
    }
}

fn day_start(at: OffsetDateTime) -> OffsetDateTime {
    at.to_offset(time::UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}

fn month_start(at: OffsetDateTime) -> OffsetDateTime {
    let at = at.to_offset(time::UtcOffset::UTC);
    let first = Date::from_calendar_date(at.year(), at.month(), 1)
        .unwrap_or_else(|_| at.date());
    at.replace_date(first).replace_time(Time::MIDNIGHT)
}
