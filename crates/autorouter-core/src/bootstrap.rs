use std::sync::Arc;

use autorouter_common::Settings;
use autorouter_storage::{Store, StorageBus, StorageBusConfig};
use time::{Date, OffsetDateTime, Time};

use crate::compensation;
use crate::state::AppState;

pub struct Bootstrap {
    pub state: Arc<AppState>,
    pub store: Store,
    pub bus: StorageBus,
}

/// Connects storage, syncs the schema, seeds built-ins, materializes the
/// in-memory state and replays billed spend into the quota tracker.
pub async fn bootstrap(settings: Settings) -> anyhow::Result<Bootstrap> {
    let store = Store::connect(&settings.dsn).await?;
    store.sync().await?;

    let now = OffsetDateTime::now_utc();
    store
        .ensure_builtin_rules(&compensation::builtin_rules(), now)
        .await?;

    let snapshot = store.load_snapshot().await?;
    let state = Arc::new(AppState::from_snapshot(settings, &snapshot, store.clone())?);

    resync_quota(&state, &store, now).await?;

    let bus = StorageBus::spawn(store.clone(), StorageBusConfig::default());
    tracing::info!(
        upstreams = state.upstream_count(),
        "bootstrap complete"
    );

    Ok(Bootstrap { state, store, bus })
}

/// Rebuilds quota counters from the billing snapshot table; also serves the
/// admin force-resync endpoint.
pub async fn resync_quota(
    state: &Arc<AppState>,
    store: &Store,
    now: OffsetDateTime,
) -> anyhow::Result<()> {
    let horizon = rebuild_horizon(now, state.max_rolling_hours());
    let rows = store.billed_spend_since(horizon).await?;
    state.quota.replay(&rows, now);
    tracing::info!(rows = rows.len(), since = %horizon, "quota counters rebuilt");
    Ok(())
}

/// Scan floor: last 24h, the current month and the widest rolling horizon,
/// whichever reaches back furthest.
fn rebuild_horizon(now: OffsetDateTime, max_rolling_hours: i64) -> OffsetDateTime {
    let day_ago = now - time::Duration::hours(24);
    let month_start = month_start(now);
    let rolling = now - time::Duration::hours(max_rolling_hours.max(0));
    day_ago.min(month_start).min(rolling)
}

fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(time::UtcOffset::UTC);
    let first = Date::from_calendar_date(now.year(), now.month(), 1)
        .unwrap_or_else(|_| now.date());
    now.replace_date(first).replace_time(Time::MIDNIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn horizon_is_the_furthest_of_the_three_floors() {
        let now = datetime!(2026-07-20 12:00 UTC);
        // No rolling rules: month start reaches back further than 24h.
        assert_eq!(rebuild_horizon(now, 0), datetime!(2026-07-01 0:00 UTC));
        // A 30-day rolling rule wins over the month floor.
        assert_eq!(
            rebuild_horizon(now, 30 * 24),
            now - time::Duration::hours(30 * 24)
        );
        // Early in the month, the 24h floor still applies.
        let early = datetime!(2026-07-01 6:00 UTC);
        assert_eq!(rebuild_horizon(early, 0), early - time::Duration::hours(24));
    }
}
