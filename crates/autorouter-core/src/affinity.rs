use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

/// Accumulated weight of a session on its bound upstream, used for the
/// migration decision.
#[derive(Debug, Clone, Copy)]
pub struct AffinityHit {
    pub upstream_id: i64,
    pub total_tokens: i64,
    pub total_chars: i64,
}

#[derive(Debug, Clone, Copy)]
struct SessionBinding {
    upstream_id: i64,
    last_seen: OffsetDateTime,
    total_tokens: i64,
    total_chars: i64,
}

/// In-memory sticky-session table. Entries expire after the retention
/// window without traffic; pruning happens lazily on access.
#[derive(Debug)]
pub struct AffinityTracker {
    retention: Duration,
    inner: Mutex<HashMap<String, SessionBinding>>,
}

impl AffinityTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, session_key: &str, now: OffsetDateTime) -> Option<AffinityHit> {
        let mut inner = self.lock();
        let binding = inner.get(session_key).copied()?;
        if now - binding.last_seen >= self.retention {
            inner.remove(session_key);
            return None;
        }
        Some(AffinityHit {
            upstream_id: binding.upstream_id,
            total_tokens: binding.total_tokens,
            total_chars: binding.total_chars,
        })
    }

    /// Binds (or re-binds) a session and adds this request's weight.
    pub fn observe(
        &self,
        session_key: &str,
        upstream_id: i64,
        tokens: i64,
        chars: i64,
        now: OffsetDateTime,
    ) {
        let mut inner = self.lock();
        let binding = inner.entry(session_key.to_string()).or_insert(SessionBinding {
            upstream_id,
            last_seen: now,
            total_tokens: 0,
            total_chars: 0,
        });
        if binding.upstream_id != upstream_id {
            // Session moved (failover or migration); counters restart on the
            // new upstream.
            binding.upstream_id = upstream_id;
            binding.total_tokens = 0;
            binding.total_chars = 0;
        }
        binding.last_seen = now;
        binding.total_tokens += tokens.max(0);
        binding.total_chars += chars.max(0);
    }

    /// Clears a binding whose session crossed the migration threshold.
    pub fn drop_session(&self, session_key: &str) {
        self.lock().remove(session_key);
    }

    pub fn prune(&self, now: OffsetDateTime) {
        let retention = self.retention;
        self.lock()
            .retain(|_, binding| now - binding.last_seen < retention);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionBinding>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

    #[test]
    fn bindings_expire_after_retention() {
        let tracker = AffinityTracker::new(Duration::from_secs(60));
        tracker.observe("s1", 7, 100, 500, T0);

        let hit = tracker.lookup("s1", T0 + time::Duration::seconds(30)).unwrap();
        assert_eq!(hit.upstream_id, 7);

        assert!(tracker.lookup("s1", T0 + time::Duration::seconds(61)).is_none());
    }

    #[test]
    fn weight_accumulates_per_upstream() {
        let tracker = AffinityTracker::new(Duration::from_secs(60));
        tracker.observe("s1", 7, 100, 500, T0);
        tracker.observe("s1", 7, 50, 200, T0 + time::Duration::seconds(1));
        let hit = tracker.lookup("s1", T0 + time::Duration::seconds(2)).unwrap();
        assert_eq!(hit.total_tokens, 150);
        assert_eq!(hit.total_chars, 700);
    }

    #[test]
    fn rebinding_to_another_upstream_resets_counters() {
        let tracker = AffinityTracker::new(Duration::from_secs(60));
        tracker.observe("s1", 7, 100, 500, T0);
        tracker.observe("s1", 8, 10, 20, T0 + time::Duration::seconds(1));
        let hit = tracker.lookup("s1", T0 + time::Duration::seconds(2)).unwrap();
        assert_eq!(hit.upstream_id, 8);
        assert_eq!(hit.total_tokens, 10);
    }

    #[test]
    fn dropped_sessions_are_forgotten() {
        let tracker = AffinityTracker::new(Duration::from_secs(60));
        tracker.observe("s1", 7, 1, 1, T0);
        tracker.drop_session("s1");
        assert!(tracker.lookup("s1", T0).is_none());
    }
}
