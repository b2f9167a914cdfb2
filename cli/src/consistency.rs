use tracing::debug;

use crate::cache::{CacheKey, QueryCache};

/// A successful mutation whose effects must reach the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    Launched { session_id: String },
    Stopped { session_id: String },
    /// Coins were added or spent by something other than a session operation.
    WalletChanged,
}

/// Slots a mutation makes stale. Nothing outside this list is touched.
pub fn affected_keys(event: &MutationEvent) -> Vec<CacheKey> {
    match event {
        MutationEvent::Launched { session_id } | MutationEvent::Stopped { session_id } => vec![
            CacheKey::Sessions,
            CacheKey::SessionLog(session_id.clone()),
        ],
        MutationEvent::WalletChanged => vec![CacheKey::Wallet],
    }
}

/// Applies the invalidation rules and returns the keys the caller should
/// refetch.
///
/// A launch seeds the new session's log slot so its poller starts from an
/// empty state; a stop only invalidates the stopped session's slot.
pub fn apply(cache: &QueryCache, event: &MutationEvent) -> Vec<CacheKey> {
    let keys = affected_keys(event);
    for key in &keys {
        match (event, key) {
            (MutationEvent::Launched { session_id }, CacheKey::SessionLog(_)) => {
                cache.seed_session_log(session_id);
            }
            _ => cache.invalidate(key),
        }
    }
    debug!("invalidated {:?} after {:?}", keys, event);
    keys
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn loaded(cache: &QueryCache, session_id: &str, text: &str) {
        let slot = cache.session_log(session_id);
        let ticket = slot.begin_fetch();
        slot.complete_fetch(ticket, Ok(text.to_string()));
    }

    #[test]
    fn test_stop_scopes_invalidation_to_that_session() {
        let cache = QueryCache::new();
        loaded(&cache, "s1", "one");
        loaded(&cache, "s2", "two");
        let s2_before = cache.session_log("s2");
        let wallet_before = cache.wallet().snapshot().invalidations;

        let keys = apply(&cache, &MutationEvent::Stopped { session_id: "s1".into() });

        assert_eq!(keys, vec![CacheKey::Sessions, CacheKey::SessionLog("s1".into())]);
        assert_eq!(cache.sessions().snapshot().invalidations, 1);
        assert!(cache.session_log("s1").snapshot().stale);

        let s2_after = cache.session_log("s2");
        assert!(Arc::ptr_eq(&s2_before, &s2_after));
        let s2_state = s2_after.snapshot();
        assert!(!s2_state.stale);
        assert_eq!(s2_state.invalidations, 0);
        assert_eq!(s2_state.data.as_deref(), Some("two"));
        assert_eq!(cache.wallet().snapshot().invalidations, wallet_before);
    }

    #[test]
    fn test_launch_seeds_new_log_slot() {
        let cache = QueryCache::new();
        loaded(&cache, "s3", "stale text from an earlier tenant");

        apply(&cache, &MutationEvent::Launched { session_id: "s3".into() });

        let state = cache.session_log("s3").snapshot();
        assert!(state.data.is_none());
        assert!(state.stale);
        assert_eq!(cache.sessions().snapshot().invalidations, 1);
    }

    #[test]
    fn test_wallet_change_only_touches_wallet() {
        let cache = QueryCache::new();
        loaded(&cache, "s1", "one");

        let keys = apply(&cache, &MutationEvent::WalletChanged);

        assert_eq!(keys, vec![CacheKey::Wallet]);
        assert_eq!(cache.wallet().snapshot().invalidations, 1);
        assert_eq!(cache.sessions().snapshot().invalidations, 0);
        assert_eq!(cache.session_log("s1").snapshot().invalidations, 0);
    }

    #[test]
    fn test_session_mutations_never_touch_wallet() {
        for event in [
            MutationEvent::Launched { session_id: "a".into() },
            MutationEvent::Stopped { session_id: "a".into() },
        ] {
            assert!(!affected_keys(&event).contains(&CacheKey::Wallet));
        }
    }
}
