//! Per-session counters, aggregated by the metrics exporter.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use iota::iota;
use once_cell::sync::Lazy;

iota! {
    pub const SESSION_STATE_IDLE: u8 = 1 + iota;
        , SESSION_STATE_EXECUTING
        , SESSION_STATE_WAITING
}

/// Counters for one frontend session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub queries: AtomicU64,
    pub errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    state: AtomicU8,
}

impl SessionStats {
    pub fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Relaxed);
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Relaxed)
    }
}

/// Live sessions by session id.
pub static SESSION_REGISTRY: Lazy<DashMap<u64, Arc<SessionStats>>> = Lazy::new(DashMap::new);

pub static TOTAL_SESSIONS: AtomicU64 = AtomicU64::new(0);

pub fn register_session(id: u64) -> Arc<SessionStats> {
    TOTAL_SESSIONS.fetch_add(1, Ordering::Relaxed);
    let stats = Arc::new(SessionStats::default());
    stats.set_state(SESSION_STATE_IDLE);
    SESSION_REGISTRY.insert(id, stats.clone());
    stats
}

pub fn unregister_session(id: u64) {
    SESSION_REGISTRY.remove(&id);
}

pub fn live_sessions() -> usize {
    SESSION_REGISTRY.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let stats = register_session(9_000_001);
        assert_eq!(stats.state(), SESSION_STATE_IDLE);
        stats.queries.fetch_add(1, Ordering::Relaxed);
        assert!(SESSION_REGISTRY.contains_key(&9_000_001));
        unregister_session(9_000_001);
        assert!(!SESSION_REGISTRY.contains_key(&9_000_001));
    }
}
