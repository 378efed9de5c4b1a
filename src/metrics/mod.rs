//! Prometheus metrics for the pool, the query cache, and sessions.

use std::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::app::state::ServerState;
use crate::stats;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static POOL_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "gelway_pool_connections",
            "Backend connections per branch block and state",
        ),
        &["branch", "state"],
    )
    .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

static POOL_WAITERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("gelway_pool_waiters", "Sessions parked on a branch block"),
        &["branch"],
    )
    .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

static POOL_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "gelway_pool_total_connections",
        "Backend connections across all blocks",
    )
    .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("gelway_cache_entries", "Live compiled-query cache entries")
        .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

static CACHE_HITS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("gelway_cache_hits_total", "Query cache hits")
        .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

static CACHE_MISSES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("gelway_cache_misses_total", "Query cache misses")
        .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

static CACHE_COMPILES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("gelway_cache_compiles_total", "Compiles dispatched")
        .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

static SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("gelway_sessions", "Live frontend sessions")
        .expect("static metric definition");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

/// Refresh every gauge from live state. Called before each scrape.
pub fn update_metrics(state: &ServerState) {
    let snapshot = state.pool.snapshot();
    POOL_TOTAL.set(snapshot.total_conns as i64);
    for (name, block) in &snapshot.blocks {
        POOL_CONNECTIONS
            .with_label_values(&[name, "idle"])
            .set(block.idle as i64);
        POOL_CONNECTIONS
            .with_label_values(&[name, "inflight"])
            .set(block.inflight as i64);
        POOL_WAITERS
            .with_label_values(&[name])
            .set(block.waiters as i64);
    }

    CACHE_ENTRIES.set(state.cache.len() as i64);
    CACHE_HITS.set(state.cache.stats.hits.load(Ordering::Relaxed) as i64);
    CACHE_MISSES.set(state.cache.stats.misses.load(Ordering::Relaxed) as i64);
    CACHE_COMPILES.set(state.cache.stats.compiles.load(Ordering::Relaxed) as i64);
    SESSIONS.set(stats::live_sessions() as i64);
}

/// Encode the registry in the Prometheus text format.
pub fn render(state: &ServerState) -> (String, Vec<u8>) {
    update_metrics(state);
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer).ok();
    (encoder.format_type().to_string(), buffer)
}
