//! Tests for cache lookup, redirects, coalescing, and eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;

use super::*;
use crate::compiler::heuristic::HeuristicGateway;
use crate::compiler::{CompileRequest, CompiledQuery, CompiledQueryGroup, CompilerGateway};
use crate::protocol::types::{Capabilities, Cardinality, InputLanguage};
use bytes::Bytes;
use uuid::Uuid;

fn request(query: &str) -> CompileRequest {
    CompileRequest {
        query: query.to_string(),
        branch: "main".to_string(),
        protocol_version: ProtocolVersion::CURRENT,
        schema_version: 1,
        input_language: InputLanguage::EdgeQl,
        output_format: OutputFormat::Binary,
        expected_cardinality: Cardinality::Many,
        implicit_limit: 0,
        compilation_flags: 0,
        modaliases: Default::default(),
        variables: Vec::new(),
    }
}

fn int64_arg(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Gateway that counts compiles and can stall inside the compile call.
struct CountingGateway {
    compiles: AtomicU64,
    gate: Option<Arc<Notify>>,
    fail: bool,
}

impl CountingGateway {
    fn new() -> CountingGateway {
        CountingGateway {
            compiles: AtomicU64::new(0),
            gate: None,
            fail: false,
        }
    }

    fn gated(gate: Arc<Notify>) -> CountingGateway {
        CountingGateway {
            compiles: AtomicU64::new(0),
            gate: Some(gate),
            fail: false,
        }
    }

    fn failing() -> CountingGateway {
        CountingGateway {
            compiles: AtomicU64::new(0),
            gate: None,
            fail: true,
        }
    }

    fn gated_failing(gate: Arc<Notify>) -> CountingGateway {
        CountingGateway {
            compiles: AtomicU64::new(0),
            gate: Some(gate),
            fail: true,
        }
    }

    fn count(&self) -> u64 {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl CompilerGateway for CountingGateway {
    fn compile(
        &self,
        request: CompileRequest,
    ) -> BoxFuture<'_, Result<CompiledQueryGroup, QueryError>> {
        async move {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(QueryError::syntax("bad query", 1, 1));
            }
            Ok(CompiledQueryGroup::single(CompiledQuery {
                sql: Bytes::from(request.query.clone()),
                status: "SELECT".to_string(),
                capabilities: Capabilities::NONE,
                cardinality: Cardinality::Many,
                input_typedesc_id: Uuid::nil(),
                input_typedesc: Bytes::new(),
                output_typedesc_id: Uuid::nil(),
                output_typedesc: Bytes::new(),
                state_typedesc_id: Uuid::nil(),
                param_names: Vec::new(),
                cache_deps_vars: Default::default(),
                tx_control: None,
                session_ops: Vec::new(),
            }))
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_simple_hit_after_miss() {
    let cache = QueryCache::new(16);
    let gateway = CountingGateway::new();
    let req = request("select 1");

    cache.lookup_or_compile(&req, &[], &gateway).await.unwrap();
    cache.lookup_or_compile(&req, &[], &gateway).await.unwrap();
    assert_eq!(gateway.count(), 1);
    assert_eq!(cache.stats.hits.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats.misses.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_whitespace_normalization_shares_entry() {
    let cache = QueryCache::new(16);
    let gateway = CountingGateway::new();

    cache
        .lookup_or_compile(&request("select   1"), &[], &gateway)
        .await
        .unwrap();
    cache
        .lookup_or_compile(&request("select 1"), &[], &gateway)
        .await
        .unwrap();
    assert_eq!(gateway.count(), 1);
}

#[tokio::test]
async fn test_schema_version_bump_misses() {
    let cache = QueryCache::new(16);
    let gateway = CountingGateway::new();

    cache
        .lookup_or_compile(&request("select 1"), &[], &gateway)
        .await
        .unwrap();
    let mut bumped = request("select 1");
    bumped.schema_version = 2;
    cache.lookup_or_compile(&bumped, &[], &gateway).await.unwrap();
    assert_eq!(gateway.count(), 2);
}

/// The first compile installs a redirect because the `limit` parameter's
/// value shapes the plan; the same value then hits the second level, and a
/// new value compiles a sibling entry under the same redirect.
#[tokio::test]
async fn test_value_dependent_redirect() {
    let cache = QueryCache::new(16);
    let gateway = HeuristicGateway;
    let req = request("select Post limit <int64>$n");

    let first = cache
        .lookup_or_compile(&req, &[int64_arg(1)], &gateway)
        .await
        .unwrap();
    assert!(first.units[0].cache_deps_vars.contains("n"));
    assert_eq!(cache.stats.compiles.load(Ordering::SeqCst), 1);
    // Redirect + second-level plan.
    assert_eq!(cache.len(), 2);

    // Same value: second-level hit, no compile.
    cache
        .lookup_or_compile(&req, &[int64_arg(1)], &gateway)
        .await
        .unwrap();
    assert_eq!(cache.stats.compiles.load(Ordering::SeqCst), 1);

    // Different value: new second-level entry under the same redirect.
    cache
        .lookup_or_compile(&req, &[int64_arg(2)], &gateway)
        .await
        .unwrap();
    assert_eq!(cache.stats.compiles.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 3);

    // Both values now hit.
    cache
        .lookup_or_compile(&req, &[int64_arg(1)], &gateway)
        .await
        .unwrap();
    cache
        .lookup_or_compile(&req, &[int64_arg(2)], &gateway)
        .await
        .unwrap();
    assert_eq!(cache.stats.compiles.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_redirect_key_var_names_sorted() {
    let cache = QueryCache::new(16);
    let gateway = HeuristicGateway;
    let req = request("select Post offset <int64>$z limit <int64>$a");

    cache
        .lookup_or_compile(&req, &[int64_arg(5), int64_arg(1)], &gateway)
        .await
        .unwrap();

    let first_key = CacheKey::first_level(&req);
    let entry = cache.entries.get(&first_key).unwrap();
    match entry.value() {
        Slot::Ready {
            entry: CacheEntry::Redirect(redirect),
            ..
        } => {
            assert_eq!(redirect.key_var_names, vec!["a", "z"]);
        }
        _ => panic!("expected redirect at first-level key"),
    }
}

/// Concurrent lookups for one missing key dispatch exactly one compile
/// and all observe the same outcome.
#[tokio::test]
async fn test_concurrent_lookups_coalesce() {
    let cache = Arc::new(QueryCache::new(16));
    let gate = Arc::new(Notify::new());
    let gateway = Arc::new(CountingGateway::gated(gate.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            cache
                .lookup_or_compile(&request("select 1"), &[], gateway.as_ref())
                .await
        }));
    }

    // Let every task reach the cache, then release the single compile.
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    gate.notify_waiters();
    gate.notify_one();

    for handle in handles {
        let group = handle.await.unwrap().unwrap();
        assert_eq!(group.units[0].status, "SELECT");
    }
    assert_eq!(gateway.count(), 1);
}

/// Coalesced lookups observe the owner's error, and the error is still
/// not cached afterwards.
#[tokio::test]
async fn test_concurrent_lookups_share_compile_error() {
    let cache = Arc::new(QueryCache::new(16));
    let gate = Arc::new(Notify::new());
    let gateway = Arc::new(CountingGateway::gated_failing(gate.clone()));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            cache
                .lookup_or_compile(&request("select 1"), &[], gateway.as_ref())
                .await
        }));
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    gate.notify_waiters();
    gate.notify_one();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::INVALID_SYNTAX);
    }
    assert_eq!(gateway.count(), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_compile_errors_are_not_cached() {
    let cache = QueryCache::new(16);
    let gateway = CountingGateway::failing();
    let req = request("select nope");

    for _ in 0..2 {
        let err = cache
            .lookup_or_compile(&req, &[], &gateway)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::INVALID_SYNTAX);
    }
    // Both lookups compiled: the failure never entered the cache.
    assert_eq!(gateway.count(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_lru_eviction_by_capacity() {
    let cache = QueryCache::new(2);
    let gateway = CountingGateway::new();

    cache
        .lookup_or_compile(&request("select 1"), &[], &gateway)
        .await
        .unwrap();
    cache
        .lookup_or_compile(&request("select 2"), &[], &gateway)
        .await
        .unwrap();
    // Touch "select 1" so "select 2" is the LRU victim.
    cache
        .lookup_or_compile(&request("select 1"), &[], &gateway)
        .await
        .unwrap();
    cache
        .lookup_or_compile(&request("select 3"), &[], &gateway)
        .await
        .unwrap();
    assert_eq!(cache.stats.evictions.load(Ordering::SeqCst), 1);
    assert!(cache.len() <= 2);

    // "select 1" survived; "select 2" was evicted.
    cache
        .lookup_or_compile(&request("select 1"), &[], &gateway)
        .await
        .unwrap();
    assert_eq!(gateway.count(), 3);
    cache
        .lookup_or_compile(&request("select 2"), &[], &gateway)
        .await
        .unwrap();
    assert_eq!(gateway.count(), 4);
}
