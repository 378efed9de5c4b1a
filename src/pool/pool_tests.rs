//! Pool behavior tests against the loopback backend.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::backend::loopback::LoopbackConnector;
use crate::errors::PoolError;
use crate::utils::cancel::CancelToken;

fn options(cap: u32) -> PoolOptions {
    PoolOptions {
        total_cap: cap,
        // Zero floor so tests can steal freshly idled connections.
        hold_floor: Duration::ZERO,
        reconnect_cost: Duration::ZERO,
        rebalance_tick: Duration::from_millis(50),
        acquire_timeout: Duration::from_secs(5),
        idle_cull: None,
    }
}

fn pool_with(cap: u32) -> (ConnectionPool, Arc<LoopbackConnector>) {
    let connector = Arc::new(LoopbackConnector::new());
    let pool = ConnectionPool::new(options(cap), connector.clone());
    (pool, connector)
}

#[tokio::test]
async fn test_acquire_creates_then_reuses() {
    let (pool, connector) = pool_with(4);
    let cancel = CancelToken::new();

    let lease = pool.acquire("main", &cancel).await.unwrap();
    assert_eq!(connector.connect_count(), 1);
    assert_eq!(pool.total_conns(), 1);
    drop(lease);

    // The connection went back to exactly one block, no duplication.
    let metrics = pool.block_metrics("main").unwrap();
    assert_eq!(metrics.idle, 1);
    assert_eq!(metrics.inflight, 0);
    assert_eq!(metrics.connections, 1);

    let _lease = pool.acquire("main", &cancel).await.unwrap();
    assert_eq!(connector.connect_count(), 1, "idle conn must be reused");
}

#[tokio::test]
async fn test_total_cap_zero_is_exhausted_immediately() {
    let (pool, _) = pool_with(0);
    let err = pool.acquire("main", &CancelToken::new()).await.unwrap_err();
    assert_eq!(err, PoolError::Exhausted);
}

#[tokio::test]
async fn test_cap_is_never_exceeded() {
    let (pool, _) = pool_with(2);
    let cancel = CancelToken::new();

    let a = pool.acquire("main", &cancel).await.unwrap();
    let b = pool.acquire("main", &cancel).await.unwrap();
    assert_eq!(pool.total_conns(), 2);

    // Third acquire must wait, then receive b's connection on release.
    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move {
        pool2.acquire("main", &CancelToken::new()).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(b);
    let lease = waiter.await.unwrap().unwrap();
    // Still at cap: handoff reuses, never creates.
    assert_eq!(pool.total_conns(), 2);
    drop(lease);
    drop(a);
}

#[tokio::test]
async fn test_waiters_are_served_fifo() {
    let (pool, _) = pool_with(1);
    let cancel = CancelToken::new();
    let held = pool.acquire("main", &cancel).await.unwrap();

    let (first_tx, first_rx) = tokio::sync::oneshot::channel::<u64>();
    let pool1 = pool.clone();
    let first = tokio::spawn(async move {
        let lease = pool1.acquire("main", &CancelToken::new()).await.unwrap();
        first_tx.send(lease.id).unwrap();
        lease
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let pool2 = pool.clone();
    let second = tokio::spawn(async move {
        pool2.acquire("main", &CancelToken::new()).await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(held);
    // The first-parked waiter gets the released connection.
    let first_id = tokio::time::timeout(Duration::from_secs(1), first_rx)
        .await
        .expect("first waiter should be served first")
        .unwrap();
    let lease = first.await.unwrap();
    assert_eq!(lease.id, first_id);
    drop(lease);
    second.await.unwrap();
}

#[tokio::test]
async fn test_acquire_timeout() {
    let connector = Arc::new(LoopbackConnector::new());
    let mut opts = options(1);
    opts.acquire_timeout = Duration::from_millis(50);
    let pool = ConnectionPool::new(opts, connector);
    let cancel = CancelToken::new();

    let _held = pool.acquire("main", &cancel).await.unwrap();
    let err = pool.acquire("main", &cancel).await.unwrap_err();
    assert_eq!(err, PoolError::Timeout);
}

#[tokio::test]
async fn test_acquire_cancelled() {
    let (pool, _) = pool_with(1);
    let cancel = CancelToken::new();
    let _held = pool.acquire("main", &cancel).await.unwrap();

    let waiter_cancel = CancelToken::new();
    let fire = waiter_cancel.clone();
    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move {
        pool2.acquire("main", &waiter_cancel).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    fire.cancel();
    assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::Cancelled);
}

/// Block a holds all four connections idle while block b has demand: the
/// acquire steals from a instead of waiting.
#[tokio::test]
async fn test_steal_under_pressure() {
    let (pool, connector) = pool_with(4);
    let cancel = CancelToken::new();

    let leases: Vec<Lease> = futures::future::join_all(
        (0..4).map(|_| pool.acquire("a", &cancel)),
    )
    .await
    .into_iter()
    .collect::<Result<_, _>>()
    .unwrap();
    assert_eq!(connector.connect_count(), 4);
    drop(leases);

    let lease = pool.acquire("b", &cancel).await.unwrap();
    assert_eq!(
        connector.connect_count(),
        4,
        "transfer must reuse a stolen conn, not create"
    );
    assert_eq!(lease.branch(), "b");

    let a = pool.block_metrics("a").unwrap();
    let b = pool.block_metrics("b").unwrap();
    assert_eq!(a.idle, 3);
    assert_eq!(b.inflight, 1);
    assert_eq!(pool.total_conns(), 4);
    drop(lease);
}

/// Connections younger than the steal floor are not taken, so the other
/// block waits (and here, times out).
#[tokio::test]
async fn test_steal_respects_hold_floor() {
    let connector = Arc::new(LoopbackConnector::new());
    let mut opts = options(1);
    opts.hold_floor = Duration::from_secs(3600);
    opts.acquire_timeout = Duration::from_millis(50);
    let pool = ConnectionPool::new(opts, connector);
    let cancel = CancelToken::new();

    let lease = pool.acquire("a", &cancel).await.unwrap();
    drop(lease); // idles with age ~0 << hold_floor

    let err = pool.acquire("b", &cancel).await.unwrap_err();
    assert_eq!(err, PoolError::Timeout);
    assert_eq!(pool.block_metrics("a").unwrap().idle, 1);
}

/// A connection held by a session (e.g. pinned by an open transaction) is
/// never transferred; only idle connections are stolen.
#[tokio::test]
async fn test_in_use_conn_is_never_stolen() {
    let connector = Arc::new(LoopbackConnector::new());
    let mut opts = options(1);
    opts.acquire_timeout = Duration::from_millis(50);
    let pool = ConnectionPool::new(opts, connector);
    let cancel = CancelToken::new();

    let held = pool.acquire("a", &cancel).await.unwrap();
    let held_id = held.id;

    // Rebalance runs while a is busy: the transfer aborts silently.
    pool.rebalance_once().await;
    let err = pool.acquire("b", &cancel).await.unwrap_err();
    assert_eq!(err, PoolError::Timeout);

    // The held connection identity is unchanged.
    assert_eq!(held.id, held_id);
    assert_eq!(held.branch(), "a");
    drop(held);
}

#[tokio::test]
async fn test_broken_conn_is_replaced() {
    let (pool, connector) = pool_with(2);
    let cancel = CancelToken::new();

    let mut lease = pool.acquire("main", &cancel).await.unwrap();
    lease.mark_broken();
    drop(lease);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(pool.total_conns(), 0);
    let metrics = pool.block_metrics("main").unwrap();
    assert_eq!(metrics.connections, 0);

    let _lease = pool.acquire("main", &cancel).await.unwrap();
    assert_eq!(connector.connect_count(), 2, "dead conn must be replaced");
}

#[tokio::test]
async fn test_rebalance_moves_idle_to_waiting_block() {
    let (pool, _connector) = pool_with(1);
    let cancel = CancelToken::new();

    let lease = pool.acquire("a", &cancel).await.unwrap();
    drop(lease);
    assert_eq!(pool.block_metrics("a").unwrap().idle, 1);

    // Park a waiter on b, then run the rebalance tick.
    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move {
        pool2.acquire("b", &CancelToken::new()).await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.rebalance_once().await;

    let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("rebalance should feed the waiting block")
        .unwrap();
    assert_eq!(lease.branch(), "b");
    assert_eq!(pool.total_conns(), 1);
}

#[tokio::test]
async fn test_close_fails_waiters_and_refuses_acquires() {
    let (pool, _) = pool_with(1);
    let cancel = CancelToken::new();
    let held = pool.acquire("main", &cancel).await.unwrap();

    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move {
        pool2.acquire("main", &CancelToken::new()).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.close().await;
    assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::Closed);
    assert_eq!(
        pool.acquire("main", &cancel).await.unwrap_err(),
        PoolError::Closed
    );
    drop(held);
}

#[tokio::test]
async fn test_idle_cull_closes_old_connections() {
    let connector = Arc::new(LoopbackConnector::new());
    let mut opts = options(4);
    opts.idle_cull = Some(Duration::from_millis(10));
    let pool = ConnectionPool::new(opts, connector);
    let cancel = CancelToken::new();

    let a = pool.acquire("main", &cancel).await.unwrap();
    let b = pool.acquire("main", &cancel).await.unwrap();
    drop(a);
    drop(b);
    assert_eq!(pool.block_metrics("main").unwrap().idle, 2);

    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.rebalance_once().await;

    // Both idle connections are past the cull age and get closed.
    assert_eq!(pool.block_metrics("main").unwrap().idle, 0);
    assert_eq!(pool.total_conns(), 0);
}
