//! The backend connection pool: a demand-driven, stealing load balancer.
//!
//! Connections are grouped into per-branch blocks. The pure planner in
//! [`algorithm`] decides when to create, steal, or close connections; this
//! module owns the blocks, executes plans, and hands out [`Lease`]s to
//! sessions. A lease returns its connection to the pool on drop.

pub mod algorithm;
pub mod block;

#[cfg(test)]
mod pool_tests;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::backend::{BackendConnector, ConnState, PhysicalConn};
use crate::errors::PoolError;
use crate::utils::cancel::CancelToken;
use crate::utils::clock;

pub use algorithm::{
    classify, plan_acquire, plan_rebalance, plan_release, AcquireAction, AlgorithmConfig,
    BlockClass, Plan, PlanOp, PoolSnapshot, ReleaseAction,
};
pub use block::{BlockMetrics, ConnectionBlock};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Hard cap on backend connections across all blocks.
    pub total_cap: u32,
    /// Minimum idle age before a connection may be stolen.
    pub hold_floor: Duration,
    /// Estimated cost of re-pointing a connection at another branch.
    pub reconnect_cost: Duration,
    pub rebalance_tick: Duration,
    /// Bounded acquire wait; zero disables the bound.
    pub acquire_timeout: Duration,
    /// Close idle connections older than this on the rebalance tick.
    pub idle_cull: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> PoolOptions {
        PoolOptions {
            total_cap: 10,
            hold_floor: Duration::from_secs(1),
            reconnect_cost: Duration::from_millis(100),
            rebalance_tick: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(30),
            idle_cull: Some(Duration::from_secs(600)),
        }
    }
}

impl PoolOptions {
    fn algorithm(&self) -> AlgorithmConfig {
        AlgorithmConfig {
            total_cap: self.total_cap,
            hold_floor_ns: self.hold_floor.as_nanos() as u64,
            reconnect_cost_ns: self.reconnect_cost.as_nanos() as u64,
            cull_idle_ns: self.idle_cull.map(|d| d.as_nanos() as u64),
        }
    }
}

/// Shared pool state behind the `ConnectionPool` handle.
pub struct PoolShared {
    options: PoolOptions,
    algorithm: AlgorithmConfig,
    connector: Arc<dyn BackendConnector>,
    blocks: DashMap<String, Arc<ConnectionBlock>>,
    /// Owned plus reserved (mid-connect) connections.
    total_conns: AtomicU32,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancelToken,
}

/// RAII handle on a backend connection.
///
/// Dereferences to the underlying [`PhysicalConn`]; on drop the connection
/// goes back to the pool, which either hands it to a waiter, parks it idle,
/// or routes it to a hungrier block.
pub struct Lease {
    inner: Option<PhysicalConn>,
    pool: Weak<PoolShared>,
    acquired_at: quanta::Instant,
}

impl Lease {
    pub(crate) fn grant(conn: PhysicalConn, pool: Weak<PoolShared>) -> Lease {
        Lease {
            inner: Some(conn),
            pool,
            acquired_at: clock::now(),
        }
    }

    pub(crate) fn into_conn(mut self) -> PhysicalConn {
        self.inner.take().expect("lease already consumed")
    }

    /// Mark the connection unusable; the pool will close and replace it
    /// instead of re-pooling.
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.inner.as_mut() {
            let _ = conn.transition(ConnState::Closing);
            let _ = conn.transition(ConnState::Dead);
        }
    }

    pub fn held_for(&self) -> Duration {
        clock::now().duration_since(self.acquired_at)
    }
}

impl Deref for Lease {
    type Target = PhysicalConn;
    fn deref(&self) -> &PhysicalConn {
        self.inner.as_ref().expect("lease already consumed")
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut PhysicalConn {
        self.inner.as_mut().expect("lease already consumed")
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("conn", &self.inner).finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.inner.take() {
            if let Some(shared) = self.pool.upgrade() {
                release_conn(&shared, conn, clock::elapsed_ns(self.acquired_at));
            }
        }
    }
}

/// Return a connection to the pool. Runs synchronously under per-block
/// mutexes; only cross-block transfers spawn follow-up work.
fn release_conn(shared: &Arc<PoolShared>, conn: PhysicalConn, hold_ns: u64) {
    let branch = conn.branch().to_string();
    let Some(block) = shared.blocks.get(&branch).map(|b| b.clone()) else {
        discard_conn(shared, conn);
        return;
    };

    if shared.closed.load(Ordering::SeqCst) || conn.is_broken() {
        block.forget_in_use();
        discard_conn(shared, conn);
        return;
    }

    // Waiters on the home block are served without a planner round-trip.
    if block.has_waiters() {
        if block.release(conn, hold_ns) {
            return;
        }
        // All waiters were gone; the connection idled instead.
        return;
    }

    let snapshot = pool_snapshot(shared);
    match plan_release(&snapshot, &shared.algorithm, &branch) {
        ReleaseAction::KeepIdle => {
            block.release(conn, hold_ns);
        }
        ReleaseAction::TransferTo { dst } => {
            let Some(conn) = block.release_for_transfer(conn, hold_ns) else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let shared = shared.clone();
                    handle.spawn(async move {
                        transfer_deliver(&shared, conn, &dst).await;
                    });
                }
                Err(_) => {
                    // No runtime to drive the reconnect: park it at home.
                    let mut conn = conn;
                    if conn.transition(ConnState::Idle).is_ok() {
                        block.deliver(conn);
                    } else {
                        discard_conn(shared, conn);
                    }
                }
            }
        }
    }
}

/// Reset a stolen/released connection onto `dst` and hand it over.
async fn transfer_deliver(shared: &Arc<PoolShared>, mut conn: PhysicalConn, dst: &str) {
    match conn.conn.reset(dst).await {
        Ok(()) => {
            conn.rebind(dst);
            if conn.transition(ConnState::Idle).is_err() {
                discard_conn(shared, conn);
                return;
            }
            debug!("conn {} transferred to block {}", conn.id, dst);
            get_block(shared, dst).deliver(conn);
        }
        Err(err) => {
            warn!("reconnect into block {dst} failed: {err}");
            discard_conn(shared, conn);
        }
    }
}

fn discard_conn(shared: &Arc<PoolShared>, mut conn: PhysicalConn) {
    shared.total_conns.fetch_sub(1, Ordering::SeqCst);
    let _ = conn.transition(ConnState::Closing);
    let _ = conn.transition(ConnState::Dead);
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            conn.conn.close().await;
        });
    }
}

fn get_block(shared: &Arc<PoolShared>, branch: &str) -> Arc<ConnectionBlock> {
    if let Some(block) = shared.blocks.get(branch) {
        return block.clone();
    }
    let weak = Arc::downgrade(shared);
    shared
        .blocks
        .entry(branch.to_string())
        .or_insert_with(|| Arc::new(ConnectionBlock::new(branch, weak)))
        .clone()
}

fn pool_snapshot(shared: &Arc<PoolShared>) -> PoolSnapshot {
    let mut snapshot = PoolSnapshot {
        total_conns: shared.total_conns.load(Ordering::SeqCst),
        ..Default::default()
    };
    for entry in shared.blocks.iter() {
        let metrics = entry.value().metrics();
        snapshot.blocks.insert(metrics.name.clone(), metrics);
    }
    snapshot
}

/// The pool handle. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("blocks", &self.shared.blocks.len())
            .field("total_conns", &self.shared.total_conns.load(Ordering::SeqCst))
            .field("total_cap", &self.shared.options.total_cap)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(options: PoolOptions, connector: Arc<dyn BackendConnector>) -> ConnectionPool {
        let algorithm = options.algorithm();
        ConnectionPool {
            shared: Arc::new(PoolShared {
                options,
                algorithm,
                connector,
                blocks: DashMap::new(),
                total_conns: AtomicU32::new(0),
                next_conn_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                shutdown: CancelToken::new(),
            }),
        }
    }

    /// Spawn the periodic rebalance task. Runs until `close`.
    pub fn start(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.shared.options.rebalance_tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = pool.shared.shutdown.cancelled() => break,
                    _ = interval.tick() => pool.rebalance_once().await,
                }
            }
        });
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    pub fn total_conns(&self) -> u32 {
        self.shared.total_conns.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        pool_snapshot(&self.shared)
    }

    pub fn block_metrics(&self, branch: &str) -> Option<BlockMetrics> {
        self.shared.blocks.get(branch).map(|b| b.metrics())
    }

    /// Acquire a backend connection for `branch`.
    ///
    /// Suspends until a connection is idle, created, or stolen; honors the
    /// configured bounded wait and the caller's cancel token.
    pub async fn acquire(&self, branch: &str, cancel: &CancelToken) -> Result<Lease, PoolError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        if self.shared.options.total_cap == 0 {
            return Err(PoolError::Exhausted);
        }

        let timeout = self.shared.options.acquire_timeout;
        let inner = self.acquire_inner(branch);
        tokio::select! {
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            result = async {
                if timeout.is_zero() {
                    inner.await
                } else {
                    match tokio::time::timeout(timeout, inner).await {
                        Ok(result) => result,
                        Err(_) => Err(PoolError::Timeout),
                    }
                }
            } => result,
        }
    }

    async fn acquire_inner(&self, branch: &str) -> Result<Lease, PoolError> {
        let block = get_block(&self.shared, branch);
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }
            if let Some(lease) = block.try_acquire_idle() {
                return Ok(lease);
            }

            let snapshot = pool_snapshot(&self.shared);
            match plan_acquire(&snapshot, &self.shared.algorithm, branch) {
                AcquireAction::Create => {
                    if !self.try_reserve() {
                        // Lost the race for the last slot; replan.
                        tokio::task::yield_now().await;
                        continue;
                    }
                    return self.connect_new(branch).await;
                }
                AcquireAction::Steal { src } => {
                    let stolen = self
                        .shared
                        .blocks
                        .get(&src)
                        .and_then(|b| b.steal_idle(self.shared.algorithm.steal_floor_ns()));
                    match stolen {
                        Some(mut conn) => match conn.conn.reset(branch).await {
                            Ok(()) => {
                                conn.rebind(branch);
                                if conn.transition(ConnState::Idle).is_err()
                                    || conn.transition(ConnState::InUse).is_err()
                                {
                                    discard_conn(&self.shared, conn);
                                    continue;
                                }
                                return Ok(block.register_in_use(conn));
                            }
                            Err(err) => {
                                warn!("reconnect of stolen conn into {branch} failed: {err}");
                                discard_conn(&self.shared, conn);
                                continue;
                            }
                        },
                        // Victim went busy between planning and stealing.
                        None => {
                            tokio::task::yield_now().await;
                            continue;
                        }
                    }
                }
                AcquireAction::Wait => {
                    let rx = block.enqueue_waiter();
                    // A release may have slipped in before the waiter was
                    // parked; re-check so the wakeup is not missed.
                    if let Some(lease) = block.try_acquire_idle() {
                        return Ok(lease);
                    }
                    match rx.await {
                        Ok(lease) => return Ok(lease),
                        Err(_) => {
                            if self.shared.closed.load(Ordering::SeqCst) {
                                return Err(PoolError::Closed);
                            }
                            continue;
                        }
                    }
                }
            }
        }
    }

    fn try_reserve(&self) -> bool {
        self.shared
            .total_conns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.shared.options.total_cap).then_some(n + 1)
            })
            .is_ok()
    }

    async fn connect_new(&self, branch: &str) -> Result<Lease, PoolError> {
        // Give the reservation back unless the connect completes.
        let reservation = scopeguard::guard(self.shared.clone(), |shared| {
            shared.total_conns.fetch_sub(1, Ordering::SeqCst);
        });

        let id = self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let backend = self.shared.connector.connect(branch).await?;
        let mut conn = PhysicalConn::new(id, branch, backend);
        if conn.transition(ConnState::Idle).is_err() || conn.transition(ConnState::InUse).is_err() {
            return Err(PoolError::Backend(crate::errors::BackendError::Unavailable(
                "new connection in unexpected state".into(),
            )));
        }

        let _ = scopeguard::ScopeGuard::into_inner(reservation);
        debug!("[block: {branch}] created backend conn {id}");
        Ok(get_block(&self.shared, branch).register_in_use(conn))
    }

    /// One rebalance pass: snapshot, plan, execute. Transfers abort
    /// silently when the victim went busy in between.
    pub async fn rebalance_once(&self) {
        let snapshot = pool_snapshot(&self.shared);
        let plan = plan_rebalance(&snapshot, &self.shared.algorithm);
        for op in plan.ops {
            match op {
                PlanOp::Transfer { src, dst } => {
                    let stolen = self
                        .shared
                        .blocks
                        .get(&src)
                        .and_then(|b| b.steal_idle(self.shared.algorithm.steal_floor_ns()));
                    if let Some(conn) = stolen {
                        transfer_deliver(&self.shared, conn, &dst).await;
                    }
                }
                PlanOp::Close { block, conn } => {
                    let removed = self
                        .shared
                        .blocks
                        .get(&block)
                        .and_then(|b| b.remove_idle(conn));
                    if let Some(conn) = removed {
                        info!("[block: {block}] closing idle conn {} past cull age", conn.id);
                        discard_conn(&self.shared, conn);
                    }
                }
                PlanOp::Create { .. } | PlanOp::ReleaseTo { .. } => {
                    // Emitted only on the acquire/release hot paths.
                }
            }
        }
    }

    /// Shut the pool down: fail waiters, close idle connections, refuse
    /// new acquires. Held leases drain to closed connections on drop.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        let blocks: Vec<Arc<ConnectionBlock>> =
            self.shared.blocks.iter().map(|b| b.value().clone()).collect();
        for block in blocks {
            block.fail_waiters();
            for conn in block.drain_idle() {
                self.shared.total_conns.fetch_sub(1, Ordering::SeqCst);
                let mut conn = conn;
                let _ = conn.transition(ConnState::Closing);
                let _ = conn.transition(ConnState::Dead);
                conn.conn.close().await;
            }
        }
        info!("connection pool closed");
    }
}
