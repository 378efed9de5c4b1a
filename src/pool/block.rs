//! Per-branch connection block: the idle set, the waiter queue, and the
//! metrics the planner consumes.

use std::collections::VecDeque;
use std::sync::Weak;

use hdrhistogram::Histogram;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Lease, PoolShared};
use crate::backend::{ConnState, PhysicalConn};
use crate::utils::clock;

/// Maximum trackable hold time for the histogram (10 minutes).
const HOLD_HISTOGRAM_MAX_NS: u64 = 10 * 60 * 1_000_000_000;
const HOLD_HISTOGRAM_SIGFIG: u8 = 2;

/// Smoothing factor for the demand EWMA.
const DEMAND_EWMA_ALPHA: f64 = 0.2;

/// Read-only metrics snapshot handed to the planner.
#[derive(Debug, Clone, Default)]
pub struct BlockMetrics {
    pub name: String,
    /// Connections owned by this block (in use + idle).
    pub connections: u32,
    pub inflight: u32,
    pub idle: u32,
    pub waiters: u32,
    pub avg_hold_ns: u64,
    /// (conn id, idle age ns), oldest first.
    pub idle_ages: Vec<(u64, u64)>,
    /// "Database time" demand: EWMA of concurrency x hold time.
    pub ewma_demand: f64,
    pub last_activity_ns: u64,
}

impl BlockMetrics {
    pub fn oldest_idle_age_ns(&self) -> u64 {
        self.idle_ages.first().map(|(_, age)| *age).unwrap_or(0)
    }
}

struct IdleConn {
    conn: PhysicalConn,
    since: quanta::Instant,
}

struct BlockInner {
    connections: u32,
    inflight: u32,
    idle: VecDeque<IdleConn>,
    waiters: VecDeque<oneshot::Sender<Lease>>,
    hold_hist: Histogram<u64>,
    ewma_demand: f64,
    last_activity: quanta::Instant,
}

/// One logical database's set of backend connections.
///
/// All mutations are serialized by the inner mutex; handoffs to waiters go
/// directly from the releasing holder without the connection round-tripping
/// through the idle set.
pub struct ConnectionBlock {
    name: String,
    pool: Weak<PoolShared>,
    inner: Mutex<BlockInner>,
}

impl std::fmt::Debug for ConnectionBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionBlock")
            .field("name", &self.name)
            .field("connections", &inner.connections)
            .field("inflight", &inner.inflight)
            .field("idle", &inner.idle.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl ConnectionBlock {
    pub fn new(name: &str, pool: Weak<PoolShared>) -> ConnectionBlock {
        ConnectionBlock {
            name: name.to_string(),
            pool,
            inner: Mutex::new(BlockInner {
                connections: 0,
                inflight: 0,
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                hold_hist: Histogram::new_with_max(HOLD_HISTOGRAM_MAX_NS, HOLD_HISTOGRAM_SIGFIG)
                    .expect("static histogram bounds"),
                ewma_demand: 0.0,
                last_activity: clock::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grab an idle connection if one exists. Most recently parked first:
    /// warm connections are reused, old ones age toward the steal floor.
    pub fn try_acquire_idle(&self) -> Option<Lease> {
        let mut inner = self.inner.lock();
        let idle = inner.idle.pop_back()?;
        let mut conn = idle.conn;
        if conn.transition(ConnState::InUse).is_err() {
            inner.connections = inner.connections.saturating_sub(1);
            return None;
        }
        inner.inflight += 1;
        inner.last_activity = clock::now();
        Some(Lease::grant(conn, self.pool.clone()))
    }

    /// Park a caller until a connection frees up. FIFO order.
    pub fn enqueue_waiter(&self) -> oneshot::Receiver<Lease> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.waiters.push_back(tx);
        rx
    }

    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().waiters.is_empty()
    }

    /// Account a freshly connected, already-in-use connection to this block
    /// and wrap it in a lease.
    pub fn register_in_use(&self, conn: PhysicalConn) -> Lease {
        let mut inner = self.inner.lock();
        inner.connections += 1;
        inner.inflight += 1;
        inner.last_activity = clock::now();
        Lease::grant(conn, self.pool.clone())
    }

    /// Return a held connection. Waiters are served directly, FIFO, without
    /// the connection passing through the idle set; otherwise the
    /// connection parks as idle.
    ///
    /// Returns `true` if the connection was handed to a waiter.
    pub fn release(&self, mut conn: PhysicalConn, hold_ns: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.note_release(hold_ns);

        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(Lease::grant(conn, self.pool.clone())) {
                Ok(()) => return true,
                // Waiter gave up (cancelled/timed out); take the
                // connection back and try the next one.
                Err(lease) => conn = lease.into_conn(),
            }
        }

        if conn.transition(ConnState::Idle).is_err() {
            // Unexpected state; drop the connection from the block rather
            // than pooling a conn in an unknown state.
            inner.connections = inner.connections.saturating_sub(1);
            inner.inflight = inner.inflight.saturating_sub(1);
            return false;
        }
        inner.inflight = inner.inflight.saturating_sub(1);
        inner.idle.push_back(IdleConn {
            conn,
            since: clock::now(),
        });
        false
    }

    /// Take the released connection out of the block entirely (the planner
    /// routed it elsewhere). Stats are updated as for a release.
    pub fn release_for_transfer(&self, mut conn: PhysicalConn, hold_ns: u64) -> Option<PhysicalConn> {
        let mut inner = self.inner.lock();
        inner.note_release(hold_ns);
        inner.connections = inner.connections.saturating_sub(1);
        inner.inflight = inner.inflight.saturating_sub(1);
        if conn.transition(ConnState::Idle).is_err()
            || conn.transition(ConnState::Reconnecting).is_err()
        {
            return None;
        }
        Some(conn)
    }

    /// Steal the oldest idle connection, provided it has idled at least
    /// `min_idle_ns`. Returns `None` when the block has nothing eligible --
    /// including when it went busy between planning and execution.
    pub fn steal_idle(&self, min_idle_ns: u64) -> Option<PhysicalConn> {
        let mut inner = self.inner.lock();
        let oldest = inner.idle.front()?;
        let age = clock::elapsed_ns(oldest.since);
        if age < min_idle_ns {
            return None;
        }
        let mut conn = inner.idle.pop_front()?.conn;
        inner.connections = inner.connections.saturating_sub(1);
        if conn.transition(ConnState::Reconnecting).is_err() {
            return None;
        }
        debug!(
            "[block: {}] conn {} stolen after idling {}ms",
            self.name,
            conn.id,
            age / 1_000_000
        );
        Some(conn)
    }

    /// Adopt a transferred (or otherwise idle) connection into this block:
    /// straight to the head waiter when one is parked, idle otherwise.
    pub fn deliver(&self, mut conn: PhysicalConn) {
        let mut inner = self.inner.lock();
        inner.connections += 1;
        inner.last_activity = clock::now();

        while let Some(waiter) = inner.waiters.pop_front() {
            if conn.transition(ConnState::InUse).is_err() {
                break;
            }
            match waiter.send(Lease::grant(conn, self.pool.clone())) {
                Ok(()) => {
                    inner.inflight += 1;
                    return;
                }
                Err(lease) => {
                    conn = lease.into_conn();
                    // Back to idle state for the next attempt.
                    if conn.transition(ConnState::Idle).is_err() {
                        inner.connections = inner.connections.saturating_sub(1);
                        return;
                    }
                }
            }
        }

        inner.idle.push_back(IdleConn {
            conn,
            since: clock::now(),
        });
    }

    /// Remove one specific idle connection (planner-ordered close).
    pub fn remove_idle(&self, conn_id: u64) -> Option<PhysicalConn> {
        let mut inner = self.inner.lock();
        let pos = inner.idle.iter().position(|c| c.conn.id == conn_id)?;
        let conn = inner.idle.remove(pos)?.conn;
        inner.connections = inner.connections.saturating_sub(1);
        Some(conn)
    }

    /// Drop accounting for a held connection that died and will not return.
    pub fn forget_in_use(&self) {
        let mut inner = self.inner.lock();
        inner.connections = inner.connections.saturating_sub(1);
        inner.inflight = inner.inflight.saturating_sub(1);
        inner.last_activity = clock::now();
    }

    /// Drain every idle connection (pool shutdown).
    pub fn drain_idle(&self) -> Vec<PhysicalConn> {
        let mut inner = self.inner.lock();
        let drained: Vec<PhysicalConn> = inner.idle.drain(..).map(|i| i.conn).collect();
        inner.connections = inner.connections.saturating_sub(drained.len() as u32);
        drained
    }

    /// Drop all parked waiters (pool shutdown); their receivers resolve
    /// with a closed-channel error.
    pub fn fail_waiters(&self) {
        self.inner.lock().waiters.clear();
    }

    pub fn metrics(&self) -> BlockMetrics {
        let inner = self.inner.lock();
        let idle_ages = inner
            .idle
            .iter()
            .map(|i| (i.conn.id, clock::elapsed_ns(i.since)))
            .collect();
        BlockMetrics {
            name: self.name.clone(),
            connections: inner.connections,
            inflight: inner.inflight,
            idle: inner.idle.len() as u32,
            waiters: inner.waiters.len() as u32,
            avg_hold_ns: inner.hold_hist.mean() as u64,
            idle_ages,
            ewma_demand: inner.ewma_demand,
            last_activity_ns: clock::elapsed_ns(inner.last_activity),
        }
    }
}

impl BlockInner {
    fn note_release(&mut self, hold_ns: u64) {
        self.last_activity = clock::now();
        self.hold_hist
            .saturating_record(hold_ns.max(1).min(HOLD_HISTOGRAM_MAX_NS));
        // Concurrency at release time: this holder plus everyone active or
        // queued. Scaled by hold time this approximates database-time
        // demand.
        let active = self.inflight.max(1) as f64 + self.waiters.len() as f64;
        let sample = hold_ns as f64 * active;
        self.ewma_demand = self.ewma_demand * (1.0 - DEMAND_EWMA_ALPHA) + sample * DEMAND_EWMA_ALPHA;
    }
}
