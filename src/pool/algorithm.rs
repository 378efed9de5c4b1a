//! The pool planner: a pure function from block metrics to rebalancing
//! decisions. No locks, no clocks, no I/O. The pool snapshots metrics,
//! asks for a plan, and executes it, re-checking each block under its own
//! mutex as it goes.

use std::collections::BTreeMap;

use super::block::BlockMetrics;

#[derive(Debug, Clone, Copy)]
pub struct AlgorithmConfig {
    pub total_cap: u32,
    pub hold_floor_ns: u64,
    pub reconnect_cost_ns: u64,
    /// Idle connections older than this are closed outright on the
    /// rebalance tick. `None` disables culling.
    pub cull_idle_ns: Option<u64>,
}

impl AlgorithmConfig {
    /// No connection may be stolen before it has idled this long; every
    /// transfer must amortize its reconnect cost.
    pub fn steal_floor_ns(&self) -> u64 {
        self.hold_floor_ns.max(self.reconnect_cost_ns)
    }
}

/// Metrics snapshot of the whole pool. Keyed by block name; `BTreeMap`
/// iteration order makes every planning pass deterministic.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub blocks: BTreeMap<String, BlockMetrics>,
    pub total_conns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockClass {
    /// Under-provisioned: has waiters, or demand exceeds what its current
    /// connections can serve.
    Hungry,
    /// Has idle connections it demonstrably does not need, old enough to
    /// give away.
    Overfull,
    Satisfied,
}

/// Planner output, executed op by op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    /// Steal the oldest eligible idle connection of `src` for `dst`.
    Transfer { src: String, dst: String },
    /// Open a fresh connection for `block`.
    Create { block: String },
    /// Close one specific idle connection.
    Close { block: String, conn: u64 },
    /// Route a just-released connection to `block` instead of re-pooling
    /// it where it was held.
    ReleaseTo { block: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub ops: Vec<PlanOp>,
}

/// Decision for an acquire that found no idle connection in its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireAction {
    Create,
    Steal { src: String },
    Wait,
}

/// Decision for a release when no waiter is parked on the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseAction {
    KeepIdle,
    TransferTo { dst: String },
}

/// Expected service capacity of a block: connections x average hold.
fn capacity(m: &BlockMetrics) -> f64 {
    m.connections as f64 * m.avg_hold_ns as f64
}

fn demand(m: &BlockMetrics) -> f64 {
    m.ewma_demand
}

/// How far demand exceeds capacity. Positive for hungry blocks.
fn deficit(m: &BlockMetrics) -> f64 {
    demand(m) - capacity(m)
}

pub fn classify(m: &BlockMetrics, config: &AlgorithmConfig) -> BlockClass {
    if m.waiters > 0 || demand(m) > capacity(m) {
        return BlockClass::Hungry;
    }
    if m.idle > 0
        && demand(m) < capacity(m)
        && m.oldest_idle_age_ns() >= config.steal_floor_ns()
    {
        return BlockClass::Overfull;
    }
    BlockClass::Satisfied
}

/// Fair share of the pool for each block: `total_cap * demand / sum demand`.
pub fn quota(snapshot: &PoolSnapshot, config: &AlgorithmConfig, block: &str) -> f64 {
    let total_demand: f64 = snapshot.blocks.values().map(demand).sum();
    if total_demand <= 0.0 {
        return 0.0;
    }
    let block_demand = snapshot.blocks.get(block).map(demand).unwrap_or(0.0);
    config.total_cap as f64 * block_demand / total_demand
}

/// Pick a steal victim for `dst`: the overfull block with the oldest idle
/// connection, lowest demand breaking age ties, block name breaking exact
/// ties for determinism.
fn pick_victim<'a>(
    snapshot: &'a PoolSnapshot,
    config: &AlgorithmConfig,
    dst: &str,
) -> Option<&'a BlockMetrics> {
    snapshot
        .blocks
        .values()
        .filter(|m| m.name != dst && classify(m, config) == BlockClass::Overfull)
        .max_by(|a, b| {
            a.oldest_idle_age_ns()
                .cmp(&b.oldest_idle_age_ns())
                .then_with(|| {
                    demand(b)
                        .partial_cmp(&demand(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                // BTreeMap iterates names ascending; prefer the
                // lexicographically smaller name on full ties.
                .then_with(|| b.name.cmp(&a.name))
        })
}

/// Acquire hot path, consulted only when the block has no idle connection.
pub fn plan_acquire(
    snapshot: &PoolSnapshot,
    config: &AlgorithmConfig,
    block: &str,
) -> AcquireAction {
    if snapshot.total_conns < config.total_cap {
        return AcquireAction::Create;
    }
    match pick_victim(snapshot, config, block) {
        Some(victim) => AcquireAction::Steal {
            src: victim.name.clone(),
        },
        None => AcquireAction::Wait,
    }
}

/// Release path, consulted when the releasing block has no waiters.
pub fn plan_release(
    snapshot: &PoolSnapshot,
    config: &AlgorithmConfig,
    block: &str,
) -> ReleaseAction {
    let Some(own) = snapshot.blocks.get(block) else {
        return ReleaseAction::KeepIdle;
    };
    if classify(own, config) == BlockClass::Hungry {
        return ReleaseAction::KeepIdle;
    }

    // Hungriest block actually parked on the pool gets the connection.
    let hungriest = snapshot
        .blocks
        .values()
        .filter(|m| m.name != block && m.waiters > 0)
        .max_by(|a, b| {
            deficit(a)
                .partial_cmp(&deficit(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.name.cmp(&a.name))
        });
    match hungriest {
        Some(h) => ReleaseAction::TransferTo {
            dst: h.name.clone(),
        },
        None => ReleaseAction::KeepIdle,
    }
}

/// Periodic rebalance: pair hungry blocks (deepest deficit first) with
/// overfull blocks (oldest idle first) and move one connection per pair.
/// Separately, close idle connections past the cull age.
pub fn plan_rebalance(snapshot: &PoolSnapshot, config: &AlgorithmConfig) -> Plan {
    let mut plan = Plan::default();

    let mut hungry: Vec<&BlockMetrics> = snapshot
        .blocks
        .values()
        .filter(|m| classify(m, config) == BlockClass::Hungry)
        .collect();
    hungry.sort_by(|a, b| {
        deficit(b)
            .partial_cmp(&deficit(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut overfull: Vec<&BlockMetrics> = snapshot
        .blocks
        .values()
        .filter(|m| classify(m, config) == BlockClass::Overfull)
        .collect();
    overfull.sort_by(|a, b| {
        b.oldest_idle_age_ns()
            .cmp(&a.oldest_idle_age_ns())
            .then_with(|| a.name.cmp(&b.name))
    });

    for (dst, src) in hungry.iter().zip(overfull.iter()) {
        plan.ops.push(PlanOp::Transfer {
            src: src.name.clone(),
            dst: dst.name.clone(),
        });
    }

    if let Some(cull_ns) = config.cull_idle_ns {
        let cull_after = cull_ns.max(config.steal_floor_ns());
        let transferred: Vec<String> = plan
            .ops
            .iter()
            .filter_map(|op| match op {
                PlanOp::Transfer { src, .. } => Some(src.clone()),
                _ => None,
            })
            .collect();
        for m in snapshot.blocks.values() {
            // Never cull from a block already chosen as a transfer source
            // this tick; the transfer claims its oldest idle connection.
            if transferred.iter().any(|s| s == &m.name) {
                continue;
            }
            for (conn, age) in m.idle_ages.iter() {
                if *age >= cull_after {
                    plan.ops.push(PlanOp::Close {
                        block: m.name.clone(),
                        conn: *conn,
                    });
                }
            }
        }
    }

    plan
}
