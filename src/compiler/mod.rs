//! The compiler gateway seam.
//!
//! Compilation is an external service: the frontend hands over command text
//! plus everything that affects the plan shape and receives an opaque group
//! of compiled units. The only structure the frontend relies on is the
//! metadata each unit is annotated with (capabilities, cardinality, type
//! descriptor ids, value-dependent variables, transaction control and
//! session mutations).

pub mod heuristic;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::errors::QueryError;
use crate::protocol::types::{
    Capabilities, Cardinality, InputLanguage, OutputFormat, ProtocolVersion,
};
use crate::session::Scalar;

/// Transaction control carried by a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxControl {
    Start,
    Commit,
    Rollback,
}

/// One session-state mutation a unit performs when executed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOp {
    SetAlias(String, String),
    UnsetAlias(String),
    SetConfig(String, Scalar),
    UnsetConfig(String),
    SetGlobal(String, Scalar),
    UnsetGlobal(String),
}

/// A single compiled unit: backend SQL plus serialization metadata.
/// Immutable once produced; the cache shares it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: Bytes,
    /// `CommandComplete` status string, e.g. `"SELECT"`.
    pub status: String,
    pub capabilities: Capabilities,
    pub cardinality: Cardinality,
    pub input_typedesc_id: Uuid,
    pub input_typedesc: Bytes,
    pub output_typedesc_id: Uuid,
    pub output_typedesc: Bytes,
    pub state_typedesc_id: Uuid,
    /// Positional parameter names, in argument-tuple order.
    pub param_names: Vec<String>,
    /// Parameter names whose *values* influenced the plan.
    pub cache_deps_vars: BTreeSet<String>,
    pub tx_control: Option<TxControl>,
    pub session_ops: Vec<SessionOp>,
}

impl CompiledQuery {
    /// Argument-tuple index of a named parameter.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|p| p == name)
    }
}

/// The unit group returned by one compile call. Scripts produce several
/// units; the single-unit case dominates.
#[derive(Debug, Clone, Default)]
pub struct CompiledQueryGroup {
    pub units: SmallVec<[Arc<CompiledQuery>; 1]>,
}

impl CompiledQueryGroup {
    pub fn single(unit: CompiledQuery) -> CompiledQueryGroup {
        CompiledQueryGroup {
            units: SmallVec::from_elem(Arc::new(unit), 1),
        }
    }

    /// Union of the capabilities every unit needs.
    pub fn capabilities(&self) -> Capabilities {
        self.units
            .iter()
            .fold(Capabilities::NONE, |acc, u| acc.union(u.capabilities))
    }

    /// Union of value-dependent variable names across units.
    pub fn cache_deps_vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for unit in &self.units {
            out.extend(unit.cache_deps_vars.iter().cloned());
        }
        out
    }

    /// Tuple index of a named parameter in any unit.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.units.iter().find_map(|u| u.param_index(name))
    }

    /// Metadata of the unit that describes the result set: the last one
    /// producing data, or the last unit overall.
    pub fn describing_unit(&self) -> Option<&Arc<CompiledQuery>> {
        self.units
            .iter()
            .rev()
            .find(|u| u.cardinality != Cardinality::NoResult)
            .or_else(|| self.units.last())
    }
}

/// Everything that affects the compiled plan.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub query: String,
    pub branch: String,
    pub protocol_version: ProtocolVersion,
    pub schema_version: u64,
    pub input_language: InputLanguage,
    pub output_format: OutputFormat,
    pub expected_cardinality: Cardinality,
    pub implicit_limit: u64,
    pub compilation_flags: u64,
    pub modaliases: BTreeMap<String, String>,
    /// Values for variables a previous compile declared plan-affecting.
    /// Empty on first-level compiles.
    pub variables: Vec<(String, Vec<u8>)>,
}

/// The opaque compile service.
///
/// `compile` must be safe to call concurrently; the query cache guarantees
/// at most one in-flight compile per cache key.
pub trait CompilerGateway: Send + Sync {
    fn compile(
        &self,
        request: CompileRequest,
    ) -> BoxFuture<'_, Result<CompiledQueryGroup, QueryError>>;
}
