//! Compiled-query cache.
//!
//! Maps a fingerprint of (query, shape, output format, protocol version,
//! schema version) to a compiled unit group. Queries whose plan depends on
//! runtime argument *values* (e.g. a constant-folded `limit`) get a
//! two-level structure: the first-level entry is a redirect naming the
//! value-dependent variables, and the plan itself lives under a second-level
//! key extended with those values.
//!
//! Concurrent lookups for the same missing key coalesce onto a single
//! compile; everyone observes the same result or the same error. Errors are
//! never cached. Eviction is approximate LRU driven by a global use counter,
//! the same scheme the backend prepared-statement cache uses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::sync::watch;
use xxhash_rust::xxh3::xxh3_64;

use crate::compiler::{CompileRequest, CompiledQueryGroup, CompilerGateway};
use crate::errors::QueryError;
use crate::protocol::types::{OutputFormat, ProtocolVersion};

/// Values of the redirect variables, in `key_var_names` order. Empty for
/// first-level keys.
pub type ValueKey = SmallVec<[Vec<u8>; 2]>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query_hash: u64,
    pub shape_hash: u64,
    pub output_format: OutputFormat,
    pub protocol_version: ProtocolVersion,
    pub schema_version: u64,
    pub value_key: ValueKey,
}

impl CacheKey {
    fn first_level(request: &CompileRequest) -> CacheKey {
        let mut shape = String::new();
        for (alias, module) in &request.modaliases {
            shape.push_str(alias);
            shape.push('\0');
            shape.push_str(module);
            shape.push('\0');
        }
        shape.push_str(request.branch.as_str());
        CacheKey {
            query_hash: xxh3_64(normalize(&request.query).as_bytes()),
            shape_hash: xxh3_64(
                format!(
                    "{shape}\0{:?}\0{}\0{}\0{}",
                    request.input_language,
                    request.expected_cardinality as u8,
                    request.implicit_limit,
                    request.compilation_flags
                )
                .as_bytes(),
            ),
            output_format: request.output_format,
            protocol_version: request.protocol_version,
            schema_version: request.schema_version,
            value_key: SmallVec::new(),
        }
    }

    fn with_values(&self, values: ValueKey) -> CacheKey {
        let mut key = self.clone();
        key.value_key = values;
        key
    }
}

/// Collapse insignificant whitespace so formatting differences share a plan.
pub fn normalize(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut last_space = true;
    for c in query.trim().chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

/// First-level entry pointing at the true, value-extended key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRedirect {
    /// Variable names participating in the second-level key, sorted
    /// lexicographically.
    pub key_var_names: Vec<String>,
    /// Argument-tuple index for each name, aligned with `key_var_names`.
    pub positions: Vec<Option<usize>>,
}

impl CacheRedirect {
    fn from_group(group: &CompiledQueryGroup, existing: Option<&CacheRedirect>) -> CacheRedirect {
        let mut names: Vec<String> = group.cache_deps_vars().into_iter().collect();
        if let Some(existing) = existing {
            for name in &existing.key_var_names {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names.sort();
        let positions = names.iter().map(|n| group.param_index(n)).collect();
        CacheRedirect {
            key_var_names: names,
            positions,
        }
    }

    /// Extract the second-level value tuple from positional argument values.
    fn value_key(&self, args: &[Vec<u8>]) -> ValueKey {
        self.positions
            .iter()
            .map(|idx| match idx {
                Some(i) => args.get(*i).cloned().unwrap_or_default(),
                None => Vec::new(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum CacheEntry {
    Compiled(Arc<CompiledQueryGroup>),
    Redirect(Arc<CacheRedirect>),
}

type PendingResult = Option<Result<CacheEntry, QueryError>>;

enum Slot {
    Ready { entry: CacheEntry, used: u64 },
    Pending { rx: watch::Receiver<PendingResult> },
}

/// Counters exported to metrics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub compiles: AtomicU64,
    pub evictions: AtomicU64,
}

pub struct QueryCache {
    entries: DashMap<CacheKey, Slot>,
    max_size: usize,
    counter: AtomicU64,
    pub stats: CacheStats,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("size", &self.entries.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl QueryCache {
    pub fn new(mut max_size: usize) -> QueryCache {
        // Cannot be zero
        if max_size == 0 {
            max_size = 1;
        }
        QueryCache {
            entries: DashMap::with_capacity(max_size.min(4096)),
            max_size,
            counter: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Look up a compiled group, dispatching at most one compile per key.
    ///
    /// `args` are the positional argument values of the current Execute,
    /// used to build second-level keys behind redirects and handed to the
    /// compiler for value-dependent plans.
    pub async fn lookup_or_compile(
        &self,
        request: &CompileRequest,
        args: &[Vec<u8>],
        gateway: &dyn CompilerGateway,
    ) -> Result<Arc<CompiledQueryGroup>, QueryError> {
        let first_key = CacheKey::first_level(request);
        loop {
            match self.probe(&first_key) {
                Probe::Hit(CacheEntry::Compiled(group)) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(group);
                }
                Probe::Hit(CacheEntry::Redirect(redirect)) => {
                    return self
                        .lookup_second_level(&first_key, redirect, request, args, gateway)
                        .await;
                }
                Probe::Wait(rx) => {
                    match self.wait_pending(rx).await {
                        // The owner stored the entry before notifying;
                        // re-probing hits it.
                        Some(Ok(_)) | None => continue,
                        // Coalesced lookups share the owner's error.
                        Some(Err(err)) => return Err(err),
                    }
                }
                Probe::Claimed(tx) => {
                    return self
                        .compile_first_level(first_key, tx, request, args, gateway)
                        .await;
                }
            }
        }
    }

    async fn lookup_second_level(
        &self,
        first_key: &CacheKey,
        redirect: Arc<CacheRedirect>,
        request: &CompileRequest,
        args: &[Vec<u8>],
        gateway: &dyn CompilerGateway,
    ) -> Result<Arc<CompiledQueryGroup>, QueryError> {
        let second_key = first_key.with_values(redirect.value_key(args));
        loop {
            match self.probe(&second_key) {
                Probe::Hit(CacheEntry::Compiled(group)) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(group);
                }
                Probe::Hit(CacheEntry::Redirect(_)) => {
                    // Second-level entries are always plans.
                    warn!("redirect found under a value-extended cache key; recompiling");
                    self.entries.remove(&second_key);
                    continue;
                }
                Probe::Wait(rx) => {
                    match self.wait_pending(rx).await {
                        Some(Ok(_)) | None => continue,
                        Some(Err(err)) => return Err(err),
                    }
                }
                Probe::Claimed(tx) => {
                    let mut guard = PendingGuard::new(self, second_key.clone(), tx);
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    let mut req = request.clone();
                    req.variables = redirect
                        .key_var_names
                        .iter()
                        .zip(redirect.value_key(args))
                        .map(|(name, value)| (name.clone(), value))
                        .collect();
                    let group = Arc::new(self.dispatch_compile(req, gateway, &mut guard).await?);

                    // A recompile may widen the dependency set; keep the
                    // redirect in sync so future lookups key on the union.
                    let updated = CacheRedirect::from_group(&group, Some(&redirect));
                    if updated != *redirect {
                        self.store_ready(
                            first_key.clone(),
                            CacheEntry::Redirect(Arc::new(updated)),
                        );
                    }

                    let entry = CacheEntry::Compiled(group.clone());
                    self.store_ready(second_key, entry.clone());
                    guard.complete(Ok(entry));
                    return Ok(group);
                }
            }
        }
    }

    async fn compile_first_level(
        &self,
        first_key: CacheKey,
        tx: watch::Sender<PendingResult>,
        request: &CompileRequest,
        args: &[Vec<u8>],
        gateway: &dyn CompilerGateway,
    ) -> Result<Arc<CompiledQueryGroup>, QueryError> {
        let mut guard = PendingGuard::new(self, first_key.clone(), tx);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let group = Arc::new(
            self.dispatch_compile(request.clone(), gateway, &mut guard)
                .await?,
        );

        let deps = group.cache_deps_vars();
        if deps.is_empty() {
            let entry = CacheEntry::Compiled(group.clone());
            self.store_ready(first_key, entry.clone());
            guard.complete(Ok(entry));
        } else {
            debug!(
                "query depends on variable values {:?}; installing cache redirect",
                deps
            );
            let redirect = Arc::new(CacheRedirect::from_group(&group, None));
            let second_key = first_key.with_values(redirect.value_key(args));
            let entry = CacheEntry::Redirect(redirect);
            self.store_ready(first_key, entry.clone());
            self.store_ready(second_key, CacheEntry::Compiled(group.clone()));
            guard.complete(Ok(entry));
        }
        Ok(group)
    }

    async fn dispatch_compile(
        &self,
        request: CompileRequest,
        gateway: &dyn CompilerGateway,
        guard: &mut PendingGuard<'_>,
    ) -> Result<CompiledQueryGroup, QueryError> {
        self.stats.compiles.fetch_add(1, Ordering::Relaxed);
        match gateway.compile(request).await {
            Ok(group) => Ok(group),
            Err(err) => {
                // Compile errors are surfaced, never cached.
                guard.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn probe(&self, key: &CacheKey) -> Probe {
        use dashmap::mapref::entry::Entry;
        let stamp = self.counter.fetch_add(1, Ordering::Relaxed);
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Slot::Ready { entry, used } => {
                    *used = stamp;
                    Probe::Hit(entry.clone())
                }
                Slot::Pending { rx } => Probe::Wait(rx.clone()),
            },
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(Slot::Pending { rx });
                Probe::Claimed(tx)
            }
        }
    }

    /// Wait for the in-flight compile owning this key. Returns the owner's
    /// outcome, or `None` when the owner vanished without one (the caller
    /// re-probes and may claim the compile itself).
    async fn wait_pending(
        &self,
        mut rx: watch::Receiver<PendingResult>,
    ) -> Option<Result<CacheEntry, QueryError>> {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return Some(result);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    fn store_ready(&self, key: CacheKey, entry: CacheEntry) {
        if self.entries.len() >= self.max_size {
            self.evict_oldest();
        }
        let used = self.counter.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, Slot::Ready { entry, used });
    }

    /// Evict the least recently used ready entry (approximate LRU).
    fn evict_oldest(&self) {
        let mut oldest_key: Option<CacheKey> = None;
        let mut oldest_time = u64::MAX;

        for entry in self.entries.iter() {
            if let Slot::Ready { used, .. } = entry.value() {
                if *used < oldest_time {
                    oldest_time = *used;
                    oldest_key = Some(entry.key().clone());
                }
            }
        }

        if let Some(key) = oldest_key {
            if self.entries.remove(&key).is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("evicted compiled query (query_hash={:x})", key.query_hash);
            }
        }
    }
}

enum Probe {
    Hit(CacheEntry),
    Wait(watch::Receiver<PendingResult>),
    Claimed(watch::Sender<PendingResult>),
}

/// Removes a dangling pending slot if the compile owner bails out early
/// (cancellation, panic), so waiters can re-claim the key.
struct PendingGuard<'a> {
    cache: &'a QueryCache,
    key: CacheKey,
    tx: watch::Sender<PendingResult>,
    done: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(cache: &'a QueryCache, key: CacheKey, tx: watch::Sender<PendingResult>) -> Self {
        PendingGuard {
            cache,
            key,
            tx,
            done: false,
        }
    }

    fn complete(&mut self, result: Result<CacheEntry, QueryError>) {
        self.done = true;
        if result.is_err() {
            // The slot still holds Pending for errors; drop it so the next
            // lookup compiles again.
            self.remove_pending();
        }
        let _ = self.tx.send(Some(result));
    }

    fn remove_pending(&self) {
        self.cache
            .entries
            .remove_if(&self.key, |_, slot| matches!(slot, Slot::Pending { .. }));
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.remove_pending();
        }
    }
}

#[cfg(test)]
mod cache_tests;
