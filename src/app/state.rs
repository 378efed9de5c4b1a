//! Shared server state handed to every session and HTTP handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::cache::QueryCache;
use crate::compiler::CompilerGateway;
use crate::config::Config;
use crate::errors::Error;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::utils::cancel::CancelToken;

pub struct ServerState {
    pub config: Arc<Config>,
    pub cache: QueryCache,
    pub pool: ConnectionPool,
    pub gateway: Arc<dyn CompilerGateway>,
    /// External GraphQL-to-EdgeQL translator, when one is wired in.
    pub graphql: once_cell::sync::OnceCell<Arc<dyn crate::http::GraphqlTranslator>>,
    pub authenticator: Authenticator,
    /// Bumped on DDL; logically invalidates all cached plans.
    pub schema_version: AtomicU64,
    pub shutdown: CancelToken,
    next_session_id: AtomicU64,
}

impl ServerState {
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<dyn CompilerGateway>,
        connector: Arc<dyn crate::backend::BackendConnector>,
    ) -> Result<Arc<ServerState>, Error> {
        let general = &config.general;
        let pool = ConnectionPool::new(
            PoolOptions {
                total_cap: general.max_server_connections,
                hold_floor: general.pool_hold_floor.as_std(),
                reconnect_cost: general.pool_reconnect_cost.as_std(),
                rebalance_tick: general.pool_rebalance_interval.as_std(),
                acquire_timeout: general.query_wait_timeout.as_std(),
                idle_cull: general.server_idle_timeout.rounded_for_timeout(),
            },
            connector,
        );
        let authenticator = Authenticator::from_config(&config)?;
        Ok(Arc::new(ServerState {
            cache: QueryCache::new(config.general.query_cache_size),
            pool,
            gateway,
            graphql: once_cell::sync::OnceCell::new(),
            authenticator,
            schema_version: AtomicU64::new(1),
            shutdown: CancelToken::new(),
            next_session_id: AtomicU64::new(1),
            config,
        }))
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::Acquire)
    }

    /// DDL ran: all existing cache keys become unreachable.
    pub fn bump_schema_version(&self) {
        self.schema_version.fetch_add(1, Ordering::AcqRel);
    }
}
