//! The `[general]` configuration section.

use serde_derive::{Deserialize, Serialize};

use super::byte_size::ByteSize;
use super::duration::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct General {
    /// Listen address for the binary protocol.
    pub host: String,
    pub port: u16,

    /// Listen port for the HTTP surface (EdgeQL-over-HTTP, health,
    /// metrics). Disabled when unset.
    pub http_port: Option<u16>,

    pub worker_threads: usize,

    /// Hard cap on a single protocol frame.
    pub max_message_size: ByteSize,

    /// Hard cap on backend connections across all branches.
    pub max_server_connections: u32,

    /// Minimum idle time before the pool may steal a connection for
    /// another branch.
    pub pool_hold_floor: Duration,

    /// Estimated cost of re-pointing a backend connection at another
    /// branch; stealing never fires below it.
    pub pool_reconnect_cost: Duration,

    pub pool_rebalance_interval: Duration,

    /// Bounded wait for a backend connection.
    pub query_wait_timeout: Duration,

    /// Idle backend connections older than this are closed.
    pub server_idle_timeout: Duration,

    pub session_idle_timeout: Duration,
    pub session_idle_transaction_timeout: Duration,
    pub query_execution_timeout: Duration,

    /// Handshake must complete within this window.
    pub handshake_timeout: Duration,

    pub query_cache_size: usize,

    /// `trust` or `scram`.
    pub auth_method: AuthMethodName,

    /// Default branch for clients that do not name one.
    pub default_branch: String,

    pub instance_name: String,

    /// Directory holding the run lock.
    pub data_dir: String,

    pub admin_ui: bool,

    /// Bearer token accepted on the HTTP surface when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Forward logs to syslog under this program name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syslog_prog_name: Option<String>,

    /// Graceful shutdown drain deadline.
    pub shutdown_timeout: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethodName {
    Trust,
    Scram,
}

impl Default for General {
    fn default() -> General {
        General {
            host: "127.0.0.1".to_string(),
            port: 5656,
            http_port: None,
            worker_threads: num_cpus::get(),
            max_message_size: ByteSize::from_mib(256),
            max_server_connections: 10,
            pool_hold_floor: Duration::from_secs(1),
            pool_reconnect_cost: Duration::from_millis(100),
            pool_rebalance_interval: Duration::from_secs(1),
            query_wait_timeout: Duration::from_secs(30),
            server_idle_timeout: Duration::from_mins(10),
            session_idle_timeout: Duration::from_mins(1),
            session_idle_transaction_timeout: Duration::from_secs(10),
            query_execution_timeout: Duration(0),
            handshake_timeout: Duration::from_secs(10),
            query_cache_size: 1000,
            auth_method: AuthMethodName::Scram,
            default_branch: "main".to_string(),
            instance_name: "gelway".to_string(),
            data_dir: ".".to_string(),
            admin_ui: false,
            secret_key: None,
            syslog_prog_name: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}
