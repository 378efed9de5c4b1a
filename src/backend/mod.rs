//! The physical backend seam.
//!
//! The wire driver for the backing store lives outside this crate; the pool
//! and sessions only see the minimal contract below: send a command,
//! consume result events, cancel out-of-band, reset onto another branch,
//! close. `loopback` provides the in-process implementation used by tests
//! and development servers.

pub mod loopback;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::errors::BackendError;

/// One unit of query output from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// One encoded result row.
    Row(Vec<u8>),
    /// The command finished; `status` is the command tag.
    Complete { status: String },
    /// The command failed. The connection itself may still be usable.
    Error(BackendError),
}

/// Out-of-band cancellation for a command in flight.
///
/// Must be safe to invoke from a different task than the one awaiting
/// `next_event`; implementations typically open a separate control channel.
pub trait BackendCancel: Send + Sync {
    fn cancel(&self) -> BoxFuture<'static, Result<(), BackendError>>;
}

/// A single physical connection to the backing store.
pub trait BackendConn: Send {
    /// Dispatch a command. Events are then drained via `next_event` until
    /// `Complete` or `Error`.
    fn send_query(
        &mut self,
        sql: &[u8],
        arguments: &[u8],
    ) -> BoxFuture<'_, Result<(), BackendError>>;

    fn next_event(&mut self) -> BoxFuture<'_, Result<BackendEvent, BackendError>>;

    /// Handle for cancelling the in-flight command from another task.
    fn cancel_handle(&self) -> Box<dyn BackendCancel>;

    /// Re-point this connection at another branch, discarding session-local
    /// backend state. Used when the pool transfers a connection between
    /// blocks.
    fn reset(&mut self, branch: &str) -> BoxFuture<'_, Result<(), BackendError>>;

    /// Whether the connection hit a protocol or transport failure and must
    /// not be pooled again.
    fn is_broken(&self) -> bool;

    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Factory for backend connections, one per configured backing store.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, branch: &str) -> BoxFuture<'_, Result<Box<dyn BackendConn>, BackendError>>;
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Idle,
    InUse,
    Reconnecting,
    Closing,
    Dead,
}

impl ConnState {
    /// Legal state transitions. `Closing` is reachable from anywhere.
    fn can_move_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Connecting, Idle)
                | (Idle, InUse)
                | (InUse, Idle)
                | (Idle, Reconnecting)
                | (Reconnecting, Idle)
                | (_, Closing)
                | (Closing, Dead)
        )
    }
}

/// A backend connection plus the bookkeeping the pool needs.
pub struct PhysicalConn {
    pub id: u64,
    branch: String,
    state: ConnState,
    pub conn: Box<dyn BackendConn>,
    /// Session-state descriptor last materialized on this connection, so a
    /// session can tell whether state must be replayed after a swap.
    pub session_state_id: Uuid,
}

impl std::fmt::Debug for PhysicalConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConn")
            .field("id", &self.id)
            .field("branch", &self.branch)
            .field("state", &self.state)
            .finish()
    }
}

impl PhysicalConn {
    pub fn new(id: u64, branch: &str, conn: Box<dyn BackendConn>) -> PhysicalConn {
        PhysicalConn {
            id,
            branch: branch.to_string(),
            state: ConnState::Connecting,
            conn,
            session_state_id: Uuid::nil(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Move to `next`, enforcing the lifecycle graph.
    pub fn transition(&mut self, next: ConnState) -> Result<(), BackendError> {
        if !self.state.can_move_to(next) {
            return Err(BackendError::Disconnected(format!(
                "illegal connection state transition {:?} -> {:?} on conn {}",
                self.state, next, self.id
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Complete a block transfer: the connection now belongs to `branch`.
    pub fn rebind(&mut self, branch: &str) {
        self.branch = branch.to_string();
        self.session_state_id = Uuid::nil();
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnState::Dead || self.conn.is_broken()
    }
}
