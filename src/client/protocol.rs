//! The Parse/Execute/Sync command loop and the backend execution pipeline.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use xxhash_rust::xxh3::xxh3_64;

use super::core::{FrontendSession, SessionPhase};
use crate::backend::BackendEvent;
use crate::cache::normalize;
use crate::compiler::{CompileRequest, CompiledQuery, CompiledQueryGroup, SessionOp, TxControl};
use crate::errors::{
    CapabilityError, Error, ErrorCode, QueryError, TransactionError,
};
use crate::pool::Lease;
use crate::protocol::messages::{ClientMessage, ExecuteParams, QueryParams, ServerMessage};
use crate::protocol::types::{Capabilities, Cardinality, ProtocolVersion};
use crate::protocol::wire::parse_argument_tuple;
use crate::stats::{SESSION_STATE_EXECUTING, SESSION_STATE_IDLE, SESSION_STATE_WAITING};

impl<S, T> FrontendSession<S, T>
where
    S: AsyncRead + Unpin,
    T: AsyncWrite + Unpin,
{
    /// Serve commands until the client terminates, disconnects, or a fatal
    /// error closes the session.
    pub(crate) async fn ready_loop(&mut self) -> Result<(), Error> {
        let config = self.server.config.clone();
        loop {
            if self.phase == SessionPhase::Closing {
                return Ok(());
            }

            let in_tx = self.session.in_transaction();
            let idle_timeout = if in_tx {
                config
                    .general
                    .session_idle_transaction_timeout
                    .rounded_for_timeout()
            } else if config.general.session_idle_timeout.is_zero() {
                None
            } else {
                // The session idle timeout keeps sub-millisecond values.
                Some(config.general.session_idle_timeout.as_std())
            };

            let frame = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.next_frame()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        if in_tx {
                            self.on_idle_transaction_timeout().await?;
                            continue;
                        }
                        let err = Error::SessionIdleTimeout;
                        self.report_error(&err).await?;
                        return Err(err);
                    }
                },
                None => self.next_frame().await?,
            };
            let Some(frame) = frame else {
                debug!("[session: {}] client disconnected", self.id);
                return Ok(());
            };

            let message = match ClientMessage::decode(&frame) {
                Ok(message) => message,
                Err(err) => {
                    let err = Error::from(err);
                    self.report_error(&err).await?;
                    return Err(err);
                }
            };

            // After an error, input is discarded until the next Sync.
            if self.skip_until_sync
                && !matches!(message, ClientMessage::Sync | ClientMessage::Terminate)
            {
                continue;
            }

            match message {
                ClientMessage::Parse(params) => {
                    if let Err(err) = self.handle_parse(params).await {
                        self.report_error(&err).await?;
                        if self.phase == SessionPhase::Closing {
                            return Err(err);
                        }
                    }
                }
                ClientMessage::Execute(params) => {
                    if let Err(err) = self.handle_execute(params).await {
                        self.report_error(&err).await?;
                        if self.phase == SessionPhase::Closing {
                            return Err(err);
                        }
                    }
                }
                ClientMessage::Sync => self.handle_sync().await?,
                ClientMessage::Flush => self.flush_out().await?,
                ClientMessage::Terminate => {
                    debug!("[session: {}] terminated by client", self.id);
                    return Ok(());
                }
                ClientMessage::Dump { .. }
                | ClientMessage::Restore { .. }
                | ClientMessage::RestoreBlock { .. }
                | ClientMessage::RestoreEof => {
                    let err = Error::Unsupported("dump and restore");
                    self.report_error(&err).await?;
                }
                other => {
                    let err = Error::from(crate::errors::ProtocolError::UnexpectedMessage {
                        expected: "a command message",
                        got: other.kind() as char,
                    });
                    self.report_error(&err).await?;
                    return Err(err);
                }
            }
        }
    }

    /// Parse: compile (through the cache) and describe, without executing.
    async fn handle_parse(&mut self, params: QueryParams) -> Result<(), Error> {
        self.restore_state(&params)?;
        let request = self.compile_request(&params);
        let group = self
            .server
            .cache
            .lookup_or_compile(&request, &[], self.server.gateway.as_ref())
            .await?;
        self.pending_prepared.put(fingerprint(&request), group.clone());
        self.queue_data_description(&group);
        Ok(())
    }

    async fn handle_execute(&mut self, params: ExecuteParams) -> Result<(), Error> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        self.stats.set_state(SESSION_STATE_EXECUTING);
        self.phase = SessionPhase::Executing;
        let result = self.execute_inner(&params).await;
        self.stats.set_state(SESSION_STATE_IDLE);
        if result.is_ok() {
            self.phase = SessionPhase::ReadyForSync;
        }
        result
    }

    async fn execute_inner(&mut self, params: &ExecuteParams) -> Result<(), Error> {
        let q = &params.query;
        self.restore_state(q)?;

        // A failed transaction accepts nothing but ROLLBACK; the backend is
        // not consulted.
        if self.session.in_failed_transaction() && !is_rollback(&q.command_text) {
            return Err(TransactionError::InFailedTransaction.into());
        }

        let args = parse_argument_tuple(&params.arguments)?;
        let request = self.compile_request(q);
        let prepared = self
            .pending_prepared
            .get(&fingerprint(&request))
            .filter(|group| group.cache_deps_vars().is_empty())
            .cloned();
        let group = match prepared {
            Some(group) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                group
            }
            None => {
                self.server
                    .cache
                    .lookup_or_compile(&request, &args, self.server.gateway.as_ref())
                    .await?
            }
        };

        if args.is_empty() && group.units.iter().any(|u| !u.param_names.is_empty()) {
            return Err(QueryError {
                code: ErrorCode::QUERY,
                message: "parameterized query was executed without arguments".to_string(),
                line: None,
                col: None,
            }
            .into());
        }

        // Capability enforcement: what the query needs vs what the client
        // allowed, minus what this transport forbids outright.
        let required = group.capabilities();
        let allowed = Capabilities(
            q.allowed_capabilities.0 & !self.transport.forbidden_capabilities().0,
        );
        let missing = required.missing_from(allowed);
        if !missing.is_empty() {
            return Err(CapabilityError {
                required: required.0,
                allowed: allowed.0,
            }
            .into());
        }

        // Re-describe when the client's cached descriptors went stale.
        if let Some(unit) = group.describing_unit() {
            if params.input_typedesc_id != unit.input_typedesc_id
                || params.output_typedesc_id != unit.output_typedesc_id
            {
                self.queue_data_description(&group);
            }
        }

        // Inside a transaction every query runs on the pinned connection;
        // otherwise the lease acquired here stays until Sync.
        if self.lease.is_none() {
            self.stats.set_state(SESSION_STATE_WAITING);
            let lease = self.server.pool.acquire(&self.branch, &self.cancel).await?;
            self.stats.set_state(SESSION_STATE_EXECUTING);
            self.lease = Some(lease);
        }

        let status = self.run_units(&group, params).await?;

        let (state_id, state_blob) = self.session.serialize();
        self.queue(&ServerMessage::CommandComplete {
            annotations: vec![],
            capabilities: required,
            status,
            state_typedesc_id: state_id,
            state_data: state_blob,
        });
        self.last_capabilities = required;
        Ok(())
    }

    /// Execute every unit of the group in order on the held connection.
    async fn run_units(
        &mut self,
        group: &CompiledQueryGroup,
        params: &ExecuteParams,
    ) -> Result<String, Error> {
        let query_timeout = self
            .server
            .config
            .general
            .query_execution_timeout
            .rounded_for_timeout();
        let mut status = String::from("OK");

        for unit in &group.units {
            // Frontend-side transaction validation happens before the
            // backend sees the command.
            match unit.tx_control {
                Some(TxControl::Start) => self.session.begin_transaction()?,
                Some(TxControl::Commit) => self.session.commit_transaction()?,
                Some(TxControl::Rollback) => self.session.rollback_transaction()?,
                None => {}
            }

            let Some(mut lease) = self.lease.take() else {
                return Err(Error::Internal("no backend lease held".to_string()));
            };
            let outcome = self
                .drive_backend(&mut lease, unit, params, query_timeout)
                .await;
            self.lease = Some(lease);

            match outcome {
                Ok(unit_status) => {
                    status = unit_status;
                    for op in &unit.session_ops {
                        self.apply_session_op(op);
                    }
                    if unit.capabilities.contains(Capabilities::DDL) {
                        self.server.bump_schema_version();
                    }
                }
                Err(err) => {
                    if unit.tx_control.is_some() {
                        // Frontend and backend now disagree about the
                        // transaction; discard the connection and reset.
                        if let Some(lease) = self.lease.as_mut() {
                            lease.mark_broken();
                        }
                        let _ = self.session.rollback_transaction();
                    } else {
                        self.session.fail_transaction();
                    }
                    return Err(err);
                }
            }
        }
        Ok(status)
    }

    /// Send one unit and stream its result events back to the client.
    async fn drive_backend(
        &mut self,
        lease: &mut Lease,
        unit: &Arc<CompiledQuery>,
        params: &ExecuteParams,
        query_timeout: Option<Duration>,
    ) -> Result<String, Error> {
        if let Err(err) = lease.conn.send_query(&unit.sql, &params.arguments).await {
            lease.mark_broken();
            self.session.backend_lost();
            return Err(err.into());
        }

        let deadline = query_timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            let event = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, lease.conn.next_event()).await {
                        Ok(event) => event,
                        Err(_) => {
                            warn!(
                                "[session: {}] query exceeded execution timeout, cancelling",
                                self.id
                            );
                            let cancel = lease.conn.cancel_handle();
                            let _ = cancel.cancel().await;
                            // Drain the cancellation error the backend
                            // reports for the aborted command.
                            let _ = tokio::time::timeout(
                                Duration::from_secs(1),
                                lease.conn.next_event(),
                            )
                            .await;
                            self.session.fail_transaction();
                            return Err(Error::QueryTimeout);
                        }
                    }
                }
                None => lease.conn.next_event().await,
            };

            match event {
                Ok(BackendEvent::Row(row)) => {
                    self.queue(&ServerMessage::Data { rows: vec![row] });
                    // Flushing mid-stream keeps memory bounded and notices
                    // clients that went away.
                    if self.out.len() > 64 * 1024 {
                        self.flush_out().await?;
                    }
                }
                Ok(BackendEvent::Complete { status }) => return Ok(status),
                Ok(BackendEvent::Error(backend_err)) => {
                    let err = match backend_err.as_query_error() {
                        Some(query_err) => Error::Query(query_err),
                        None => Error::Backend(backend_err),
                    };
                    return Err(err);
                }
                Err(err) => {
                    lease.mark_broken();
                    self.session.backend_lost();
                    return Err(err.into());
                }
            }
        }
    }

    /// Sync: flush pending output, report transaction state, release the
    /// backend connection unless a transaction pins it.
    pub(crate) async fn handle_sync(&mut self) -> Result<(), Error> {
        self.skip_until_sync = false;
        if !self.session.in_transaction() {
            self.lease = None;
        }
        self.queue(&ServerMessage::ReadyForCommand {
            annotations: vec![],
            transaction_state: self.session.transaction_state(),
        });
        self.flush_out().await?;
        self.phase = SessionPhase::Ready;
        Ok(())
    }

    async fn on_idle_transaction_timeout(&mut self) -> Result<(), Error> {
        warn!(
            "[session: {}] transaction idle too long, rolling back",
            self.id
        );
        // The backend connection still has the transaction open; discard it
        // rather than pooling it dirty.
        if let Some(mut lease) = self.lease.take() {
            lease.mark_broken();
        }
        let _ = self.session.rollback_transaction();
        self.report_error(&Error::IdleTransactionTimeout).await?;
        self.queue(&ServerMessage::ReadyForCommand {
            annotations: vec![],
            transaction_state: self.session.transaction_state(),
        });
        self.flush_out().await?;
        self.skip_until_sync = false;
        Ok(())
    }

    fn restore_state(&mut self, q: &QueryParams) -> Result<(), Error> {
        self.session.restore(q.state_typedesc_id, &q.state_data)?;
        Ok(())
    }

    fn compile_request(&self, q: &QueryParams) -> CompileRequest {
        CompileRequest {
            query: q.command_text.clone(),
            branch: self.branch.clone(),
            protocol_version: ProtocolVersion::CURRENT,
            schema_version: self.server.schema_version(),
            input_language: q.input_language,
            output_format: q.output_format,
            expected_cardinality: q.expected_cardinality,
            implicit_limit: q.implicit_limit,
            compilation_flags: q.compilation_flags,
            modaliases: self.session.modaliases().clone(),
            variables: Vec::new(),
        }
    }

    fn queue_data_description(&mut self, group: &CompiledQueryGroup) {
        let message = match group.describing_unit() {
            Some(unit) => ServerMessage::CommandDataDescription {
                annotations: vec![],
                capabilities: group.capabilities(),
                result_cardinality: unit.cardinality,
                input_typedesc_id: unit.input_typedesc_id,
                input_typedesc: unit.input_typedesc.to_vec(),
                output_typedesc_id: unit.output_typedesc_id,
                output_typedesc: unit.output_typedesc.to_vec(),
            },
            None => ServerMessage::CommandDataDescription {
                annotations: vec![],
                capabilities: group.capabilities(),
                result_cardinality: Cardinality::NoResult,
                input_typedesc_id: uuid::Uuid::nil(),
                input_typedesc: vec![],
                output_typedesc_id: uuid::Uuid::nil(),
                output_typedesc: vec![],
            },
        };
        self.queue(&message);
    }

    fn apply_session_op(&mut self, op: &SessionOp) {
        match op {
            SessionOp::SetAlias(alias, module) => self.session.set_alias(alias, module),
            SessionOp::UnsetAlias(alias) => self.session.unset_alias(alias),
            SessionOp::SetConfig(name, value) => self.session.set_config(name, value.clone()),
            SessionOp::UnsetConfig(name) => self.session.unset_config(name),
            SessionOp::SetGlobal(name, value) => self.session.set_global(name, value.clone()),
            SessionOp::UnsetGlobal(name) => self.session.unset_global(name),
        }
    }
}

fn is_rollback(text: &str) -> bool {
    text.trim_start()
        .get(..8)
        .map(|head| head.eq_ignore_ascii_case("rollback"))
        .unwrap_or(false)
}

/// Stable fingerprint of everything that selects a prepared statement.
fn fingerprint(request: &CompileRequest) -> u64 {
    xxh3_64(
        format!(
            "{}\0{}\0{:?}\0{}",
            normalize(&request.query),
            request.branch,
            request.output_format,
            request.schema_version
        )
        .as_bytes(),
    )
}
