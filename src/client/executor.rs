use std::time::Instant;

use crate::{
    bson::Document,
    client::session::TransactionState,
    cmap::{next_request_id, Connection},
    error::{
        ErrorKind,
        Result,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    event::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
    event::CommandEventHandler,
    operation::{Operation, Retryability},
    sdam::{HandshakePhase, SelectedServer, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria},
    Client,
    ClientSession,
};

use super::options::ReadConcern;

const DEFAULT_SERVER_SELECTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

impl Client {
    /// Execute the given operation.
    ///
    /// Server selection will be performed using the criteria specified on the operation, if
    /// any, and an implicit session will be created if the operation supports sessions and an
    /// explicit session is not provided.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        op: T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        let mut session = session.into();

        if let Some(ref mut session) = session {
            if !session.started_by(self) {
                return Err(ErrorKind::InvalidArgument {
                    message: "the session was started by a different Client".to_string(),
                }
                .into());
            }

            // Dispatch-time transaction bookkeeping: an operation under an active transaction
            // marks it as having work; otherwise any finished transaction state is cleared.
            // Commits and aborts are exempt, as they may legitimately run (or re-run) against
            // a finished transaction.
            let is_txn_conclusion =
                op.name() == "commitTransaction" || op.name() == "abortTransaction";
            if session.in_transaction() {
                session.transaction.has_operations = true;
            } else if !is_txn_conclusion && session.transaction.state != TransactionState::None {
                session.transaction.reset();
            }
        }

        match session {
            Some(session) => self.execute_operation_with_retry(op, Some(session)).await,
            None => {
                let mut implicit_session = self.start_implicit_session(&op).await?;
                self.execute_operation_with_retry(op, implicit_session.as_mut())
                    .await
            }
        }
    }

    /// Selects a server and executes the given operation on it, optionally using a provided
    /// session. Retries the operation once upon failure if retryability is supported.
    async fn execute_operation_with_retry<T: Operation>(
        &self,
        mut op: T,
        mut session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        let topology = self.topology();

        // Within a transaction, the transaction's criteria govern server selection no matter
        // what the operation asked for.
        let effective_criteria = match session {
            Some(ref s) if s.in_transaction() => Some(
                s.transaction_selection_criteria()
                    .cloned()
                    .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary)),
            ),
            _ => op.selection_criteria().cloned(),
        };
        let criteria = effective_criteria.as_ref();

        let server = match self.select_server(criteria).await {
            Ok(server) => server,
            Err(err) => return Err(attach_transaction_labels(err, &session, op.name())),
        };

        let mut conn = match server.pool.check_out().await {
            Ok(conn) => conn,
            Err(err) => {
                if err.is_network_error() {
                    if let Some(ref mut s) = session {
                        s.mark_dirty();
                    }
                }
                return Err(attach_transaction_labels(err, &session, op.name()));
            }
        };

        if crate::asserts_enabled() {
            assert_eq!(
                conn.generation,
                server.pool.generation(),
                "checked out a connection from a cleared pool generation"
            );
        }

        let retryability = self.get_retryability(&conn, &op, &session)?;

        // The transaction number makes the single retry idempotent server-side; it is
        // incremented exactly once, before the first attempt.
        let txn_number = match session {
            Some(ref mut s)
                if retryability == Retryability::Write
                    && !s.in_transaction()
                    && !op.retry_ignores_config() =>
            {
                Some(s.get_and_increment_txn_number())
            }
            _ => None,
        };

        let first_error = match self
            .execute_operation_on_connection(&mut op, &mut conn, &mut session, txn_number, criteria)
            .await
        {
            Ok(result) => {
                server.pool.check_in(conn).await;
                return Ok(result);
            }
            Err(mut err) => {
                if retryability == Retryability::Write {
                    let max_wire_version = conn
                        .stream_description()
                        .map(|sd| sd.max_wire_version)
                        .unwrap_or(0);
                    if err.should_add_retryable_write_label(max_wire_version) {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }
                }

                topology
                    .handle_application_error(
                        conn.address().clone(),
                        err.clone(),
                        HandshakePhase::after_completion(&conn),
                    )
                    .await;
                // the pool discards errored connections on check-in
                server.pool.check_in(conn).await;
                drop(server);

                let err = attach_transaction_labels(err, &session, op.name());
                if retryability.can_retry_error(&err) {
                    err
                } else {
                    return Err(err);
                }
            }
        };

        tracing::debug!(
            operation = op.name(),
            error = %first_error,
            "retrying operation on a newly selected server"
        );

        // If anything about the retry cannot proceed, the original error is the one the
        // caller should see.
        let server = match self.select_server(criteria).await {
            Ok(server) => server,
            Err(_) => return Err(first_error),
        };

        let mut conn = match server.pool.check_out().await {
            Ok(conn) => conn,
            Err(_) => return Err(first_error),
        };

        let retryability = match self.get_retryability(&conn, &op, &session) {
            Ok(retryability) => retryability,
            Err(_) => return Err(first_error),
        };
        if retryability == Retryability::None {
            return Err(first_error);
        }

        op.update_for_retry();

        match self
            .execute_operation_on_connection(&mut op, &mut conn, &mut session, txn_number, criteria)
            .await
        {
            Ok(result) => {
                server.pool.check_in(conn).await;
                Ok(result)
            }
            Err(mut err) => {
                if retryability == Retryability::Write {
                    let max_wire_version = conn
                        .stream_description()
                        .map(|sd| sd.max_wire_version)
                        .unwrap_or(0);
                    if err.should_add_retryable_write_label(max_wire_version) {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }
                }

                topology
                    .handle_application_error(
                        conn.address().clone(),
                        err.clone(),
                        HandshakePhase::after_completion(&conn),
                    )
                    .await;
                server.pool.check_in(conn).await;

                let err = attach_transaction_labels(err, &session, op.name());
                // The second failure wins only when it too signals server or topology
                // trouble; otherwise the original error is surfaced.
                if err.is_network_error() || err.is_state_change_error() {
                    Err(err)
                } else {
                    Err(first_error)
                }
            }
        }
    }

    /// Executes an operation on a given connection, optionally using a provided session.
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut Connection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        criteria: Option<&SelectionCriteria>,
    ) -> Result<T::O> {
        if let Some(write_concern) = op.write_concern() {
            write_concern.validate()?;
            if !write_concern.is_acknowledged() {
                if let Some(ref session) = session {
                    if !session.is_implicit() {
                        return Err(ErrorKind::InvalidArgument {
                            message: "Cannot use ClientSessions with unacknowledged write \
                                      concerns"
                                .to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        let topology = self.topology();

        let mut cmd = op.build(connection.stream_description()?)?;
        topology.update_command_with_read_pref(connection.address(), &mut cmd, criteria);

        if let Some(max_time) = self.inner.options.max_time {
            cmd.set_max_time_ms(max_time);
        }

        match session {
            Some(ref mut session) if op.supports_sessions() => {
                cmd.set_session(session);
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }

                let is_txn_conclusion =
                    cmd.name == "commitTransaction" || cmd.name == "abortTransaction";
                match session.transaction.state {
                    TransactionState::Starting => {
                        cmd.set_txn_number(session.txn_number());
                        cmd.set_autocommit();
                        cmd.set_start_transaction();
                        // the first command of a transaction carries its read concern
                        let read_concern = session
                            .transaction
                            .options
                            .as_ref()
                            .and_then(|options| options.read_concern.as_ref())
                            .or(self.inner.options.read_concern.as_ref());
                        self.set_read_concern(&mut cmd, read_concern, session);
                    }
                    TransactionState::InProgress => {
                        cmd.set_txn_number(session.txn_number());
                        cmd.set_autocommit();
                    }
                    // A commit may be re-sent after the transaction already concluded; it
                    // still refers to the transaction's number.
                    TransactionState::Committed { .. } | TransactionState::Aborted
                        if is_txn_conclusion =>
                    {
                        cmd.set_txn_number(session.txn_number());
                        cmd.set_autocommit();
                    }
                    _ => {
                        if op.supports_read_concern() {
                            self.set_read_concern(
                                &mut cmd,
                                self.inner.options.read_concern.as_ref(),
                                session,
                            );
                        }
                    }
                }

                session.update_last_use();
            }
            Some(ref session) if !op.supports_sessions() && !session.is_implicit() => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("{} does not support sessions", cmd.name),
                }
                .into());
            }
            _ => {}
        }

        // Gossip the highest cluster time this client has observed.
        let session_cluster_time = session.as_ref().and_then(|s| s.cluster_time().cloned());
        let client_cluster_time = topology.cluster_time();
        if let Some(cluster_time) = std::cmp::max(session_cluster_time, client_cluster_time) {
            cmd.set_cluster_time(&cluster_time);
        }

        let connection_info = connection.info();
        let request_id = next_request_id();
        let should_redact = cmd.should_redact();
        let command_name = cmd.name.clone();

        self.emit_command_event(|handler| {
            let command_body = if should_redact {
                Document::new()
            } else {
                cmd.body.clone()
            };
            handler.handle_command_started_event(CommandStartedEvent {
                command: command_body,
                db: cmd.target_db.clone(),
                command_name: command_name.clone(),
                request_id,
                connection: connection_info.clone(),
            });
        });

        let start_time = Instant::now();

        let response_result = match connection.send_command(cmd, request_id).await {
            Ok(response) => {
                if let Some(cluster_time) = response.cluster_time() {
                    topology.advance_cluster_time(cluster_time.clone()).await;
                    if let Some(ref mut session) = session {
                        session.advance_cluster_time(&cluster_time);
                    }
                }
                if let Some(operation_time) = response.operation_time() {
                    if let Some(ref mut session) = session {
                        session.advance_operation_time(operation_time);
                    }
                }
                response.validate().map(|_| response)
            }
            Err(err) => Err(err),
        };

        let duration = start_time.elapsed();

        match response_result {
            Err(error) => {
                self.emit_command_event(|handler| {
                    handler.handle_command_failed_event(CommandFailedEvent {
                        duration,
                        command_name: command_name.clone(),
                        failure: error.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    });
                });

                // An errored session may have state the server no longer knows about, so its
                // record must not return to the pool.
                if error.is_network_error() || error.is_state_change_error() {
                    if let Some(ref mut session) = session {
                        session.mark_dirty();
                    }
                }

                op.handle_error(error)
            }
            Ok(response) => {
                self.emit_command_event(|handler| {
                    let reply = if should_redact {
                        Document::new()
                    } else {
                        response.raw_response.clone()
                    };
                    handler.handle_command_succeeded_event(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: command_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    });
                });

                if let Some(ref mut session) = session {
                    if session.transaction.state == TransactionState::Starting {
                        session.transaction.state = TransactionState::InProgress;
                        // All subsequent operations of a sharded transaction must go to the
                        // mongos that started it.
                        if topology.topology_type() == TopologyType::Sharded {
                            session.pin_mongos(connection.address().clone());
                        }
                    }
                }

                op.handle_response(&response)
            }
        }
    }

    fn set_read_concern(
        &self,
        cmd: &mut crate::cmap::Command,
        read_concern: Option<&ReadConcern>,
        session: &ClientSession,
    ) {
        if let Some(read_concern) = read_concern {
            cmd.set_read_concern(read_concern.to_document());
        }
        if session.causal_consistency() {
            if let Some(operation_time) = session.operation_time() {
                cmd.set_after_cluster_time(operation_time);
            }
        }
    }

    /// Start an implicit session if the operation supports sessions and the deployment does.
    async fn start_implicit_session<T: Operation>(&self, op: &T) -> Result<Option<ClientSession>> {
        match self.get_session_support_status().await? {
            crate::sdam::SessionSupportStatus::Supported { .. } if op.supports_sessions() => Ok(
                Some(ClientSession::new(self.clone(), None, true).await),
            ),
            _ => Ok(None),
        }
    }

    /// Select a server using the provided criteria. If none is provided, a primary read
    /// preference will be used instead.
    ///
    /// If no suitable server is available, all monitors are asked to check immediately and
    /// selection is re-attempted whenever a new topology view is published: once within the
    /// connect timeout when `server_selection_try_once` is set, otherwise repeatedly until
    /// `server_selection_timeout` has elapsed.
    pub(crate) async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
    ) -> Result<SelectedServer> {
        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = criteria.unwrap_or(&default_criteria);

        let start_time = Instant::now();
        let try_once = self
            .inner
            .options
            .server_selection_try_once
            .unwrap_or(true);
        let timeout = if try_once {
            self.inner
                .options
                .connect_timeout
                .unwrap_or(crate::runtime::DEFAULT_CONNECT_TIMEOUT)
        } else {
            self.inner
                .options
                .server_selection_timeout
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
        };

        let topology = self.topology();
        let mut watcher = topology.watch();
        loop {
            let state = watcher.observe_latest();

            if let Some(server) = crate::sdam::attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers(),
            )? {
                return Ok(server);
            }

            watcher.request_immediate_check();

            let elapsed = start_time.elapsed();
            let change_occurred =
                elapsed < timeout && watcher.wait_for_update(timeout - elapsed).await;
            if !change_occurred {
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    /// Returns the retryability level for the execution of this operation.
    fn get_retryability<T: Operation>(
        &self,
        conn: &Connection,
        op: &T,
        session: &Option<&mut ClientSession>,
    ) -> Result<Retryability> {
        let in_transaction = session.as_ref().map_or(false, |s| s.in_transaction());
        let supports_retryable_writes = conn.stream_description()?.supports_retryable_writes();

        match op.retryability() {
            Retryability::Read
                if !in_transaction && self.inner.options.retry_reads != Some(false) =>
            {
                Ok(Retryability::Read)
            }
            Retryability::Write
                if (op.retry_ignores_config()
                    || (!in_transaction && self.inner.options.retry_writes != Some(false)))
                    && session.is_some()
                    && supports_retryable_writes =>
            {
                Ok(Retryability::Write)
            }
            _ => Ok(Retryability::None),
        }
    }

    pub(crate) fn emit_command_event(
        &self,
        emit: impl FnOnce(&std::sync::Arc<dyn CommandEventHandler>),
    ) {
        if let Some(ref handler) = self.inner.options.command_event_handler {
            emit(handler);
        }
    }
}

/// Adds the transaction-related error labels the caller relies on to drive transaction
/// retries: `TransientTransactionError` for failures inside a transaction, and
/// `UnknownTransactionCommitResult` for indeterminate commits.
fn attach_transaction_labels(
    mut err: crate::error::Error,
    session: &Option<&mut ClientSession>,
    op_name: &str,
) -> crate::error::Error {
    let in_transaction = session.as_ref().map_or(false, |s| s.in_transaction());
    let is_commit = op_name == "commitTransaction";
    let is_abort = op_name == "abortTransaction";

    if in_transaction
        && !is_commit
        && !is_abort
        && (err.is_network_error() || err.is_server_selection_error())
    {
        err.add_label(TRANSIENT_TRANSACTION_ERROR);
    }

    if is_commit && err.should_add_unknown_transaction_commit_result_label() {
        err.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
    }

    err
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{CommandError, Error};

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: String::new(),
        })
        .into()
    }

    #[test]
    fn commit_errors_get_the_unknown_result_label() {
        let network: Error = std::io::ErrorKind::ConnectionReset.into();
        let labeled = attach_transaction_labels(network, &None, "commitTransaction");
        assert!(labeled.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));

        // Write concern timeouts on commit are indeterminate as well.
        let wc_timeout = command_error(64);
        let labeled = attach_transaction_labels(wc_timeout, &None, "commitTransaction");
        assert!(labeled.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));

        // Ordinary command failures on other operations pick up no labels.
        let ordinary = command_error(26);
        let labeled = attach_transaction_labels(ordinary, &None, "find");
        assert!(labeled.labels().is_empty());
    }

    #[test]
    fn retryability_gates_on_error_class() {
        let network: Error = std::io::ErrorKind::ConnectionReset.into();
        assert!(Retryability::Read.can_retry_error(&network));
        assert!(!Retryability::None.can_retry_error(&network));

        // Writes retry only on errors carrying the retryable-write label.
        assert!(!Retryability::Write.can_retry_error(&network));
        let labeled = network.with_label(RETRYABLE_WRITE_ERROR);
        assert!(Retryability::Write.can_retry_error(&labeled));

        let not_primary = command_error(10107);
        assert!(Retryability::Read.can_retry_error(&not_primary));
        let ordinary = command_error(26);
        assert!(!Retryability::Read.can_retry_error(&ordinary));
    }
}
