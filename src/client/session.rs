mod cluster_time;
mod pool;
#[cfg(test)]
mod test;

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    error::{ErrorKind, Result},
    operation::{AbortTransaction, CommitTransaction},
    options::{ServerAddress, SessionOptions, TransactionOptions},
    sdam::TransactionSupportStatus,
    selection_criteria::SelectionCriteria,
    Client,
};

pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations. To create a `ClientSession`, call `start_session` on a `Client`.
///
/// `ClientSession` instances are not thread safe or fork safe. They can only be used by one
/// thread or process at a time.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: ServerSession,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub(crate) transaction: Transaction,
    pub(crate) operation_time: Option<Timestamp>,
}

/// The transaction state carried by a session.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) pinned_mongos: Option<SelectionCriteria>,

    /// Whether any operation has been executed under the current transaction.
    pub(crate) has_operations: bool,
}

impl Transaction {
    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.pinned_mongos = None;
        self.has_operations = false;
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned_mongos = None;
    }

    pub(crate) fn reset(&mut self) {
        self.state = TransactionState::None;
        self.options = None;
        self.pinned_mongos = None;
        self.has_operations = false;
    }
}

/// The state of a session's transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any data was committed when commit_transaction was initially called. This
        /// is required to determine whether a commitTransaction command should be run if the
        /// user calls commit_transaction again.
        data_committed: bool,
    },
    Aborted,
}

impl ClientSession {
    /// Creates a new `ClientSession` by checking out a corresponding `ServerSession` from the
    /// provided client's session pool.
    pub(crate) async fn new(
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        let timeout = client.topology().logical_session_timeout();
        let server_session = client.server_session_pool().check_out(timeout).await;
        Self {
            client,
            server_session,
            cluster_time: None,
            is_implicit,
            options,
            transaction: Default::default(),
            operation_time: None,
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Whether this session was started by the given client. Sessions must only be used with
    /// the client that created them.
    pub(crate) fn started_by(&self, client: &Client) -> bool {
        std::sync::Arc::ptr_eq(&self.client.inner, &client.inner)
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    /// Whether this session was created implicitly by the driver or explicitly by the user.
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether this session is currently in a transaction.
    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.state == TransactionState::Starting
            || self.transaction.state == TransactionState::InProgress
    }

    /// The highest seen cluster time this session has seen so far.
    /// This will be `None` if this session has not been used in an operation yet.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The options used to create this session.
    pub(crate) fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest
    /// seen cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance operation time for this session. If the provided timestamp is earlier than
    /// this session's current operation time, then the operation time is unchanged.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        self.operation_time = match self.operation_time {
            Some(current_op_time) if current_op_time < ts => Some(ts),
            None => Some(ts),
            _ => self.operation_time,
        }
    }

    /// The operation time returned by the last operation executed in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    pub(crate) fn causal_consistency(&self) -> bool {
        self.options()
            .and_then(|opts| opts.causal_consistency)
            .unwrap_or(!self.is_implicit())
    }

    /// Mark this session (and the underlying server session) as dirty.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    /// Updates the date that the underlying server session was last used as part of an
    /// operation sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    /// Gets the current txn_number.
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// Increments the txn_number and returns the new value.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        self.server_session.txn_number += 1;
        self.server_session.txn_number
    }

    /// Pin this session to the mongos at the given address for the remainder of the
    /// transaction.
    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.transaction.pinned_mongos = Some(SelectionCriteria::from_address(address));
    }

    /// The selection criteria all operations in the current transaction must use: the pinned
    /// mongos if there is one, otherwise the transaction's read preference.
    pub(crate) fn transaction_selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.transaction.pinned_mongos.as_ref().or_else(|| {
            self.transaction
                .options
                .as_ref()
                .and_then(|options| options.selection_criteria.as_ref())
        })
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    fn default_transaction_options(&self) -> Option<&TransactionOptions> {
        self.options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref())
    }

    /// Starts a new transaction on this session with the given options. If no options are
    /// provided, the session's `default_transaction_options` will be used.
    ///
    /// Operations executed within the transaction must pass the session to the dispatcher;
    /// they will all be routed according to the transaction's read preference.
    pub async fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        if self.in_transaction() {
            return Err(ErrorKind::Transaction {
                message: "transaction already in progress".to_string(),
            }
            .into());
        }

        if self.client.topology().transaction_support_status()
            == TransactionSupportStatus::Unsupported
        {
            return Err(ErrorKind::Transaction {
                message: "the connected deployment does not support transactions".to_string(),
            }
            .into());
        }

        let options = options
            .into()
            .or_else(|| self.default_transaction_options().cloned());

        self.server_session.txn_number += 1;
        self.transaction.start(options);
        Ok(())
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// This method may be called again if a previous attempt failed with an error carrying
    /// the `UnknownTransactionCommitResult` label; the commit will be re-sent to the server.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction"
                    .to_string(),
            }
            .into()),
            TransactionState::Starting => {
                // No operation was run under the transaction, so there is nothing to commit.
                self.transaction.commit(false);
                Ok(())
            }
            TransactionState::Committed {
                data_committed: false,
            } => Ok(()),
            TransactionState::InProgress
            | TransactionState::Committed {
                data_committed: true,
            } => {
                let is_retry = matches!(
                    self.transaction.state,
                    TransactionState::Committed { .. }
                );
                let mut op = CommitTransaction::new(self.transaction.options.clone());
                if is_retry {
                    // Retried commits must upgrade to a majority write concern.
                    op.update_for_retry_attempt();
                }
                let client = self.client.clone();
                let result = client.execute_operation(op, &mut *self).await;
                self.transaction.commit(true);
                result.map(|_| ())
            }
        }
    }

    /// Aborts the transaction that is currently active on this session. Errors the server
    /// reports for the abort itself are ignored; the transaction is considered aborted
    /// either way.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction"
                    .to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction twice".to_string(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.abort();
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = self
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|options| options.write_concern.clone());
                let op = AbortTransaction::new(write_concern);
                let client = self.client.clone();
                let _ = client.execute_operation(op, &mut *self).await;
                self.transaction.abort();
                Ok(())
            }
        }
    }
}

struct DroppedClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: ServerSession,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    operation_time: Option<Timestamp>,
}

impl From<DroppedClientSession> for ClientSession {
    fn from(dropped_session: DroppedClientSession) -> Self {
        Self {
            cluster_time: dropped_session.cluster_time,
            server_session: dropped_session.server_session,
            client: dropped_session.client,
            is_implicit: dropped_session.is_implicit,
            options: dropped_session.options,
            transaction: Transaction {
                state: TransactionState::InProgress,
                options: None,
                pinned_mongos: None,
                has_operations: true,
            },
            operation_time: dropped_session.operation_time,
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.transaction.state == TransactionState::InProgress {
            let dropped_session = DroppedClientSession {
                cluster_time: self.cluster_time.clone(),
                server_session: self.server_session.clone(),
                client: self.client.clone(),
                is_implicit: self.is_implicit,
                options: self.options.clone(),
                operation_time: self.operation_time,
            };
            crate::runtime::spawn(async move {
                let mut session: ClientSession = dropped_session.into();
                let _result = session.abort_transaction().await;
            });
        } else {
            let client = self.client.clone();
            let server_session = self.server_session.clone();
            crate::runtime::spawn(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    pub(crate) last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,

    /// A monotonically increasing transaction number for this session.
    pub(crate) txn_number: i64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1
    /// minute).
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(t) => t,
            None => return false,
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}
