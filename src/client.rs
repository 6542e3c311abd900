mod executor;
pub mod options;
pub mod session;

use std::sync::{Arc, RwLock};

use crate::{
    bson::Document,
    error::{ErrorKind, Result},
    operation::{EndSessions, Retryability, RunCommand},
    options::{ClientOptions, ReadPreference, SelectionCriteria, ServerAddress, SessionOptions},
    sdam::{attempt_to_select_server, SessionSupportStatus, Topology, TopologyInfo},
    selection_criteria::Predicate,
};

use session::{ClientSession, ServerSession, ServerSessionPool};

/// The maximum number of session ids sent in a single endSessions command.
const MAX_END_SESSIONS_BATCH_SIZE: usize = 10_000;

/// This is the main entry point for the API. A `Client` is used to connect to a MongoDB
/// cluster. By default, it will monitor the topology of the cluster, keeping track of any
/// changes, such as servers being added or removed.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html)
/// internally, so it can be shared safely across threads or async tasks. To disconnect from
/// the deployment and clean up any state, call [`Client::shutdown`] (or just drop all clones;
/// monitoring stops once the last one goes out of scope).
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    /// Swapped out wholesale on `reconnect`; all reads go through `Client::topology`.
    topology: RwLock<Topology>,
    pub(crate) options: ClientOptions,
    session_pool: ServerSessionPool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. `uri` must be a
    /// valid MongoDB connection string.
    ///
    /// See the documentation on
    /// [MongoDB connection strings](https://www.mongodb.com/docs/manual/reference/connection-string/) for more details.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref())?;
        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let topology = Topology::new(options.clone())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                topology: RwLock::new(topology),
                options,
                session_pool: ServerSessionPool::new(),
            }),
        })
    }

    pub(crate) fn topology(&self) -> Topology {
        self.inner.topology.read().unwrap().clone()
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn server_session_pool(&self) -> &ServerSessionPool {
        &self.inner.session_pool
    }

    /// Starts a new `ClientSession`.
    ///
    /// Sessions scope causal consistency, retryable writes, and transactions. Returns an
    /// error if the deployment does not support sessions.
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        match self.get_session_support_status().await? {
            SessionSupportStatus::Supported { .. } => {
                Ok(ClientSession::new(self.clone(), options.into(), false).await)
            }
            _ => Err(ErrorKind::SessionsNotSupported.into()),
        }
    }

    /// Runs the given command on a server selected according to `read_preference` (the
    /// client's default criteria if `None`), without retrying on failure.
    pub async fn run_read_command(
        &self,
        target_db: &str,
        command: Document,
        read_preference: impl Into<Option<ReadPreference>>,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<Document> {
        let criteria = read_preference
            .into()
            .map(SelectionCriteria::ReadPreference)
            .or_else(|| self.inner.options.selection_criteria.clone());
        let op = RunCommand::new(target_db, command, criteria, Retryability::None)?;
        self.execute_operation(op, session).await
    }

    /// Runs the given command on a writable server (the primary in a replica set, any mongos
    /// in a sharded cluster, the sole server otherwise), without retrying on failure.
    pub async fn run_write_command(
        &self,
        target_db: &str,
        command: Document,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<Document> {
        let op = RunCommand::new(target_db, command, None, Retryability::None)?;
        self.execute_operation(op, session).await
    }

    /// Runs the given read command, retrying it once on another suitable server if the first
    /// attempt fails with a retryable error and retryable reads are enabled.
    pub async fn run_retryable_read_command(
        &self,
        target_db: &str,
        command: Document,
        read_preference: impl Into<Option<ReadPreference>>,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<Document> {
        let criteria = read_preference
            .into()
            .map(SelectionCriteria::ReadPreference)
            .or_else(|| self.inner.options.selection_criteria.clone());
        let op = RunCommand::new(target_db, command, criteria, Retryability::Read)?;
        self.execute_operation(op, session).await
    }

    /// Runs the given write command with retryable-write semantics: a transaction number is
    /// attached so the server can detect (and not reapply) a duplicate, and the command is
    /// retried once on a freshly selected server if the first attempt fails with a retryable
    /// error.
    ///
    /// The caller is responsible for only using this with commands the server tracks by
    /// transaction number (single-statement writes).
    pub async fn run_retryable_write_command(
        &self,
        target_db: &str,
        command: Document,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<Document> {
        let op = RunCommand::new(target_db, command, None, Retryability::Write)?;
        self.execute_operation(op, session).await
    }

    /// Runs the given command on the server at `address`, without retrying on failure. The
    /// server must be part of the currently known topology.
    pub async fn run_command_on(
        &self,
        address: &ServerAddress,
        target_db: &str,
        command: Document,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<Document> {
        let criteria = SelectionCriteria::from_address(address.clone());
        let op = RunCommand::new(target_db, command, Some(criteria), Retryability::None)?;
        self.execute_operation(op, session).await
    }

    /// A snapshot of the client's current view of the deployment. If `refresh` is true, every
    /// server is re-checked first (bounded by the connect timeout).
    pub async fn topology_status(&self, refresh: bool) -> TopologyInfo {
        let topology = self.topology();
        if refresh {
            let timeout = self
                .inner
                .options
                .connect_timeout
                .unwrap_or(crate::runtime::DEFAULT_CONNECT_TIMEOUT);
            topology.scan(timeout).await;
        }
        topology.info()
    }

    /// Eagerly establishes a pooled connection to each known server.
    pub async fn warm_connection_pool(&self) {
        self.topology().warm_pool().await;
    }

    /// Stops all monitoring and closes all pooled connections. The client is unusable until
    /// [`Client::reconnect`] is called.
    pub async fn disconnect(&self) {
        self.topology().shutdown().await;
    }

    /// Discards all state derived from the previous connection attempt (links and pooled
    /// session ids) and connects anew. This must be called in a child process after a fork,
    /// so that session ids are not shared with the parent.
    pub async fn reconnect(&self) -> Result<()> {
        self.topology().shutdown().await;
        self.inner.session_pool.clear().await;

        let topology = Topology::new(self.inner.options.clone())?;
        *self.inner.topology.write().unwrap() = topology;
        Ok(())
    }

    /// Gracefully shuts the client down: pooled session ids are ended on the server
    /// (best-effort), monitoring stops, and all connections are closed.
    pub async fn shutdown(self) {
        self.end_all_sessions().await;
        self.topology().shutdown().await;
    }

    /// Check in a server session to the server session pool. The session will be discarded if
    /// it is expired or dirty.
    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.topology().logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    /// Gets whether the topology supports sessions, and if so, the topology's logical session
    /// timeout. If it has yet to be determined if the topology supports sessions, this method
    /// will perform a server selection that will force that determination to be made.
    pub(crate) async fn get_session_support_status(&self) -> Result<SessionSupportStatus> {
        let initial_status = self.topology().session_support_status();

        // Need to be connected to at least one server that can determine if sessions are
        // supported or not.
        match initial_status {
            SessionSupportStatus::Undetermined => {
                let criteria = SelectionCriteria::Predicate(data_bearing_predicate());
                let _ = self.select_server(Some(&criteria)).await?;
                Ok(self.topology().session_support_status())
            }
            _ => Ok(initial_status),
        }
    }

    /// Ends all sessions contained in this client's session pool on the server.
    pub(crate) async fn end_all_sessions(&self) {
        let session_ids = self.inner.session_pool.get_session_ids().await;
        if session_ids.is_empty() {
            return;
        }

        // If no suitable server is promptly available, skip the courtesy rather than spinning
        // through server selection during shutdown.
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred { options: None });
        let topology = self.topology();
        let state = topology.latest().clone();
        match attempt_to_select_server(&criteria, &state.description, &state.servers()) {
            Ok(Some(_)) => {}
            _ => return,
        }

        for chunk in session_ids.chunks(MAX_END_SESSIONS_BATCH_SIZE) {
            let op = EndSessions::new(chunk.to_vec());
            if self.execute_operation(op, None).await.is_err() {
                return;
            }
        }
    }
}

fn data_bearing_predicate() -> Predicate {
    Arc::new(|server| server.server_type().is_data_bearing())
}
