use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Mutex;

use crate::{
    cmap::{
        establish::ConnectionEstablisher,
        Connection,
        PendingConnection,
    },
    error::{Error, Result},
    hello::hello_command,
    options::{ClientOptions, ServerAddress},
    sdam::{HandshakePhase, TopologyUpdater},
};

const DEFAULT_SOCKET_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A pool of connections to a single server. Connections are handed out exclusively: a checked
/// out connection belongs to exactly one in-flight operation until it is checked back in.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    address: ServerAddress,

    establisher: ConnectionEstablisher,

    /// Used to report errors encountered during connection establishment.
    topology_updater: TopologyUpdater,

    /// A connection idle for longer than this must be revalidated with a lightweight hello
    /// before reuse.
    socket_check_interval: Duration,

    /// Available connections, most recently used first.
    connections: Mutex<VecDeque<Connection>>,

    /// Incremented whenever the pool is cleared. Connections from older generations are
    /// discarded rather than reused.
    generation: AtomicU32,

    next_id: AtomicU32,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        options: &ClientOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                address,
                establisher,
                topology_updater,
                socket_check_interval: options
                    .socket_check_interval
                    .unwrap_or(DEFAULT_SOCKET_CHECK_INTERVAL),
                connections: Mutex::new(VecDeque::new()),
                generation: AtomicU32::new(0),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection, reusing a pooled one if a valid one is available and
    /// establishing a new one otherwise.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        loop {
            let conn = self.inner.connections.lock().await.pop_front();
            let mut conn = match conn {
                Some(conn) => conn,
                None => break,
            };

            if conn.generation != self.generation() {
                continue;
            }

            // A connection that has sat idle may have been closed by the server side;
            // revalidate it with a cheap hello before handing it out.
            if conn.is_idle(self.inner.socket_check_interval) {
                let hello_ok = conn.stream_description().ok().map(|sd| sd.hello_ok);
                let ping = hello_command(hello_ok);
                match conn.send_command(ping, None).await {
                    Ok(response) if response.is_success() => {}
                    _ => continue,
                }
            }

            return Ok(conn);
        }

        let generation = self.generation();
        let pending = PendingConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            address: self.inner.address.clone(),
            generation,
        };

        match self.inner.establisher.establish_connection(pending).await {
            Ok(connection) => Ok(connection),
            Err(error) => {
                tracing::debug!(
                    address = %self.inner.address,
                    error = %error,
                    "failed to establish connection"
                );
                self.inner
                    .topology_updater
                    .handle_application_error(
                        self.inner.address.clone(),
                        error.clone(),
                        HandshakePhase::PreHello { generation },
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Returns a connection to the pool. Errored and stale connections are dropped instead.
    pub(crate) async fn check_in(&self, connection: Connection) {
        if connection.has_errored() || connection.generation != self.generation() {
            return;
        }
        self.inner
            .connections
            .lock()
            .await
            .push_front(connection);
    }

    /// Clears the pool: all pooled connections are dropped, and any connection currently
    /// checked out will be discarded when it is checked back in.
    pub(crate) async fn clear(&self, cause: &Error) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = {
            let mut connections = self.inner.connections.lock().await;
            let dropped = connections.len();
            connections.clear();
            dropped
        };
        tracing::debug!(
            address = %self.inner.address,
            dropped,
            cause = %cause,
            "connection pool cleared"
        );
    }

    /// Ensures at least one established connection sits in the pool.
    pub(crate) async fn warm(&self) {
        if !self.inner.connections.lock().await.is_empty() {
            return;
        }
        if let Ok(conn) = self.check_out().await {
            self.check_in(conn).await;
        }
    }

    /// Drops all pooled connections.
    pub(crate) async fn close(&self) {
        self.inner.connections.lock().await.clear();
    }
}
