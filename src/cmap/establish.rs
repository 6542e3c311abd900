use std::time::Duration;

use crate::{
    bson::{doc, Document},
    cmap::{Connection, PendingConnection, StreamDescription},
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::AsyncStream,
};

/// The driver name reported to the server in the handshake metadata.
const DRIVER_NAME: &str = "mongodb-core";

/// Contains the options that need to be passed around when creating a new `ConnectionEstablisher`.
#[derive(Debug, Clone)]
pub(crate) struct EstablisherOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) app_name: Option<String>,
}

impl EstablisherOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            app_name: options.app_name.clone(),
        }
    }
}

/// Opens sockets and performs the initial handshake, producing handshaked `Connection`s.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionEstablisher {
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    handshaker: Handshaker,
}

impl ConnectionEstablisher {
    pub(crate) fn new(options: EstablisherOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            handshaker: Handshaker::new(options.app_name.as_deref()),
        }
    }

    /// Establishes a connection intended to be stored in a server's connection pool.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> Result<Connection> {
        let stream =
            AsyncStream::connect(&pending_connection.address, self.connect_timeout).await?;
        let mut connection = Connection::new(
            pending_connection.address,
            stream,
            pending_connection.id,
            pending_connection.generation,
            self.socket_timeout,
        );
        self.handshaker.handshake(&mut connection).await?;
        Ok(connection)
    }

    /// Establishes a dedicated monitoring connection, returning the handshake reply so the
    /// monitor can derive a server description from it.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let stream = AsyncStream::connect(&address, self.connect_timeout).await?;
        let mut connection = Connection::new(address, stream, 0, 0, self.connect_timeout);
        let reply = self.handshaker.handshake(&mut connection).await?;
        Ok((connection, reply))
    }
}

/// Performs the initial `hello` exchange on a fresh connection. Authentication mechanisms
/// are negotiated by an outer layer; this handshake only identifies the driver and derives
/// the connection's `StreamDescription`.
#[derive(Debug, Clone)]
struct Handshaker {
    metadata: Document,
}

impl Handshaker {
    fn new(app_name: Option<&str>) -> Self {
        let mut metadata = doc! {
            "driver": {
                "name": DRIVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        };

        if let Some(name) = app_name {
            metadata.insert("application", doc! { "name": name });
        }

        Self { metadata }
    }

    async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let mut command = hello_command(None);
        command.body.insert("client", self.metadata.clone());

        let reply = run_hello(conn, command).await?;
        conn.set_stream_description(StreamDescription::from_hello_reply(&reply));

        Ok(reply)
    }
}
