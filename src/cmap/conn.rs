mod command;
mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use tokio::io::BufStream;

use self::wire::Message;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    runtime::AsyncStream,
};

pub(crate) use command::{Command, CommandResponse};
pub(crate) use stream_description::StreamDescription;

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection within its pool.
    pub id: u32,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A single validated link to one server. A `Connection` is owned by at most one in-flight
/// operation at a time; the pool hands it out on check-out and takes it back on check-in.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Driver-generated ID for the connection.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The pool generation this connection was established under. Connections from older
    /// generations are discarded on check-out and check-in.
    pub(crate) generation: u32,

    /// The cached StreamDescription from the connection's handshake.
    stream_description: Option<StreamDescription>,

    /// The last time a command was sent on this connection, used to decide when an idle
    /// connection must be revalidated before reuse.
    last_used: Instant,

    /// Set when a network error occurs while reading or writing. Once errored, the connection
    /// is never reused and will be dropped on check-in.
    error: bool,

    stream: BufStream<AsyncStream>,

    /// Maximum time to wait for a single command round trip on this connection.
    socket_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        generation: u32,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            stream_description: None,
            last_used: Instant::now(),
            error: false,
            stream: BufStream::new(stream),
            socket_timeout,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Executes a `Command` and returns a `CommandResponse` containing the result from the
    /// server.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the driver
    /// received the response; it does not imply anything about the success of the command
    /// itself.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<CommandResponse> {
        let message = command.into_message(request_id);
        self.send_message(message).await
    }

    async fn send_message(&mut self, message: Message) -> Result<CommandResponse> {
        self.last_used = Instant::now();

        let socket_timeout = self.socket_timeout;
        let max_message_size = self
            .stream_description
            .as_ref()
            .and_then(|sd| sd.max_message_size_bytes);

        let stream = &mut self.stream;
        let round_trip = async move {
            message.write_to(stream).await?;
            Message::read_from(stream, max_message_size).await
        };

        let result = match socket_timeout {
            Some(timeout) => match crate::runtime::timeout(timeout, round_trip).await {
                Ok(result) => result,
                Err(timeout_error) => Err(timeout_error),
            },
            None => round_trip.await,
        };

        match result {
            Ok(response_message) => Ok(CommandResponse::new(
                self.address.clone(),
                response_message,
            )),
            Err(err) => {
                self.error = true;
                Err(err)
            }
        }
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    pub(crate) fn set_stream_description(&mut self, description: StreamDescription) {
        self.stream_description = Some(description);
    }

    /// Whether the time since the last use of this connection exceeds the given interval,
    /// requiring revalidation before reuse.
    pub(crate) fn is_idle(&self, check_interval: Duration) -> bool {
        Instant::now().duration_since(self.last_used) >= check_interval
    }

    /// Checks if the connection experienced a network error and should be closed.
    pub(crate) fn has_errored(&self) -> bool {
        self.error
    }
}

/// The information needed to establish a `Connection`. Creating one of these reserves the id and
/// generation before the TCP connection is actually made.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
}
