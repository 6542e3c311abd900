use std::time::Duration;

use crate::{hello::HelloReply, sdam::ServerType};

/// Information about the server that a given connection is connected to, derived from its
/// handshake.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamDescription {
    /// The type of the server as reported by the handshake.
    pub(crate) server_type: ServerType,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: i32,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: i32,

    /// How long sessions started on this server will stay alive without being used, as reported
    /// by the handshake. Absent if the server does not support sessions.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// Whether the server accepts the `hello` command form.
    pub(crate) hello_ok: bool,

    /// The maximum permitted size of a BSON wire protocol message.
    pub(crate) max_message_size_bytes: Option<i32>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a hello command reply.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_type: response.server_type(),
            min_wire_version: response.min_wire_version.unwrap_or(0),
            max_wire_version: response.max_wire_version.unwrap_or(0),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            hello_ok: response.hello_ok.unwrap_or(false),
            max_message_size_bytes: response.max_message_size_bytes,
        }
    }

    /// Whether this connection supports sessions.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Whether this connection supports retryable writes: the server must support sessions and
    /// be a member of a deployment that tracks transaction numbers (i.e. not a standalone).
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.supports_sessions()
            && self.max_wire_version >= 6
            && self.server_type != ServerType::Standalone
    }

    /// Gets a description of a stream for a 4.2 server, for use in testing dispatch policy.
    #[cfg(test)]
    pub(crate) fn new_testing(server_type: ServerType) -> Self {
        Self {
            server_type,
            min_wire_version: 6,
            max_wire_version: 8,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            hello_ok: false,
            max_message_size_bytes: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_writes_require_sessions_and_a_replicated_deployment() {
        assert!(StreamDescription::new_testing(ServerType::RsPrimary).supports_retryable_writes());
        assert!(StreamDescription::new_testing(ServerType::Mongos).supports_retryable_writes());

        // Standalones track no oplog, so transaction numbers buy nothing.
        assert!(
            !StreamDescription::new_testing(ServerType::Standalone).supports_retryable_writes()
        );

        let mut no_sessions = StreamDescription::new_testing(ServerType::RsPrimary);
        no_sessions.logical_session_timeout = None;
        assert!(!no_sessions.supports_retryable_writes());

        let mut old_server = StreamDescription::new_testing(ServerType::RsPrimary);
        old_server.max_wire_version = 5;
        assert!(!old_server.supports_retryable_writes());
    }
}
