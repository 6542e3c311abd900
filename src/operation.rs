mod abort_transaction;
mod commit_transaction;
mod end_sessions;
mod run_command;

use crate::{
    bson::Document,
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, Result},
    options::WriteConcern,
    selection_criteria::SelectionCriteria,
};

pub(crate) use abort_transaction::AbortTransaction;
pub(crate) use commit_transaction::CommitTransaction;
pub(crate) use end_sessions::EndSessions;
pub(crate) use run_command::RunCommand;

/// The retry behavior an operation supports. Whether a given execution actually retries also
/// depends on the client options, the session state, and the selected server's capabilities.
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

impl Retryability {
    /// Whether this level of retryability can retry the given error.
    pub(crate) fn can_retry_error(&self, error: &Error) -> bool {
        match self {
            Self::Write => error.is_write_retryable(),
            Self::Read => error.is_read_retryable(),
            Self::None => false,
        }
    }
}

/// A trait modeling the behavior of a server-side operation: a single command round trip.
pub(crate) trait Operation: Send + Sync {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    fn name(&self) -> &str;

    /// Returns the command that should be sent to the server as part of this operation.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(&self, response: &CommandResponse) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server,
    /// potentially recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// Whether a read concern (and thus causal-consistency metadata) may be attached to this
    /// operation's command.
    fn supports_read_concern(&self) -> bool {
        false
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Whether this operation is retried even when retryable writes are disabled in the
    /// client options, as transaction commits and aborts are.
    fn retry_ignores_config(&self) -> bool {
        false
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }
}

/// Appends a write concern to a command body if one is set and non-empty.
pub(crate) fn append_write_concern(body: &mut Document, write_concern: Option<&WriteConcern>) {
    if let Some(write_concern) = write_concern {
        if !write_concern.is_empty() {
            body.insert("writeConcern", write_concern.to_document());
        }
    }
}
