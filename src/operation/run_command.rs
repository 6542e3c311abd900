use super::{Operation, Retryability};
use crate::{
    bson::Document,
    cmap::{Command, CommandResponse, StreamDescription},
    error::{ErrorKind, Result},
    selection_criteria::SelectionCriteria,
};

/// An arbitrary command to be run on a server, as provided by the caller. This is the value
/// form the dispatcher's public entry points hand to the execution machinery.
#[derive(Debug, Clone)]
pub(crate) struct RunCommand {
    target_db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
    retryability: Retryability,
}

impl RunCommand {
    pub(crate) fn new(
        target_db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
        retryability: Retryability,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "an empty document cannot be run as a command".to_string(),
            }
            .into());
        }

        Ok(Self {
            target_db: target_db.into(),
            command,
            selection_criteria,
            retryability,
        })
    }
}

impl Operation for RunCommand {
    type O = Document;

    fn name(&self) -> &str {
        // The command name is the first key of the document.
        self.command
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or("")
    }

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.name().to_string(),
            self.target_db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(&self, response: &CommandResponse) -> Result<Self::O> {
        Ok(response.raw_response.clone())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_read_concern(&self) -> bool {
        self.retryability == Retryability::Read
    }

    fn retryability(&self) -> Retryability {
        self.retryability
    }
}
