use super::{append_write_concern, Operation, Retryability};
use crate::{
    bson::doc,
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    options::WriteConcern,
};

pub(crate) struct AbortTransaction {
    write_concern: Option<WriteConcern>,
}

impl AbortTransaction {
    pub(crate) fn new(write_concern: Option<WriteConcern>) -> Self {
        Self { write_concern }
    }
}

impl Operation for AbortTransaction {
    type O = ();

    fn name(&self) -> &str {
        "abortTransaction"
    }

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            "abortTransaction": 1,
        };
        append_write_concern(&mut body, self.write_concern());
        Ok(Command::new("abortTransaction", "admin", body))
    }

    fn handle_response(&self, _response: &CommandResponse) -> Result<Self::O> {
        Ok(())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    fn retry_ignores_config(&self) -> bool {
        true
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }
}
