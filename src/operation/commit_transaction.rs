use std::time::Duration;

use super::{append_write_concern, Operation, Retryability};
use crate::{
    bson::doc,
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    options::{TransactionOptions, WriteConcern},
};

pub(crate) struct CommitTransaction {
    options: Option<TransactionOptions>,
}

impl CommitTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self { options }
    }

    /// Commits that are sent again after a failed or indeterminate first attempt must use a
    /// majority write concern with a bounded wtimeout.
    pub(crate) fn update_for_retry_attempt(&mut self) {
        let options = self.options.get_or_insert_with(Default::default);
        let write_concern = options
            .write_concern
            .take()
            .unwrap_or_else(WriteConcern::majority);
        options.write_concern = Some(WriteConcern {
            w: Some(crate::options::Acknowledgment::Majority),
            w_timeout: Some(write_concern.w_timeout.unwrap_or(Duration::from_secs(10))),
            journal: write_concern.journal,
        });
    }
}

impl Operation for CommitTransaction {
    type O = ();

    fn name(&self) -> &str {
        "commitTransaction"
    }

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            "commitTransaction": 1,
        };

        append_write_concern(&mut body, self.write_concern());
        if let Some(max_commit_time) = self.options.as_ref().and_then(|o| o.max_commit_time) {
            body.insert(
                "maxTimeMS",
                i64::try_from(max_commit_time.as_millis()).unwrap_or(i64::MAX),
            );
        }

        Ok(Command::new("commitTransaction", "admin", body))
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

    fn update_for_retry(&mut self) {
        self.update_for_retry_attempt();
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }
}
