use once_cell::sync::Lazy;

use super::Operation;
use crate::{
    bson::{Bson, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

static END_SESSIONS_CRITERIA: Lazy<SelectionCriteria> = Lazy::new(|| {
    SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred { options: None })
});

/// Tells the deployment to discard the given pooled session ids ahead of their timeout, as a
/// courtesy during client shutdown.
pub(crate) struct EndSessions {
    session_ids: Vec<Document>,
}

impl EndSessions {
    pub(crate) fn new(session_ids: Vec<Document>) -> Self {
        Self { session_ids }
    }
}

impl Operation for EndSessions {
    type O = ();

    fn name(&self) -> &str {
        "endSessions"
    }

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let ids: Vec<Bson> = self
            .session_ids
            .iter()
            .cloned()
            .map(Bson::Document)
            .collect();
        let mut body = Document::new();
        body.insert("endSessions", ids);
        Ok(Command::new("endSessions", "admin", body))
    }

    fn handle_response(&self, _response: &CommandResponse) -> Result<Self::O> {
        Ok(())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&END_SESSIONS_CRITERIA)
    }

    /// This command manages sessions; attaching one would be circular.
    fn supports_sessions(&self) -> bool {
        false
    }
}
