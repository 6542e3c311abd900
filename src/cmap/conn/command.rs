use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize};

use super::wire::Message;
use crate::{
    bson::{doc, Bson, Document, Timestamp},
    client::session::{ClientSession, ClusterTime},
    error::{CommandError, Error, ErrorKind, Result, WriteConcernError, WriteFailure},
    hello::LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
    selection_criteria::ReadPreference,
};

/// Commands that take authentication-sensitive payloads; their bodies and replies are never
/// surfaced through command monitoring events.
pub(crate) static REDACTED_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "authenticate",
        "saslstart",
        "saslcontinue",
        "getnonce",
        "createuser",
        "updateuser",
        "copydbgetnonce",
        "copydbsaslstart",
        "copydb",
    ]
    .into_iter()
    .collect()
});

/// Driver-side abstraction of a server command, containing everything needed to serialize it
/// to a wire message.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(name: impl Into<String>, target_db: impl Into<String>, body: Document) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.body.insert("lsid", session.id().clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if let Ok(doc) = crate::bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: Document) {
        if !read_concern.is_empty() {
            self.body.insert("readConcern", read_concern);
        }
    }

    /// Attach `readConcern.afterClusterTime` for causally consistent reads, preserving any
    /// read concern level already present.
    pub(crate) fn set_after_cluster_time(&mut self, operation_time: Timestamp) {
        let read_concern = match self.body.get_document_mut("readConcern") {
            Ok(doc) => doc,
            Err(_) => {
                self.body.insert("readConcern", Document::new());
                self.body.get_document_mut("readConcern").unwrap()
            }
        };
        read_concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) {
        if let Ok(doc) = crate::bson::to_bson(read_preference) {
            self.body.insert("$readPreference", doc);
        }
    }

    pub(crate) fn set_max_time_ms(&mut self, max_time: std::time::Duration) {
        if !self.body.contains_key("maxTimeMS") {
            self.body.insert(
                "maxTimeMS",
                i64::try_from(max_time.as_millis()).unwrap_or(i64::MAX),
            );
        }
    }

    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(name.as_str())
            || ((name == "hello" || name == LEGACY_HELLO_COMMAND_NAME_LOWERCASE)
                && self.body.contains_key("speculativeAuthenticate"))
    }

    /// Converts this command into the wire message to be sent to the given database.
    pub(crate) fn into_message(mut self, request_id: impl Into<Option<i32>>) -> Message {
        self.body.insert("$db", self.target_db.clone());
        Message::new(self.body, request_id)
    }
}

/// A helper to deserialize the error-related fields of a command reply.
#[derive(Debug, Deserialize)]
struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    command_error: CommandError,
}

#[derive(Debug, Deserialize)]
struct WriteConcernErrorBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    error_labels: Option<Vec<String>>,
}

/// A response to a command, owned by the connection that read it.
#[derive(Debug, Clone)]
pub(crate) struct CommandResponse {
    source: crate::options::ServerAddress,
    pub(crate) raw_response: Document,
}

impl CommandResponse {
    pub(crate) fn new(source: crate::options::ServerAddress, message: Message) -> Self {
        Self {
            source,
            raw_response: message.document,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_document(doc: Document) -> Self {
        Self {
            source: crate::options::ServerAddress::default(),
            raw_response: doc,
        }
    }

    /// Returns whether this response indicates a success or not (i.e. if "ok: 1").
    pub(crate) fn is_success(&self) -> bool {
        match self.raw_response.get("ok") {
            Some(Bson::Int32(i)) => *i == 1,
            Some(Bson::Int64(i)) => *i == 1,
            Some(Bson::Double(d)) => *d == 1.0,
            Some(Bson::Boolean(b)) => *b,
            _ => false,
        }
    }

    /// Returns a result indicating whether this response corresponds to a command failure or a
    /// failure to satisfy the write concern.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.is_success() {
            let error_response: CommandErrorBody =
                crate::bson::from_document(self.raw_response.clone()).map_err(|_| {
                    Error::invalid_response(format!(
                        "unrecognized error reply from server: {}",
                        self.raw_response
                    ))
                })?;
            return Err(Error::new(
                ErrorKind::Command(error_response.command_error),
                error_response.error_labels,
            ));
        }

        // Per the SDAM spec, write concern errors are surfaced (and their codes consulted)
        // even when the command itself reports ok: 1.
        if self.raw_response.contains_key("writeConcernError") {
            let body: WriteConcernErrorBody =
                crate::bson::from_document(self.raw_response.clone()).map_err(|_| {
                    Error::invalid_response(format!(
                        "unrecognized writeConcernError reply from server: {}",
                        self.raw_response
                    ))
                })?;
            if let Some(wc_error) = body.write_concern_error {
                return Err(Error::new(
                    ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)),
                    body.error_labels,
                ));
            }
        }

        Ok(())
    }

    /// Deserialize the body of the response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_document(self.raw_response.clone()).map_err(|e| {
            Error::invalid_response(format!("failed to deserialize server reply: {}", e))
        })
    }

    /// The `$clusterTime` the server gossiped in this response, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.raw_response
            .get("$clusterTime")
            .and_then(|ct| crate::bson::from_bson(ct.clone()).ok())
    }

    /// The `operationTime` the server reported for this response, if any.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        match self.raw_response.get("operationTime") {
            Some(Bson::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// The address of the server that sent this response.
    #[allow(dead_code)]
    pub(crate) fn source_address(&self) -> &crate::options::ServerAddress {
        &self.source
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_surfaces_command_errors_with_labels() {
        let response = CommandResponse::with_document(doc! {
            "ok": 0,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "not primary",
            "errorLabels": ["RetryableWriteError"],
        });

        let err = response.validate().unwrap_err();
        assert!(err.is_notwritableprimary());
        assert!(err.contains_label("RetryableWriteError"));
    }

    #[test]
    fn validate_surfaces_write_concern_errors() {
        let response = CommandResponse::with_document(doc! {
            "ok": 1,
            "n": 1,
            "writeConcernError": {
                "code": 64,
                "codeName": "WriteConcernFailed",
                "errmsg": "waiting for replication timed out",
            },
        });

        let err = response.validate().unwrap_err();
        assert_eq!(err.sdam_code(), Some(64));
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::Write(WriteFailure::WriteConcernError(_))
        ));
    }

    #[test]
    fn sensitive_commands_are_redacted() {
        let cmd = Command::new("saslStart", "admin", doc! { "saslStart": 1 });
        assert!(cmd.should_redact());
        let cmd = Command::new("find", "db", doc! { "find": "coll" });
        assert!(!cmd.should_redact());
    }
}
