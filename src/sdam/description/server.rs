use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    client::session::ClusterTime,
    error::Error,
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "3.6";
const DRIVER_MIN_WIRE_VERSION: i32 = 6;
const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// The possible types for a server.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica-set mongod.
    Standalone,

    /// A router to a sharded cluster, i.e. a mongos.
    Mongos,

    /// A replica set member which another member has designated as its primary, but which has
    /// not yet been checked by a monitor.
    PossiblePrimary,

    /// A replica set primary.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A replica set secondary.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A replica set arbiter.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// A replica set member that is none of the other types (a passive, for example).
    #[serde(rename = "RSOther")]
    RsOther,

    /// A replica set member that does not report a set name or a hosts list.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
        )
    }
}

/// An immutable snapshot of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls, weighted by the most recent ones.
    pub(crate) average_round_trip_time: Option<Duration>,

    // The SDAM spec indicates that a ServerDescription needs to contain an error message if an
    // error occurred when trying to send a hello for the server's heartbeat. Additionally, we
    // need to be able to create a server description that doesn't contain either a hello reply
    // or an error, since there's a gap between when a server is newly added to the topology and
    // when the first heartbeat occurs.
    //
    // In order to represent all these states, we store a Result directly in the
    // ServerDescription, which either contains the aforementioned error message or an
    // Option<HelloReply>. This allows us to ensure that only valid states are possible (e.g.
    // preventing that both an error and a reply are present) while still making it easy to
    // define helper methods on ServerDescription for information we need from the hello reply by
    // propagating with `?`.
    pub(crate) reply: Result<Option<HelloReply>, String>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| (
                    &r.command_response.set_name,
                    &r.command_response.set_version,
                    &r.command_response.election_id,
                    &r.command_response.hosts,
                    &r.command_response.last_write,
                    &r.command_response.tags,
                ));
                let other_response = other_reply.as_ref().map(|r| (
                    &r.command_response.set_name,
                    &r.command_response.set_version,
                    &r.command_response.election_id,
                    &r.command_response.hosts,
                    &r.command_response.last_write,
                    &r.command_response.tags,
                ));

                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => self_err == other_err,
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description for a server the driver hasn't communicated with yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: address.canonicalized(),
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    /// A description derived from a successful hello check.
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let server_type = reply.command_response.server_type();

        // Normalize all instances of hostnames to lowercase.
        for list in [
            reply.command_response.hosts.as_mut(),
            reply.command_response.passives.as_mut(),
            reply.command_response.arbiters.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for host in list.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = reply.command_response.me {
            *me = me.to_lowercase();
        }

        Self {
            address: address.canonicalized(),
            server_type,
            last_update_time: Some(DateTime::now()),
            // If the server type is unknown, we don't want to take the round trip time into
            // account during server selection.
            average_round_trip_time: (server_type != ServerType::Unknown).then_some(average_rtt),
            reply: Ok(Some(reply)),
        }
    }

    /// A description for a server whose check failed with the given error.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            address: address.canonicalized(),
            server_type: ServerType::Unknown,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: None,
            reply: Err(error.to_string()),
        }
    }

    /// Whether this server is "available" as per the definition in the server selection spec.
    pub(crate) fn is_available(&self) -> bool {
        !matches!(self.server_type, ServerType::Unknown)
    }

    pub(crate) fn error_message(&self) -> Option<&str> {
        self.reply.as_ref().err().map(|s| s.as_str())
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this driver only supports up to \
                     {}",
                    self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this driver requires at least {} \
                     (MongoDB {}).",
                    self.address,
                    hello_max_wire_version,
                    DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION,
                ));
            }
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>, String> {
        let set_name = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone());
        Ok(set_name)
    }

    /// The addresses of all replica set members this server knows about (hosts, passives, and
    /// arbiters). Unparseable entries are skipped.
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>, String> {
        let known_hosts = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .map(|reply| {
                let response = &reply.command_response;
                response
                    .hosts
                    .iter()
                    .flatten()
                    .chain(response.passives.iter().flatten())
                    .chain(response.arbiters.iter().flatten())
                    .filter_map(|host| ServerAddress::parse(host).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(known_hosts)
    }

    /// Whether the server's self-reported address (`me`) disagrees with the address the driver
    /// used to reach it.
    pub(crate) fn invalid_me(&self) -> Result<bool, String> {
        if let Some(ref reply) = self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(&self.address.to_string() != me);
            }
        }

        Ok(false)
    }

    /// The address this server reports as the current primary, if any.
    pub(crate) fn designated_primary(&self) -> Option<ServerAddress> {
        match self.reply {
            Ok(Some(ref reply)) => reply
                .command_response
                .primary
                .as_deref()
                .and_then(|primary| ServerAddress::parse(primary).ok()),
            _ => None,
        }
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>, String> {
        let set_version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version);
        Ok(set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>, String> {
        let election_id = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id);
        Ok(election_id)
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>, String> {
        let version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.max_wire_version);
        Ok(version)
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>, String> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>, String> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60))),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn cluster_time(&self) -> Result<Option<ClusterTime>, String> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply.cluster_time.clone()),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn tags(&self) -> Option<&TagSet> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.tags.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}
