use std::{borrow::Cow, fmt, time::Duration};

use crate::{bson::DateTime, options::ServerAddress, selection_criteria::TagSet};

pub use super::description::{server::ServerType, topology::TopologyType};
use super::description::{server::ServerDescription, topology::TopologyDescription};

/// A description of the most up-to-date information known about a server. Further details can
/// be found in the [Server Discovery and Monitoring specification](https://specifications.readthedocs.io/en/latest/server-discovery-and-monitoring/server-discovery-and-monitoring/).
#[derive(Clone)]
pub struct ServerInfo<'a> {
    pub(crate) description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    pub(crate) fn new_owned(description: ServerDescription) -> ServerInfo<'static> {
        ServerInfo {
            description: Cow::Owned(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// to the server.
    ///
    /// This is the value that the driver uses internally to determine the latency window as
    /// part of server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitoring thread for the server updated the
    /// internal information about the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server, if it is a replica set member.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }

    /// Gets the name of the replica set the server belongs to, if any.
    pub fn replica_set_name(&self) -> Option<String> {
        self.description.set_name().ok().flatten()
    }

    /// Gets the error that occurred during the most recent check of the server, if any.
    pub fn error(&self) -> Option<&str> {
        self.description.error_message()
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;

        if let Some(rtt) = self.average_round_trip_time() {
            write!(f, ", Average RTT: {:?}", rtt)?;
        }

        if let Some(error) = self.error() {
            write!(f, ", Error: {}", error)?;
        }

        write!(f, " }}")
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A snapshot of the client's current view of the deployment.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyInfo {
    /// The type of the topology.
    pub topology_type: TopologyType,

    /// The name of the replica set, if the deployment is one.
    pub set_name: Option<String>,

    /// The logical session timeout advertised by the deployment, if sessions are supported.
    pub logical_session_timeout: Option<Duration>,

    /// Descriptions of each server the client is tracking.
    pub servers: Vec<ServerInfo<'static>>,
}

impl From<&TopologyDescription> for TopologyInfo {
    fn from(description: &TopologyDescription) -> Self {
        let mut servers: Vec<_> = description
            .servers
            .values()
            .cloned()
            .map(ServerInfo::new_owned)
            .collect();
        servers.sort_by(|a, b| a.address().to_string().cmp(&b.address().to_string()));
        Self {
            topology_type: description.topology_type,
            set_name: description.set_name.clone(),
            logical_session_timeout: description.logical_session_timeout,
            servers,
        }
    }
}
