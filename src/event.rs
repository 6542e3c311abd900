//! Contains the events and handler traits for command and SDAM monitoring.

use std::time::Duration;

use crate::{
    bson::Document,
    cmap::ConnectionInfo,
    error::Error,
    options::ServerAddress,
    sdam::public::{ServerInfo, TopologyInfo},
};

/// An event that triggers when a database command is initiated.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command being run.
    pub command: Document,

    /// The name of the database the command is being run against.
    pub db: String,

    /// The type of command being run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request. Applications can use this to identify the
    /// corresponding event triggered by the completion of this command.
    pub request_id: i32,

    /// Information about the connection used to send the command.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a database command completes without an error.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The server's reply to the command.
    pub reply: Document,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// Information about the connection used to send the command.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a command failed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The error that the driver returned due to the event failing.
    pub failure: Error,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// Information about the connection used to send the command.
    pub connection: ConnectionInfo,
}

/// Applications can implement this trait to specify custom logic to run on each command event
/// sent by the driver.
pub trait CommandEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// database command is initiated.
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// database command successfully completes.
    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// database command fails to complete successfully.
    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The server's previous description.
    pub previous_description: ServerInfo<'static>,

    /// The server's new description.
    pub new_description: ServerInfo<'static>,
}

/// Published when a server is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Published when a server is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The topology's previous description.
    pub previous_description: TopologyInfo,

    /// The topology's new description.
    pub new_description: TopologyInfo,
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event sent
/// by the driver.
pub trait SdamEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// server's description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// server is added to the topology.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// server is removed from the topology.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever the
    /// topology's description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}
}
