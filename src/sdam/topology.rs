use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver},
    watch::{self, Ref},
};

use crate::{
    client::session::ClusterTime,
    cmap::{establish::{ConnectionEstablisher, EstablisherOptions}, Command, Connection},
    error::{Error, Result},
    event::{
        SdamEventHandler,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyDescriptionChangedEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    sdam::public::{ServerInfo, TopologyInfo},
    selection_criteria::SelectionCriteria,
};

use super::{
    description::topology::{SessionSupportStatus, TransactionSupportStatus},
    monitor::{MonitorManager, MonitorRequestReceiver},
    Monitor,
    Server,
    ServerDescription,
    TopologyDescription,
    TopologyType,
};

/// A struct providing access to the client's current view of the topology.
/// When this is dropped, monitors will stop performing checks.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let description = TopologyDescription::default();

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();
        let state = TopologyState {
            description: description.clone(),
            servers: Default::default(),
        };
        let (watcher, publisher) = TopologyWatcher::channel(state);

        let connection_establisher =
            ConnectionEstablisher::new(EstablisherOptions::from_client_options(&options));

        let worker = TopologyWorker {
            topology_description: description,
            servers: Default::default(),
            update_receiver,
            publisher,
            event_handler: options.sdam_event_handler.clone(),
            options,
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            handle_listener,
            connection_establisher,
        };

        worker.start();

        Ok(Topology {
            watcher,
            updater,
            _worker_handle: worker_handle,
        })
    }

    /// Begin watching for changes in the topology.
    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        // mark the latest topology as seen
        watcher.receiver.borrow_and_update();
        watcher
    }

    /// Borrow the latest state without marking it as seen.
    pub(crate) fn latest(&self) -> Ref<'_, TopologyState> {
        self.watcher.peek_latest()
    }

    /// Handle an error that occurred during operation execution.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) {
        self.updater
            .handle_application_error(address, error, phase)
            .await;
    }

    /// Get the topology's currently highest seen cluster time.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .peek_latest()
            .description
            .cluster_time()
            .cloned()
    }

    /// Update the topology's highest seen cluster time.
    /// If the provided cluster time is not higher than the topology's currently highest seen
    /// cluster time, this method has no effect.
    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to).await;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.peek_latest().description.topology_type
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher
            .peek_latest()
            .description
            .logical_session_timeout
    }

    /// Gets the latest information on whether sessions are supported or not.
    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        self.watcher
            .peek_latest()
            .description
            .session_support_status()
    }

    /// Gets the latest information on whether transactions are supported or not.
    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.watcher
            .peek_latest()
            .description
            .transaction_support_status()
    }

    /// Updates the given `command` as needed based on the `criteria`.
    pub(crate) fn update_command_with_read_pref(
        &self,
        server_address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        self.watcher
            .peek_latest()
            .description
            .update_command_with_read_pref(server_address, command, criteria)
    }

    /// A snapshot of the current view of the deployment.
    pub(crate) fn info(&self) -> TopologyInfo {
        TopologyInfo::from(&self.watcher.peek_latest().description)
    }

    /// Request an immediate check of every monitored server and wait for at least one
    /// resulting topology update, up to the given timeout. Returns whether an update was
    /// observed.
    pub(crate) async fn scan(&self, timeout: Duration) -> bool {
        let mut watcher = self.watch();
        watcher.request_immediate_check();
        watcher.wait_for_update(timeout).await
    }

    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    pub(crate) async fn warm_pool(&self) {
        self.updater.fill_pool().await;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    servers: HashMap<ServerAddress, Weak<Server>>,
}

impl TopologyState {
    /// Get a HashMap of strong references to the underlying servers in the state, filtering
    /// out any servers that are no longer part of the current topology.
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        let mut out = HashMap::new();
        for (k, v) in self.servers.iter() {
            if let Some(server) = v.upgrade() {
                out.insert(k.clone(), server);
            }
        }
        out
    }
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    AdvanceClusterTime(ClusterTime),
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Broadcast(BroadcastMessage),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum BroadcastMessage {
    Shutdown,
    FillPool,
}

/// The worker task that owns the actual topology state and processes updates to it.
struct TopologyWorker {
    /// Receiver used to listen for updates to the topology from monitors or operation
    /// execution.
    update_receiver: TopologyUpdateReceiver,

    /// Listener used to determine when to stop this worker.
    handle_listener: WorkerHandleListener,

    /// Channel used to publish new topology information (e.g. so that operations can perform
    /// server selection).
    publisher: TopologyPublisher,

    /// Map of addresses to servers in the topology. Once servers are dropped from this map,
    /// they will cease to be monitored and their connection pools will be closed.
    servers: HashMap<ServerAddress, MonitoredServer>,

    /// The current TopologyDescription.
    topology_description: TopologyDescription,

    connection_establisher: ConnectionEstablisher,

    event_handler: Option<Arc<dyn SdamEventHandler>>,
    options: ClientOptions,

    // the following fields are stored here for creating new server monitors
    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
}

impl TopologyWorker {
    /// Open the topology by populating it with the initial seed list provided in the options.
    /// This kicks off the monitoring tasks for the servers included in the seed list.
    async fn initialize(&mut self) {
        let mut new_description = self.topology_description.clone();
        new_description.initialize(&self.options);
        self.update_topology(new_description).await;
    }

    fn start(mut self) {
        runtime::spawn(async move {
            self.initialize().await;
            let mut shutdown_ack = None;

            loop {
                tokio::select! {
                    Some(update) = self.update_receiver.recv() => {
                        let (update, ack) = update.into_parts();
                        let mut ack = Some(ack);
                        let changed = match update {
                            UpdateMessage::AdvanceClusterTime(to) => {
                                self.advance_cluster_time(to);
                                true
                            }
                            UpdateMessage::ServerUpdate(sd) => {
                                self.update_server(*sd).await
                            }
                            UpdateMessage::MonitorError { address, error } => {
                                self.handle_monitor_error(address, error).await
                            }
                            UpdateMessage::ApplicationError {
                                address,
                                error,
                                phase,
                            } => self.handle_application_error(address, error, phase).await,
                            UpdateMessage::Broadcast(msg) => {
                                match msg {
                                    BroadcastMessage::FillPool => {
                                        for server in self.servers.values() {
                                            server.pool.warm().await;
                                        }
                                        false
                                    }
                                    BroadcastMessage::Shutdown => {
                                        shutdown_ack = ack.take();
                                        break;
                                    }
                                }
                            }
                        };
                        if let Some(ack) = ack {
                            ack.acknowledge(changed);
                        }
                    },
                    _ = self.handle_listener.wait_for_all_handle_drops() => {
                        break
                    }
                }
            }

            // indicate to the topology watchers that the topology is no longer alive
            drop(self.publisher);

            let mut close_futures = FuturesUnordered::new();
            for (address, server) in self.servers.drain() {
                if let Some(ref handler) = self.event_handler {
                    handler.handle_server_closed_event(ServerClosedEvent { address });
                }
                // dropping the server also drops its monitor manager, stopping the monitor
                close_futures.push(async move { server.pool.close().await });
            }
            while close_futures.next().await.is_some() {}

            if let Some(ack) = shutdown_ack {
                ack.acknowledge(true);
            }
        });
    }

    /// Publish the current TopologyDescription and map of Servers.
    fn publish_state(&self) {
        let servers = self
            .servers
            .iter()
            .map(|(k, v)| (k.clone(), Arc::downgrade(&v.inner)))
            .collect();
        self.publisher.publish_new_state(TopologyState {
            description: self.topology_description.clone(),
            servers,
        })
    }

    fn advance_cluster_time(&mut self, to: ClusterTime) {
        self.topology_description.advance_cluster_time(&to);
        self.publish_state()
    }

    /// Update the topology using the provided `ServerDescription`.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let mut new_description = self.topology_description.clone();
        let _ = new_description.update(sd);
        self.update_topology(new_description).await
    }

    /// Replace the current topology description, starting and stopping monitors and emitting
    /// the appropriate SDAM events for the delta.
    async fn update_topology(&mut self, new_topology_description: TopologyDescription) -> bool {
        let old_description =
            std::mem::replace(&mut self.topology_description, new_topology_description);
        let diff = old_description.diff(&self.topology_description);
        let changed = diff.is_some();

        if let Some(diff) = diff {
            if let Some(ref handler) = self.event_handler {
                for (address, (previous, new)) in diff.changed_servers.iter() {
                    handler.handle_server_description_changed_event(
                        ServerDescriptionChangedEvent {
                            address: (*address).clone(),
                            previous_description: ServerInfo::new_owned((*previous).clone()),
                            new_description: ServerInfo::new_owned((*new).clone()),
                        },
                    );
                }
            }

            let removed_addresses: Vec<_> = diff.removed_addresses.into_iter().cloned().collect();
            let added_addresses: Vec<_> = diff.added_addresses.into_iter().cloned().collect();

            for address in removed_addresses {
                let removed = self.servers.remove(&address);
                debug_assert!(
                    removed.is_some(),
                    "tried to remove non-existent address from topology: {}",
                    address
                );
                if let Some(server) = removed {
                    server.pool.close().await;
                }
                if let Some(ref handler) = self.event_handler {
                    handler.handle_server_closed_event(ServerClosedEvent { address });
                }
            }

            if let Some(ref handler) = self.event_handler {
                handler.handle_topology_description_changed_event(
                    TopologyDescriptionChangedEvent {
                        previous_description: TopologyInfo::from(&old_description),
                        new_description: TopologyInfo::from(&self.topology_description),
                    },
                );
            }

            for address in added_addresses {
                if self.servers.contains_key(&address) {
                    debug_assert!(
                        false,
                        "adding address that already exists in topology: {}",
                        address
                    );
                    continue;
                }

                let (monitor_handle, listener) = WorkerHandleListener::channel();
                let monitor_manager = MonitorManager::new(monitor_handle);

                let monitor_request_receiver = MonitorRequestReceiver::new(
                    &monitor_manager,
                    self.topology_watcher.subscribe_to_topology_check_requests(),
                    listener,
                );

                let server = Server::new(
                    address.clone(),
                    &self.options,
                    self.connection_establisher.clone(),
                    self.topology_updater.clone(),
                );

                self.servers.insert(
                    address.clone(),
                    MonitoredServer {
                        inner: server,
                        monitor_manager,
                    },
                );

                Monitor::start(
                    address.clone(),
                    self.topology_updater.clone(),
                    self.topology_watcher.clone(),
                    monitor_request_receiver,
                    self.connection_establisher.clone(),
                    self.options.clone(),
                );

                if let Some(ref handler) = self.event_handler {
                    handler.handle_server_opening_event(ServerOpeningEvent { address });
                }
            }
        }

        self.publish_state();
        changed
    }

    /// Mark the server at the given address as Unknown using the provided error as the cause.
    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    /// Handle an error that occurred during operation execution.
    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        // An error due to a misconfigured operation does not reflect on server health.
        if error.is_incompatible_server() {
            return false;
        }

        let server = match self.server(&address) {
            Some(s) => s,
            None => return false,
        };

        // Stale errors (from a previous pool generation) have already been acted upon.
        match &phase {
            HandshakePhase::PreHello { generation } => {
                if *generation < server.pool.generation() {
                    return false;
                }
            }
            HandshakePhase::AfterCompletion { generation, .. } => {
                if *generation != server.pool.generation() {
                    return false;
                }
            }
        }

        if error.is_state_change_error() {
            let updated = self.mark_server_as_unknown(address, error.clone()).await;

            if updated {
                // Pre-4.2 servers (wire version < 8) close their connections on stepdown, so
                // the whole pool must be discarded; shutdown errors always invalidate it.
                if error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8 {
                    server.pool.clear(&error).await;
                }
                // The deployment is reconfiguring itself; get fresh views of every member
                // rather than just the one that reported the error.
                self.request_immediate_checks();
            }

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion()
                && (error.is_network_timeout() || error.is_server_error()))
        {
            let updated = self
                .mark_server_as_unknown(server.address.clone(), error.clone())
                .await;
            if updated {
                server.pool.clear(&error).await;
                server.monitor_manager.request_immediate_check();
            }
            updated
        } else {
            false
        }
    }

    /// Handle an error that occurred during a monitor check.
    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.server(&address) {
            Some(server) => {
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    server.pool.clear(&error).await;
                }
                updated
            }
            None => false,
        }
    }

    /// Ask every monitored server's monitor to check now.
    fn request_immediate_checks(&self) {
        for server in self.servers.values() {
            server.monitor_manager.request_immediate_check();
        }
    }

    /// Get the server at the provided address if present in the topology.
    fn server(&self, address: &ServerAddress) -> Option<MonitoredServer> {
        self.servers.get(address).cloned()
    }
}

/// Struct used to update the topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };

        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    /// Send an update message to the topology, waiting until it has been processed.
    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    /// Handle an error that occurred during a monitor check.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    /// Handle an error that occurred during operation execution.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    /// Update the topology using the provided server description, returning a bool
    /// indicating whether the topology changed as a result of the update.
    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send_message(UpdateMessage::AdvanceClusterTime(to))
            .await;
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Broadcast(BroadcastMessage::Shutdown))
            .await;
    }

    pub(crate) async fn fill_pool(&self) {
        self.send_message(UpdateMessage::Broadcast(BroadcastMessage::FillPool))
            .await;
    }
}

/// Receiver used to listen for updates to the topology.
pub(crate) struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }
}

/// Struct used to get the latest topology state and monitor the topology for changes.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    /// Receiver for the latest set of servers and latest TopologyDescription published by the
    /// topology.
    receiver: watch::Receiver<TopologyState>,

    /// Sender used to request a check of the entire topology. The number indicates how many
    /// operations have requested an update and are waiting for the topology to change.
    sender: Arc<watch::Sender<u32>>,

    /// Whether or not this watcher incremented the count in `sender`.
    requested_check: bool,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyPublisher) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher {
            receiver: rx,
            sender: Arc::new(watch::channel(0).0),
            requested_check: false,
        };
        let publisher = TopologyPublisher { state_sender: tx };
        (watcher, publisher)
    }

    /// Whether the topology is still active or if all `Client` instances using it have gone
    /// out of scope.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Get a server description for the server at the provided address.
    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Clone the latest state, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    pub(crate) fn subscribe_to_topology_check_requests(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Request that all the monitors associated with the topology perform immediate checks.
    pub(crate) fn request_immediate_check(&mut self) {
        if self.requested_check {
            return;
        }
        self.requested_check = true;

        // Increment the number of operations waiting for a topology update. When the monitors
        // see this, they'll perform checks as soon as possible. Once a change is detected or
        // this watcher is dropped, this will be decremented again.
        self.sender.send_modify(|counter| *counter += 1);
    }

    /// Wait for a new state to be published or for the timeout to be reached, returning a bool
    /// indicating whether an update was seen or not.
    ///
    /// This method marks the new topology state as seen.
    pub(crate) async fn wait_for_update(&mut self, timeout: impl Into<Option<Duration>>) -> bool {
        let changed = if let Some(timeout) = timeout.into() {
            matches!(
                tokio::time::timeout(timeout, self.receiver.changed()).await,
                Ok(Ok(()))
            )
        } else {
            self.receiver.changed().await.is_ok()
        };

        if changed {
            self.retract_immediate_check_request();
        }

        changed
    }

    fn retract_immediate_check_request(&mut self) {
        if self.requested_check {
            self.requested_check = false;
            self.sender.send_modify(|count| *count -= 1);
        }
    }

    /// Borrow the latest state. This does not mark it as seen.
    ///
    /// Note: this method holds a read lock on the state, so it is best if the borrow is
    /// short-lived. For longer use-cases, clone the `TopologyState` or use `observe_latest`
    /// instead.
    pub(crate) fn peek_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.peek_latest().description.topology_type
    }
}

impl Drop for TopologyWatcher {
    fn drop(&mut self) {
        self.retract_immediate_check_request();
    }
}

/// Struct used to broadcast the latest view of the topology.
struct TopologyPublisher {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyPublisher {
    /// Publish a new state, notifying all of the outstanding `TopologyWatcher`s.
    ///
    /// Note that even if the provided state is equivalent to the previously broadcasted
    /// `TopologyState`, the watchers will still be notified.
    fn publish_new_state(&self, state: TopologyState) {
        let _ = self.state_sender.send(state);
    }
}

/// Struct used to receive topology-wide immediate check requests from operations in server
/// selection. Such requests can be made through a `TopologyWatcher`.
#[derive(Debug, Clone)]
pub(crate) struct TopologyCheckRequestReceiver {
    /// This receives the number of operations that are blocked waiting for an update to the
    /// topology. If the number is > 0, then that means the monitor should perform a check
    /// ASAP.
    ///
    /// A counter is used here instead of `()` so that operations can retract their requests.
    /// This enables the monitor to unambiguously determine whether a request is stale or not
    /// and eliminates races between the monitor listening for check requests and operations
    /// actually sending them.
    receiver: watch::Receiver<u32>,
}

impl TopologyCheckRequestReceiver {
    pub(crate) async fn wait_for_check_request(&mut self) {
        while *self.receiver.borrow() == 0 {
            // If all the requesters hung up, then just return early.
            if self.receiver.changed().await.is_err() {
                return;
            };
        }
    }
}

/// Enum describing a point in time during an operation's execution relative to when the
/// handshake for the connection being used in that operation completed.
///
/// This is used to determine the error handling semantics for certain error types.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Describes a point that occurred before the initial hello completed (e.g. when opening
    /// the socket).
    PreHello { generation: u32 },

    /// Describes a point in time after the handshake completed (e.g. when the command was
    /// sent to the server).
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            // given that this is a handshaked connection, the stream description should
            // always be available, so 0 should never actually be returned here.
            max_wire_version: handshaked_connection
                .stream_description()
                .ok()
                .map(|sd| sd.max_wire_version)
                .unwrap_or(0),
        }
    }

    /// Whether this phase is before the handshake completed or not.
    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}

/// Struct wrapping a [`Server`]. When this is dropped, the monitor for this server will close.
#[derive(Debug, Clone)]
struct MonitoredServer {
    inner: Arc<Server>,
    monitor_manager: MonitorManager,
}

impl std::ops::Deref for MonitoredServer {
    type Target = Server;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}
