use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::watch;

use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::{self, WorkerHandle, WorkerHandleListener},
    sdam::{
        description::server::{ServerDescription, ServerType},
        TopologyCheckRequestReceiver,
        TopologyUpdater,
        TopologyWatcher,
    },
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The lower bound on how frequently a monitor may probe its server, regardless of the
/// configured heartbeat frequency or how many immediate checks are requested.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Monitors a single server's state via periodic hello checks, publishing the resulting
/// server descriptions to the topology.
pub(crate) struct Monitor {
    address: ServerAddress,

    /// The dedicated monitoring connection. Dropped and re-established after network errors.
    connection: Option<Connection>,

    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    request_receiver: MonitorRequestReceiver,
    options: ClientOptions,

    /// The exponentially-weighted moving average round trip time of this server's checks.
    average_round_trip_time: Option<Duration>,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        request_receiver: MonitorRequestReceiver,
        connection_establisher: ConnectionEstablisher,
        options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            connection_establisher,
            topology_updater,
            topology_watcher,
            request_receiver,
            options,
            average_round_trip_time: None,
        };

        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
            .max(MIN_HEARTBEAT_FREQUENCY);

        while self.topology_watcher.is_alive() {
            self.check_server().await;

            let stop = self
                .request_receiver
                .wait_for_next_check(MIN_HEARTBEAT_FREQUENCY, heartbeat_frequency)
                .await;
            if stop {
                break;
            }
        }

        tracing::debug!(address = %self.address, "monitor stopped");
    }

    /// Checks the server by running a hello command, publishing the new server description
    /// (or the check's error) to the topology.
    async fn check_server(&mut self) {
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                self.connection = None;
                self.average_round_trip_time = None;

                let previous_type = self
                    .topology_watcher
                    .server_description(&self.address)
                    .map(|sd| sd.server_type)
                    .unwrap_or(ServerType::Unknown);

                // Per SDAM, a network error against a known server warrants one immediate
                // retry on a fresh connection before the server is marked Unknown.
                if error.is_network_error() && previous_type != ServerType::Unknown {
                    self.perform_hello().await
                } else {
                    Err(error)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.average_round_trip_time
                        .unwrap_or(Duration::ZERO),
                );
                self.topology_updater.update(description).await;
            }
            Err(error) => {
                self.connection = None;
                tracing::debug!(address = %self.address, error = %error, "server check failed");
                self.topology_updater
                    .handle_monitor_error(self.address.clone(), error)
                    .await;
            }
        }
    }

    /// Issues a hello on the monitoring connection, establishing one first if necessary, and
    /// folds the observed round trip time into the moving average. The check is bounded by
    /// the connect timeout via the monitoring connection's socket timeout.
    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let start = Instant::now();

        let result = match self.connection {
            Some(ref mut conn) => {
                let hello_ok = conn.stream_description().ok().map(|sd| sd.hello_ok);
                run_hello(conn, hello_command(hello_ok)).await
            }
            None => {
                match self
                    .connection_establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await
                {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(reply) => {
                self.update_average_round_trip_time(start.elapsed());
                Ok(reply)
            }
            Err(e) => {
                if e.is_network_error() {
                    self.connection = None;
                }
                Err(e)
            }
        }
    }

    /// Update the exponentially-weighted moving average round trip time for this server, with
    /// the new sample weighted at 0.2.
    fn update_average_round_trip_time(&mut self, round_trip_time: Duration) {
        self.average_round_trip_time = Some(ewma_round_trip_time(
            self.average_round_trip_time,
            round_trip_time,
        ));
    }
}

pub(crate) fn ewma_round_trip_time(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        Some(previous) => sample / 5 + (previous * 4) / 5,
        None => sample,
    }
}

/// Handle used to request checks of and close a server's monitor. When the last clone of this
/// manager is dropped, the monitor will stop after its current wait.
#[derive(Debug, Clone)]
pub(crate) struct MonitorManager {
    check_requester: Arc<watch::Sender<()>>,
    _handle: WorkerHandle,
}

impl MonitorManager {
    pub(crate) fn new(handle: WorkerHandle) -> Self {
        Self {
            check_requester: Arc::new(watch::channel(()).0),
            _handle: handle,
        }
    }

    /// Request that this server's monitor skip the rest of its heartbeat wait and check the
    /// server now.
    pub(crate) fn request_immediate_check(&self) {
        let _ = self.check_requester.send(());
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.check_requester.subscribe()
    }
}

/// The wake-up sources a monitor sleeps on between checks: its own heartbeat timer, immediate
/// check requests for this server, topology-wide check requests from waiting operations, and
/// topology shutdown.
pub(crate) struct MonitorRequestReceiver {
    individual_check_receiver: watch::Receiver<()>,
    topology_check_receiver: TopologyCheckRequestReceiver,
    handle_listener: WorkerHandleListener,
}

impl MonitorRequestReceiver {
    pub(crate) fn new(
        manager: &MonitorManager,
        topology_check_receiver: TopologyCheckRequestReceiver,
        handle_listener: WorkerHandleListener,
    ) -> Self {
        Self {
            individual_check_receiver: manager.subscribe(),
            topology_check_receiver,
            handle_listener,
        }
    }

    /// Waits out the heartbeat interval, returning early if an immediate check is requested.
    /// The minimum frequency is always slept in full to protect servers from hot-looping
    /// monitors. Returns `true` if the monitor should shut down instead of checking again.
    pub(crate) async fn wait_for_next_check(
        &mut self,
        min_frequency: Duration,
        heartbeat_frequency: Duration,
    ) -> bool {
        // discard requests that arrived while the check was running
        self.individual_check_receiver.borrow_and_update();

        let individual = &mut self.individual_check_receiver;
        let topology = &mut self.topology_check_receiver;

        let wait = async {
            tokio::time::sleep(min_frequency).await;
            let remainder = heartbeat_frequency.saturating_sub(min_frequency);
            let _ = tokio::time::timeout(remainder, async {
                tokio::select! {
                    _ = individual.changed() => {}
                    _ = topology.wait_for_check_request() => {}
                }
            })
            .await;
        };

        tokio::select! {
            _ = wait => false,
            _ = self.handle_listener.wait_for_all_handle_drops() => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ewma_weights_new_samples_at_one_fifth() {
        let avg = ewma_round_trip_time(None, Duration::from_millis(100));
        assert_eq!(avg, Duration::from_millis(100));

        let avg = ewma_round_trip_time(Some(avg), Duration::from_millis(200));
        assert_eq!(avg, Duration::from_millis(120));

        // A constant stream of identical samples keeps the average fixed.
        let avg = ewma_round_trip_time(Some(Duration::from_millis(50)), Duration::from_millis(50));
        assert_eq!(avg, Duration::from_millis(50));
    }
}
