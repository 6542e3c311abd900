mod description;
mod monitor;
pub(crate) mod public;
mod server;
mod topology;

pub use self::public::{ServerInfo, ServerType, TopologyInfo, TopologyType};

pub(crate) use self::{
    description::{
        server::ServerDescription,
        topology::{
            server_selection::{attempt_to_select_server, SelectedServer},
            verify_max_staleness,
            SessionSupportStatus,
            TopologyDescription,
            TransactionSupportStatus,
        },
    },
    monitor::{Monitor, MonitorManager, MonitorRequestReceiver, DEFAULT_HEARTBEAT_FREQUENCY},
    server::Server,
    topology::{
        HandshakePhase,
        Topology,
        TopologyCheckRequestReceiver,
        TopologyUpdater,
        TopologyWatcher,
    },
};
