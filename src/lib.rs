//! The dispatch core of a MongoDB driver.
//!
//! This crate implements the machinery that sits between a high-level CRUD
//! surface and the wire: it discovers and monitors the servers of a
//! deployment (standalone, replica set, or sharded cluster), selects a
//! suitable server for each operation according to read preferences and
//! latency, executes commands over pooled connections, retries transient
//! failures where the server guarantees idempotency, and manages logical
//! sessions and their transaction state.
//!
//! ```no_run
//! use mongodb_core::{bson::doc, Client};
//!
//! # async fn run() -> mongodb_core::error::Result<()> {
//! let client = Client::with_uri_str("mongodb://localhost:27017").await?;
//! let reply = client
//!     .run_write_command("admin", doc! { "ping": 1 }, None)
//!     .await?;
//! assert_eq!(reply.get_f64("ok").ok(), Some(1.0));
//! # Ok(())
//! # }
//! ```

pub use bson;

pub mod error;
pub mod event;
pub mod options;

mod client;
mod cmap;
mod hello;
mod operation;
mod runtime;
mod sdam;
pub mod selection_criteria;
mod serde_util;

pub use crate::{
    client::{
        session::{ClientSession, ClusterTime},
        Client,
    },
    sdam::public::{ServerInfo, ServerType, TopologyInfo, TopologyType},
};

use once_cell::sync::Lazy;

/// Truthy values of this environment variable enable extra invariant checks
/// on the dispatch hot path. The checks are not cheap; they exist for
/// debugging driver internals, not for production use.
pub const ASSERTS_ENV_VAR: &str = "MONGODB_CORE_WITH_ASSERTS";

static ASSERTS_ENABLED: Lazy<bool> = Lazy::new(|| {
    std::env::var(ASSERTS_ENV_VAR)
        .map(|v| !matches!(v.as_str(), "" | "0" | "false"))
        .unwrap_or(false)
});

pub(crate) fn asserts_enabled() -> bool {
    *ASSERTS_ENABLED
}
