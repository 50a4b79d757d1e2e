//! # jasper-sync
//!
//! Keeps one application value consistent across a set of replicas (cloud
//! drives, files, in-memory stores) while staying usable offline.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use jasper_core::{MemoryTarget, Replica};
//! use jasper_sync::{Initial, Manager, ManagerConfigBuilder};
//!
//! # async fn demo() -> jasper_sync::Result<()> {
//! let manager = Manager::builder(Initial::value(0u64))
//!     .with_config(ManagerConfigBuilder::new().id("counter").build())
//!     .replica(Replica::new(MemoryTarget::new("device")))
//!     .start()
//!     .await?;
//!
//! manager.set_value(manager.value() + 1)?;
//! manager.add_replica(Replica::new(MemoryTarget::new("backup"))).await?;
//! manager.settled().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`manager`] - builder, cloneable handle and the driver task
//! - [`state`] - tagged manager state and pending-request buffers
//! - [`runners`] - reconciliation for addition, removal, write, poll and
//!   replica-set update
//! - [`startup`] - first-answer-wins startup resolution
//! - [`policy`] - conflict policies
//! - [`channel`] - broadcast between sibling managers
//! - [`registry`] - manager-id registry and manager cache
//! - [`config`] - manager configuration

pub mod channel;
pub mod config;
pub mod error;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod runners;
pub mod startup;
pub mod state;

// Re-exports for convenience
pub use channel::{BroadcastMessage, Channel, ChannelError, MemoryChannel, MemoryHub};
pub use config::{ManagerConfig, ManagerConfigBuilder};
pub use error::{ManagerError, Result};
pub use manager::{Hooks, Manager, ManagerBuilder, Tunables};
pub use policy::{from_fn, Conflict, ConflictPolicy, LatestWins, LocalWins, PreferRemote};
pub use registry::{ManagerCache, ManagerIds, Registration};
pub use startup::{Initial, OfflineHandler, StartupReport};
pub use state::{Phase, Status};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::channel::{Channel, MemoryHub};
    pub use crate::config::{ManagerConfig, ManagerConfigBuilder};
    pub use crate::error::{ManagerError, Result};
    pub use crate::manager::{Manager, ManagerBuilder};
    pub use crate::policy::{ConflictPolicy, LatestWins, LocalWins, PreferRemote};
    pub use crate::startup::Initial;
    pub use crate::state::Status;
    pub use jasper_core::{MemoryTarget, Replica, Value};
}
