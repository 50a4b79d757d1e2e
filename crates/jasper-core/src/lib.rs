//! # jasper-core
//!
//! Building blocks for replicating one application value across storage
//! backends:
//! - [`target::Target`], the capability contract every backend implements
//! - [`replica::Replica`], a target plus the manager's bookkeeping about it,
//!   and the persisted replica-set format
//! - [`result`], async fan-in helpers over replica calls
//! - [`codec`], value bytes (JSON, optionally gzip-compressed)
//! - [`window::RecentValues`], the recent-value window used by poll
//! - [`memory::MemoryTarget`] and [`file::FileTarget`], local backends

pub mod codec;
pub mod error;
pub mod file;
pub mod memory;
pub mod replica;
pub mod result;
pub mod target;
pub mod window;

pub use codec::Value;
pub use error::{ConfigError, TargetError};
pub use file::FileTarget;
pub use memory::{MemoryStore, MemoryTarget};
pub use replica::{dedup_replicas, serialise_replicas, Replica, ReplicaState, TargetRegistry};
pub use target::{Target, Timestamp, Timestamped};
pub use window::RecentValues;
