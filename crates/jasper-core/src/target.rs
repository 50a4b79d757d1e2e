//! Target abstraction: the storage backends that act as replicas.

use crate::error::TargetError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Last-write time reported by a target.
pub type Timestamp = DateTime<Utc>;

/// A value together with the time it was written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    pub timestamp: Timestamp,
    pub value: T,
}

impl<T> Timestamped<T> {
    pub fn new(timestamp: Timestamp, value: T) -> Self {
        Self { timestamp, value }
    }

    /// Transform the value, keeping the timestamp.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Timestamped<U> {
        Timestamped {
            timestamp: self.timestamp,
            value: f(self.value),
        }
    }
}

/// Capability contract every storage backend implements.
///
/// Implementations never panic across this boundary: every failure is
/// reported as a [`TargetError`].
#[async_trait]
pub trait Target: Send + Sync + fmt::Debug + 'static {
    /// Registry key used when the replica set is persisted.
    fn kind(&self) -> &'static str;

    /// Read the stored bytes, or `None` if the target holds nothing.
    async fn read(&self) -> Result<Option<Timestamped<Vec<u8>>>, TargetError>;

    /// Replace the stored bytes and return the new write time.
    async fn write(&self, buffer: Vec<u8>) -> Result<Timestamp, TargetError>;

    /// Last write time without fetching the content.
    async fn timestamp(&self) -> Result<Option<Timestamp>, TargetError>;

    /// Configuration that the registry can turn back into an equal target.
    fn serialise(&self) -> serde_json::Value;

    /// Whether the backend is reachable right now.
    fn online(&self) -> bool {
        true
    }

    /// Local-only backends (device storage, memory) lose to remote ones when
    /// the startup policy has to choose.
    fn is_local(&self) -> bool {
        false
    }

    /// Structural equality: same kind and same serialised configuration.
    fn equals(&self, other: &dyn Target) -> bool {
        self.kind() == other.kind() && self.serialise() == other.serialise()
    }
}

/// A write time strictly after `previous`, so consecutive writes are always
/// distinguishable even on coarse clocks.
pub fn next_write_time(previous: Option<Timestamp>) -> Timestamp {
    let now = Utc::now();
    match previous {
        Some(previous) if previous >= now => previous + ChronoDuration::milliseconds(1),
        _ => now,
    }
}
