//! Conflict policies.
//!
//! A policy turns the local value plus every replica that disagrees with it
//! into one authoritative value. The manager calls it at most once per
//! reconciliation batch.

use async_trait::async_trait;
use futures::Future;
use jasper_core::{Replica, Timestamped, Value};
use std::marker::PhantomData;
use std::time::Duration;

/// A replica whose read disagrees with the value being reconciled against.
#[derive(Clone, Debug)]
pub struct Conflict<V> {
    pub replica: Replica,
    pub value: Timestamped<V>,
}

/// Resolves a batch of conflicts into a single value.
#[async_trait]
pub trait ConflictPolicy<V: Value>: Send + Sync {
    async fn resolve(&self, local: &V, conflicts: &[Conflict<V>]) -> V;
}

/// Keep the local value. Default update policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalWins;

#[async_trait]
impl<V: Value> ConflictPolicy<V> for LocalWins {
    async fn resolve(&self, local: &V, _conflicts: &[Conflict<V>]) -> V {
        local.clone()
    }
}

/// Adopt the most recently written replica value.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatestWins;

#[async_trait]
impl<V: Value> ConflictPolicy<V> for LatestWins {
    async fn resolve(&self, local: &V, conflicts: &[Conflict<V>]) -> V {
        conflicts
            .iter()
            .max_by_key(|conflict| conflict.value.timestamp)
            .map(|conflict| conflict.value.value.clone())
            .unwrap_or_else(|| local.clone())
    }
}

/// Prefer remote backends over local-only ones. Default startup policy.
///
/// A local-only replica only beats a remote one when it was written more than
/// `tolerance` later. Remaining ties go to the most recent write.
#[derive(Clone, Copy, Debug)]
pub struct PreferRemote {
    pub tolerance: Duration,
}

impl Default for PreferRemote {
    fn default() -> Self {
        Self {
            tolerance: Duration::from_secs(60),
        }
    }
}

impl PreferRemote {
    fn pick<'a, V>(&self, conflicts: &'a [Conflict<V>]) -> Option<&'a Conflict<V>> {
        let bonus = chrono::Duration::from_std(self.tolerance).unwrap_or(chrono::Duration::zero());
        conflicts.iter().max_by_key(|conflict| {
            let remote = !conflict.replica.target.is_local();
            let effective = if remote {
                conflict.value.timestamp + bonus
            } else {
                conflict.value.timestamp
            };
            (effective, remote)
        })
    }
}

#[async_trait]
impl<V: Value> ConflictPolicy<V> for PreferRemote {
    async fn resolve(&self, local: &V, conflicts: &[Conflict<V>]) -> V {
        self.pick(conflicts)
            .map(|conflict| conflict.value.value.clone())
            .unwrap_or_else(|| local.clone())
    }
}

/// Policy backed by an async closure.
pub struct FnPolicy<V, F> {
    resolve: F,
    _value: PhantomData<fn() -> V>,
}

/// Build a policy from `|local, conflicts| async { ... }`.
pub fn from_fn<V, F, Fut>(resolve: F) -> FnPolicy<V, F>
where
    V: Value,
    F: Fn(V, Vec<Conflict<V>>) -> Fut + Send + Sync,
    Fut: Future<Output = V> + Send,
{
    FnPolicy {
        resolve,
        _value: PhantomData,
    }
}

#[async_trait]
impl<V, F, Fut> ConflictPolicy<V> for FnPolicy<V, F>
where
    V: Value,
    F: Fn(V, Vec<Conflict<V>>) -> Fut + Send + Sync,
    Fut: Future<Output = V> + Send,
{
    async fn resolve(&self, local: &V, conflicts: &[Conflict<V>]) -> V {
        (self.resolve)(local.clone(), conflicts.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use jasper_core::{FileTarget, MemoryTarget, Target};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct RemoteStub;

    #[async_trait]
    impl Target for RemoteStub {
        fn kind(&self) -> &'static str {
            "remote-stub"
        }
        async fn read(
            &self,
        ) -> Result<Option<Timestamped<Vec<u8>>>, jasper_core::TargetError> {
            Ok(None)
        }
        async fn write(&self, _buffer: Vec<u8>) -> Result<jasper_core::Timestamp, jasper_core::TargetError> {
            Ok(Utc::now())
        }
        async fn timestamp(&self) -> Result<Option<jasper_core::Timestamp>, jasper_core::TargetError> {
            Ok(None)
        }
        fn serialise(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    fn conflict(replica: Replica, value: &str, age_secs: i64) -> Conflict<String> {
        Conflict {
            replica,
            value: Timestamped::new(Utc::now() - ChronoDuration::seconds(age_secs), value.to_string()),
        }
    }

    #[tokio::test]
    async fn test_local_wins() {
        let conflicts = vec![conflict(Replica::new(MemoryTarget::new("a")), "remote", 0)];
        let resolved = LocalWins.resolve(&"local".to_string(), &conflicts).await;
        assert_eq!(resolved, "local");
    }

    #[tokio::test]
    async fn test_latest_wins() {
        let conflicts = vec![
            conflict(Replica::new(MemoryTarget::new("a")), "older", 30),
            conflict(Replica::new(MemoryTarget::new("b")), "newer", 5),
        ];
        let resolved = LatestWins.resolve(&"local".to_string(), &conflicts).await;
        assert_eq!(resolved, "newer");

        let resolved = LatestWins.resolve(&"local".to_string(), &[]).await;
        assert_eq!(resolved, "local");
    }

    #[tokio::test]
    async fn test_prefer_remote_within_tolerance() {
        let policy = PreferRemote::default();
        let conflicts = vec![
            conflict(Replica::new(FileTarget::new("/tmp/device.bin")), "device", 10),
            conflict(Replica::new(RemoteStub), "cloud", 40),
        ];
        let resolved = policy.resolve(&"local".to_string(), &conflicts).await;
        assert_eq!(resolved, "cloud");
    }

    #[tokio::test]
    async fn test_prefer_remote_loses_to_much_newer_local() {
        let policy = PreferRemote {
            tolerance: Duration::from_secs(60),
        };
        let conflicts = vec![
            conflict(Replica::new(MemoryTarget::new("a")), "device", 0),
            conflict(Replica::new(RemoteStub), "cloud", 600),
        ];
        let resolved = policy.resolve(&"local".to_string(), &conflicts).await;
        assert_eq!(resolved, "device");
    }

    #[tokio::test]
    async fn test_prefer_remote_breaks_local_ties_by_time() {
        let policy = PreferRemote::default();
        let conflicts = vec![
            conflict(Replica::new(MemoryTarget::new("a")), "stale", 20),
            conflict(Replica::new(MemoryTarget::new("b")), "fresh", 1),
        ];
        assert_eq!(policy.resolve(&"local".to_string(), &conflicts).await, "fresh");
    }

    #[tokio::test]
    async fn test_fn_policy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let policy = from_fn(move |local: String, conflicts: Vec<Conflict<String>>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { format!("{}+{}", local, conflicts.len()) }
        });

        let conflicts = vec![conflict(Replica::new(MemoryTarget::new("a")), "x", 0)];
        assert_eq!(policy.resolve(&"v".to_string(), &conflicts).await, "v+1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
