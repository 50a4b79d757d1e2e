//! Startup resolution.
//!
//! All replicas are read concurrently. The first replica to return a value
//! provides the provisional value, so a manager is usable as soon as the
//! fastest backend answers. The remaining reads keep running inside the
//! `Initialising` operation and are reconciled with [`Startup::finish`].

use crate::policy::{Conflict, ConflictPolicy};
use crate::runners::Diff;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use jasper_core::{Replica, TargetError, Timestamped, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How each replica answered the startup read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StartupReport {
    /// Replicas that returned a value.
    pub found: Vec<usize>,
    /// Replicas that hold nothing.
    pub empty: Vec<usize>,
    /// Replicas whose read failed.
    pub failed: Vec<(usize, TargetError)>,
}

impl StartupReport {
    /// No replica could be reached.
    pub fn all_failed(&self) -> bool {
        self.found.is_empty() && self.empty.is_empty() && !self.failed.is_empty()
    }

    /// Number of replicas accounted for.
    pub fn len(&self) -> usize {
        self.found.len() + self.empty.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Producer<V> = Arc<dyn Fn(&StartupReport) -> BoxFuture<'static, V> + Send + Sync>;

/// Value used when no replica holds one.
pub enum Initial<V> {
    Value(V),
    Produce(Producer<V>),
}

impl<V: Value> Initial<V> {
    pub fn value(value: V) -> Self {
        Initial::Value(value)
    }

    /// Compute the initial value lazily.
    pub fn with<F>(produce: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        Initial::Produce(Arc::new(move |_: &StartupReport| {
            futures::future::ready(produce()).boxed()
        }))
    }

    /// Compute the initial value from how the replicas answered.
    pub fn with_report<F>(produce: F) -> Self
    where
        F: Fn(&StartupReport) -> V + Send + Sync + 'static,
    {
        Initial::Produce(Arc::new(move |report: &StartupReport| {
            futures::future::ready(produce(report)).boxed()
        }))
    }

    /// Compute the initial value asynchronously.
    pub fn with_async<F, Fut>(produce: F) -> Self
    where
        F: Fn(StartupReport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = V> + Send + 'static,
    {
        Initial::Produce(Arc::new(move |report: &StartupReport| produce(report.clone()).boxed()))
    }

    pub(crate) async fn produce(&self, report: &StartupReport) -> V {
        match self {
            Initial::Value(value) => value.clone(),
            Initial::Produce(produce) => produce(report).await,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for Initial<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initial::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Initial::Produce(_) => f.write_str("Produce(..)"),
        }
    }
}

/// Fallback consulted before [`Initial`] when no replica returned a value.
pub type OfflineHandler<V> = Arc<dyn Fn(&StartupReport) -> Option<V> + Send + Sync>;

type ReadOutcome<V> = (usize, Result<Option<Timestamped<V>>, TargetError>);

/// Startup reads, split at the first value.
pub(crate) struct Startup<V> {
    found: Vec<(usize, Timestamped<V>)>,
    report: StartupReport,
    stragglers: FuturesUnordered<BoxFuture<'static, ReadOutcome<V>>>,
}

impl<V: Value> Startup<V> {
    /// Read every replica and return once the first value arrives, or once
    /// every read has settled without one.
    pub(crate) async fn begin(replicas: &[Replica], limit: Option<Duration>) -> Self {
        let mut stragglers: FuturesUnordered<BoxFuture<'static, ReadOutcome<V>>> = replicas
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, replica)| async move { (index, replica.read::<V>(limit).await) }.boxed())
            .collect();

        let mut startup = Self {
            found: Vec::new(),
            report: StartupReport::default(),
            stragglers: FuturesUnordered::new(),
        };

        while let Some((index, read)) = stragglers.next().await {
            startup.record(index, read);
            if !startup.found.is_empty() {
                break;
            }
        }
        startup.stragglers = stragglers;
        startup
    }

    fn record(&mut self, index: usize, read: Result<Option<Timestamped<V>>, TargetError>) {
        match read {
            Ok(Some(found)) => {
                self.report.found.push(index);
                self.found.push((index, found));
            }
            Ok(None) => self.report.empty.push(index),
            Err(error) => self.report.failed.push((index, error)),
        }
    }

    /// Value of the fastest replica that held one.
    pub(crate) fn provisional(&self) -> Option<&V> {
        self.found.first().map(|(_, found)| &found.value)
    }

    pub(crate) fn report(&self) -> &StartupReport {
        &self.report
    }

    /// Wait for the remaining reads and reconcile every answer against
    /// `value`, the provisional pick or fallback.
    pub(crate) async fn finish(
        mut self,
        policy: &dyn ConflictPolicy<V>,
        value: &V,
        replicas: Vec<Replica>,
    ) -> Diff<V> {
        while let Some((index, read)) = self.stragglers.next().await {
            self.record(index, read);
        }

        let mut set = replicas;
        let mut writes = self.report.empty.clone();

        for (index, error) in &self.report.failed {
            if let Some(replica) = set.get_mut(*index) {
                tracing::warn!(replica = ?replica.target, %error, "startup read failed");
                replica.desynced = true;
            }
        }
        for (index, found) in &self.found {
            if let Some(replica) = set.get_mut(*index) {
                replica.last_seen_write_time = Some(found.timestamp);
            }
        }

        let diverged = self.found.iter().any(|(_, found)| found.value != *value);
        let decided = if diverged {
            let candidates: Vec<Conflict<V>> = self
                .found
                .iter()
                .filter_map(|(index, found)| {
                    set.get(*index).map(|replica| Conflict {
                        replica: replica.clone(),
                        value: found.clone(),
                    })
                })
                .collect();
            tracing::debug!(candidates = candidates.len(), "replicas disagree at startup");
            policy.resolve(value, &candidates).await
        } else {
            value.clone()
        };

        writes.extend(
            self.found
                .iter()
                .filter(|(_, found)| found.value != decided)
                .map(|(index, _)| *index),
        );

        Diff {
            value: (decided != *value).then_some(decided),
            replicas: set,
            writes,
        }
    }
}
