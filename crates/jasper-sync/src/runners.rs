//! Reconciliation algorithms for the five manager operations.
//!
//! Each runner takes the operation's arguments plus the manager's current
//! value and replica set and returns a [`Diff`]: the resulting replica set
//! (with updated bookkeeping), an optional value update, and the replicas that
//! must receive the final value. [`apply_writes`] performs those writes.

use crate::policy::{Conflict, ConflictPolicy};
use jasper_core::result::settle_all;
use jasper_core::{dedup_replicas, RecentValues, Replica, TargetError, Timestamped, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Everything a runner needs besides the operation arguments.
pub struct RunContext<V: Value> {
    pub policy: Arc<dyn ConflictPolicy<V>>,
    pub recent: Arc<Mutex<RecentValues<V>>>,
    pub io_timeout: Option<Duration>,
    pub agreement_fast_path: bool,
}

impl<V: Value> Clone for RunContext<V> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            recent: self.recent.clone(),
            io_timeout: self.io_timeout,
            agreement_fast_path: self.agreement_fast_path,
        }
    }
}

/// Outcome of a runner.
#[derive(Debug)]
pub struct Diff<V> {
    /// New value, only when it differs from the current one.
    pub value: Option<V>,
    /// Resulting replica set.
    pub replicas: Vec<Replica>,
    /// Indices into `replicas` that must receive the final value.
    pub writes: Vec<usize>,
}

impl<V> Diff<V> {
    pub fn unchanged(replicas: Vec<Replica>) -> Self {
        Self {
            value: None,
            replicas,
            writes: Vec::new(),
        }
    }
}

/// Outcome of [`apply_writes`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub failed: usize,
}

/// Add replicas to the set, reconciling whatever they already hold.
pub async fn run_addition<V: Value>(
    ctx: &RunContext<V>,
    value: &V,
    replicas: Vec<Replica>,
    requested: Vec<Replica>,
) -> Diff<V> {
    let mut added = dedup_replicas(requested);
    added.retain(|candidate| !replicas.iter().any(|existing| existing.same_target(candidate)));
    if added.is_empty() {
        return Diff::unchanged(replicas);
    }

    let reads = settle_all(added.iter().map(|replica| replica.read::<V>(ctx.io_timeout))).await;

    let mut set = replicas;
    let mut writes = Vec::new();
    let mut conflicts = Vec::new();
    let mut conflict_indices = Vec::new();

    for (mut replica, read) in added.into_iter().zip(reads) {
        let index = set.len();
        match read {
            Ok(None) => writes.push(index),
            Ok(Some(found)) => {
                replica.last_seen_write_time = Some(found.timestamp);
                if found.value != *value {
                    conflicts.push(Conflict {
                        replica: replica.clone(),
                        value: found,
                    });
                    conflict_indices.push(index);
                }
            }
            Err(error) => {
                tracing::warn!(replica = ?replica.target, %error, "could not read added replica");
                replica.desynced = true;
            }
        }
        set.push(replica);
    }

    if conflicts.is_empty() {
        return Diff {
            value: None,
            replicas: set,
            writes,
        };
    }

    let decided = ctx.policy.resolve(value, &conflicts).await;
    let holders = holders_of(&decided, &conflicts, &conflict_indices);

    if decided != *value {
        tracing::debug!(conflicts = conflicts.len(), "addition adopted a replica value");
        let writes = (0..set.len()).filter(|i| !holders.contains(i)).collect();
        Diff {
            value: Some(decided),
            replicas: set,
            writes,
        }
    } else {
        writes.extend(conflict_indices);
        Diff {
            value: None,
            replicas: set,
            writes,
        }
    }
}

/// Drop replicas from the set. No I/O.
pub fn run_removal<V>(replicas: Vec<Replica>, removed: &[Replica]) -> Diff<V> {
    let remaining = replicas
        .into_iter()
        .filter(|replica| !removed.iter().any(|gone| gone.same_target(replica)))
        .collect();
    Diff::unchanged(remaining)
}

/// Push the requested value (or the current one) to every replica in sync.
pub fn run_write<V: Value>(value: &V, replicas: Vec<Replica>, requested: Option<V>) -> Diff<V> {
    let writes = replicas
        .iter()
        .enumerate()
        .filter(|(_, replica)| !replica.desynced)
        .map(|(index, _)| index)
        .collect();
    Diff {
        value: requested.filter(|requested| requested != value),
        replicas,
        writes,
    }
}

enum Check<V> {
    Unchanged,
    Empty,
    Failed(TargetError),
    Read(Timestamped<V>),
}

async fn check<V: Value>(replica: &Replica, limit: Option<Duration>) -> Check<V> {
    match replica.timestamp(limit).await {
        Err(error) => Check::Failed(error),
        Ok(None) => Check::Empty,
        Ok(Some(timestamp)) if Some(timestamp) == replica.last_seen_write_time => Check::Unchanged,
        Ok(Some(_)) => match replica.read::<V>(limit).await {
            Err(error) => Check::Failed(error),
            Ok(None) => Check::Empty,
            Ok(Some(found)) => Check::Read(found),
        },
    }
}

/// Look for changes made to the replicas from elsewhere.
pub async fn run_poll<V: Value>(ctx: &RunContext<V>, value: &V, replicas: Vec<Replica>) -> Diff<V> {
    let checks = futures::future::join_all(
        replicas
            .iter()
            .map(|replica| check::<V>(replica, ctx.io_timeout)),
    )
    .await;

    let mut set = replicas;
    let mut writes = Vec::new();
    let mut conflicts = Vec::new();
    let mut conflict_indices = Vec::new();

    for (index, check) in checks.into_iter().enumerate() {
        let replica = &mut set[index];
        match check {
            Check::Unchanged => {
                // Its last write failed, so it still holds an older value.
                if replica.desynced {
                    writes.push(index);
                }
            }
            Check::Empty => writes.push(index),
            Check::Failed(error) => {
                tracing::warn!(replica = ?replica.target, %error, "poll could not reach replica");
                replica.desynced = true;
            }
            Check::Read(found) => {
                replica.last_seen_write_time = Some(found.timestamp);
                if found.value == *value {
                    replica.desynced = false;
                } else if ctx.recent.lock().contains(&found.value) {
                    writes.push(index);
                } else {
                    conflicts.push(Conflict {
                        replica: replica.clone(),
                        value: found,
                    });
                    conflict_indices.push(index);
                }
            }
        }
    }

    if conflicts.is_empty() {
        return Diff {
            value: None,
            replicas: set,
            writes,
        };
    }

    let shared = &conflicts[0].value.value;
    let agreed = ctx.agreement_fast_path
        && conflicts.iter().all(|conflict| conflict.value.value == *shared)
        && conflicts.iter().any(|conflict| !conflict.replica.desynced);

    let decided = if agreed {
        tracing::debug!(replicas = conflicts.len(), "diverged replicas agree; adopting their value");
        shared.clone()
    } else {
        ctx.policy.resolve(value, &conflicts).await
    };
    let holders = holders_of(&decided, &conflicts, &conflict_indices);

    if decided != *value {
        let writes = (0..set.len()).filter(|i| !holders.contains(i)).collect();
        Diff {
            value: Some(decided),
            replicas: set,
            writes,
        }
    } else {
        writes.extend(conflict_indices);
        Diff {
            value: None,
            replicas: set,
            writes,
        }
    }
}

/// Replace the whole replica set.
pub fn run_update<V>(replicas: Vec<Replica>) -> Diff<V> {
    Diff::unchanged(dedup_replicas(replicas))
}

/// Write `value` to the replicas at `writes`, in parallel, recording each
/// outcome in the replica's bookkeeping.
pub async fn apply_writes<V: Value>(
    ctx: &RunContext<V>,
    value: &V,
    replicas: &mut [Replica],
    writes: &[usize],
) -> WriteReport {
    let mut targets: Vec<usize> = writes
        .iter()
        .copied()
        .filter(|&index| index < replicas.len())
        .collect();
    targets.sort_unstable();
    targets.dedup();

    let outcomes = {
        let replicas = &*replicas;
        settle_all(
            targets
                .iter()
                .map(|&index| replicas[index].write(value, ctx.io_timeout)),
        )
        .await
    };

    let mut report = WriteReport::default();
    for (index, outcome) in targets.into_iter().zip(outcomes) {
        let replica = &mut replicas[index];
        match outcome {
            Ok(timestamp) => {
                replica.last_seen_write_time = Some(timestamp);
                replica.desynced = false;
                report.written += 1;
            }
            Err(error) => {
                tracing::warn!(replica = ?replica.target, %error, "write failed; marking replica desynced");
                replica.desynced = true;
                report.failed += 1;
            }
        }
    }
    report
}

fn holders_of<V: PartialEq>(decided: &V, conflicts: &[Conflict<V>], indices: &[usize]) -> Vec<usize> {
    conflicts
        .iter()
        .zip(indices)
        .filter(|(conflict, _)| conflict.value.value == *decided)
        .map(|(_, &index)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{from_fn, LocalWins};
    use jasper_core::MemoryTarget;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(policy: Arc<dyn ConflictPolicy<String>>) -> RunContext<String> {
        RunContext {
            policy,
            recent: Arc::new(Mutex::new(RecentValues::new(Some(8), None))),
            io_timeout: None,
            agreement_fast_path: true,
        }
    }

    fn counting_policy(answer: &'static str) -> (Arc<dyn ConflictPolicy<String>>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let policy: Arc<dyn ConflictPolicy<String>> =
            Arc::new(from_fn(move |_local: String, _conflicts: Vec<Conflict<String>>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { answer.to_string() }
            }));
        (policy, calls)
    }

    #[tokio::test]
    async fn test_addition_of_empty_replica_writes_once() {
        let (policy, calls) = counting_policy("unused");
        let ctx = context(policy);
        let target = MemoryTarget::new("fresh");

        let diff = run_addition(&ctx, &"v".to_string(), Vec::new(), vec![Replica::new(target.clone())]).await;
        assert_eq!(diff.replicas.len(), 1);
        assert_eq!(diff.writes, vec![0]);
        assert_eq!(diff.value, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_addition_conflicts_resolved_once() {
        let (policy, calls) = counting_policy("VALUEA");
        let ctx = context(policy);
        let a = MemoryTarget::new("a");
        let b = MemoryTarget::new("b");
        a.put(&"VALUEA");
        b.put(&"VALUEB");

        let diff = run_addition(
            &ctx,
            &"VALUE1".to_string(),
            Vec::new(),
            vec![Replica::new(a), Replica::new(b)],
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(diff.value.as_deref(), Some("VALUEA"));
        assert_eq!(diff.writes, vec![1]);
    }

    #[tokio::test]
    async fn test_addition_keeping_local_rewrites_disagreeing() {
        let ctx = context(Arc::new(LocalWins));
        let existing = Replica::new(MemoryTarget::new("existing"));
        let other = MemoryTarget::new("other");
        other.put(&"remote");

        let diff = run_addition(&ctx, &"local".to_string(), vec![existing], vec![Replica::new(other)]).await;
        assert_eq!(diff.value, None);
        assert_eq!(diff.writes, vec![1]);
    }

    #[tokio::test]
    async fn test_addition_failed_read_marks_desynced() {
        let ctx = context(Arc::new(LocalWins));
        let broken = MemoryTarget::new("broken");
        broken.set_failing(true);

        let diff = run_addition(&ctx, &"v".to_string(), Vec::new(), vec![Replica::new(broken)]).await;
        assert_eq!(diff.replicas.len(), 1);
        assert!(diff.replicas[0].desynced);
        assert!(diff.writes.is_empty());
    }

    #[test]
    fn test_removal_by_equality() {
        let replicas = vec![
            Replica::new(MemoryTarget::new("a")),
            Replica::new(MemoryTarget::new("b")),
        ];
        let diff: Diff<String> = run_removal(replicas, &[Replica::new(MemoryTarget::new("a"))]);
        assert_eq!(diff.replicas.len(), 1);
        assert_eq!(diff.replicas[0].target.serialise()["id"], "b");
    }

    #[test]
    fn test_write_skips_desynced() {
        let mut desynced = Replica::new(MemoryTarget::new("b"));
        desynced.desynced = true;
        let replicas = vec![Replica::new(MemoryTarget::new("a")), desynced];

        let diff = run_write(&"v".to_string(), replicas, Some("w".to_string()));
        assert_eq!(diff.writes, vec![0]);
        assert_eq!(diff.value.as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn test_poll_skips_unchanged_timestamps() {
        let ctx = context(Arc::new(LocalWins));
        let target = MemoryTarget::new("a");
        let mut replica = Replica::new(target.clone());
        replica.last_seen_write_time = Some(target.put(&"v"));

        let diff = run_poll(&ctx, &"v".to_string(), vec![replica]).await;
        assert!(diff.writes.is_empty());
        assert_eq!(target.timestamp_calls(), 1);
        assert_eq!(target.reads(), 0);
    }

    #[tokio::test]
    async fn test_poll_pushes_to_emptied_replica() {
        let ctx = context(Arc::new(LocalWins));
        let target = MemoryTarget::new("a");
        let mut replica = Replica::new(target.clone());
        replica.last_seen_write_time = Some(target.put(&"v"));
        target.clear();

        let diff = run_poll(&ctx, &"v".to_string(), vec![replica]).await;
        assert_eq!(diff.writes, vec![0]);
    }

    #[tokio::test]
    async fn test_poll_recognises_recent_value() {
        let (policy, calls) = counting_policy("unused");
        let ctx = context(policy);
        ctx.recent.lock().push("earlier".to_string());
        let target = MemoryTarget::new("a");
        target.put(&"earlier");

        let diff = run_poll(&ctx, &"current".to_string(), vec![Replica::new(target)]).await;
        assert_eq!(diff.writes, vec![0]);
        assert_eq!(diff.value, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_poll_agreement_fast_path() {
        let (policy, calls) = counting_policy("unused");
        let ctx = context(policy);
        let a = MemoryTarget::new("a");
        let b = MemoryTarget::new("b");
        let c = MemoryTarget::new("c");
        a.put(&"remote");
        b.put(&"remote");
        let mut in_sync = Replica::new(c.clone());
        in_sync.last_seen_write_time = Some(c.put(&"local"));

        let diff = run_poll(
            &ctx,
            &"local".to_string(),
            vec![Replica::new(a), Replica::new(b), in_sync],
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(diff.value.as_deref(), Some("remote"));
        assert_eq!(diff.writes, vec![2]);
    }

    #[tokio::test]
    async fn test_poll_without_fast_path_asks_policy_once() {
        let (policy, calls) = counting_policy("local");
        let mut ctx = context(policy);
        ctx.agreement_fast_path = false;
        let a = MemoryTarget::new("a");
        let b = MemoryTarget::new("b");
        a.put(&"x");
        b.put(&"y");

        let diff = run_poll(&ctx, &"local".to_string(), vec![Replica::new(a), Replica::new(b)]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(diff.value, None);
        assert_eq!(diff.writes, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_apply_writes_updates_bookkeeping() {
        let ctx = context(Arc::new(LocalWins));
        let good = MemoryTarget::new("good");
        let bad = MemoryTarget::new("bad");
        bad.set_online(false);
        let mut replicas = vec![Replica::new(good.clone()), Replica::new(bad)];

        let report = apply_writes(&ctx, &"v".to_string(), &mut replicas, &[0, 1, 1]).await;
        assert_eq!(report, WriteReport { written: 1, failed: 1 });
        assert_eq!(replicas[0].last_seen_write_time, good.peek().map(|c| c.timestamp));
        assert!(!replicas[0].desynced);
        assert!(replicas[1].desynced);
        assert_eq!(good.peek_value::<String>().as_deref(), Some("v"));
    }
}
