//! Manager state and pending-operation buffers.
//!
//! The manager is either `Waiting` (idle) or `Busy` with exactly one
//! operation in flight. Requests that arrive while busy land in typed
//! buffers, coalescing with earlier requests of the same kind, and are drained
//! in priority order: replica-set replace, removals, additions, writes, poll.

use crate::error::ManagerError;
use crate::startup::Startup;
use jasper_core::Replica;
use std::fmt;
use tokio::sync::oneshot;

/// Resolved once the request it belongs to has been applied.
pub(crate) type Waiter = oneshot::Sender<Result<(), ManagerError>>;

/// Operation currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialising,
    AddingReplicas,
    RemovingReplicas,
    Uploading,
    Polling,
    UpdatingReplicas,
}

/// Public view of the manager state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Busy(Phase),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Waiting => write!(f, "WAITING"),
            Status::Busy(Phase::Initialising) => write!(f, "INITIALISING"),
            Status::Busy(Phase::AddingReplicas) => write!(f, "ADDING_SYNC"),
            Status::Busy(Phase::RemovingReplicas) => write!(f, "REMOVING_SYNC"),
            Status::Busy(Phase::Uploading) => write!(f, "UPLOADING"),
            Status::Busy(Phase::Polling) => write!(f, "POLLING"),
            Status::Busy(Phase::UpdatingReplicas) => write!(f, "UPDATING_SYNCS"),
        }
    }
}

/// A request for the manager's queue.
pub(crate) enum Request<V> {
    UpdateReplicas(Vec<Replica>),
    Remove(Vec<Replica>, Option<Waiter>),
    Add(Vec<Replica>, Option<Waiter>),
    Write(V),
    Poll(Option<Waiter>),
}

impl<V> Request<V> {
    fn phase(&self) -> Phase {
        match self {
            Request::UpdateReplicas(_) => Phase::UpdatingReplicas,
            Request::Remove(..) => Phase::RemovingReplicas,
            Request::Add(..) => Phase::AddingReplicas,
            Request::Write(_) => Phase::Uploading,
            Request::Poll(_) => Phase::Polling,
        }
    }
}

/// A drained batch ready to run.
pub(crate) enum Operation<V> {
    Initialise(Startup<V>),
    UpdateReplicas(Vec<Replica>),
    Remove(Vec<Replica>, Vec<Waiter>),
    Add(Vec<Replica>, Vec<Waiter>),
    Write(V),
    Poll(Vec<Waiter>),
}

impl<V> Operation<V> {
    pub(crate) fn phase(&self) -> Phase {
        match self {
            Operation::Initialise(_) => Phase::Initialising,
            Operation::UpdateReplicas(_) => Phase::UpdatingReplicas,
            Operation::Remove(..) => Phase::RemovingReplicas,
            Operation::Add(..) => Phase::AddingReplicas,
            Operation::Write(_) => Phase::Uploading,
            Operation::Poll(_) => Phase::Polling,
        }
    }
}

/// Buffers of requests waiting for the in-flight operation to finish.
pub(crate) struct Pending<V> {
    update_replicas: Option<Vec<Replica>>,
    removals: Vec<Replica>,
    removal_waiters: Vec<Waiter>,
    additions: Vec<Replica>,
    addition_waiters: Vec<Waiter>,
    write: Option<V>,
    poll: bool,
    poll_waiters: Vec<Waiter>,
}

impl<V> Default for Pending<V> {
    fn default() -> Self {
        Self {
            update_replicas: None,
            removals: Vec::new(),
            removal_waiters: Vec::new(),
            additions: Vec::new(),
            addition_waiters: Vec::new(),
            write: None,
            poll: false,
            poll_waiters: Vec::new(),
        }
    }
}

impl<V> Pending<V> {
    fn push(&mut self, request: Request<V>) {
        match request {
            Request::UpdateReplicas(replicas) => self.update_replicas = Some(replicas),
            Request::Remove(replicas, waiter) => {
                self.removals.extend(replicas);
                self.removal_waiters.extend(waiter);
            }
            Request::Add(replicas, waiter) => {
                self.additions.extend(replicas);
                self.addition_waiters.extend(waiter);
            }
            Request::Write(value) => self.write = Some(value),
            Request::Poll(waiter) => {
                self.poll = true;
                self.poll_waiters.extend(waiter);
            }
        }
    }

    fn take_next(&mut self) -> Option<Operation<V>> {
        if let Some(replicas) = self.update_replicas.take() {
            return Some(Operation::UpdateReplicas(replicas));
        }
        if !self.removals.is_empty() || !self.removal_waiters.is_empty() {
            return Some(Operation::Remove(
                std::mem::take(&mut self.removals),
                std::mem::take(&mut self.removal_waiters),
            ));
        }
        if !self.additions.is_empty() || !self.addition_waiters.is_empty() {
            return Some(Operation::Add(
                std::mem::take(&mut self.additions),
                std::mem::take(&mut self.addition_waiters),
            ));
        }
        if let Some(value) = self.write.take() {
            return Some(Operation::Write(value));
        }
        if self.poll {
            self.poll = false;
            return Some(Operation::Poll(std::mem::take(&mut self.poll_waiters)));
        }
        None
    }
}

/// Manager state: idle, or one operation in flight plus pending requests.
pub(crate) enum State<V> {
    Waiting,
    Busy { phase: Phase, pending: Pending<V> },
}

impl<V> State<V> {
    /// State right after construction: the startup reconciliation is in flight.
    pub(crate) fn initialising() -> Self {
        State::Busy {
            phase: Phase::Initialising,
            pending: Pending::default(),
        }
    }

    pub(crate) fn status(&self) -> Status {
        match self {
            State::Waiting => Status::Waiting,
            State::Busy { phase, .. } => Status::Busy(*phase),
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(self, State::Waiting)
    }

    /// Queue a request. When waiting, the request becomes the next operation.
    pub(crate) fn enqueue(&mut self, request: Request<V>) {
        if self.is_waiting() {
            *self = State::Busy {
                phase: request.phase(),
                pending: Pending::default(),
            };
        }
        if let State::Busy { pending, .. } = self {
            pending.push(request);
        }
    }

    /// Take the next operation to run, or fall back to `Waiting`.
    pub(crate) fn next_operation(&mut self) -> Option<Operation<V>> {
        let next = match self {
            State::Waiting => return None,
            State::Busy { pending, .. } => pending.take_next(),
        };
        match next {
            Some(operation) => {
                if let State::Busy { phase, .. } = self {
                    *phase = operation.phase();
                }
                Some(operation)
            }
            None => {
                *self = State::Waiting;
                None
            }
        }
    }

    /// A local write is queued behind the in-flight operation.
    pub(crate) fn has_pending_write(&self) -> bool {
        matches!(self, State::Busy { pending, .. } if pending.write.is_some())
    }

    /// A poll is running or queued.
    pub(crate) fn poll_scheduled(&self) -> bool {
        matches!(
            self,
            State::Busy { phase: Phase::Polling, .. }
        ) || matches!(self, State::Busy { pending, .. } if pending.poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jasper_core::MemoryTarget;

    fn replica(id: &str) -> Replica {
        Replica::new(MemoryTarget::new(id))
    }

    fn drain(state: &mut State<&'static str>) -> Vec<Phase> {
        let mut phases = Vec::new();
        while let Some(operation) = state.next_operation() {
            phases.push(operation.phase());
        }
        phases
    }

    #[test]
    fn test_enqueue_from_waiting_starts_busy() {
        let mut state: State<&str> = State::Waiting;
        state.enqueue(Request::Write("a"));
        assert_eq!(state.status(), Status::Busy(Phase::Uploading));

        assert!(matches!(state.next_operation(), Some(Operation::Write("a"))));
        assert!(state.next_operation().is_none());
        assert!(state.is_waiting());
    }

    #[test]
    fn test_drain_priority() {
        let mut state = State::initialising();
        state.enqueue(Request::Poll(None));
        state.enqueue(Request::Write("v"));
        state.enqueue(Request::Add(vec![replica("a")], None));
        state.enqueue(Request::Remove(vec![replica("b")], None));
        state.enqueue(Request::UpdateReplicas(vec![replica("c")]));

        assert_eq!(
            drain(&mut state),
            vec![
                Phase::UpdatingReplicas,
                Phase::RemovingReplicas,
                Phase::AddingReplicas,
                Phase::Uploading,
                Phase::Polling,
            ]
        );
        assert!(state.is_waiting());
    }

    #[test]
    fn test_same_kind_requests_coalesce() {
        let mut state = State::initialising();
        state.enqueue(Request::Write("first"));
        state.enqueue(Request::Write("second"));
        state.enqueue(Request::Write("third"));
        state.enqueue(Request::Add(vec![replica("a")], None));
        state.enqueue(Request::Add(vec![replica("b")], None));
        state.enqueue(Request::Poll(None));
        state.enqueue(Request::Poll(None));

        match state.next_operation() {
            Some(Operation::Add(replicas, _)) => assert_eq!(replicas.len(), 2),
            _ => panic!("expected a single addition batch"),
        }
        assert!(matches!(state.next_operation(), Some(Operation::Write("third"))));
        assert!(matches!(state.next_operation(), Some(Operation::Poll(_))));
        assert!(state.next_operation().is_none());
    }

    #[test]
    fn test_latest_replica_set_wins() {
        let mut state: State<&str> = State::initialising();
        state.enqueue(Request::UpdateReplicas(vec![replica("a")]));
        state.enqueue(Request::UpdateReplicas(vec![replica("b"), replica("c")]));

        match state.next_operation() {
            Some(Operation::UpdateReplicas(replicas)) => assert_eq!(replicas.len(), 2),
            _ => panic!("expected a replica-set update"),
        }
        assert!(state.next_operation().is_none());
    }

    #[test]
    fn test_pending_queries() {
        let mut state: State<&str> = State::initialising();
        assert!(!state.has_pending_write());
        assert!(!state.poll_scheduled());

        state.enqueue(Request::Write("v"));
        state.enqueue(Request::Poll(None));
        assert!(state.has_pending_write());
        assert!(state.poll_scheduled());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(Status::Waiting.to_string(), "WAITING");
        assert_eq!(Status::Busy(Phase::UpdatingReplicas).to_string(), "UPDATING_SYNCS");
    }
}
