//! Replication manager.
//!
//! A [`Manager`] is a cheap, cloneable handle. All state lives in a driver
//! task that runs one operation at a time and queues everything else in the
//! tagged [`State`]. Handles talk to the driver over an mpsc command channel
//! and read `watch` snapshots for queries, so queries never wait for the
//! in-flight operation.

use crate::channel::{BroadcastMessage, Channel};
use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::policy::{ConflictPolicy, LocalWins, PreferRemote};
use crate::registry::{ManagerIds, Registration};
use crate::runners::{
    apply_writes, run_addition, run_poll, run_removal, run_update, run_write, Diff, RunContext,
    WriteReport,
};
use crate::startup::{Initial, OfflineHandler, Startup, StartupReport};
use crate::state::{Operation, Phase, Request, State, Status, Waiter};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use jasper_core::{
    dedup_replicas, serialise_replicas, RecentValues, Replica, ReplicaState, TargetRegistry, Value,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

type ValueHook<V> = Arc<dyn Fn(&V) + Send + Sync>;
type ReplicasHook = Arc<dyn Fn(&[ReplicaState]) + Send + Sync>;
type SaveHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks invoked by the driver.
pub struct Hooks<V> {
    /// The value changed for a reason other than a local `set_value`.
    pub on_value_update: Option<ValueHook<V>>,
    /// Replica bookkeeping or membership changed.
    pub on_replicas_update: Option<ReplicasHook>,
    /// Persist the replica-set config string.
    pub save_replicas: Option<SaveHook>,
}

impl<V> Clone for Hooks<V> {
    fn clone(&self) -> Self {
        Self {
            on_value_update: self.on_value_update.clone(),
            on_replicas_update: self.on_replicas_update.clone(),
            save_replicas: self.save_replicas.clone(),
        }
    }
}

impl<V> Default for Hooks<V> {
    fn default() -> Self {
        Self {
            on_value_update: None,
            on_replicas_update: None,
            save_replicas: None,
        }
    }
}

/// Settings that can be changed on a running manager.
pub struct Tunables<V: Value> {
    pub poll_period: Option<Duration>,
    pub recheck_interval: Duration,
    pub io_timeout: Option<Duration>,
    pub agreement_fast_path: bool,
    pub recent_values_len: Option<usize>,
    pub recent_values_age: Option<Duration>,
    pub update_policy: Arc<dyn ConflictPolicy<V>>,
    pub startup_policy: Arc<dyn ConflictPolicy<V>>,
    pub hooks: Hooks<V>,
}

impl<V: Value> Clone for Tunables<V> {
    fn clone(&self) -> Self {
        Self {
            poll_period: self.poll_period,
            recheck_interval: self.recheck_interval,
            io_timeout: self.io_timeout,
            agreement_fast_path: self.agreement_fast_path,
            recent_values_len: self.recent_values_len,
            recent_values_age: self.recent_values_age,
            update_policy: self.update_policy.clone(),
            startup_policy: self.startup_policy.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

impl<V: Value> fmt::Debug for Tunables<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunables")
            .field("poll_period", &self.poll_period)
            .field("recheck_interval", &self.recheck_interval)
            .field("io_timeout", &self.io_timeout)
            .field("agreement_fast_path", &self.agreement_fast_path)
            .field("recent_values_len", &self.recent_values_len)
            .field("recent_values_age", &self.recent_values_age)
            .finish_non_exhaustive()
    }
}

impl<V: Value> Tunables<V> {
    fn context(&self, recent: &Arc<Mutex<RecentValues<V>>>) -> RunContext<V> {
        RunContext {
            policy: self.update_policy.clone(),
            recent: recent.clone(),
            io_timeout: self.io_timeout,
            agreement_fast_path: self.agreement_fast_path,
        }
    }

    fn next_poll_in(&self) -> Duration {
        self.poll_period.unwrap_or(self.recheck_interval)
    }
}

enum Command<V> {
    Write(V),
    Add(Vec<Replica>, Waiter),
    Remove(Vec<Replica>, Waiter),
    Poll(Waiter),
    Settled(Waiter),
    Retune,
    Shutdown(oneshot::Sender<()>),
}

/// Builder for a [`Manager`].
pub struct ManagerBuilder<V: Value> {
    config: ManagerConfig,
    replicas: Vec<Replica>,
    saved_replicas: Option<String>,
    registry: TargetRegistry,
    initial: Initial<V>,
    offline_handler: Option<OfflineHandler<V>>,
    update_policy: Arc<dyn ConflictPolicy<V>>,
    startup_policy: Arc<dyn ConflictPolicy<V>>,
    hooks: Hooks<V>,
    channel: Option<Arc<dyn Channel>>,
    ids: ManagerIds,
}

impl<V: Value> ManagerBuilder<V> {
    pub fn new(initial: Initial<V>) -> Self {
        Self {
            config: ManagerConfig::default(),
            replicas: Vec::new(),
            saved_replicas: None,
            registry: TargetRegistry::new(),
            initial,
            offline_handler: None,
            update_policy: Arc::new(LocalWins),
            startup_policy: Arc::new(PreferRemote::default()),
            hooks: Hooks::default(),
            channel: None,
            ids: ManagerIds::global(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn replica(mut self, replica: Replica) -> Self {
        self.replicas.push(replica);
        self
    }

    pub fn replicas(mut self, replicas: impl IntoIterator<Item = Replica>) -> Self {
        self.replicas.extend(replicas);
        self
    }

    /// Restore replicas from a config string written by the save hook.
    pub fn saved_replicas(mut self, config: impl Into<String>) -> Self {
        self.saved_replicas = Some(config.into());
        self
    }

    /// Deserializers for saved and broadcast replica sets.
    pub fn registry(mut self, registry: TargetRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn offline_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StartupReport) -> Option<V> + Send + Sync + 'static,
    {
        self.offline_handler = Some(Arc::new(handler));
        self
    }

    pub fn update_policy(mut self, policy: impl ConflictPolicy<V> + 'static) -> Self {
        self.update_policy = Arc::new(policy);
        self
    }

    pub fn startup_policy(mut self, policy: impl ConflictPolicy<V> + 'static) -> Self {
        self.startup_policy = Arc::new(policy);
        self
    }

    pub fn on_value_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.hooks.on_value_update = Some(Arc::new(hook));
        self
    }

    pub fn on_replicas_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[ReplicaState]) + Send + Sync + 'static,
    {
        self.hooks.on_replicas_update = Some(Arc::new(hook));
        self
    }

    pub fn save_replicas_with<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.save_replicas = Some(Arc::new(hook));
        self
    }

    pub fn channel(mut self, channel: impl Channel) -> Self {
        self.channel = Some(Arc::new(channel));
        self
    }

    /// Use `ids` instead of the process-wide id registry.
    pub fn ids(mut self, ids: ManagerIds) -> Self {
        self.ids = ids;
        self
    }

    /// Sorted target kinds this manager can hold: registered kinds plus the
    /// kinds of explicitly added replicas.
    pub fn target_kinds(&self) -> Vec<String> {
        let mut kinds: BTreeSet<String> = self.registry.kinds();
        kinds.extend(self.replicas.iter().map(|r| r.target.kind().to_string()));
        kinds.into_iter().collect()
    }

    pub fn tunables(&self) -> Tunables<V> {
        Tunables {
            poll_period: self.config.poll_period,
            recheck_interval: self.config.recheck_interval,
            io_timeout: self.config.io_timeout,
            agreement_fast_path: self.config.agreement_fast_path,
            recent_values_len: self.config.recent_values_len,
            recent_values_age: self.config.recent_values_age,
            update_policy: self.update_policy.clone(),
            startup_policy: self.startup_policy.clone(),
            hooks: self.hooks.clone(),
        }
    }

    /// Start the manager.
    ///
    /// Returns once the fastest replica has answered with a value, or once
    /// every replica has answered and a fallback was chosen. Reconciliation
    /// of the slower replicas continues in the background.
    pub async fn start(self) -> Result<Manager<V>> {
        let registration = match &self.config.id {
            Some(id) => Some(self.ids.claim(id, self.config.allow_duplicate_id)?),
            None => None,
        };
        let target_kinds = self.target_kinds();
        let tunables = self.tunables();

        let mut replicas = self.replicas;
        if let Some(saved) = &self.saved_replicas {
            replicas.extend(self.registry.deserialise_replicas(saved)?);
        }
        let replicas = dedup_replicas(replicas);

        let startup = Startup::<V>::begin(&replicas, tunables.io_timeout).await;
        let value = match startup.provisional() {
            Some(value) => value.clone(),
            None => {
                let fallback = self
                    .offline_handler
                    .as_ref()
                    .and_then(|handler| handler(startup.report()));
                match fallback {
                    Some(value) => value,
                    None => self.initial.produce(startup.report()).await,
                }
            }
        };
        tracing::debug!(
            id = ?self.config.id,
            replicas = replicas.len(),
            provisional = startup.provisional().is_some(),
            "manager started"
        );

        let recent = Arc::new(Mutex::new(RecentValues::new(
            tunables.recent_values_len,
            tunables.recent_values_age,
        )));
        recent.lock().push(value.clone());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (value_tx, _) = watch::channel(value);
        let value_tx = Arc::new(value_tx);
        let issued = Arc::new(AtomicU64::new(0));
        let (states_tx, states_rx) =
            watch::channel(replicas.iter().map(Replica::state).collect::<Vec<_>>());
        let (status_tx, status_rx) = watch::channel(Status::Busy(Phase::Initialising));
        let tunables = Arc::new(RwLock::new(tunables));
        let inbound = self.channel.as_ref().map(|channel| channel.subscribe());
        let outbound = self.channel.map(forward);

        let mut driver = Driver {
            commands: commands_rx,
            value: value_tx.clone(),
            issued: issued.clone(),
            handled: 0,
            states: states_tx,
            status: status_tx,
            tunables: tunables.clone(),
            recent,
            replicas,
            state: State::initialising(),
            in_flight: None,
            registry: self.registry,
            outbound,
            inbound,
            settled: Vec::new(),
            next_poll: None,
            saved: None,
            registration,
        };
        driver.launch(Operation::Initialise(startup));
        tokio::spawn(driver.run());

        Ok(Manager {
            inner: Arc::new(Inner {
                id: self.config.id,
                commands: commands_tx,
                value: value_tx,
                issued,
                states: states_rx,
                status: status_rx,
                tunables,
                target_kinds,
            }),
        })
    }
}

struct Inner<V: Value> {
    id: Option<String>,
    commands: mpsc::UnboundedSender<Command<V>>,
    value: Arc<watch::Sender<V>>,
    /// Local writes sent to the driver, counted under the value lock.
    issued: Arc<AtomicU64>,
    states: watch::Receiver<Vec<ReplicaState>>,
    status: watch::Receiver<Status>,
    tunables: Arc<RwLock<Tunables<V>>>,
    target_kinds: Vec<String>,
}

/// Handle to a running replication manager.
pub struct Manager<V: Value> {
    inner: Arc<Inner<V>>,
}

impl<V: Value> Clone for Manager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Value> fmt::Debug for Manager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<V: Value> Manager<V> {
    pub fn builder(initial: Initial<V>) -> ManagerBuilder<V> {
        ManagerBuilder::new(initial)
    }

    pub fn id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }

    /// Current value.
    pub fn value(&self) -> V {
        self.inner.value.borrow().clone()
    }

    /// Watch value changes.
    pub fn subscribe(&self) -> watch::Receiver<V> {
        self.inner.value.subscribe()
    }

    /// Replace the value locally, tell siblings, and queue a push to every
    /// replica in sync.
    pub fn set_value(&self, value: V) -> Result<()> {
        if self.is_stopped() {
            return Err(ManagerError::Stopped);
        }
        let mut sent = Ok(());
        self.inner.value.send_modify(|current| {
            *current = value.clone();
            self.inner.issued.fetch_add(1, Ordering::SeqCst);
            sent = self.send(Command::Write(value));
        });
        sent
    }

    pub async fn add_replica(&self, replica: Replica) -> Result<()> {
        self.add_replicas(vec![replica]).await
    }

    /// Resolves once the replicas have joined and been reconciled.
    pub async fn add_replicas(&self, replicas: Vec<Replica>) -> Result<()> {
        self.request(|waiter| Command::Add(replicas, waiter)).await
    }

    pub async fn remove_replica(&self, replica: Replica) -> Result<()> {
        self.remove_replicas(vec![replica]).await
    }

    pub async fn remove_replicas(&self, replicas: Vec<Replica>) -> Result<()> {
        self.request(|waiter| Command::Remove(replicas, waiter)).await
    }

    /// Poll now. Coalesces with a timer poll that is already queued.
    pub async fn poll(&self) -> Result<()> {
        self.request(Command::Poll).await
    }

    /// Resolves once no operation is running or queued.
    pub async fn settled(&self) -> Result<()> {
        self.request(Command::Settled).await
    }

    pub fn replica_states(&self) -> Vec<ReplicaState> {
        self.inner.states.borrow().clone()
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    /// Watch state transitions.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.status.clone()
    }

    pub fn tunables(&self) -> Tunables<V> {
        self.inner.tunables.read().clone()
    }

    /// Change settings on the running manager.
    pub fn tune(&self, patch: impl FnOnce(&mut Tunables<V>)) -> Result<()> {
        patch(&mut self.inner.tunables.write());
        self.send(Command::Retune)
    }

    pub fn target_kinds(&self) -> &[String] {
        &self.inner.target_kinds
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.commands.is_closed()
    }

    /// Stop the driver and release the manager id. Queued requests fail
    /// with [`ManagerError::Stopped`].
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    fn send(&self, command: Command<V>) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| ManagerError::Stopped)
    }

    async fn request(&self, command: impl FnOnce(Waiter) -> Command<V>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| ManagerError::Stopped)?
    }
}

struct Completed<V> {
    phase: Phase,
    diff: Diff<V>,
    report: WriteReport,
}

struct InFlight<V> {
    waiters: Vec<Waiter>,
    future: BoxFuture<'static, Completed<V>>,
}

enum Event<V> {
    Completed(Completed<V>),
    Command(Option<Command<V>>),
    Message(Option<String>),
    PollDue,
}

struct Driver<V: Value> {
    commands: mpsc::UnboundedReceiver<Command<V>>,
    value: Arc<watch::Sender<V>>,
    issued: Arc<AtomicU64>,
    handled: u64,
    states: watch::Sender<Vec<ReplicaState>>,
    status: watch::Sender<Status>,
    tunables: Arc<RwLock<Tunables<V>>>,
    recent: Arc<Mutex<RecentValues<V>>>,
    replicas: Vec<Replica>,
    state: State<V>,
    in_flight: Option<InFlight<V>>,
    registry: TargetRegistry,
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: Option<mpsc::Receiver<String>>,
    settled: Vec<Waiter>,
    next_poll: Option<Instant>,
    saved: Option<String>,
    registration: Option<Registration>,
}

async fn next_completion<V>(slot: &mut Option<InFlight<V>>) -> Completed<V> {
    match slot {
        Some(operation) => (&mut operation.future).await,
        None => future::pending().await,
    }
}

async fn next_message(receiver: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => future::pending().await,
    }
}

/// Post messages in order from a dedicated task so a slow channel never
/// stalls the driver.
fn forward(channel: Arc<dyn Channel>) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(error) = channel.post(text).await {
                tracing::warn!(%error, "broadcast failed");
            }
        }
    });
    tx
}

async fn poll_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

/// Push the final value to the replicas a runner selected.
async fn complete<V: Value>(
    phase: Phase,
    ctx: RunContext<V>,
    current: V,
    diff: BoxFuture<'static, Diff<V>>,
) -> Completed<V> {
    let mut diff = diff.await;
    let report = if diff.writes.is_empty() {
        WriteReport::default()
    } else {
        let value = diff.value.clone().unwrap_or(current);
        ctx.recent.lock().push(value.clone());
        apply_writes(&ctx, &value, &mut diff.replicas, &diff.writes).await
    };
    Completed {
        phase,
        diff,
        report,
    }
}

impl<V: Value> Driver<V> {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                completed = next_completion(&mut self.in_flight) => Event::Completed(completed),
                command = self.commands.recv() => Event::Command(command),
                message = next_message(&mut self.inbound) => Event::Message(message),
                _ = poll_due(self.next_poll) => Event::PollDue,
            };

            let shutdown = match &event {
                Event::Completed(_) | Event::Message(Some(_)) => self.absorb_commands(),
                _ => None,
            };
            if let Some(done) = shutdown {
                self.stop();
                let _ = done.send(());
                return;
            }

            match event {
                Event::Completed(completed) => self.finish(completed),
                Event::Command(Some(Command::Shutdown(done))) => {
                    self.stop();
                    let _ = done.send(());
                    return;
                }
                Event::Command(Some(command)) => self.handle(command),
                Event::Command(None) => {
                    self.stop();
                    return;
                }
                Event::Message(Some(text)) => self.receive(&text),
                Event::Message(None) => self.inbound = None,
                Event::PollDue => self.on_poll_timer(),
            }
            self.advance();
        }
    }

    /// Handle commands queued before a completion or message is applied, so a
    /// `set_value` that has returned counts as a pending write. Returns the
    /// shutdown acknowledgement if one was queued.
    fn absorb_commands(&mut self) -> Option<oneshot::Sender<()>> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Shutdown(done) => return Some(done),
                command => self.handle(command),
            }
        }
        None
    }

    fn handle(&mut self, command: Command<V>) {
        match command {
            Command::Write(value) => {
                self.handled += 1;
                self.recent.lock().push(value.clone());
                self.broadcast(BroadcastMessage::Value {
                    value: value.clone(),
                });
                self.state.enqueue(Request::Write(value));
            }
            Command::Add(replicas, waiter) => {
                self.state.enqueue(Request::Add(replicas, Some(waiter)));
            }
            Command::Remove(replicas, waiter) => {
                self.state.enqueue(Request::Remove(replicas, Some(waiter)));
            }
            Command::Poll(waiter) => self.state.enqueue(Request::Poll(Some(waiter))),
            Command::Settled(waiter) => self.settled.push(waiter),
            Command::Retune => self.retune(),
            Command::Shutdown(_) => {}
        }
    }

    fn receive(&mut self, text: &str) {
        match BroadcastMessage::<V>::decode(text) {
            Ok(BroadcastMessage::Value { value }) => {
                if self.state.has_pending_write() {
                    tracing::debug!("ignoring broadcast value; local write pending");
                    return;
                }
                self.recent.lock().push(value.clone());
                self.update_value(value);
            }
            Ok(BroadcastMessage::UpdateSyncs { syncs }) => {
                match self.registry.deserialise_replicas(&syncs) {
                    Ok(replicas) => self.state.enqueue(Request::UpdateReplicas(replicas)),
                    Err(error) => tracing::warn!(%error, "dropping unreadable replica set"),
                }
            }
            Err(error) => tracing::warn!(%error, "dropping undecodable broadcast"),
        }
    }

    /// Start the next queued operation when idle; resolve `settled` waiters
    /// once nothing is left.
    fn advance(&mut self) {
        if self.in_flight.is_none() {
            match self.state.next_operation() {
                Some(operation) => self.launch(operation),
                None => {
                    for waiter in self.settled.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
        }
        let status = self.state.status();
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn launch(&mut self, operation: Operation<V>) {
        let phase = operation.phase();
        let tunables = self.tunables.read().clone();
        let ctx = tunables.context(&self.recent);
        let current = self.value.borrow().clone();
        let replicas = self.replicas.clone();
        tracing::debug!(?phase, replicas = replicas.len(), "starting operation");

        let (waiters, diff): (Vec<Waiter>, BoxFuture<'static, Diff<V>>) = match operation {
            Operation::Initialise(startup) => {
                let policy = tunables.startup_policy.clone();
                let value = current.clone();
                (
                    Vec::new(),
                    async move { startup.finish(policy.as_ref(), &value, replicas).await }.boxed(),
                )
            }
            Operation::UpdateReplicas(set) => (Vec::new(), future::ready(run_update(set)).boxed()),
            Operation::Remove(removed, waiters) => (
                waiters,
                future::ready(run_removal(replicas, &removed)).boxed(),
            ),
            Operation::Add(added, waiters) => {
                let ctx = ctx.clone();
                let value = current.clone();
                (
                    waiters,
                    async move { run_addition(&ctx, &value, replicas, added).await }.boxed(),
                )
            }
            Operation::Write(requested) => (
                Vec::new(),
                future::ready(run_write(&current, replicas, Some(requested))).boxed(),
            ),
            Operation::Poll(waiters) => {
                let ctx = ctx.clone();
                let value = current.clone();
                (
                    waiters,
                    async move { run_poll(&ctx, &value, replicas).await }.boxed(),
                )
            }
        };

        self.in_flight = Some(InFlight {
            waiters,
            future: complete(phase, ctx, current, diff).boxed(),
        });
    }

    fn finish(&mut self, completed: Completed<V>) {
        let waiters = self
            .in_flight
            .take()
            .map(|operation| operation.waiters)
            .unwrap_or_default();
        let Completed {
            phase,
            diff,
            report,
        } = completed;
        tracing::debug!(
            ?phase,
            written = report.written,
            failed = report.failed,
            "operation complete"
        );

        let before = self.replicas.len();
        self.replicas = diff.replicas;

        if let Some(value) = diff.value {
            if self.state.has_pending_write() {
                tracing::debug!(?phase, "discarding reconciled value; local write pending");
            } else {
                self.update_value(value);
            }
        }

        let membership_changed = self.replicas.len() != before;
        if membership_changed && matches!(phase, Phase::AddingReplicas | Phase::RemovingReplicas) {
            match serialise_replicas(&self.replicas) {
                Ok(syncs) => self.broadcast(BroadcastMessage::UpdateSyncs { syncs }),
                Err(error) => tracing::warn!(%error, "could not serialise replica set"),
            }
        }
        self.publish_replicas();

        if matches!(phase, Phase::Initialising | Phase::Polling) {
            self.schedule_poll();
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Apply a value that did not come from a local `set_value`. Skipped
    /// while a local write is on its way to the driver.
    fn update_value(&mut self, value: V) {
        let handled = self.handled;
        let issued = &self.issued;
        let applied = self.value.send_if_modified(|current| {
            if issued.load(Ordering::SeqCst) != handled || *current == value {
                return false;
            }
            *current = value.clone();
            true
        });
        if !applied {
            return;
        }
        let hook = self.tunables.read().hooks.on_value_update.clone();
        if let Some(hook) = hook {
            hook(&value);
        }
    }

    fn publish_replicas(&mut self) {
        let states: Vec<ReplicaState> = self.replicas.iter().map(Replica::state).collect();
        let hooks = self.tunables.read().hooks.clone();

        let changed = self.states.send_if_modified(|current| {
            if *current == states {
                return false;
            }
            *current = states.clone();
            true
        });
        if changed {
            if let Some(hook) = &hooks.on_replicas_update {
                hook(&states);
            }
        }

        if let Some(save) = &hooks.save_replicas {
            match serialise_replicas(&self.replicas) {
                Ok(config) if self.saved.as_ref() != Some(&config) => {
                    save(&config);
                    self.saved = Some(config);
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "could not serialise replica set"),
            }
        }
    }

    fn broadcast(&self, message: BroadcastMessage<V>) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        match message.encode() {
            Ok(text) => {
                let _ = outbound.send(text);
            }
            Err(error) => tracing::warn!(%error, "could not encode broadcast"),
        }
    }

    fn schedule_poll(&mut self) {
        let delay = self.tunables.read().next_poll_in();
        self.next_poll = Some(Instant::now() + delay);
    }

    fn on_poll_timer(&mut self) {
        self.next_poll = None;
        if self.state.poll_scheduled() {
            return;
        }
        let period = self.tunables.read().poll_period;
        match period {
            Some(_) => self.state.enqueue(Request::Poll(None)),
            None => self.schedule_poll(),
        }
    }

    fn retune(&mut self) {
        let tunables = self.tunables.read().clone();
        self.recent
            .lock()
            .set_bounds(tunables.recent_values_len, tunables.recent_values_age);
        if self.next_poll.is_some() {
            self.next_poll = Some(Instant::now() + tunables.next_poll_in());
        }
    }

    fn stop(&mut self) {
        tracing::debug!(status = %self.state.status(), "manager stopping");
        self.commands.close();
        self.in_flight = None;
        self.inbound = None;
        self.registration = None;
    }
}
