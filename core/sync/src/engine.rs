//! Persistence session: ties the state container to a local snapshot and
//! a remote backend.
//!
//! One task owns the pending tree, the remote mirror and the session state.
//! Local changes, remote loads and deltas, flush results and caller
//! commands all arrive on a single channel, so they are processed one at a
//! time in arrival order. Only the remote write and the remote load run as
//! separate tasks.

use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use treesync_common::tree::merge_into;
use treesync_common::{Error, Marker, Result, StatePath, MARKER_KEY};
use treesync_state::{Change, ChangeKind, Origin, StateStore, Subscription};
use treesync_storage::{Delta, LocalStore, PersistenceRegistry, RemoteBackend, WriteAck, WriteBatch};

use crate::batch::{construct_batch, Batch, BatchContext, UnitRef};
use crate::config::{PersistConfig, RemoteConfig};
use crate::debounce::{self, Debounce};
use crate::latch::{latch, Latch, LatchSetter};
use crate::merge::{merge_change, merge_snapshot};
use crate::mirror::Mirror;
use crate::modified::{enclosing_unit, touched_units};
use crate::pending::PendingTree;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::snapshot;
use crate::spec::{FieldTransform, ModifiedSpec};
use crate::state::{SaveState, SessionState};

/// Result of an explicit flush.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Idle,
    /// The backend committed the batch.
    Acknowledged { writes: usize, timestamp: i64 },
    /// The write failed; its entries stay pending for the next cycle.
    Retained { reason: String },
}

enum Command {
    Settle(oneshot::Sender<Result<()>>),
    Flush(oneshot::Sender<FlushOutcome>),
    PendingBatch(oneshot::Sender<Result<WriteBatch>>),
    Status(oneshot::Sender<SessionState>),
    Shutdown(oneshot::Sender<()>),
}

enum Event {
    Changed(Change),
    RemoteLoaded { root: StatePath, snapshot: Value },
    Delta(Delta),
    FlushDone(Result<WriteAck>),
    Command(Command),
}

/// Builder for a persistence session over one state container.
pub struct SyncEngine {
    state: Arc<dyn StateStore>,
    config: PersistConfig,
    local: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteBackend>>,
}

impl SyncEngine {
    pub fn new(state: Arc<dyn StateStore>, config: PersistConfig) -> Self {
        Self {
            state,
            config,
            local: None,
            remote: None,
        }
    }

    pub fn with_local(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local = Some(store);
        self
    }

    pub fn with_remote(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    /// Resolve the configured store and backend through `registry`.
    ///
    /// # Errors
    /// - `NotFound` for names the registry does not know
    /// - Factory errors for malformed store or backend configuration
    pub fn from_registry(
        state: Arc<dyn StateStore>,
        config: PersistConfig,
        registry: &PersistenceRegistry,
    ) -> Result<Self> {
        let local = match &config.local {
            Some(local) => Some(registry.local(&local.store, &local.store_config)?),
            None => None,
        };
        let remote = match &config.remote {
            Some(remote) => Some(registry.remote(&remote.backend, &remote.backend_config)?),
            None => None,
        };
        Ok(Self {
            state,
            config,
            local,
            remote,
        })
    }

    /// Restore the local snapshot, then start syncing.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// - `InvalidInput` if a configured side has no store or backend
    pub async fn start(self) -> Result<PersistHandle> {
        let local = match (self.config.local, self.local) {
            (Some(config), Some(store)) => Some((store, config.key)),
            (Some(config), None) => {
                return Err(Error::InvalidInput(format!(
                    "No local store for key {}",
                    config.key
                )))
            }
            (None, _) => None,
        };
        let remote = match (self.config.remote, self.remote) {
            (Some(config), Some(backend)) => Some((backend, config)),
            (Some(config), None) => {
                return Err(Error::InvalidInput(format!(
                    "No remote backend for {}",
                    config.sync_path
                )))
            }
            (None, _) => None,
        };

        let (local_setter, loaded_local) = latch();
        let (remote_setter, loaded_remote) = latch();
        let mut status = SessionState::new();

        let mut local_error = None;
        let mut unsent = Vec::new();
        if let Some((store, key)) = &local {
            match restore_local(self.state.as_ref(), store.as_ref(), key).await {
                Ok(pending) => unsent = pending,
                Err(e) => {
                    error!("Failed to restore local snapshot {}: {}", key, e);
                    local_error = Some(e.to_string());
                }
            }
        }
        status.loaded_local = true;
        local_setter.set();

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingTree::new()));
        let tracker = remote.as_ref().map(|(_, config)| LocalTracker {
            state: Arc::downgrade(&self.state),
            modified: config.query_by_modified.clone(),
            pending: pending.clone(),
        });
        let forward = tx.clone();
        let subscription = self.state.on_change(
            &StatePath::root(),
            Arc::new(move |change: &Change| {
                if change.origin != Origin::Local {
                    return;
                }
                // Recorded before returning to the writer, so a merge handled
                // ahead of the queued event already sees this write.
                if let Some(tracker) = &tracker {
                    tracker.record(change);
                }
                let _ = forward.send(Event::Changed(change.clone()));
            }),
        );

        let mut remote_task = None;
        let remote_side = remote.map(|(backend, config)| {
            remote_task = Some(tokio::spawn(run_remote(
                backend.clone(),
                config.clone(),
                tx.clone(),
            )));
            RemoteSide::new(backend, &config, pending)
        });

        let mut session = Session {
            state: self.state,
            local,
            local_dirty: false,
            local_error,
            remote: remote_side,
            status,
            loaded_remote: remote_setter,
            tx: tx.clone(),
            remote_task,
            _subscription: subscription,
        };
        session.requeue(unsent);
        tokio::spawn(session.run(rx));

        Ok(PersistHandle {
            tx,
            loaded_local,
            loaded_remote,
        })
    }
}

/// Caller side of a running persistence session.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<Event>,
    loaded_local: Latch,
    loaded_remote: Latch,
}

impl PersistHandle {
    /// Set once the local snapshot has been restored.
    pub fn loaded_local(&self) -> &Latch {
        &self.loaded_local
    }

    /// Set once the first remote snapshot has been merged.
    pub fn loaded_remote(&self) -> &Latch {
        &self.loaded_remote
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Command(command(reply)))
            .map_err(|_| Error::EngineStopped("Persistence session not running".to_string()))?;
        rx.await
            .map_err(|_| Error::EngineStopped("Persistence session stopped".to_string()))
    }

    /// Wait until every change made before this call is processed and the
    /// local snapshot is written.
    ///
    /// # Errors
    /// - `LocalStore` if the most recent snapshot write failed
    pub async fn settle(&self) -> Result<()> {
        self.request(Command::Settle).await?
    }

    /// Write everything pending now and wait for the outcome.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.request(Command::Flush).await
    }

    /// The remote write the current pending entries would produce.
    ///
    /// # Errors
    /// - `Unauthenticated` before the sync root is known
    /// - `NotFound` without a remote
    pub async fn pending_batch(&self) -> Result<WriteBatch> {
        self.request(Command::PendingBatch).await?
    }

    pub async fn status(&self) -> Result<SessionState> {
        self.request(Command::Status).await
    }

    /// Stop the session and unsubscribe from the state container.
    ///
    /// An in-flight remote write is not cancelled.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

/// Read the local snapshot into `state`.
///
/// Returns the units whose writes never reached the remote.
async fn restore_local(
    state: &dyn StateStore,
    store: &dyn LocalStore,
    key: &str,
) -> Result<Vec<StatePath>> {
    let Some(bytes) = store.read(key).await? else {
        debug!("No local snapshot under {}", key);
        return Ok(Vec::new());
    };
    let (tree, markers) = snapshot::decode(&bytes)?;

    let root = StatePath::root();
    let mut merged = state.get(&root).unwrap_or(Value::Null);
    merge_into(&mut merged, tree);
    state.set(&root, merged, Origin::Persist);

    let mut unsent = Vec::new();
    for (path, marker) in &markers {
        state.set_modified(path, Some(*marker));
        if marker.is_pending() {
            unsent.push(path.clone());
        }
    }
    info!(
        "Restored local snapshot {} ({} markers, {} unsent)",
        key,
        markers.len(),
        unsent.len()
    );
    Ok(unsent)
}

/// Keep the remote side connected: authenticate, resolve the sync root,
/// subscribe, load, then forward deltas. Reconnects after failures.
async fn run_remote(
    backend: Arc<dyn RemoteBackend>,
    config: RemoteConfig,
    tx: mpsc::UnboundedSender<Event>,
) {
    let retry = RetryExecutor::new(RetryConfig::new(config.max_retries));
    loop {
        match connect(&backend, &config, &retry, &tx).await {
            Ok(()) => {
                debug!("Remote subscription on {} closed", backend.name());
                return;
            }
            Err(e) => {
                let delay = retry.config().max_delay;
                warn!("Remote sync failed: {}. Reconnecting in {:?}", e, delay);
                tokio::time::sleep(delay).await;
            }
        }
        if tx.is_closed() {
            return;
        }
    }
}

async fn connect(
    backend: &Arc<dyn RemoteBackend>,
    config: &RemoteConfig,
    retry: &RetryExecutor,
    tx: &mpsc::UnboundedSender<Event>,
) -> Result<()> {
    let uid = if config.needs_auth() {
        debug!("Waiting for an authenticated session on {}", backend.name());
        Some(backend.wait_for_auth().await?.uid)
    } else {
        None
    };
    let root = config.resolve_sync_path(uid.as_deref())?;

    let mut deltas = backend.subscribe(&root).await?;
    let snapshot = retry
        .execute("Remote snapshot load", || {
            let backend = backend.clone();
            let root = root.clone();
            async move { backend.load_snapshot(&root).await }
        })
        .await?;

    if tx.send(Event::RemoteLoaded { root, snapshot }).is_err() {
        return Ok(());
    }
    while let Some(delta) = deltas.next().await {
        if tx.send(Event::Delta(delta)).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Records local writes into the pending tree from the change callback.
struct LocalTracker {
    state: Weak<dyn StateStore>,
    modified: ModifiedSpec,
    pending: Arc<Mutex<PendingTree>>,
}

impl LocalTracker {
    fn record(&self, change: &Change) {
        let Some(state) = self.state.upgrade() else {
            return;
        };

        let units = match (&change.kind, &change.value) {
            (ChangeKind::Assign, Value::Object(fields)) => {
                let units = fields
                    .iter()
                    .flat_map(|(key, value)| {
                        touched_units(&self.modified, &change.path.child(key), value)
                    })
                    .collect::<Vec<_>>();
                lock(&self.pending).assign(&change.path, fields.clone());
                units
            }
            (_, value) => {
                if value.is_null() && enclosing_unit(&self.modified, &change.path).is_none() {
                    for stale in state.modified_under(&change.path).into_keys() {
                        state.set_modified(&stale, None);
                    }
                }
                lock(&self.pending).set(&change.path, value.clone());
                touched_units(&self.modified, &change.path, value)
            }
        };

        for unit in &units {
            state.set_modified(unit, Some(Marker::Pending));
        }
    }
}

fn lock(pending: &Mutex<PendingTree>) -> MutexGuard<'_, PendingTree> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

struct InFlight {
    taken: PendingTree,
    batch: Batch,
    waiters: Vec<oneshot::Sender<FlushOutcome>>,
}

struct RemoteSide {
    backend: Arc<dyn RemoteBackend>,
    modified: ModifiedSpec,
    transform: FieldTransform,
    root: Option<StatePath>,
    mirror: Mirror,
    /// Shared with the change callback.
    pending: Arc<Mutex<PendingTree>>,
    in_flight: Option<InFlight>,
    debounce: Debounce,
    retry: RetryConfig,
    flush_waiters: Vec<oneshot::Sender<FlushOutcome>>,
}

impl RemoteSide {
    fn new(
        backend: Arc<dyn RemoteBackend>,
        config: &RemoteConfig,
        pending: Arc<Mutex<PendingTree>>,
    ) -> Self {
        Self {
            backend,
            modified: config.query_by_modified.clone(),
            transform: config.transform(),
            root: None,
            mirror: Mirror::new(),
            pending,
            in_flight: None,
            debounce: Debounce::new(config.save_timeout()),
            retry: RetryConfig::new(config.max_retries),
            flush_waiters: Vec::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingTree> {
        lock(&self.pending)
    }

    fn context(&self) -> BatchContext<'_> {
        BatchContext {
            modified: &self.modified,
            transform: &self.transform,
            mirror: self.mirror.is_loaded().then(|| self.mirror.root()),
        }
    }

    /// Whether local writes to `path` are pending or in flight.
    fn guards(&self, path: &StatePath) -> bool {
        self.pending().touches(path)
            || self
                .in_flight
                .as_ref()
                .is_some_and(|flight| flight.taken.touches(path))
    }

    /// Marker the remote holds for a unit, read off the mirror.
    fn mirror_marker(&self, unit: &UnitRef) -> Option<Marker> {
        self.mirror
            .get(&unit.remote)
            .and_then(|value| value.get(MARKER_KEY))
            .and_then(Marker::from_value)
    }
}

struct Session {
    state: Arc<dyn StateStore>,
    local: Option<(Arc<dyn LocalStore>, String)>,
    local_dirty: bool,
    local_error: Option<String>,
    remote: Option<RemoteSide>,
    status: SessionState,
    loaded_remote: LatchSetter,
    tx: mpsc::UnboundedSender<Event>,
    remote_task: Option<JoinHandle<()>>,
    _subscription: Subscription,
}

impl Session {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!("Persistence session started");
        let mut shutdown = None;

        loop {
            let deadline = self.flush_deadline();
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Event::Command(Command::Shutdown(reply))) => {
                        shutdown = Some(reply);
                        break;
                    }
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = debounce::sleep_until(deadline) => self.start_flush(),
            }

            if self.local_dirty && rx.is_empty() {
                self.persist_local().await;
            }
        }

        if self.local_dirty {
            self.persist_local().await;
        }
        if let Some(task) = self.remote_task.take() {
            task.abort();
        }
        drop(self);
        info!("Persistence session stopped");
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Changed(change) => self.on_local_change(change),
            Event::RemoteLoaded { root, snapshot } => self.on_remote_loaded(root, snapshot),
            Event::Delta(delta) => self.on_delta(delta),
            Event::FlushDone(result) => self.on_flush_done(result),
            Event::Command(command) => self.on_command(command).await,
        }
    }

    /// When the debounce may fire: something pending, nothing in flight,
    /// and the sync root known.
    fn flush_deadline(&self) -> Option<tokio::time::Instant> {
        let remote = self.remote.as_ref()?;
        if remote.in_flight.is_some() || remote.root.is_none() || remote.pending().is_empty() {
            return None;
        }
        remote.debounce.deadline()
    }

    /// Queue writes for units restored with an unacknowledged marker.
    fn requeue(&mut self, units: Vec<StatePath>) {
        let Some(remote) = &mut self.remote else {
            return;
        };
        if units.is_empty() {
            return;
        }
        {
            let mut pending = remote.pending();
            for unit in &units {
                let value = self.state.get(unit).unwrap_or(Value::Null);
                pending.set(unit, value);
            }
        }
        info!("Re-queued {} unsent units from the local snapshot", units.len());
        remote.debounce.touch();
        self.status.mark_dirty();
    }

    /// The write itself was recorded by the change callback; this only
    /// schedules the flush and the local snapshot.
    fn on_local_change(&mut self, change: Change) {
        self.local_dirty = true;
        let Some(remote) = &mut self.remote else {
            return;
        };
        debug!("Local change at {}", change.path);
        remote.debounce.touch();
        self.status.mark_dirty();
    }

    fn on_remote_loaded(&mut self, root: StatePath, snapshot: Value) {
        let Some(remote) = &mut self.remote else {
            return;
        };
        remote.mirror.load(snapshot.clone());
        remote.root = Some(root.clone());

        let guard = |path: &StatePath| remote.guards(path);
        let changes = merge_snapshot(
            self.state.as_ref(),
            &remote.modified,
            &remote.transform,
            snapshot,
            &guard,
        );
        info!("Remote snapshot loaded from {} ({} changes)", root, changes);

        if changes > 0 {
            self.local_dirty = true;
        }
        self.status.loaded_remote = true;
        self.loaded_remote.set();
    }

    fn on_delta(&mut self, delta: Delta) {
        let Some(remote) = &mut self.remote else {
            return;
        };
        remote.mirror.apply_delta(&delta);

        let guard = |path: &StatePath| remote.guards(path);
        let changes = merge_change(
            self.state.as_ref(),
            &remote.modified,
            &remote.transform,
            &remote.mirror,
            &delta.path,
            &guard,
        );
        debug!("Remote change at {} ({} changes)", delta.path, changes);
        if changes > 0 {
            self.local_dirty = true;
        }
    }

    fn start_flush(&mut self) {
        let Some(remote) = &mut self.remote else {
            return;
        };
        let Some(root) = remote.root.clone() else {
            return;
        };
        remote.debounce.clear();

        let taken = remote.pending().take();
        let batch = construct_batch(&taken, &remote.context());
        let waiters = std::mem::take(&mut remote.flush_waiters);

        if batch.is_empty() {
            debug!("Pending writes match the remote; nothing to flush");
            for unit in &batch.unchanged {
                let marker = remote.mirror_marker(unit);
                if self.state.get_modified(&unit.local) == Some(Marker::Pending) {
                    self.state.set_modified(&unit.local, marker);
                }
            }
            self.local_dirty = true;
            self.status.save_state = SaveState::Idle;
            for waiter in waiters {
                let _ = waiter.send(FlushOutcome::Idle);
            }
            return;
        }

        let write = batch.to_write_batch(&root);
        info!("Flushing {} remote writes under {}", write.len(), root);
        self.status.mark_flushing();

        let backend = remote.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = backend.write_batch(write).await;
            let _ = tx.send(Event::FlushDone(result));
        });
        remote.in_flight = Some(InFlight {
            taken,
            batch,
            waiters,
        });
    }

    fn on_flush_done(&mut self, result: Result<WriteAck>) {
        let Some(remote) = &mut self.remote else {
            return;
        };
        let Some(flight) = remote.in_flight.take() else {
            warn!("Flush result without a write in flight");
            return;
        };

        let outcome = match result {
            Ok(ack) => {
                remote.mirror.apply_writes(&flight.batch.writes, ack.timestamp);

                for unit in &flight.batch.units {
                    if !remote.pending().touches(&unit.local)
                        && self.state.get_modified(&unit.local) == Some(Marker::Pending)
                    {
                        self.state
                            .set_modified(&unit.local, Some(Marker::At(ack.timestamp)));
                    }
                }
                for unit in &flight.batch.unchanged {
                    if !remote.pending().touches(&unit.local)
                        && self.state.get_modified(&unit.local) == Some(Marker::Pending)
                    {
                        self.state.set_modified(&unit.local, remote.mirror_marker(unit));
                    }
                }

                info!(
                    "Remote write acknowledged at {} ({} writes)",
                    ack.timestamp,
                    flight.batch.writes.len()
                );
                let still_pending = !remote.pending().is_empty();
                self.status.mark_flushed(still_pending);
                self.local_dirty = true;
                FlushOutcome::Acknowledged {
                    writes: flight.batch.writes.len(),
                    timestamp: ack.timestamp,
                }
            }
            Err(e) => {
                remote.pending().restore(flight.taken);
                self.status.mark_failed(e.to_string());

                let delay = remote
                    .retry
                    .delay_for_attempt(self.status.failure_count.saturating_sub(1));
                warn!(
                    "Remote write failed ({} in a row): {}. Retrying in {:?}",
                    self.status.failure_count, e, delay
                );
                remote.debounce.schedule_in(delay);
                FlushOutcome::Retained {
                    reason: e.to_string(),
                }
            }
        };

        for waiter in flight.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Settle(reply) => {
                if self.local_dirty {
                    self.persist_local().await;
                }
                let result = match &self.local_error {
                    Some(e) => Err(Error::LocalStore(e.clone())),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Flush(reply) => {
                let Some(remote) = &mut self.remote else {
                    let _ = reply.send(FlushOutcome::Idle);
                    return;
                };
                let idle = remote.pending().is_empty();
                if idle {
                    match &mut remote.in_flight {
                        Some(flight) => flight.waiters.push(reply),
                        None => {
                            let _ = reply.send(FlushOutcome::Idle);
                        }
                    }
                } else if remote.root.is_none() {
                    let _ = reply.send(FlushOutcome::Retained {
                        reason: "Remote sync root not resolved yet".to_string(),
                    });
                } else {
                    remote.flush_waiters.push(reply);
                    remote.debounce.fire_now();
                }
            }
            Command::PendingBatch(reply) => {
                let result = match &self.remote {
                    None => Err(Error::NotFound("No remote configured".to_string())),
                    Some(remote) => match &remote.root {
                        None => Err(Error::Unauthenticated(
                            "Remote sync root not resolved yet".to_string(),
                        )),
                        Some(root) => Ok(construct_batch(&remote.pending(), &remote.context())
                            .to_write_batch(root)),
                    },
                };
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let mut status = self.status.clone();
                status.pending_entries = self.remote.as_ref().map_or(0, |r| r.pending().len());
                let _ = reply.send(status);
            }
            Command::Shutdown(reply) => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn persist_local(&mut self) {
        self.local_dirty = false;
        let Some((store, key)) = &self.local else {
            return;
        };

        let root = StatePath::root();
        let tree = self.state.get(&root).unwrap_or(Value::Null);
        let markers = self.state.modified_under(&root);
        let result = match snapshot::encode(&tree, &markers) {
            Ok(bytes) => store.write(key, bytes).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!("Local snapshot {} written", key);
                self.local_error = None;
            }
            Err(e) => {
                error!("Failed to write local snapshot {}: {}", key, e);
                self.local_error = Some(e.to_string());
            }
        }
    }
}
