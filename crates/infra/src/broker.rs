//! Event lifecycle orchestration: fire, commit, replay.
//!
//! The `Broker` composes the collaborator traits (state registry, event log, lock
//! provider, guards, dispatcher) into the three entry points of the pipeline.
//!
//! ## Fire
//!
//! ```text
//! event
//!   ↓
//! 1. Load target states (registry)
//!   ↓
//! 2. Guards: once per target state, then once globally (no mutation yet)
//!   ↓
//! 3. Apply to every target state (in memory)
//!   ↓
//! 4. Enqueue, then `Dispatcher::fired`
//!   ↓
//! 5. Commit now if the broker or the event asks for it
//! ```
//!
//! ## Commit
//!
//! ```text
//! loop {
//!   1. Lock every loaded state key (all or nothing, key order)
//!   2. Drain the queue (empty → done; a key loaded meanwhile → requeue, relock)
//!   3. Initialize metadata, append to the log, write snapshots
//!   4. Release the locks (failure → requeue batch, return error)
//!   5. Handle each event, record its results, fire follow-ups
//! }
//! ```
//!
//! Follow-ups rejected by their guards are collected and reported after the loop;
//! they never undo or hide the commit that produced them.
//!
//! ## Replay
//!
//! Resets the registry (storage included), then re-applies every logged event without
//! guards, queueing, or commits. `fire` is a no-op while a replay is running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use eventline_core::StateHandle;
use eventline_events::{
    Dispatcher, Event, EventQueue, Followups, GuardChecker, GuardTarget, GuardViolation, Guards,
    Metadata, MetadataError, MetadataManager,
};

use crate::config::BrokerConfig;
use crate::event_log::{EventLog, EventLogError, LoggedEvent};
use crate::lock::{LockError, LockProvider, LockSet};
use crate::snapshot_store::SnapshotError;
use crate::state_registry::{StateRegistry, StateRegistryError};

/// A commit could not obtain its locks or could not write durably.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// Another holder has the lock; nothing was acquired.
    #[error("lock `{name}` is held elsewhere")]
    LockUnavailable { name: String },

    /// The lock backend failed; nothing was acquired.
    #[error("lock backend failed while acquiring `{name}`: {source}")]
    LockBackend {
        name: String,
        #[source]
        source: LockError,
    },

    /// The event log rejected the batch; the batch was requeued.
    #[error("event log append failed: {0}")]
    LogAppend(#[source] EventLogError),

    /// The snapshot batch was rejected; the batch was requeued.
    #[error("snapshot write failed: {0}")]
    SnapshotWrite(#[source] SnapshotError),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Guard(#[from] GuardViolation),

    #[error("commit failed: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    State(#[from] StateRegistryError),

    #[error("event log read failed: {0}")]
    Log(#[from] EventLogError),

    /// Everything drained was committed, but some follow-up events failed their
    /// guards and were never queued. The follow-ups that passed were committed.
    #[error(
        "{committed} events committed, {} follow-up events rejected by guards",
        .rejected.len()
    )]
    FollowupsRejected {
        committed: usize,
        rejected: Vec<GuardViolation>,
    },
}

impl BrokerError {
    /// Whether the commit that returned this error still made its batches durable.
    pub fn is_committed(&self) -> bool {
        matches!(self, BrokerError::FollowupsRejected { .. })
    }
}

/// Orchestrates fire → commit → handle, and replay.
///
/// `Broker` is `Sync`: `fire` and `commit` may be called from many threads at once.
/// Commits in different processes are kept apart by the per-state locks.
pub struct Broker<E, D, R, L, P, G = Guards<E>>
where
    E: Event,
{
    dispatcher: D,
    registry: R,
    log: L,
    locks: P,
    guards: G,
    metadata: Arc<MetadataManager<E>>,
    queue: EventQueue<E>,
    config: BrokerConfig,
    commit_immediately: AtomicBool,
    replaying: AtomicBool,
}

impl<E, D, R, L, P> Broker<E, D, R, L, P>
where
    E: Event,
{
    /// A broker with no registered guards (events still run their own `validate`).
    pub fn new(dispatcher: D, registry: R, log: L, locks: P) -> Self {
        Self {
            dispatcher,
            registry,
            log,
            locks,
            guards: Guards::new(),
            metadata: Arc::new(MetadataManager::new()),
            queue: EventQueue::new(),
            config: BrokerConfig::default(),
            commit_immediately: AtomicBool::new(false),
            replaying: AtomicBool::new(false),
        }
    }
}

impl<E, D, R, L, P, G> Broker<E, D, R, L, P, G>
where
    E: Event,
{
    pub fn with_guards<G2>(self, guards: G2) -> Broker<E, D, R, L, P, G2> {
        Broker {
            dispatcher: self.dispatcher,
            registry: self.registry,
            log: self.log,
            locks: self.locks,
            guards,
            metadata: self.metadata,
            queue: self.queue,
            config: self.config,
            commit_immediately: self.commit_immediately,
            replaying: self.replaying,
        }
    }

    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.commit_immediately = AtomicBool::new(config.commit_immediately);
        self.config = config;
        self
    }

    /// Share a metadata manager (and its factories) with other components.
    pub fn with_metadata(mut self, metadata: Arc<MetadataManager<E>>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Toggle committing after every `fire`.
    pub fn commit_immediately(&self, commit_immediately: bool) {
        self.commit_immediately
            .store(commit_immediately, Ordering::Release);
    }

    pub fn commits_immediately(&self) -> bool {
        self.commit_immediately.load(Ordering::Acquire)
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    /// Events fired but not committed yet.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn metadata(&self) -> &MetadataManager<E> {
        &self.metadata
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn guards(&self) -> &G {
        &self.guards
    }

    pub fn locks(&self) -> &P {
        &self.locks
    }
}

impl<E, D, R, L, P, G> Broker<E, D, R, L, P, G>
where
    E: Event,
    D: Dispatcher<E>,
    R: StateRegistry<E::State>,
    L: EventLog<E>,
    P: LockProvider,
    G: GuardChecker<E>,
{
    /// Validate, apply, and queue an event.
    ///
    /// Returns `Ok(None)` without doing anything while a replay is running. A guard
    /// failure leaves every state untouched and nothing queued.
    #[instrument(
        skip(self, event),
        fields(event_type = event.event_type(), event_id = %event.event_id()),
        err
    )]
    pub fn fire(&self, event: E) -> Result<Option<Arc<E>>, BrokerError> {
        self.fire_inner(event, true)
    }

    fn fire_inner(&self, event: E, allow_immediate: bool) -> Result<Option<Arc<E>>, BrokerError> {
        if self.is_replaying() {
            debug!(event_type = event.event_type(), "fire ignored during replay");
            return Ok(None);
        }

        let states = self.load_states(&event)?;

        for cell in &states {
            cell.read(|state| {
                self.guards.check(
                    &event,
                    GuardTarget::State {
                        key: cell.key(),
                        state,
                    },
                )
            })?;
        }
        self.guards.check(&event, GuardTarget::Global)?;

        for cell in &states {
            cell.apply(|state| self.dispatcher.apply(&event, state));
        }

        let event = Arc::new(event);
        self.queue.enqueue(event.clone());
        self.dispatcher.fired(&event, &states);

        if allow_immediate && (self.commits_immediately() || event.commits_immediately()) {
            self.commit()?;
        }

        Ok(Some(event))
    }

    /// Durably commit everything queued, then handle it.
    ///
    /// Follow-up events fired by handlers are committed before this returns. On a lock
    /// or write failure the drained batch is back at the head of the queue, so calling
    /// `commit` again retries it.
    ///
    /// A follow-up that fails its guards does not stop the others: every follow-up is
    /// fired, the accepted ones are committed, and the rejections are returned as
    /// [`BrokerError::FollowupsRejected`] once the queue is empty.
    #[instrument(skip(self), err)]
    pub fn commit(&self) -> Result<bool, BrokerError> {
        let mut committed = 0;
        let mut rejected = Vec::new();

        while let Some(batch) = self.commit_batch()? {
            committed += batch.len();

            let mut followups = Followups::new();
            for event in &batch {
                let states = self.load_states(event)?;
                let results = self.dispatcher.handle(event, &states, &mut followups);
                self.metadata.set_last_results(event, results);
            }

            if !followups.is_empty() {
                debug!(count = followups.len(), "firing follow-up events");
            }
            for followup in followups.into_events() {
                match self.fire_inner(followup, false) {
                    Ok(_) => {}
                    Err(BrokerError::Guard(violation)) => {
                        warn!(error = %violation, "follow-up event rejected");
                        rejected.push(violation);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if rejected.is_empty() {
            Ok(true)
        } else {
            Err(BrokerError::FollowupsRejected {
                committed,
                rejected,
            })
        }
    }

    /// One locked drain-and-write round. `None` when the queue was empty.
    ///
    /// A concurrent `fire` can load a new state between taking the locks and draining.
    /// Such a batch is put back and the round starts over with the wider key set, so
    /// every snapshot is written under its lock.
    fn commit_batch(&self) -> Result<Option<Vec<Arc<E>>>, BrokerError> {
        let (locks, batch) = loop {
            let keys = self.registry.loaded();
            let names = keys.iter().map(|key| self.config.lock_name(key));
            let locks = LockSet::acquire(&self.locks, names, self.config.lock_ttl)?;

            let batch = self.queue.drain();
            if batch.is_empty() {
                return Ok(None);
            }

            let grown = self
                .registry
                .loaded()
                .iter()
                .any(|key| keys.binary_search(key).is_err());
            if !grown {
                break (locks, batch);
            }
            debug!(events = batch.len(), "state loaded during drain, relocking");
            self.queue.requeue_front(batch);
        };

        if let Err(err) = self.persist(&batch) {
            warn!(events = batch.len(), error = %err, "commit failed, requeueing batch");
            self.queue.requeue_front(batch);
            return Err(err);
        }

        info!(events = batch.len(), locks = locks.len(), "batch committed");
        drop(locks);
        Ok(Some(batch))
    }

    fn persist(&self, batch: &[Arc<E>]) -> Result<(), BrokerError> {
        let entries = batch
            .iter()
            .map(|event| Ok((event.clone(), self.metadata.initialize(event)?)))
            .collect::<Result<Vec<(Arc<E>, Metadata)>, MetadataError>>()?;

        self.log
            .append(&entries)
            .map_err(ConcurrencyError::LogAppend)?;
        self.registry
            .write_snapshots()
            .map_err(ConcurrencyError::SnapshotWrite)?;
        Ok(())
    }

    /// Rebuild all state from the event log.
    pub fn replay(&self) -> Result<usize, BrokerError> {
        self.replay_with(|_| {}, |_| {})
    }

    /// Rebuild all state from the event log, calling the hooks around each event.
    ///
    /// Guards, `fired`, and `handle` never run during a replay, and nothing is queued
    /// or committed. Returns the number of events replayed.
    #[instrument(skip_all, err)]
    pub fn replay_with(
        &self,
        mut before_each: impl FnMut(&Arc<E>),
        mut after_each: impl FnMut(&Arc<E>),
    ) -> Result<usize, BrokerError> {
        self.replaying.store(true, Ordering::Release);
        let _scope = ReplayScope {
            on_exit: || {
                self.registry.set_replaying(false);
                self.replaying.store(false, Ordering::Release);
            },
        };

        self.registry.reset(true)?;

        let mut replayed = 0;
        for entry in self.log.read()? {
            let LoggedEvent {
                event, metadata, ..
            } = entry?;

            self.registry.set_replaying(true);
            self.metadata.set(&event, metadata);

            before_each(&event);
            let states = self.load_states(&event)?;
            for cell in &states {
                cell.apply(|state| self.dispatcher.apply(&event, state));
            }
            self.dispatcher.replay(&event, &states);
            after_each(&event);

            replayed += 1;
        }

        info!(replayed, "replay finished");
        Ok(replayed)
    }

    fn load_states(&self, event: &E) -> Result<Vec<StateHandle<E::State>>, StateRegistryError> {
        event
            .states()
            .iter()
            .map(|key| self.registry.load(key))
            .collect()
    }
}

impl<E, D, R, L, P, G> core::fmt::Debug for Broker<E, D, R, L, P, G>
where
    E: Event,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("commit_immediately", &self.commits_immediately())
            .field("replaying", &self.is_replaying())
            .finish_non_exhaustive()
    }
}

/// Runs `on_exit` when a replay ends, however it ends.
struct ReplayScope<F: FnMut()> {
    on_exit: F,
}

impl<F: FnMut()> Drop for ReplayScope<F> {
    fn drop(&mut self) {
        (self.on_exit)();
    }
}
