//! Integration tests for the full commit pipeline.
//!
//! Tests: fire → guards → apply → queue → commit (locks, log, snapshots) → handle,
//! and replay from the log.
//!
//! Verifies:
//! - Guard failures leave state and queue untouched
//! - Lock acquisition is all-or-nothing
//! - Failed durable writes requeue the batch and can be retried
//! - Follow-up events are committed by the same `commit` call
//! - A follow-up rejected by its guards is reported without losing the others
//! - Replay rebuilds the same state and restores persistent metadata

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use serde_json::{Value as JsonValue, json};

    use eventline_accounts::{
        Account, AccountDispatcher, AccountEvent, AccountEventKind, account_guards,
    };
    use eventline_core::{DomainError, StateHandle, StateKey};
    use eventline_events::{
        Dispatcher, Event, Followups, GuardChecker, GuardScope, GuardTarget, GuardViolation,
        Guards, Metadata,
    };

    use crate::broker::{Broker, BrokerError, ConcurrencyError};
    use crate::config::BrokerConfig;
    use crate::event_log::{EventLog, EventLogError, EventStream, InMemoryEventLog};
    use crate::lock::{InMemoryLock, InMemoryLockProvider, Lock, LockProvider};
    use crate::snapshot_store::{
        InMemorySnapshotStore, Snapshot, SnapshotError, SnapshotStore, SnapshotWrite,
    };
    use crate::state_registry::{SnapshotStateRegistry, StateRegistry, StateRegistryError};

    /// Dispatcher that records every lifecycle callback it receives.
    struct Recording {
        inner: AccountDispatcher,
        calls: Mutex<Vec<(&'static str, &'static str)>>,
    }

    impl Recording {
        fn new(inner: AccountDispatcher) -> Self {
            Self {
                inner,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, hook: &'static str, event: &AccountEvent) {
            self.calls.lock().unwrap().push((hook, event.event_type()));
        }

        fn count(&self, hook: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| *h == hook)
                .count()
        }

        fn handled_types(&self) -> Vec<&'static str> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| *h == "handle")
                .map(|(_, t)| *t)
                .collect()
        }
    }

    impl Dispatcher<AccountEvent> for Recording {
        fn apply(&self, event: &AccountEvent, state: &mut Account) {
            self.inner.apply(event, state);
        }

        fn fired(&self, event: &AccountEvent, _states: &[StateHandle<Account>]) {
            self.record("fired", event);
        }

        fn handle(
            &self,
            event: &AccountEvent,
            states: &[StateHandle<Account>],
            followups: &mut Followups<AccountEvent>,
        ) -> Vec<JsonValue> {
            self.record("handle", event);
            self.inner.handle(event, states, followups)
        }

        fn replay(&self, event: &AccountEvent, _states: &[StateHandle<Account>]) {
            self.record("replay", event);
        }
    }

    /// Guard checker that counts how often it is consulted.
    struct Counting<G> {
        inner: G,
        checks: AtomicUsize,
    }

    impl<G: GuardChecker<AccountEvent>> GuardChecker<AccountEvent> for Counting<G> {
        fn check(
            &self,
            event: &AccountEvent,
            target: GuardTarget<'_, Account>,
        ) -> Result<(), GuardViolation> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.inner.check(event, target)
        }
    }

    /// Snapshot store whose writes can be made to fail.
    #[derive(Default)]
    struct FlakySnapshots {
        inner: InMemorySnapshotStore,
        fail_writes: AtomicBool,
    }

    impl SnapshotStore for FlakySnapshots {
        fn load(&self, key: &StateKey) -> Result<Option<Snapshot>, SnapshotError> {
            self.inner.load(key)
        }

        fn write_batch(&self, writes: Vec<SnapshotWrite>) -> Result<usize, SnapshotError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SnapshotError::Storage("disk full".into()));
            }
            self.inner.write_batch(writes)
        }

        fn clear(&self) -> Result<(), SnapshotError> {
            self.inner.clear()
        }
    }

    /// Event log whose appends or reads can be made to fail.
    #[derive(Default)]
    struct FlakyLog {
        inner: InMemoryEventLog<AccountEvent>,
        fail_appends: AtomicBool,
        fail_reads: AtomicBool,
    }

    impl EventLog<AccountEvent> for FlakyLog {
        fn append(&self, batch: &[(Arc<AccountEvent>, Metadata)]) -> Result<usize, EventLogError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(EventLogError::Storage("connection refused".into()));
            }
            self.inner.append(batch)
        }

        fn read(&self) -> Result<EventStream<'_, AccountEvent>, EventLogError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(EventLogError::Storage("connection refused".into()));
            }
            self.inner.read()
        }
    }

    type TestBroker<St, L> = Broker<
        AccountEvent,
        Recording,
        SnapshotStateRegistry<Account, St>,
        L,
        InMemoryLockProvider,
        Counting<Guards<AccountEvent>>,
    >;

    fn broker_with<St, L>(store: St, log: L, dispatcher: AccountDispatcher) -> TestBroker<St, L>
    where
        St: SnapshotStore,
        L: EventLog<AccountEvent>,
    {
        Broker::new(
            Recording::new(dispatcher),
            SnapshotStateRegistry::new(store),
            log,
            InMemoryLockProvider::new(),
        )
        .with_guards(Counting {
            inner: account_guards(),
            checks: AtomicUsize::new(0),
        })
    }

    struct Fixture {
        broker: TestBroker<Arc<InMemorySnapshotStore>, Arc<InMemoryEventLog<AccountEvent>>>,
        store: Arc<InMemorySnapshotStore>,
        log: Arc<InMemoryEventLog<AccountEvent>>,
    }

    fn fixture_with(dispatcher: AccountDispatcher) -> Fixture {
        eventline_observability::init();
        let store = Arc::new(InMemorySnapshotStore::new());
        let log = Arc::new(InMemoryEventLog::new());
        Fixture {
            broker: broker_with(store.clone(), log.clone(), dispatcher),
            store,
            log,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AccountDispatcher::new())
    }

    fn account<St, L>(broker: &TestBroker<St, L>, number: &str) -> StateHandle<Account>
    where
        St: SnapshotStore,
        L: EventLog<AccountEvent>,
    {
        broker.registry().load(&StateKey::new(number)).unwrap()
    }

    fn balance<St, L>(broker: &TestBroker<St, L>, number: &str) -> i64
    where
        St: SnapshotStore,
        L: EventLog<AccountEvent>,
    {
        account(broker, number).read(|a| a.balance())
    }

    fn open_and_commit<St, L>(broker: &TestBroker<St, L>, numbers: &[&str])
    where
        St: SnapshotStore,
        L: EventLog<AccountEvent>,
    {
        for number in numbers {
            broker.fire(AccountEvent::opened(*number)).unwrap();
        }
        assert!(broker.commit().unwrap());
    }

    #[test]
    fn deposit_is_applied_on_fire_and_persisted_on_commit() {
        let Fixture { broker, store, log } = fixture();
        open_and_commit(&broker, &["A1"]);

        let event = broker
            .fire(AccountEvent::deposited("A1", 50))
            .unwrap()
            .expect("fired outside replay");

        assert_eq!(balance(&broker, "A1"), 50);
        assert_eq!(broker.queued(), 1);
        assert_eq!(log.len(), 1);

        assert!(broker.commit().unwrap());

        assert_eq!(broker.queued(), 0);
        assert_eq!(log.event_ids().last(), Some(&event.event_id()));
        let snapshot = store.load(&StateKey::new("A1")).unwrap().unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.state["balance"], json!(50));
        assert_eq!(
            broker.metadata().get_last_results(&event),
            vec![json!({ "account": "A1", "balance": 50 })]
        );
    }

    #[test]
    fn negative_deposit_is_rejected_before_any_mutation() {
        let Fixture { broker, log, .. } = fixture();
        open_and_commit(&broker, &["A1"]);
        let version = account(&broker, "A1").version();

        let err = broker.fire(AccountEvent::deposited("A1", -10)).unwrap_err();

        let BrokerError::Guard(violation) = err else {
            panic!("expected a guard violation, got {err:?}");
        };
        assert_eq!(violation.guard, "validate");
        assert_eq!(violation.scope, GuardScope::State(StateKey::new("A1")));
        assert!(matches!(violation.reason, DomainError::Validation(_)));

        assert_eq!(balance(&broker, "A1"), 0);
        assert_eq!(account(&broker, "A1").version(), version);
        assert_eq!(broker.queued(), 0);
        assert_eq!(broker.dispatcher().count("fired"), 1);
        assert!(broker.commit().unwrap());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn failing_guard_on_one_state_leaves_every_state_untouched() {
        let Fixture { broker, .. } = fixture();
        open_and_commit(&broker, &["A1", "A2"]);
        broker.fire(AccountEvent::deposited("A1", 10)).unwrap();

        let err = broker
            .fire(AccountEvent::transferred("A1", "A2", 50))
            .unwrap_err();

        assert!(matches!(
            err,
            BrokerError::Guard(GuardViolation { ref guard, .. }) if guard == "sufficient_funds"
        ));
        assert_eq!(balance(&broker, "A1"), 10);
        assert_eq!(balance(&broker, "A2"), 0);
        assert_eq!(account(&broker, "A2").version(), 1);
        assert_eq!(broker.queued(), 1);
    }

    #[test]
    fn commit_fails_without_partial_locks_when_one_is_held_elsewhere() {
        let Fixture { broker, log, .. } = fixture();
        open_and_commit(&broker, &["A1", "A2"]);
        broker.fire(AccountEvent::deposited("A2", 10)).unwrap();

        let mut foreign = broker
            .locks()
            .lock("state_lock_A2", Duration::from_secs(60));
        assert!(foreign.get().unwrap());

        let err = broker.commit().unwrap_err();

        assert!(matches!(
            err,
            BrokerError::Concurrency(ConcurrencyError::LockUnavailable { ref name })
                if name == "state_lock_A2"
        ));
        assert!(!broker.locks().is_held("state_lock_A1"));
        assert_eq!(broker.queued(), 1);
        assert_eq!(log.len(), 2);

        foreign.release().unwrap();
        assert!(broker.commit().unwrap());
        assert_eq!(log.len(), 3);
        assert_eq!(broker.locks().held_count(), 0);
    }

    #[test]
    fn lock_names_follow_the_configured_prefix() {
        let Fixture { broker, .. } = fixture();
        let broker = broker.with_config(BrokerConfig::default().with_lock_prefix("ledger:"));
        open_and_commit(&broker, &["A1"]);
        broker.fire(AccountEvent::deposited("A1", 1)).unwrap();

        let mut foreign = broker.locks().lock("ledger:A1", Duration::from_secs(60));
        assert!(foreign.get().unwrap());

        assert!(broker.commit().is_err());
        foreign.release().unwrap();
        assert!(broker.commit().is_ok());
    }

    #[test]
    fn follow_up_events_are_committed_in_the_same_commit() {
        let Fixture { broker, log, store } =
            fixture_with(AccountDispatcher::new().with_large_deposit_threshold(100));
        open_and_commit(&broker, &["A1"]);

        broker.fire(AccountEvent::deposited("A1", 150)).unwrap();
        assert!(broker.commit().unwrap());

        assert_eq!(log.len(), 3);
        assert_eq!(broker.queued(), 0);
        assert_eq!(account(&broker, "A1").read(|a| a.flagged_deposits()), 1);
        assert_eq!(
            broker.dispatcher().handled_types(),
            vec![
                "accounts.opened",
                "accounts.deposited",
                "accounts.large_deposit_flagged"
            ]
        );
        let snapshot = store.load(&StateKey::new("A1")).unwrap().unwrap();
        assert_eq!(snapshot.state["flagged_deposits"], json!(1));
    }

    /// Fires an invalid flag and then a valid one for every deposit it handles.
    struct FlagsTwice;

    impl Dispatcher<AccountEvent> for FlagsTwice {
        fn apply(&self, event: &AccountEvent, state: &mut Account) {
            AccountDispatcher::new().apply(event, state);
        }

        fn handle(
            &self,
            event: &AccountEvent,
            _states: &[StateHandle<Account>],
            followups: &mut Followups<AccountEvent>,
        ) -> Vec<JsonValue> {
            if let AccountEventKind::Deposited { account, .. } = &event.kind {
                followups.fire(AccountEvent::large_deposit_flagged(account.clone(), -1));
                followups.fire(AccountEvent::large_deposit_flagged(account.clone(), 7));
            }
            Vec::new()
        }
    }

    #[test]
    fn rejected_follow_up_neither_hides_the_commit_nor_drops_its_siblings() {
        let log = Arc::new(InMemoryEventLog::<AccountEvent>::new());
        let broker = Broker::new(
            FlagsTwice,
            SnapshotStateRegistry::new(InMemorySnapshotStore::new()),
            log.clone(),
            InMemoryLockProvider::new(),
        )
        .with_guards(account_guards());
        broker.fire(AccountEvent::opened("A1")).unwrap();
        assert!(broker.commit().unwrap());

        broker.fire(AccountEvent::deposited("A1", 50)).unwrap();
        let err = broker.commit().unwrap_err();

        assert!(err.is_committed());
        let BrokerError::FollowupsRejected {
            committed,
            rejected,
        } = err
        else {
            panic!("expected rejected follow-ups, got {err:?}");
        };
        assert_eq!(committed, 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].event_type, "accounts.large_deposit_flagged");

        assert_eq!(log.len(), 3);
        assert_eq!(broker.queued(), 0);
        let a1 = broker.registry().load(&StateKey::new("A1")).unwrap();
        assert_eq!(a1.read(|a| a.flagged_deposits()), 1);
        assert_eq!(a1.read(|a| a.balance()), 50);
    }

    #[test]
    fn failed_snapshot_write_requeues_batch_and_retry_logs_once() {
        let snapshots = Arc::new(FlakySnapshots::default());
        let log = Arc::new(InMemoryEventLog::<AccountEvent>::new());
        let broker = broker_with(snapshots.clone(), log.clone(), AccountDispatcher::new());

        let opened = broker.fire(AccountEvent::opened("A1")).unwrap().unwrap();
        let deposit = broker.fire(AccountEvent::deposited("A1", 25)).unwrap().unwrap();
        snapshots.fail_writes.store(true, Ordering::SeqCst);

        let err = broker.commit().unwrap_err();

        assert!(matches!(
            err,
            BrokerError::Concurrency(ConcurrencyError::SnapshotWrite(_))
        ));
        assert_eq!(broker.queued(), 2);
        assert_eq!(broker.dispatcher().count("handle"), 0);
        assert_eq!(balance(&broker, "A1"), 25);
        assert_eq!(broker.locks().held_count(), 0);

        snapshots.fail_writes.store(false, Ordering::SeqCst);
        assert!(broker.commit().unwrap());

        assert_eq!(log.event_ids(), vec![opened.event_id(), deposit.event_id()]);
        assert_eq!(broker.dispatcher().count("handle"), 2);
        let snapshot = snapshots.load(&StateKey::new("A1")).unwrap().unwrap();
        assert_eq!(snapshot.state["balance"], json!(25));
    }

    #[test]
    fn failed_append_keeps_requeued_batch_ahead_of_newer_events() {
        let log = Arc::new(FlakyLog::default());
        let broker = broker_with(
            Arc::new(InMemorySnapshotStore::new()),
            log.clone(),
            AccountDispatcher::new(),
        );

        let first = broker.fire(AccountEvent::opened("A1")).unwrap().unwrap();
        log.fail_appends.store(true, Ordering::SeqCst);
        assert!(matches!(
            broker.commit(),
            Err(BrokerError::Concurrency(ConcurrencyError::LogAppend(_)))
        ));

        let second = broker.fire(AccountEvent::deposited("A1", 5)).unwrap().unwrap();
        log.fail_appends.store(false, Ordering::SeqCst);
        assert!(broker.commit().unwrap());

        assert_eq!(
            log.inner.event_ids(),
            vec![first.event_id(), second.event_id()]
        );
    }

    /// Registry that leaves one key out of the next `loaded()` answer, as if that state
    /// were loaded by another thread right after the commit read the key set.
    struct LoadsLate {
        inner: SnapshotStateRegistry<Account, InMemorySnapshotStore>,
        late: Mutex<Option<StateKey>>,
    }

    impl StateRegistry<Account> for LoadsLate {
        fn load(&self, key: &StateKey) -> Result<StateHandle<Account>, StateRegistryError> {
            self.inner.load(key)
        }

        fn loaded(&self) -> Vec<StateKey> {
            let mut keys = self.inner.loaded();
            if let Some(late) = self.late.lock().unwrap().take() {
                keys.retain(|key| *key != late);
            }
            keys
        }

        fn write_snapshots(&self) -> Result<usize, SnapshotError> {
            self.inner.write_snapshots()
        }

        fn reset(&self, include_storage: bool) -> Result<(), StateRegistryError> {
            self.inner.reset(include_storage)
        }

        fn set_replaying(&self, replaying: bool) {
            self.inner.set_replaying(replaying);
        }

        fn is_replaying(&self) -> bool {
            self.inner.is_replaying()
        }
    }

    /// Lock provider that records every lock name it hands out.
    #[derive(Default)]
    struct NamedLocks {
        inner: InMemoryLockProvider,
        names: Mutex<Vec<String>>,
    }

    impl LockProvider for NamedLocks {
        type Lock = InMemoryLock;

        fn lock(&self, name: &str, ttl: Duration) -> InMemoryLock {
            self.names.lock().unwrap().push(name.to_string());
            self.inner.lock(name, ttl)
        }
    }

    #[test]
    fn state_loaded_during_drain_is_locked_before_its_snapshot() {
        let store = InMemorySnapshotStore::new();
        let broker = Broker::new(
            AccountDispatcher::new(),
            LoadsLate {
                inner: SnapshotStateRegistry::new(store),
                late: Mutex::new(None),
            },
            InMemoryEventLog::<AccountEvent>::new(),
            NamedLocks::default(),
        )
        .with_guards(account_guards());
        broker.fire(AccountEvent::opened("A1")).unwrap();
        assert!(broker.commit().unwrap());
        broker.locks().names.lock().unwrap().clear();

        broker.fire(AccountEvent::opened("A2")).unwrap();
        *broker.registry().late.lock().unwrap() = Some(StateKey::new("A2"));
        assert!(broker.commit().unwrap());

        assert_eq!(
            *broker.locks().names.lock().unwrap(),
            vec![
                "state_lock_A1",
                "state_lock_A1",
                "state_lock_A2",
                "state_lock_A1",
                "state_lock_A2",
            ]
        );
        assert_eq!(broker.log().len(), 2);
        assert_eq!(broker.queued(), 0);
        let a2 = broker.registry().inner.store().load(&StateKey::new("A2")).unwrap();
        assert_eq!(a2.map(|s| s.version), Some(1));
        assert!(!broker.locks().inner.is_held("state_lock_A2"));
    }

    #[test]
    fn commit_on_empty_queue_succeeds() {
        let Fixture { broker, log, .. } = fixture();
        assert!(broker.commit().unwrap());
        assert!(broker.commit().unwrap());
        assert!(log.is_empty());
    }

    #[test]
    fn commit_immediately_commits_inside_fire() {
        let Fixture { broker, log, .. } = fixture();
        broker.commit_immediately(true);

        broker.fire(AccountEvent::opened("A1")).unwrap();

        assert_eq!(broker.queued(), 0);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn urgent_event_commits_even_when_the_broker_batches() {
        let Fixture { broker, log, .. } = fixture();
        broker.fire(AccountEvent::opened("A1")).unwrap();
        assert_eq!(log.len(), 0);

        broker
            .fire(AccountEvent::deposited("A1", 5).urgent())
            .unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(broker.queued(), 0);
    }

    #[test]
    fn concurrent_fires_are_all_applied_and_committed() {
        let Fixture { broker, log, .. } = fixture();
        open_and_commit(&broker, &["A1"]);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        broker.fire(AccountEvent::deposited("A1", 1)).unwrap();
                    }
                });
            }
        });
        assert!(broker.commit().unwrap());

        assert_eq!(balance(&broker, "A1"), 100);
        assert_eq!(log.len(), 101);
        assert_eq!(account(&broker, "A1").version(), 101);
        assert!(!account(&broker, "A1").is_dirty());
    }

    #[test]
    fn replay_rebuilds_state_without_guards_or_handlers() {
        let Fixture { broker, log, .. } = fixture();
        open_and_commit(&broker, &["A1", "A2"]);
        broker.fire(AccountEvent::deposited("A1", 80)).unwrap();
        broker.fire(AccountEvent::transferred("A1", "A2", 30)).unwrap();
        broker.fire(AccountEvent::withdrawn("A2", 5)).unwrap();
        broker.commit().unwrap();

        let before = (balance(&broker, "A1"), balance(&broker, "A2"));
        let checks = broker.guards().checks.load(Ordering::SeqCst);
        let fired = broker.dispatcher().count("fired");
        let handled = broker.dispatcher().count("handle");

        let replayed = broker.replay().unwrap();

        assert_eq!(replayed, log.len());
        assert_eq!((balance(&broker, "A1"), balance(&broker, "A2")), before);
        assert_eq!(broker.guards().checks.load(Ordering::SeqCst), checks);
        assert_eq!(broker.dispatcher().count("fired"), fired);
        assert_eq!(broker.dispatcher().count("handle"), handled);
        assert_eq!(broker.dispatcher().count("replay"), replayed);
        assert_eq!(broker.queued(), 0);
        assert_eq!(log.len(), replayed);
    }

    #[test]
    fn replaying_twice_yields_the_same_state() {
        let Fixture { broker, .. } = fixture();
        open_and_commit(&broker, &["A1"]);
        broker.fire(AccountEvent::deposited("A1", 42)).unwrap();
        broker.commit().unwrap();

        broker.replay().unwrap();
        let first = account(&broker, "A1").read(Account::clone);
        broker.replay().unwrap();
        let second = account(&broker, "A1").read(Account::clone);

        assert_eq!(first, second);
        assert_eq!(second.balance(), 42);
        assert_eq!(account(&broker, "A1").version(), 2);
    }

    #[test]
    fn fire_is_ignored_while_replaying() {
        let Fixture { broker, .. } = fixture();
        open_and_commit(&broker, &["A1"]);
        let mut inside = Vec::new();

        broker
            .replay_with(
                |_| {
                    inside.push((
                        broker.is_replaying(),
                        broker.registry().is_replaying(),
                        broker.fire(AccountEvent::deposited("A1", 1)).unwrap().is_none(),
                    ));
                },
                |_| {},
            )
            .unwrap();

        assert_eq!(inside, vec![(true, true, true)]);
        assert!(!broker.is_replaying());
        assert!(!broker.registry().is_replaying());
        assert_eq!(broker.queued(), 0);
        assert_eq!(balance(&broker, "A1"), 0);
    }

    #[test]
    fn replay_flags_are_cleared_when_reading_the_log_fails() {
        let log = Arc::new(FlakyLog::default());
        let broker = broker_with(
            Arc::new(InMemorySnapshotStore::new()),
            log.clone(),
            AccountDispatcher::new(),
        );
        log.fail_reads.store(true, Ordering::SeqCst);

        let err = broker.replay().unwrap_err();

        assert!(matches!(err, BrokerError::Log(_)));
        assert!(!broker.is_replaying());
        assert!(!broker.registry().is_replaying());
        assert!(broker.fire(AccountEvent::opened("A1")).unwrap().is_some());
    }

    #[test]
    fn persistent_metadata_is_logged_and_restored_on_replay() {
        let Fixture { broker, .. } = fixture();
        broker
            .metadata()
            .create_metadata_using(|_: &Metadata, event: &AccountEvent| {
                json!({ "channel": "teller", "audit": { "event_type": event.event_type() } })
            });
        open_and_commit(&broker, &["A1"]);
        broker.fire(AccountEvent::deposited("A1", 9)).unwrap();
        broker.commit().unwrap();

        // Replayed events must get their metadata from the log, not from factories.
        broker.metadata().clear_metadata_factories();
        let mut restored = Vec::new();
        broker
            .replay_with(
                |_| {},
                |event| {
                    restored.push((
                        event.event_type(),
                        broker.metadata().get_value(event, "audit.event_type").unwrap(),
                        broker.metadata().get_value(event, "channel").unwrap(),
                    ));
                },
            )
            .unwrap();

        assert_eq!(
            restored,
            vec![
                ("accounts.opened", Some(json!("accounts.opened")), Some(json!("teller"))),
                ("accounts.deposited", Some(json!("accounts.deposited")), Some(json!("teller"))),
            ]
        );
    }

    #[test]
    fn metadata_contract_violation_aborts_commit_and_requeues() {
        let Fixture { broker, log, .. } = fixture();
        broker
            .metadata()
            .create_metadata_using(|_: &Metadata, _: &AccountEvent| json!("not a map"));
        broker.fire(AccountEvent::opened("A1")).unwrap();

        assert!(matches!(broker.commit(), Err(BrokerError::Metadata(_))));
        assert_eq!(broker.queued(), 1);
        assert!(log.is_empty());

        broker.metadata().clear_metadata_factories();
        assert!(broker.commit().unwrap());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn metadata_is_released_once_events_are_dropped() {
        let Fixture { broker, .. } = fixture();
        broker
            .metadata()
            .create_metadata_using(|_: &Metadata, _: &AccountEvent| json!({ "k": 1 }));

        let event = broker.fire(AccountEvent::opened("A1")).unwrap().unwrap();
        broker.commit().unwrap();
        assert_eq!(broker.metadata().tracked(), (1, 1));

        drop(event);

        assert_eq!(broker.metadata().tracked(), (0, 0));
    }

    #[test]
    fn transfer_targets_both_accounts_in_order() {
        let Fixture { broker, .. } = fixture();
        open_and_commit(&broker, &["A2", "A1"]);
        broker.fire(AccountEvent::deposited("A2", 10)).unwrap();
        let transfer = broker
            .fire(AccountEvent::transferred("A2", "A1", 10))
            .unwrap()
            .unwrap();
        broker.commit().unwrap();

        assert!(matches!(transfer.kind, AccountEventKind::Transferred { .. }));
        assert_eq!(
            broker.metadata().get_last_results(&transfer),
            vec![
                json!({ "account": "A2", "balance": 0 }),
                json!({ "account": "A1", "balance": 10 }),
            ]
        );
    }
}
