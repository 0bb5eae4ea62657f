use serde_json::Value as JsonValue;

use eventline_core::StateHandle;

use crate::Event;

/// Per-event-type routing of lifecycle callbacks.
///
/// The broker calls these in a fixed order:
///
/// ```text
/// fire:    guards → apply (per state) → enqueue → fired
/// commit:  locks → drain → log + snapshots → unlock → handle
/// replay:  apply (per state) → replay
/// ```
///
/// `apply` is the only place state is mutated and must stay deterministic, because
/// replay runs it again over the historical log. Side effects belong in `handle`,
/// which only runs after the event has been committed durably.
pub trait Dispatcher<E: Event>: Send + Sync {
    /// Mutate one target state in memory.
    fn apply(&self, event: &E, state: &mut E::State);

    /// Hook after the event has been applied and queued.
    fn fired(&self, _event: &E, _states: &[StateHandle<E::State>]) {}

    /// Post-commit side effects. Returns one result per handled state, in order.
    ///
    /// Events pushed into `followups` are fired by the broker after every event of
    /// the current batch has been handled, and are committed before `commit` returns.
    fn handle(
        &self,
        _event: &E,
        _states: &[StateHandle<E::State>],
        _followups: &mut Followups<E>,
    ) -> Vec<JsonValue> {
        Vec::new()
    }

    /// Replay-mode counterpart of `fired`. Must not trigger externally visible effects.
    fn replay(&self, _event: &E, _states: &[StateHandle<E::State>]) {}
}

impl<E, D> Dispatcher<E> for std::sync::Arc<D>
where
    E: Event,
    D: Dispatcher<E> + ?Sized,
{
    fn apply(&self, event: &E, state: &mut E::State) {
        (**self).apply(event, state)
    }

    fn fired(&self, event: &E, states: &[StateHandle<E::State>]) {
        (**self).fired(event, states)
    }

    fn handle(
        &self,
        event: &E,
        states: &[StateHandle<E::State>],
        followups: &mut Followups<E>,
    ) -> Vec<JsonValue> {
        (**self).handle(event, states, followups)
    }

    fn replay(&self, event: &E, states: &[StateHandle<E::State>]) {
        (**self).replay(event, states)
    }
}

/// Events a handler wants fired as a consequence of the event it handled.
#[derive(Debug)]
pub struct Followups<E> {
    events: Vec<E>,
}

impl<E> Followups<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<E> {
        self.events
    }
}

impl<E> Default for Followups<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E> Extend<E> for Followups<E> {
    fn extend<T: IntoIterator<Item = E>>(&mut self, iter: T) {
        self.events.extend(iter);
    }
}
