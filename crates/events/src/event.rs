use chrono::{DateTime, Utc};

use eventline_core::{DomainResult, EventId, State, StateKey};

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - shared as `Arc<Self>` once fired; the allocation is the event's identity for
///   out-of-line metadata
pub trait Event: core::fmt::Debug + Send + Sync + 'static {
    /// The state aggregate type this event is applied to.
    type State: State;

    /// Stable identifier, assigned when the event value is created.
    fn event_id(&self) -> EventId;

    /// Stable event name/type identifier (e.g. "accounts.deposited").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Keys of every state this event targets, in application order.
    ///
    /// Keys that are not loaded yet are created from `State::initial`.
    fn states(&self) -> Vec<StateKey>;

    /// Commit as soon as this event has been fired, regardless of broker settings.
    fn commits_immediately(&self) -> bool {
        false
    }

    /// The event's own rule, checked once per target state and once with `None` for
    /// rules that span states. Runs before any registered guard.
    fn validate(&self, _state: Option<&Self::State>) -> DomainResult<()> {
        Ok(())
    }
}
