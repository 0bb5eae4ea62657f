//! Guards: validation rules checked before an event touches any state.

use thiserror::Error;
use tracing::debug;

use eventline_core::{DomainError, DomainResult, StateKey};

use crate::Event;

/// What a guard check is scoped to.
#[derive(Debug)]
pub enum GuardTarget<'a, S> {
    /// One target state of the event.
    State { key: &'a StateKey, state: &'a S },
    /// No particular state: rules that span the whole event.
    Global,
}

impl<S> GuardTarget<'_, S> {
    pub fn scope(&self) -> GuardScope {
        match self {
            GuardTarget::State { key, .. } => GuardScope::State((*key).clone()),
            GuardTarget::Global => GuardScope::Global,
        }
    }

    fn state(&self) -> Option<&S> {
        match self {
            GuardTarget::State { state, .. } => Some(*state),
            GuardTarget::Global => None,
        }
    }
}

/// Owned form of `GuardTarget`, carried by a violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardScope {
    State(StateKey),
    Global,
}

impl core::fmt::Display for GuardScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            GuardScope::State(key) => write!(f, "state {key}"),
            GuardScope::Global => f.write_str("global"),
        }
    }
}

/// An event failed a validation rule. Raised before any mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{event_type} rejected by guard `{guard}` ({scope}): {reason}")]
pub struct GuardViolation {
    pub event_type: &'static str,
    pub scope: GuardScope,
    pub guard: String,
    #[source]
    pub reason: DomainError,
}

/// Validates an event against one target (a state or the global scope).
pub trait GuardChecker<E: Event>: Send + Sync {
    fn check(&self, event: &E, target: GuardTarget<'_, E::State>) -> Result<(), GuardViolation>;
}

impl<E, G> GuardChecker<E> for std::sync::Arc<G>
where
    E: Event,
    G: GuardChecker<E> + ?Sized,
{
    fn check(&self, event: &E, target: GuardTarget<'_, E::State>) -> Result<(), GuardViolation> {
        (**self).check(event, target)
    }
}

type StateRule<E> = Box<dyn Fn(&E, &<E as Event>::State) -> DomainResult<()> + Send + Sync>;
type GlobalRule<E> = Box<dyn Fn(&E) -> DomainResult<()> + Send + Sync>;

/// Named rule registry and the default `GuardChecker`.
///
/// For each check the event's own `Event::validate` runs first (reported as guard
/// `validate`), then the registered rules for the target's scope in registration
/// order. The first failure wins.
pub struct Guards<E: Event> {
    state_rules: Vec<(String, StateRule<E>)>,
    global_rules: Vec<(String, GlobalRule<E>)>,
}

impl<E: Event> Guards<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule checked once per target state.
    pub fn state_rule(
        mut self,
        name: impl Into<String>,
        rule: impl Fn(&E, &E::State) -> DomainResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.state_rules.push((name.into(), Box::new(rule)));
        self
    }

    /// Register a rule checked once per event, without a state.
    pub fn global_rule(
        mut self,
        name: impl Into<String>,
        rule: impl Fn(&E) -> DomainResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.global_rules.push((name.into(), Box::new(rule)));
        self
    }

    pub fn len(&self) -> usize {
        self.state_rules.len() + self.global_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Event> Default for Guards<E> {
    fn default() -> Self {
        Self {
            state_rules: Vec::new(),
            global_rules: Vec::new(),
        }
    }
}

impl<E: Event> core::fmt::Debug for Guards<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Guards")
            .field(
                "state_rules",
                &self.state_rules.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field(
                "global_rules",
                &self.global_rules.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<E: Event> GuardChecker<E> for Guards<E> {
    fn check(&self, event: &E, target: GuardTarget<'_, E::State>) -> Result<(), GuardViolation> {
        let violation = |guard: &str, reason: DomainError| GuardViolation {
            event_type: event.event_type(),
            scope: target.scope(),
            guard: guard.to_string(),
            reason,
        };

        event
            .validate(target.state())
            .map_err(|reason| violation("validate", reason))?;

        match target.state() {
            Some(state) => {
                for (name, rule) in &self.state_rules {
                    rule(event, state).map_err(|reason| violation(name.as_str(), reason))?;
                }
            }
            None => {
                for (name, rule) in &self.global_rules {
                    rule(event).map_err(|reason| violation(name.as_str(), reason))?;
                }
            }
        }

        debug!(event_type = event.event_type(), scope = %target.scope(), "guards passed");
        Ok(())
    }
}
