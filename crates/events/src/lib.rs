//! Event lifecycle primitives: the event contract, the commit queue, dispatcher
//! callbacks, guards, and per-event metadata.
//!
//! Everything here is mechanics only (no IO). The broker that drives these pieces
//! lives in `eventline-infra`.

pub mod dispatcher;
pub mod event;
pub mod guard;
pub mod metadata;
pub mod queue;
pub mod weak_map;

pub use dispatcher::{Dispatcher, Followups};
pub use event::Event;
pub use guard::{GuardChecker, GuardScope, GuardTarget, GuardViolation, Guards};
pub use metadata::{
    Contribution, LAST_RESULTS_KEY, Metadata, MetadataError, MetadataFactory, MetadataManager,
};
pub use queue::EventQueue;
pub use weak_map::WeakKeyMap;
