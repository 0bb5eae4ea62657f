//! `eventline-core`: building blocks shared by every layer.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the in-memory cell that holds a loaded
//! state aggregate.

pub mod error;
pub mod id;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, StateKey};
pub use state::{ExpectedVersion, State, StateCell, StateHandle};
