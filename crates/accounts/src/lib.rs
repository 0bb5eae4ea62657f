//! Accounts domain (event-sourced).
//!
//! A small banking model: accounts are opened, receive deposits and withdrawals, and
//! exchange transfers. Large deposits are flagged by a follow-up event fired while
//! the deposit is handled. Pure domain logic (no IO, no storage).

pub mod account;
pub mod dispatcher;

pub use account::{Account, AccountEvent, AccountEventKind, account_guards};
pub use dispatcher::{AccountDispatcher, DEFAULT_LARGE_DEPOSIT_THRESHOLD};
