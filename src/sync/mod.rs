//! Change-driven sync pipeline
//!
//! A [`SyncContext`] watches the plaintext source, turns every change into a
//! task on its queue and owns the crypted destination those tasks write to.

mod context;
mod watcher;

pub use context::{ContextState, SyncContext};
pub use watcher::{ChangeEvent, MoveMatcher, MOVE_PAIR_WINDOW};
