//! Core domain types: identifiers, triggers, job declarations, callables
//! and snapshots.

pub mod handler;
pub mod job;
pub mod snapshot;
pub mod trigger;
pub mod types;
