//! Keeps ordered media lists in step between an internal database and any
//! number of external media services.
//!
//! The internal list is the source of truth ([`store`]); every edit lands in
//! a per-list [`ledger`]. Each connected service has a [`mirror`] of what it
//! last held. A sync pass ([`orchestrator`]) fetches the service's list,
//! diffs both sides against the mirror ([`diff`]), merges them ([`merge`])
//! and applies the result in both directions.

pub mod config;
pub mod diff;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod merge;
pub mod mirror;
pub mod model;
pub mod orchestrator;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Result, SyncError};
