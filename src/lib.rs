//! aerocommit - transaction commit pipeline of a multi-version catalog
//!
//! A committed transaction passes through conflict resolution, WAL
//! appending, trunk incorporation and snapshot propagation; callers wait on
//! whichever milestone they need.

pub mod catalog;
pub mod cli;
pub mod observability;
pub mod transaction;
pub mod wal;
