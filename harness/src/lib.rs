//! Relay harness.
//!
//! Local server + worker + enqueue setup for exercising relay flows and
//! invariants against a real Postgres.

pub mod config;
pub mod enqueue;
pub mod migrate;
