//! sentinel-worker: the execution half of the Sentinel remote code runner.
//!
//! Consumes jobs from a durable broker queue, enforces at-most-once
//! processing per job, runs each submission inside an external OS-level
//! sandbox, classifies the outcome, persists the verdict, and settles the
//! broker message only after the terminal state is durable.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod domain;
pub mod judge;
pub mod message;
pub mod observability;
pub mod pipeline;
pub mod pool;
pub mod sandbox;
pub mod store;
pub mod testing;
