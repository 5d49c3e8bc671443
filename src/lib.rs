//! # Broadcaster Library
//!
//! Core functionality for the Broadcaster service: the broadcast state
//! machine and store, the scheduler and dispatch queue, the execution
//! worker, and the HTTP API surface.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod queue;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod sync_notifier;
pub mod telemetry;
pub mod window;
pub mod worker;
pub use migration;
