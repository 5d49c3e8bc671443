//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM operations
//! for database entities, providing a clean API for data access with tenant-aware methods.

pub mod broadcast;
pub mod dedup;

pub use broadcast::BroadcastRepository;
pub use dedup::DedupLedger;
