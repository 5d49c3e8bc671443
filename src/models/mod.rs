//! # Data Models
//!
//! SeaORM entity models for the Broadcaster service plus the JSON-embedded
//! contact document carried inside a broadcast row.

pub mod broadcast;
pub mod contact;
pub mod dedup_entry;
pub mod run_task;
pub mod tenant;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Basic service information returned by the root endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// Service name
    pub name: String,
    /// Service version
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: "broadcaster".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
