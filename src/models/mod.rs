//! # Data Models
//!
//! SeaORM entities backing the sync engine.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod execution_log;
pub mod stored_entity;
pub mod sync_job;

pub use execution_log::Entity as ExecutionLog;
pub use stored_entity::Entity as StoredEntity;
pub use sync_job::Entity as SyncJob;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "marketplace-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
