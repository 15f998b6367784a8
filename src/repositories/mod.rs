//! # Repository Layer
//!
//! SeaORM access for sync jobs and stored entities.

pub mod stored_entity;
pub mod sync_job;

pub use stored_entity::{EntityStore, SeaOrmEntityStore};
pub use sync_job::SyncJobRepository;
