//! Database migrations for the marketplace sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_000100_create_sync_jobs;
mod m2025_11_10_000200_create_stored_entities;
mod m2025_11_10_000300_create_execution_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_000100_create_sync_jobs::Migration),
            Box::new(m2025_11_10_000200_create_stored_entities::Migration),
            Box::new(m2025_11_10_000300_create_execution_logs::Migration),
        ]
    }
}
