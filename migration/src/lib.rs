//! Database migrations for the Broadcaster service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_06_01_095000_create_tenants;
mod m2025_06_01_100000_create_broadcasts;
mod m2025_06_01_100100_create_run_tasks;
mod m2025_06_01_100200_create_dedup_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_01_095000_create_tenants::Migration),
            Box::new(m2025_06_01_100000_create_broadcasts::Migration),
            Box::new(m2025_06_01_100100_create_run_tasks::Migration),
            Box::new(m2025_06_01_100200_create_dedup_entries::Migration),
        ]
    }
}
