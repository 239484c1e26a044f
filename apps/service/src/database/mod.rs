/// Database abstraction layer
///
/// One libsql-backed implementation (`DatabaseImpl`) serves the three stores
/// the core depends on: targets (read-only), check history and the lease row.

pub mod lease;
pub mod migrations;
pub mod models;
pub mod repository;

#[cfg(test)]
pub(crate) mod memory;

pub use models::{Lease, Target};
pub use repository::{DatabaseImpl, HistoryStore, LeaseStore, RecentHistory, TargetStore};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
