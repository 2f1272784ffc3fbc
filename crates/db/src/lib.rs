//! SQLite persistence for approval tokens and audit records.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use repositories::{RepositoryError, SpawningAuditSink, SqlAuditRepository, SqlTokenStore};
