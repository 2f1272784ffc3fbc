use thiserror::Error;

pub mod audit;
pub mod token;

pub use audit::{SpawningAuditSink, SqlAuditRepository};
pub use token::SqlTokenStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}
