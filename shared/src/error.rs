use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

pub type PoolError = bb8::RunError<diesel_async::pooled_connection::PoolError>;

/// Storage failures, classified so callers can tell a lost race from a broken database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic concurrency conflict on {0}")]
    Conflict(&'static str),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("database error: {0}")]
    Database(DieselError),

    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                let constraint = info.constraint_name().unwrap_or(info.message());
                StoreError::UniqueViolation(constraint.to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
                StoreError::Conflict("serializable transaction")
            }
            other => StoreError::Database(other),
        }
    }
}

/// Errors that go away when the unit of work is re-run from a fresh read.
pub trait Retryable {
    fn is_conflict(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::UniqueViolation(_))
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("publish to {exchange} rejected: {reason}")]
    Rejected { exchange: String, reason: String },
}
