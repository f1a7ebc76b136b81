//! Error taxonomy for the library layers
//!
//! Application wiring (`hub`, `config`, `main`) uses `anyhow` on top of these.

use thiserror::Error;

pub use crate::bcmath::DecimalError;

/// A provider could not deliver a sample this round
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{provider} unavailable: {reason}")]
    Unavailable {
        provider: &'static str,
        reason: String,
    },
    #[error("{provider} does not quote {instrument}")]
    Unsupported {
        provider: &'static str,
        instrument: String,
    },
}

impl SourceError {
    pub fn unavailable(provider: &'static str, reason: impl ToString) -> Self {
        SourceError::Unavailable {
            provider,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("decimal error: {0}")]
    Decimal(#[from] DecimalError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("broker channel error: {0}")]
    Channel(String),
    #[error("declaration failed: {0}")]
    Declare(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("topology replay failed: {0}")]
    Replay(String),
    #[error("transport closed")]
    Closed,
    #[error("broker link is down")]
    NotConnected,
    #[error("consumer tag must not be empty")]
    InvalidConsumer,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
