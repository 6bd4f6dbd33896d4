//! Error taxonomy shared by the façade, the adapters and the alias cache.

use crate::adapters::distributed::SessionError;
use thiserror::Error;

/// Failure reported by an underlying engine, before it is tagged with the
/// adapter and operation that hit it.
#[derive(Debug, Error)]
pub enum BackendFailure {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum MetabaseError {
    /// Malformed request detected before any backend call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The engine behind `adapter` failed while running `operation`.
    #[error("{adapter}: {operation}: {source}")]
    Backend {
        adapter: &'static str,
        operation: &'static str,
        #[source]
        source: BackendFailure,
    },

    /// Stored data does not decode, or references an alias that was never allocated.
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    #[error("{adapter}: {operation}: canceled")]
    Canceled {
        adapter: &'static str,
        operation: &'static str,
    },

    #[error("config: {0}")]
    Config(String),
}

pub type MetabaseResult<T> = Result<T, MetabaseError>;

impl MetabaseError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    /// Tag a raw engine failure with adapter identity and operation name.
    pub fn backend(
        adapter: &'static str,
        operation: &'static str,
        source: impl Into<BackendFailure>,
    ) -> Self {
        Self::Backend {
            adapter,
            operation,
            source: source.into(),
        }
    }

    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    pub fn is_data_integrity(&self) -> bool {
        matches!(self, Self::DataIntegrity(_))
    }
}
