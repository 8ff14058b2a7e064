use thiserror::Error;

use crate::model::ListId;
use crate::service::ClientId;

/// Errors surfaced by the sync engine.
///
/// Every failure is scoped to one call or one (list, client) pair; none of
/// them aborts sibling syncs of the same list.
#[derive(Debug, Error)]
pub enum SyncError {
    /// List, mirror or member is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was computed against a stale view of the canonical list.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Fetch/apply against an external service failed; retried next pass.
    #[error("transient I/O failure on client {client}: {message}")]
    TransientIo { client: ClientId, message: String },

    /// The client cannot hold this kind of list.
    #[error("client {client} does not support {what}")]
    Unsupported { client: ClientId, what: String },

    #[error("sync of list {list} on client {client} was cancelled")]
    Cancelled { list: ListId, client: ClientId },

    #[error("storage: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn transient(client: ClientId, err: impl std::fmt::Display) -> Self {
        SyncError::TransientIo {
            client,
            message: err.to_string(),
        }
    }

    /// Whether the scheduler should try this pair again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientIo { .. }
                | SyncError::Conflict(_)
                | SyncError::Cancelled { .. }
                | SyncError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
