//! Errors returned by collaborator stores.

use thiserror::Error;

/// Failure of a call into the user, conversation or message store.
///
/// The delivery layer treats every variant except [`StoreError::NotFound`] as
/// an I/O failure: logged, surfaced to the client as an internal error, never
/// fatal to the connection.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record (`user`, `conversation`, `message`).
        entity: &'static str,
        /// Id that was looked up.
        id: String,
    },

    /// The store rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Convenience alias for collaborator results.
pub type Result<T> = std::result::Result<T, StoreError>;
