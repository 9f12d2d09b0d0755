//! Error handling and types

use thiserror::Error;

/// Errors returned by [`Limit`](crate::Limit)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitError {
    /// More tokens were given back than were borrowed
    #[error("discarding limited token, resource pool is full, someone returned multiple times")]
    OverReturn,
}

/// Errors returned by [`ResourceManager`](crate::ResourceManager)
///
/// `E` is the error type of the caller-supplied creation function. It is
/// carried unchanged inside [`ResourceError::Create`] and shared by every
/// caller that waited on the same creation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError<E> {
    /// The creation function failed
    #[error("resource creation failed: {0}")]
    Create(#[source] E),

    /// The manager has already been closed
    #[error("resource manager is closed")]
    Closed,
}

impl<E> ResourceError<E> {
    /// Get the creation error, if this is one
    #[must_use]
    pub const fn create_error(&self) -> Option<&E> {
        match self {
            Self::Create(err) => Some(err),
            Self::Closed => None,
        }
    }
}
