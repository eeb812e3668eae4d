use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by a resource `create` callback.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Errors surfaced by [`Pool`](crate::Pool) operations.
///
/// Errors produced by the caller's own closure are not wrapped here; they
/// travel back unchanged inside the closure's output.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The pool is being destroyed, or was destroyed while the caller waited.
    #[error("pool is unavailable")]
    Unavailable,
    /// Creating the resource failed. Every caller waiting on the same
    /// instance observes the same error.
    #[error("failed to create resource: {0}")]
    Create(#[source] Arc<dyn Error + Send + Sync>),
}

impl PoolError {
    /// Whether this is [`PoolError::Unavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PoolError::Unavailable)
    }
}
