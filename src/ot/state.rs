//! Materialized document projections

use thiserror::Error;

/// A diff could not be applied to a projection.
///
/// Leaves the projection in an unknown state; owners must treat it as
/// corrupted and rebuild from a checkout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to apply diff: {0}")]
pub struct StateError(pub String);

impl StateError {
    pub fn new(message: impl Into<String>) -> Self {
        StateError(message.into())
    }
}

/// Mutable projection of a document, built by replaying diffs.
pub trait OtState<D>: Send + 'static {
    /// Reset to the empty document.
    fn init(&mut self);

    /// Apply one diff.
    fn apply(&mut self, diff: &D) -> Result<(), StateError>;

    /// Apply diffs in order, stopping at the first failure.
    fn apply_all(&mut self, diffs: &[D]) -> Result<(), StateError> {
        for diff in diffs {
            self.apply(diff)?;
        }
        Ok(())
    }
}
