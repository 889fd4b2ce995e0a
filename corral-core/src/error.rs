//! The error taxonomy shared by state backends and the runtime

use crate::{metadata::Phase, pointer::Pointer};
use thiserror::Error;

/// Convenience alias using the crate error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by state operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The resource does not exist.
    #[error("resource {0} not found")]
    NotFound(Pointer),

    /// Create of a resource that already exists.
    #[error("resource {0} already exists")]
    AlreadyExists(Pointer),

    /// Optimistic-concurrency version mismatch.
    #[error("version conflict on {pointer}: expected {expected}, found {found}")]
    VersionConflict {
        /// The resource written.
        pointer: Pointer,
        /// The version the writer expected.
        expected: u64,
        /// The version the store holds.
        found: u64,
    },

    /// The resource is in the wrong phase for the attempted write.
    #[error("phase conflict on {pointer}: resource is {phase}")]
    PhaseConflict {
        /// The resource written.
        pointer: Pointer,
        /// The phase the store holds.
        phase: Phase,
    },

    /// Destruction is blocked by finalizers.
    #[error("resource {0} still has finalizers")]
    PendingFinalizers(Pointer),

    /// A write by someone other than the resource owner.
    #[error("owner conflict on {pointer}: owned by {owner:?}, write attempted by {attempted:?}")]
    OwnerConflict {
        /// The resource written.
        pointer: Pointer,
        /// The current owner.
        owner: String,
        /// The owner the write carried.
        attempted: String,
    },

    /// The adapter rejected an operation not covered by the controller's
    /// declared inputs and outputs.
    #[error("controller {controller:?} denied {verb} access to {target}")]
    AccessDenied {
        /// The offending controller.
        controller: String,
        /// The operation attempted.
        verb: &'static str,
        /// The target resource or kind.
        target: String,
    },

    /// A typed read hit a resource of a different kind.
    #[error("resource {pointer} is not of kind {expected}")]
    UnexpectedType {
        /// The resource read.
        pointer: Pointer,
        /// The kind the reader expected.
        expected: String,
    },

    /// The rate-limiter wait was cancelled.
    #[error("rate limited write was cancelled")]
    RateLimited,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Spec serialization failed.
    #[error("spec codec error: {0}")]
    Codec(#[source] serde_json::Error),

    /// An opaque backend error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this is a missing-resource error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether this is any conflict flavor, which callers may retry.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_)
                | Error::VersionConflict { .. }
                | Error::PhaseConflict { .. }
                | Error::PendingFinalizers(_)
        )
    }

    /// Whether the target resource was in the wrong phase.
    #[must_use]
    pub fn is_phase_conflict(&self) -> bool {
        matches!(self, Error::PhaseConflict { .. })
    }

    /// Whether this error represents cancellation rather than failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_predicates() {
        let ptr = Pointer::new("ns", "T", "x");
        assert!(Error::NotFound(ptr.clone()).is_not_found());
        assert!(Error::AlreadyExists(ptr.clone()).is_conflict());
        assert!(Error::VersionConflict {
            pointer: ptr.clone(),
            expected: 1,
            found: 2
        }
        .is_conflict());
        let phase = Error::PhaseConflict {
            pointer: ptr.clone(),
            phase: Phase::TearingDown,
        };
        assert!(phase.is_conflict());
        assert!(phase.is_phase_conflict());
        assert!(Error::PendingFinalizers(ptr).is_conflict());
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::RateLimited.is_cancellation());
    }
}
