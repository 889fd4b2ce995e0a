//! Runtime-side errors and reconcile control flow

use corral_core::Kind;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias using the runtime error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by controllers and the runtime machinery.
///
/// State errors pass through transparently so controller code can use `?`
/// on adapter calls; the remaining variants drive scheduling decisions
/// (requeue, skip, destroy-output) or report runtime failures.
#[derive(Debug, Error)]
pub enum Error {
    /// A state operation failed.
    #[error(transparent)]
    State(#[from] corral_core::Error),

    /// Ask the runtime to re-run the item after `interval`. Carrying a
    /// source error makes the attempt count as a crash as well.
    #[error("requeue after {interval:?}")]
    Requeue {
        /// The error that triggered the requeue, if any.
        source: Option<Box<Error>>,
        /// Delay before the item is due again.
        interval: Duration,
    },

    /// Treat the reconcile as a success without touching the output.
    #[error("reconcile skipped")]
    SkipReconcile,

    /// Tear down and destroy the mapped output.
    #[error("output destruction requested")]
    DestroyOutput,

    /// A captured controller panic.
    #[error("controller panicked: {0}")]
    Panic(String),

    /// A second controller claimed an exclusively-owned output type.
    #[error("output type {type_name:?} already owned by {existing:?}, requested by {requested:?}")]
    OutputConflict {
        /// The contested resource type.
        type_name: String,
        /// The controller(s) already registered.
        existing: String,
        /// The controller attempting to register.
        requested: String,
    },

    /// The same `(controller, type)` pair was registered twice.
    #[error("controller {controller:?} already declares output type {type_name:?}")]
    DuplicateOutput {
        /// The registering controller.
        controller: String,
        /// The duplicated output type.
        type_name: String,
    },

    /// The same input was declared twice by one controller.
    #[error("controller {controller:?} already declares input {input}")]
    DuplicateInput {
        /// The registering controller.
        controller: String,
        /// The duplicated input, rendered as `namespace/type[/id]`.
        input: String,
    },

    /// An input removal did not match any registered input.
    #[error("controller {controller:?} does not declare input {input}")]
    UnknownInput {
        /// The deregistering controller.
        controller: String,
        /// The missing input, rendered as `namespace/type[/id]`.
        input: String,
    },

    /// A controller was registered under an already-taken name.
    #[error("controller {0:?} is already registered")]
    DuplicateController(String),

    /// `map_input` was invoked for a kind with no registered mapper.
    #[error("controller {controller:?} has no input mapping for kind {kind}")]
    UnknownMappedKind {
        /// The mapping controller.
        controller: String,
        /// The unmapped kind.
        kind: Kind,
    },

    /// `context_with_teardown` requires the kind to be cached.
    #[error("teardown watch requires kind {0} to be cached")]
    UncachedTeardownWatch(Kind),

    /// The engine's watch pump died.
    #[error("watch pump failed: {0}")]
    WatchFailed(String),

    /// An opaque controller error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// A plain requeue: re-run the item after `interval` without counting
    /// the attempt as a crash.
    #[must_use]
    pub fn requeue_after(interval: Duration) -> Self {
        Error::Requeue {
            source: None,
            interval,
        }
    }

    /// A failing requeue: re-run after `interval` and count a crash.
    #[must_use]
    pub fn requeue_error(source: Error, interval: Duration) -> Self {
        Error::Requeue {
            source: Some(Box::new(source)),
            interval,
        }
    }

    /// Whether the underlying state error is a missing resource.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::State(err) if err.is_not_found())
    }

    /// Whether the underlying state error is a conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::State(err) if err.is_conflict())
    }

    /// Whether the target resource was in the wrong phase.
    #[must_use]
    pub fn is_phase_conflict(&self) -> bool {
        matches!(self, Error::State(err) if err.is_phase_conflict())
    }

    /// Whether this error represents cancellation; cancelled controllers
    /// exit cleanly instead of crashing.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::State(err) if err.is_cancellation())
    }
}

/// Render a joined task's panic payload for logging and
/// [`Error::Panic`].
pub(crate) fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string()),
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::Pointer;

    #[test]
    fn state_errors_pass_through_predicates() {
        let err: Error = corral_core::Error::NotFound(Pointer::new("ns", "T", "x")).into();
        assert!(err.is_not_found());
        assert!(!err.is_conflict());

        let err: Error = corral_core::Error::Cancelled.into();
        assert!(err.is_cancellation());
    }

    #[test]
    fn requeue_constructors() {
        let plain = Error::requeue_after(Duration::from_secs(5));
        assert!(matches!(plain, Error::Requeue { source: None, interval } if interval == Duration::from_secs(5)));

        let failing = Error::requeue_error(Error::SkipReconcile, Duration::from_secs(1));
        assert!(matches!(failing, Error::Requeue { source: Some(_), .. }));
    }
}
