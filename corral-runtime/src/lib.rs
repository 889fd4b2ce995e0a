//! Controller runtime for the corral resource engine
//!
//! Long-lived controllers cooperatively reconcile the shared resource
//! store defined by `corral-core`. Controllers declare the kinds they
//! read and write; the [`engine::Engine`] watches the store, reduces and
//! deduplicates events, and wakes dependent controllers: either as a
//! coalesced full reconcile ([`controller::Controller`]) or per item
//! through a deduplicating queue ([`controller::QController`]).

pub mod adapter;
pub mod cache;
pub mod controller;
pub mod engine;
pub mod error;
pub mod full_runtime;
pub mod index;
pub mod metrics;
pub mod queue;
pub mod queued_runtime;
pub mod reduced;
mod retry;
pub mod transform;

pub use controller::{Controller, Input, InputKind, Output, OutputKind, QController, QSettings};
pub use engine::{Engine, RuntimeOptions};
pub use error::{Error, Result};
pub use full_runtime::FullRuntime;
pub use queue::JobQueue;
pub use queued_runtime::{Job, QRuntime};
pub use reduced::ReducedMetadata;
pub use transform::{QTransformController, Transformer};

// Cancellation is part of the public surface (`Engine::run`,
// `context_with_teardown`).
pub use tokio_util::sync::CancellationToken;
