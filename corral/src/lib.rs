//! A resource-and-controller engine for operating-system level software
//!
//! Many small, long-lived *controllers* cooperatively reconcile a shared,
//! typed, versioned store of *resources*. Controllers declare the resource
//! kinds they read (inputs) and write (outputs); the runtime watches the
//! store, wakes controllers on relevant changes, enforces ownership, and
//! drives items through create/update/teardown/destroy lifecycles with
//! finalizer-mediated ordering.
//!
//! This facade re-exports the two member crates:
//! - [`core`]: the resource model and the [`core::state::State`] contract
//!   any backing store implements;
//! - [`runtime`]: the controller engine, queue, cache and adapters.
//!
//! # Example
//!
//! ```no_run
//! use corral::core::state::mem::MemState;
//! use corral::runtime::{CancellationToken, Engine, RuntimeOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> corral::runtime::Result<()> {
//! let engine = Engine::new(Arc::new(MemState::new()), RuntimeOptions::new());
//! // engine.register_controller(...).await?;
//! engine.run(CancellationToken::new()).await
//! # }
//! ```

#![deny(missing_docs)]

pub use corral_core as core;
pub use corral_runtime as runtime;

pub use corral_core::{DynamicResource, Kind, Metadata, Phase, Pointer, ResourceSpec, TypedResource};
pub use corral_runtime::{
    Controller, Engine, Input, InputKind, Output, OutputKind, QController, QSettings,
    QTransformController, RuntimeOptions, Transformer,
};
