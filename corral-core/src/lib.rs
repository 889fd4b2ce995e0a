//! Core contracts for the corral resource-and-controller engine
//!
//! This crate defines the shared, typed, versioned resource model that
//! controllers reconcile over, and the [`State`](state::State) contract any
//! backing store implements. The controller runtime itself lives in
//! `corral-runtime`.
//!
//! A resource is a strict [`Metadata`] header plus an opaque spec payload;
//! typed access goes through [`TypedResource`] with the kind identity
//! supplied by [`ResourceSpec`], while the store and the watch machinery
//! carry the type-erased [`DynamicResource`].

#![deny(missing_docs)]

pub mod error;
pub mod labels;
pub mod metadata;
pub mod pointer;
pub mod resource;
pub mod state;

pub use error::{Error, Result};
pub use metadata::{Metadata, Phase};
pub use pointer::{Kind, Pointer};
pub use resource::{DynamicResource, ResourceSpec, TypedResource};
