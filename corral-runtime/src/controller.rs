//! Controller-facing contracts: dependency declarations and the two
//! controller flavors
//!
//! A controller names the resource kinds it reads ([`Input`]) and the kinds
//! it writes ([`Output`]); the engine wires watches and enforces access
//! from these declarations alone. The two flavors differ in scheduling:
//! a [`Controller`] reconciles all of its inputs on every wake, while a
//! [`QController`] is driven item-by-item through a deduplicating queue.

use crate::{error::Result, full_runtime::FullRuntime, queued_runtime::QRuntime};
use async_trait::async_trait;
use corral_core::{Pointer, ResourceSpec};
use std::fmt::{self, Display};

/// How a controller depends on an input kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InputKind {
    /// Wake on any change; no ordering obligation.
    Weak,
    /// Like [`InputKind::Weak`], and additionally permits finalizer
    /// mutation on the input, blocking its destruction.
    Strong,
    /// Wake only when the resource is tearing down with no finalizers.
    DestroyReady,
    /// Queued runtimes only: each item of this kind drives one reconcile
    /// job.
    QPrimary,
    /// Queued runtimes only: events are transformed by `map_input` into
    /// primary ids to enqueue.
    QMapped,
    /// Like [`InputKind::QMapped`], but only once the watched resource is
    /// destroy-ready.
    QMappedDestroyReady,
}

impl InputKind {
    /// Whether this dependency permits finalizer mutation on the input.
    #[must_use]
    pub fn permits_finalizers(self) -> bool {
        matches!(
            self,
            InputKind::Strong | InputKind::QPrimary | InputKind::QMapped
        )
    }
}

/// A declared input dependency.
///
/// Input identity is `(namespace, type_name, id)`; two inputs differing
/// only in kind are considered duplicates.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Input {
    /// Namespace of the watched kind.
    pub namespace: String,
    /// Type name of the watched kind.
    pub type_name: String,
    /// Restrict the dependency to a single id; `None` covers the kind.
    pub id: Option<String>,
    /// The dependency kind.
    pub kind: InputKind,
}

impl Input {
    /// An input on a typed kind in its default namespace.
    #[must_use]
    pub fn new<S: ResourceSpec>(kind: InputKind) -> Self {
        Self {
            namespace: S::NAMESPACE.to_string(),
            type_name: S::TYPE.to_string(),
            id: None,
            kind,
        }
    }

    /// An input on an explicit `(namespace, type_name)`.
    pub fn named(
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        kind: InputKind,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
            id: None,
            kind,
        }
    }

    /// Rehome the input into another namespace.
    #[must_use]
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Pin the input to a single id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The kind this input watches.
    #[must_use]
    pub fn watched_kind(&self) -> corral_core::Kind {
        corral_core::Kind::new(&*self.namespace, &*self.type_name)
    }

    /// Whether the input covers the pointed-at resource.
    #[must_use]
    pub fn covers(&self, ptr: &Pointer) -> bool {
        self.namespace == ptr.namespace
            && self.type_name == ptr.type_name
            && self.id.as_deref().map(|id| id == ptr.id).unwrap_or(true)
    }

    /// Whether the input covers the whole kind (no pinned id).
    #[must_use]
    pub fn covers_kind(&self, kind: &corral_core::Kind) -> bool {
        self.id.is_none() && self.namespace == kind.namespace && self.type_name == kind.type_name
    }
}

impl Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}/{}", self.namespace, self.type_name, id),
            None => write!(f, "{}/{}", self.namespace, self.type_name),
        }
    }
}

/// Whether an output type is writable by one controller or by many.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputKind {
    /// Exactly one controller writes resources of this type.
    Exclusive,
    /// Several controllers write resources of this type, each only the
    /// resources it created.
    Shared,
}

/// A declared output type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Output {
    /// The written resource type.
    pub type_name: String,
    /// Exclusive or shared ownership of the type.
    pub kind: OutputKind,
}

impl Output {
    /// An exclusive output of a typed kind.
    #[must_use]
    pub fn exclusive<S: ResourceSpec>() -> Self {
        Self {
            type_name: S::TYPE.to_string(),
            kind: OutputKind::Exclusive,
        }
    }

    /// A shared output of a typed kind.
    #[must_use]
    pub fn shared<S: ResourceSpec>() -> Self {
        Self {
            type_name: S::TYPE.to_string(),
            kind: OutputKind::Shared,
        }
    }

    /// An output on an explicit type name.
    pub fn named(type_name: impl Into<String>, kind: OutputKind) -> Self {
        Self {
            type_name: type_name.into(),
            kind,
        }
    }
}

/// A full-reconcile controller.
///
/// The runtime wakes the controller's `run` loop on any relevant change;
/// each wake coalesces arbitrarily many changes, so the controller lists
/// its inputs and reconciles them all.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// The unique controller name; stamped as owner on every write.
    fn name(&self) -> &str;

    /// The declared inputs.
    fn inputs(&self) -> Vec<Input>;

    /// The declared outputs.
    fn outputs(&self) -> Vec<Output>;

    /// The controller body. Runs until error; the runtime restarts it with
    /// exponential backoff.
    async fn run(&self, rt: &FullRuntime) -> Result<()>;
}

/// Settings returned by [`QController::settings`].
#[derive(Clone, Debug)]
pub struct QSettings {
    /// The declared inputs.
    pub inputs: Vec<Input>,
    /// The declared outputs.
    pub outputs: Vec<Output>,
    /// Number of concurrent reconcile workers.
    pub concurrency: usize,
    /// Whether the controller provides a long-running
    /// [`QController::run_hook`].
    pub run_hook: bool,
    /// Whether the controller provides a [`QController::shutdown_hook`].
    pub shutdown_hook: bool,
}

impl QSettings {
    /// Settings with the given declarations and default concurrency of 1.
    #[must_use]
    pub fn new(inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        Self {
            inputs,
            outputs,
            concurrency: 1,
            run_hook: false,
            shutdown_hook: false,
        }
    }

    /// Set the worker concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Declare the run hook.
    #[must_use]
    pub fn with_run_hook(mut self) -> Self {
        self.run_hook = true;
        self
    }

    /// Declare the shutdown hook.
    #[must_use]
    pub fn with_shutdown_hook(mut self) -> Self {
        self.shutdown_hook = true;
        self
    }
}

/// A queue-based controller: reconciliation is per-item.
#[async_trait]
pub trait QController: Send + Sync + 'static {
    /// The unique controller name; stamped as owner on every write.
    fn name(&self) -> &str;

    /// Input/output declarations and scheduling settings.
    fn settings(&self) -> QSettings;

    /// Reconcile a single primary item.
    async fn reconcile(&self, rt: &QRuntime, ptr: &Pointer) -> Result<()>;

    /// Map a secondary-input pointer to the primary items it affects.
    async fn map_input(&self, rt: &QRuntime, ptr: &Pointer) -> Result<Vec<Pointer>>;

    /// Optional long-running background task, restarted with backoff when
    /// it returns. Only spawned when [`QSettings::run_hook`] is set.
    async fn run_hook(&self, rt: &QRuntime) -> Result<()> {
        let _ = rt;
        Ok(())
    }

    /// Invoked once after all workers exit. Only called when
    /// [`QSettings::shutdown_hook`] is set.
    async fn shutdown_hook(&self, rt: &QRuntime) {
        let _ = rt;
    }
}

pub(crate) fn sorted(mut inputs: Vec<Input>) -> Vec<Input> {
    inputs.sort();
    inputs
}
