//! The state-store contract consumed by the controller runtime
//!
//! Any backend (in-memory, embedded on-disk, remote) implements [`State`];
//! the runtime only ever talks through this trait. Watch sinks are bounded
//! [`tokio::sync::mpsc`] senders supplied by the caller; backends must
//! deliver events in per-resource order and never drop them (a failing
//! watch emits [`Event::Errored`] and ends).

use crate::{
    error::Result,
    labels::Selector,
    pointer::{Kind, Pointer},
    resource::DynamicResource,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod mem;
pub mod wait;

/// A change observed on the store.
#[derive(Clone, Debug)]
pub enum Event {
    /// A resource was created.
    Created(DynamicResource),
    /// A resource was mutated (update, teardown, finalizer change).
    Updated {
        /// The resource before the mutation.
        old: Box<DynamicResource>,
        /// The resource after the mutation.
        new: Box<DynamicResource>,
    },
    /// A resource was destroyed; carries its last state.
    Destroyed(DynamicResource),
    /// Initial snapshot delivered before the live tail when the watch was
    /// opened with [`WatchOptions::bootstrap`].
    Bootstrapped(Vec<DynamicResource>),
    /// The watch failed; no further events follow.
    Errored(String),
}

impl Event {
    /// The current state carried by the event, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&DynamicResource> {
        match self {
            Event::Created(res) | Event::Destroyed(res) => Some(res),
            Event::Updated { new, .. } => Some(new),
            Event::Bootstrapped(_) | Event::Errored(_) => None,
        }
    }
}

/// Options for [`State::get`].
#[derive(Clone, Debug, Default)]
pub struct GetOptions {}

/// Options for [`State::list`].
///
/// The query language is exact kind plus optional id plus label predicates.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Restrict the listing to a single id.
    pub id: Option<String>,
    /// Label predicates each returned resource must satisfy.
    pub selector: Option<Selector>,
}

impl ListOptions {
    /// Restrict the listing to resources matching the selector.
    #[must_use]
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Restrict the listing to a single id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Whether a resource satisfies the id and label predicates.
    #[must_use]
    pub fn matches(&self, resource: &DynamicResource) -> bool {
        if let Some(id) = &self.id {
            if resource.metadata.id != *id {
                return false;
            }
        }
        if let Some(selector) = &self.selector {
            if !selector.matches(&resource.metadata.labels) {
                return false;
            }
        }
        true
    }
}

/// Options for [`State::create`].
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Owner stamped on the created resource; empty leaves it unowned.
    pub owner: String,
}

/// Options for [`State::update`].
#[derive(Clone, Debug, Default)]
pub struct UpdateOptions {
    /// The writer; must match the resource owner.
    pub owner: String,
    /// Version precondition; defaults to the submitted resource's version.
    pub expected_version: Option<u64>,
}

/// Options for [`State::teardown`].
#[derive(Clone, Debug, Default)]
pub struct TeardownOptions {
    /// The writer; must match the resource owner.
    pub owner: String,
}

/// Options for [`State::destroy`].
#[derive(Clone, Debug, Default)]
pub struct DestroyOptions {
    /// The writer; must match the resource owner.
    pub owner: String,
}

/// Options for [`State::watch`] and [`State::watch_kind`].
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    /// Deliver a [`Event::Bootstrapped`] snapshot before the live tail.
    pub bootstrap: bool,
}

impl WatchOptions {
    /// Request a bootstrap snapshot.
    #[must_use]
    pub fn bootstrapped() -> Self {
        Self { bootstrap: true }
    }
}

/// The state-store interface.
#[async_trait]
pub trait State: Send + Sync + 'static {
    /// Fetch a single resource.
    async fn get(&self, ptr: &Pointer, opts: GetOptions) -> Result<DynamicResource>;

    /// List resources of a kind.
    async fn list(&self, kind: &Kind, opts: ListOptions) -> Result<Vec<DynamicResource>>;

    /// Persist a new resource, returning it with the stamped metadata.
    async fn create(&self, resource: DynamicResource, opts: CreateOptions)
        -> Result<DynamicResource>;

    /// Replace an existing resource under a version precondition.
    async fn update(&self, resource: DynamicResource, opts: UpdateOptions)
        -> Result<DynamicResource>;

    /// Flip the resource into the tearing-down phase; idempotent. Returns
    /// whether the resource is destroy-ready (no finalizers left).
    async fn teardown(&self, ptr: &Pointer, opts: TeardownOptions) -> Result<bool>;

    /// Remove a destroy-ready resource.
    async fn destroy(&self, ptr: &Pointer, opts: DestroyOptions) -> Result<()>;

    /// Add finalizers to a resource (set semantics).
    async fn add_finalizers(&self, ptr: &Pointer, finalizers: &[&str]) -> Result<()>;

    /// Remove finalizers from a resource; absent finalizers are ignored.
    async fn remove_finalizers(&self, ptr: &Pointer, finalizers: &[&str]) -> Result<()>;

    /// Watch a single resource.
    async fn watch(&self, ptr: &Pointer, sink: mpsc::Sender<Event>, opts: WatchOptions)
        -> Result<()>;

    /// Watch every resource of a kind.
    async fn watch_kind(
        &self,
        kind: &Kind,
        sink: mpsc::Sender<Event>,
        opts: WatchOptions,
    ) -> Result<()>;
}
