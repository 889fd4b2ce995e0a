//! The strictly-defined resource metadata header

use crate::pointer::{Kind, Pointer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Resource lifecycle phase.
///
/// The phase is monotonic: a resource that reached [`Phase::TearingDown`]
/// never transitions back to [`Phase::Running`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The resource is live.
    Running,
    /// Teardown was requested; the resource stays visible until destroyed.
    TearingDown,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => f.write_str("running"),
            Phase::TearingDown => f.write_str("tearing-down"),
        }
    }
}

/// Resource metadata.
///
/// Every resource carries this header; the spec payload is opaque to the
/// runtime. `version` is issued by the store and strictly increases with
/// every mutation of the resource, supporting optimistic concurrency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Resource type name.
    pub type_name: String,
    /// Resource id, unique within `(namespace, type_name)`.
    pub id: String,
    /// Store-issued version; 0 means the resource was never persisted.
    pub version: u64,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Name of the controller that owns the resource; empty means unowned.
    pub owner: String,
    /// Ordered set of finalizers blocking destruction.
    pub finalizers: Vec<String>,
    /// Resource labels.
    pub labels: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last-mutation timestamp.
    pub updated: DateTime<Utc>,
}

impl Metadata {
    /// Fresh metadata for a resource that was not persisted yet.
    pub fn new(
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
            id: id.into(),
            version: 0,
            phase: Phase::Running,
            owner: String::new(),
            finalizers: Vec::new(),
            labels: BTreeMap::new(),
            created: now,
            updated: now,
        }
    }

    /// The pointer identifying this resource.
    #[must_use]
    pub fn pointer(&self) -> Pointer {
        Pointer {
            namespace: self.namespace.clone(),
            type_name: self.type_name.clone(),
            id: self.id.clone(),
        }
    }

    /// The kind this resource belongs to.
    #[must_use]
    pub fn kind(&self) -> Kind {
        Kind {
            namespace: self.namespace.clone(),
            type_name: self.type_name.clone(),
        }
    }

    /// Add a finalizer; returns `false` if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove a finalizer; returns `false` if it was not present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    /// Whether the finalizer is present.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Whether destruction is no longer blocked by finalizers.
    #[must_use]
    pub fn finalizers_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    /// A resource is destroy-ready once it is tearing down with no finalizers.
    #[must_use]
    pub fn destroy_ready(&self) -> bool {
        self.phase == Phase::TearingDown && self.finalizers.is_empty()
    }

    /// Set a label, replacing any previous value.
    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}
