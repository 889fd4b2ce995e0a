//! Typed references to resources and resource kinds

use crate::resource::ResourceSpec;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A reference to a single resource instance.
///
/// `(namespace, type_name, id)` uniquely identifies a resource in the state
/// store. Pointers are cheap to clone and are used as map keys throughout
/// the runtime.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pointer {
    /// The namespace the resource lives in.
    pub namespace: String,
    /// The resource type name.
    pub type_name: String,
    /// The resource id, unique within `(namespace, type_name)`.
    pub id: String,
}

impl Pointer {
    /// Create a pointer from its parts.
    pub fn new(
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    /// Create a pointer to a typed resource in its default namespace.
    pub fn of<S: ResourceSpec>(id: impl Into<String>) -> Self {
        Self::new(S::NAMESPACE, S::TYPE, id)
    }

    /// The kind this pointer belongs to.
    #[must_use]
    pub fn kind(&self) -> Kind {
        Kind {
            namespace: self.namespace.clone(),
            type_name: self.type_name.clone(),
        }
    }

    /// Rehome the pointer into another namespace.
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }
}

impl Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.type_name, self.id)
    }
}

/// A resource kind: the unit of watch registration and cache configuration.
///
/// Kind identity is `(type_name, namespace)`; a kind-watch observes every
/// resource of the type within the namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Kind {
    /// The namespace.
    pub namespace: String,
    /// The resource type name.
    pub type_name: String,
}

impl Kind {
    /// Create a kind from its parts.
    pub fn new(namespace: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
        }
    }

    /// The kind of a typed resource in its default namespace.
    #[must_use]
    pub fn of<S: ResourceSpec>() -> Self {
        Self::new(S::NAMESPACE, S::TYPE)
    }

    /// Point at a specific resource of this kind.
    #[must_use]
    pub fn pointer(&self, id: impl Into<String>) -> Pointer {
        Pointer {
            namespace: self.namespace.clone(),
            type_name: self.type_name.clone(),
            id: id.into(),
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.type_name)
    }
}

impl From<Pointer> for Kind {
    fn from(ptr: Pointer) -> Self {
        Self {
            namespace: ptr.namespace,
            type_name: ptr.type_name,
        }
    }
}
