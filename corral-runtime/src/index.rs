//! Bidirectional dependency index
//!
//! Maps `(namespace, type, id?)` to the controllers watching it and tracks
//! output ownership per type. All operations are thread-safe behind a
//! single mutex; mutating operations either fully apply or fully fail with
//! a structured error naming the conflicting party.

use crate::{
    controller::{Input, InputKind, Output, OutputKind},
    error::{Error, Result},
};
use ahash::AHashMap;
use parking_lot::Mutex;

/// Which edge a graph entry represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeLabel {
    /// Controller exclusively owns the output type.
    OutputExclusive,
    /// Controller shares the output type.
    OutputShared,
    /// Weak input dependency.
    InputWeak,
    /// Strong input dependency.
    InputStrong,
    /// Destroy-ready input dependency.
    InputDestroyReady,
    /// Queue-primary input dependency.
    InputQPrimary,
    /// Queue-mapped input dependency.
    InputQMapped,
    /// Queue-mapped destroy-ready input dependency.
    InputQMappedDestroyReady,
}

impl From<InputKind> for EdgeLabel {
    fn from(kind: InputKind) -> Self {
        match kind {
            InputKind::Weak => EdgeLabel::InputWeak,
            InputKind::Strong => EdgeLabel::InputStrong,
            InputKind::DestroyReady => EdgeLabel::InputDestroyReady,
            InputKind::QPrimary => EdgeLabel::InputQPrimary,
            InputKind::QMapped => EdgeLabel::InputQMapped,
            InputKind::QMappedDestroyReady => EdgeLabel::InputQMappedDestroyReady,
        }
    }
}

/// A single edge of the exported dependency graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphEdge {
    /// The controller at one end of the edge.
    pub controller: String,
    /// Namespace of the resource end; `None` for outputs (type-scoped).
    pub namespace: Option<String>,
    /// Resource type of the resource end.
    pub type_name: String,
    /// Pinned id, when the input names a single resource.
    pub id: Option<String>,
    /// The edge label.
    pub label: EdgeLabel,
}

/// The exported directed dependency graph.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    /// All edges, outputs first, then inputs.
    pub edges: Vec<GraphEdge>,
}

#[derive(Clone, Debug)]
enum Ownership {
    Exclusive(String),
    Shared(Vec<String>),
}

impl Ownership {
    fn holders(&self) -> String {
        match self {
            Ownership::Exclusive(name) => name.clone(),
            Ownership::Shared(names) => names.join(","),
        }
    }
}

#[derive(Default)]
struct IndexInner {
    outputs: AHashMap<String, Ownership>,
    wildcard: AHashMap<(String, String), Vec<(String, InputKind)>>,
    pinned: AHashMap<(String, String, String), Vec<(String, InputKind)>>,
}

/// The in-memory dependency index.
#[derive(Default)]
pub struct DependencyIndex {
    inner: Mutex<IndexInner>,
}

impl DependencyIndex {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output declaration.
    ///
    /// Fails if the type is exclusively owned by a different controller,
    /// if a shared type is re-registered exclusively (or vice versa), or
    /// if the same `(controller, type)` pair is registered twice.
    pub fn add_output(&self, controller: &str, output: &Output) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.outputs.get_mut(&output.type_name) {
            None => {
                let ownership = match output.kind {
                    OutputKind::Exclusive => Ownership::Exclusive(controller.to_string()),
                    OutputKind::Shared => Ownership::Shared(vec![controller.to_string()]),
                };
                inner.outputs.insert(output.type_name.clone(), ownership);
                Ok(())
            }
            Some(Ownership::Shared(holders)) if output.kind == OutputKind::Shared => {
                if holders.iter().any(|h| h == controller) {
                    return Err(Error::DuplicateOutput {
                        controller: controller.to_string(),
                        type_name: output.type_name.clone(),
                    });
                }
                holders.push(controller.to_string());
                Ok(())
            }
            Some(existing) => Err(Error::OutputConflict {
                type_name: output.type_name.clone(),
                existing: existing.holders(),
                requested: controller.to_string(),
            }),
        }
    }

    /// Register an input declaration; duplicates (same
    /// `(namespace, type, id?)` for the same controller) are rejected.
    pub fn add_input(&self, controller: &str, input: &Input) -> Result<()> {
        let mut inner = self.inner.lock();
        let entries = match &input.id {
            None => inner
                .wildcard
                .entry((input.namespace.clone(), input.type_name.clone()))
                .or_default(),
            Some(id) => inner
                .pinned
                .entry((input.namespace.clone(), input.type_name.clone(), id.clone()))
                .or_default(),
        };
        if entries.iter().any(|(name, _)| name == controller) {
            return Err(Error::DuplicateInput {
                controller: controller.to_string(),
                input: input.to_string(),
            });
        }
        entries.push((controller.to_string(), input.kind));
        Ok(())
    }

    /// Unregister an output; used to roll back a partially-failed
    /// controller registration.
    pub(crate) fn remove_output(&self, controller: &str, output: &Output) {
        let mut inner = self.inner.lock();
        match inner.outputs.get_mut(&output.type_name) {
            Some(Ownership::Exclusive(name)) if name == controller => {
                inner.outputs.remove(&output.type_name);
            }
            Some(Ownership::Shared(holders)) => {
                holders.retain(|name| name != controller);
                if holders.is_empty() {
                    inner.outputs.remove(&output.type_name);
                }
            }
            _ => {}
        }
    }

    /// Remove an input declaration.
    pub fn delete_input(&self, controller: &str, input: &Input) -> Result<()> {
        let mut inner = self.inner.lock();
        let entries = match &input.id {
            None => inner
                .wildcard
                .get_mut(&(input.namespace.clone(), input.type_name.clone())),
            Some(id) => inner.pinned.get_mut(&(
                input.namespace.clone(),
                input.type_name.clone(),
                id.clone(),
            )),
        };
        let missing = || Error::UnknownInput {
            controller: controller.to_string(),
            input: input.to_string(),
        };
        let entries = entries.ok_or_else(missing)?;
        let before = entries.len();
        entries.retain(|(name, _)| name != controller);
        if entries.len() == before {
            return Err(missing());
        }
        Ok(())
    }

    /// The controllers depending on a resource event, each at most once.
    #[must_use]
    pub fn dependent_controllers(&self, namespace: &str, type_name: &str, id: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut dependents: Vec<String> = Vec::new();
        let wildcard_key = (namespace.to_string(), type_name.to_string());
        let pinned_key = (namespace.to_string(), type_name.to_string(), id.to_string());
        for (name, _) in inner
            .wildcard
            .get(&wildcard_key)
            .into_iter()
            .flatten()
            .chain(inner.pinned.get(&pinned_key).into_iter().flatten())
        {
            if !dependents.iter().any(|d| d == name) {
                dependents.push(name.clone());
            }
        }
        dependents
    }

    /// The controller exclusively owning the output type, if any.
    #[must_use]
    pub fn exclusive_owner(&self, type_name: &str) -> Option<String> {
        let inner = self.inner.lock();
        match inner.outputs.get(type_name) {
            Some(Ownership::Exclusive(name)) => Some(name.clone()),
            _ => None,
        }
    }

    /// Export the current graph.
    #[must_use]
    pub fn export(&self) -> DependencyGraph {
        let inner = self.inner.lock();
        let mut edges = Vec::new();
        for (type_name, ownership) in &inner.outputs {
            match ownership {
                Ownership::Exclusive(name) => edges.push(GraphEdge {
                    controller: name.clone(),
                    namespace: None,
                    type_name: type_name.clone(),
                    id: None,
                    label: EdgeLabel::OutputExclusive,
                }),
                Ownership::Shared(names) => {
                    for name in names {
                        edges.push(GraphEdge {
                            controller: name.clone(),
                            namespace: None,
                            type_name: type_name.clone(),
                            id: None,
                            label: EdgeLabel::OutputShared,
                        });
                    }
                }
            }
        }
        for ((namespace, type_name), entries) in &inner.wildcard {
            for (name, kind) in entries {
                edges.push(GraphEdge {
                    controller: name.clone(),
                    namespace: Some(namespace.clone()),
                    type_name: type_name.clone(),
                    id: None,
                    label: EdgeLabel::from(*kind),
                });
            }
        }
        for ((namespace, type_name, id), entries) in &inner.pinned {
            for (name, kind) in entries {
                edges.push(GraphEdge {
                    controller: name.clone(),
                    namespace: Some(namespace.clone()),
                    type_name: type_name.clone(),
                    id: Some(id.clone()),
                    label: EdgeLabel::from(*kind),
                });
            }
        }
        DependencyGraph { edges }
    }
}
