//! Compact metadata projection used for event deduplication and filters

use corral_core::{Metadata, Phase, Pointer};
use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// The subset of resource metadata that matters for waking controllers.
///
/// Watch events that differ only in fields outside this projection (spec,
/// version, timestamps) coalesce into one trigger.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReducedMetadata {
    /// Namespace of the changed resource.
    pub namespace: String,
    /// Type name of the changed resource.
    pub type_name: String,
    /// Id of the changed resource.
    pub id: String,
    /// Lifecycle phase at event time.
    pub phase: Phase,
    /// Whether the finalizer set was empty at event time.
    pub finalizers_empty: bool,
    /// Labels at event time.
    pub labels: BTreeMap<String, String>,
}

impl ReducedMetadata {
    /// The pointer to the changed resource.
    #[must_use]
    pub fn pointer(&self) -> Pointer {
        Pointer {
            namespace: self.namespace.clone(),
            type_name: self.type_name.clone(),
            id: self.id.clone(),
        }
    }

    /// The destroy-ready watch filter: tearing down with no finalizers.
    #[must_use]
    pub fn destroy_ready(&self) -> bool {
        self.phase == Phase::TearingDown && self.finalizers_empty
    }
}

impl From<&Metadata> for ReducedMetadata {
    fn from(md: &Metadata) -> Self {
        Self {
            namespace: md.namespace.clone(),
            type_name: md.type_name.clone(),
            id: md.id.clone(),
            phase: md.phase,
            finalizers_empty: md.finalizers.is_empty(),
            labels: md.labels.clone(),
        }
    }
}

impl Display for ReducedMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.namespace, self.type_name, self.id, self.phase
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::Metadata;

    #[test]
    fn version_changes_coalesce() {
        let mut md = Metadata::new("ns", "T", "x");
        let a = ReducedMetadata::from(&md);
        md.version = 42;
        let b = ReducedMetadata::from(&md);
        assert_eq!(a, b);
    }

    #[test]
    fn phase_and_finalizer_changes_do_not_coalesce() {
        let mut md = Metadata::new("ns", "T", "x");
        let a = ReducedMetadata::from(&md);
        md.add_finalizer("fin");
        let b = ReducedMetadata::from(&md);
        assert_ne!(a, b);

        md.phase = Phase::TearingDown;
        let c = ReducedMetadata::from(&md);
        assert_ne!(b, c);
        assert!(!c.destroy_ready());

        md.remove_finalizer("fin");
        let d = ReducedMetadata::from(&md);
        assert!(d.destroy_ready());
    }
}
