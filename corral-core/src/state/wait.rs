//! Waits for resources to reach desired states

use crate::{
    error::{Error, Result},
    metadata::Phase,
    pointer::Pointer,
    resource::DynamicResource,
    state::{Event, State, WatchOptions},
};
use tokio::sync::mpsc;

/// A condition over the observed state of a single resource.
///
/// The condition is passed `Some` when the resource exists, `None` when it
/// does not (yet, or anymore). Auto-implemented for plain closures.
pub trait Condition {
    /// Whether the condition holds for the observed state.
    fn matches(&self, resource: Option<&DynamicResource>) -> bool;

    /// A condition that holds when `self` does not.
    fn not(self) -> conditions::Not<Self>
    where
        Self: Sized,
    {
        conditions::Not(self)
    }

    /// A condition that holds when both `self` and `other` do.
    fn and<Other: Condition>(self, other: Other) -> conditions::And<Self, Other>
    where
        Self: Sized,
    {
        conditions::And(self, other)
    }
}

impl<F: Fn(Option<&DynamicResource>) -> bool> Condition for F {
    fn matches(&self, resource: Option<&DynamicResource>) -> bool {
        self(resource)
    }
}

/// Watch a resource until `cond` holds, returning the state that satisfied
/// it (`None` for conditions that hold on absence).
///
/// The caller supplies any timeout by wrapping this in
/// [`tokio::time::timeout`].
pub async fn watch_for(
    state: &dyn State,
    ptr: &Pointer,
    cond: impl Condition,
) -> Result<Option<DynamicResource>> {
    let (tx, mut rx) = mpsc::channel(16);
    state.watch(ptr, tx, WatchOptions::bootstrapped()).await?;

    // The bootstrap snapshot arrives first, so the condition is never
    // evaluated against pre-watch emptiness.
    let mut current: Option<DynamicResource> = None;
    loop {
        match rx.recv().await {
            Some(Event::Bootstrapped(snapshot)) => {
                current = snapshot.into_iter().find(|r| r.pointer() == *ptr);
            }
            Some(Event::Created(res)) => current = Some(res),
            Some(Event::Updated { new, .. }) => current = Some(*new),
            Some(Event::Destroyed(_)) => current = None,
            Some(Event::Errored(msg)) => return Err(Error::Other(anyhow::anyhow!(msg))),
            None => return Err(Error::Cancelled),
        }
        if cond.matches(current.as_ref()) {
            return Ok(current);
        }
    }
}

/// Stock conditions for [`watch_for`].
pub mod conditions {
    use super::Condition;
    use crate::{metadata::Phase, resource::DynamicResource};

    /// Holds once the resource exists.
    #[must_use]
    pub fn exists() -> impl Condition {
        |res: Option<&DynamicResource>| res.is_some()
    }

    /// Holds once the resource does not exist.
    #[must_use]
    pub fn destroyed() -> impl Condition {
        |res: Option<&DynamicResource>| res.is_none()
    }

    /// Holds once the resource is in the given phase.
    #[must_use]
    pub fn in_phase(phase: Phase) -> impl Condition {
        move |res: Option<&DynamicResource>| {
            res.map(|r| r.metadata.phase == phase).unwrap_or(false)
        }
    }

    /// Holds once the resource is tearing down with no finalizers.
    #[must_use]
    pub fn destroy_ready() -> impl Condition {
        |res: Option<&DynamicResource>| res.map(|r| r.metadata.destroy_ready()).unwrap_or(false)
    }

    /// Holds once the resource version reaches `version`.
    #[must_use]
    pub fn version_at_least(version: u64) -> impl Condition {
        move |res: Option<&DynamicResource>| {
            res.map(|r| r.metadata.version >= version).unwrap_or(false)
        }
    }

    /// See [`Condition::not`].
    pub struct Not<A>(pub(super) A);

    impl<A: Condition> Condition for Not<A> {
        fn matches(&self, resource: Option<&DynamicResource>) -> bool {
            !self.0.matches(resource)
        }
    }

    /// See [`Condition::and`].
    pub struct And<A, B>(pub(super) A, pub(super) B);

    impl<A: Condition, B: Condition> Condition for And<A, B> {
        fn matches(&self, resource: Option<&DynamicResource>) -> bool {
            self.0.matches(resource) && self.1.matches(resource)
        }
    }
}

/// Watch a resource until it reaches the tearing-down phase.
pub async fn watch_for_teardown(state: &dyn State, ptr: &Pointer) -> Result<Option<DynamicResource>> {
    watch_for(state, ptr, conditions::in_phase(Phase::TearingDown)).await
}
