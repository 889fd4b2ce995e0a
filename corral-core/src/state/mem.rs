//! In-memory reference state backend
//!
//! Backs the test suites and embedders that want a process-local store.
//! Mutations publish events to per-subscriber unbounded buffers while the
//! lock is held, so every subscriber observes the same per-kind order; a
//! forwarder task drains each buffer into the caller's bounded sink.

use crate::{
    error::{Error, Result},
    metadata::Phase,
    pointer::{Kind, Pointer},
    resource::DynamicResource,
    state::{
        CreateOptions, DestroyOptions, Event, GetOptions, ListOptions, State, TeardownOptions,
        UpdateOptions, WatchOptions,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::mpsc;

/// An in-memory [`State`] implementation.
///
/// Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MemState {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    resources: BTreeMap<Kind, BTreeMap<String, DynamicResource>>,
    subscribers: HashMap<Kind, Vec<Subscriber>>,
    next_version: u64,
}

struct Subscriber {
    tx: mpsc::UnboundedSender<Event>,
    id: Option<String>,
}

impl Subscriber {
    fn wants(&self, id: &str) -> bool {
        self.id.as_deref().map(|want| want == id).unwrap_or(true)
    }
}

impl Inner {
    fn issue_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn publish(&mut self, kind: &Kind, id: &str, event: &Event) {
        if let Some(subs) = self.subscribers.get_mut(kind) {
            subs.retain(|sub| !sub.wants(id) || sub.tx.send(event.clone()).is_ok());
        }
    }

    fn get(&self, ptr: &Pointer) -> Result<&DynamicResource> {
        self.resources
            .get(&ptr.kind())
            .and_then(|by_id| by_id.get(&ptr.id))
            .ok_or_else(|| Error::NotFound(ptr.clone()))
    }
}

impl MemState {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn subscribe(
        &self,
        kind: &Kind,
        id: Option<String>,
        sink: mpsc::Sender<Event>,
        opts: WatchOptions,
    ) {
        let (utx, mut urx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            if opts.bootstrap {
                let snapshot = inner
                    .resources
                    .get(kind)
                    .map(|by_id| {
                        by_id
                            .values()
                            .filter(|res| {
                                id.as_deref()
                                    .map(|want| res.metadata.id == want)
                                    .unwrap_or(true)
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                // Queued ahead of registration, so the snapshot precedes
                // every live event.
                let _ = utx.send(Event::Bootstrapped(snapshot));
            }
            inner
                .subscribers
                .entry(kind.clone())
                .or_default()
                .push(Subscriber { tx: utx, id });
        }
        tokio::spawn(async move {
            while let Some(event) = urx.recv().await {
                if sink.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl State for MemState {
    async fn get(&self, ptr: &Pointer, _opts: GetOptions) -> Result<DynamicResource> {
        let inner = self.inner.lock();
        inner.get(ptr).cloned()
    }

    async fn list(&self, kind: &Kind, opts: ListOptions) -> Result<Vec<DynamicResource>> {
        let inner = self.inner.lock();
        Ok(inner
            .resources
            .get(kind)
            .map(|by_id| {
                by_id
                    .values()
                    .filter(|res| opts.matches(res))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(
        &self,
        mut resource: DynamicResource,
        opts: CreateOptions,
    ) -> Result<DynamicResource> {
        let mut inner = self.inner.lock();
        let ptr = resource.pointer();
        let kind = ptr.kind();
        if inner.get(&ptr).is_ok() {
            return Err(Error::AlreadyExists(ptr));
        }
        let now = Utc::now();
        resource.metadata.version = inner.issue_version();
        resource.metadata.phase = Phase::Running;
        resource.metadata.owner = opts.owner;
        resource.metadata.created = now;
        resource.metadata.updated = now;
        inner
            .resources
            .entry(kind.clone())
            .or_default()
            .insert(ptr.id.clone(), resource.clone());
        tracing::trace!(resource = %ptr, version = resource.metadata.version, "created");
        inner.publish(&kind, &ptr.id, &Event::Created(resource.clone()));
        Ok(resource)
    }

    async fn update(
        &self,
        mut resource: DynamicResource,
        opts: UpdateOptions,
    ) -> Result<DynamicResource> {
        let mut inner = self.inner.lock();
        let ptr = resource.pointer();
        let kind = ptr.kind();
        let current = inner.get(&ptr)?.clone();
        if current.metadata.owner != opts.owner {
            return Err(Error::OwnerConflict {
                pointer: ptr,
                owner: current.metadata.owner,
                attempted: opts.owner,
            });
        }
        let expected = opts.expected_version.unwrap_or(resource.metadata.version);
        if current.metadata.version != expected {
            return Err(Error::VersionConflict {
                pointer: ptr,
                expected,
                found: current.metadata.version,
            });
        }
        if current.metadata.phase == Phase::TearingDown
            && resource.metadata.phase == Phase::Running
        {
            return Err(Error::PhaseConflict {
                pointer: ptr,
                phase: current.metadata.phase,
            });
        }
        resource.metadata.version = inner.issue_version();
        resource.metadata.phase = current.metadata.phase;
        resource.metadata.owner = current.metadata.owner.clone();
        resource.metadata.created = current.metadata.created;
        resource.metadata.updated = Utc::now();
        inner
            .resources
            .entry(kind.clone())
            .or_default()
            .insert(ptr.id.clone(), resource.clone());
        inner.publish(&kind, &ptr.id, &Event::Updated {
            old: Box::new(current),
            new: Box::new(resource.clone()),
        });
        Ok(resource)
    }

    async fn teardown(&self, ptr: &Pointer, opts: TeardownOptions) -> Result<bool> {
        let mut inner = self.inner.lock();
        let kind = ptr.kind();
        let current = inner.get(ptr)?.clone();
        if current.metadata.owner != opts.owner {
            return Err(Error::OwnerConflict {
                pointer: ptr.clone(),
                owner: current.metadata.owner,
                attempted: opts.owner,
            });
        }
        if current.metadata.phase == Phase::TearingDown {
            return Ok(current.metadata.finalizers_empty());
        }
        let mut torn = current.clone();
        torn.metadata.phase = Phase::TearingDown;
        torn.metadata.version = inner.issue_version();
        torn.metadata.updated = Utc::now();
        inner
            .resources
            .entry(kind.clone())
            .or_default()
            .insert(ptr.id.clone(), torn.clone());
        let ready = torn.metadata.finalizers_empty();
        inner.publish(&kind, &ptr.id, &Event::Updated {
            old: Box::new(current),
            new: Box::new(torn),
        });
        Ok(ready)
    }

    async fn destroy(&self, ptr: &Pointer, opts: DestroyOptions) -> Result<()> {
        let mut inner = self.inner.lock();
        let kind = ptr.kind();
        let current = inner.get(ptr)?.clone();
        if current.metadata.owner != opts.owner {
            return Err(Error::OwnerConflict {
                pointer: ptr.clone(),
                owner: current.metadata.owner,
                attempted: opts.owner,
            });
        }
        if current.metadata.phase != Phase::TearingDown {
            return Err(Error::PhaseConflict {
                pointer: ptr.clone(),
                phase: current.metadata.phase,
            });
        }
        if !current.metadata.finalizers_empty() {
            return Err(Error::PendingFinalizers(ptr.clone()));
        }
        if let Some(by_id) = inner.resources.get_mut(&kind) {
            by_id.remove(&ptr.id);
        }
        tracing::trace!(resource = %ptr, "destroyed");
        inner.publish(&kind, &ptr.id, &Event::Destroyed(current));
        Ok(())
    }

    async fn add_finalizers(&self, ptr: &Pointer, finalizers: &[&str]) -> Result<()> {
        let mut inner = self.inner.lock();
        let kind = ptr.kind();
        let current = inner.get(ptr)?.clone();
        let mut next = current.clone();
        let mut changed = false;
        for finalizer in finalizers {
            changed |= next.metadata.add_finalizer(finalizer);
        }
        if !changed {
            return Ok(());
        }
        next.metadata.version = inner.issue_version();
        next.metadata.updated = Utc::now();
        inner
            .resources
            .entry(kind.clone())
            .or_default()
            .insert(ptr.id.clone(), next.clone());
        inner.publish(&kind, &ptr.id, &Event::Updated {
            old: Box::new(current),
            new: Box::new(next),
        });
        Ok(())
    }

    async fn remove_finalizers(&self, ptr: &Pointer, finalizers: &[&str]) -> Result<()> {
        let mut inner = self.inner.lock();
        let kind = ptr.kind();
        let current = inner.get(ptr)?.clone();
        let mut next = current.clone();
        let mut changed = false;
        for finalizer in finalizers {
            changed |= next.metadata.remove_finalizer(finalizer);
        }
        if !changed {
            return Ok(());
        }
        next.metadata.version = inner.issue_version();
        next.metadata.updated = Utc::now();
        inner
            .resources
            .entry(kind.clone())
            .or_default()
            .insert(ptr.id.clone(), next.clone());
        inner.publish(&kind, &ptr.id, &Event::Updated {
            old: Box::new(current),
            new: Box::new(next),
        });
        Ok(())
    }

    async fn watch(
        &self,
        ptr: &Pointer,
        sink: mpsc::Sender<Event>,
        opts: WatchOptions,
    ) -> Result<()> {
        self.subscribe(&ptr.kind(), Some(ptr.id.clone()), sink, opts)
            .await;
        Ok(())
    }

    async fn watch_kind(
        &self,
        kind: &Kind,
        sink: mpsc::Sender<Event>,
        opts: WatchOptions,
    ) -> Result<()> {
        self.subscribe(kind, None, sink, opts).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::wait::{conditions, watch_for};
    use serde_json::json;

    fn resource(id: &str, value: i64) -> DynamicResource {
        let mut res = DynamicResource::prototype(&Pointer::new("default", "IntegerResource", id));
        res.spec = json!({ "value": value });
        res
    }

    fn kind() -> Kind {
        Kind::new("default", "IntegerResource")
    }

    #[tokio::test]
    async fn versions_strictly_increase() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();
        assert!(created.metadata.version > 0);

        let mut next = created.clone();
        next.spec = json!({ "value": 2 });
        let updated = state.update(next, UpdateOptions::default()).await.unwrap();
        assert!(updated.metadata.version > created.metadata.version);

        let other = state
            .create(resource("two", 2), CreateOptions::default())
            .await
            .unwrap();
        assert!(other.metadata.version > updated.metadata.version);
    }

    #[tokio::test]
    async fn update_enforces_version_precondition() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();

        let mut stale = created.clone();
        stale.metadata.version = created.metadata.version + 10;
        let err = state
            .update(stale, UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn only_the_owner_may_write() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions {
                owner: "ctrl-a".into(),
            })
            .await
            .unwrap();

        let err = state
            .update(created.clone(), UpdateOptions {
                owner: "ctrl-b".into(),
                expected_version: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnerConflict { .. }));

        let err = state
            .destroy(&created.pointer(), DestroyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnerConflict { .. }));
    }

    #[tokio::test]
    async fn teardown_then_destroy() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();
        let ptr = created.pointer();

        state.add_finalizers(&ptr, &["fin"]).await.unwrap();
        let ready = state
            .teardown(&ptr, TeardownOptions::default())
            .await
            .unwrap();
        assert!(!ready);

        // Destruction is blocked until the finalizer clears.
        let err = state
            .destroy(&ptr, DestroyOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Teardown is idempotent.
        let ready = state
            .teardown(&ptr, TeardownOptions::default())
            .await
            .unwrap();
        assert!(!ready);

        state.remove_finalizers(&ptr, &["fin"]).await.unwrap();
        let ready = state
            .teardown(&ptr, TeardownOptions::default())
            .await
            .unwrap();
        assert!(ready);
        state
            .destroy(&ptr, DestroyOptions::default())
            .await
            .unwrap();
        let err = state.get(&ptr, GetOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn destroy_requires_teardown() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();
        let err = state
            .destroy(&created.pointer(), DestroyOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_phase_conflict());
    }

    #[tokio::test]
    async fn tearing_down_never_reverts() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();
        let ptr = created.pointer();
        state
            .teardown(&ptr, TeardownOptions::default())
            .await
            .unwrap();

        let mut revived = state.get(&ptr, GetOptions::default()).await.unwrap();
        revived.metadata.phase = Phase::Running;
        let err = state
            .update(revived, UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_phase_conflict());
    }

    #[tokio::test]
    async fn removing_an_absent_finalizer_is_a_success() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();
        let ptr = created.pointer();
        state.remove_finalizers(&ptr, &["never-added"]).await.unwrap();
        let after = state.get(&ptr, GetOptions::default()).await.unwrap();
        // No-op removal does not bump the version.
        assert_eq!(after.metadata.version, created.metadata.version);
    }

    #[tokio::test]
    async fn list_applies_label_selector_and_id() {
        use crate::labels::{Expression, Selector};
        let state = MemState::new();
        let mut labelled = resource("one", 1);
        labelled.metadata.set_label("app", "app1");
        state
            .create(labelled, CreateOptions::default())
            .await
            .unwrap();
        state
            .create(resource("two", 2), CreateOptions::default())
            .await
            .unwrap();

        let selector: Selector = Expression::Equal("app".into(), "app1".into()).into();
        let listed = state
            .list(&kind(), ListOptions::default().with_selector(selector))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.id, "one");

        let listed = state
            .list(&kind(), ListOptions::default().with_id("two"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.id, "two");
    }

    #[tokio::test]
    async fn watch_delivers_bootstrap_then_ordered_events() {
        let state = MemState::new();
        state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        state
            .watch_kind(&kind(), tx, WatchOptions::bootstrapped())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::Bootstrapped(snapshot) => assert_eq!(snapshot.len(), 1),
            other => panic!("expected bootstrap, got {other:?}"),
        }

        state
            .create(resource("two", 2), CreateOptions::default())
            .await
            .unwrap();
        let two = match rx.recv().await.unwrap() {
            Event::Created(res) => res,
            other => panic!("expected created, got {other:?}"),
        };
        assert_eq!(two.metadata.id, "two");

        let mut next = two.clone();
        next.spec = json!({ "value": 22 });
        state.update(next, UpdateOptions::default()).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::Updated { old, new } => {
                assert_eq!(old.metadata.version, two.metadata.version);
                assert!(new.metadata.version > old.metadata.version);
            }
            other => panic!("expected updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_for_observes_destroy_readiness() {
        let state = MemState::new();
        let created = state
            .create(resource("one", 1), CreateOptions::default())
            .await
            .unwrap();
        let ptr = created.pointer();
        state.add_finalizers(&ptr, &["fin"]).await.unwrap();
        state
            .teardown(&ptr, TeardownOptions::default())
            .await
            .unwrap();

        let waiter = {
            let state = state.clone();
            let ptr = ptr.clone();
            tokio::spawn(async move { watch_for(&state, &ptr, conditions::destroy_ready()).await })
        };
        state.remove_finalizers(&ptr, &["fin"]).await.unwrap();
        let seen = waiter.await.unwrap().unwrap().unwrap();
        assert!(seen.metadata.destroy_ready());
    }
}
