//! Per-controller state adapter
//!
//! Wraps the state store with the controller's declared access policy:
//! reads must be covered by an input or output declaration, writes by an
//! output, finalizer mutation by a strong/primary/mapped input. Writes
//! stamp the controller as owner, acquire the rate limiter, and are
//! recorded for output tracking; reads of cached kinds are served by the
//! read-through cache.

use crate::{
    cache::ResourceCache,
    controller::{Input, Output},
    error::{Error, Result},
    metrics,
};
use ahash::AHashSet;
use corral_core::{
    state::{
        CreateOptions, DestroyOptions, GetOptions, ListOptions, State, TeardownOptions,
        UpdateOptions,
    },
    DynamicResource, Kind, Pointer, ResourceSpec, TypedResource,
};
use governor::DefaultDirectRateLimiter;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// The controller-facing reader/writer over the state store.
pub struct StateAdapter {
    name: String,
    state: Arc<dyn State>,
    cache: Arc<ResourceCache>,
    inputs: RwLock<Vec<Input>>,
    outputs: Vec<Output>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    metrics_enabled: bool,
    warn_uncached: bool,
    tracked: Mutex<Option<AHashSet<Pointer>>>,
}

impl StateAdapter {
    pub(crate) fn new(
        name: String,
        state: Arc<dyn State>,
        cache: Arc<ResourceCache>,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
        limiter: Option<Arc<DefaultDirectRateLimiter>>,
        metrics_enabled: bool,
        warn_uncached: bool,
    ) -> Self {
        Self {
            name,
            state,
            cache,
            inputs: RwLock::new(crate::controller::sorted(inputs)),
            outputs,
            limiter,
            metrics_enabled,
            warn_uncached,
            tracked: Mutex::new(None),
        }
    }

    /// The controller name, stamped as owner on writes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn raw_state(&self) -> &Arc<dyn State> {
        &self.state
    }

    pub(crate) fn inputs_snapshot(&self) -> Vec<Input> {
        self.inputs.read().clone()
    }

    pub(crate) fn set_inputs(&self, inputs: Vec<Input>) {
        *self.inputs.write() = crate::controller::sorted(inputs);
    }

    /// Drop any tracking pass left over from an aborted run.
    pub(crate) fn reset_tracking(&self) {
        *self.tracked.lock() = None;
    }

    fn is_output(&self, type_name: &str) -> bool {
        self.outputs.iter().any(|o| o.type_name == type_name)
    }

    fn check_read(&self, ptr: &Pointer) -> Result<()> {
        let covered =
            self.inputs.read().iter().any(|input| input.covers(ptr)) || self.is_output(&ptr.type_name);
        if covered {
            Ok(())
        } else {
            Err(corral_core::Error::AccessDenied {
                controller: self.name.clone(),
                verb: "read",
                target: ptr.to_string(),
            }
            .into())
        }
    }

    fn check_list(&self, kind: &Kind) -> Result<()> {
        let covered = self
            .inputs
            .read()
            .iter()
            .any(|input| input.covers_kind(kind))
            || self.is_output(&kind.type_name);
        if covered {
            Ok(())
        } else {
            Err(corral_core::Error::AccessDenied {
                controller: self.name.clone(),
                verb: "list",
                target: kind.to_string(),
            }
            .into())
        }
    }

    fn check_write(&self, type_name: &str) -> Result<()> {
        if self.is_output(type_name) {
            Ok(())
        } else {
            Err(corral_core::Error::AccessDenied {
                controller: self.name.clone(),
                verb: "write",
                target: type_name.to_string(),
            }
            .into())
        }
    }

    fn check_finalizers(&self, ptr: &Pointer) -> Result<()> {
        let permitted = self
            .inputs
            .read()
            .iter()
            .any(|input| input.covers(ptr) && input.kind.permits_finalizers());
        if permitted {
            Ok(())
        } else {
            Err(corral_core::Error::AccessDenied {
                controller: self.name.clone(),
                verb: "finalizers",
                target: ptr.to_string(),
            }
            .into())
        }
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    fn count_read(&self) {
        if self.metrics_enabled {
            metrics::CONTROLLER_READS.with_label_values(&[&self.name]).inc();
        }
    }

    fn count_write(&self) {
        if self.metrics_enabled {
            metrics::CONTROLLER_WRITES.with_label_values(&[&self.name]).inc();
        }
    }

    fn track(&self, ptr: Pointer) {
        if let Some(tracked) = self.tracked.lock().as_mut() {
            tracked.insert(ptr);
        }
    }

    async fn read(&self, ptr: &Pointer, cached: bool) -> Result<DynamicResource> {
        self.check_read(ptr)?;
        self.count_read();
        let kind = ptr.kind();
        if cached {
            if self.cache.caches(&kind) {
                return Ok(self.cache.get(ptr).await?);
            }
            if self.warn_uncached {
                tracing::warn!(controller = %self.name, resource = %ptr, "read bypasses the cache");
            }
        }
        Ok(self.state.get(ptr, GetOptions::default()).await?)
    }

    /// Fetch an input or output resource, through the cache when its kind
    /// is cached.
    pub async fn get<S: ResourceSpec>(&self, ptr: &Pointer) -> Result<TypedResource<S>> {
        Ok(self.read(ptr, true).await?.parse()?)
    }

    /// Fetch straight from the store, bypassing the cache unconditionally.
    pub async fn get_uncached<S: ResourceSpec>(&self, ptr: &Pointer) -> Result<TypedResource<S>> {
        Ok(self.read(ptr, false).await?.parse()?)
    }

    /// Fetch without interpreting the spec.
    pub async fn get_dynamic(&self, ptr: &Pointer) -> Result<DynamicResource> {
        self.read(ptr, true).await
    }

    async fn list_inner(
        &self,
        kind: &Kind,
        opts: ListOptions,
        cached: bool,
    ) -> Result<Vec<DynamicResource>> {
        self.check_list(kind)?;
        self.count_read();
        if cached {
            if self.cache.caches(kind) {
                return Ok(self.cache.list(kind, &opts).await?);
            }
            if self.warn_uncached {
                tracing::warn!(controller = %self.name, %kind, "list bypasses the cache");
            }
        }
        Ok(self.state.list(kind, opts).await?)
    }

    /// List a typed kind in its default namespace.
    pub async fn list<S: ResourceSpec>(&self, opts: ListOptions) -> Result<Vec<TypedResource<S>>> {
        self.list_in::<S>(S::NAMESPACE, opts).await
    }

    /// List a typed kind in an explicit namespace.
    pub async fn list_in<S: ResourceSpec>(
        &self,
        namespace: &str,
        opts: ListOptions,
    ) -> Result<Vec<TypedResource<S>>> {
        let kind = Kind::new(namespace, S::TYPE);
        self.list_inner(&kind, opts, true)
            .await?
            .into_iter()
            .map(|res| res.parse().map_err(Error::from))
            .collect()
    }

    /// List straight from the store, bypassing the cache.
    pub async fn list_uncached<S: ResourceSpec>(
        &self,
        namespace: &str,
        opts: ListOptions,
    ) -> Result<Vec<TypedResource<S>>> {
        let kind = Kind::new(namespace, S::TYPE);
        self.list_inner(&kind, opts, false)
            .await?
            .into_iter()
            .map(|res| res.parse().map_err(Error::from))
            .collect()
    }

    /// Create an output resource, stamped with this controller as owner.
    pub async fn create<S: ResourceSpec>(
        &self,
        resource: TypedResource<S>,
    ) -> Result<TypedResource<S>> {
        self.check_write(&resource.metadata.type_name)?;
        self.throttle().await;
        self.count_write();
        self.track(resource.pointer());
        let created = self
            .state
            .create(resource.into_dynamic()?, CreateOptions {
                owner: self.name.clone(),
            })
            .await?;
        Ok(created.parse()?)
    }

    /// Replace an output resource under its version precondition.
    pub async fn update<S: ResourceSpec>(
        &self,
        resource: TypedResource<S>,
    ) -> Result<TypedResource<S>> {
        self.check_write(&resource.metadata.type_name)?;
        self.throttle().await;
        self.count_write();
        self.track(resource.pointer());
        let updated = self
            .state
            .update(resource.into_dynamic()?, UpdateOptions {
                owner: self.name.clone(),
                expected_version: None,
            })
            .await?;
        Ok(updated.parse()?)
    }

    /// Read-modify-write with a create fallback.
    ///
    /// Reads the current state (uncached, so the read reflects this
    /// controller's own recent writes), applies `updater`, and persists;
    /// version conflicts re-read and retry, phase conflicts propagate.
    /// When the resource does not exist, `updater` runs on the template
    /// and the result is created.
    pub async fn modify<S, F>(
        &self,
        template: TypedResource<S>,
        mut updater: F,
    ) -> Result<TypedResource<S>>
    where
        S: ResourceSpec,
        F: FnMut(&mut TypedResource<S>) -> Result<()>,
    {
        self.check_write(&template.metadata.type_name)?;
        let ptr = template.pointer();
        loop {
            match self.state.get(&ptr, GetOptions::default()).await {
                Err(err) if err.is_not_found() => {
                    let mut fresh = template.clone();
                    updater(&mut fresh)?;
                    match self.create(fresh).await {
                        Err(Error::State(corral_core::Error::AlreadyExists(_))) => continue,
                        result => return result,
                    }
                }
                Err(err) => return Err(err.into()),
                Ok(current) => {
                    let mut typed: TypedResource<S> = current.parse()?;
                    updater(&mut typed)?;
                    match self.update(typed).await {
                        Err(Error::State(corral_core::Error::VersionConflict { .. })) => continue,
                        result => return result,
                    }
                }
            }
        }
    }

    /// Start tearing an output down; returns whether it is destroy-ready.
    pub async fn teardown(&self, ptr: &Pointer) -> Result<bool> {
        self.teardown_as(ptr, None).await
    }

    /// Teardown with an explicit owner, for specialized destroyer
    /// controllers acting on behalf of the owner.
    pub async fn teardown_with_owner(&self, ptr: &Pointer, owner: &str) -> Result<bool> {
        self.teardown_as(ptr, Some(owner.to_string())).await
    }

    async fn teardown_as(&self, ptr: &Pointer, owner: Option<String>) -> Result<bool> {
        self.check_write(&ptr.type_name)?;
        self.throttle().await;
        self.count_write();
        self.track(ptr.clone());
        Ok(self
            .state
            .teardown(ptr, TeardownOptions {
                owner: owner.unwrap_or_else(|| self.name.clone()),
            })
            .await?)
    }

    /// Destroy a torn-down output; missing resources are a success.
    pub async fn destroy(&self, ptr: &Pointer) -> Result<()> {
        self.destroy_as(ptr, None).await
    }

    /// Destroy with an explicit owner.
    pub async fn destroy_with_owner(&self, ptr: &Pointer, owner: &str) -> Result<()> {
        self.destroy_as(ptr, Some(owner.to_string())).await
    }

    async fn destroy_as(&self, ptr: &Pointer, owner: Option<String>) -> Result<()> {
        self.check_write(&ptr.type_name)?;
        self.throttle().await;
        self.count_write();
        self.track(ptr.clone());
        match self
            .state
            .destroy(ptr, DestroyOptions {
                owner: owner.unwrap_or_else(|| self.name.clone()),
            })
            .await
        {
            Err(err) if err.is_not_found() => Ok(()),
            result => Ok(result?),
        }
    }

    /// Add finalizers to a strong/primary/mapped input.
    pub async fn add_finalizers(&self, ptr: &Pointer, finalizers: &[&str]) -> Result<()> {
        self.check_finalizers(ptr)?;
        self.throttle().await;
        self.count_write();
        Ok(self.state.add_finalizers(ptr, finalizers).await?)
    }

    /// Remove finalizers; both absent finalizers and a missing resource
    /// count as success.
    pub async fn remove_finalizers(&self, ptr: &Pointer, finalizers: &[&str]) -> Result<()> {
        self.check_finalizers(ptr)?;
        self.throttle().await;
        self.count_write();
        match self.state.remove_finalizers(ptr, finalizers).await {
            Err(err) if err.is_not_found() => Ok(()),
            result => Ok(result?),
        }
    }

    /// Begin recording every output written; panics on double start.
    pub fn start_tracking_outputs(&self) {
        let mut tracked = self.tracked.lock();
        assert!(
            tracked.is_none(),
            "output tracking already started for controller {}",
            self.name
        );
        *tracked = Some(AHashSet::new());
    }

    /// Destroy every owned resource of the given kinds that was not
    /// written since [`Self::start_tracking_outputs`]. Ends the tracking
    /// pass; panics if tracking was never started.
    pub async fn cleanup_outputs(&self, kinds: &[Kind]) -> Result<()> {
        let tracked = self
            .tracked
            .lock()
            .take()
            .expect("output tracking was not started");
        for kind in kinds {
            let listed = self.state.list(kind, ListOptions::default()).await?;
            for res in listed {
                let ptr = res.pointer();
                if res.metadata.owner != self.name || tracked.contains(&ptr) {
                    continue;
                }
                tracing::debug!(controller = %self.name, resource = %ptr, "cleaning up untouched output");
                let ready = self.teardown(&ptr).await?;
                if ready {
                    self.destroy(&ptr).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{InputKind, OutputKind};
    use corral_core::state::mem::MemState;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct IntSpec {
        value: i64,
    }

    impl ResourceSpec for IntSpec {
        const TYPE: &'static str = "IntegerResource";
        const NAMESPACE: &'static str = "default";
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct StrSpec {
        value: String,
    }

    impl ResourceSpec for StrSpec {
        const TYPE: &'static str = "StringResource";
        const NAMESPACE: &'static str = "default";
    }

    fn adapter(state: &MemState, inputs: Vec<Input>, outputs: Vec<Output>) -> StateAdapter {
        let state: Arc<dyn State> = Arc::new(state.clone());
        let cache = Arc::new(ResourceCache::new(state.clone(), [], false));
        StateAdapter::new(
            "test-ctrl".into(),
            state,
            cache,
            inputs,
            outputs,
            None,
            false,
            false,
        )
    }

    #[tokio::test]
    async fn writes_outside_outputs_are_denied_without_touching_the_store() {
        let state = MemState::new();
        let adapter = adapter(&state, vec![Input::new::<IntSpec>(InputKind::Weak)], vec![]);

        let err = adapter
            .create(TypedResource::new("x", StrSpec { value: "v".into() }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::State(corral_core::Error::AccessDenied { .. })
        ));
        assert!(state
            .list(&Kind::of::<StrSpec>(), ListOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reads_require_a_covering_declaration() {
        let state = MemState::new();
        let adapter = adapter(
            &state,
            vec![Input::new::<IntSpec>(InputKind::Weak).with_id("one")],
            vec![Output::named(StrSpec::TYPE, OutputKind::Exclusive)],
        );

        // Pinned input covers only its id.
        assert!(adapter
            .get::<IntSpec>(&Pointer::of::<IntSpec>("two"))
            .await
            .unwrap_err()
            .to_string()
            .contains("denied"));

        // Covered reads surface NotFound from the store instead.
        assert!(adapter
            .get::<IntSpec>(&Pointer::of::<IntSpec>("one"))
            .await
            .unwrap_err()
            .is_not_found());

        // Outputs are readable.
        assert!(adapter
            .get::<StrSpec>(&Pointer::of::<StrSpec>("any"))
            .await
            .unwrap_err()
            .is_not_found());

        // Lists need an unpinned input or an output.
        assert!(matches!(
            adapter.list::<IntSpec>(ListOptions::default()).await,
            Err(Error::State(corral_core::Error::AccessDenied { .. }))
        ));
        assert!(adapter.list::<StrSpec>(ListOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn writes_stamp_the_controller_as_owner() {
        let state = MemState::new();
        let adapter = adapter(&state, vec![], vec![Output::named(
            IntSpec::TYPE,
            OutputKind::Exclusive,
        )]);

        let created = adapter
            .create(TypedResource::new("one", IntSpec { value: 1 }))
            .await
            .unwrap();
        assert_eq!(created.metadata.owner, "test-ctrl");
    }

    #[tokio::test]
    async fn finalizer_access_follows_input_kind() {
        let state = MemState::new();
        let weak = adapter(&state, vec![Input::new::<IntSpec>(InputKind::Weak)], vec![]);
        let strong = adapter(&state, vec![Input::new::<IntSpec>(InputKind::Strong)], vec![]);

        let ptr = Pointer::of::<IntSpec>("one");
        assert!(matches!(
            weak.add_finalizers(&ptr, &["fin"]).await,
            Err(Error::State(corral_core::Error::AccessDenied { .. }))
        ));

        // Removal of a finalizer on a missing resource is a success.
        strong.remove_finalizers(&ptr, &["fin"]).await.unwrap();
    }

    #[tokio::test]
    async fn modify_creates_then_updates() {
        let state = MemState::new();
        let adapter = adapter(&state, vec![], vec![Output::named(
            IntSpec::TYPE,
            OutputKind::Exclusive,
        )]);
        let template = TypedResource::new("sum", IntSpec { value: 0 });

        let first = adapter
            .modify(template.clone(), |res| {
                res.spec.value = 5;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(first.spec.value, 5);

        let second = adapter
            .modify(template, |res| {
                res.spec.value += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(second.spec.value, 6);
        assert!(second.metadata.version > first.metadata.version);

        let got = adapter
            .get_uncached::<IntSpec>(&Pointer::of::<IntSpec>("sum"))
            .await
            .unwrap();
        assert_eq!(got.spec.value, 6);
    }

    #[tokio::test]
    async fn output_tracking_destroys_untouched_resources() {
        let state = MemState::new();
        let adapter = adapter(&state, vec![], vec![Output::named(
            IntSpec::TYPE,
            OutputKind::Exclusive,
        )]);

        adapter
            .create(TypedResource::new("keep", IntSpec { value: 1 }))
            .await
            .unwrap();
        adapter
            .create(TypedResource::new("drop", IntSpec { value: 2 }))
            .await
            .unwrap();

        adapter.start_tracking_outputs();
        let keep = adapter
            .get_uncached::<IntSpec>(&Pointer::of::<IntSpec>("keep"))
            .await
            .unwrap();
        adapter.update(keep).await.unwrap();
        adapter.cleanup_outputs(&[Kind::of::<IntSpec>()]).await.unwrap();

        let remaining = state
            .list(&Kind::of::<IntSpec>(), ListOptions::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.id, "keep");
    }

    #[tokio::test]
    #[should_panic(expected = "output tracking already started")]
    async fn double_start_tracking_panics() {
        let state = MemState::new();
        let adapter = adapter(&state, vec![], vec![]);
        adapter.start_tracking_outputs();
        adapter.start_tracking_outputs();
    }
}
