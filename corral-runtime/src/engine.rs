//! The engine: controller registration, watch fan-out and supervision
//!
//! The engine owns the single state-store handle, the dependency index,
//! the read-through cache and the per-controller adapters. A two-stage
//! pump reduces and deduplicates every kind-watch event, then fans the
//! distinct reduced events out to dependent adapters; under burst load an
//! adapter sees each distinct reduced event at most once per tick.

use crate::{
    adapter::StateAdapter,
    cache::ResourceCache,
    controller::{Controller, QController},
    error::{Error, Result},
    full_runtime::{FullAdapter, FullRuntime},
    index::{DependencyGraph, DependencyIndex},
    queued_runtime::{QRuntime, QueuedAdapter},
    reduced::ReducedMetadata,
};
use ahash::{AHashMap, AHashSet};
use corral_core::{
    state::{Event, State, WatchOptions},
    Kind,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use std::{num::NonZeroU32, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

const WATCH_CHANNEL_CAPACITY: usize = 1000;

/// Engine configuration.
#[derive(Clone, Debug, Default)]
pub struct RuntimeOptions {
    cached: Vec<Kind>,
    rate_limit: Option<(u32, u32)>,
    metrics_disabled: bool,
    warn_on_uncached_reads: bool,
}

impl RuntimeOptions {
    /// Fresh defaults: no cached kinds, no rate limit, metrics on,
    /// uncached-read warnings off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route reads of this kind through the read-through cache.
    #[must_use]
    pub fn cached_resource(mut self, namespace: &str, type_name: &str) -> Self {
        self.cached.push(Kind::new(namespace, type_name));
        self
    }

    /// Token bucket applied to every controller write (per controller,
    /// never shared across controllers).
    #[must_use]
    pub fn change_rate_limit(mut self, rate: u32, burst: u32) -> Self {
        self.rate_limit = Some((rate, burst));
        self
    }

    /// Gate counter updates.
    #[must_use]
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_disabled = !enabled;
        self
    }

    /// Log a warning when a read bypasses the cache.
    #[must_use]
    pub fn warn_on_uncached_reads(mut self, warn: bool) -> Self {
        self.warn_on_uncached_reads = warn;
        self
    }

    fn metrics(&self) -> bool {
        !self.metrics_disabled
    }

    fn limiter(&self) -> Option<Arc<DefaultDirectRateLimiter>> {
        let (rate, burst) = self.rate_limit?;
        let rate = NonZeroU32::new(rate)?;
        let burst = NonZeroU32::new(burst.max(1)).expect("burst is at least one");
        Some(Arc::new(RateLimiter::direct(
            Quota::per_second(rate).allow_burst(burst),
        )))
    }
}

/// State shared between the engine and its runtimes.
pub(crate) struct EngineShared {
    pub(crate) state: Arc<dyn State>,
    pub(crate) index: DependencyIndex,
    pub(crate) cache: Arc<ResourceCache>,
    pub(crate) options: RuntimeOptions,
    event_tx: mpsc::Sender<Event>,
    watched: Mutex<AHashSet<Kind>>,
}

impl EngineShared {
    /// Register a kind-watch with the store, once per `(namespace, type)`.
    pub(crate) async fn ensure_watch(&self, kind: &Kind) -> Result<()> {
        if self.watched.lock().insert(kind.clone()) {
            self.state
                .watch_kind(kind, self.event_tx.clone(), WatchOptions::default())
                .await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
enum AdapterEntry {
    Full(Arc<FullAdapter>),
    Queued(Arc<QueuedAdapter>),
}

impl AdapterEntry {
    fn watch_trigger(&self, reduced: &ReducedMetadata) {
        match self {
            AdapterEntry::Full(adapter) => adapter.watch_trigger(reduced),
            AdapterEntry::Queued(adapter) => adapter.watch_trigger(reduced),
        }
    }

    fn spawn(&self, tracker: &TaskTracker, cancel: CancellationToken) {
        match self {
            AdapterEntry::Full(adapter) => {
                let adapter = adapter.clone();
                tracker.spawn(async move { adapter.run(cancel).await });
            }
            AdapterEntry::Queued(adapter) => {
                let adapter = adapter.clone();
                tracker.spawn(async move { adapter.run(cancel).await });
            }
        }
    }
}

/// The controller engine.
pub struct Engine {
    shared: Arc<EngineShared>,
    adapters: Arc<Mutex<AHashMap<String, AdapterEntry>>>,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    tracker: TaskTracker,
    running: Mutex<Option<CancellationToken>>,
}

impl Engine {
    /// An engine over the given store.
    pub fn new(state: Arc<dyn State>, options: RuntimeOptions) -> Self {
        let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let cache = Arc::new(ResourceCache::new(
            state.clone(),
            options.cached.iter().cloned(),
            options.metrics(),
        ));
        let shared = Arc::new(EngineShared {
            state,
            index: DependencyIndex::new(),
            cache,
            options,
            event_tx,
            watched: Mutex::new(AHashSet::new()),
        });
        Self {
            shared,
            adapters: Arc::new(Mutex::new(AHashMap::new())),
            event_rx: Mutex::new(Some(event_rx)),
            tracker: TaskTracker::new(),
            running: Mutex::new(None),
        }
    }

    fn make_adapter(
        &self,
        name: &str,
        inputs: Vec<crate::controller::Input>,
        outputs: Vec<crate::controller::Output>,
    ) -> StateAdapter {
        StateAdapter::new(
            name.to_string(),
            self.shared.state.clone(),
            self.shared.cache.clone(),
            inputs,
            outputs,
            self.shared.options.limiter(),
            self.shared.options.metrics(),
            self.shared.options.warn_on_uncached_reads,
        )
    }

    async fn register_declarations(
        &self,
        name: &str,
        inputs: &[crate::controller::Input],
        outputs: &[crate::controller::Output],
    ) -> Result<()> {
        let mut registered_outputs = Vec::new();
        let mut registered_inputs = Vec::new();
        let rollback = |outputs: &[crate::controller::Output],
                        inputs: &[crate::controller::Input]| {
            for output in outputs {
                self.shared.index.remove_output(name, output);
            }
            for input in inputs {
                let _ = self.shared.index.delete_input(name, input);
            }
        };
        for output in outputs {
            if let Err(err) = self.shared.index.add_output(name, output) {
                rollback(&registered_outputs, &registered_inputs);
                return Err(err);
            }
            registered_outputs.push(output.clone());
        }
        for input in inputs {
            if let Err(err) = self.shared.index.add_input(name, input) {
                rollback(&registered_outputs, &registered_inputs);
                return Err(err);
            }
            registered_inputs.push(input.clone());
            if let Err(err) = self.shared.ensure_watch(&input.watched_kind()).await {
                rollback(&registered_outputs, &registered_inputs);
                return Err(err);
            }
        }
        Ok(())
    }

    fn insert_adapter(&self, name: String, entry: AdapterEntry) {
        self.adapters.lock().insert(name, entry.clone());
        if let Some(cancel) = self.running.lock().clone() {
            // The engine is live; late registrations start immediately.
            entry.spawn(&self.tracker, cancel.child_token());
        }
    }

    /// Register a full-reconcile controller.
    pub async fn register_controller(&self, controller: Arc<dyn Controller>) -> Result<()> {
        let name = controller.name().to_string();
        if self.adapters.lock().contains_key(&name) {
            return Err(Error::DuplicateController(name));
        }
        let inputs = controller.inputs();
        let outputs = controller.outputs();
        self.register_declarations(&name, &inputs, &outputs).await?;

        let adapter = self.make_adapter(&name, inputs, outputs);
        let runtime = Arc::new(FullRuntime::new(
            adapter,
            self.shared.clone(),
            self.shared.options.metrics(),
        ));
        let entry = AdapterEntry::Full(Arc::new(FullAdapter {
            controller,
            runtime,
        }));
        self.insert_adapter(name, entry);
        Ok(())
    }

    /// Register a queued controller.
    pub async fn register_q_controller(&self, controller: Arc<dyn QController>) -> Result<()> {
        let name = controller.name().to_string();
        if self.adapters.lock().contains_key(&name) {
            return Err(Error::DuplicateController(name));
        }
        let settings = controller.settings();
        self.register_declarations(&name, &settings.inputs, &settings.outputs)
            .await?;

        let adapter = self.make_adapter(&name, settings.inputs.clone(), settings.outputs.clone());
        let runtime = Arc::new(QRuntime::new(adapter, self.shared.clone()));
        let entry = AdapterEntry::Queued(Arc::new(QueuedAdapter::new(
            controller,
            runtime,
            settings,
            self.shared.options.metrics(),
        )));
        self.insert_adapter(name, entry);
        Ok(())
    }

    /// Export the current dependency graph.
    #[must_use]
    pub fn dependency_graph(&self) -> DependencyGraph {
        self.shared.index.export()
    }

    /// Run the watch pump and every adapter until `cancel` fires or the
    /// pump reports an unrecoverable watch error. All adapter tasks are
    /// joined before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let internal = cancel.child_token();
        *self.running.lock() = Some(internal.clone());

        self.shared.cache.start(&internal);

        let event_rx = self
            .event_rx
            .lock()
            .take()
            .expect("engine can only run once");
        let (batch_tx, batch_rx) = mpsc::channel::<AHashSet<ReducedMetadata>>(1);
        let stage1 = tokio::spawn(pump_reduce(event_rx, batch_tx, internal.clone()));
        let stage2 = tokio::spawn(pump_dispatch(
            batch_rx,
            self.adapters.clone(),
            self.shared.clone(),
            internal.clone(),
        ));

        let entries: Vec<_> = self.adapters.lock().values().cloned().collect();
        for entry in entries {
            entry.spawn(&self.tracker, internal.child_token());
        }

        let result = tokio::select! {
            () = internal.cancelled() => Ok(()),
            joined = stage1 => match joined {
                Ok(result) => result,
                Err(join_err) => Err(Error::WatchFailed(join_err.to_string())),
            },
        };

        internal.cancel();
        let _ = stage2.await;
        self.tracker.close();
        self.tracker.wait().await;
        *self.running.lock() = None;
        result
    }
}

fn reduce_into(batch: &mut AHashSet<ReducedMetadata>, event: Event) -> Result<()> {
    let mut insert = |reduced: ReducedMetadata| {
        if !batch.insert(reduced.clone()) {
            tracing::trace!(%reduced, "duplicate reduced event coalesced");
        }
    };
    match event {
        Event::Created(res) | Event::Destroyed(res) => insert(ReducedMetadata::from(&res.metadata)),
        Event::Updated { new, .. } => insert(ReducedMetadata::from(&new.metadata)),
        Event::Bootstrapped(snapshot) => {
            for res in snapshot {
                insert(ReducedMetadata::from(&res.metadata));
            }
        }
        Event::Errored(msg) => return Err(Error::WatchFailed(msg)),
    }
    Ok(())
}

/// Stage 1: reduce each event and deduplicate per tick.
async fn pump_reduce(
    mut event_rx: mpsc::Receiver<Event>,
    batch_tx: mpsc::Sender<AHashSet<ReducedMetadata>>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let first = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };
        let mut batch = AHashSet::new();
        reduce_into(&mut batch, first)?;
        while let Ok(event) = event_rx.try_recv() {
            reduce_into(&mut batch, event)?;
        }
        if !batch.is_empty() && batch_tx.send(batch).await.is_err() {
            return Ok(());
        }
    }
}

/// Stage 2: look up dependents and trigger each adapter.
async fn pump_dispatch(
    mut batch_rx: mpsc::Receiver<AHashSet<ReducedMetadata>>,
    adapters: Arc<Mutex<AHashMap<String, AdapterEntry>>>,
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => return,
            batch = batch_rx.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
        };
        for reduced in batch {
            let dependents = shared.index.dependent_controllers(
                &reduced.namespace,
                &reduced.type_name,
                &reduced.id,
            );
            for name in dependents {
                let entry = adapters.lock().get(&name).cloned();
                if let Some(entry) = entry {
                    entry.watch_trigger(&reduced);
                }
            }
        }
    }
}
