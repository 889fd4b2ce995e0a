//! Queued controller runtime
//!
//! One adapter, one job queue, and a configurable number of worker tasks
//! per controller. Items are `(pointer, job)` pairs; the queue's on-hold
//! semantics guarantee a given item is in flight in at most one worker at
//! a time, while distinct items reconcile in parallel.

use crate::{
    adapter::StateAdapter,
    controller::{QController, QSettings},
    engine::EngineShared,
    error::{panic_message, Error, Result},
    metrics,
    queue::JobQueue,
    reduced::ReducedMetadata,
    retry,
};
use ahash::AHashMap;
use backoff::{backoff::Backoff, ExponentialBackoff};
use corral_core::{state::ListOptions, Pointer};
use futures::future::join_all;
use parking_lot::Mutex;
use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// The job flavor of a queue item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Job {
    /// Reconcile a primary item.
    Reconcile,
    /// Map a secondary-input event to primary items.
    Map,
}

impl Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Reconcile => f.write_str("reconcile"),
            Job::Map => f.write_str("map"),
        }
    }
}

/// A queue key: one reconcile (or map) job per pointed-at resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct QKey {
    pub(crate) ptr: Pointer,
    pub(crate) job: Job,
}

/// What put the item on the queue; the queue keeps the freshest one.
#[derive(Clone, Debug)]
pub(crate) enum Trigger {
    Event(ReducedMetadata),
    Bootstrap,
    Mapped,
}

impl Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Event(_) => f.write_str("event"),
            Trigger::Bootstrap => f.write_str("bootstrap"),
            Trigger::Mapped => f.write_str("mapped"),
        }
    }
}

/// The runtime handed to a queued controller.
///
/// Dereferences to the [`StateAdapter`] for resource access.
pub struct QRuntime {
    adapter: StateAdapter,
    engine: Arc<EngineShared>,
}

impl Deref for QRuntime {
    type Target = StateAdapter;

    fn deref(&self) -> &StateAdapter {
        &self.adapter
    }
}

impl QRuntime {
    pub(crate) fn new(adapter: StateAdapter, engine: Arc<EngineShared>) -> Self {
        Self { adapter, engine }
    }

    /// A token cancelled once the resource starts tearing down, for
    /// aborting long-running reconcile work. The pointed-at kind must be
    /// in the cache set.
    pub async fn context_with_teardown(&self, ptr: &Pointer) -> Result<CancellationToken> {
        self.engine.cache.watch_for_teardown(ptr).await
    }
}

/// Supervises one queued controller: bootstrap, watch dispatch, workers,
/// hooks.
pub(crate) struct QueuedAdapter {
    pub(crate) controller: Arc<dyn QController>,
    pub(crate) runtime: Arc<QRuntime>,
    pub(crate) settings: QSettings,
    queue: JobQueue<QKey, Trigger>,
    backoffs: Mutex<AHashMap<QKey, ExponentialBackoff>>,
    metrics_enabled: bool,
}

impl QueuedAdapter {
    pub(crate) fn new(
        controller: Arc<dyn QController>,
        runtime: Arc<QRuntime>,
        settings: QSettings,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            controller,
            runtime,
            settings,
            queue: JobQueue::new(),
            backoffs: Mutex::new(AHashMap::new()),
            metrics_enabled,
        }
    }

    fn name(&self) -> &str {
        self.runtime.adapter.name()
    }

    fn publish_queue_length(&self) {
        if self.metrics_enabled {
            metrics::QCONTROLLER_QUEUE_LENGTH
                .with_label_values(&[self.name()])
                .set(self.queue.len() as i64);
        }
    }

    /// Route a watch event into the queue according to the declared
    /// input kinds.
    pub(crate) fn watch_trigger(&self, reduced: &ReducedMetadata) {
        let ptr = reduced.pointer();
        for input in self.settings.inputs.iter().filter(|i| i.covers(&ptr)) {
            use crate::controller::InputKind;
            match input.kind {
                InputKind::QPrimary => self.queue.put(
                    QKey {
                        ptr: ptr.clone(),
                        job: Job::Reconcile,
                    },
                    Trigger::Event(reduced.clone()),
                ),
                InputKind::QMapped => self.queue.put(
                    QKey {
                        ptr: ptr.clone(),
                        job: Job::Map,
                    },
                    Trigger::Event(reduced.clone()),
                ),
                InputKind::QMappedDestroyReady if reduced.destroy_ready() => self.queue.put(
                    QKey {
                        ptr: ptr.clone(),
                        job: Job::Map,
                    },
                    Trigger::Event(reduced.clone()),
                ),
                _ => {}
            }
        }
        self.publish_queue_length();
    }

    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let name = self.name().to_string();

        if !self.bootstrap_primaries(&cancel).await {
            return;
        }

        let hook = if self.settings.run_hook {
            let this = self.clone();
            let hook_cancel = cancel.clone();
            Some(tokio::spawn(async move {
                this.run_hook_loop(hook_cancel).await;
            }))
        } else {
            None
        };

        let workers: Vec<_> = (0..self.settings.concurrency.max(1))
            .map(|worker| {
                let this = self.clone();
                let cancel = cancel.clone();
                let span = tracing::info_span!("qcontroller", controller = %name, worker);
                tokio::spawn(async move { this.worker_loop(cancel).await }.instrument(span))
            })
            .collect();
        join_all(workers).await;

        if self.settings.shutdown_hook {
            self.controller.shutdown_hook(&self.runtime).await;
        }
        self.queue.close();
        if let Some(hook) = hook {
            let _ = hook.await;
        }
    }

    /// List every primary input and enqueue one reconcile job per item;
    /// retried with backoff until the list succeeds.
    async fn bootstrap_primaries(&self, cancel: &CancellationToken) -> bool {
        use crate::controller::InputKind;
        for input in &self.settings.inputs {
            if input.kind != InputKind::QPrimary {
                continue;
            }
            let kind = input.watched_kind();
            let mut policy = retry::restart_policy();
            loop {
                let listed = tokio::select! {
                    () = cancel.cancelled() => return false,
                    listed = self
                        .runtime
                        .adapter
                        .raw_state()
                        .list(&kind, ListOptions::default()) => listed,
                };
                match listed {
                    Ok(resources) => {
                        for res in resources {
                            self.queue.put(
                                QKey {
                                    ptr: res.pointer(),
                                    job: Job::Reconcile,
                                },
                                Trigger::Bootstrap,
                            );
                        }
                        break;
                    }
                    Err(err) => {
                        let delay = retry::next_interval(&mut policy);
                        tracing::warn!(controller = %self.name(), %kind, %err, ?delay, "bootstrap list failed");
                        tokio::select! {
                            () = cancel.cancelled() => return false,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        self.publish_queue_length();
        true
    }

    async fn worker_loop(&self, cancel: CancellationToken) {
        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => return,
                item = self.queue.get() => item,
            };
            let Some((key, trigger)) = item else { return };
            self.process(key, trigger).await;
        }
    }

    async fn process(&self, key: QKey, trigger: Trigger) {
        let name = self.name().to_string();
        let started = Instant::now();

        // Controller callbacks run in their own task so a panic is
        // contained and surfaces as a join error.
        let controller = self.controller.clone();
        let runtime = self.runtime.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            match task_key.job {
                Job::Reconcile => controller
                    .reconcile(&runtime, &task_key.ptr)
                    .await
                    .map(|()| Vec::new()),
                Job::Map => controller.map_input(&runtime, &task_key.ptr).await,
            }
        });
        let result = match task.await {
            Ok(result) => result,
            Err(join_err) => Err(Error::Panic(panic_message(join_err))),
        };
        let busy = started.elapsed();
        self.count_busy(&name, key.job, busy);

        match result {
            Ok(mapped) => {
                let recovered = self.backoffs.lock().remove(&key).is_some();
                match key.job {
                    Job::Reconcile => {
                        self.count(&metrics::QCONTROLLER_PROCESSED, &name, 1);
                        if recovered {
                            tracing::info!(controller = %name, resource = %key.ptr, "reconcile succeeded after retries");
                        }
                    }
                    Job::Map => {
                        self.count(&metrics::QCONTROLLER_MAPPED_IN, &name, 1);
                        self.count(&metrics::QCONTROLLER_MAPPED_OUT, &name, mapped.len() as u64);
                        if recovered {
                            tracing::debug!(controller = %name, resource = %key.ptr, "map succeeded after retries");
                        }
                        for ptr in mapped {
                            self.queue.put(
                                QKey {
                                    ptr,
                                    job: Job::Reconcile,
                                },
                                Trigger::Mapped,
                            );
                        }
                    }
                }
                self.queue.release(key, None);
            }
            Err(Error::Requeue { source, interval }) => {
                self.count(&metrics::QCONTROLLER_REQUEUES, &name, 1);
                if let Some(err) = source {
                    self.count(&metrics::QCONTROLLER_CRASHES, &name, 1);
                    tracing::warn!(
                        controller = %name, resource = %key.ptr, job = %key.job,
                        %trigger, ?busy, ?interval, %err, "requeued with error"
                    );
                }
                self.queue.release(key, Some(interval));
            }
            Err(err) if err.is_cancellation() => {
                self.queue.release(key, None);
            }
            Err(err) => {
                self.count(&metrics::QCONTROLLER_CRASHES, &name, 1);
                let interval = {
                    let mut backoffs = self.backoffs.lock();
                    retry::next_interval(backoffs.entry(key.clone()).or_insert_with(retry::item_policy))
                };
                tracing::warn!(
                    controller = %name, resource = %key.ptr, job = %key.job,
                    %trigger, ?busy, ?interval, %err, "item failed, backing off"
                );
                self.queue.release(key, Some(interval));
            }
        }
        self.publish_queue_length();
    }

    async fn run_hook_loop(&self, cancel: CancellationToken) {
        let name = self.name().to_string();
        let mut policy = retry::restart_policy();
        loop {
            let started = Instant::now();
            let controller = self.controller.clone();
            let runtime = self.runtime.clone();
            let mut task = tokio::spawn(async move { controller.run_hook(&runtime).await });
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    task.abort();
                    let _ = task.await;
                    return;
                }
                result = &mut task => result,
            };
            // A hook that stayed up for a while earned a fresh backoff.
            if started.elapsed() >= Duration::from_secs(60) {
                policy.reset();
            }
            match result {
                Ok(Ok(())) => tracing::info!(controller = %name, "run hook returned, restarting"),
                Ok(Err(err)) if err.is_cancellation() => return,
                Ok(Err(err)) => {
                    self.count(&metrics::QCONTROLLER_CRASHES, &name, 1);
                    tracing::error!(controller = %name, %err, "run hook failed, restarting");
                }
                Err(join_err) if join_err.is_cancelled() => return,
                Err(join_err) => {
                    let message = panic_message(join_err);
                    self.count(&metrics::QCONTROLLER_CRASHES, &name, 1);
                    tracing::error!(controller = %name, panic = %message, "run hook panicked, restarting");
                }
            }
            let delay = retry::next_interval(&mut policy);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn count(&self, counter: &prometheus::IntCounterVec, name: &str, by: u64) {
        if self.metrics_enabled && by > 0 {
            counter.with_label_values(&[name]).inc_by(by);
        }
    }

    fn count_busy(&self, name: &str, job: Job, busy: Duration) {
        if !self.metrics_enabled {
            return;
        }
        let seconds = busy.as_secs_f64();
        match job {
            Job::Reconcile => metrics::QCONTROLLER_RECONCILE_BUSY
                .with_label_values(&[name])
                .inc_by(seconds),
            Job::Map => metrics::QCONTROLLER_MAP_BUSY
                .with_label_values(&[name])
                .inc_by(seconds),
        }
    }
}
