//! Full-reconcile controller runtime
//!
//! One adapter and one reconciler task per controller. Wake signals are
//! coalesced: a single stored permit suffices no matter how many changes
//! arrived, and the controller reconciles all of its inputs on each pass.
//! On error or panic the controller is restarted with exponential backoff.

use crate::{
    adapter::StateAdapter,
    controller::{sorted, Controller, Input, InputKind},
    engine::EngineShared,
    error::{panic_message, Result},
    metrics,
    reduced::ReducedMetadata,
    retry,
};
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use std::{ops::Deref, sync::Arc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// The runtime handed to a full-reconcile controller's `run`.
///
/// Dereferences to the [`StateAdapter`] for resource access.
pub struct FullRuntime {
    adapter: StateAdapter,
    wake: Notify,
    restart_backoff: Mutex<ExponentialBackoff>,
    engine: Arc<EngineShared>,
    metrics_enabled: bool,
}

impl Deref for FullRuntime {
    type Target = StateAdapter;

    fn deref(&self) -> &StateAdapter {
        &self.adapter
    }
}

impl FullRuntime {
    pub(crate) fn new(
        adapter: StateAdapter,
        engine: Arc<EngineShared>,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            adapter,
            wake: Notify::new(),
            restart_backoff: Mutex::new(retry::restart_policy()),
            engine,
            metrics_enabled,
        }
    }

    /// Wait for the next coalesced wake signal.
    pub async fn next_event(&self) {
        self.wake.notified().await;
    }

    /// Force a wake, as if an input had changed.
    pub fn queue_reconcile(&self) {
        self.notify();
    }

    /// Assert forward progress: reset the restart backoff so the next
    /// failure starts over at the initial interval.
    pub fn reset_restart_backoff(&self) {
        self.restart_backoff.lock().reset();
    }

    /// Replace the controller's input declarations at runtime.
    ///
    /// The new set is diffed against the registered one; removed inputs
    /// leave the dependency index, added ones join it and get their kind
    /// watched.
    pub async fn update_inputs(&self, inputs: Vec<Input>) -> Result<()> {
        let new = sorted(inputs);
        let current = self.adapter.inputs_snapshot();
        for removed in current.iter().filter(|input| !new.contains(input)) {
            self.engine.index.delete_input(self.adapter.name(), removed)?;
        }
        for added in new.iter().filter(|input| !current.contains(input)) {
            self.engine.index.add_input(self.adapter.name(), added)?;
            self.engine.ensure_watch(&added.watched_kind()).await?;
        }
        self.adapter.set_inputs(new);
        Ok(())
    }

    fn notify(&self) {
        if self.metrics_enabled {
            metrics::CONTROLLER_WAKEUPS
                .with_label_values(&[self.adapter.name()])
                .inc();
        }
        self.wake.notify_one();
    }

    pub(crate) fn trigger(&self, reduced: &ReducedMetadata) {
        let ptr = reduced.pointer();
        let relevant = self.adapter.inputs_snapshot().iter().any(|input| {
            input.covers(&ptr)
                && match input.kind {
                    // DestroyReady inputs carry the reduced-metadata filter.
                    InputKind::DestroyReady => reduced.destroy_ready(),
                    _ => true,
                }
        });
        if relevant {
            self.notify();
        }
    }
}

/// Supervises one full-reconcile controller: runs it, catches panics,
/// restarts with backoff.
pub(crate) struct FullAdapter {
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) runtime: Arc<FullRuntime>,
}

impl FullAdapter {
    pub(crate) fn watch_trigger(&self, reduced: &ReducedMetadata) {
        self.runtime.trigger(reduced);
    }

    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let name = self.controller.name().to_string();
        // Initial wake so the controller reconciles pre-existing state.
        self.runtime.queue_reconcile();
        loop {
            // A previous attempt may have died mid-pass.
            self.runtime.adapter.reset_tracking();
            let controller = self.controller.clone();
            let runtime = self.runtime.clone();
            let span = tracing::info_span!("controller", controller = %name);
            let mut task =
                tokio::spawn(async move { controller.run(&runtime).await }.instrument(span));
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    task.abort();
                    let _ = task.await;
                    return;
                }
                result = &mut task => result,
            };
            match result {
                Ok(Ok(())) => {
                    tracing::info!(controller = %name, "controller returned, restarting");
                }
                Ok(Err(err)) if err.is_cancellation() => return,
                Ok(Err(err)) => {
                    self.count_crash(&name);
                    tracing::error!(controller = %name, %err, "controller failed, restarting");
                }
                Err(join_err) if join_err.is_cancelled() => return,
                Err(join_err) => {
                    let message = panic_message(join_err);
                    self.count_crash(&name);
                    tracing::error!(controller = %name, panic = %message, "controller panicked, restarting");
                }
            }
            let delay = retry::next_interval(&mut self.runtime.restart_backoff.lock());
            tracing::debug!(controller = %name, ?delay, "restart backoff");
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn count_crash(&self, name: &str) {
        if self.runtime.metrics_enabled {
            metrics::CONTROLLER_CRASHES.with_label_values(&[name]).inc();
        }
    }
}
