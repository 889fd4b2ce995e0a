//! Read-through resource cache
//!
//! For each configured kind, a single kind-watch bootstraps from a
//! snapshot and maintains an in-memory mirror; `get`, `list` and the
//! teardown watch are served entirely from memory. The cache is engine
//! -wide: one watch per kind, shared by every controller reading it.

use crate::{error::Error as RuntimeError, metrics};
use ahash::AHashMap;
use corral_core::{
    state::{Event, ListOptions, State, WatchOptions},
    DynamicResource, Error, Kind, Phase, Pointer, Result,
};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

struct TeardownWaiter {
    id: String,
    token: CancellationToken,
}

struct KindCache {
    entries: Arc<RwLock<BTreeMap<String, DynamicResource>>>,
    ready: Arc<watch::Sender<bool>>,
    teardown: Arc<Mutex<Vec<TeardownWaiter>>>,
}

/// The engine-wide read-through cache over a fixed set of kinds.
pub struct ResourceCache {
    state: Arc<dyn State>,
    kinds: AHashMap<Kind, KindCache>,
    metrics_enabled: bool,
}

impl ResourceCache {
    /// A cache mirroring the given kinds; tasks start with [`Self::start`].
    pub fn new(
        state: Arc<dyn State>,
        kinds: impl IntoIterator<Item = Kind>,
        metrics_enabled: bool,
    ) -> Self {
        let kinds = kinds
            .into_iter()
            .map(|kind| {
                (kind, KindCache {
                    entries: Arc::new(RwLock::new(BTreeMap::new())),
                    ready: Arc::new(watch::channel(false).0),
                    teardown: Arc::new(Mutex::new(Vec::new())),
                })
            })
            .collect();
        Self {
            state,
            kinds,
            metrics_enabled,
        }
    }

    /// Spawn one watch task per cached kind.
    pub fn start(&self, cancel: &CancellationToken) {
        for (kind, cache) in &self.kinds {
            let task = KindTask {
                state: self.state.clone(),
                kind: kind.clone(),
                entries: cache.entries.clone(),
                ready: cache.ready.clone(),
                teardown: cache.teardown.clone(),
                metrics_enabled: self.metrics_enabled,
            };
            let cancel = cancel.clone();
            tokio::spawn(async move { task.run(cancel).await });
        }
    }

    /// Whether reads of this kind are served from the cache.
    #[must_use]
    pub fn caches(&self, kind: &Kind) -> bool {
        self.kinds.contains_key(kind)
    }

    async fn await_ready(&self, cache: &KindCache) -> Result<()> {
        let mut rx = cache.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::Cancelled)?;
        Ok(())
    }

    /// Serve a get from memory; queries made after an event reflect it.
    pub async fn get(&self, ptr: &Pointer) -> Result<DynamicResource> {
        let cache = self
            .kinds
            .get(&ptr.kind())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("kind {} is not cached", ptr.kind())))?;
        self.await_ready(cache).await?;
        cache
            .entries
            .read()
            .get(&ptr.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(ptr.clone()))
    }

    /// Serve a list from memory, applying id and label predicates.
    pub async fn list(&self, kind: &Kind, opts: &ListOptions) -> Result<Vec<DynamicResource>> {
        let cache = self
            .kinds
            .get(kind)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("kind {kind} is not cached")))?;
        self.await_ready(cache).await?;
        Ok(cache
            .entries
            .read()
            .values()
            .filter(|res| opts.matches(res))
            .cloned()
            .collect())
    }

    /// A token cancelled once the resource starts tearing down (or is
    /// already gone). Backs `context_with_teardown` for queued runtimes.
    pub async fn watch_for_teardown(
        &self,
        ptr: &Pointer,
    ) -> std::result::Result<CancellationToken, RuntimeError> {
        let cache = self
            .kinds
            .get(&ptr.kind())
            .ok_or_else(|| RuntimeError::UncachedTeardownWatch(ptr.kind()))?;
        self.await_ready(cache).await.map_err(RuntimeError::State)?;

        let token = CancellationToken::new();
        // Registration and the current-state check happen under the entry
        // lock, so a concurrent teardown event cannot slip between them.
        let entries = cache.entries.read();
        match entries.get(&ptr.id) {
            Some(res) if res.metadata.phase == Phase::Running => {
                cache.teardown.lock().push(TeardownWaiter {
                    id: ptr.id.clone(),
                    token: token.clone(),
                });
            }
            _ => token.cancel(),
        }
        Ok(token)
    }
}

struct KindTask {
    state: Arc<dyn State>,
    kind: Kind,
    entries: Arc<RwLock<BTreeMap<String, DynamicResource>>>,
    ready: Arc<watch::Sender<bool>>,
    teardown: Arc<Mutex<Vec<TeardownWaiter>>>,
    metrics_enabled: bool,
}

impl KindTask {
    fn publish_len(&self) {
        if self.metrics_enabled {
            let len = self.entries.read().len();
            metrics::CACHED_RESOURCES
                .with_label_values(&[&self.kind.type_name])
                .set(len as i64);
        }
    }

    fn cancel_waiters(&self, id: &str) {
        let mut waiters = self.teardown.lock();
        waiters.retain(|waiter| {
            if waiter.id == id {
                waiter.token.cancel();
                false
            } else {
                true
            }
        });
    }

    fn apply(&self, res: DynamicResource) {
        let gone = res.metadata.phase != Phase::Running;
        let id = res.metadata.id.clone();
        self.entries.write().insert(id.clone(), res);
        if gone {
            self.cancel_waiters(&id);
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel(100);
        if let Err(err) = self
            .state
            .watch_kind(&self.kind, tx, WatchOptions::bootstrapped())
            .await
        {
            tracing::error!(kind = %self.kind, %err, "cache watch failed to start");
            return;
        }
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Event::Bootstrapped(snapshot) => {
                    {
                        let mut entries = self.entries.write();
                        entries.clear();
                        for res in snapshot {
                            entries.insert(res.metadata.id.clone(), res);
                        }
                    }
                    self.ready.send_replace(true);
                }
                Event::Created(res) => self.apply(res),
                Event::Updated { new, .. } => self.apply(*new),
                Event::Destroyed(res) => {
                    let id = res.metadata.id;
                    self.entries.write().remove(&id);
                    self.cancel_waiters(&id);
                }
                Event::Errored(msg) => {
                    tracing::error!(kind = %self.kind, %msg, "cache watch errored");
                    break;
                }
            }
            self.publish_len();
        }
    }
}
