use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ProbeResult, ProbeWorker, Prober, ResultUpdate, ResultsCache, WorkerSpec};
use crate::crd::{EndpointAddress, ThirdComponent};
use crate::metrics::Metrics;

type WorkerMap = Arc<Mutex<HashMap<EndpointAddress, Arc<ProbeWorker>>>>;

/// Keeps one probe worker per endpoint of a component.
///
/// Workers are diffed against the component's status endpoints on every
/// [`add_third_component`](Self::add_third_component): unchanged workers
/// keep running with their hysteresis state, changed ones are replaced.
pub struct ProbeManager {
    cache: Arc<ResultsCache>,
    updates: tokio::sync::Mutex<mpsc::Receiver<ResultUpdate>>,
    prober: Arc<Prober>,
    metrics: Metrics,
    workers: WorkerMap,
    token: CancellationToken,
}

impl std::fmt::Debug for ProbeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeManager")
            .field("workers", &self.len())
            .field("results", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl ProbeManager {
    /// Creates a manager whose workers stop when `parent` is cancelled.
    #[must_use]
    pub fn new(
        prober: Arc<Prober>,
        metrics: Metrics,
        result_queue_capacity: usize,
        parent: &CancellationToken,
    ) -> Self {
        let (cache, updates) = ResultsCache::new(result_queue_capacity);
        Self {
            cache: Arc::new(cache),
            updates: tokio::sync::Mutex::new(updates),
            prober,
            metrics,
            workers: Arc::default(),
            token: parent.child_token(),
        }
    }

    /// Brings the workers in line with the component's status endpoints.
    ///
    /// Components that are not probed (no probe handler, or not a static
    /// source) lose all their workers.
    pub fn add_third_component(&self, component: &ThirdComponent) {
        let probe = match component.probe() {
            Some(probe) if component.needs_probing() => probe,
            _ => {
                self.remove_third_component(component);
                return;
            }
        };

        let desired: HashMap<EndpointAddress, WorkerSpec> = component
            .status_endpoints()
            .iter()
            .map(|ep| {
                let spec = WorkerSpec {
                    address: ep.address.clone(),
                    probe: probe.clone(),
                };
                (ep.address.clone(), spec)
            })
            .collect();

        let mut stale = Vec::new();
        {
            let mut workers = self.workers.lock();
            workers.retain(|address, worker| {
                let keep = desired.get(address) == Some(worker.spec());
                if !keep {
                    // dropped before any replacement can publish
                    self.cache.remove(worker.endpoint_id());
                    stale.push(Arc::clone(worker));
                }
                keep
            });

            for (address, spec) in desired {
                if workers.contains_key(&address) {
                    continue;
                }
                let worker = ProbeWorker::new(
                    component,
                    spec,
                    Arc::clone(&self.cache),
                    Arc::clone(&self.prober),
                    self.metrics.clone(),
                    self.token.child_token(),
                );
                self.start(&worker);
                tracing::debug!(endpoint = %worker.endpoint_id(), "probe worker started");
                workers.insert(address, worker);
            }
        }

        for worker in stale {
            worker.stop();
        }
    }

    /// Stops every worker and drops their cached results.
    pub fn remove_third_component(&self, component: &ThirdComponent) {
        let drained: Vec<_> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in drained {
            worker.stop();
            self.cache.remove(worker.endpoint_id());
        }
        tracing::debug!(component = %component.key(), "probe workers removed");
    }

    /// Visible result of an endpoint, keyed by
    /// [`ThirdComponent::endpoint_id`].
    #[must_use]
    pub fn get_result(&self, endpoint_id: &str) -> Option<ProbeResult> {
        self.cache.get(endpoint_id)
    }

    /// Waits for the next visible result change.
    ///
    /// Returns `None` once the manager is stopped.
    pub async fn next_update(&self) -> Option<ResultUpdate> {
        let mut updates = self.updates.lock().await;
        tokio::select! {
            () = self.token.cancelled() => None,
            update = updates.recv() => update,
        }
    }

    /// The worker probing `address`.
    #[must_use]
    pub fn worker(&self, address: &EndpointAddress) -> Option<Arc<ProbeWorker>> {
        self.workers.lock().get(address).cloned()
    }

    /// Number of running workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether no worker runs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every worker, present and future.
    pub fn stop(&self) {
        self.token.cancel();
        let drained: Vec<_> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in drained {
            self.cache.remove(worker.endpoint_id());
        }
    }

    /// Whether [`Self::stop`] was called, directly or through the parent token.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &ResultsCache {
        &self.cache
    }

    fn start(&self, worker: &Arc<ProbeWorker>) {
        let workers = Arc::clone(&self.workers);
        let address = worker.spec().address.clone();
        worker.start(move |worker| {
            let mut workers = workers.lock();
            match workers.get(&address) {
                Some(current) if current.id() != worker.id() => return,
                Some(_) => {
                    workers.remove(&address);
                }
                None => {}
            }
            // under the map lock, so no replacement can start in between
            worker.cleanup();
        });
    }
}
