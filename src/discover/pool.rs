use std::collections::HashMap;
use std::sync::{Arc, Weak};

use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DiscoveryWorker, EndpointSource};
use crate::client::ClusterClient;
use crate::config::ControllerConfig;
use crate::crd::{ComponentKey, ThirdComponent};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::probe::{ProbeManager, Prober};
use crate::status;

/// One discovery worker per component, plus the single task that writes
/// every discovered change back to the component's status.
pub struct DiscoveryPool {
    workers: Mutex<HashMap<ComponentKey, Arc<DiscoveryWorker>>>,
    updates: mpsc::Sender<ThirdComponent>,
    client: Arc<dyn ClusterClient>,
    prober: Arc<Prober>,
    metrics: Metrics,
    config: ControllerConfig,
    token: CancellationToken,
}

impl std::fmt::Debug for DiscoveryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryPool")
            .field("workers", &self.size())
            .finish_non_exhaustive()
    }
}

impl DiscoveryPool {
    /// Creates the pool and spawns its status writer. Everything the pool
    /// starts stops when `parent` is cancelled.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        prober: Arc<Prober>,
        metrics: Metrics,
        config: ControllerConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (updates, rx) = mpsc::channel(config.update_queue_capacity);
        let token = parent.child_token();

        let pool = Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            updates,
            client,
            prober,
            metrics,
            config,
            token: token.clone(),
        });

        tokio::spawn(consume(Arc::downgrade(&pool), rx, token));
        pool
    }

    /// Registers a source, starting or hot-swapping its component's worker.
    ///
    /// Returns the registered source; static sources come back with their
    /// probe manager attached.
    pub fn add_discover(&self, source: Arc<EndpointSource>) -> Arc<EndpointSource> {
        let key = source.key();
        let mut workers = self.workers.lock();

        if let Some(existing) = workers.get(&key) {
            if !existing.is_cancelled() {
                if source.needs_probing() {
                    source.attach_probe_manager(Arc::clone(existing.probe_manager()));
                }
                existing.update_discover(Arc::clone(&source));
                tracing::debug!(component = %key, "discovery worker updated");
                return source;
            }
            tracing::debug!(component = %key, "replacing stopped discovery worker");
        }

        let worker_token = self.token.child_token();
        let probe_manager = Arc::new(ProbeManager::new(
            Arc::clone(&self.prober),
            self.metrics.clone(),
            self.config.result_queue_capacity,
            &worker_token,
        ));
        if source.needs_probing() {
            source.attach_probe_manager(Arc::clone(&probe_manager));
        }

        let worker = DiscoveryWorker::new(
            Arc::clone(&source),
            self.updates.clone(),
            probe_manager,
            worker_token,
            self.config.watch_restart_backoff,
        );
        worker.start();
        workers.insert(key.clone(), worker);
        self.metrics.set_discover_workers(workers.len());

        tracing::info!(component = %key, "discovery worker started");
        source
    }

    /// Stops and forgets the worker of `component`.
    pub fn remove_discover(&self, component: &ThirdComponent) {
        self.remove_discover_by_name(&component.key());
    }

    /// Stops and forgets the worker registered under `key`. Unknown keys are
    /// ignored.
    pub fn remove_discover_by_name(&self, key: &ComponentKey) {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.remove(key) {
            worker.stop();
            tracing::info!(component = %key, "discovery worker removed");
        }
        self.metrics.set_discover_workers(workers.len());
    }

    /// The worker registered under `key`.
    #[must_use]
    pub fn worker(&self, key: &ComponentKey) -> Option<Arc<DiscoveryWorker>> {
        self.workers.lock().get(key).cloned()
    }

    /// Number of registered workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stops every worker and the status writer.
    pub fn shutdown(&self) {
        self.token.cancel();
        let mut workers = self.workers.lock();
        workers.clear();
        self.metrics.set_discover_workers(0);
    }

    async fn handle_update(&self, update: ThirdComponent) {
        let key = update.key();
        match tokio::time::timeout(self.config.write_timeout, self.sync_status(&update)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_not_found() => {
                tracing::debug!(component = %key, "component gone, dropping its discovery worker");
                self.remove_discover_by_name(&key);
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    component = %key,
                    error = %e,
                    "failed to write discovered endpoints"
                );
            }
            Err(_) => {
                tracing::warn!(component = %key, "writing discovered endpoints timed out");
            }
        }
    }

    async fn sync_status(&self, update: &ThirdComponent) -> Result<()> {
        let key = update.key();
        let stored = self
            .client
            .get_component(&key.namespace, &key.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("thirdcomponent {key}")))?;

        if stored.status_endpoints() == update.status_endpoints() {
            tracing::trace!(component = %key, "endpoints unchanged");
            return Ok(());
        }

        let status = status::status_for(update.status_endpoints().to_vec());
        tracing::info!(
            component = %key,
            resource_version = stored.resource_version().unwrap_or_default(),
            phase = ?status.phase,
            "endpoints changed, updating status"
        );
        status::update_status(self.client.as_ref(), &stored, &status, &self.config).await?;
        Ok(())
    }
}

/// Drains the update queue, one write at a time.
async fn consume(
    pool: Weak<DiscoveryPool>,
    mut rx: mpsc::Receiver<ThirdComponent>,
    token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            () = token.cancelled() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.handle_update(update).await;
    }
    tracing::debug!("discovery pool writer stopped");
}
