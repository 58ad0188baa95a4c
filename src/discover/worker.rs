use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::EndpointSource;
use crate::crd::ThirdComponent;
use crate::probe::ProbeManager;

/// Keeps one [`EndpointSource`] discovering until stopped.
///
/// The source can be swapped while running; the current `discover` call is
/// abandoned and restarted with the new source.
pub struct DiscoveryWorker {
    source: Mutex<Arc<EndpointSource>>,
    swapped: Notify,
    updates: Sender<ThirdComponent>,
    probe_manager: Arc<ProbeManager>,
    token: CancellationToken,
    stopped: AtomicBool,
    restart_backoff: Duration,
}

impl std::fmt::Debug for DiscoveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryWorker")
            .field("component", &self.source.lock().key())
            .field("cancelled", &self.is_cancelled())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl DiscoveryWorker {
    /// `probe_manager` must have been created under `token`, so stopping the
    /// worker also stops its probes.
    pub(crate) fn new(
        source: Arc<EndpointSource>,
        updates: Sender<ThirdComponent>,
        probe_manager: Arc<ProbeManager>,
        token: CancellationToken,
        restart_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            source: Mutex::new(source),
            swapped: Notify::new(),
            updates,
            probe_manager,
            token,
            stopped: AtomicBool::new(false),
            restart_backoff,
        })
    }

    /// The source currently discovered.
    #[must_use]
    pub fn source(&self) -> Arc<EndpointSource> {
        Arc::clone(&self.source.lock())
    }

    /// The probe manager owned by this worker.
    #[must_use]
    pub fn probe_manager(&self) -> &Arc<ProbeManager> {
        &self.probe_manager
    }

    /// Spawns the discover loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.run().await;
            worker.stopped.store(true, Ordering::Release);
        })
    }

    /// Replaces the source and restarts discovery with it.
    pub fn update_discover(&self, source: Arc<EndpointSource>) {
        self.probe_manager.add_third_component(source.component());
        *self.source.lock() = source;
        self.swapped.notify_one();
    }

    /// Cancels the worker and its probes.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the discover loop has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether [`Self::stop`] was called, directly or through a parent token.
    /// The loop may still be winding down.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn run(&self) {
        loop {
            let source = self.source();
            let key = source.key();

            let outcome = tokio::select! {
                () = self.token.cancelled() => break,
                () = self.swapped.notified() => {
                    tracing::debug!(
                        component = %key,
                        "endpoint source replaced, restarting discover"
                    );
                    continue;
                }
                outcome = source.discover(&self.token, &self.updates) => outcome,
            };

            if self.token.is_cancelled() {
                break;
            }

            match outcome {
                Ok(endpoints) => {
                    tracing::debug!(
                        component = %key,
                        endpoints = endpoints.len(),
                        "discover returned, restarting"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        component = %key,
                        error = %e,
                        "discover failed, restarting in {:?}",
                        self.restart_backoff
                    );
                    tokio::select! {
                        () = self.token.cancelled() => break,
                        () = tokio::time::sleep(self.restart_backoff) => {}
                    }
                }
            }
        }

        tracing::debug!(component = %self.source.lock().key(), "discovery worker stopped");
    }
}
