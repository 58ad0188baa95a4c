use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ProbeResult, Prober, ResultsCache};
use crate::crd::{EndpointAddress, Probe, ThirdComponent};
use crate::metrics::Metrics;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// What a probe worker checks. Two workers with equal specs are interchangeable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Endpoint under test.
    pub address: EndpointAddress,
    /// Probe configuration.
    pub probe: Probe,
}

/// Consecutive-observation counter that decides when a raw probe outcome
/// becomes visible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hysteresis {
    last: ProbeResult,
    run_length: u32,
}

impl Hysteresis {
    /// Records one raw outcome. Returns the result to publish once the run of
    /// equal outcomes reaches its threshold. `Unknown` counts as a failure.
    pub fn observe(
        &mut self,
        raw: ProbeResult,
        success_threshold: u32,
        failure_threshold: u32,
    ) -> Option<ProbeResult> {
        let result = match raw {
            ProbeResult::Success => ProbeResult::Success,
            ProbeResult::Failure | ProbeResult::Unknown => ProbeResult::Failure,
        };

        if result == self.last {
            self.run_length = self.run_length.saturating_add(1);
        } else {
            self.last = result;
            self.run_length = 1;
        }

        let threshold = match result {
            ProbeResult::Success => success_threshold,
            _ => failure_threshold,
        };
        (self.run_length >= threshold).then_some(result)
    }

    /// Direction of the current run.
    #[must_use]
    pub fn last(&self) -> ProbeResult {
        self.last
    }

    /// Length of the current run.
    #[must_use]
    pub fn run_length(&self) -> u32 {
        self.run_length
    }
}

/// Periodically probes one endpoint of one component.
pub struct ProbeWorker {
    id: u64,
    spec: WorkerSpec,
    component: ThirdComponent,
    endpoint_id: String,
    state: Mutex<Hysteresis>,
    cache: Arc<ResultsCache>,
    prober: Arc<Prober>,
    metrics: Metrics,
    token: CancellationToken,
}

impl std::fmt::Debug for ProbeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeWorker")
            .field("id", &self.id)
            .field("endpoint_id", &self.endpoint_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl ProbeWorker {
    pub(crate) fn new(
        component: &ThirdComponent,
        spec: WorkerSpec,
        cache: Arc<ResultsCache>,
        prober: Arc<Prober>,
        metrics: Metrics,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            endpoint_id: component.endpoint_id(&spec.address),
            spec,
            component: component.clone(),
            state: Mutex::new(Hysteresis::default()),
            cache,
            prober,
            metrics,
            token,
        })
    }

    /// Unique id of this worker instance.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// What this worker probes.
    #[must_use]
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Cache key of the probed endpoint.
    #[must_use]
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Current hysteresis state.
    #[must_use]
    pub fn state(&self) -> Hysteresis {
        *self.state.lock()
    }

    /// Asks the worker to stop at its next suspension point.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether [`Self::stop`] was called, directly or through a parent token.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns the probe loop. `on_exit` runs once the loop ends and decides
    /// whether [`Self::cleanup`] runs: a worker replaced for the same endpoint
    /// must leave its successor's result and metric series alone.
    pub(crate) fn start<F>(self: &Arc<Self>, on_exit: F) -> JoinHandle<()>
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.run().await;
            on_exit(&worker);
        })
    }

    async fn run(&self) {
        let period = self.spec.probe.period();

        // spread workers created together across the period
        tokio::select! {
            () = self.token.cancelled() => return,
            () = tokio::time::sleep(jitter(period)) => {}
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                () = self.token.cancelled() => return,
                () = self.do_probe() => {}
            }
        }
    }

    /// Runs one probe and publishes the result once its threshold is met.
    pub(crate) async fn do_probe(&self) {
        let raw = match self
            .prober
            .probe(&self.component, &self.spec.address, &self.spec.probe)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.endpoint_id,
                    error = %e,
                    "probe transport failed, dropping tick"
                );
                return;
            }
        };

        let visible = self.state.lock().observe(
            raw,
            self.spec.probe.success_threshold(),
            self.spec.probe.failure_threshold(),
        );

        if let Some(result) = visible {
            if self.cache.set(&self.endpoint_id, result) {
                tracing::info!(
                    endpoint = %self.endpoint_id,
                    result = result.as_str(),
                    "endpoint health changed"
                );
            }
        }
    }

    /// Drops the endpoint's cached result and metric series.
    pub(crate) fn cleanup(&self) {
        self.cache.remove(&self.endpoint_id);
        self.metrics
            .forget_endpoint(&self.component, self.spec.address.as_str());
        tracing::debug!(endpoint = %self.endpoint_id, "probe worker stopped");
    }
}

fn jitter(period: Duration) -> Duration {
    let millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..millis))
}
