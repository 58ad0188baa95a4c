//! Prometheus metrics for discovery and probing.
//!
//! [`Metrics`] is an owned handle: callers register it into their own
//! [`Registry`] and pass clones into the pool and probers, so isolated
//! instances never share series.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

use kube::ResourceExt;

use crate::crd::ThirdComponent;
use crate::probe::ProbeResult;

/// Counters and gauges exported by the engine.
#[derive(Clone, Debug)]
pub struct Metrics {
    probe_results: IntCounterVec,
    discover_workers: IntGauge,
}

impl Metrics {
    /// Creates the metrics and registers them into `registry`.
    ///
    /// # Errors
    ///
    /// Fails when a metric with the same name is already registered.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let probe_results = IntCounterVec::new(
            Opts::new(
                "thirdcomponent_probe_results_total",
                "Cumulative number of probe outcomes per third component endpoint",
            ),
            &["result", "endpoint", "component", "namespace"],
        )?;
        let discover_workers = IntGauge::new(
            "thirdcomponent_discover_workers",
            "Number of running endpoint discover workers",
        )?;

        registry.register(Box::new(probe_results.clone()))?;
        registry.register(Box::new(discover_workers.clone()))?;

        Ok(Self {
            probe_results,
            discover_workers,
        })
    }

    /// Creates metrics attached to a private registry.
    ///
    /// # Errors
    ///
    /// Only fails if the metric definitions are invalid.
    pub fn unregistered() -> prometheus::Result<Self> {
        Self::new(&Registry::new())
    }

    pub(crate) fn observe_probe(
        &self,
        component: &ThirdComponent,
        endpoint: &str,
        result: ProbeResult,
    ) {
        let namespace = component.namespace().unwrap_or_default();
        let name = component.name_any();
        let labels = [result.as_str(), endpoint, name.as_str(), namespace.as_str()];
        self.probe_results.with_label_values(&labels).inc();
    }

    /// Drops every series of one endpoint.
    pub(crate) fn forget_endpoint(&self, component: &ThirdComponent, endpoint: &str) {
        let namespace = component.namespace().unwrap_or_default();
        let name = component.name_any();
        for result in [ProbeResult::Success, ProbeResult::Failure, ProbeResult::Unknown] {
            let labels = [result.as_str(), endpoint, name.as_str(), namespace.as_str()];
            // absent series are fine
            let _ = self.probe_results.remove_label_values(&labels);
        }
    }

    pub(crate) fn set_discover_workers(&self, count: usize) {
        self.discover_workers
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Current value of the probe outcome counter.
    #[must_use]
    pub fn probe_count(
        &self,
        component: &ThirdComponent,
        endpoint: &str,
        result: ProbeResult,
    ) -> u64 {
        let namespace = component.namespace().unwrap_or_default();
        let name = component.name_any();
        let labels = [result.as_str(), endpoint, name.as_str(), namespace.as_str()];
        self.probe_results
            .get_metric_with_label_values(&labels)
            .map_or(0, |c| c.get())
    }

    /// Current value of the discover worker gauge.
    #[must_use]
    pub fn discover_workers(&self) -> i64 {
        self.discover_workers.get()
    }
}
