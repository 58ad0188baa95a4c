use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::push_snapshot;
use crate::crd::{EndpointStatus, ThirdComponent, ThirdComponentEndpointStatus};
use crate::error::Result;
use crate::probe::{ProbeManager, ProbeResult};
use crate::registry::EndpointRegistry;

/// Reason recorded on endpoints whose health probe failed.
pub const REASON_PROBE_FAILED: &str = "health probe failed";

/// Endpoints registered for the component in the static registry.
///
/// The registry has no change feed, so [`discover`](Self::discover) polls it
/// and also wakes whenever a probe result changes.
pub struct StaticSource {
    component: ThirdComponent,
    registry: Arc<dyn EndpointRegistry>,
    probe_manager: OnceLock<Arc<ProbeManager>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for StaticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSource")
            .field("component", &self.component.key())
            .field("poll_interval", &self.poll_interval)
            .field("probed", &self.probe_manager.get().is_some())
            .finish_non_exhaustive()
    }
}

impl StaticSource {
    pub(crate) fn new(
        component: &ThirdComponent,
        registry: Arc<dyn EndpointRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            component: component.clone(),
            registry,
            probe_manager: OnceLock::new(),
            poll_interval,
        }
    }

    /// The component this source discovers for.
    #[must_use]
    pub fn component(&self) -> &ThirdComponent {
        &self.component
    }

    /// Attaches the manager that probes this component's endpoints. Only the
    /// first attached manager is kept.
    pub(crate) fn attach_probe_manager(&self, manager: Arc<ProbeManager>) {
        if self.probe_manager.set(manager).is_err() {
            tracing::debug!(component = %self.component.key(), "probe manager already attached");
        }
    }

    pub(crate) fn probe_manager(&self) -> Option<&Arc<ProbeManager>> {
        self.probe_manager.get()
    }

    /// Online endpoints with their probe-derived status.
    ///
    /// The snapshot is handed to the probe manager so its workers follow the
    /// registry.
    pub(crate) async fn discover_one(&self) -> Result<Vec<ThirdComponentEndpointStatus>> {
        let online: BTreeSet<_> = self
            .registry
            .online_endpoints(&self.component.component_id())
            .await?
            .into_iter()
            .collect();

        let probed = self.component.probe().is_some();
        let manager = self.probe_manager();

        let endpoints: Vec<_> = online
            .into_iter()
            .map(|address| {
                if !probed {
                    return ThirdComponentEndpointStatus::new(address, EndpointStatus::Ready);
                }
                let id = self.component.endpoint_id(&address);
                match manager.and_then(|m| m.get_result(&id)) {
                    Some(ProbeResult::Success) => {
                        ThirdComponentEndpointStatus::new(address, EndpointStatus::Ready)
                    }
                    Some(ProbeResult::Failure) => ThirdComponentEndpointStatus {
                        reason: Some(REASON_PROBE_FAILED.to_string()),
                        ..ThirdComponentEndpointStatus::new(address, EndpointStatus::Unhealthy)
                    },
                    Some(ProbeResult::Unknown) | None => {
                        ThirdComponentEndpointStatus::new(address, EndpointStatus::NotReady)
                    }
                }
            })
            .collect();

        if let Some(manager) = manager {
            manager.add_third_component(&self.component.with_endpoints(endpoints.clone()));
        }

        Ok(endpoints)
    }

    /// Polls the registry and follows probe results until `token` fires.
    pub(crate) async fn discover(
        &self,
        token: &CancellationToken,
        updates: &Sender<ThirdComponent>,
    ) -> Result<Vec<ThirdComponentEndpointStatus>> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        let mut last: Option<Vec<ThirdComponentEndpointStatus>> = None;

        loop {
            let snapshot = self.discover_one().await?;
            if last.as_ref() != Some(&snapshot) {
                tracing::debug!(
                    component = %self.component.key(),
                    endpoints = snapshot.len(),
                    "static endpoints changed"
                );
                if !push_snapshot(&self.component, &snapshot, token, updates).await {
                    return Ok(snapshot);
                }
                last = Some(snapshot);
            }

            tokio::select! {
                () = token.cancelled() => return Ok(last.unwrap_or_default()),
                _ = ticker.tick() => {}
                () = probe_changed(self.probe_manager()) => {}
            }
        }
    }
}

async fn probe_changed(manager: Option<&Arc<ProbeManager>>) {
    match manager {
        Some(manager) => {
            if manager.next_update().await.is_none() {
                futures::future::pending::<()>().await;
            }
        }
        None => futures::future::pending().await,
    }
}
