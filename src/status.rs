//! Phase derivation and conflict-safe status writes.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use kube::ResourceExt;

use crate::client::ClusterClient;
use crate::config::ControllerConfig;
use crate::crd::{
    ComponentPhase, EndpointStatus, ThirdComponent, ThirdComponentEndpointStatus,
    ThirdComponentStatus,
};
use crate::error::{Error, Result};

/// Reason recorded when a component has no endpoints.
pub const REASON_NO_ENDPOINTS: &str = "endpoints not found";

/// Reason recorded when at least one endpoint failed its health check.
pub const REASON_UNHEALTHY: &str = "endpoint unhealthy";

/// Phase and reason implied by a set of endpoints.
#[must_use]
pub fn derive_phase(
    endpoints: &[ThirdComponentEndpointStatus],
) -> (ComponentPhase, Option<String>) {
    if endpoints.is_empty() {
        return (ComponentPhase::Pending, Some(REASON_NO_ENDPOINTS.to_string()));
    }
    if endpoints.iter().any(|ep| ep.status == EndpointStatus::Unhealthy) {
        return (ComponentPhase::Failed, Some(REASON_UNHEALTHY.to_string()));
    }
    (ComponentPhase::Running, None)
}

/// Status carrying `endpoints` and the phase they imply.
#[must_use]
pub fn status_for(endpoints: Vec<ThirdComponentEndpointStatus>) -> ThirdComponentStatus {
    let (phase, reason) = derive_phase(&endpoints);
    ThirdComponentStatus {
        phase,
        reason,
        endpoints,
    }
}

/// Writes `status` onto the stored component.
///
/// The write carries the component's `resourceVersion`; on a conflict the
/// component is re-read and the write retried with exponential backoff.
///
/// # Errors
///
/// [`Error::NotFound`] when the component is gone, [`Error::Conflict`] when
/// retries are exhausted, [`Error::Timeout`] when a write exceeds the
/// configured bound, or any other client error.
pub async fn update_status(
    client: &dyn ClusterClient,
    component: &ThirdComponent,
    status: &ThirdComponentStatus,
    config: &ControllerConfig,
) -> Result<ThirdComponent> {
    let namespace = component.namespace().unwrap_or_default();
    let name = component.name_any();

    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.status_retry_delay)
        .with_max_delay(config.status_retry_delay.saturating_mul(32))
        .with_max_times(config.status_retries)
        .with_jitter()
        .build();

    let mut resource_version = component.resource_version();
    let mut last_err = None;

    for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
        if attempt > 0 {
            tokio::time::sleep(delay).await;

            let Some(fresh) = client.get_component(&namespace, &name).await? else {
                return Err(Error::NotFound(format!("thirdcomponent {namespace}/{name}")));
            };
            if fresh.status.as_ref() == Some(status) {
                return Ok(fresh);
            }
            resource_version = fresh.resource_version();
        }

        let write =
            client.patch_component_status(&namespace, &name, resource_version.as_deref(), status);
        match tokio::time::timeout(config.write_timeout, write).await {
            Ok(Ok(updated)) => {
                tracing::debug!(
                    component = %component.key(),
                    phase = ?status.phase,
                    endpoints = status.endpoints.len(),
                    "status updated"
                );
                return Ok(updated);
            }
            Ok(Err(e)) if e.is_conflict() => {
                tracing::debug!(component = %component.key(), "status write conflicted, retrying");
                last_err = Some(e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Timeout(format!("status write for {namespace}/{name}")));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Conflict(format!("thirdcomponent {namespace}/{name}"))))
}
