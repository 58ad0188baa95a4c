//! Endpoint discovery: where a component's endpoints come from and the
//! long-lived workers that follow them.
//!
//! An [`EndpointSource`] produces endpoint snapshots, either once
//! ([`EndpointSource::discover_one`]) or continuously
//! ([`EndpointSource::discover`]). A [`DiscoveryWorker`] keeps one source
//! running, and the [`DiscoveryPool`] keeps one worker per component and
//! funnels every snapshot into a single status writer.

mod kubernetes;
mod pool;
mod static_source;
mod worker;

use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

pub use kubernetes::KubernetesSource;
pub use pool::DiscoveryPool;
pub use static_source::{REASON_PROBE_FAILED, StaticSource};
pub use worker::DiscoveryWorker;

use crate::client::ClusterClient;
use crate::config::ControllerConfig;
use crate::crd::{ComponentKey, ThirdComponent, ThirdComponentEndpointStatus};
use crate::error::{Error, Result};
use crate::probe::ProbeManager;
use crate::registry::EndpointRegistry;

/// The endpoint source named by a component's spec.
#[derive(Debug)]
pub enum EndpointSource {
    /// Endpoints of a cluster Service.
    Kubernetes(KubernetesSource),
    /// Endpoints from the static registry.
    Static(StaticSource),
}

impl EndpointSource {
    /// Builds the source declared by `component`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the spec sets both sources or neither.
    pub fn new(
        component: &ThirdComponent,
        client: Arc<dyn ClusterClient>,
        registry: Arc<dyn EndpointRegistry>,
        config: &ControllerConfig,
    ) -> Result<Self> {
        let source = &component.spec.endpoint_source;
        match (&source.kubernetes_service, &source.static_endpoints) {
            (Some(_), Some(_)) => Err(Error::Configuration(
                "endpoint source sets both kubernetesService and staticEndpoints".to_string(),
            )),
            (Some(service), None) if service.name.is_empty() => Err(Error::Configuration(
                "kubernetesService has no name".to_string(),
            )),
            (Some(service), None) => Ok(Self::Kubernetes(KubernetesSource::new(
                component, service, client,
            ))),
            (None, Some(_)) => Ok(Self::Static(StaticSource::new(
                component,
                registry,
                config.static_poll_interval,
            ))),
            (None, None) => Err(Error::Configuration(
                "third component source not supported".to_string(),
            )),
        }
    }

    /// The component this source was built from.
    #[must_use]
    pub fn component(&self) -> &ThirdComponent {
        match self {
            Self::Kubernetes(source) => source.component(),
            Self::Static(source) => source.component(),
        }
    }

    /// Identity of the component.
    #[must_use]
    pub fn key(&self) -> ComponentKey {
        self.component().key()
    }

    /// Whether this source's endpoints are health-checked.
    #[must_use]
    pub fn needs_probing(&self) -> bool {
        matches!(self, Self::Static(_)) && self.component().needs_probing()
    }

    /// Hands the probe manager to a static source. Other sources ignore it.
    pub fn attach_probe_manager(&self, manager: Arc<ProbeManager>) {
        if let Self::Static(source) = self {
            source.attach_probe_manager(manager);
        }
    }

    /// The attached probe manager, if any.
    #[must_use]
    pub fn probe_manager(&self) -> Option<&Arc<ProbeManager>> {
        match self {
            Self::Kubernetes(_) => None,
            Self::Static(source) => source.probe_manager(),
        }
    }

    /// Takes one authoritative snapshot. A missing backing resource yields
    /// zero endpoints.
    ///
    /// # Errors
    ///
    /// Fails when the backing store cannot be read.
    pub async fn discover_one(&self) -> Result<Vec<ThirdComponentEndpointStatus>> {
        match self {
            Self::Kubernetes(source) => source.discover_one().await,
            Self::Static(source) => source.discover_one().await,
        }
    }

    /// Follows the source, pushing a copy of the component onto `updates`
    /// for every changed snapshot. Returns the last snapshot when the
    /// underlying watch ends or `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Fails when the watch or the backing store fails.
    pub async fn discover(
        &self,
        token: &CancellationToken,
        updates: &Sender<ThirdComponent>,
    ) -> Result<Vec<ThirdComponentEndpointStatus>> {
        match self {
            Self::Kubernetes(source) => source.discover(token, updates).await,
            Self::Static(source) => source.discover(token, updates).await,
        }
    }
}

/// Sends the component with `snapshot` as its endpoints. Returns `false` when
/// the token fired or the receiving pool is gone.
async fn push_snapshot(
    component: &ThirdComponent,
    snapshot: &[ThirdComponentEndpointStatus],
    token: &CancellationToken,
    updates: &Sender<ThirdComponent>,
) -> bool {
    let update = component.with_endpoints(snapshot.to_vec());
    tokio::select! {
        () = token.cancelled() => false,
        sent = updates.send(update) => {
            if sent.is_err() {
                tracing::debug!(component = %component.key(), "update queue closed");
            }
            sent.is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KubernetesServiceSource, ThirdComponentEndpoint};
    use crate::registry::MemoryRegistry;
    use crate::testing::{FakeCluster, component};

    fn build(component: &ThirdComponent) -> Result<EndpointSource> {
        EndpointSource::new(
            component,
            Arc::new(FakeCluster::new()),
            Arc::new(MemoryRegistry::new()),
            &ControllerConfig::default(),
        )
    }

    fn kubernetes_service(name: &str) -> Option<KubernetesServiceSource> {
        Some(KubernetesServiceSource {
            namespace: None,
            name: name.to_string(),
        })
    }

    #[test]
    fn builds_the_declared_source() {
        let mut c = component("web");
        c.spec.endpoint_source.kubernetes_service = kubernetes_service("backend");
        assert!(matches!(build(&c), Ok(EndpointSource::Kubernetes(_))));

        let mut c = component("web");
        c.spec.endpoint_source.static_endpoints = Some(vec![ThirdComponentEndpoint {
            address: "10.0.0.1:80".to_string(),
            name: None,
        }]);
        let source = build(&c).unwrap();
        assert!(matches!(source, EndpointSource::Static(_)));
        assert_eq!(source.key(), c.key());
    }

    #[test]
    fn missing_or_ambiguous_source_is_a_configuration_error() {
        let c = component("web");
        assert!(matches!(build(&c), Err(Error::Configuration(_))));

        let mut c = component("web");
        c.spec.endpoint_source.kubernetes_service = kubernetes_service("backend");
        c.spec.endpoint_source.static_endpoints = Some(Vec::new());
        assert!(matches!(build(&c), Err(Error::Configuration(_))));

        let mut c = component("web");
        c.spec.endpoint_source.kubernetes_service = kubernetes_service("");
        assert!(matches!(build(&c), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn push_snapshot_stops_on_closed_queue() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);

        let pushed = push_snapshot(&component("web"), &[], &CancellationToken::new(), &tx).await;
        assert!(!pushed);
    }
}
