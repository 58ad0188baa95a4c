//! Seams to the cluster: object store access and event publishing.
//!
//! [`ClusterClient`] and [`EventSink`] are traits so the discovery and
//! reconcile logic can run against the real API server through
//! [`KubeClusterClient`] or against fakes in tests.

use std::fmt::Display;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client, Resource, ResourceExt};

use crate::crd::{ThirdComponent, ThirdComponentStatus};
use crate::error::{Error, Result};

/// Label linking an `EndpointSlice` to its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Stream of `EndpointSlice` watch events for one Service.
pub type SliceWatch = BoxStream<'static, Result<Event<EndpointSlice>>>;

/// Object store operations used by discovery and reconciliation.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Reads a component; `None` when it does not exist.
    async fn get_component(&self, namespace: &str, name: &str) -> Result<Option<ThirdComponent>>;

    /// Writes the status sub-resource, failing with [`Error::Conflict`] when
    /// `resource_version` is stale and [`Error::NotFound`] when the component is gone.
    async fn patch_component_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &ThirdComponentStatus,
    ) -> Result<ThirdComponent>;

    /// Reads a Service; `None` when it does not exist.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Lists Services matching a label selector.
    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>>;

    /// Lists the `EndpointSlice`s backing a Service.
    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>>;

    /// Watches the `EndpointSlice`s backing a Service. The stream ends, or
    /// yields an error, when the watch breaks.
    fn watch_endpoint_slices(&self, namespace: &str, service: &str) -> SliceWatch;

    /// Reads an `Endpoints` object; `None` when it does not exist.
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;

    /// Creates or updates an `Endpoints` object.
    async fn apply_endpoints(&self, endpoints: &Endpoints) -> Result<()>;
}

/// Receives operator-facing warnings about a component.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes a warning event. Failures are logged, never returned.
    async fn warn(&self, component: &ThirdComponent, reason: &str, note: String);
}

/// Maps API status codes onto the crate's error kinds.
fn api_error(err: kube::Error, what: impl Display) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(what.to_string()),
        other => Error::Kube(other),
    }
}

/// [`ClusterClient`] and [`EventSink`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
    recorder: Recorder,
}

impl KubeClusterClient {
    /// Wraps a kube client. `field_manager` names both the server-side apply
    /// manager and the event reporter.
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        let field_manager = field_manager.into();
        let reporter = Reporter {
            controller: field_manager.clone(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            field_manager,
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_component(&self, namespace: &str, name: &str) -> Result<Option<ThirdComponent>> {
        let api: Api<ThirdComponent> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_component_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &ThirdComponentStatus,
    ) -> Result<ThirdComponent> {
        let api: Api<ThirdComponent> = Api::namespaced(self.client.clone(), namespace);

        // resourceVersion turns the merge patch into a compare-and-swap
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });

        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, format_args!("thirdcomponent {namespace}/{name}")))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{SERVICE_NAME_LABEL}={service}");
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    fn watch_endpoint_slices(&self, namespace: &str, service: &str) -> SliceWatch {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{SERVICE_NAME_LABEL}={service}");

        // no backoff here: a broken watch ends the stream and the owning
        // discovery worker restarts it
        watcher::watcher(api, WatcherConfig::default().labels(&selector))
            .map_err(|e| Error::Unavailable(e.to_string()))
            .boxed()
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        let namespace = endpoints.namespace().unwrap_or_default();
        let name = endpoints.name_any();
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);

        api.patch(
            &name,
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(endpoints),
        )
        .await
        .map_err(|e| api_error(e, format_args!("endpoints {namespace}/{name}")))?;

        Ok(())
    }
}

#[async_trait]
impl EventSink for KubeClusterClient {
    async fn warn(&self, component: &ThirdComponent, reason: &str, note: String) {
        let event = KubeEvent {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Probe".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, &component.object_ref(&())).await {
            tracing::warn!(
                component = %component.key(),
                error = %e,
                "failed to publish event"
            );
        }
    }
}
