//! Endpoint discovery from a Service's `EndpointSlice`s.
//!
//! # How It Works
//!
//! 1. Reads the referenced Service; a missing Service means zero endpoints
//! 2. Lists (or watches) the `EndpointSlice`s labelled with the Service name
//! 3. Expands every slice address and port into one endpoint status, mapping
//!    the slice port back to the Service port with the same name
//!
//! The watch keeps the last seen slices per name and recomputes the full
//! snapshot on every change, pushing a copy of the component only when the
//! snapshot differs from the previous one.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use kube::runtime::watcher::Event;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::push_snapshot;
use crate::client::ClusterClient;
use crate::crd::{
    EndpointAddress, EndpointStatus, EndpointTargetRef, KubernetesServiceSource, ThirdComponent,
    ThirdComponentEndpointStatus,
};
use crate::error::Result;

/// Mirrors the endpoints backing a Service.
pub struct KubernetesSource {
    component: ThirdComponent,
    namespace: String,
    service: String,
    client: Arc<dyn ClusterClient>,
}

impl std::fmt::Debug for KubernetesSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesSource")
            .field("component", &self.component.key())
            .field("namespace", &self.namespace)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl KubernetesSource {
    pub(crate) fn new(
        component: &ThirdComponent,
        source: &KubernetesServiceSource,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        let namespace = source
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| component.namespace().unwrap_or_default());

        Self {
            component: component.clone(),
            namespace,
            service: source.name.clone(),
            client,
        }
    }

    /// The component this source discovers for.
    #[must_use]
    pub fn component(&self) -> &ThirdComponent {
        &self.component
    }

    /// Namespace and name of the watched Service.
    #[must_use]
    pub fn service(&self) -> (&str, &str) {
        (&self.namespace, &self.service)
    }

    /// Current endpoints of the Service.
    pub(crate) async fn discover_one(&self) -> Result<Vec<ThirdComponentEndpointStatus>> {
        let Some(service) = self.client.get_service(&self.namespace, &self.service).await? else {
            tracing::debug!(
                "service {}/{} not found, no endpoints",
                self.namespace,
                self.service
            );
            return Ok(Vec::new());
        };

        let slices = self
            .client
            .list_endpoint_slices(&self.namespace, &self.service)
            .await?;
        Ok(extract_endpoints(slices.iter(), &service))
    }

    /// Watches the Service's slices until the watch ends or `token` fires.
    pub(crate) async fn discover(
        &self,
        token: &CancellationToken,
        updates: &Sender<ThirdComponent>,
    ) -> Result<Vec<ThirdComponentEndpointStatus>> {
        let mut stream = self
            .client
            .watch_endpoint_slices(&self.namespace, &self.service);
        let mut known = BTreeMap::new();
        let mut relist = None;
        let mut last: Option<Vec<ThirdComponentEndpointStatus>> = None;

        tracing::debug!(
            "starting endpoint slice watch for {}/{}",
            self.namespace,
            self.service
        );

        loop {
            let event = tokio::select! {
                () = token.cancelled() => return Ok(last.unwrap_or_default()),
                event = stream.try_next() => event?,
            };
            let Some(event) = event else {
                tracing::debug!(
                    "endpoint slice watch for {}/{} ended",
                    self.namespace,
                    self.service
                );
                return Ok(last.unwrap_or_default());
            };

            if !process_event(event, &mut known, &mut relist) {
                continue;
            }

            let snapshot = match self
                .client
                .get_service(&self.namespace, &self.service)
                .await?
            {
                Some(service) => extract_endpoints(known.values(), &service),
                None => Vec::new(),
            };

            if last.as_ref() == Some(&snapshot) {
                continue;
            }

            tracing::debug!(
                "kubernetes discovery: {} endpoints for {}/{}",
                snapshot.len(),
                self.namespace,
                self.service
            );
            if !push_snapshot(&self.component, &snapshot, token, updates).await {
                return Ok(snapshot);
            }
            last = Some(snapshot);
        }
    }
}

/// Folds a watch event into the known slices. Returns `true` when the set of
/// slices changed and the snapshot must be recomputed.
///
/// A re-list (`Init` .. `InitDone`) is buffered and swapped in at once, so
/// slices deleted while the watch was down disappear.
fn process_event(
    event: Event<EndpointSlice>,
    known: &mut BTreeMap<String, EndpointSlice>,
    relist: &mut Option<BTreeMap<String, EndpointSlice>>,
) -> bool {
    match event {
        Event::Init => {
            tracing::debug!("endpoint slice watcher initialization event");
            *relist = Some(BTreeMap::new());
            false
        }
        Event::InitApply(slice) => {
            relist
                .get_or_insert_with(BTreeMap::new)
                .insert(slice.name_any(), slice);
            false
        }
        Event::InitDone => {
            *known = relist.take().unwrap_or_default();
            true
        }
        Event::Apply(slice) => {
            known.insert(slice.name_any(), slice);
            true
        }
        Event::Delete(slice) => known.remove(&slice.name_any()).is_some(),
    }
}

/// Expands slices into endpoint statuses, deduplicated by address and sorted.
fn extract_endpoints<'a>(
    slices: impl IntoIterator<Item = &'a EndpointSlice>,
    service: &Service,
) -> Vec<ThirdComponentEndpointStatus> {
    let mut out: BTreeMap<EndpointAddress, ThirdComponentEndpointStatus> = BTreeMap::new();

    for slice in slices {
        let ports = slice.ports.as_deref().unwrap_or_default();

        for ep in &slice.endpoints {
            // An endpoint is ready if conditions.ready is true or unset (defaults to true)
            let ready = ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true);
            let status = if ready {
                EndpointStatus::Ready
            } else {
                EndpointStatus::NotReady
            };

            for addr in &ep.addresses {
                let Ok(ip) = addr.parse::<IpAddr>() else {
                    continue;
                };

                for port in ports {
                    let Some(number) = port.port.and_then(|p| u16::try_from(p).ok()) else {
                        continue;
                    };
                    let address = EndpointAddress::new(&ip.to_string(), number);

                    let entry = out
                        .entry(address.clone())
                        .or_insert_with(|| ThirdComponentEndpointStatus {
                            address,
                            service_port: service_port(service, port.name.as_deref()),
                            status,
                            reason: None,
                            target_ref: ep.target_ref.as_ref().map(EndpointTargetRef::from),
                        });
                    // the same address can show up in several slices during a rollout
                    if status == EndpointStatus::Ready {
                        entry.status = EndpointStatus::Ready;
                    }
                }
            }
        }
    }

    out.into_values().collect()
}

/// The Service port a slice port belongs to. Unnamed ports match the
/// Service's unnamed port.
fn service_port(service: &Service, slice_port_name: Option<&str>) -> Option<i32> {
    let wanted = slice_port_name.unwrap_or_default();
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())?
        .iter()
        .find(|p| p.name.as_deref().unwrap_or_default() == wanted)
        .map(|p| p.port)
}
