//! Derived `Endpoints` objects that route Service traffic to discovered
//! endpoints.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    EndpointAddress as K8sEndpointAddress, EndpointPort, EndpointSubset, Endpoints,
    ObjectReference, Service, ServicePort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{EndpointStatus, ThirdComponent, ThirdComponentEndpointStatus};

/// Annotation naming the component a derived `Endpoints` object belongs to.
pub const COMPONENT_ANNOTATION: &str = "rainbond.io/third-component";

/// Builds the `Endpoints` objects for the component's Services.
///
/// A static component with one declared port fans every endpoint out under
/// that port on a single Service. Otherwise endpoints are grouped by the
/// port they are routed under and each Service gets the groups matching its
/// ports. Unhealthy endpoints and hosts that are not IP addresses are left
/// out.
#[must_use]
pub fn build_endpoints(
    component: &ThirdComponent,
    endpoints: &[ThirdComponentEndpointStatus],
    services: &[Service],
) -> Vec<Endpoints> {
    if services.is_empty() || endpoints.is_empty() {
        return Vec::new();
    }

    if let [declared] = component.spec.ports.as_slice() {
        if component.is_static() {
            let service = services
                .iter()
                .find(|svc| service_ports(svc).iter().any(|p| p.port == declared.port))
                .unwrap_or(&services[0]);
            let port = service_ports(service)
                .iter()
                .find(|p| p.port == declared.port)
                .cloned()
                .unwrap_or_else(|| ServicePort {
                    name: Some(declared.name.clone()).filter(|n| !n.is_empty()),
                    port: declared.port,
                    ..ServicePort::default()
                });
            let all: Vec<_> = endpoints.iter().collect();
            let subsets = subsets_for(component, &port, &all);
            return vec![endpoints_object(component, service, subsets)];
        }
    }

    let mut by_port: BTreeMap<i32, Vec<&ThirdComponentEndpointStatus>> = BTreeMap::new();
    for ep in endpoints {
        if let Some(port) = ep.routed_port() {
            by_port.entry(port).or_default().push(ep);
        }
    }

    services
        .iter()
        .filter_map(|service| {
            let subsets: Vec<_> = service_ports(service)
                .iter()
                .filter_map(|port| {
                    by_port
                        .get(&port.port)
                        .map(|group| subsets_for(component, port, group))
                })
                .flatten()
                .collect();
            let matched = service_ports(service).iter().any(|p| by_port.contains_key(&p.port));
            matched.then(|| endpoints_object(component, service, subsets))
        })
        .collect()
}

/// Empty `Endpoints` objects for the Services that `desired` routes nothing
/// to. Written over stored objects, they drop addresses that are no longer
/// discovered.
#[must_use]
pub fn stale_endpoints(
    component: &ThirdComponent,
    services: &[Service],
    desired: &[Endpoints],
) -> Vec<Endpoints> {
    services
        .iter()
        .filter(|service| !desired.iter().any(|d| d.metadata.name == service.metadata.name))
        .map(|service| endpoints_object(component, service, Vec::new()))
        .collect()
}

/// Whether `stored` was derived from `component`.
#[must_use]
pub fn is_derived_from(stored: &Endpoints, component: &ThirdComponent) -> bool {
    stored.annotations().get(COMPONENT_ANNOTATION) == Some(&component.key().to_string())
}

/// Whether `desired` must be written over `stored`.
#[must_use]
pub fn needs_apply(desired: &Endpoints, stored: Option<&Endpoints>) -> bool {
    let Some(stored) = stored else {
        return true;
    };

    let desired_subsets = desired.subsets.as_deref().unwrap_or_default();
    let stored_subsets = stored.subsets.as_deref().unwrap_or_default();
    if desired_subsets != stored_subsets {
        return true;
    }

    desired
        .annotations()
        .iter()
        .any(|(key, value)| stored.annotations().get(key) != Some(value))
}

fn service_ports(service: &Service) -> &[ServicePort] {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default()
}

/// One subset per target port, so endpoints listening on different ports
/// behind the same service port stay distinguishable.
fn subsets_for(
    component: &ThirdComponent,
    service_port: &ServicePort,
    endpoints: &[&ThirdComponentEndpointStatus],
) -> Vec<EndpointSubset> {
    let mut by_target: BTreeMap<u16, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();

    for ep in endpoints {
        let (Some(ip), Some(target)) = (ep.address.ip(), ep.address.port()) else {
            tracing::debug!(endpoint = %ep.address, "skipping endpoint without ip:port");
            continue;
        };
        let (ready, not_ready) = by_target.entry(target).or_default();
        match ep.status {
            EndpointStatus::Ready => {
                ready.insert(ip.to_string());
            }
            EndpointStatus::NotReady => {
                not_ready.insert(ip.to_string());
            }
            EndpointStatus::Unhealthy => {}
        }
    }

    let target_ref = component_ref(component);
    let to_addresses = |ips: BTreeSet<String>| -> Option<Vec<K8sEndpointAddress>> {
        (!ips.is_empty()).then(|| {
            ips.into_iter()
                .map(|ip| K8sEndpointAddress {
                    ip,
                    target_ref: Some(target_ref.clone()),
                    ..K8sEndpointAddress::default()
                })
                .collect()
        })
    };

    by_target
        .into_iter()
        .filter(|(_, (ready, not_ready))| !ready.is_empty() || !not_ready.is_empty())
        .map(|(target, (ready, not_ready))| EndpointSubset {
            addresses: to_addresses(ready),
            not_ready_addresses: to_addresses(not_ready),
            ports: Some(vec![EndpointPort {
                name: service_port.name.clone(),
                port: i32::from(target),
                protocol: Some(service_port.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
                app_protocol: service_port.app_protocol.clone(),
            }]),
        })
        .collect()
}

/// Reference to the component without its resource version, so derived
/// objects do not change on every status write.
fn component_ref(component: &ThirdComponent) -> ObjectReference {
    ObjectReference {
        api_version: Some(ThirdComponent::api_version(&()).to_string()),
        kind: Some(ThirdComponent::kind(&()).to_string()),
        namespace: component.namespace(),
        name: Some(component.name_any()),
        uid: component.uid(),
        ..ObjectReference::default()
    }
}

fn endpoints_object(
    component: &ThirdComponent,
    service: &Service,
    subsets: Vec<EndpointSubset>,
) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(service.name_any()),
            namespace: service.namespace().or_else(|| component.namespace()),
            labels: service.metadata.labels.clone(),
            annotations: Some(BTreeMap::from([(
                COMPONENT_ANNOTATION.to_string(),
                component.key().to_string(),
            )])),
            owner_references: component.controller_owner_ref(&()).map(|r| vec![r]),
            ..ObjectMeta::default()
        },
        subsets: Some(subsets),
    }
}
