//! The `ThirdComponent` custom resource and its status types.
//!
//! A third component describes a workload that runs outside the platform's
//! scheduler. Its spec names where endpoints come from (a cluster Service or
//! a static registry), which ports it serves and, optionally, how each
//! endpoint is health-checked. The status mirrors the discovered endpoints.
#![allow(missing_docs)]

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the platform id of a component. Services belonging to the
/// component and registry entries are keyed by it.
pub const COMPONENT_ID_LABEL: &str = "service_id";

/// Desired state of an adopted external component.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "rainbond.io",
    version = "v1alpha1",
    kind = "ThirdComponent",
    plural = "thirdcomponents",
    shortname = "tpc",
    namespaced,
    status = "ThirdComponentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ThirdComponentSpec {
    /// Health check applied to every endpoint of a static source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<Probe>,

    /// Service ports the component is reachable on.
    #[serde(default)]
    pub ports: Vec<ComponentPort>,

    /// Where the endpoints of the component come from.
    pub endpoint_source: ThirdComponentEndpointSource,
}

/// A declared service port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPort {
    /// Port name.
    #[serde(default)]
    pub name: String,
    /// Port number.
    pub port: i32,
}

/// Exactly one of the fields must be set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThirdComponentEndpointSource {
    /// Endpoints maintained in the static registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_endpoints: Option<Vec<ThirdComponentEndpoint>>,

    /// A Service whose backing endpoints are mirrored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_service: Option<KubernetesServiceSource>,
}

/// A declared static endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThirdComponentEndpoint {
    /// `host:port`, optionally prefixed with `http://` or `https://`.
    pub address: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Reference to a Service in the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesServiceSource {
    /// Namespace of the Service, the component's own namespace when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Service name.
    pub name: String,
}

/// Health check configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// HTTP GET handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    /// TCP connect handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketAction>,
    /// Seconds between probes. Defaults to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    /// Seconds before a probe times out. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    /// Consecutive successes before an endpoint is reported healthy. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,
    /// Consecutive failures before an endpoint is reported unhealthy. Defaults to 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

/// HTTP GET probe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetAction {
    /// Request path.
    #[serde(default)]
    pub path: String,
    /// Extra request headers.
    #[serde(default)]
    pub http_headers: Vec<HttpHeader>,
}

/// A single HTTP header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HttpHeader {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// TCP connect probe. The endpoint address is the target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TcpSocketAction {}

/// The handler a [`Probe`] runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeHandler<'a> {
    /// Issue an HTTP GET.
    HttpGet(&'a HttpGetAction),
    /// Open a TCP connection.
    TcpSocket,
}

fn positive_or(value: Option<i32>, default: u32) -> u32 {
    value
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl Probe {
    /// The configured handler, HTTP taking precedence over TCP.
    #[must_use]
    pub fn handler(&self) -> Option<ProbeHandler<'_>> {
        if let Some(http) = &self.http_get {
            return Some(ProbeHandler::HttpGet(http));
        }
        self.tcp_socket.as_ref().map(|_| ProbeHandler::TcpSocket)
    }

    /// Interval between probes.
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_secs(u64::from(positive_or(self.period_seconds, 10)))
    }

    /// Deadline of a single probe.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(positive_or(self.timeout_seconds, 1)))
    }

    /// Consecutive successes needed to report success.
    #[must_use]
    pub fn success_threshold(&self) -> u32 {
        positive_or(self.success_threshold, 1)
    }

    /// Consecutive failures needed to report failure.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        positive_or(self.failure_threshold, 3)
    }
}

/// Lifecycle phase of a component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ComponentPhase {
    /// No endpoints discovered yet.
    #[default]
    Pending,
    /// Endpoints discovered and none unhealthy.
    Running,
    /// Misconfigured, or at least one endpoint is unhealthy.
    Failed,
}

/// Health of one endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EndpointStatus {
    /// Serving traffic.
    Ready,
    /// Known but not serving.
    #[default]
    NotReady,
    /// Failed its health check.
    Unhealthy,
}

/// Observed state of a component.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThirdComponentStatus {
    /// Current phase.
    #[serde(default)]
    pub phase: ComponentPhase,
    /// Human readable explanation of the phase. Always serialized, so a
    /// merge patch with `None` clears a previously written reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Discovered endpoints.
    #[serde(default)]
    pub endpoints: Vec<ThirdComponentEndpointStatus>,
}

/// One discovered endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThirdComponentEndpointStatus {
    /// Endpoint identity.
    pub address: EndpointAddress,
    /// Service port this endpoint backs, when it differs from the address port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<i32>,
    /// Health.
    #[serde(default)]
    pub status: EndpointStatus,
    /// Why the endpoint has its status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Object the endpoint was discovered from. Never owned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<EndpointTargetRef>,
}

impl ThirdComponentEndpointStatus {
    /// Creates an endpoint with the given address and status.
    #[must_use]
    pub fn new(address: impl Into<EndpointAddress>, status: EndpointStatus) -> Self {
        Self {
            address: address.into(),
            status,
            ..Self::default()
        }
    }

    /// The port traffic for this endpoint is routed under.
    #[must_use]
    pub fn routed_port(&self) -> Option<i32> {
        self.service_port
            .or_else(|| self.address.port().map(i32::from))
    }
}

/// Weak reference to the object an endpoint came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl From<&ObjectReference> for EndpointTargetRef {
    fn from(r: &ObjectReference) -> Self {
        Self {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            namespace: r.namespace.clone(),
            name: r.name.clone(),
            uid: r.uid.clone(),
            resource_version: r.resource_version.clone(),
        }
    }
}

impl From<&EndpointTargetRef> for ObjectReference {
    fn from(r: &EndpointTargetRef) -> Self {
        Self {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            namespace: r.namespace.clone(),
            name: r.name.clone(),
            uid: r.uid.clone(),
            resource_version: r.resource_version.clone(),
            ..Self::default()
        }
    }
}

/// An endpoint address: `host:port`, optionally with an HTTP scheme.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct EndpointAddress(String);

impl EndpointAddress {
    /// Builds `host:port`, bracketing IPv6 hosts.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        if host.contains(':') && !host.starts_with('[') {
            Self(format!("[{host}]:{port}"))
        } else {
            Self(format!("{host}:{port}"))
        }
    }

    /// The address as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `http` or `https` when the address carries a scheme.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// The `host[:port]` part, without scheme or path.
    #[must_use]
    pub fn authority(&self) -> &str {
        let rest = self.0.split_once("://").map_or(self.0.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }

    /// Host name or IP, without IPv6 brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        let authority = self.authority();
        if let Some(rest) = authority.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        match authority.rsplit_once(':') {
            Some((host, _)) if !host.contains(':') => host,
            _ => authority,
        }
    }

    /// Explicit port, or the scheme's default port.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        let authority = self.authority();
        let explicit = if authority.starts_with('[') {
            authority.rsplit_once("]:").map(|(_, port)| port)
        } else {
            authority
                .rsplit_once(':')
                .filter(|(host, _)| !host.contains(':'))
                .map(|(_, port)| port)
        };
        match explicit {
            Some(port) => port.parse().ok(),
            None => match self.scheme() {
                Some("https") => Some(443),
                Some("http") => Some(80),
                _ => None,
            },
        }
    }

    /// The host parsed as an IP address.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.host().parse().ok()
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EndpointAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl From<&str> for EndpointAddress {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

/// Identity of a component: namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentKey {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl ComponentKey {
    /// Creates a key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&ThirdComponent> for ComponentKey {
    fn from(component: &ThirdComponent) -> Self {
        Self::new(
            component.namespace().unwrap_or_default(),
            component.name_any(),
        )
    }
}

impl ThirdComponent {
    /// Identity used by the discovery pool.
    #[must_use]
    pub fn key(&self) -> ComponentKey {
        ComponentKey::from(self)
    }

    /// Platform id from the `service_id` label, or the object name.
    #[must_use]
    pub fn component_id(&self) -> String {
        self.labels()
            .get(COMPONENT_ID_LABEL)
            .cloned()
            .unwrap_or_else(|| self.name_any())
    }

    /// Cache key of one endpoint of this component.
    #[must_use]
    pub fn endpoint_id(&self, address: &EndpointAddress) -> String {
        format!(
            "{}/{}/{address}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// The probe, if one with a handler is declared.
    #[must_use]
    pub fn probe(&self) -> Option<&Probe> {
        self.spec.probe.as_ref().filter(|p| p.handler().is_some())
    }

    /// Whether the component takes its endpoints from the static registry.
    #[must_use]
    pub fn is_static(&self) -> bool {
        let source = &self.spec.endpoint_source;
        source.static_endpoints.is_some() && source.kubernetes_service.is_none()
    }

    /// Whether endpoints of this component are actively health-checked.
    #[must_use]
    pub fn needs_probing(&self) -> bool {
        self.is_static() && self.probe().is_some()
    }

    /// Endpoints currently recorded in the status.
    #[must_use]
    pub fn status_endpoints(&self) -> &[ThirdComponentEndpointStatus] {
        self.status.as_ref().map_or(&[], |s| s.endpoints.as_slice())
    }

    /// A copy of the component whose status carries `endpoints`.
    #[must_use]
    pub fn with_endpoints(&self, endpoints: Vec<ThirdComponentEndpointStatus>) -> Self {
        let mut component = self.clone();
        component.status.get_or_insert_with(ThirdComponentStatus::default).endpoints = endpoints;
        component
    }
}
