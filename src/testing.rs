//! In-memory fakes and object builders shared by the unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use kube::ResourceExt;
use kube::runtime::watcher::Event;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::client::{ClusterClient, EventSink, SERVICE_NAME_LABEL, SliceWatch};
use crate::crd::{
    COMPONENT_ID_LABEL, EndpointAddress, Probe, TcpSocketAction, ThirdComponent,
    ThirdComponentSpec, ThirdComponentStatus,
};
use crate::error::{Error, Result};

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A component in namespace `default` with a uid and resource version.
pub(crate) fn component(name: &str) -> ThirdComponent {
    let mut c = ThirdComponent::new(name, ThirdComponentSpec::default());
    c.metadata.namespace = Some("default".to_string());
    c.metadata.uid = Some(format!("uid-{name}"));
    c.metadata.resource_version = Some("1".to_string());
    c
}

/// A component taking its endpoints from the static registry.
pub(crate) fn static_component(name: &str) -> ThirdComponent {
    let mut c = component(name);
    c.spec.endpoint_source.static_endpoints = Some(Vec::new());
    c
}

/// A static component with a TCP probe.
pub(crate) fn probed_component(name: &str) -> ThirdComponent {
    let mut c = static_component(name);
    c.spec.probe = Some(Probe {
        tcp_socket: Some(TcpSocketAction {}),
        period_seconds: Some(30),
        ..Probe::default()
    });
    c
}

/// A Service labelled for component `web`. An empty port name leaves the
/// port unnamed.
pub(crate) fn service(name: &str, ports: &[(&str, i32)]) -> Service {
    let mut svc = Service {
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: (!port_name.is_empty()).then(|| (*port_name).to_string()),
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        ..ServicePort::default()
                    })
                    .collect(),
            ),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };
    svc.metadata.name = Some(name.to_string());
    svc.metadata.namespace = Some("default".to_string());
    svc.metadata.labels = Some(BTreeMap::from([(
        COMPONENT_ID_LABEL.to_string(),
        "web".to_string(),
    )]));
    svc
}

/// A slice of ready endpoints behind `service`, all serving port `http`.
pub(crate) fn endpoint_slice(service: &str, name: &str, ips: &[&str], port: i32) -> EndpointSlice {
    let mut slice = EndpointSlice {
        address_type: "IPv4".to_string(),
        endpoints: ips
            .iter()
            .map(|ip| Endpoint {
                addresses: vec![(*ip).to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    ..EndpointConditions::default()
                }),
                ..Endpoint::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            name: Some("http".to_string()),
            port: Some(port),
            ..EndpointPort::default()
        }]),
        ..EndpointSlice::default()
    };
    slice.metadata.name = Some(name.to_string());
    slice.metadata.namespace = Some("default".to_string());
    slice.metadata.labels = Some(BTreeMap::from([(
        SERVICE_NAME_LABEL.to_string(),
        service.to_string(),
    )]));
    slice
}

/// A listener that accepts connections and closes them without a reply, so
/// every request fails in transport. Returns its address and the number of
/// accepted connections.
pub(crate) async fn closing_server() -> (EndpointAddress, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = EndpointAddress::from(listener.local_addr().unwrap().to_string());
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    (address, accepted)
}

/// Records published warnings.
#[derive(Debug, Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<(String, String)>>,
    recorded: Notify,
}

impl RecordingEvents {
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(reason, _)| reason.clone()).collect()
    }

    pub(crate) fn notes(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, note)| note.clone()).collect()
    }

    /// Waits until at least `n` events were published.
    pub(crate) async fn wait_for(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.recorded.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.events.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("events were not published in time");
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn warn(&self, _component: &ThirdComponent, reason: &str, note: String) {
        self.events.lock().push((reason.to_string(), note));
        self.recorded.notify_waiters();
    }
}

/// Applies `patch` onto `target` following RFC 7386: objects merge key by
/// key, `null` deletes, anything else replaces.
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    let Some(target) = target.as_object_mut() else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            merge_patch(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
        }
    }
}

type ObjectKey = (String, String);

fn object_key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
            None => labels.contains_key(term),
        })
}

#[derive(Default)]
struct ClusterState {
    components: HashMap<ObjectKey, ThirdComponent>,
    resource_version: u64,
    conflicts_left: usize,
    services: HashMap<ObjectKey, Service>,
    slices: HashMap<ObjectKey, EndpointSlice>,
    endpoints: HashMap<ObjectKey, Endpoints>,
    watches: VecDeque<SliceWatch>,
}

impl ClusterState {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// An in-memory object store implementing [`ClusterClient`].
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
    status_writes: AtomicUsize,
    endpoints_applies: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores the component under a fresh resource version and returns the
    /// stored copy.
    pub(crate) fn insert_component(&self, mut component: ThirdComponent) -> ThirdComponent {
        let mut state = self.state.lock();
        component.metadata.resource_version = Some(state.next_version());
        let key = object_key(&component.namespace().unwrap_or_default(), &component.name_any());
        state.components.insert(key, component.clone());
        component
    }

    pub(crate) fn remove_component(&self, namespace: &str, name: &str) {
        self.state.lock().components.remove(&object_key(namespace, name));
    }

    /// Simulates a concurrent writer by bumping the resource version.
    pub(crate) fn touch_component(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let version = state.next_version();
        if let Some(c) = state.components.get_mut(&object_key(namespace, name)) {
            c.metadata.resource_version = Some(version);
        }
    }

    pub(crate) fn stored_component(&self, namespace: &str, name: &str) -> Option<ThirdComponent> {
        self.state.lock().components.get(&object_key(namespace, name)).cloned()
    }

    /// Polls until the stored status satisfies `done`.
    pub(crate) async fn wait_for_status(
        &self,
        namespace: &str,
        name: &str,
        done: impl Fn(&ThirdComponentStatus) -> bool,
    ) -> ThirdComponentStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = self
                    .stored_component(namespace, name)
                    .and_then(|c| c.status);
                if let Some(status) = status.filter(|s| done(s)) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("status was not written in time")
    }

    /// Fails the next `n` status writes with a conflict.
    pub(crate) fn fail_status_writes_with_conflict(&self, n: usize) {
        self.state.lock().conflicts_left = n;
    }

    /// Status writes attempted so far, failed ones included.
    pub(crate) fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn add_service(&self, service: Service) {
        let key = object_key(&service.namespace().unwrap_or_default(), &service.name_any());
        self.state.lock().services.insert(key, service);
    }

    pub(crate) fn add_endpoint_slice(&self, slice: EndpointSlice) {
        let key = object_key(&slice.namespace().unwrap_or_default(), &slice.name_any());
        self.state.lock().slices.insert(key, slice);
    }

    /// Queues a watch stream for the next `watch_endpoint_slices` call and
    /// returns its feeding end.
    pub(crate) fn push_watch(&self) -> UnboundedSender<Result<Event<EndpointSlice>>> {
        let (tx, rx) = unbounded();
        self.state.lock().watches.push_back(rx.boxed());
        tx
    }

    pub(crate) fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn endpoints(&self, namespace: &str, name: &str) -> Option<Endpoints> {
        self.state.lock().endpoints.get(&object_key(namespace, name)).cloned()
    }

    pub(crate) fn endpoints_applies(&self) -> usize {
        self.endpoints_applies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_component(&self, namespace: &str, name: &str) -> Result<Option<ThirdComponent>> {
        Ok(self.stored_component(namespace, name))
    }

    async fn patch_component_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &ThirdComponentStatus,
    ) -> Result<ThirdComponent> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let key = object_key(namespace, name);

        let Some(stored_version) = state
            .components
            .get(&key)
            .map(|c| c.metadata.resource_version.clone())
        else {
            return Err(Error::NotFound(format!("thirdcomponent {namespace}/{name}")));
        };
        if state.conflicts_left > 0 {
            state.conflicts_left -= 1;
            return Err(Error::Conflict(format!("thirdcomponent {namespace}/{name}")));
        }
        if resource_version.is_some() && resource_version != stored_version.as_deref() {
            return Err(Error::Conflict(format!("thirdcomponent {namespace}/{name}")));
        }

        let version = state.next_version();
        let Some(component) = state.components.get_mut(&key) else {
            return Err(Error::NotFound(format!("thirdcomponent {namespace}/{name}")));
        };
        // same semantics as the API server's JSON merge patch
        let mut merged = serde_json::to_value(&component.status)?;
        merge_patch(&mut merged, &serde_json::to_value(status)?);
        component.status = serde_json::from_value(merged)?;
        component.metadata.resource_version = Some(version);
        Ok(component.clone())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.state.lock().services.get(&object_key(namespace, name)).cloned())
    }

    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>> {
        let mut services: Vec<_> = self
            .state
            .lock()
            .services
            .values()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .filter(|s| matches_selector(s.labels(), label_selector))
            .cloned()
            .collect();
        services.sort_by_key(ResourceExt::name_any);
        Ok(services)
    }

    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>> {
        let selector = format!("{SERVICE_NAME_LABEL}={service}");
        let mut slices: Vec<_> = self
            .state
            .lock()
            .slices
            .values()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .filter(|s| matches_selector(s.labels(), &selector))
            .cloned()
            .collect();
        slices.sort_by_key(ResourceExt::name_any);
        Ok(slices)
    }

    fn watch_endpoint_slices(&self, _namespace: &str, _service: &str) -> SliceWatch {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .watches
            .pop_front()
            .unwrap_or_else(|| futures::stream::pending().boxed())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        Ok(self.endpoints(namespace, name))
    }

    async fn apply_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        self.endpoints_applies.fetch_add(1, Ordering::SeqCst);
        let key = object_key(&endpoints.namespace().unwrap_or_default(), &endpoints.name_any());
        self.state.lock().endpoints.insert(key, endpoints.clone());
        Ok(())
    }
}
