#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Endpoint discovery and health probing for externally-run Kubernetes components.
//!
//! A `ThirdComponent` adopts a workload that runs outside the cluster's
//! scheduler into the cluster's routing fabric. This crate keeps the
//! component's endpoints current, from a Service's `EndpointSlice`s or from a
//! static endpoint registry, health-checks static endpoints, and mirrors the
//! result into native `Endpoints` objects.
//!
//! # Features
//!
//! - **Continuous discovery**: one long-lived worker per component, watch or
//!   poll driven, restarted on failure
//! - **Health probing**: HTTP GET and TCP probes with success and failure
//!   thresholds, so a single blip never flips an endpoint
//! - **Idempotent writes**: status and `Endpoints` objects are only written
//!   when their content changes
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use kube::runtime::Controller;
//! use thirdcomponent::{
//!     ControllerConfig, DiscoveryPool, KubeClusterClient, MemoryRegistry, Metrics, Prober,
//!     Reconciler, ThirdComponent, error_policy, reconcile,
//! };
//!
//! let client = kube::Client::try_default().await?;
//! let config = ControllerConfig::new("thirdcomponent-controller");
//! let cluster = Arc::new(KubeClusterClient::new(client.clone(), &config.field_manager));
//! let metrics = Metrics::new(prometheus::default_registry())?;
//! let prober = Arc::new(Prober::new(cluster.clone(), metrics.clone(), config.probe_attempts)?);
//!
//! let token = tokio_util::sync::CancellationToken::new();
//! let pool = DiscoveryPool::new(cluster.clone(), prober, metrics, config.clone(), &token);
//! let reconciler = Arc::new(Reconciler::new(
//!     cluster,
//!     Arc::new(MemoryRegistry::new()),
//!     pool,
//!     config,
//! ));
//!
//! Controller::new(kube::Api::<ThirdComponent>::all(client), Default::default())
//!     .run(reconcile, error_policy, reconciler)
//!     .for_each(|_| futures::future::ready(()))
//!     .await;
//! ```

mod client;
mod config;
mod crd;
mod discover;
mod error;
mod metrics;
mod probe;
mod reconciler;
mod registry;
mod routing;
mod status;

#[cfg(test)]
mod testing;

pub use client::{ClusterClient, EventSink, KubeClusterClient, SERVICE_NAME_LABEL, SliceWatch};
pub use config::ControllerConfig;
pub use crd::{
    COMPONENT_ID_LABEL, ComponentKey, ComponentPhase, ComponentPort, EndpointAddress,
    EndpointStatus, EndpointTargetRef, HttpGetAction, HttpHeader, KubernetesServiceSource, Probe,
    ProbeHandler, TcpSocketAction, ThirdComponent, ThirdComponentEndpoint,
    ThirdComponentEndpointSource, ThirdComponentEndpointStatus, ThirdComponentSpec,
    ThirdComponentStatus,
};
pub use discover::{
    DiscoveryPool, DiscoveryWorker, EndpointSource, KubernetesSource, REASON_PROBE_FAILED,
    StaticSource,
};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use probe::{
    Hysteresis, ProbeManager, ProbeResult, ProbeWorker, Prober, ResultUpdate, ResultsCache,
    WorkerSpec,
};
pub use reconciler::{Reconciler, error_policy, reconcile};
pub use registry::{EndpointRegistry, MemoryRegistry};
pub use routing::{
    COMPONENT_ANNOTATION, build_endpoints, is_derived_from, needs_apply, stale_endpoints,
};
pub use status::{REASON_NO_ENDPOINTS, REASON_UNHEALTHY, derive_phase, status_for, update_status};
