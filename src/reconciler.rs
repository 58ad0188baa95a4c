//! One reconcile pass over a third component.
//!
//! # How It Works
//!
//! 1. Reads the component; a missing or deleting component loses its
//!    discovery worker
//! 2. Builds the endpoint source and registers it with the [`DiscoveryPool`]
//! 3. Takes one authoritative snapshot through the registered source
//! 4. Mirrors the snapshot into `Endpoints` objects for the component's
//!    Services, writing only what changed
//! 5. Persists the derived status
//!
//! Between passes the pool's workers keep the status current; every status
//! change triggers a new pass through the owning controller loop.

use std::sync::Arc;

use kube::ResourceExt;
use kube::runtime::controller::Action;

use crate::client::ClusterClient;
use crate::config::ControllerConfig;
use crate::crd::{
    COMPONENT_ID_LABEL, ComponentKey, ComponentPhase, ThirdComponent, ThirdComponentEndpointStatus,
    ThirdComponentStatus,
};
use crate::discover::{DiscoveryPool, EndpointSource};
use crate::error::{Error, Result};
use crate::registry::EndpointRegistry;
use crate::{routing, status};

/// Drives components towards their discovered state.
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    registry: Arc<dyn EndpointRegistry>,
    pool: Arc<DiscoveryPool>,
    config: ControllerConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler registering its sources with `pool`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ClusterClient>,
        registry: Arc<dyn EndpointRegistry>,
        pool: Arc<DiscoveryPool>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            registry,
            pool,
            config,
        }
    }

    /// The pool discovery workers are registered with.
    #[must_use]
    pub fn pool(&self) -> &Arc<DiscoveryPool> {
        &self.pool
    }

    /// Runs one pass for the component named by `key`.
    ///
    /// # Errors
    ///
    /// Snapshot and status write failures are returned for the owning loop
    /// to retry. Misconfigured components are recorded as
    /// [`ComponentPhase::Failed`] and do not fail the pass.
    pub async fn reconcile(&self, key: &ComponentKey) -> Result<Action> {
        let Some(component) = self.client.get_component(&key.namespace, &key.name).await? else {
            tracing::debug!(component = %key, "component not found, dropping discovery");
            self.pool.remove_discover_by_name(key);
            return Ok(Action::await_change());
        };

        if component.metadata.deletion_timestamp.is_some() {
            tracing::debug!(component = %key, "component deleting, dropping discovery");
            self.pool.remove_discover(&component);
            return Ok(Action::await_change());
        }

        let source = match EndpointSource::new(
            &component,
            Arc::clone(&self.client),
            Arc::clone(&self.registry),
            &self.config,
        ) {
            Ok(source) => Arc::new(source),
            Err(Error::Configuration(reason)) => {
                tracing::warn!(component = %key, %reason, "invalid endpoint source");
                self.pool.remove_discover(&component);
                let status = ThirdComponentStatus {
                    phase: ComponentPhase::Failed,
                    reason: Some(reason),
                    endpoints: component.status_endpoints().to_vec(),
                };
                self.persist(&component, status).await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };

        let source = self.pool.add_discover(source);

        let discovered =
            tokio::time::timeout(self.config.discover_timeout, source.discover_one()).await;
        let endpoints = match discovered {
            Ok(Ok(endpoints)) => endpoints,
            Ok(Err(e)) => {
                tracing::warn!(component = %key, error = %e, "endpoint discovery failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(component = %key, "endpoint discovery timed out");
                return Err(Error::Timeout(format!("discovering endpoints of {key}")));
            }
        };

        let mut action = Action::await_change();
        if !component.spec.ports.is_empty() {
            if let Some(requeue) = self.apply_routing(&component, &endpoints).await {
                action = requeue;
            }
        }

        self.persist(&component, status::status_for(endpoints)).await?;
        Ok(action)
    }

    /// Writes the `Endpoints` objects the component's Services need and
    /// empties previously derived ones that no endpoint routes to anymore.
    /// Returns a requeue when routing could not be completed.
    async fn apply_routing(
        &self,
        component: &ThirdComponent,
        endpoints: &[ThirdComponentEndpointStatus],
    ) -> Option<Action> {
        let key = component.key();
        let requeue = Action::requeue(self.config.requeue_after);
        let selector = format!("{COMPONENT_ID_LABEL}={}", component.component_id());

        let services = match self.client.list_services(&key.namespace, &selector).await {
            Ok(services) if services.is_empty() => {
                if endpoints.is_empty() {
                    return None;
                }
                tracing::debug!(component = %key, %selector, "no services yet");
                return Some(requeue);
            }
            Ok(services) => services,
            Err(e) => {
                tracing::warn!(component = %key, error = %e, "failed to list services");
                return Some(requeue);
            }
        };

        let built = routing::build_endpoints(component, endpoints, &services);
        let stale = routing::stale_endpoints(component, &services, &built);
        let routed = built.len();

        let mut incomplete = false;
        for (i, desired) in built.into_iter().chain(stale).enumerate() {
            let name = desired.name_any();
            let stored = match self.client.get_endpoints(&key.namespace, &name).await {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!(
                        component = %key,
                        endpoints = %name,
                        error = %e,
                        "failed to read endpoints"
                    );
                    incomplete = true;
                    continue;
                }
            };

            // only empty objects this component wrote before
            let derived = stored
                .as_ref()
                .is_some_and(|e| routing::is_derived_from(e, component));
            if i >= routed && !derived {
                continue;
            }

            if !routing::needs_apply(&desired, stored.as_ref()) {
                tracing::trace!(component = %key, endpoints = %name, "endpoints up to date");
                continue;
            }

            let write = self.client.apply_endpoints(&desired);
            match tokio::time::timeout(self.config.write_timeout, write).await {
                Ok(Ok(())) => {
                    tracing::info!(component = %key, endpoints = %name, "endpoints applied");
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        component = %key,
                        endpoints = %name,
                        error = %e,
                        "failed to apply endpoints"
                    );
                    incomplete = true;
                }
                Err(_) => {
                    tracing::warn!(
                        component = %key,
                        endpoints = %name,
                        "applying endpoints timed out"
                    );
                    incomplete = true;
                }
            }
        }

        incomplete.then_some(requeue)
    }

    /// Writes `status` unless it is already stored. A vanished component
    /// only drops its worker.
    async fn persist(
        &self,
        component: &ThirdComponent,
        status: ThirdComponentStatus,
    ) -> Result<()> {
        if component.status.as_ref() == Some(&status) {
            return Ok(());
        }

        match status::update_status(self.client.as_ref(), component, &status, &self.config).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(component = %component.key(), "component gone before status write");
                self.pool.remove_discover(component);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Reconcile entry point in the shape `kube::runtime::Controller::run`
/// expects.
///
/// # Errors
///
/// See [`Reconciler::reconcile`].
pub async fn reconcile(component: Arc<ThirdComponent>, ctx: Arc<Reconciler>) -> Result<Action> {
    ctx.reconcile(&component.key()).await
}

/// Requeue policy for failed passes.
#[must_use]
#[allow(clippy::needless_pass_by_value)]
pub fn error_policy(component: Arc<ThirdComponent>, error: &Error, ctx: Arc<Reconciler>) -> Action {
    tracing::error!(component = %component.key(), error = %error, "reconciliation failed");
    match error {
        Error::Configuration(_) => Action::await_change(),
        _ => Action::requeue(ctx.config.requeue_after),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::crd::{ComponentPort, EndpointStatus, KubernetesServiceSource};
    use crate::metrics::Metrics;
    use crate::probe::Prober;
    use crate::registry::MemoryRegistry;
    use crate::testing::{
        FakeCluster, RecordingEvents, component, init_tracing, probed_component, service,
        static_component,
    };

    struct Fixture {
        cluster: Arc<FakeCluster>,
        registry: Arc<MemoryRegistry>,
        reconciler: Arc<Reconciler>,
        token: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            init_tracing();
            let cluster = Arc::new(FakeCluster::new());
            let registry = Arc::new(MemoryRegistry::new());
            let metrics = Metrics::unregistered().unwrap();
            let events = Arc::new(RecordingEvents::default());
            let prober = Prober::new(events, metrics.clone(), 1).unwrap();
            let config = ControllerConfig::default()
                .requeue_after(Duration::from_secs(7))
                .status_retry(3, Duration::from_millis(1));
            let token = CancellationToken::new();
            let pool = DiscoveryPool::new(
                Arc::clone(&cluster) as Arc<dyn ClusterClient>,
                Arc::new(prober),
                metrics,
                config.clone(),
                &token,
            );
            let reconciler = Reconciler::new(
                Arc::clone(&cluster) as Arc<dyn ClusterClient>,
                Arc::clone(&registry) as Arc<dyn EndpointRegistry>,
                pool,
                config,
            );
            Self {
                cluster,
                registry,
                reconciler: Arc::new(reconciler),
                token,
            }
        }

        async fn reconcile(&self, name: &str) -> Result<Action> {
            self.reconciler.reconcile(&ComponentKey::new("default", name)).await
        }

        fn status(&self, name: &str) -> ThirdComponentStatus {
            self.cluster
                .stored_component("default", name)
                .and_then(|c| c.status)
                .unwrap_or_default()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    fn with_port(mut c: ThirdComponent, port: i32) -> ThirdComponent {
        c.spec.ports = vec![ComponentPort {
            name: "http".to_string(),
            port,
        }];
        c
    }

    #[tokio::test]
    async fn single_port_fans_out_and_suppresses_repeat_writes() {
        let fx = Fixture::new();
        fx.cluster.insert_component(with_port(static_component("web"), 80));
        fx.cluster.add_service(service("web", &[("http", 80)]));
        fx.registry.set_online("web", ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);

        assert_eq!(fx.reconcile("web").await.unwrap(), Action::await_change());
        assert_eq!(fx.reconcile("web").await.unwrap(), Action::await_change());

        assert_eq!(fx.cluster.endpoints_applies(), 1);
        let applied = fx.cluster.endpoints("default", "web").unwrap();
        let subsets = applied.subsets.unwrap();
        assert_eq!(subsets.len(), 1);
        assert_eq!(subsets[0].addresses.as_ref().unwrap().len(), 3);
        assert_eq!(subsets[0].ports.as_ref().unwrap()[0].port, 80);

        let status = fx.status("web");
        assert_eq!(status.phase, ComponentPhase::Running);
        assert_eq!(status.endpoints.len(), 3);
        assert_eq!(fx.reconciler.pool().size(), 1);
    }

    #[tokio::test]
    async fn absent_service_leaves_kubernetes_component_pending() {
        let fx = Fixture::new();
        let mut c = component("web");
        c.spec.endpoint_source.kubernetes_service = Some(KubernetesServiceSource {
            namespace: None,
            name: "backend".to_string(),
        });
        fx.cluster.insert_component(c);

        fx.reconcile("web").await.unwrap();

        let status = fx.status("web");
        assert_eq!(status.phase, ComponentPhase::Pending);
        assert_eq!(status.reason.as_deref(), Some("endpoints not found"));
        assert!(status.endpoints.is_empty());
    }

    #[tokio::test]
    async fn recovered_component_drops_its_reason_and_settles() {
        let fx = Fixture::new();
        fx.cluster.insert_component(static_component("web"));

        fx.reconcile("web").await.unwrap();
        assert_eq!(fx.status("web").reason.as_deref(), Some("endpoints not found"));

        fx.registry.set_online("web", ["10.0.0.1:80"]);
        fx.reconcile("web").await.unwrap();

        let status = fx.status("web");
        assert_eq!(status.phase, ComponentPhase::Running);
        assert_eq!(status.reason, None);

        // let the pool writer drain before counting
        tokio::time::sleep(Duration::from_millis(50)).await;
        let writes = fx.cluster.status_writes();
        fx.reconcile("web").await.unwrap();
        assert_eq!(fx.cluster.status_writes(), writes);
    }

    #[tokio::test]
    async fn emptied_source_clears_derived_endpoints() {
        let fx = Fixture::new();
        fx.cluster.insert_component(with_port(static_component("web"), 80));
        fx.cluster.add_service(service("web", &[("http", 80)]));
        fx.registry.set_online("web", ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);

        fx.reconcile("web").await.unwrap();
        let applied = fx.cluster.endpoints("default", "web").unwrap();
        assert_eq!(applied.subsets.unwrap()[0].addresses.as_ref().unwrap().len(), 3);

        fx.registry.remove("web");
        assert_eq!(fx.reconcile("web").await.unwrap(), Action::await_change());

        let cleared = fx.cluster.endpoints("default", "web").unwrap();
        assert_eq!(cleared.subsets, Some(Vec::new()));
        assert_eq!(fx.cluster.endpoints_applies(), 2);
        assert_eq!(fx.status("web").phase, ComponentPhase::Pending);

        // already empty, nothing more to write
        fx.reconcile("web").await.unwrap();
        assert_eq!(fx.cluster.endpoints_applies(), 2);
    }

    #[tokio::test]
    async fn clearing_leaves_foreign_and_missing_endpoints_alone() {
        let fx = Fixture::new();
        fx.cluster.insert_component(with_port(static_component("web"), 80));
        fx.cluster.add_service(service("web", &[("http", 80)]));
        fx.cluster.add_service(service("legacy", &[("http", 80)]));

        let mut foreign = Endpoints::default();
        foreign.metadata.name = Some("legacy".to_string());
        foreign.metadata.namespace = Some("default".to_string());
        foreign.subsets = Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.9.9.9".to_string(),
                ..EndpointAddress::default()
            }]),
            ..EndpointSubset::default()
        }]);
        fx.cluster.apply_endpoints(&foreign).await.unwrap();

        assert_eq!(fx.reconcile("web").await.unwrap(), Action::await_change());

        assert!(fx.cluster.endpoints("default", "web").is_none());
        assert_eq!(fx.cluster.endpoints("default", "legacy"), Some(foreign));
        assert_eq!(fx.cluster.endpoints_applies(), 1);
    }

    #[tokio::test]
    async fn missing_source_fails_the_component() {
        let fx = Fixture::new();
        fx.cluster.insert_component(component("web"));

        assert_eq!(fx.reconcile("web").await.unwrap(), Action::await_change());

        let status = fx.status("web");
        assert_eq!(status.phase, ComponentPhase::Failed);
        assert_eq!(status.reason.as_deref(), Some("third component source not supported"));
        assert_eq!(fx.reconciler.pool().size(), 0);
    }

    #[tokio::test]
    async fn emptied_static_source_goes_pending_and_stops_probing() {
        let fx = Fixture::new();
        fx.cluster.insert_component(probed_component("web"));
        fx.registry.set_online("web", ["127.0.0.1:1", "127.0.0.1:2"]);

        fx.reconcile("web").await.unwrap();
        let status = fx.status("web");
        assert_eq!(status.phase, ComponentPhase::Running);
        assert!(status.endpoints.iter().all(|e| e.status == EndpointStatus::NotReady));

        let worker = fx.reconciler.pool().worker(&ComponentKey::new("default", "web")).unwrap();
        let manager = Arc::clone(worker.probe_manager());
        assert_eq!(manager.len(), 2);
        let probe = manager.worker(&"127.0.0.1:1".into()).unwrap();

        fx.registry.remove("web");
        fx.reconcile("web").await.unwrap();

        let status = fx.status("web");
        assert_eq!(status.phase, ComponentPhase::Pending);
        assert_eq!(status.reason.as_deref(), Some("endpoints not found"));
        assert!(manager.is_empty());
        assert!(probe.is_stopped());
        assert_eq!(manager.get_result(probe.endpoint_id()), None);
    }

    #[tokio::test]
    async fn missing_services_requeue_but_persist_status() {
        let fx = Fixture::new();
        fx.cluster.insert_component(with_port(static_component("web"), 80));
        fx.registry.set_online("web", ["10.0.0.1:80"]);

        let action = fx.reconcile("web").await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(7)));
        assert_eq!(fx.cluster.endpoints_applies(), 0);
        assert_eq!(fx.status("web").phase, ComponentPhase::Running);
    }

    #[tokio::test]
    async fn vanished_and_deleting_components_drop_their_worker() {
        let fx = Fixture::new();
        fx.cluster.insert_component(static_component("web"));
        fx.reconcile("web").await.unwrap();
        assert_eq!(fx.reconciler.pool().size(), 1);

        fx.cluster.remove_component("default", "web");
        assert_eq!(fx.reconcile("web").await.unwrap(), Action::await_change());
        assert_eq!(fx.reconciler.pool().size(), 0);

        let mut deleting = static_component("api");
        deleting.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap());
        fx.cluster.insert_component(deleting);
        fx.reconcile("api").await.unwrap();
        assert_eq!(fx.reconciler.pool().size(), 0);
    }

    #[tokio::test]
    async fn registry_errors_fail_the_pass() {
        let fx = Fixture::new();
        let mut registry = crate::registry::MockEndpointRegistry::new();
        registry
            .expect_online_endpoints()
            .returning(|_| Err(Error::Registry("database unreachable".to_string())));
        let reconciler = Reconciler::new(
            Arc::clone(&fx.cluster) as Arc<dyn ClusterClient>,
            Arc::new(registry),
            Arc::clone(fx.reconciler.pool()),
            ControllerConfig::default(),
        );
        fx.cluster.insert_component(static_component("web"));

        let err = reconciler.reconcile(&ComponentKey::new("default", "web")).await.unwrap_err();

        assert!(matches!(err, Error::Registry(_)));
        assert!(fx.cluster.stored_component("default", "web").unwrap().status.is_none());
    }

    #[tokio::test]
    async fn error_policy_requeues_transient_errors() {
        let fx = Fixture::new();
        let c = Arc::new(component("web"));

        let action = error_policy(
            Arc::clone(&c),
            &Error::Unavailable("api server".to_string()),
            Arc::clone(&fx.reconciler),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(7)));

        let bad = Error::Configuration("bad".to_string());
        let action = error_policy(c, &bad, Arc::clone(&fx.reconciler));
        assert_eq!(action, Action::await_change());
    }
}
