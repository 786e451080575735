//! Breakwater is an Envoy control plane for declarative ingress routing.
//!
//! Source objects (IngressRoutes with cross-namespace delegation, native
//! ingresses, services, TLS secrets and certificate delegations) are held
//! in an [`k8s::store::ObjectStore`] and compiled by [`dag::Builder`]
//! into a routing graph. Visitors translate the graph into Envoy cluster,
//! route, listener and secret resources, which are cached per type and
//! served to proxies over the xDS state-of-the-world protocol. Endpoint
//! churn bypasses the compiler through [`xds::EndpointCache`].
//!
//! The crate is a library plus a thin binary: embedders construct a
//! [`ControlPlane`], feed watch events through the handler returned by
//! [`ControlPlane::event_handler`], and run the server.

pub mod config;
pub mod dag;
pub mod errors;
pub mod holdoff;
pub mod k8s;
pub mod observability;
pub mod xds;

use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{info, warn};

pub use config::ControlPlaneConfig;
pub use errors::{Error, Result};

use crate::dag::Builder;
use crate::holdoff::HoldoffNotifier;
use crate::k8s::status::{LogStatusSink, StatusSink};
use crate::k8s::store::{ObjectStore, SourceEventHandler};
use crate::xds::{CacheSet, EndpointCache, XdsServer};

/// Application version, sourced from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Everything one control plane instance owns: the object store, the
/// resource caches, the endpoint shortcut and the rebuild coalescer.
/// Cloning shares all of it.
#[derive(Clone)]
pub struct ControlPlane {
    config: Arc<ControlPlaneConfig>,
    store: Arc<RwLock<ObjectStore>>,
    caches: CacheSet,
    endpoints: Arc<EndpointCache>,
    notifier: HoldoffNotifier,
    status_sink: Arc<dyn StatusSink>,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self::with_status_sink(config, Arc::new(LogStatusSink))
    }

    /// Use a custom status sink, e.g. one that patches status back onto
    /// the source objects.
    pub fn with_status_sink(
        config: ControlPlaneConfig,
        status_sink: Arc<dyn StatusSink>,
    ) -> Self {
        let caches = CacheSet::new();
        let endpoints = Arc::new(EndpointCache::new(Arc::clone(&caches.endpoints)));
        Self {
            config: Arc::new(config),
            store: Arc::new(RwLock::new(ObjectStore::new())),
            caches,
            endpoints,
            notifier: HoldoffNotifier::new(),
            status_sink,
        }
    }

    /// The handler embedders wire to their watch/informer machinery.
    pub fn event_handler(&self) -> SourceEventHandler {
        SourceEventHandler::new(
            Arc::clone(&self.store),
            self.notifier.clone(),
            Arc::clone(&self.endpoints),
        )
    }

    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    /// Compile the store and push the results into the caches. Runs on
    /// the coalescer's worker; also called once at startup so fresh
    /// streams have something to long-poll against.
    pub fn rebuild(&self) {
        let started = Instant::now();
        let graph = {
            let store = self.store.read().unwrap_or_else(|e| e.into_inner());
            Builder::new(
                &store,
                &self.config.ingress_class,
                self.config.root_namespaces.as_deref(),
            )
            .compile()
        };

        push_if_changed(&self.caches.clusters, xds::cluster::visit(&graph));
        push_if_changed(&self.caches.routes, xds::route::visit(&graph));
        push_if_changed(&self.caches.listeners, xds::listener::visit(&graph, &self.config.envoy));
        push_if_changed(&self.caches.secrets, xds::secret::visit(&graph));

        for (meta, status) in &graph.statuses {
            if let Err(error) = self.status_sink.apply(meta, status) {
                warn!(object = %meta, %error, "Failed to report object status");
            }
        }

        observability::metrics::record_rebuild(&graph, started.elapsed());
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            virtual_hosts = graph.virtual_hosts.len(),
            secure_virtual_hosts = graph.secure_virtual_hosts.len(),
            statuses = graph.statuses.len(),
            "Routing graph rebuilt"
        );
    }

    /// Run the control plane until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        if let Some(address) = self.config.metrics_address {
            observability::metrics::install_exporter(address)?;
        }

        let worker = {
            let control_plane = self.clone();
            self.notifier
                .spawn_worker(self.config.holdoff, move || control_plane.rebuild())
        };

        // Seed every cache so the first streams do not block on an empty
        // version 0 forever.
        self.rebuild();
        self.endpoints.publish_initial();

        let result = XdsServer::new(self.caches.clone()).serve(&self.config.xds, shutdown).await;
        worker.abort();
        result
    }
}

/// The visitors emit deterministically ordered output, so comparing
/// against the current snapshot suppresses no-op updates and keeps
/// parked streams from being woken by an equivalent rebuild. The cache
/// itself bumps its version on every update.
fn push_if_changed(cache: &xds::ResourceCache, resources: Vec<xds::BuiltResource>) {
    let current = cache.entry();
    if current.version > 0 && *current.resources == resources {
        return;
    }
    cache.update(resources);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::object::{
        ObjectRef, RouteSpec, Service, ServicePort, ServiceRef, SourceObject, VirtualHostSpec,
    };
    use crate::k8s::store::EventHandler;
    use crate::xds::cache::Registration;

    #[test]
    fn version_and_name_come_from_cargo() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "breakwater");
    }

    fn ingress_route(ns: &str, name: &str, fqdn: &str, service: &str) -> SourceObject {
        SourceObject::IngressRoute(crate::k8s::object::IngressRoute {
            meta: ObjectRef::new(ns, name),
            ingress_class: None,
            virtual_host: Some(VirtualHostSpec { fqdn: fqdn.into(), tls: None, filters: Vec::new() }),
            routes: vec![RouteSpec {
                match_prefix: "/".into(),
                header_conditions: Vec::new(),
                services: vec![ServiceRef {
                    name: service.into(),
                    port: 8080,
                    weight: None,
                    protocol: None,
                    strategy: None,
                    health_check: None,
                    validation: None,
                }],
                delegate: None,
                enable_websockets: false,
                permit_insecure: false,
                prefix_rewrite: None,
                timeout_policy: None,
                retry_policy: None,
                filters: Vec::new(),
            }],
            tcp_proxy: None,
        })
    }

    #[test]
    fn rebuild_populates_every_graph_backed_cache() {
        let control_plane = ControlPlane::new(ControlPlaneConfig::default());
        let handler = control_plane.event_handler();

        handler.on_add(SourceObject::Service(Service {
            meta: ObjectRef::new("default", "kuard"),
            ports: vec![ServicePort { name: None, port: 8080, protocol: None }],
        }));
        handler.on_add(ingress_route("default", "simple", "example.com", "kuard"));
        control_plane.rebuild();

        let clusters = control_plane.caches().clusters.entry();
        assert_eq!(clusters.version, 1);
        assert_eq!(clusters.resources[0].name, "default/kuard/8080");

        let routes = control_plane.caches().routes.entry();
        assert_eq!(routes.resources.len(), 2);

        assert_eq!(control_plane.caches().listeners.entry().resources.len(), 1);
        // No TLS anywhere: SDS is present but empty.
        assert_eq!(control_plane.caches().secrets.entry().version, 1);
        assert!(control_plane.caches().secrets.entry().resources.is_empty());
    }

    #[test]
    fn identical_rebuild_leaves_versions_alone() {
        let control_plane = ControlPlane::new(ControlPlaneConfig::default());
        let handler = control_plane.event_handler();
        handler.on_add(SourceObject::Service(Service {
            meta: ObjectRef::new("default", "kuard"),
            ports: vec![ServicePort { name: None, port: 8080, protocol: None }],
        }));
        handler.on_add(ingress_route("default", "simple", "example.com", "kuard"));

        control_plane.rebuild();
        let first = control_plane.caches().clusters.entry().version;
        control_plane.rebuild();
        assert_eq!(control_plane.caches().clusters.entry().version, first);
    }

    #[test]
    fn deleting_the_root_drains_the_caches() {
        let control_plane = ControlPlane::new(ControlPlaneConfig::default());
        let handler = control_plane.event_handler();
        let root = ingress_route("default", "simple", "example.com", "kuard");

        handler.on_add(SourceObject::Service(Service {
            meta: ObjectRef::new("default", "kuard"),
            ports: vec![ServicePort { name: None, port: 8080, protocol: None }],
        }));
        handler.on_add(root.clone());
        control_plane.rebuild();
        assert_eq!(control_plane.caches().clusters.entry().resources.len(), 1);

        handler.on_delete(root);
        control_plane.rebuild();
        let entry = control_plane.caches().clusters.entry();
        assert_eq!(entry.version, 2);
        assert!(entry.resources.is_empty());
    }

    #[test]
    fn rebuild_wakes_parked_cache_waiters() {
        let control_plane = ControlPlane::new(ControlPlaneConfig::default());
        let registration = control_plane.caches().clusters.register(0);
        assert!(matches!(registration, Registration::Wait(_)));

        control_plane.rebuild();
        match control_plane.caches().clusters.register(0) {
            Registration::Ready(entry) => assert_eq!(entry.version, 1),
            Registration::Wait(_) => panic!("rebuild must populate the cluster cache"),
        }
    }
}
