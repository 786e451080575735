//! In-memory source object store and the event contract that feeds it.
//!
//! The store holds the last-seen state of every known object, keyed by
//! namespace+name per kind, with no derived state. Event callbacks mutate
//! it and signal the change coalescer; they never wait on the compiler.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::holdoff::HoldoffNotifier;
use crate::k8s::object::{
    AttachedFilter, Endpoints, Ingress, IngressRoute, ObjectRef, Secret, Service, SourceObject,
    TlsCertificateDelegation,
};
use crate::xds::endpoints::EndpointCache;

/// Index of every currently-known source object.
#[derive(Debug, Default)]
pub struct ObjectStore {
    ingress_routes: HashMap<ObjectRef, IngressRoute>,
    ingresses: HashMap<ObjectRef, Ingress>,
    services: HashMap<ObjectRef, Service>,
    secrets: HashMap<ObjectRef, Secret>,
    delegations: HashMap<ObjectRef, TlsCertificateDelegation>,
    filters: HashMap<ObjectRef, AttachedFilter>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object. Endpoints are not stored here; they
    /// belong to the endpoint cache.
    pub fn insert(&mut self, obj: SourceObject) {
        match obj {
            SourceObject::IngressRoute(o) => {
                self.ingress_routes.insert(o.meta.clone(), o);
            }
            SourceObject::Ingress(o) => {
                self.ingresses.insert(o.meta.clone(), o);
            }
            SourceObject::Service(o) => {
                self.services.insert(o.meta.clone(), o);
            }
            SourceObject::Secret(o) => {
                self.secrets.insert(o.meta.clone(), o);
            }
            SourceObject::Delegation(o) => {
                self.delegations.insert(o.meta.clone(), o);
            }
            SourceObject::Filter(o) => {
                self.filters.insert(o.meta.clone(), o);
            }
            SourceObject::Endpoints(_) => {}
        }
    }

    /// Remove an object previously inserted.
    pub fn remove(&mut self, obj: &SourceObject) {
        match obj {
            SourceObject::IngressRoute(o) => {
                self.ingress_routes.remove(&o.meta);
            }
            SourceObject::Ingress(o) => {
                self.ingresses.remove(&o.meta);
            }
            SourceObject::Service(o) => {
                self.services.remove(&o.meta);
            }
            SourceObject::Secret(o) => {
                self.secrets.remove(&o.meta);
            }
            SourceObject::Delegation(o) => {
                self.delegations.remove(&o.meta);
            }
            SourceObject::Filter(o) => {
                self.filters.remove(&o.meta);
            }
            SourceObject::Endpoints(_) => {}
        }
    }

    pub fn ingress_routes(&self) -> impl Iterator<Item = &IngressRoute> {
        self.ingress_routes.values()
    }

    pub fn ingress_route(&self, meta: &ObjectRef) -> Option<&IngressRoute> {
        self.ingress_routes.get(meta)
    }

    pub fn ingresses(&self) -> impl Iterator<Item = &Ingress> {
        self.ingresses.values()
    }

    pub fn service(&self, meta: &ObjectRef) -> Option<&Service> {
        self.services.get(meta)
    }

    pub fn secret(&self, meta: &ObjectRef) -> Option<&Secret> {
        self.secrets.get(meta)
    }

    pub fn delegations(&self) -> impl Iterator<Item = &TlsCertificateDelegation> {
        self.delegations.values()
    }

    pub fn filter(&self, meta: &ObjectRef) -> Option<&AttachedFilter> {
        self.filters.get(meta)
    }

    pub fn is_empty(&self) -> bool {
        self.ingress_routes.is_empty()
            && self.ingresses.is_empty()
            && self.services.is_empty()
            && self.secrets.is_empty()
            && self.delegations.is_empty()
            && self.filters.is_empty()
    }
}

/// Contract consumed from the external event source. Delivery is
/// at-least-once, ordered per object identity only.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: SourceObject);
    fn on_update(&self, old: SourceObject, new: SourceObject);
    fn on_delete(&self, obj: SourceObject);
}

/// Production event handler: mutates the shared store and signals the
/// coalescer. Endpoint membership changes skip the store and the compiler
/// entirely and are translated by the endpoint cache.
pub struct SourceEventHandler {
    store: Arc<RwLock<ObjectStore>>,
    notifier: HoldoffNotifier,
    endpoints: Arc<EndpointCache>,
}

impl SourceEventHandler {
    pub fn new(
        store: Arc<RwLock<ObjectStore>>,
        notifier: HoldoffNotifier,
        endpoints: Arc<EndpointCache>,
    ) -> Self {
        Self { store, notifier, endpoints }
    }

    fn apply(&self, obj: SourceObject, deleted: bool) {
        debug!(kind = obj.kind(), object = %obj.object_ref(), deleted, "Source object event");
        match obj {
            SourceObject::Endpoints(ep) => {
                if deleted {
                    self.endpoints.remove(&ep.meta);
                } else {
                    self.endpoints.update(&ep);
                }
                // No rebuild: endpoint membership does not affect the graph.
                return;
            }
            other => {
                let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
                if deleted {
                    store.remove(&other);
                } else {
                    store.insert(other);
                }
            }
        }
        self.notifier.notify();
    }
}

impl EventHandler for SourceEventHandler {
    fn on_add(&self, obj: SourceObject) {
        self.apply(obj, false);
    }

    fn on_update(&self, _old: SourceObject, new: SourceObject) {
        // Same identity; inserting the new state replaces the old.
        self.apply(new, false);
    }

    fn on_delete(&self, obj: SourceObject) {
        self.apply(obj, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::object::{ServicePort, VirtualHostSpec};

    fn route(ns: &str, name: &str) -> IngressRoute {
        IngressRoute {
            meta: ObjectRef::new(ns, name),
            ingress_class: None,
            virtual_host: Some(VirtualHostSpec { fqdn: "example.com".into(), tls: None, filters: Vec::new() }),
            routes: Vec::new(),
            tcp_proxy: None,
        }
    }

    #[test]
    fn insert_replace_remove() {
        let mut store = ObjectStore::new();
        store.insert(SourceObject::IngressRoute(route("default", "a")));
        store.insert(SourceObject::IngressRoute(route("default", "a")));
        assert_eq!(store.ingress_routes().count(), 1);

        store.insert(SourceObject::Service(Service {
            meta: ObjectRef::new("default", "kuard"),
            ports: vec![ServicePort { name: None, port: 8080, protocol: None }],
        }));
        assert!(store.service(&ObjectRef::new("default", "kuard")).is_some());

        store.remove(&SourceObject::IngressRoute(route("default", "a")));
        assert_eq!(store.ingress_routes().count(), 0);
        assert!(!store.is_empty());
    }

    #[test]
    fn filters_are_indexed_by_identity() {
        let mut store = ObjectStore::new();
        let obj = SourceObject::Filter(AttachedFilter {
            meta: ObjectRef::new("default", "cors"),
            filter_type: "envoy.filters.http.cors".into(),
            config: serde_json::json!({ "allow_origin": ["*"] }),
        });
        store.insert(obj.clone());
        assert_eq!(
            store.filter(&ObjectRef::new("default", "cors")).unwrap().filter_type,
            "envoy.filters.http.cors"
        );

        store.remove(&obj);
        assert!(store.filter(&ObjectRef::new("default", "cors")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn endpoints_are_not_stored() {
        let mut store = ObjectStore::new();
        store.insert(SourceObject::Endpoints(Endpoints {
            meta: ObjectRef::new("default", "kuard"),
            subsets: Vec::new(),
        }));
        assert!(store.is_empty());
    }
}
