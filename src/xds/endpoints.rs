//! High-churn endpoint translation.
//!
//! Endpoints objects change far more often than anything else (every pod
//! start or stop), so they bypass the graph compiler entirely: each watch
//! event is translated straight into ClusterLoadAssignment resources and
//! pushed into the EDS cache, leaving the holdoff/rebuild machinery out
//! of the hot path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier, Address, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use tracing::debug;

use crate::k8s::object::{Endpoints, ObjectRef};
use crate::xds::{BuiltResource, ResourceCache, ENDPOINT_TYPE_URL};

/// Translates Endpoints objects into EDS resources.
///
/// Assignments are keyed by their cluster-load-assignment name so that
/// updates and removals for one service never disturb another's entries.
pub struct EndpointCache {
    cache: Arc<ResourceCache>,
    // CLA name -> owning service, used to drop stale names on update
    entries: Mutex<BTreeMap<String, OwnedAssignment>>,
}

struct OwnedAssignment {
    owner: ObjectRef,
    assignment: ClusterLoadAssignment,
}

impl EndpointCache {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self { cache, entries: Mutex::new(BTreeMap::new()) }
    }

    pub fn resource_cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Apply an added or updated Endpoints object.
    pub fn update(&self, endpoints: &Endpoints) {
        let translated = translate(endpoints);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, owned| owned.owner != endpoints.meta);
        for assignment in translated {
            entries.insert(
                assignment.cluster_name.clone(),
                OwnedAssignment { owner: endpoints.meta.clone(), assignment },
            );
        }
        debug!(object = %endpoints.meta, total = entries.len(), "Endpoint cache updated");
        self.publish(&entries);
    }

    /// Drop every assignment owned by a deleted Endpoints object.
    pub fn remove(&self, meta: &ObjectRef) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, owned| owned.owner != *meta);
        if entries.len() != before {
            debug!(object = %meta, total = entries.len(), "Endpoint cache entries removed");
            self.publish(&entries);
        }
    }

    /// Seed the EDS cache with the current (possibly empty) contents.
    /// Streams registered against version 0 unblock once this runs.
    pub fn publish_initial(&self) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        self.publish(&entries);
    }

    fn publish(&self, entries: &BTreeMap<String, OwnedAssignment>) {
        let resources = entries
            .values()
            .map(|owned| {
                BuiltResource::new(
                    owned.assignment.cluster_name.clone(),
                    ENDPOINT_TYPE_URL,
                    &owned.assignment,
                )
            })
            .collect();
        self.cache.update(resources);
    }
}

/// One Endpoints object fans out into one assignment per distinct port:
/// `ns/name` for unnamed ports, `ns/name/portname` for named ones. These
/// are exactly the names the cluster visitor writes into EdsClusterConfig.
fn translate(endpoints: &Endpoints) -> Vec<ClusterLoadAssignment> {
    let mut assignments: BTreeMap<String, ClusterLoadAssignment> = BTreeMap::new();

    for subset in &endpoints.subsets {
        for port in &subset.ports {
            let cluster_name = match &port.name {
                Some(name) if !name.is_empty() => format!("{}/{}", endpoints.meta, name),
                _ => endpoints.meta.to_string(),
            };
            let assignment = assignments.entry(cluster_name.clone()).or_insert_with(|| {
                ClusterLoadAssignment {
                    cluster_name,
                    endpoints: vec![LocalityLbEndpoints::default()],
                    ..Default::default()
                }
            });
            let locality = &mut assignment.endpoints[0];
            for address in &subset.addresses {
                locality.lb_endpoints.push(lb_endpoint(address, port.port));
            }
        }
    }

    // Stable endpoint ordering keeps the serialized resources, and
    // therefore the cache version, deterministic.
    let mut out: Vec<ClusterLoadAssignment> = assignments.into_values().collect();
    for assignment in &mut out {
        for locality in &mut assignment.endpoints {
            locality.lb_endpoints.sort_by(|a, b| endpoint_key(a).cmp(&endpoint_key(b)));
        }
    }
    out
}

fn lb_endpoint(address: &str, port: u16) -> LbEndpoint {
    LbEndpoint {
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(Address {
                address: Some(AddressType::SocketAddress(SocketAddress {
                    address: address.to_string(),
                    port_specifier: Some(PortSpecifier::PortValue(u32::from(port))),
                    ..Default::default()
                })),
            }),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn endpoint_key(endpoint: &LbEndpoint) -> (String, u32) {
    match &endpoint.host_identifier {
        Some(HostIdentifier::Endpoint(ep)) => match ep.address.as_ref().and_then(|a| a.address.as_ref()) {
            Some(AddressType::SocketAddress(socket)) => (
                socket.address.clone(),
                match socket.port_specifier {
                    Some(PortSpecifier::PortValue(port)) => port,
                    _ => 0,
                },
            ),
            _ => (String::new(), 0),
        },
        _ => (String::new(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::object::{EndpointPort, EndpointSubset};

    fn endpoints(ns: &str, name: &str, subsets: Vec<EndpointSubset>) -> Endpoints {
        Endpoints { meta: ObjectRef::new(ns, name), subsets }
    }

    fn subset(addresses: &[&str], ports: Vec<EndpointPort>) -> EndpointSubset {
        EndpointSubset {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            ports,
        }
    }

    #[test]
    fn unnamed_port_uses_bare_service_name() {
        let translated = translate(&endpoints(
            "default",
            "kuard",
            vec![subset(&["10.0.0.1"], vec![EndpointPort { name: None, port: 8080 }])],
        ));
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0].cluster_name, "default/kuard");
        assert_eq!(translated[0].endpoints[0].lb_endpoints.len(), 1);
    }

    #[test]
    fn named_port_extends_the_assignment_name() {
        let translated = translate(&endpoints(
            "default",
            "kuard",
            vec![subset(
                &["10.0.0.1", "10.0.0.2"],
                vec![EndpointPort { name: Some("http".into()), port: 8080 }],
            )],
        ));
        assert_eq!(translated[0].cluster_name, "default/kuard/http");
        assert_eq!(translated[0].endpoints[0].lb_endpoints.len(), 2);
    }

    #[test]
    fn endpoint_ordering_is_stable_across_permutations() {
        let forward = translate(&endpoints(
            "default",
            "kuard",
            vec![subset(
                &["10.0.0.2", "10.0.0.1"],
                vec![EndpointPort { name: None, port: 8080 }],
            )],
        ));
        let reverse = translate(&endpoints(
            "default",
            "kuard",
            vec![subset(
                &["10.0.0.1", "10.0.0.2"],
                vec![EndpointPort { name: None, port: 8080 }],
            )],
        ));
        assert_eq!(forward, reverse);
    }

    #[test]
    fn update_and_remove_round_trip_through_the_cache() {
        let cache = Arc::new(ResourceCache::new(ENDPOINT_TYPE_URL));
        let endpoint_cache = EndpointCache::new(Arc::clone(&cache));

        endpoint_cache.update(&endpoints(
            "default",
            "kuard",
            vec![subset(&["10.0.0.1"], vec![EndpointPort { name: None, port: 8080 }])],
        ));
        assert_eq!(cache.entry().resources.len(), 1);

        endpoint_cache.update(&endpoints(
            "default",
            "other",
            vec![subset(&["10.0.1.1"], vec![EndpointPort { name: None, port: 80 }])],
        ));
        assert_eq!(cache.entry().resources.len(), 2);

        endpoint_cache.remove(&ObjectRef::new("default", "kuard"));
        let entry = cache.entry();
        assert_eq!(entry.resources.len(), 1);
        assert_eq!(entry.resources[0].name, "default/other");
    }

    #[test]
    fn update_replaces_stale_names_for_the_same_owner() {
        let cache = Arc::new(ResourceCache::new(ENDPOINT_TYPE_URL));
        let endpoint_cache = EndpointCache::new(Arc::clone(&cache));

        endpoint_cache.update(&endpoints(
            "default",
            "kuard",
            vec![subset(
                &["10.0.0.1"],
                vec![EndpointPort { name: Some("http".into()), port: 8080 }],
            )],
        ));
        // Port renamed: the old assignment name must disappear.
        endpoint_cache.update(&endpoints(
            "default",
            "kuard",
            vec![subset(
                &["10.0.0.1"],
                vec![EndpointPort { name: Some("metrics".into()), port: 9090 }],
            )],
        ));

        let entry = cache.entry();
        assert_eq!(entry.resources.len(), 1);
        assert_eq!(entry.resources[0].name, "default/kuard/metrics");
    }
}
