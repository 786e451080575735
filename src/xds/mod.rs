//! xDS resource production and serving.
//!
//! The compiled graph is translated into Envoy protobuf resources by the
//! visitor modules (`cluster`, `route`, `listener`, `secret`), stored in
//! per-type [`ResourceCache`]s, and served to proxies by the gRPC stream
//! layer in `server` and `stream`. Endpoint data takes a shortcut: the
//! [`EndpointCache`] translates watch events straight into EDS resources
//! without a graph rebuild.

pub mod cache;
pub mod cluster;
pub mod endpoints;
pub mod listener;
pub mod route;
pub mod secret;
pub mod server;
pub mod stream;

use envoy_types::pb::google::protobuf::Any;
use prost::Message;

pub use cache::{CacheEntry, Registration, ResourceCache};
pub use endpoints::EndpointCache;
pub use server::XdsServer;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// A named, already-encoded xDS resource ready to ship in a
/// DiscoveryResponse.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltResource {
    pub name: String,
    pub resource: Any,
}

impl BuiltResource {
    pub fn new(name: impl Into<String>, type_url: &str, message: &impl Message) -> Self {
        Self {
            name: name.into(),
            resource: Any {
                type_url: type_url.to_string(),
                value: message.encode_to_vec(),
            },
        }
    }
}

/// One cache per resource family, shared between the rebuild path and the
/// gRPC services.
#[derive(Clone)]
pub struct CacheSet {
    pub clusters: std::sync::Arc<ResourceCache>,
    pub routes: std::sync::Arc<ResourceCache>,
    pub listeners: std::sync::Arc<ResourceCache>,
    pub secrets: std::sync::Arc<ResourceCache>,
    pub endpoints: std::sync::Arc<ResourceCache>,
}

impl CacheSet {
    pub fn new() -> Self {
        Self {
            clusters: std::sync::Arc::new(ResourceCache::new(CLUSTER_TYPE_URL)),
            routes: std::sync::Arc::new(ResourceCache::new(ROUTE_TYPE_URL)),
            listeners: std::sync::Arc::new(ResourceCache::new(LISTENER_TYPE_URL)),
            secrets: std::sync::Arc::new(ResourceCache::new(SECRET_TYPE_URL)),
            endpoints: std::sync::Arc::new(ResourceCache::new(ENDPOINT_TYPE_URL)),
        }
    }

    /// Route a type URL from a discovery request to its cache.
    pub fn for_type_url(&self, type_url: &str) -> Option<&std::sync::Arc<ResourceCache>> {
        match type_url {
            CLUSTER_TYPE_URL => Some(&self.clusters),
            ROUTE_TYPE_URL => Some(&self.routes),
            LISTENER_TYPE_URL => Some(&self.listeners),
            SECRET_TYPE_URL => Some(&self.secrets),
            ENDPOINT_TYPE_URL => Some(&self.endpoints),
            _ => None,
        }
    }
}

impl Default for CacheSet {
    fn default() -> Self {
        Self::new()
    }
}
