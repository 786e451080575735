//! The compiled routing graph.
//!
//! A compile pass turns the current [`ObjectStore`](crate::k8s::ObjectStore)
//! contents into an immutable [`CompiledGraph`]: virtual hosts holding
//! routes pointing at clusters, a parallel set of reachable TLS secrets,
//! and a per-source-object status map. Graphs are rebuilt in full on every
//! change and never mutated afterwards, so readers need no locking.
//!
//! Vertex kinds are fixed, so they are plain structs consumed by explicit
//! traversal in the resource visitors rather than trait objects.

pub mod builder;

pub use builder::Builder;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::k8s::object::{
    HeaderCondition, HealthCheckPolicy, LbStrategy, ObjectRef, RetryPolicy,
};

/// Per-object validity, attached to source objects, not graph vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Valid,
    Invalid,
    Orphaned,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Valid => write!(f, "valid"),
            Condition::Invalid => write!(f, "invalid"),
            Condition::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// Status plus a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStatus {
    pub condition: Condition,
    pub description: String,
}

impl ObjectStatus {
    pub fn valid(description: impl Into<String>) -> Self {
        Self { condition: Condition::Valid, description: description.into() }
    }

    pub fn invalid(description: impl Into<String>) -> Self {
        Self { condition: Condition::Invalid, description: description.into() }
    }

    pub fn orphaned() -> Self {
        Self {
            condition: Condition::Orphaned,
            description: "this IngressRoute is not part of a delegation chain from a root"
                .to_string(),
        }
    }
}

/// Output of one compile pass.
#[derive(Debug, Default)]
pub struct CompiledGraph {
    /// Cleartext virtual hosts, keyed by fqdn (`*` for the default host)
    pub virtual_hosts: BTreeMap<String, VirtualHost>,
    /// TLS virtual hosts, keyed by fqdn
    pub secure_virtual_hosts: BTreeMap<String, SecureVirtualHost>,
    /// Computed status per source object
    pub statuses: BTreeMap<ObjectRef, ObjectStatus>,
    /// Root IngressRoutes seen per namespace, eligible or not
    pub root_counts: BTreeMap<String, usize>,
}

impl CompiledGraph {
    /// Every cluster referenced anywhere in the graph, in traversal order.
    /// Callers dedupe by [`Cluster::name`].
    pub fn clusters(&self) -> Vec<&Cluster> {
        let mut out = Vec::new();
        for vhost in self.virtual_hosts.values() {
            for route in vhost.routes.values() {
                out.extend(route.clusters.iter());
            }
        }
        for svh in self.secure_virtual_hosts.values() {
            for route in svh.routes.values() {
                out.extend(route.clusters.iter());
            }
            if let Some(proxy) = &svh.tcp_proxy {
                out.extend(proxy.clusters.iter());
            }
        }
        out
    }

    /// TLS secrets reachable through emitted secure virtual hosts.
    pub fn secrets(&self) -> impl Iterator<Item = &SecretVertex> {
        self.secure_virtual_hosts.values().filter_map(|svh| svh.secret.as_ref())
    }
}

/// A cleartext virtual host and its routes, keyed by path prefix.
#[derive(Debug, Clone, Default)]
pub struct VirtualHost {
    pub fqdn: String,
    pub routes: BTreeMap<String, Route>,
    /// Filters attached at the root, applying to the whole host
    pub filters: Vec<ResolvedFilter>,
}

impl VirtualHost {
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self { fqdn: fqdn.into(), ..Default::default() }
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.insert(route.prefix.clone(), route);
    }
}

/// A TLS virtual host: routes plus the terminating secret, or a
/// passthrough/TCP-proxy forwarding target.
#[derive(Debug, Clone, Default)]
pub struct SecureVirtualHost {
    pub fqdn: String,
    pub routes: BTreeMap<String, Route>,
    /// Absent for TLS passthrough
    pub secret: Option<SecretVertex>,
    pub min_tls_version: Option<String>,
    pub tcp_proxy: Option<TcpProxy>,
    pub passthrough: bool,
    pub filters: Vec<ResolvedFilter>,
}

impl SecureVirtualHost {
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self { fqdn: fqdn.into(), ..Default::default() }
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.insert(route.prefix.clone(), route);
    }
}

/// One route: match conditions plus a weighted cluster list (or an HTTPS
/// redirect on the cleartext side of a TLS virtual host).
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub header_conditions: Vec<HeaderCondition>,
    pub clusters: Vec<Cluster>,
    pub websocket: bool,
    pub prefix_rewrite: Option<String>,
    /// Emit a 301 to HTTPS instead of forwarding
    pub https_redirect: bool,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub filters: Vec<ResolvedFilter>,
}

impl Route {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            header_conditions: Vec::new(),
            clusters: Vec::new(),
            websocket: false,
            prefix_rewrite: None,
            https_redirect: false,
            timeout: None,
            retry: None,
            filters: Vec::new(),
        }
    }
}

/// An AttachedFilter resolved against the store and bound to a virtual
/// host or a route.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFilter {
    pub filter_type: String,
    pub config: serde_json::Value,
}

/// A backend cluster plus the routing/health policies requested for it.
/// The same service may appear as several clusters when routes request
/// different policies; the fingerprint keeps their names distinct.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub upstream: ObjectRef,
    pub port: u16,
    /// Declared name of the service port, used for load-assignment lookup
    pub port_name: Option<String>,
    /// Zero means "no explicit weight"
    pub weight: u32,
    pub protocol: Option<String>,
    pub strategy: LbStrategy,
    pub health_check: Option<HealthCheckPolicy>,
    pub validation: Option<ResolvedValidation>,
}

#[derive(Serialize)]
struct PolicyFingerprint<'a> {
    strategy: &'a LbStrategy,
    health_check: &'a Option<HealthCheckPolicy>,
    validation_ca: Option<String>,
    validation_subject: Option<&'a str>,
}

impl Cluster {
    /// Stable cluster name: `namespace/service/port`, suffixed with a
    /// policy fingerprint when any non-default policy is attached.
    pub fn name(&self) -> String {
        match self.policy_fingerprint() {
            Some(fp) => {
                format!("{}/{}/{}/{}", self.upstream.namespace, self.upstream.name, self.port, fp)
            }
            None => format!("{}/{}/{}", self.upstream.namespace, self.upstream.name, self.port),
        }
    }

    /// Name of the load assignment served by the endpoint cache.
    pub fn load_assignment_name(&self) -> String {
        match &self.port_name {
            Some(port_name) if !port_name.is_empty() => {
                format!("{}/{}/{}", self.upstream.namespace, self.upstream.name, port_name)
            }
            _ => format!("{}/{}", self.upstream.namespace, self.upstream.name),
        }
    }

    fn policy_fingerprint(&self) -> Option<String> {
        if self.strategy == LbStrategy::default()
            && self.health_check.is_none()
            && self.validation.is_none()
        {
            return None;
        }
        let fp = PolicyFingerprint {
            strategy: &self.strategy,
            health_check: &self.health_check,
            validation_ca: self.validation.as_ref().map(|v| v.ca.name()),
            validation_subject: self.validation.as_ref().map(|v| v.subject_name.as_str()),
        };
        let encoded = serde_json::to_vec(&fp).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        Some(hex::encode(&digest[..4]))
    }
}

/// Upstream TLS validation resolved against the store.
#[derive(Debug, Clone)]
pub struct ResolvedValidation {
    pub ca: SecretVertex,
    pub subject_name: String,
}

/// TLS certificate material lifted out of a Secret object.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretVertex {
    pub meta: ObjectRef,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl SecretVertex {
    /// SDS resource name: `namespace/name`.
    pub fn name(&self) -> String {
        self.meta.to_string()
    }
}

/// Raw TCP forwarding attached to a secure virtual host.
#[derive(Debug, Clone)]
pub struct TcpProxy {
    pub clusters: Vec<Cluster>,
}
