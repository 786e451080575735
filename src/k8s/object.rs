//! Typed source objects.
//!
//! The set of object kinds the control plane consumes is closed and known
//! at compile time, so they are modeled as plain structs under one
//! [`SourceObject`] enum rather than trait objects; every consumer
//! pattern-matches exhaustively. All types are serde-derived so embedders
//! can load fixtures or wire their own watch layer without extra glue.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of a source object: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The routing CRD. An object carrying a `virtual_host` anchors a
/// delegation tree (a "root"); objects without one only contribute routes
/// when delegated to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRoute {
    pub meta: ObjectRef,
    /// Value of the ingress-class annotation, when present
    #[serde(default)]
    pub ingress_class: Option<String>,
    #[serde(default)]
    pub virtual_host: Option<VirtualHostSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub tcp_proxy: Option<TcpProxySpec>,
}

/// Root marker: the fully-qualified domain name this tree serves, plus
/// optional TLS settings and virtual-host-wide filter attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualHostSpec {
    pub fqdn: String,
    #[serde(default)]
    pub tls: Option<TlsSpec>,
    /// Names of AttachedFilter objects in the root's namespace
    #[serde(default)]
    pub filters: Vec<String>,
}

/// TLS settings on a root virtual host. `secret_name` may be qualified as
/// `namespace/name`; an unqualified name resolves in the root's namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSpec {
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub minimum_protocol_version: Option<String>,
    /// Forward the raw TLS stream to the backend instead of terminating
    #[serde(default)]
    pub passthrough: bool,
}

/// One routing rule: match conditions plus either weighted backends or a
/// delegation to another IngressRoute. Declaring both is invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub match_prefix: String,
    #[serde(default)]
    pub header_conditions: Vec<HeaderCondition>,
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    #[serde(default)]
    pub delegate: Option<Delegate>,
    #[serde(default)]
    pub enable_websockets: bool,
    /// Keep serving this route over cleartext even when the virtual host
    /// terminates TLS
    #[serde(default)]
    pub permit_insecure: bool,
    #[serde(default)]
    pub prefix_rewrite: Option<String>,
    #[serde(default)]
    pub timeout_policy: Option<TimeoutPolicy>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Names of AttachedFilter objects in the owning object's namespace
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Header predicate attached to a route match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCondition {
    pub name: String,
    pub matcher: HeaderMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderMatch {
    Present,
    Exact(String),
    Contains(String),
}

/// Delegation to another IngressRoute; `namespace` defaults to the
/// delegating object's namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegate {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Weighted backend reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    pub port: u16,
    /// Absent weight is encoded as zero, which the proxy reads as "no
    /// explicit weight"
    #[serde(default)]
    pub weight: Option<u32>,
    /// Upstream protocol hint ("h2", "h2c", "tls")
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub strategy: Option<LbStrategy>,
    #[serde(default)]
    pub health_check: Option<HealthCheckPolicy>,
    #[serde(default)]
    pub validation: Option<UpstreamValidation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    Cookie,
}

/// Active HTTP health checking for a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    pub path: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
}

fn default_interval() -> u64 {
    10
}
fn default_timeout() -> u64 {
    2
}
fn default_threshold() -> u32 {
    3
}

/// Upstream TLS validation: the CA bundle secret and the expected server
/// name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamValidation {
    pub ca_secret: String,
    pub subject_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// End-to-end request timeout; `None` leaves the proxy default
    #[serde(default)]
    pub request: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u32,
    #[serde(default)]
    pub per_try_timeout: Option<Duration>,
}

/// TCP forwarding instead of HTTP routing; valid only on roots whose
/// virtual host declares TLS (terminated or passthrough).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpProxySpec {
    pub services: Vec<ServiceRef>,
}

/// Native ingress resource: per-host prefix routing without delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingress {
    pub meta: ObjectRef,
    #[serde(default)]
    pub ingress_class: Option<String>,
    #[serde(default)]
    pub default_backend: Option<IngressBackend>,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub tls: Vec<IngressTls>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub paths: Vec<IngressPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressPath {
    #[serde(default)]
    pub path: Option<String>,
    pub backend: IngressBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressBackend {
    pub service_name: String,
    pub service_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressTls {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

/// Backend service descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub meta: ObjectRef,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
}

impl Service {
    /// Look up a declared port by number.
    pub fn port(&self, number: u16) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.port == number)
    }
}

/// TLS certificate/key material. A CA-bundle secret carries only `cert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub meta: ObjectRef,
    pub cert: Vec<u8>,
    #[serde(default)]
    pub key: Vec<u8>,
}

/// Named filter configuration referenced by virtual hosts or routes.
/// `filter_type` is the proxy-side filter identifier (for example
/// `envoy.filters.http.cors`); the config blob is opaque to the control
/// plane and forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedFilter {
    pub meta: ObjectRef,
    pub filter_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Grants other namespaces the right to reference secrets in this
/// object's namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsCertificateDelegation {
    pub meta: ObjectRef,
    pub delegations: Vec<DelegationSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationSpec {
    pub secret_name: String,
    /// Namespaces allowed to reference the secret; `"*"` means all
    pub target_namespaces: Vec<String>,
}

/// Backend endpoint membership for a service. High churn; bypasses the
/// graph compiler and feeds the endpoint cache directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    pub meta: ObjectRef,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSubset {
    pub addresses: Vec<String>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
}

/// Every object kind the control plane consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceObject {
    IngressRoute(IngressRoute),
    Ingress(Ingress),
    Service(Service),
    Secret(Secret),
    Delegation(TlsCertificateDelegation),
    Filter(AttachedFilter),
    Endpoints(Endpoints),
}

impl SourceObject {
    pub fn object_ref(&self) -> &ObjectRef {
        match self {
            SourceObject::IngressRoute(o) => &o.meta,
            SourceObject::Ingress(o) => &o.meta,
            SourceObject::Service(o) => &o.meta,
            SourceObject::Secret(o) => &o.meta,
            SourceObject::Delegation(o) => &o.meta,
            SourceObject::Filter(o) => &o.meta,
            SourceObject::Endpoints(o) => &o.meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceObject::IngressRoute(_) => "IngressRoute",
            SourceObject::Ingress(_) => "Ingress",
            SourceObject::Service(_) => "Service",
            SourceObject::Secret(_) => "Secret",
            SourceObject::Delegation(_) => "TLSCertificateDelegation",
            SourceObject::Filter(_) => "AttachedFilter",
            SourceObject::Endpoints(_) => "Endpoints",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_display() {
        let r = ObjectRef::new("default", "kuard");
        assert_eq!(r.to_string(), "default/kuard");
    }

    #[test]
    fn service_port_lookup() {
        let svc = Service {
            meta: ObjectRef::new("default", "kuard"),
            ports: vec![
                ServicePort { name: Some("http".into()), port: 8080, protocol: None },
                ServicePort { name: None, port: 9090, protocol: None },
            ],
        };
        assert!(svc.port(8080).is_some());
        assert!(svc.port(80).is_none());
    }

    #[test]
    fn source_object_identity() {
        let obj = SourceObject::Secret(Secret {
            meta: ObjectRef::new("secret", "s1"),
            cert: b"cert".to_vec(),
            key: b"key".to_vec(),
        });
        assert_eq!(obj.object_ref().to_string(), "secret/s1");
        assert_eq!(obj.kind(), "Secret");
    }
}
