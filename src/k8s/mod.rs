//! Source object model and event plumbing.
//!
//! Everything the compiler reads lives here: the typed source objects
//! (`object`), the in-memory index of the last-seen state of each one
//! (`store`), and the outward-facing contracts for object events and
//! status write-back (`status`). The Kubernetes watch machinery itself is
//! external; it drives the [`EventHandler`] callbacks.

pub mod object;
pub mod status;
pub mod store;

pub use object::{
    AttachedFilter, Delegate, DelegationSpec, EndpointPort, EndpointSubset, Endpoints, HeaderCondition,
    HeaderMatch, HealthCheckPolicy, Ingress, IngressBackend, IngressPath, IngressRoute,
    IngressRule, IngressTls, LbStrategy, ObjectRef, RetryPolicy, RouteSpec, Secret, Service,
    ServicePort, ServiceRef, SourceObject, TcpProxySpec, TimeoutPolicy, TlsCertificateDelegation,
    TlsSpec, UpstreamValidation, VirtualHostSpec,
};
pub use status::{LogStatusSink, StatusSink};
pub use store::{EventHandler, ObjectStore, SourceEventHandler};
