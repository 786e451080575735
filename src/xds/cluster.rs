//! CDS resource production.
//!
//! Every service reference reachable from a live route or TCP proxy
//! becomes one EDS-backed Cluster. References that share a service, port
//! and policy set collapse into a single cluster; references that differ
//! only in policy stay distinct because the policy fingerprint is part of
//! the cluster name.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, data_source::Specifier,
    transport_socket::ConfigType as TransportSocketConfigType, AggregatedConfigSource, ApiVersion,
    ConfigSource, DataSource, HealthCheck, TransportSocket,
};
use envoy_types::pb::envoy::config::core::v3::health_check::{self, HttpHealthCheck};
use envoy_types::pb::envoy::config::core::v3::Http2ProtocolOptions;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::ValidationContextType, CertificateValidationContext, CommonTlsContext,
    UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::{
    explicit_http_config::ProtocolConfig, ExplicitHttpConfig, UpstreamProtocolOptions,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::HttpProtocolOptions;
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;

use crate::dag::{Cluster as ClusterVertex, CompiledGraph};
use crate::k8s::object::{HealthCheckPolicy, LbStrategy};
use crate::xds::{BuiltResource, CLUSTER_TYPE_URL};

const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// Produce the CDS resource set for the graph, sorted by name.
pub fn visit(graph: &CompiledGraph) -> Vec<BuiltResource> {
    let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
    for vertex in graph.clusters() {
        let name = vertex.name();
        clusters.entry(name.clone()).or_insert_with(|| build_cluster(name, vertex));
    }
    clusters
        .into_iter()
        .map(|(name, cluster)| BuiltResource::new(name, CLUSTER_TYPE_URL, &cluster))
        .collect()
}

fn build_cluster(name: String, vertex: &ClusterVertex) -> Cluster {
    let mut cluster = Cluster {
        name,
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: vertex.load_assignment_name(),
        }),
        connect_timeout: Some(Duration { seconds: 0, nanos: 250_000_000 }),
        lb_policy: lb_policy(vertex.strategy) as i32,
        ..Default::default()
    };

    if let Some(policy) = &vertex.health_check {
        cluster.health_checks = vec![build_health_check(policy)];
    }

    if matches!(vertex.protocol.as_deref(), Some("h2") | Some("h2c")) {
        cluster.typed_extension_protocol_options = http2_protocol_options();
    }

    if let Some(validation) = &vertex.validation {
        let tls_context = UpstreamTlsContext {
            common_tls_context: Some(CommonTlsContext {
                validation_context_type: Some(ValidationContextType::ValidationContext(
                    CertificateValidationContext {
                        trusted_ca: Some(DataSource {
                            specifier: Some(Specifier::InlineBytes(validation.ca.cert.clone())),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            }),
            sni: validation.subject_name.clone(),
            ..Default::default()
        };
        cluster.transport_socket = Some(TransportSocket {
            name: "envoy.transport_sockets.tls".to_string(),
            config_type: Some(TransportSocketConfigType::TypedConfig(Any {
                type_url:
                    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext"
                        .to_string(),
                value: tls_context.encode_to_vec(),
            })),
        });
    } else if vertex.protocol.as_deref() == Some("h2") || vertex.protocol.as_deref() == Some("tls")
    {
        // TLS upstream without custom validation: system trust, SNI unset.
        let tls_context = UpstreamTlsContext {
            common_tls_context: Some(CommonTlsContext::default()),
            ..Default::default()
        };
        cluster.transport_socket = Some(TransportSocket {
            name: "envoy.transport_sockets.tls".to_string(),
            config_type: Some(TransportSocketConfigType::TypedConfig(Any {
                type_url:
                    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext"
                        .to_string(),
                value: tls_context.encode_to_vec(),
            })),
        });
    }

    cluster
}

fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(
            AggregatedConfigSource::default(),
        )),
        resource_api_version: ApiVersion::V3 as i32,
        ..Default::default()
    }
}

fn lb_policy(strategy: LbStrategy) -> LbPolicy {
    match strategy {
        LbStrategy::RoundRobin => LbPolicy::RoundRobin,
        LbStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LbStrategy::Random => LbPolicy::Random,
        LbStrategy::Cookie => LbPolicy::RingHash,
    }
}

fn build_health_check(policy: &HealthCheckPolicy) -> HealthCheck {
    HealthCheck {
        timeout: Some(Duration { seconds: policy.timeout_seconds as i64, nanos: 0 }),
        interval: Some(Duration { seconds: policy.interval_seconds as i64, nanos: 0 }),
        unhealthy_threshold: Some(UInt32Value { value: policy.unhealthy_threshold }),
        healthy_threshold: Some(UInt32Value { value: policy.healthy_threshold }),
        health_checker: Some(health_check::HealthChecker::HttpHealthCheck(HttpHealthCheck {
            path: policy.path.clone(),
            host: policy.host.clone().unwrap_or_default(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn http2_protocol_options() -> std::collections::HashMap<String, Any> {
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions::default(),
                )),
            },
        )),
        ..Default::default()
    };
    let mut map = std::collections::HashMap::new();
    map.insert(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        Any { type_url: HTTP_PROTOCOL_OPTIONS_TYPE_URL.to_string(), value: options.encode_to_vec() },
    );
    map
}
