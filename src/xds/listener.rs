//! LDS resource production.
//!
//! Two listeners are published. `ingress_http` serves every cleartext
//! virtual host through one HTTP connection manager wired to the
//! `ingress_http` route table over ADS. `ingress_https` carries one filter
//! chain per secure virtual host, matched by SNI: TLS-terminating hosts
//! get a downstream TLS context referencing their certificate over SDS,
//! passthrough and TCP-proxy hosts get a raw TCP proxy chain. The HTTPS
//! listener only exists while at least one secure virtual host does.

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, config_source::ConfigSourceSpecifier,
    socket_address::PortSpecifier, transport_socket::ConfigType as TransportSocketConfigType,
    Address, AggregatedConfigSource, ApiVersion, ConfigSource, SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType, listener_filter::ConfigType as ListenerFilterConfigType,
    Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::ClusterSpecifier as TcpClusterSpecifier, TcpProxy as TcpProxyFilter,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, DownstreamTlsContext, SdsSecretConfig, TlsParameters,
};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::config::EnvoyListenerConfig;
use crate::dag::{CompiledGraph, SecureVirtualHost};
use crate::xds::route::{HTTP_ROUTE_CONFIG, HTTPS_ROUTE_CONFIG};
use crate::xds::{BuiltResource, LISTENER_TYPE_URL};

pub const HTTP_LISTENER: &str = "ingress_http";
pub const HTTPS_LISTENER: &str = "ingress_https";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const DOWNSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

// TlsParameters protocol version numbers (TLS_AUTO = 0).
const TLS_V1_1: i32 = 2;
const TLS_V1_2: i32 = 3;
const TLS_V1_3: i32 = 4;

pub fn visit(graph: &CompiledGraph, config: &EnvoyListenerConfig) -> Vec<BuiltResource> {
    let mut built = Vec::with_capacity(2);

    let http = Listener {
        name: HTTP_LISTENER.to_string(),
        address: Some(socket_address(&config.http_address, config.http_port)),
        filter_chains: vec![FilterChain {
            filters: vec![hcm_filter(HTTP_ROUTE_CONFIG)],
            ..Default::default()
        }],
        ..Default::default()
    };
    built.push(BuiltResource::new(HTTP_LISTENER, LISTENER_TYPE_URL, &http));

    if !graph.secure_virtual_hosts.is_empty() {
        let https = Listener {
            name: HTTPS_LISTENER.to_string(),
            address: Some(socket_address(&config.https_address, config.https_port)),
            listener_filters: vec![tls_inspector()],
            filter_chains: graph
                .secure_virtual_hosts
                .values()
                .map(secure_filter_chain)
                .collect(),
            ..Default::default()
        };
        built.push(BuiltResource::new(HTTPS_LISTENER, LISTENER_TYPE_URL, &https));
    }

    built
}

fn secure_filter_chain(svh: &SecureVirtualHost) -> FilterChain {
    let chain_match = FilterChainMatch {
        server_names: vec![svh.fqdn.clone()],
        ..Default::default()
    };

    if svh.passthrough {
        return FilterChain {
            filter_chain_match: Some(chain_match),
            filters: svh.tcp_proxy.as_ref().map(tcp_proxy_filter).into_iter().collect(),
            ..Default::default()
        };
    }

    let filters = match &svh.tcp_proxy {
        Some(proxy) => vec![tcp_proxy_filter(proxy)],
        None => vec![hcm_filter(HTTPS_ROUTE_CONFIG)],
    };

    FilterChain {
        filter_chain_match: Some(chain_match),
        transport_socket: svh.secret.as_ref().map(|secret| {
            downstream_tls(secret.name(), svh.min_tls_version.as_deref())
        }),
        filters,
        ..Default::default()
    }
}

fn downstream_tls(secret_name: String, min_version: Option<&str>) -> TransportSocket {
    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_params: Some(TlsParameters {
                tls_minimum_protocol_version: min_tls_version(min_version),
                ..Default::default()
            }),
            tls_certificate_sds_secret_configs: vec![SdsSecretConfig {
                name: secret_name,
                sds_config: Some(ads_config_source()),
            }],
            ..Default::default()
        }),
        ..Default::default()
    };
    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(Any {
            type_url: DOWNSTREAM_TLS_TYPE_URL.to_string(),
            value: context.encode_to_vec(),
        })),
    }
}

fn min_tls_version(raw: Option<&str>) -> i32 {
    match raw {
        Some("1.1") => TLS_V1_1,
        Some("1.3") => TLS_V1_3,
        // "1.2", unknown values and the unset case all floor at 1.2.
        _ => TLS_V1_2,
    }
}

fn hcm_filter(route_config_name: &str) -> Filter {
    let hcm = HttpConnectionManager {
        stat_prefix: route_config_name.to_string(),
        codec_type: CodecType::Auto as i32,
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            route_config_name: route_config_name.to_string(),
            config_source: Some(ads_config_source()),
        })),
        http_filters: vec![HttpFilter {
            name: "envoy.filters.http.router".to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(Any {
                type_url: ROUTER_TYPE_URL.to_string(),
                value: Router::default().encode_to_vec(),
            })),
            ..Default::default()
        }],
        ..Default::default()
    };
    Filter {
        name: "envoy.filters.network.http_connection_manager".to_string(),
        config_type: Some(FilterConfigType::TypedConfig(Any {
            type_url: HCM_TYPE_URL.to_string(),
            value: hcm.encode_to_vec(),
        })),
    }
}

fn tcp_proxy_filter(proxy: &crate::dag::TcpProxy) -> Filter {
    // Multiple backends would need weighted TCP clusters; the first
    // cluster wins today and the rest are ignored.
    let cluster = proxy.clusters.first().map(|c| c.name()).unwrap_or_default();
    let tcp = TcpProxyFilter {
        stat_prefix: "ingress_tcp".to_string(),
        cluster_specifier: Some(TcpClusterSpecifier::Cluster(cluster)),
        ..Default::default()
    };
    Filter {
        name: "envoy.filters.network.tcp_proxy".to_string(),
        config_type: Some(FilterConfigType::TypedConfig(Any {
            type_url: TCP_PROXY_TYPE_URL.to_string(),
            value: tcp.encode_to_vec(),
        })),
    }
}

fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: "envoy.filters.listener.tls_inspector".to_string(),
        config_type: Some(ListenerFilterConfigType::TypedConfig(Any {
            type_url: TLS_INSPECTOR_TYPE_URL.to_string(),
            value: TlsInspector::default().encode_to_vec(),
        })),
        ..Default::default()
    }
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

fn socket_address(address: &str, port: u16) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            address: address.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(u32::from(port))),
            ..Default::default()
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Cluster as ClusterVertex, SecretVertex, TcpProxy};
    use crate::k8s::object::{LbStrategy, ObjectRef};

    fn listener_config() -> EnvoyListenerConfig {
        EnvoyListenerConfig::default()
    }

    fn decode(built: &BuiltResource) -> Listener {
        Listener::decode(built.resource.value.as_slice()).unwrap()
    }

    fn secret() -> SecretVertex {
        SecretVertex {
            meta: ObjectRef::new("default", "tls-cert"),
            cert: b"cert".to_vec(),
            key: b"key".to_vec(),
        }
    }

    #[test]
    fn cleartext_only_graph_produces_a_single_listener() {
        let built = visit(&CompiledGraph::default(), &listener_config());
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].name, HTTP_LISTENER);

        let listener = decode(&built[0]);
        assert_eq!(listener.filter_chains.len(), 1);
        assert!(listener.listener_filters.is_empty());
    }

    #[test]
    fn secure_hosts_add_an_https_listener_with_sni_chains() {
        let mut graph = CompiledGraph::default();
        let mut svh = SecureVirtualHost::new("a.example.com");
        svh.secret = Some(secret());
        graph.secure_virtual_hosts.insert("a.example.com".into(), svh);
        let mut other = SecureVirtualHost::new("b.example.com");
        other.secret = Some(secret());
        graph.secure_virtual_hosts.insert("b.example.com".into(), other);

        let built = visit(&graph, &listener_config());
        assert_eq!(built.len(), 2);
        let https = decode(&built[1]);

        assert_eq!(https.filter_chains.len(), 2);
        assert_eq!(https.listener_filters[0].name, "envoy.filters.listener.tls_inspector");
        let names: Vec<&str> = https
            .filter_chains
            .iter()
            .map(|c| c.filter_chain_match.as_ref().unwrap().server_names[0].as_str())
            .collect();
        assert_eq!(names, vec!["a.example.com", "b.example.com"]);
        assert!(https.filter_chains[0].transport_socket.is_some());
    }

    #[test]
    fn passthrough_chain_has_no_transport_socket() {
        let mut graph = CompiledGraph::default();
        let mut svh = SecureVirtualHost::new("tcp.example.com");
        svh.passthrough = true;
        svh.tcp_proxy = Some(TcpProxy {
            clusters: vec![ClusterVertex {
                upstream: ObjectRef::new("default", "tcpsvc"),
                port: 443,
                port_name: None,
                weight: 0,
                protocol: None,
                strategy: LbStrategy::RoundRobin,
                health_check: None,
                validation: None,
            }],
        });
        graph.secure_virtual_hosts.insert("tcp.example.com".into(), svh);

        let built = visit(&graph, &listener_config());
        let https = decode(&built[1]);
        let chain = &https.filter_chains[0];
        assert!(chain.transport_socket.is_none());
        assert_eq!(chain.filters[0].name, "envoy.filters.network.tcp_proxy");
    }

    #[test]
    fn minimum_tls_version_mapping_floors_at_1_2() {
        assert_eq!(min_tls_version(Some("1.1")), TLS_V1_1);
        assert_eq!(min_tls_version(Some("1.2")), TLS_V1_2);
        assert_eq!(min_tls_version(Some("1.3")), TLS_V1_3);
        assert_eq!(min_tls_version(Some("bogus")), TLS_V1_2);
        assert_eq!(min_tls_version(None), TLS_V1_2);
    }
}
