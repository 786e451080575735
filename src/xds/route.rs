//! RDS resource production.
//!
//! Two route tables are published: `ingress_http` for the cleartext
//! listener and `ingress_https` for the TLS listener. Routes on the
//! cleartext side of a TLS virtual host become HTTPS redirects unless the
//! route explicitly permits insecure traffic.

use envoy_types::pb::envoy::config::route::v3::header_matcher::HeaderMatchSpecifier;
use envoy_types::pb::envoy::config::route::v3::redirect_action::SchemeRewriteSpecifier;
use envoy_types::pb::envoy::config::route::v3::route::Action;
use envoy_types::pb::envoy::config::route::v3::route_action::ClusterSpecifier;
use envoy_types::pb::envoy::config::route::v3::route_match::PathSpecifier;
use envoy_types::pb::envoy::config::route::v3::weighted_cluster::ClusterWeight;
use envoy_types::pb::envoy::config::route::v3::{
    route_action::UpgradeConfig, HeaderMatcher, RedirectAction, RetryPolicy as EnvoyRetryPolicy,
    Route as EnvoyRoute, RouteAction, RouteConfiguration, RouteMatch,
    VirtualHost as EnvoyVirtualHost, WeightedCluster,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::google::protobuf::{
    value::Kind, Any, Duration as ProtoDuration, ListValue, Struct, UInt32Value, Value,
};
use prost::Message;
use std::collections::HashMap;

use crate::dag::{CompiledGraph, ResolvedFilter, Route, VirtualHost};
use crate::k8s::object::{HeaderCondition, HeaderMatch};
use crate::xds::{BuiltResource, ROUTE_TYPE_URL};

pub const HTTP_ROUTE_CONFIG: &str = "ingress_http";
pub const HTTPS_ROUTE_CONFIG: &str = "ingress_https";

/// Produce both route tables. The HTTPS table only carries virtual hosts
/// that actually terminate TLS; passthrough and TCP-proxy hosts never see
/// HTTP routing.
pub fn visit(graph: &CompiledGraph) -> Vec<BuiltResource> {
    let http = RouteConfiguration {
        name: HTTP_ROUTE_CONFIG.to_string(),
        virtual_hosts: graph.virtual_hosts.values().map(envoy_virtual_host).collect(),
        ..Default::default()
    };

    let https = RouteConfiguration {
        name: HTTPS_ROUTE_CONFIG.to_string(),
        virtual_hosts: graph
            .secure_virtual_hosts
            .values()
            .filter(|svh| !svh.passthrough && svh.tcp_proxy.is_none())
            .map(|svh| envoy_virtual_host_inner(&svh.fqdn, &svh.routes, &svh.filters))
            .collect(),
        ..Default::default()
    };

    vec![
        BuiltResource::new(HTTP_ROUTE_CONFIG, ROUTE_TYPE_URL, &http),
        BuiltResource::new(HTTPS_ROUTE_CONFIG, ROUTE_TYPE_URL, &https),
    ]
}

fn envoy_virtual_host(vhost: &VirtualHost) -> EnvoyVirtualHost {
    envoy_virtual_host_inner(&vhost.fqdn, &vhost.routes, &vhost.filters)
}

fn envoy_virtual_host_inner(
    fqdn: &str,
    routes: &std::collections::BTreeMap<String, Route>,
    filters: &[ResolvedFilter],
) -> EnvoyVirtualHost {
    // Longest prefix first so that /api/v2 wins over /api and /.
    let mut ordered: Vec<&Route> = routes.values().collect();
    ordered.sort_by(|a, b| {
        b.prefix.len().cmp(&a.prefix.len()).then_with(|| a.prefix.cmp(&b.prefix))
    });

    // Host headers may carry an explicit port, so every fqdn also matches
    // its `fqdn:*` form. The default host already matches everything.
    let domains = if fqdn == "*" {
        vec!["*".to_string()]
    } else {
        vec![fqdn.to_string(), format!("{fqdn}:*")]
    };

    EnvoyVirtualHost {
        name: fqdn.to_string(),
        domains,
        routes: ordered.into_iter().map(envoy_route).collect(),
        typed_per_filter_config: typed_filter_configs(filters),
        ..Default::default()
    }
}

fn envoy_route(route: &Route) -> EnvoyRoute {
    EnvoyRoute {
        r#match: Some(RouteMatch {
            path_specifier: Some(PathSpecifier::Prefix(route.prefix.clone())),
            headers: route.header_conditions.iter().map(header_matcher).collect(),
            ..Default::default()
        }),
        action: Some(if route.https_redirect {
            Action::Redirect(RedirectAction {
                scheme_rewrite_specifier: Some(SchemeRewriteSpecifier::HttpsRedirect(true)),
                ..Default::default()
            })
        } else {
            Action::Route(route_action(route))
        }),
        typed_per_filter_config: typed_filter_configs(&route.filters),
        ..Default::default()
    }
}

/// Attached filter configs travel as `google.protobuf.Struct` payloads
/// keyed by the proxy-side filter name.
fn typed_filter_configs(filters: &[ResolvedFilter]) -> HashMap<String, Any> {
    filters
        .iter()
        .map(|filter| (filter.filter_type.clone(), filter_config_any(&filter.config)))
        .collect()
}

fn filter_config_any(config: &serde_json::Value) -> Any {
    let message = match json_value(config).kind {
        Some(Kind::StructValue(fields)) => fields,
        // Scalar and list configs still have to cross the wire as a Struct.
        other => Struct {
            fields: HashMap::from([("value".to_string(), Value { kind: other })]),
        },
    };
    Any {
        type_url: "type.googleapis.com/google.protobuf.Struct".to_string(),
        value: message.encode_to_vec(),
    }
}

fn json_value(value: &serde_json::Value) -> Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => {
            Kind::ListValue(ListValue { values: items.iter().map(json_value).collect() })
        }
        serde_json::Value::Object(map) => Kind::StructValue(Struct {
            fields: map.iter().map(|(k, v)| (k.clone(), json_value(v))).collect(),
        }),
    };
    Value { kind: Some(kind) }
}

fn route_action(route: &Route) -> RouteAction {
    let cluster_specifier = if route.clusters.len() == 1 {
        Some(ClusterSpecifier::Cluster(route.clusters[0].name()))
    } else {
        Some(ClusterSpecifier::WeightedClusters(WeightedCluster {
            clusters: route
                .clusters
                .iter()
                .map(|cluster| ClusterWeight {
                    name: cluster.name(),
                    weight: Some(UInt32Value { value: cluster.weight }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }))
    };

    RouteAction {
        cluster_specifier,
        prefix_rewrite: route.prefix_rewrite.clone().unwrap_or_default(),
        timeout: route.timeout.map(|t| ProtoDuration {
            seconds: t.as_secs() as i64,
            nanos: t.subsec_nanos() as i32,
        }),
        retry_policy: route.retry.as_ref().map(|retry| EnvoyRetryPolicy {
            retry_on: "5xx".to_string(),
            num_retries: Some(UInt32Value { value: retry.count }),
            per_try_timeout: retry.per_try_timeout.map(|t| ProtoDuration {
                seconds: t.as_secs() as i64,
                nanos: t.subsec_nanos() as i32,
            }),
            ..Default::default()
        }),
        upgrade_configs: if route.websocket {
            vec![UpgradeConfig { upgrade_type: "websocket".to_string(), ..Default::default() }]
        } else {
            Vec::new()
        },
        ..Default::default()
    }
}

fn header_matcher(condition: &HeaderCondition) -> HeaderMatcher {
    let specifier = match &condition.matcher {
        HeaderMatch::Present => HeaderMatchSpecifier::PresentMatch(true),
        HeaderMatch::Exact(value) => HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(MatchPattern::Exact(value.clone())),
            ..Default::default()
        }),
        HeaderMatch::Contains(value) => HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(MatchPattern::Contains(value.clone())),
            ..Default::default()
        }),
    };
    HeaderMatcher {
        name: condition.name.clone(),
        header_match_specifier: Some(specifier),
        ..Default::default()
    }
}
