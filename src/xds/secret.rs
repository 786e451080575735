//! SDS resource production.
//!
//! Only secrets actually referenced by a secure virtual host reach the
//! wire, so unrelated TLS material in watched namespaces is never
//! disclosed to proxies. Upstream validation CA bundles travel inline in
//! their cluster's transport socket instead.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret::Type as SecretType, Secret, TlsCertificate,
};

use crate::dag::CompiledGraph;
use crate::xds::{BuiltResource, SECRET_TYPE_URL};

pub fn visit(graph: &CompiledGraph) -> Vec<BuiltResource> {
    let mut secrets: BTreeMap<String, Secret> = BTreeMap::new();
    for vertex in graph.secrets() {
        let name = vertex.name();
        secrets.entry(name.clone()).or_insert_with(|| Secret {
            name,
            r#type: Some(SecretType::TlsCertificate(TlsCertificate {
                certificate_chain: Some(DataSource {
                    specifier: Some(Specifier::InlineBytes(vertex.cert.clone())),
                    ..Default::default()
                }),
                private_key: Some(DataSource {
                    specifier: Some(Specifier::InlineBytes(vertex.key.clone())),
                    ..Default::default()
                }),
                ..Default::default()
            })),
        });
    }
    secrets
        .into_iter()
        .map(|(name, secret)| BuiltResource::new(name, SECRET_TYPE_URL, &secret))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    use crate::dag::{SecretVertex, SecureVirtualHost};
    use crate::k8s::object::ObjectRef;

    fn vertex(ns: &str, name: &str) -> SecretVertex {
        SecretVertex {
            meta: ObjectRef::new(ns, name),
            cert: b"certificate".to_vec(),
            key: b"private-key".to_vec(),
        }
    }

    #[test]
    fn referenced_secrets_are_published_with_inline_material() {
        let mut graph = CompiledGraph::default();
        let mut svh = SecureVirtualHost::new("example.com");
        svh.secret = Some(vertex("default", "tls-cert"));
        graph.secure_virtual_hosts.insert("example.com".into(), svh);

        let built = visit(&graph);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].name, "default/tls-cert");

        let secret = Secret::decode(built[0].resource.value.as_slice()).unwrap();
        let Some(SecretType::TlsCertificate(tls)) = secret.r#type else {
            panic!("expected a TLS certificate secret");
        };
        assert!(matches!(
            tls.certificate_chain.unwrap().specifier,
            Some(Specifier::InlineBytes(bytes)) if bytes == b"certificate"
        ));
    }

    #[test]
    fn shared_secret_is_emitted_once() {
        let mut graph = CompiledGraph::default();
        for fqdn in ["a.example.com", "b.example.com"] {
            let mut svh = SecureVirtualHost::new(fqdn);
            svh.secret = Some(vertex("default", "wildcard"));
            graph.secure_virtual_hosts.insert(fqdn.into(), svh);
        }
        assert_eq!(visit(&graph).len(), 1);
    }

    #[test]
    fn empty_graph_publishes_nothing() {
        assert!(visit(&CompiledGraph::default()).is_empty());
    }
}
