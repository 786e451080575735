//! Prometheus metrics.
//!
//! Gauges describe the current state of the system (watched objects per
//! namespace, connected streams, validity counts from the last compile);
//! counters and histograms describe the serving path. The exporter is
//! optional: when it is not installed the macros are no-ops.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::dag::{CompiledGraph, Condition};
use crate::errors::{Error, Result};

/// Install the Prometheus exporter on its own HTTP listener and register
/// metric descriptions so they export before the first event.
pub fn install_exporter(address: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| Error::config(format!("failed to install metrics exporter: {e}")))?;

    describe_gauge!(
        "ingressroute_total",
        Unit::Count,
        "IngressRoute objects from the last compile, per namespace"
    );
    describe_gauge!(
        "ingressroute_valid",
        Unit::Count,
        "Valid IngressRoute objects from the last compile, per namespace"
    );
    describe_gauge!(
        "ingressroute_invalid",
        Unit::Count,
        "Invalid IngressRoute objects from the last compile, per namespace"
    );
    describe_gauge!(
        "ingressroute_orphaned",
        Unit::Count,
        "Orphaned IngressRoute objects from the last compile, per namespace"
    );
    describe_gauge!(
        "ingressroute_root_total",
        Unit::Count,
        "Root IngressRoute objects from the last compile, per namespace"
    );
    describe_gauge!("xds_streams_active", Unit::Count, "Open discovery streams");
    describe_counter!(
        "xds_responses_total",
        Unit::Count,
        "Discovery responses sent, grouped by type URL"
    );
    describe_counter!(
        "xds_responses_nacked_total",
        Unit::Count,
        "Discovery requests carrying an error detail, grouped by type URL"
    );
    describe_histogram!(
        "dag_rebuild_duration_seconds",
        Unit::Seconds,
        "Time spent compiling the routing graph"
    );
    describe_gauge!(
        "dag_rebuild_timestamp_seconds",
        Unit::Seconds,
        "Unix time of the last completed compile"
    );

    info!(address = %address, "Metrics exporter listening");
    Ok(())
}

/// Per-namespace rollup of one compile pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct NamespaceTally {
    total: usize,
    valid: usize,
    invalid: usize,
    orphaned: usize,
    roots: usize,
}

fn namespace_tallies(graph: &CompiledGraph) -> BTreeMap<String, NamespaceTally> {
    let mut tallies: BTreeMap<String, NamespaceTally> = BTreeMap::new();
    for (meta, status) in &graph.statuses {
        let tally = tallies.entry(meta.namespace.clone()).or_default();
        tally.total += 1;
        match status.condition {
            Condition::Valid => tally.valid += 1,
            Condition::Invalid => tally.invalid += 1,
            Condition::Orphaned => tally.orphaned += 1,
        }
    }
    for (namespace, roots) in &graph.root_counts {
        tallies.entry(namespace.clone()).or_default().roots = *roots;
    }
    tallies
}

/// Record the outcome of one compile pass.
pub fn record_rebuild(graph: &CompiledGraph, duration: Duration) {
    histogram!("dag_rebuild_duration_seconds").record(duration.as_secs_f64());
    if let Ok(now) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        gauge!("dag_rebuild_timestamp_seconds").set(now.as_secs_f64());
    }

    for (namespace, tally) in namespace_tallies(graph) {
        gauge!("ingressroute_total", "namespace" => namespace.clone()).set(tally.total as f64);
        gauge!("ingressroute_valid", "namespace" => namespace.clone()).set(tally.valid as f64);
        gauge!("ingressroute_invalid", "namespace" => namespace.clone())
            .set(tally.invalid as f64);
        gauge!("ingressroute_orphaned", "namespace" => namespace.clone())
            .set(tally.orphaned as f64);
        gauge!("ingressroute_root_total", "namespace" => namespace).set(tally.roots as f64);
    }
}

pub fn stream_opened() {
    gauge!("xds_streams_active").increment(1.0);
}

pub fn stream_closed() {
    gauge!("xds_streams_active").decrement(1.0);
}

pub fn response_sent(type_url: &'static str) {
    counter!("xds_responses_total", "type_url" => type_url).increment(1);
}

pub fn response_nacked(type_url: &'static str) {
    counter!("xds_responses_nacked_total", "type_url" => type_url).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ObjectStatus;
    use crate::k8s::object::ObjectRef;

    fn multi_namespace_graph() -> CompiledGraph {
        let mut graph = CompiledGraph::default();
        graph.statuses.insert(ObjectRef::new("default", "a"), ObjectStatus::valid("ok"));
        graph.statuses.insert(ObjectRef::new("default", "b"), ObjectStatus::invalid("bad"));
        graph.statuses.insert(ObjectRef::new("default", "c"), ObjectStatus::orphaned());
        graph.statuses.insert(ObjectRef::new("team-a", "edge"), ObjectStatus::valid("ok"));
        graph.root_counts.insert("default".into(), 1);
        graph.root_counts.insert("team-a".into(), 1);
        graph
    }

    #[test]
    fn tallies_group_statuses_and_roots_by_namespace() {
        let tallies = namespace_tallies(&multi_namespace_graph());

        let default = tallies["default"];
        assert_eq!(
            (default.total, default.valid, default.invalid, default.orphaned, default.roots),
            (3, 1, 1, 1, 1)
        );
        let team_a = tallies["team-a"];
        assert_eq!((team_a.total, team_a.valid, team_a.roots), (1, 1, 1));
    }

    #[test]
    fn root_only_namespace_still_gets_a_tally() {
        let mut graph = CompiledGraph::default();
        graph.root_counts.insert("quiet".into(), 2);
        let tallies = namespace_tallies(&graph);
        assert_eq!(tallies["quiet"].roots, 2);
        assert_eq!(tallies["quiet"].total, 0);
    }

    // The macros are no-ops without an installed recorder, so this only
    // asserts that the recording path runs.
    #[test]
    fn record_rebuild_handles_every_condition() {
        record_rebuild(&multi_namespace_graph(), Duration::from_millis(5));
    }

    #[test]
    fn stream_lifecycle_events_run_without_a_recorder() {
        stream_opened();
        response_sent(crate::xds::CLUSTER_TYPE_URL);
        response_nacked(crate::xds::CLUSTER_TYPE_URL);
        stream_closed();
    }
}
