//! xDS gRPC server.
//!
//! One [`XdsServer`] value implements all six discovery services (ADS
//! plus the per-type CDS/RDS/LDS/SDS/EDS endpoints) against the same set
//! of caches; every stream method defers to
//! [`stream::handle_discovery_stream`]. Fetch and incremental (delta)
//! variants are not served.

use std::pin::Pin;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use crate::config::XdsConfig;
use crate::errors::{Error, Result};
use crate::xds::{
    stream, CacheSet, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
    SECRET_TYPE_URL,
};

type SotwStream = ReceiverStream<std::result::Result<DiscoveryResponse, Status>>;
type DeltaStream =
    Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

#[derive(Clone)]
pub struct XdsServer {
    caches: CacheSet,
}

impl XdsServer {
    pub fn new(caches: CacheSet) -> Self {
        Self { caches }
    }

    fn open_stream(
        &self,
        requests: Streaming<DiscoveryRequest>,
        expected_type_url: Option<&'static str>,
    ) -> Response<SotwStream> {
        let (tx, rx) = mpsc::channel(16);
        let caches = self.caches.clone();
        tokio::spawn(async move {
            stream::handle_discovery_stream(caches, requests, tx, expected_type_url).await;
        });
        Response::new(ReceiverStream::new(rx))
    }

    /// Serve all discovery services until the shutdown future resolves.
    pub async fn serve<F>(self, config: &XdsConfig, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let addr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid xDS listen address: {e}")))?;

        info!(address = %addr, "Starting xDS server");

        Server::builder()
            .add_service(AggregatedDiscoveryServiceServer::new(self.clone()))
            .add_service(ClusterDiscoveryServiceServer::new(self.clone()))
            .add_service(RouteDiscoveryServiceServer::new(self.clone()))
            .add_service(ListenerDiscoveryServiceServer::new(self.clone()))
            .add_service(SecretDiscoveryServiceServer::new(self.clone()))
            .add_service(EndpointDiscoveryServiceServer::new(self))
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| Error::transport(format!("xDS server failed: {e}")))
    }
}

fn delta_unimplemented() -> std::result::Result<Response<DeltaStream>, Status> {
    Err(Status::unimplemented("incremental xDS is not supported"))
}

fn fetch_unimplemented() -> std::result::Result<Response<DiscoveryResponse>, Status> {
    Err(Status::unimplemented("fetch is not supported, use the streaming API"))
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for XdsServer {
    type StreamAggregatedResourcesStream = SotwStream;
    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.open_stream(request.into_inner(), None))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        delta_unimplemented()
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for XdsServer {
    type StreamClustersStream = SotwStream;
    type DeltaClustersStream = DeltaStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamClustersStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(CLUSTER_TYPE_URL)))
    }

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaClustersStream>, Status> {
        delta_unimplemented()
    }

    async fn fetch_clusters(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        fetch_unimplemented()
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for XdsServer {
    type StreamRoutesStream = SotwStream;
    type DeltaRoutesStream = DeltaStream;

    async fn stream_routes(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamRoutesStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(ROUTE_TYPE_URL)))
    }

    async fn delta_routes(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaRoutesStream>, Status> {
        delta_unimplemented()
    }

    async fn fetch_routes(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        fetch_unimplemented()
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for XdsServer {
    type StreamListenersStream = SotwStream;
    type DeltaListenersStream = DeltaStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamListenersStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(LISTENER_TYPE_URL)))
    }

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaListenersStream>, Status> {
        delta_unimplemented()
    }

    async fn fetch_listeners(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        fetch_unimplemented()
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for XdsServer {
    type StreamSecretsStream = SotwStream;
    type DeltaSecretsStream = DeltaStream;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamSecretsStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(SECRET_TYPE_URL)))
    }

    async fn delta_secrets(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaSecretsStream>, Status> {
        delta_unimplemented()
    }

    async fn fetch_secrets(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        fetch_unimplemented()
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryService for XdsServer {
    type StreamEndpointsStream = SotwStream;
    type DeltaEndpointsStream = DeltaStream;

    async fn stream_endpoints(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamEndpointsStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(ENDPOINT_TYPE_URL)))
    }

    async fn delta_endpoints(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaEndpointsStream>, Status> {
        delta_unimplemented()
    }

    async fn fetch_endpoints(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        fetch_unimplemented()
    }
}
