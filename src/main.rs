use breakwater::{ControlPlane, ControlPlaneConfig, Result, APP_NAME, VERSION};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControlPlaneConfig::from_env()?;
    breakwater::observability::init_tracing(config.log_json)?;

    info!(
        app_name = APP_NAME,
        version = VERSION,
        ingress_class = %config.ingress_class,
        xds_port = config.xds.port,
        "Starting control plane"
    );

    ControlPlane::new(config).run(shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received, draining streams");
}
