//! Logging and metrics for the control plane.

pub mod metrics;

use tracing_subscriber::EnvFilter;

use crate::errors::Result;

/// Initialize the tracing subscriber. `RUST_LOG` controls the filter;
/// `json` switches the output to one JSON object per event for log
/// pipelines.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| crate::errors::Error::config(format!("failed to initialize tracing: {e}")))
}
