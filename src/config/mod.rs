//! # Configuration Management
//!
//! Process configuration for the breakwater control plane, read once at
//! startup from `BREAKWATER_*` environment variables and passed by
//! reference into the compiler, caches and stream handler. There is no
//! CLI layer; embedders that need one construct `ControlPlaneConfig`
//! directly.

use std::time::Duration;

use crate::{Error, Result};

/// Top-level application configuration
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// xDS gRPC server settings
    pub xds: XdsConfig,
    /// Ingress class this instance watches; objects annotated with a
    /// different class are ignored entirely
    pub ingress_class: String,
    /// Namespaces allowed to contain root IngressRoutes; `None` means
    /// unrestricted
    pub root_namespaces: Option<Vec<String>>,
    /// Quiescence window for the change coalescer
    pub holdoff: Duration,
    /// Envoy-facing listener addresses emitted through LDS
    pub envoy: EnvoyListenerConfig,
    /// Prometheus exporter listen address; `None` disables the exporter
    pub metrics_address: Option<std::net::SocketAddr>,
    /// Emit JSON logs instead of the human-readable format
    pub log_json: bool,
}

/// xDS server configuration
#[derive(Debug, Clone)]
pub struct XdsConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Addresses and ports of the HTTP/HTTPS listeners handed to Envoy
#[derive(Debug, Clone)]
pub struct EnvoyListenerConfig {
    pub http_address: String,
    pub http_port: u16,
    pub https_address: String,
    pub https_port: u16,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 8001 }
    }
}

impl Default for EnvoyListenerConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0".to_string(),
            http_port: 8080,
            https_address: "0.0.0.0".to_string(),
            https_port: 8443,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            xds: XdsConfig::default(),
            ingress_class: "breakwater".to_string(),
            root_namespaces: None,
            holdoff: Duration::from_millis(100),
            envoy: EnvoyListenerConfig::default(),
            metrics_address: None,
            log_json: false,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_port(name: &str, default: u16) -> Result<u16> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::config(format!("invalid value for {}: {}", name, e))),
        None => Ok(default),
    }
}

impl ControlPlaneConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind_address =
            env_var("BREAKWATER_XDS_BIND_ADDRESS").unwrap_or(defaults.xds.bind_address);
        let port = env_port("BREAKWATER_XDS_PORT", defaults.xds.port)?;

        let ingress_class =
            env_var("BREAKWATER_INGRESS_CLASS").unwrap_or(defaults.ingress_class);

        let root_namespaces = env_var("BREAKWATER_ROOT_NAMESPACES").map(|raw| {
            raw.split(',').map(|ns| ns.trim().to_string()).filter(|ns| !ns.is_empty()).collect()
        });

        let holdoff = match env_var("BREAKWATER_HOLDOFF_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .map_err(|e| Error::config(format!("invalid BREAKWATER_HOLDOFF_MS: {}", e)))?,
            ),
            None => defaults.holdoff,
        };

        let envoy = EnvoyListenerConfig {
            http_address: env_var("BREAKWATER_ENVOY_HTTP_ADDRESS")
                .unwrap_or(defaults.envoy.http_address),
            http_port: env_port("BREAKWATER_ENVOY_HTTP_PORT", defaults.envoy.http_port)?,
            https_address: env_var("BREAKWATER_ENVOY_HTTPS_ADDRESS")
                .unwrap_or(defaults.envoy.https_address),
            https_port: env_port("BREAKWATER_ENVOY_HTTPS_PORT", defaults.envoy.https_port)?,
        };

        let metrics_address = match env_var("BREAKWATER_METRICS_ADDRESS") {
            Some(raw) => Some(raw.parse().map_err(|e| {
                Error::config(format!("invalid BREAKWATER_METRICS_ADDRESS: {}", e))
            })?),
            None => None,
        };

        let log_json = matches!(
            env_var("BREAKWATER_LOG_FORMAT").as_deref(),
            Some("json") | Some("JSON")
        );

        let config = Self {
            xds: XdsConfig { bind_address, port },
            ingress_class,
            root_namespaces,
            holdoff,
            envoy,
            metrics_address,
            log_json,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.ingress_class.is_empty() {
            return Err(Error::config("ingress class must not be empty"));
        }
        if self.envoy.http_port == self.envoy.https_port {
            return Err(Error::config(format!(
                "Envoy HTTP and HTTPS listeners cannot share port {}",
                self.envoy.http_port
            )));
        }
        if let Some(namespaces) = &self.root_namespaces {
            if namespaces.is_empty() {
                return Err(Error::config(
                    "BREAKWATER_ROOT_NAMESPACES was set but contains no namespaces",
                ));
            }
        }
        Ok(())
    }
}
