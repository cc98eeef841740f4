//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for HTTP webhooks, healthchecks and metrics.
    pub http_port: u16,

    /// The Kubernetes namespace this controller manages.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The bottom of the host port window from which dynamic ports are allocated.
    pub min_port: i32,
    /// The top of the host port window from which dynamic ports are allocated.
    pub max_port: i32,

    /// The number of workers each controller runs against its sync queue.
    #[serde(default = "Config::default_workers")]
    pub workers: usize,

    /// The base64 encoded PEM private key of the webhook server.
    pub webhook_key: String,
    /// The base64 encoded PEM certificate chain of the webhook server.
    pub webhook_cert: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the
    /// application config from that. In the future, this may take into account an
    /// optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        if config.min_port <= 0 || config.max_port < config.min_port {
            anyhow::bail!("invalid port window [{}, {}]", config.min_port, config.max_port);
        }
        Ok(config)
    }

    fn default_workers() -> usize {
        2
    }

    /// Create a config instance for testing.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: "".into(),
            http_port: 8081,
            namespace: "default".into(),
            pod_name: "agones-controller-0".into(),
            min_port: 7000,
            max_port: 8000,
            workers: 2,
            webhook_key: "".into(),
            webhook_cert: "".into(),
        })
    }
}
