//! Configuration types for the Burrow edge.

mod listen;
mod tunnel;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use listen::{ControlConfig, EdgeConfig, MetricsConfig};
pub use tunnel::{BodyEncoding, TunnelConfig};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        // An empty document deserializes to unit, not an empty mapping
        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.edge.port != 0 && self.edge.port == self.control.port {
            anyhow::bail!(
                "edge and control listeners must use different ports (both are {})",
                self.edge.port
            );
        }

        if self.metrics.enabled
            && self.metrics.port != 0
            && (self.metrics.port == self.edge.port || self.metrics.port == self.control.port)
        {
            anyhow::bail!("metrics port {} collides with another listener", self.metrics.port);
        }

        if !self.control.path.starts_with('/') {
            anyhow::bail!(
                "control.path must start with '/', got '{}'",
                self.control.path
            );
        }

        if self.tunnel.request_timeout_ms == 0 {
            anyhow::bail!("tunnel.request_timeout_ms must be greater than zero");
        }

        if self.tunnel.max_in_flight == 0 {
            anyhow::bail!("tunnel.max_in_flight must be at least 1");
        }

        if self.tunnel.body_encoding == BodyEncoding::Utf8 {
            anyhow::bail!("tunnel.body_encoding must be 'latin1' or 'base64'; utf8 cannot carry arbitrary bytes");
        }

        if self.control.registration_timeout_ms == 0 || self.control.ping_interval_ms == 0 {
            anyhow::bail!("control timeouts must be greater than zero");
        }

        if self.control.idle_timeout_ms <= self.control.ping_interval_ms {
            anyhow::bail!(
                "control.idle_timeout_ms ({}) must exceed control.ping_interval_ms ({})",
                self.control.idle_timeout_ms,
                self.control.ping_interval_ms
            );
        }

        if let Some(ref header) = self.edge.client_id_header {
            hyper::header::HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                anyhow::anyhow!("edge.client_id_header '{header}' is not a valid header name: {e}")
            })?;
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel.request_timeout_ms)
    }
}
