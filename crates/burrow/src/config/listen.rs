//! Listener configuration for the public edge, the control channel and metrics.

use serde::{Deserialize, Serialize};

/// Public HTTP edge listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EdgeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_edge_port")]
    pub port: u16,
    /// Header set by a fronting reverse proxy that names the client directly.
    /// Takes precedence over the Host header when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_header: Option<String>,
    /// When set, only hosts of the form `<client>.<base_domain>` are routed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_domain: Option<String>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_edge_port(),
            client_id_header: None,
            base_domain: None,
        }
    }
}

/// WebSocket control channel listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    /// Upgrade path clients must connect to
    #[serde(default = "default_control_path")]
    pub path: String,
    /// How long a new connection may take to send its registration
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// A session that produces no frame (including pongs) for this long is dead
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_control_port(),
            path: default_control_path(),
            registration_timeout_ms: default_registration_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_edge_port() -> u16 {
    8080
}

fn default_control_port() -> u16 {
    4443
}

fn default_control_path() -> String {
    "/register".to_string()
}

fn default_registration_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_idle_timeout_ms() -> u64 {
    45_000
}

fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_metrics_port() -> u16 {
    9090
}
