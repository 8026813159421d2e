//! Relay behavior: correlation timeout, in-flight bound and body encoding.

use serde::{Deserialize, Serialize};

/// Text form used to carry raw bytes inside a JSON envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Each byte becomes the code point U+0000..U+00FF
    #[default]
    Latin1,
    Base64,
    /// Only valid for responses; bytes are the UTF-8 encoding of the string
    Utf8,
}

impl BodyEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyEncoding::Latin1 => "latin1",
            BodyEncoding::Base64 => "base64",
            BodyEncoding::Utf8 => "utf8",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "latin1" | "latin-1" | "iso-8859-1" => Some(BodyEncoding::Latin1),
            "base64" => Some(BodyEncoding::Base64),
            "utf8" | "utf-8" => Some(BodyEncoding::Utf8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Upper bound on waiting for a client's response
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Outstanding requests allowed per session before new ones are rejected as busy
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Encoding of request bodies sent to clients
    #[serde(default)]
    pub body_encoding: BodyEncoding,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            body_encoding: BodyEncoding::default(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    32
}
