//! Mapping a public request to the client identifier it is addressed to.

use std::net::IpAddr;

use hyper::header::HOST;
use hyper::Request;

use crate::config::EdgeConfig;

/// Resolve the target client for `req`.
///
/// An out-of-band header named by `edge.client_id_header` wins when present.
/// Otherwise the identifier is the first label of the request host, with the
/// port stripped. When `edge.base_domain` is set the host must sit under it.
/// Bare IP addresses never name a client.
pub fn resolve_client_id<B>(req: &Request<B>, config: &EdgeConfig) -> Option<String> {
    if let Some(ref header) = config.client_id_header {
        if let Some(id) = req
            .headers()
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Some(id.to_string());
        }
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    client_id_from_host(host, config.base_domain.as_deref())
}

pub fn client_id_from_host(host: &str, base_domain: Option<&str>) -> Option<String> {
    let hostname = strip_port(host.trim());
    if hostname.is_empty() || hostname.parse::<IpAddr>().is_ok() {
        return None;
    }
    let hostname = hostname.trim_end_matches('.');

    let prefix = match base_domain {
        Some(base) => {
            let base = base.trim_matches('.');
            let split = hostname.len().checked_sub(base.len() + 1)?;
            if !hostname.is_char_boundary(split) {
                return None;
            }
            let (prefix, suffix) = hostname.split_at(split);
            if !suffix.starts_with('.') || !suffix[1..].eq_ignore_ascii_case(base) {
                return None;
            }
            prefix
        }
        None => hostname,
    };

    let label = prefix.split('.').next()?;
    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
