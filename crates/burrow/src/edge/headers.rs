//! Header handling for relayed responses.
//!
//! Static names and values avoid runtime `.parse().unwrap()` calls; the
//! extension trait appends client-supplied headers while skipping anything
//! hyper would reject.

use hyper::header::{HeaderName, HeaderValue};
use hyper::Response;

pub static VALUE_TEXT_PLAIN: HeaderValue = HeaderValue::from_static("text/plain; charset=utf-8");
pub static VALUE_RETRY_AFTER: HeaderValue = HeaderValue::from_static("1");

/// Headers describing the client's own connection or framing. Bodies are fully
/// buffered, so hyper recomputes framing for the public response.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "content-length",
    "upgrade",
    "te",
    "trailer",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Extension trait for inserting headers into edge responses.
pub trait RelayHeadersExt {
    /// Insert a header with a static name and value.
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue);

    /// Append a client-supplied header.
    /// Returns false if the name or value isn't valid HTTP.
    fn append_header(&mut self, name: &str, value: &str) -> bool;
}

impl<B> RelayHeadersExt for Response<B> {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers_mut().insert(name.clone(), value.clone());
    }

    fn append_header(&mut self, name: &str, value: &str) -> bool {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            return false;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers_mut().append(name, value);
                true
            }
            Err(_) => false,
        }
    }
}
