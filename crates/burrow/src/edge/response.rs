//! Building public HTTP responses from relay results.

use std::convert::Infallible;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use tracing::warn;

use super::headers::{is_hop_by_hop, RelayHeadersExt, VALUE_RETRY_AFTER, VALUE_TEXT_PLAIN};
use crate::error::TunnelError;
use crate::tunnel::ResponseEnvelope;

pub const NO_TUNNEL_BODY: &str = "no tunnel";
pub const TUNNEL_ERROR_BODY: &str = "tunnel error";

/// Extension trait for `Response<Full<Bytes>>` providing common transformations.
pub trait ResponseExt {
    /// Convert the response body into the boxed body type the server returns.
    fn into_boxed(self) -> Response<BoxBody<Bytes, hyper::Error>>;
}

impl ResponseExt for Response<Full<Bytes>> {
    fn into_boxed(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.map(|b| BoxBody::new(b.map_err(|never: Infallible| match never {})))
    }
}

/// Translate a client's response into the public response, verbatim apart
/// from framing headers. An unusable status becomes 502.
pub fn relay_response(envelope: ResponseEnvelope) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Full::new(envelope.body));
    *response.status_mut() = status;

    for (name, value) in &envelope.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if !response.append_header(name, value) {
            warn!(header = %name, "Dropping invalid header from client response");
        }
    }
    response
}

/// The fixed 502 shown to public callers; the error kind itself stays in logs.
pub fn tunnel_error_response(err: &TunnelError) -> Response<Full<Bytes>> {
    let body = match err {
        TunnelError::SessionNotFound(_) => NO_TUNNEL_BODY,
        _ => TUNNEL_ERROR_BODY,
    };
    let mut response = plain_response(StatusCode::BAD_GATEWAY, body);
    if err.is_retryable() {
        response.set_header(&RETRY_AFTER, &VALUE_RETRY_AFTER);
    }
    response
}

pub fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.set_header(&CONTENT_TYPE, &VALUE_TEXT_PLAIN);
    response
}
