//! Public HTTP edge.
//!
//! # Module Structure
//!
//! - `server` - EdgeServer and its accept loop
//! - `handler` - Per-request relay logic
//! - `host` - Client identifier resolution from Host or an out-of-band header
//! - `response` - Relayed and error response construction
//! - `headers` - Header helpers for relayed responses

mod handler;
mod headers;
mod host;
mod response;
mod server;

pub use handler::{handle_request, EdgeContext};
pub use host::{client_id_from_host, resolve_client_id};
pub use response::{relay_response, tunnel_error_response, NO_TUNNEL_BODY, TUNNEL_ERROR_BODY};
pub use server::EdgeServer;
