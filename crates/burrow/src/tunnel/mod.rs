//! Tunnel sessions and the control channel.
//!
//! # Module Structure
//!
//! - `protocol` - Envelope types and JSON framing
//! - `correlator` - Pending request map and the per-request state machine
//! - `session` - TunnelSession: one client's live channel and its forwarding API
//! - `control` - ControlServer: WebSocket accept loop and per-connection task

mod control;
mod correlator;
mod protocol;
mod session;

pub use control::{ControlServer, ControlSettings};
pub use correlator::{Completion, CorrelationResult, PendingRequests};
pub use protocol::{
    decode_body, decode_client_frame, encode_body, ClientId, ClientMessage, HeaderList,
    Registration, RequestEnvelope, ResponseEnvelope, FALLBACK_STATUS,
};
pub use session::{SessionOptions, TunnelSession};
