//! Burrow: a public HTTP edge for clients behind NAT.
//!
//! Clients open an outbound WebSocket to the control listener and register an
//! identifier. Public requests for `<identifier>.<domain>` are wrapped into
//! envelopes, relayed over that channel, and the client's answer is returned
//! to the original caller.

pub mod config;
pub mod edge;
pub mod error;
pub mod metrics;
pub mod net;
pub mod registry;
pub mod tunnel;

pub use config::Config;
pub use error::{ProtocolError, TunnelError};
pub use registry::SessionRegistry;
