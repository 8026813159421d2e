//! A registered client's live control channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use super::correlator::{Completion, PendingRequests};
use super::protocol::{ClientId, RequestEnvelope, ResponseEnvelope};
use crate::config::BodyEncoding;
use crate::error::{ProtocolError, TunnelError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-session settings taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub max_in_flight: usize,
    pub body_encoding: BodyEncoding,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            body_encoding: BodyEncoding::Latin1,
        }
    }
}

/// One client's live control channel.
///
/// The session does not own the socket. Outbound frames go through `outbound`
/// to the connection task, which writes them and feeds inbound responses back
/// through [`TunnelSession::deliver`]. Closing the session seals the pending
/// map and cancels `shutdown`, which tells the connection task to hang up.
pub struct TunnelSession {
    client_id: ClientId,
    session_id: u64,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<String>,
    pending: Mutex<PendingRequests>,
    shutdown: CancellationToken,
    options: SessionOptions,
    connected_at: Instant,
}

impl TunnelSession {
    pub fn new(
        client_id: ClientId,
        remote_addr: Option<SocketAddr>,
        outbound: mpsc::Sender<String>,
        options: SessionOptions,
    ) -> Self {
        Self {
            client_id,
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            outbound,
            pending: Mutex::new(PendingRequests::new(options.max_in_flight)),
            shutdown: CancellationToken::new(),
            options,
            connected_at: Instant::now(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Process-unique number distinguishing successive sessions of one client.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        !self.pending.lock().is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Why the session closed, if it has.
    pub fn close_reason(&self) -> Option<TunnelError> {
        self.pending.lock().close_reason().cloned()
    }

    /// Resolves once the session has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Relay one request and wait at most `timeout` for its response.
    ///
    /// Fails fast with `Busy` when every slot is taken and with the close
    /// reason when the session is already gone. On timeout the slot is freed;
    /// a session whose client does not echo correlation ids is closed as well,
    /// since its next response could no longer be attributed.
    pub async fn forward(
        &self,
        request: RequestEnvelope,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, TunnelError> {
        let frame = request.encode(self.options.body_encoding)?;
        let rx = self.pending.lock().reserve(&request.id, self.client_id.as_str())?;
        let _slot = SlotGuard {
            session: self,
            id: &request.id,
        };

        debug!(
            client_id = %self.client_id,
            request_id = %request.id,
            method = %request.method,
            path = %request.path,
            "Relaying request"
        );

        let exchange = async {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| TunnelError::Channel("control channel writer has stopped".into()))?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(TunnelError::Channel("session dropped".into())),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(
                    client_id = %self.client_id,
                    request_id = %request.id,
                    timeout_ms,
                    "No response from client in time"
                );
                if self.pending.lock().is_legacy() {
                    self.close(TunnelError::Channel(
                        "client fell out of sync after a timeout".into(),
                    ));
                }
                Err(TunnelError::Timeout(timeout_ms))
            }
        }
    }

    /// Route a response from the client to its waiting caller.
    pub fn deliver(&self, response: ResponseEnvelope) -> Result<(), ProtocolError> {
        let status = response.status;
        match self.pending.lock().complete(response)? {
            Completion::Delivered(id) => {
                debug!(client_id = %self.client_id, request_id = %id, status, "Response delivered");
            }
            Completion::Late(id) => {
                warn!(
                    client_id = %self.client_id,
                    request_id = id.as_deref().unwrap_or("-"),
                    status,
                    "Discarding response nobody is waiting for"
                );
            }
        }
        Ok(())
    }

    /// Destroy the session: release every waiting caller with `reason` and
    /// signal the connection task. Only the first call has any effect.
    pub fn close(&self, reason: TunnelError) -> bool {
        let released = {
            let mut pending = self.pending.lock();
            if pending.is_closed() {
                return false;
            }
            pending.fail_all(reason.clone())
        };
        self.shutdown.cancel();

        info!(
            client_id = %self.client_id,
            session_id = self.session_id,
            reason = reason.kind(),
            released,
            "Session closed"
        );
        true
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("client_id", &self.client_id)
            .field("session_id", &self.session_id)
            .field("remote_addr", &self.remote_addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Frees a pending slot when the forwarding future ends for any reason,
/// including the public caller going away mid-wait.
struct SlotGuard<'a> {
    session: &'a TunnelSession,
    id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.session.pending.lock().cancel(self.id) {
            debug!(client_id = %self.session.client_id, request_id = %self.id, "Pending slot released");
        }
    }
}
