//! Control channel listener and per-connection task.
//!
//! One task owns each client's WebSocket. It performs the registration
//! handshake, then multiplexes four event sources until the session ends:
//! outbound request frames, inbound client frames, the ping ticker and the
//! idle deadline. Whatever ends the loop becomes the session's close reason.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{decode_client_frame, ClientId, ClientMessage};
use super::session::{SessionOptions, TunnelSession};
use crate::config::Config;
use crate::error::{ProtocolError, TunnelError};
use crate::metrics;
use crate::registry::SessionRegistry;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Timing and limits for control connections.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub path: String,
    pub registration_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub max_message_bytes: usize,
    pub session: SessionOptions,
}

impl ControlSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.control.path.clone(),
            registration_timeout: Duration::from_millis(config.control.registration_timeout_ms),
            ping_interval: Duration::from_millis(config.control.ping_interval_ms),
            idle_timeout: Duration::from_millis(config.control.idle_timeout_ms),
            max_message_bytes: config.control.max_message_bytes,
            session: SessionOptions {
                max_in_flight: config.tunnel.max_in_flight,
                body_encoding: config.tunnel.body_encoding,
            },
        }
    }
}

/// Accepts client control connections and registers their sessions.
pub struct ControlServer {
    listener: TcpListener,
    settings: Arc<ControlSettings>,
    registry: Arc<SessionRegistry>,
}

impl ControlServer {
    pub fn new(
        listener: TcpListener,
        settings: ControlSettings,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            listener,
            settings: Arc::new(settings),
            registry,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        info!(
            "Control channel listening on ws://{}{}",
            self.listener.local_addr()?,
            self.settings.path
        );

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => {
                    info!("Control channel shutting down");
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    let settings = Arc::clone(&self.settings);
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(handle_connection(stream, remote_addr, settings, registry));
                }
                Err(e) => {
                    error!("Control channel accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    settings: Arc<ControlSettings>,
    registry: Arc<SessionRegistry>,
) {
    let ws = match accept_websocket(stream, &settings).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%remote_addr, "WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let client_id = match tokio::time::timeout(
        settings.registration_timeout,
        read_registration(&mut stream),
    )
    .await
    {
        Ok(Ok(client_id)) => client_id,
        Ok(Err(err)) => {
            warn!(%remote_addr, kind = err.kind(), "Registration rejected: {}", err);
            metrics::record_registration("rejected");
            hang_up(&mut sink, &err).await;
            return;
        }
        Err(_) => {
            let err = TunnelError::Registration(format!(
                "no registration within {} ms",
                settings.registration_timeout.as_millis()
            ));
            warn!(%remote_addr, "Registration rejected: {}", err);
            metrics::record_registration("rejected");
            hang_up(&mut sink, &err).await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(settings.session.max_in_flight);
    let session = Arc::new(TunnelSession::new(
        client_id,
        Some(remote_addr),
        outbound_tx,
        settings.session,
    ));
    registry.register(Arc::clone(&session));

    let reason = drive_session(&session, &mut sink, &mut stream, outbound_rx, &settings).await;

    // No-op if the session was already closed (supersession, shutdown)
    session.close(reason);
    registry.unregister(&session);

    if let Some(reason) = session.close_reason() {
        hang_up(&mut sink, &reason).await;
    }
}

async fn accept_websocket(
    stream: TcpStream,
    settings: &ControlSettings,
) -> Result<WebSocketStream<TcpStream>, tokio_tungstenite::tungstenite::Error> {
    let path = settings.path.clone();
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            let mut rejection =
                ErrorResponse::new(Some(format!("no control endpoint at {}", req.uri().path())));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(settings.max_message_bytes);
    ws_config.max_frame_size = Some(settings.max_message_bytes);

    tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(ws_config)).await
}

/// Wait for the first data frame, which must be a registration with a non-empty id.
async fn read_registration(stream: &mut WsStream) -> Result<ClientId, TunnelError> {
    loop {
        let message = match stream.next().await {
            None => {
                return Err(TunnelError::Channel(
                    "connection closed before registering".into(),
                ))
            }
            Some(Err(e)) => return Err(TunnelError::Channel(e.to_string())),
            Some(Ok(message)) => message,
        };

        if let Message::Close(_) = message {
            return Err(TunnelError::Channel(
                "connection closed before registering".into(),
            ));
        }

        let Some(text) = frame_text(&message)? else {
            continue;
        };

        return match decode_client_frame(text)? {
            ClientMessage::Register(registration) => ClientId::new(registration.client_id)
                .ok_or_else(|| TunnelError::Registration("client_id is empty".into())),
            ClientMessage::Response(_) => Err(TunnelError::Registration(
                "first message must be a registration".into(),
            )),
        };
    }
}

/// Run the session until something ends it and return why.
async fn drive_session(
    session: &TunnelSession,
    sink: &mut WsSink,
    stream: &mut WsStream,
    mut outbound: mpsc::Receiver<String>,
    settings: &ControlSettings,
) -> TunnelError {
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let idle = tokio::time::sleep(settings.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = session.closed() => {
                return session
                    .close_reason()
                    .unwrap_or_else(|| TunnelError::Channel("session closed".into()));
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return TunnelError::Channel("outbound queue closed".into());
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    return TunnelError::Channel(format!("write failed: {e}"));
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    return TunnelError::Channel(format!("ping failed: {e}"));
                }
            }
            _ = &mut idle => {
                return TunnelError::Channel(format!(
                    "no traffic for {} ms",
                    settings.idle_timeout.as_millis()
                ));
            }
            message = stream.next() => {
                idle.as_mut().reset(Instant::now() + settings.idle_timeout);
                match message {
                    None => return TunnelError::Channel("connection closed".into()),
                    Some(Err(e)) => return TunnelError::Channel(format!("read failed: {e}")),
                    Some(Ok(Message::Close(_))) => {
                        return TunnelError::Channel("client closed the connection".into());
                    }
                    Some(Ok(message)) => {
                        if let Err(e) = handle_client_frame(session, &message) {
                            warn!(client_id = %session.client_id(), "Protocol violation: {}", e);
                            return e.into();
                        }
                    }
                }
            }
        }
    }
}

fn handle_client_frame(session: &TunnelSession, message: &Message) -> Result<(), ProtocolError> {
    let Some(text) = frame_text(message)? else {
        // Ping/Pong only refresh the idle deadline
        return Ok(());
    };

    match decode_client_frame(text)? {
        ClientMessage::Register(_) => Err(ProtocolError::DuplicateRegistration),
        ClientMessage::Response(response) => session.deliver(response),
    }
}

fn frame_text(message: &Message) -> Result<Option<&str>, ProtocolError> {
    match message {
        Message::Text(text) => Ok(Some(text.as_str())),
        Message::Binary(bytes) => std::str::from_utf8(bytes)
            .map(Some)
            .map_err(|_| ProtocolError::NotUtf8),
        _ => Ok(None),
    }
}

/// Best-effort close frame; the peer may already be gone.
async fn hang_up(sink: &mut WsSink, reason: &TunnelError) {
    let code = match reason {
        TunnelError::Registration(_) | TunnelError::Protocol(_) => CloseCode::Policy,
        TunnelError::SessionSuperseded(_) => CloseCode::Normal,
        _ => CloseCode::Away,
    };
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
