//! Public request handling: resolve the client, relay, translate the result.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, info, warn};

use super::host::resolve_client_id;
use super::response::{plain_response, relay_response, tunnel_error_response, ResponseExt};
use crate::config::{Config, EdgeConfig};
use crate::error::TunnelError;
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::tunnel::RequestEnvelope;

/// Everything a request needs; the edge only reads from the registry.
pub struct EdgeContext {
    pub registry: Arc<SessionRegistry>,
    pub edge: EdgeConfig,
    pub request_timeout: Duration,
}

impl EdgeContext {
    pub fn new(config: &Config, registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            edge: config.edge.clone(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// Handle one public request.
pub async fn handle_request<B>(
    ctx: &EdgeContext,
    req: Request<B>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let Some(client_id) = resolve_client_id(&req, &ctx.edge) else {
        debug!("No client identifier in request for {}", uri);
        return Ok(finish(start, Err(TunnelError::SessionNotFound(String::new()))).into_boxed());
    };

    // Reject before reading the body or touching any channel
    if ctx.registry.lookup(&client_id).is_none() {
        debug!(client_id = %client_id, "No tunnel for {} {}", method, uri);
        return Ok(finish(start, Err(TunnelError::SessionNotFound(client_id))).into_boxed());
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(client_id = %client_id, "Failed to read request body: {}", e);
            return Ok(plain_response(StatusCode::BAD_REQUEST, "bad request").into_boxed());
        }
    };
    let envelope = RequestEnvelope::from_parts(&parts, body);
    let request_id = envelope.id.clone();

    // The session may have been superseded or dropped while the body was read
    let result = match ctx.registry.lookup(&client_id) {
        Some(session) => session.forward(envelope, ctx.request_timeout).await,
        None => Err(TunnelError::SessionNotFound(client_id.clone())),
    };

    match result {
        Ok(ref resp) => info!(
            client_id = %client_id,
            request_id = %request_id,
            status = resp.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "{} {}", method, uri
        ),
        Err(ref e) => warn!(
            client_id = %client_id,
            request_id = %request_id,
            kind = e.kind(),
            "{} {} failed: {}", method, uri, e
        ),
    }

    Ok(finish(start, result).into_boxed())
}

fn finish(
    start: Instant,
    result: Result<crate::tunnel::ResponseEnvelope, TunnelError>,
) -> Response<http_body_util::Full<Bytes>> {
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    match result {
        Ok(envelope) => {
            metrics::record_edge_request("relayed", duration_ms);
            relay_response(envelope)
        }
        Err(e) => {
            metrics::record_edge_request(e.kind(), duration_ms);
            tunnel_error_response(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BodyEncoding;
    use crate::tunnel::{ClientId, ResponseEnvelope, SessionOptions, TunnelSession};
    use http_body_util::Full;
    use tokio::sync::mpsc;

    fn context(timeout: Duration) -> EdgeContext {
        EdgeContext {
            registry: Arc::new(SessionRegistry::new()),
            edge: EdgeConfig::default(),
            request_timeout: timeout,
        }
    }

    fn register(ctx: &EdgeContext, id: &str) -> (Arc<TunnelSession>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(4);
        let session = Arc::new(TunnelSession::new(
            ClientId::new(id).unwrap(),
            None,
            tx,
            SessionOptions {
                max_in_flight: 1,
                body_encoding: BodyEncoding::Latin1,
            },
        ));
        ctx.registry.register(Arc::clone(&session));
        (session, rx)
    }

    fn post(host: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/foo?x=1")
            .header("host", host)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap()
    }

    async fn body_of(response: Response<BoxBody<Bytes, hyper::Error>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_unknown_client_is_502() {
        let ctx = context(Duration::from_secs(1));
        let response = handle_request(&ctx, post("ghost.example.com")).await.unwrap();
        assert_eq!(response.status(), 502);
        assert_eq!(body_of(response).await, "no tunnel");
    }

    #[tokio::test]
    async fn test_missing_host_is_502() {
        let ctx = context(Duration::from_secs(1));
        let req = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle_request(&ctx, req).await.unwrap();
        assert_eq!(response.status(), 502);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let ctx = context(Duration::from_secs(5));
        let (session, mut rx) = register(&ctx, "app");

        let client = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let req = RequestEnvelope::decode(&frame).unwrap();
            assert_eq!(req.method, "POST");
            assert_eq!(req.path, "/foo?x=1");
            assert_eq!(req.headers.get("content-type"), Some("text/plain"));
            assert_eq!(req.body, Bytes::from_static(b"hello"));

            let mut resp = ResponseEnvelope::new(200);
            resp.id = Some(req.id);
            resp.headers.push(("X-A".into(), "1".into()));
            resp.body = Bytes::from_static(b"world");
            session.deliver(resp).unwrap();
        });

        let response = handle_request(&ctx, post("app.example.com")).await.unwrap();
        client.await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("x-a").unwrap(), "1");
        assert_eq!(body_of(response).await, "world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_502() {
        let ctx = context(Duration::from_millis(250));
        let (session, _rx) = register(&ctx, "slow");

        let response = handle_request(&ctx, post("slow.example.com")).await.unwrap();
        assert_eq!(response.status(), 502);
        assert_eq!(body_of(response).await, "tunnel error");
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_channel_error_is_502() {
        let ctx = context(Duration::from_secs(30));
        let (session, mut rx) = register(&ctx, "flaky");

        let closer = tokio::spawn(async move {
            rx.recv().await.unwrap();
            session.close(TunnelError::Channel("reset".into()));
        });

        let response = handle_request(&ctx, post("flaky.example.com")).await.unwrap();
        closer.await.unwrap();
        assert_eq!(response.status(), 502);
        assert_eq!(body_of(response).await, "tunnel error");
    }

    #[tokio::test]
    async fn test_handler_does_not_mutate_registry() {
        let ctx = context(Duration::from_secs(1));
        let (session, _rx) = register(&ctx, "app");
        session.close(TunnelError::Channel("gone".into()));

        let response = handle_request(&ctx, post("app.example.com")).await.unwrap();
        assert_eq!(response.status(), 502);
        // Cleanup belongs to the control task, not the edge
        assert!(ctx.registry.lookup("app").is_some());
    }
}
