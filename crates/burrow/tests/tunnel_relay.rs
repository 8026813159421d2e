//! End-to-end tests for the tunnel relay.
//!
//! Each test starts a real edge and control listener on ephemeral ports, drives
//! the control channel with a tokio-tungstenite client and calls the edge with
//! reqwest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow::config::Config;
use burrow::edge::{EdgeContext, EdgeServer};
use burrow::net::bind_listener;
use burrow::registry::SessionRegistry;
use burrow::tunnel::{ControlServer, ControlSettings, RequestEnvelope, ResponseEnvelope};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    edge_addr: SocketAddr,
    control_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    http: reqwest::Client,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(config: Config) -> Harness {
    let registry = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();

    let edge = EdgeServer::new(
        bind_listener("127.0.0.1", 0).unwrap(),
        EdgeContext::new(&config, Arc::clone(&registry)),
    );
    let control = ControlServer::new(
        bind_listener("127.0.0.1", 0).unwrap(),
        ControlSettings::from_config(&config),
        Arc::clone(&registry),
    );
    let edge_addr = edge.local_addr().unwrap();
    let control_addr = control.local_addr().unwrap();

    tokio::spawn(edge.run(shutdown.clone()));
    tokio::spawn(control.run(shutdown.clone()));

    Harness {
        edge_addr,
        control_addr,
        registry,
        shutdown,
        http: reqwest::Client::builder().no_proxy().build().unwrap(),
    }
}

impl Harness {
    async fn connect(&self) -> Client {
        let url = format!("ws://{}/register", self.control_addr);
        let (ws, _) = connect_async(url).await.expect("control handshake failed");
        ws
    }

    /// Connect and register, returning once the registry shows the new session.
    async fn register(&self, client_id: &str) -> Client {
        let previous = self.registry.lookup(client_id).map(|s| s.session_id());
        let mut ws = self.connect().await;
        ws.send(Message::Text(json!({ "client_id": client_id }).to_string()))
            .await
            .unwrap();

        let registry = Arc::clone(&self.registry);
        let id = client_id.to_string();
        wait_until(move || {
            registry
                .lookup(&id)
                .is_some_and(|s| Some(s.session_id()) != previous)
        })
        .await;
        ws
    }

    fn post(&self, host: &str, path: &str, body: &'static str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("http://{}{}", self.edge_addr, path))
            .header("host", host)
            .header("content-type", "text/plain")
            .body(body)
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next request frame, skipping control frames.
async fn next_request(ws: &mut Client) -> RequestEnvelope {
    loop {
        let message = tokio::time::timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("no frame from edge")
            .expect("control channel ended")
            .expect("control channel error");
        if let Message::Text(text) = message {
            return RequestEnvelope::decode(&text).unwrap();
        }
    }
}

/// Read until the server closes the connection; returns true if it did.
async fn closed_by_server(ws: &mut Client) -> bool {
    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    result.is_ok()
}

/// Complete one round trip with the correlation id echoed, which lets the
/// session multiplex and survive timeouts.
async fn echo_once(harness: &Harness, client: &mut Client, host: &str) {
    let call = tokio::spawn(harness.post(host, "/hello", "").send());
    let request = next_request(client).await;
    client.send(reply(&request, 200, "hi")).await.unwrap();
    assert_eq!(call.await.unwrap().unwrap().status(), 200);
}

fn reply(request: &RequestEnvelope, status: u16, body: &'static str) -> Message {
    let mut response = ResponseEnvelope::new(status);
    response.id = Some(request.id.clone());
    response.body = Bytes::from_static(body.as_bytes());
    Message::Text(response.encode().unwrap())
}

#[tokio::test]
async fn test_round_trip_through_tunnel() {
    let harness = start(Config::default()).await;
    let mut client = harness.register("app").await;

    let call = tokio::spawn(harness.post("app.localhost", "/foo?x=1", "hello").send());

    let request = next_request(&mut client).await;
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/foo?x=1");
    assert_eq!(request.headers.get("content-type"), Some("text/plain"));
    assert_eq!(request.headers.get("host"), Some("app.localhost"));
    assert_eq!(request.body, Bytes::from_static(b"hello"));

    // Plain JSON exactly as a minimal client would write it
    let answer = json!({
        "id": request.id,
        "status": 200,
        "headers": {"X-A": "1"},
        "body": "world"
    });
    client.send(Message::Text(answer.to_string())).await.unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-a").unwrap(), "1");
    assert_eq!(response.text().await.unwrap(), "world");
}

#[tokio::test]
async fn test_unknown_client_gets_502() {
    let harness = start(Config::default()).await;
    let response = harness
        .post("nobody.localhost", "/", "")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "no tunnel");
}

#[tokio::test]
async fn test_client_without_correlation_ids() {
    let harness = start(Config::default()).await;
    let mut client = harness.register("legacy").await;

    let call = tokio::spawn(harness.post("legacy.localhost", "/", "ping").send());
    next_request(&mut client).await;
    client
        .send(Message::Text(
            json!({"status": 201, "headers": {}, "body": "pong"}).to_string(),
        ))
        .await
        .unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "pong");
}

#[tokio::test]
async fn test_client_without_correlation_ids_gets_one_slot() {
    let harness = start(Config::default()).await;
    let mut client = harness.register("legacy").await;

    let first = tokio::spawn(harness.post("legacy.localhost", "/first", "1").send());
    let request = next_request(&mut client).await;
    assert_eq!(request.path, "/first");

    let second = harness
        .post("legacy.localhost", "/second", "2")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 502);
    assert_eq!(second.headers().get("retry-after").unwrap(), "1");

    client
        .send(Message::Text(
            json!({"status": 200, "body": "answer for first"}).to_string(),
        ))
        .await
        .unwrap();
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "answer for first");
    assert!(harness.registry.lookup("legacy").is_some());
}

#[tokio::test]
async fn test_timeout_before_first_answer_drops_client() {
    let mut config = Config::default();
    config.tunnel.request_timeout_ms = 300;
    let harness = start(config).await;
    let mut client = harness.register("legacy").await;

    let call = tokio::spawn(harness.post("legacy.localhost", "/first", "1").send());
    next_request(&mut client).await;
    assert_eq!(call.await.unwrap().unwrap().status(), 502);

    // Its answer could no longer be attributed, so the session is gone
    assert!(closed_by_server(&mut client).await);
    let registry = Arc::clone(&harness.registry);
    wait_until(move || registry.lookup("legacy").is_none()).await;

    let response = harness
        .post("legacy.localhost", "/second", "2")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "no tunnel");
}

#[tokio::test]
async fn test_new_registration_supersedes_old() {
    let harness = start(Config::default()).await;
    let mut first = harness.register("app").await;
    let mut second = harness.register("app").await;

    assert!(closed_by_server(&mut first).await);
    assert_eq!(harness.registry.len(), 1);

    let call = tokio::spawn(harness.post("app.localhost", "/", "x").send());
    let request = next_request(&mut second).await;
    second.send(reply(&request, 200, "from second")).await.unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "from second");
}

#[tokio::test]
async fn test_supersession_releases_pending_caller() {
    let harness = start(Config::default()).await;
    let mut first = harness.register("app").await;

    let call = tokio::spawn(harness.post("app.localhost", "/", "x").send());
    next_request(&mut first).await;

    let _second = harness.register("app").await;
    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "tunnel error");
}

#[tokio::test]
async fn test_disconnect_releases_pending_caller() {
    let harness = start(Config::default()).await;
    let mut client = harness.register("app").await;

    let call = tokio::spawn(harness.post("app.localhost", "/", "x").send());
    next_request(&mut client).await;
    drop(client);

    let response = tokio::time::timeout(TEST_TIMEOUT, call)
        .await
        .expect("caller was left hanging")
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 502);

    let registry = Arc::clone(&harness.registry);
    wait_until(move || registry.lookup("app").is_none()).await;
}

#[tokio::test]
async fn test_request_timeout() {
    let mut config = Config::default();
    config.tunnel.request_timeout_ms = 300;
    let harness = start(config).await;
    let mut client = harness.register("slow").await;
    echo_once(&harness, &mut client, "slow.localhost").await;

    let started = std::time::Instant::now();
    let call = tokio::spawn(harness.post("slow.localhost", "/", "x").send());
    let request = next_request(&mut client).await;

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), 502);
    assert!(started.elapsed() < Duration::from_secs(5));

    let session = harness.registry.lookup("slow").unwrap();
    assert_eq!(session.in_flight(), 0);

    // A late answer is dropped and the session keeps working
    client.send(reply(&request, 200, "late")).await.unwrap();
    let call = tokio::spawn(harness.post("slow.localhost", "/", "y").send());
    let request = next_request(&mut client).await;
    client.send(reply(&request, 200, "on time")).await.unwrap();
    let response = call.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "on time");
}

#[tokio::test]
async fn test_busy_when_slots_exhausted() {
    let mut config = Config::default();
    config.tunnel.max_in_flight = 1;
    let harness = start(config).await;
    let mut client = harness.register("app").await;

    let first = tokio::spawn(harness.post("app.localhost", "/first", "1").send());
    let request = next_request(&mut client).await;
    assert_eq!(request.path, "/first");

    let second = harness.post("app.localhost", "/second", "2").send().await.unwrap();
    assert_eq!(second.status(), 502);
    assert_eq!(second.headers().get("retry-after").unwrap(), "1");

    client.send(reply(&request, 200, "first")).await.unwrap();
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "first");
}

#[tokio::test]
async fn test_concurrent_requests_are_multiplexed() {
    let harness = start(Config::default()).await;
    let mut client = harness.register("app").await;
    echo_once(&harness, &mut client, "app.localhost").await;

    let a = tokio::spawn(harness.post("app.localhost", "/a", "").send());
    let b = tokio::spawn(harness.post("app.localhost", "/b", "").send());

    let first = next_request(&mut client).await;
    let second = next_request(&mut client).await;

    // Answer in reverse order; correlation ids route each answer home
    for request in [&second, &first] {
        let mut response = ResponseEnvelope::new(200);
        response.id = Some(request.id.clone());
        response.body = Bytes::from(format!("answer for {}", request.path));
        client
            .send(Message::Text(response.encode().unwrap()))
            .await
            .unwrap();
    }

    let body_a = a.await.unwrap().unwrap().text().await.unwrap();
    let body_b = b.await.unwrap().unwrap().text().await.unwrap();
    assert_eq!(body_a, "answer for /a");
    assert_eq!(body_b, "answer for /b");
}

#[tokio::test]
async fn test_empty_client_id_is_rejected() {
    let harness = start(Config::default()).await;
    let mut ws = harness.connect().await;
    ws.send(Message::Text(json!({ "client_id": "" }).to_string()))
        .await
        .unwrap();

    assert!(closed_by_server(&mut ws).await);
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_first_message_must_register() {
    let harness = start(Config::default()).await;
    let mut ws = harness.connect().await;
    ws.send(Message::Text(json!({ "status": 200 }).to_string()))
        .await
        .unwrap();

    assert!(closed_by_server(&mut ws).await);
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_second_registration_closes_connection() {
    let harness = start(Config::default()).await;
    let mut client = harness.register("app").await;

    client
        .send(Message::Text(json!({ "client_id": "other" }).to_string()))
        .await
        .unwrap();

    assert!(closed_by_server(&mut client).await);
    let registry = Arc::clone(&harness.registry);
    wait_until(move || registry.is_empty()).await;
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let harness = start(Config::default()).await;
    let mut client = harness.register("app").await;

    client
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();

    assert!(closed_by_server(&mut client).await);
    let registry = Arc::clone(&harness.registry);
    wait_until(move || registry.lookup("app").is_none()).await;
}

#[tokio::test]
async fn test_wrong_control_path_is_refused() {
    let harness = start(Config::default()).await;
    let url = format!("ws://{}/elsewhere", harness.control_addr);
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_idle_timeout() {
    let mut config = Config::default();
    config.control.ping_interval_ms = 50;
    config.control.idle_timeout_ms = 200;
    let harness = start(config).await;

    // Never polling the stream means pings go unanswered
    let _client = harness.register("quiet").await;

    let registry = Arc::clone(&harness.registry);
    wait_until(move || registry.lookup("quiet").is_none()).await;
}

#[tokio::test]
async fn test_responsive_client_survives_idle_window() {
    let mut config = Config::default();
    config.control.ping_interval_ms = 50;
    config.control.idle_timeout_ms = 200;
    let harness = start(config).await;
    let mut client = harness.register("lively").await;

    // Reading lets the client answer pings with pongs
    let _ = tokio::time::timeout(Duration::from_millis(600), client.next()).await;
    assert!(harness.registry.lookup("lively").is_some());
}
