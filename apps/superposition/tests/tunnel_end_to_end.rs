//! Full reverse-tunnel path: a real superposition server, a gateway (served
//! without TLS for the test), and a tunnel client splicing them together
//! over yamux. HTTP and WebSocket traffic both traverse the tunnel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use superposition::gateway::{router as gateway_router, Auth, GatewayState, Tunnel};
use superposition::server::{router as server_router, AppState, SessionRegistry};
use superposition::session::local::LocalManager;
use superposition::session::{SessionHandle, SessionManager};
use superposition::tunnel::TunnelClient;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(10);
const SECRET: &str = "test-tunnel-secret";

async fn start_superposition() -> (u16, Arc<LocalManager>) {
    let manager = Arc::new(LocalManager::new());
    let state = AppState::new(
        manager.clone(),
        Arc::new(SessionRegistry::new()),
        Vec::new(),
        true,
    );
    let app = server_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind superposition");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve superposition");
    });
    (port, manager)
}

async fn start_gateway(state: GatewayState) -> u16 {
    let app = gateway_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve gateway");
    });
    port
}

async fn connect_tunnel(state: &GatewayState, gateway_port: u16, superposition_port: u16) {
    let client = TunnelClient::new(
        format!("ws://127.0.0.1:{gateway_port}/tunnel"),
        SECRET.to_string(),
        format!("127.0.0.1:{superposition_port}"),
    );
    tokio::spawn(client.run());

    for _ in 0..400 {
        if state.tunnel.connected() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("tunnel never connected");
}

async fn http_get(port: u16, path: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("dial gateway");
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .expect("handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(path)
        .header(header::HOST, "127.0.0.1")
        .body(Body::empty())
        .expect("build request");
    let response = sender.send_request(request).await.expect("send request");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

fn test_state() -> GatewayState {
    GatewayState {
        auth: Arc::new(Auth::new("admin".into(), "hunter2".into())),
        tunnel: Arc::new(Tunnel::new(SECRET.into())),
    }
}

#[tokio::test]
async fn http_requests_traverse_the_tunnel() {
    let (superposition_port, _manager) = start_superposition().await;
    let state = test_state();
    let gateway_port = start_gateway(state.clone()).await;
    connect_tunnel(&state, gateway_port, superposition_port).await;

    // /api/health is auth-exempt and proxied straight through to the server.
    let (status, body) = http_get(gateway_port, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""status":"ok""#), "body was {body:?}");
    assert!(body.contains(r#""git":true"#));

    // The gateway's own health now reports the tunnel as connected.
    let (status, body) = http_get(gateway_port, "/gateway/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""connected":true"#));
}

#[tokio::test]
async fn websocket_terminal_traffic_traverses_the_tunnel() {
    let (superposition_port, manager) = start_superposition().await;
    let state = test_state();
    let gateway_port = start_gateway(state.clone()).await;
    connect_tunnel(&state, gateway_port, superposition_port).await;

    let (handle, _) = manager
        .start("tunnel-ws", "sh", Path::new("/tmp"))
        .await
        .expect("start session");
    handle
        .write(b"printf 'U%sV' seeded\n")
        .await
        .expect("seed output");
    wait_for_replay_marker(&handle, "UseededV").await;

    // Authenticated WebSocket through the gateway proxy.
    let token = state.auth.sign_session("admin", u64::MAX / 2);
    let mut request = format!("ws://127.0.0.1:{gateway_port}/ws/session/tunnel-ws")
        .into_client_request()
        .expect("build ws request");
    request.headers_mut().insert(
        "Cookie",
        HeaderValue::from_str(&format!("sp_session={token}")).expect("cookie value"),
    );

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("connect through gateway");

    let first = timeout(WAIT, ws.next())
        .await
        .expect("replay in time")
        .expect("stream open")
        .expect("frame ok");
    let Message::Binary(replay) = first else {
        panic!("expected replay frame, got {first:?}");
    };
    assert!(String::from_utf8_lossy(&replay).contains("UseededV"));

    ws.send(Message::Binary(b"printf 'W%sX' through; exit\n".to_vec()))
        .await
        .expect("send input");

    let mut live = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        match timeout(WAIT, ws.next()).await {
            Ok(Some(Ok(Message::Binary(bytes)))) => {
                live.extend_from_slice(&bytes);
                if String::from_utf8_lossy(&live).contains("WthroughX") {
                    break;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => break,
            _ => {}
        }
    }
    assert!(
        String::from_utf8_lossy(&live).contains("WthroughX"),
        "live output missing: {:?}",
        String::from_utf8_lossy(&live)
    );
}

#[tokio::test]
async fn unauthenticated_websocket_is_rejected_at_the_gateway() {
    let (superposition_port, _manager) = start_superposition().await;
    let state = test_state();
    let gateway_port = start_gateway(state.clone()).await;
    connect_tunnel(&state, gateway_port, superposition_port).await;

    let url = format!("ws://127.0.0.1:{gateway_port}/ws/session/nope");
    let err = tokio_tungstenite::connect_async(url)
        .await
        .expect_err("must be rejected before proxying");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
}

async fn wait_for_replay_marker(handle: &Arc<dyn SessionHandle>, marker: &str) {
    for _ in 0..200 {
        let replay = handle.replay().await;
        if String::from_utf8_lossy(&replay).contains(marker) {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("replay never contained {marker:?}");
}
