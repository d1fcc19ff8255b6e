//! WebSocket bridge tests against a live axum server and real PTY sessions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use superposition::server::{router, AppState, SessionRegistry};
use superposition::session::local::LocalManager;
use superposition::session::{SessionHandle, SessionManager};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(10);

async fn start_server() -> (u16, Arc<LocalManager>) {
    let manager = Arc::new(LocalManager::new());
    let state = AppState::new(
        manager.clone(),
        Arc::new(SessionRegistry::new()),
        Vec::new(),
        true,
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (port, manager)
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

#[tokio::test]
async fn replay_precedes_live_output_and_close_reports_session_end() {
    let (port, manager) = start_server().await;
    let (handle, _) = manager
        .start("ws-abc", "sh", Path::new("/tmp"))
        .await
        .expect("start session");

    handle
        .write(b"printf 'Q%sR' early\n")
        .await
        .expect("pre-connect input");
    wait_for_replay_marker(&handle, "QearlyR").await;

    let url = format!("ws://127.0.0.1:{port}/ws/session/ws-abc");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("connect websocket");

    // First binary frame is the replay snapshot.
    let first = timeout(WAIT, ws.next())
        .await
        .expect("first frame in time")
        .expect("stream open")
        .expect("frame ok");
    let Message::Binary(replay) = first else {
        panic!("expected binary replay frame, got {first:?}");
    };
    assert!(String::from_utf8_lossy(&replay).contains("QearlyR"));

    // Live input round-trips, and the exit surfaces as a close frame.
    ws.send(Message::Binary(b"printf 'S%sT' live; exit\n".to_vec()))
        .await
        .expect("send input");

    let mut live = Vec::new();
    let mut close_reason = None;
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        let next = match timeout(WAIT, ws.next()).await {
            Ok(Some(Ok(message))) => message,
            _ => break,
        };
        match next {
            Message::Binary(bytes) => live.extend_from_slice(&bytes),
            Message::Close(frame) => {
                close_reason = frame.map(|f| f.reason.into_owned());
                break;
            }
            _ => {}
        }
    }

    assert!(
        String::from_utf8_lossy(&live).contains("SliveT"),
        "live output missing marker: {:?}",
        String::from_utf8_lossy(&live)
    );
    assert_eq!(close_reason.as_deref(), Some("session ended"));
}

#[tokio::test]
async fn unknown_session_is_rejected_before_upgrade() {
    let (port, _manager) = start_server().await;
    let url = format!("ws://127.0.0.1:{port}/ws/session/absent");
    let err = tokio_tungstenite::connect_async(url)
        .await
        .expect_err("upgrade must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn resize_control_changes_the_pty_size() {
    let (port, manager) = start_server().await;
    manager
        .start("ws-resize", "sh", Path::new("/tmp"))
        .await
        .expect("start session");

    let url = format!("ws://127.0.0.1:{port}/ws/session/ws-resize");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("connect websocket");

    ws.send(Message::Text(
        r#"{"type":"resize","data":{"rows":31,"cols":99}}"#.to_string(),
    ))
    .await
    .expect("send resize");
    sleep(Duration::from_millis(200)).await;

    ws.send(Message::Binary(b"stty size; exit\n".to_vec()))
        .await
        .expect("query size");

    let mut output = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        match timeout(WAIT, ws.next()).await {
            Ok(Some(Ok(Message::Binary(bytes)))) => {
                output.extend_from_slice(&bytes);
                if String::from_utf8_lossy(&output).contains("31 99") {
                    break;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => break,
            _ => {}
        }
    }

    assert!(
        String::from_utf8_lossy(&output).contains("31 99"),
        "stty never reported the new size: {:?}",
        String::from_utf8_lossy(&output)
    );
}
