//! WebSocket terminal bridge: one bridge per (browser socket, session id).
//!
//! The replay snapshot is delivered before any live output, then three
//! cooperative tasks run: the output pump, the ping ticker, and the input
//! pump. All writes go through one mutex-guarded sink with a write deadline;
//! the bridge never blocks the PTY producer because its subscription queue is
//! bounded and lossy.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::AppState;
use crate::session::{SessionHandle, SessionManager};

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_WAIT: Duration = Duration::from_secs(60);
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: ResizeData,
}

#[derive(Debug, Default, Deserialize)]
struct ResizeData {
    #[serde(default)]
    rows: u16,
    #[serde(default)]
    cols: u16,
}

pub async fn websocket_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(handle) = state.manager.get(&session_id).await else {
        warn!(session_id = %session_id, "session not found for websocket");
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };
    let manager = Arc::clone(&state.manager);
    ws.on_upgrade(move |socket| bridge(socket, session_id, handle, manager))
}

async fn bridge(
    socket: WebSocket,
    session_id: String,
    handle: Arc<dyn SessionHandle>,
    manager: Arc<dyn SessionManager>,
) {
    info!(session_id = %session_id, "terminal client connected");
    let (sink, stream) = socket.split();
    let writer: SharedSink = Arc::new(Mutex::new(sink));

    // Replay precedes any live output on a fresh connection.
    let replay = handle.replay().await;
    if !replay.is_empty() {
        debug!(session_id = %session_id, bytes = replay.len(), "sending replay snapshot");
        if send_message(&writer, Message::Binary(replay)).await.is_err() {
            return;
        }
    }

    let mut subscription = handle.subscribe().await;

    let output_writer = Arc::clone(&writer);
    let output_task = tokio::spawn(async move {
        while let Some(chunk) = subscription.recv().await {
            if send_message(&output_writer, Message::Binary(chunk.to_vec()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Keep the connection alive through proxies and the gateway.
    let ping_writer = Arc::clone(&writer);
    let ping_task = tokio::spawn(async move {
        let mut ticker = interval(PING_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if send_message(&ping_writer, Message::Ping(Vec::new()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    tokio::select! {
        _ = read_client(stream, &writer, &handle, &manager, &session_id) => {
            debug!(session_id = %session_id, "terminal client disconnected");
        }
        _ = handle.done() => {
            info!(session_id = %session_id, "session ended");
            let close = Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Cow::from("session ended"),
            }));
            let _ = send_message(&writer, close).await;
        }
    }

    output_task.abort();
    ping_task.abort();
}

/// Input pump: binary frames are PTY input, text frames are JSON control.
/// Returns when the client goes away or the read deadline passes; only a
/// received pong extends the deadline.
async fn read_client(
    mut stream: SplitStream<WebSocket>,
    writer: &SharedSink,
    handle: &Arc<dyn SessionHandle>,
    manager: &Arc<dyn SessionManager>,
    session_id: &str,
) {
    let mut read_deadline = Instant::now() + PONG_WAIT;
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = sleep_until(read_deadline) => {
                debug!(session_id = %session_id, "read deadline expired");
                return;
            }
        };
        let Some(Ok(message)) = next else {
            return;
        };

        match message {
            Message::Binary(data) => {
                if let Err(err) = handle.write(&data).await {
                    debug!(session_id = %session_id, error = %err, "pty write failed");
                }
            }
            Message::Text(text) => {
                let Ok(control) = serde_json::from_str::<ControlMessage>(&text) else {
                    continue;
                };
                if control.kind == "resize" {
                    // Resizes are advisory; failures are logged, not reported.
                    if let Err(err) = manager
                        .resize(session_id, control.data.rows, control.data.cols)
                        .await
                    {
                        warn!(session_id = %session_id, error = %err, "resize failed");
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = send_message(writer, Message::Pong(payload)).await;
            }
            Message::Pong(_) => {
                read_deadline = Instant::now() + PONG_WAIT;
            }
            Message::Close(_) => return,
        }
    }
}

async fn send_message(writer: &SharedSink, message: Message) -> Result<(), axum::Error> {
    let mut sink = writer.lock().await;
    match timeout(WRITE_WAIT, sink.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline expired",
        ))),
    }
}
