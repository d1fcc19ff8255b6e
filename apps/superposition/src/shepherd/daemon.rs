//! Shepherd daemon: accepts local socket connections and multiplexes many
//! PTY sessions to many clients.
//!
//! A bad frame closes only the offending connection; sessions and the other
//! connections are unaffected. When a session exits, every connected client
//! receives one `exited` notification before the session is dropped from the
//! table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DataPaths;
use crate::protocol::{
    self, Command, Event, FrameWriter, Request, Response, FRAME_CONTROL, FRAME_INPUT, FRAME_OUTPUT,
};
use crate::session::local::LocalManager;
use crate::session::{SessionError, SessionManager};

#[derive(Debug, Error)]
pub enum ShepherdError {
    #[error("shepherd already running")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct ClientConn {
    id: u64,
    writer: FrameWriter<OwnedWriteHalf>,
}

struct Shepherd {
    manager: Arc<LocalManager>,
    clients: Mutex<HashMap<u64, Arc<ClientConn>>>,
    next_client_id: AtomicU64,
}

impl Shepherd {
    fn register(&self, writer: FrameWriter<OwnedWriteHalf>) -> Arc<ClientConn> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(ClientConn { id, writer });
        self.clients.lock().unwrap().insert(id, Arc::clone(&conn));
        conn
    }

    fn deregister(&self, conn: &ClientConn) {
        self.clients.lock().unwrap().remove(&conn.id);
    }

    fn client_snapshot(&self) -> Vec<Arc<ClientConn>> {
        self.clients.lock().unwrap().values().cloned().collect()
    }
}

/// Run the shepherd. Blocks until an interrupt or terminate signal arrives,
/// then stops every child and removes the socket and pid file.
pub async fn run(paths: &DataPaths) -> Result<(), ShepherdError> {
    let socket_path = paths.shepherd_socket();
    let pid_path = paths.shepherd_pid();

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    clean_stale_socket(&socket_path, &pid_path).await?;

    std::fs::write(&pid_path, std::process::id().to_string())?;
    let listener = UnixListener::bind(&socket_path)?;

    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let shepherd = Arc::new(Shepherd {
        manager: Arc::new(LocalManager::with_exit_notify(exit_tx)),
        clients: Mutex::new(HashMap::new()),
        next_client_id: AtomicU64::new(1),
    });

    tokio::spawn(broadcast_exits(Arc::clone(&shepherd), exit_rx));

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    info!(socket = %socket_path.display(), pid = std::process::id(), "shepherd listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let shepherd = Arc::clone(&shepherd);
                        tokio::spawn(handle_conn(shepherd, stream));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                }
            }
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("shepherd shutting down");
    drop(listener);
    shepherd.manager.stop_all().await;
    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

/// Remove a leftover socket if the process that owned it is gone. A live
/// socket or a live pid means another shepherd owns this home.
async fn clean_stale_socket(socket_path: &Path, pid_path: &Path) -> Result<(), ShepherdError> {
    if !socket_path.exists() {
        return Ok(());
    }

    if UnixStream::connect(socket_path).await.is_ok() {
        return Err(ShepherdError::AlreadyRunning);
    }

    if let Ok(pid_data) = std::fs::read_to_string(pid_path) {
        if let Ok(pid) = pid_data.trim().parse::<i32>() {
            if unsafe { libc::kill(pid, 0) } == 0 {
                return Err(ShepherdError::AlreadyRunning);
            }
        }
    }

    info!(socket = %socket_path.display(), "removing stale socket");
    let _ = std::fs::remove_file(socket_path);
    let _ = std::fs::remove_file(pid_path);
    Ok(())
}

async fn broadcast_exits(shepherd: Arc<Shepherd>, mut exit_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(session_id) = exit_rx.recv().await {
        let notification = Response::exited(&session_id);
        for conn in shepherd.client_snapshot() {
            if let Err(err) = conn.writer.write_control(&notification).await {
                debug!(client = conn.id, error = %err, "exit notification failed");
            }
        }
        shepherd.manager.remove(&session_id);
        info!(session_id = %session_id, "session exited");
    }
}

async fn handle_conn(shepherd: Arc<Shepherd>, stream: UnixStream) {
    let (mut read_half, write_half) = stream.into_split();
    let conn = shepherd.register(FrameWriter::new(write_half));
    debug!(client = conn.id, "client connected");

    loop {
        let (frame_type, payload) = match protocol::read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(err) => {
                // EOF is a normal disconnect; anything else closes just this
                // connection.
                debug!(client = conn.id, error = %err, "connection closed");
                break;
            }
        };

        match frame_type {
            FRAME_CONTROL => handle_control(&shepherd, &conn, &payload).await,
            FRAME_INPUT => handle_input(&shepherd, &payload).await,
            other => {
                warn!(client = conn.id, frame_type = other, "unknown frame type");
                break;
            }
        }
    }

    shepherd.deregister(&conn);
}

async fn handle_control(shepherd: &Arc<Shepherd>, conn: &Arc<ClientConn>, payload: &[u8]) {
    let req: Request = match serde_json::from_slice(payload) {
        Ok(req) => req,
        Err(err) => {
            warn!(client = conn.id, error = %err, "bad control message");
            return;
        }
    };

    let resp = match req.command {
        Command::Ping => Response::event(&req.id, Event::Pong),
        Command::Start => handle_start(shepherd, &req).await,
        Command::Stop => handle_stop(shepherd, &req).await,
        Command::Resize => handle_resize(shepherd, &req).await,
        Command::Replay => handle_replay(shepherd, &req).await,
        Command::Subscribe => handle_subscribe(shepherd, conn, &req).await,
        Command::List => {
            let mut resp = Response::event(&req.id, Event::List);
            resp.sessions = Some(shepherd.manager.list_ids());
            resp
        }
        Command::StopAll => {
            shepherd.manager.stop_all().await;
            Response::event(&req.id, Event::StopDone)
        }
    };

    if let Err(err) = conn.writer.write_control(&resp).await {
        debug!(client = conn.id, error = %err, "response write failed");
    }
}

async fn handle_start(shepherd: &Arc<Shepherd>, req: &Request) -> Response {
    let (Some(session_id), Some(cli_type)) = (req.session_id.as_deref(), req.cli_type.as_deref())
    else {
        return Response::error(&req.id, "start requires session_id and cli_type");
    };
    let work_dir = req.work_dir.as_deref().unwrap_or("/");

    match shepherd
        .manager
        .start(session_id, cli_type, Path::new(work_dir))
        .await
    {
        Ok((_, pid)) => {
            info!(session_id = %session_id, cli = %cli_type, pid, "session started");
            let mut resp = Response::event(&req.id, Event::Started);
            resp.session_id = Some(session_id.to_string());
            resp.pid = Some(pid);
            resp
        }
        Err(err) => Response::error(&req.id, err.to_string()),
    }
}

async fn handle_stop(shepherd: &Arc<Shepherd>, req: &Request) -> Response {
    if let Some(session_id) = req.session_id.as_deref() {
        let _ = shepherd.manager.stop(session_id).await;
    }
    Response::event(&req.id, Event::StopDone)
}

async fn handle_resize(shepherd: &Arc<Shepherd>, req: &Request) -> Response {
    let Some(session_id) = req.session_id.as_deref() else {
        return Response::error(&req.id, "resize requires session_id");
    };
    let (rows, cols) = (req.rows.unwrap_or(0), req.cols.unwrap_or(0));
    match shepherd.manager.resize(session_id, rows, cols).await {
        Ok(()) => Response::event(&req.id, Event::Resized),
        Err(SessionError::NotFound(_)) => Response::error(&req.id, "session not found"),
        Err(err) => Response::error(&req.id, err.to_string()),
    }
}

async fn handle_replay(shepherd: &Arc<Shepherd>, req: &Request) -> Response {
    let Some(session_id) = req.session_id.as_deref() else {
        return Response::error(&req.id, "replay requires session_id");
    };
    let Some(handle) = shepherd.manager.get(session_id).await else {
        return Response::error(&req.id, "session not found");
    };
    let mut resp = Response::event(&req.id, Event::Replay);
    resp.session_id = Some(session_id.to_string());
    resp.data = Some(handle.replay().await);
    resp
}

/// Acknowledge, then forward output frames to this connection until the
/// session ends or the connection goes away. The client side guarantees a
/// single subscribe per (connection, session).
async fn handle_subscribe(
    shepherd: &Arc<Shepherd>,
    conn: &Arc<ClientConn>,
    req: &Request,
) -> Response {
    let Some(session_id) = req.session_id.as_deref() else {
        return Response::error(&req.id, "subscribe requires session_id");
    };
    let Some(handle) = shepherd.manager.get(session_id).await else {
        return Response::error(&req.id, "session not found");
    };

    let mut subscription = handle.subscribe().await;
    let conn = Arc::clone(conn);
    let session_id_owned = session_id.to_string();
    tokio::spawn(async move {
        while let Some(chunk) = subscription.recv().await {
            if conn
                .writer
                .write_data(FRAME_OUTPUT, &session_id_owned, &chunk)
                .await
                .is_err()
            {
                break;
            }
        }
        debug!(client = conn.id, session_id = %session_id_owned, "forwarder finished");
    });

    let mut resp = Response::event(&req.id, Event::Subscribed);
    resp.session_id = Some(session_id.to_string());
    resp
}

/// Input frames route to the named session's PTY; unknown sessions are
/// dropped silently.
async fn handle_input(shepherd: &Arc<Shepherd>, payload: &[u8]) {
    let Ok((session_id, data)) = protocol::parse_data_payload(payload) else {
        return;
    };
    if let Some(handle) = shepherd.manager.get(session_id).await {
        let _ = handle.write(data).await;
    }
}
