//! Client side of the shepherd protocol, implementing the session-manager
//! contract by proxying every operation over the Unix socket.
//!
//! A single reader task demultiplexes inbound frames: correlated control
//! responses wake their pending request, uncorrelated `exited` notifications
//! complete per-session done signals, and output frames fan out to local
//! subscriber queues with the same overflow-drop policy as the in-process
//! backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::protocol::{
    self, Command, Event, FrameWriter, Request, Response, FRAME_CONTROL, FRAME_INPUT, FRAME_OUTPUT,
};
use crate::session::{
    SessionError, SessionHandle, SessionManager, Subscription, SUBSCRIBER_QUEUE_CHUNKS,
};

struct SessionState {
    subs: HashMap<u64, mpsc::Sender<Bytes>>,
    done_tx: watch::Sender<bool>,
    /// True once a subscribe request has been sent for this session on this
    /// connection. The shepherd-side forwarder lives for the connection's
    /// lifetime, so a second request would duplicate every chunk.
    remote_subscribed: bool,
}

impl SessionState {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            subs: HashMap::new(),
            done_tx,
            remote_subscribed: false,
        }
    }
}

struct ClientInner {
    writer: FrameWriter<OwnedWriteHalf>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    sessions: Mutex<HashMap<String, SessionState>>,
    req_counter: AtomicU64,
    next_sub_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl ClientInner {
    fn next_request_id(&self) -> String {
        format!("r{}", self.req_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn send_request(&self, mut req: Request) -> Result<Response, SessionError> {
        req.id = self.next_request_id();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(req.id.clone(), tx);
        let req_id = req.id.clone();

        if let Err(err) = self.writer.write_control(&req).await {
            self.pending.lock().unwrap().remove(&req_id);
            return Err(SessionError::Transient(format!("send request: {err}")));
        }

        let mut closed = self.closed_tx.subscribe();
        let result = tokio::select! {
            resp = rx => resp.map_err(|_| SessionError::ClientClosed),
            _ = closed.wait_for(|c| *c) => Err(SessionError::ClientClosed),
        };
        if result.is_err() {
            self.pending.lock().unwrap().remove(&req_id);
        }
        result
    }

    /// Complete the session's done signal and close its sinks, mirroring the
    /// end-of-stream a local session's subscribers observe on exit.
    fn mark_done(&self, session_id: &str) {
        if let Some(state) = self.sessions.lock().unwrap().get_mut(session_id) {
            let _ = state.done_tx.send(true);
            state.subs.clear();
        }
    }

    fn done_receiver(&self, session_id: &str) -> watch::Receiver<bool> {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionState::new);
        state.done_tx.subscribe()
    }
}

/// Connects to the shepherd and exposes its sessions through the
/// session-manager contract.
pub struct ShepherdClient {
    inner: Arc<ClientInner>,
}

impl ShepherdClient {
    pub async fn connect(socket_path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            writer: FrameWriter::new(write_half),
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            req_counter: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(1),
            closed_tx,
        });

        tokio::spawn(read_loop(Arc::clone(&inner), read_half));
        Ok(Self { inner })
    }

    /// Disconnect. All pending request waiters fail with `ClientClosed`.
    pub async fn close(&self) {
        let _ = self.inner.closed_tx.send(true);
        self.inner.writer.shutdown().await;
    }

    pub async fn ping(&self) -> Result<(), SessionError> {
        let resp = self
            .inner
            .send_request(Request::new(String::new(), Command::Ping))
            .await?;
        if resp.event != Event::Pong {
            return Err(SessionError::Transient(format!(
                "unexpected response: {:?}",
                resp.event
            )));
        }
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        let resp = self
            .inner
            .send_request(Request::new(String::new(), Command::List))
            .await?;
        Ok(resp.sessions.unwrap_or_default())
    }

    /// Register interest in a session the shepherd already owns (after a
    /// server restart) so `get` and the done signal work for it.
    pub fn adopt(&self, session_id: &str) -> watch::Receiver<bool> {
        self.inner.done_receiver(session_id)
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut read_half: OwnedReadHalf) {
    loop {
        let (frame_type, payload) = match protocol::read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(err) => {
                if !*inner.closed_tx.borrow() {
                    debug!(error = %err, "shepherd connection lost");
                }
                break;
            }
        };

        match frame_type {
            FRAME_CONTROL => {
                let resp: Response = match serde_json::from_slice(&payload) {
                    Ok(resp) => resp,
                    Err(err) => {
                        warn!(error = %err, "bad control frame from shepherd");
                        continue;
                    }
                };
                if resp.event == Event::Exited && resp.id.is_empty() {
                    if let Some(session_id) = resp.session_id.as_deref() {
                        inner.mark_done(session_id);
                    }
                    continue;
                }
                let waiter = inner.pending.lock().unwrap().remove(&resp.id);
                if let Some(tx) = waiter {
                    let _ = tx.send(resp);
                }
            }
            FRAME_OUTPUT => {
                let Ok((session_id, data)) = protocol::parse_data_payload(&payload) else {
                    continue;
                };
                let chunk = Bytes::copy_from_slice(data);
                let sessions = inner.sessions.lock().unwrap();
                if let Some(state) = sessions.get(session_id) {
                    for tx in state.subs.values() {
                        let _ = tx.try_send(chunk.clone());
                    }
                }
            }
            _ => {}
        }
    }

    // Unblock request waiters and close subscriber sinks. Live subscribers
    // are not re-attached on reconnect; that is the application's concern.
    let _ = inner.closed_tx.send(true);
    inner.pending.lock().unwrap().clear();
    let mut sessions = inner.sessions.lock().unwrap();
    for state in sessions.values_mut() {
        state.subs.clear();
        state.remote_subscribed = false;
    }
}

#[async_trait]
impl SessionManager for ShepherdClient {
    async fn start(
        &self,
        id: &str,
        cli_type: &str,
        work_dir: &Path,
    ) -> Result<(Arc<dyn SessionHandle>, u32), SessionError> {
        // Pre-register the done signal so an early exit is not missed.
        let _ = self.inner.done_receiver(id);

        let mut req = Request::new(String::new(), Command::Start).session(id);
        req.cli_type = Some(cli_type.to_string());
        req.work_dir = Some(work_dir.to_string_lossy().into_owned());

        let resp = match self.inner.send_request(req).await {
            Ok(resp) => resp,
            Err(err) => {
                self.inner.sessions.lock().unwrap().remove(id);
                return Err(err);
            }
        };
        if resp.event == Event::Error {
            self.inner.sessions.lock().unwrap().remove(id);
            return Err(SessionError::SpawnFailed(
                resp.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }

        let handle = Arc::new(ProxySession {
            inner: Arc::clone(&self.inner),
            session_id: id.to_string(),
        });
        Ok((handle as Arc<dyn SessionHandle>, resp.pid.unwrap_or(0)))
    }

    async fn stop(&self, id: &str) -> Result<(), SessionError> {
        let req = Request::new(String::new(), Command::Stop).session(id);
        let resp = self.inner.send_request(req).await?;
        if resp.event == Event::Error {
            return Err(SessionError::Transient(
                resp.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }

        self.inner.mark_done(id);
        self.inner.sessions.lock().unwrap().remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<Arc<dyn SessionHandle>> {
        if !self.inner.sessions.lock().unwrap().contains_key(id) {
            return None;
        }
        Some(Arc::new(ProxySession {
            inner: Arc::clone(&self.inner),
            session_id: id.to_string(),
        }) as Arc<dyn SessionHandle>)
    }

    async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        let mut req = Request::new(String::new(), Command::Resize).session(id);
        req.rows = Some(rows);
        req.cols = Some(cols);
        let resp = self.inner.send_request(req).await?;
        if resp.event == Event::Error {
            let message = resp.error.unwrap_or_else(|| "unknown error".into());
            if message.contains("not found") {
                return Err(SessionError::NotFound(id.to_string()));
            }
            return Err(SessionError::Transient(message));
        }
        Ok(())
    }

    async fn stop_all(&self) {
        let _ = self
            .inner
            .send_request(Request::new(String::new(), Command::StopAll))
            .await;
    }
}

/// Handle to a session living in the shepherd.
struct ProxySession {
    inner: Arc<ClientInner>,
    session_id: String,
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[async_trait]
impl SessionHandle for ProxySession {
    async fn replay(&self) -> Vec<u8> {
        let req = Request::new(String::new(), Command::Replay).session(&self.session_id);
        match self.inner.send_request(req).await {
            Ok(resp) => resp.data.unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn subscribe(&self) -> Subscription {
        let sub_id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CHUNKS);

        let need_remote = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let state = sessions
                .entry(self.session_id.clone())
                .or_insert_with(SessionState::new);
            state.subs.insert(sub_id, tx);
            let need = !state.remote_subscribed;
            state.remote_subscribed = true;
            need
        };

        // Only the first local subscriber tells the shepherd; later ones
        // attach to the existing fan-out.
        if need_remote {
            let req = Request::new(String::new(), Command::Subscribe).session(&self.session_id);
            if let Err(err) = self.inner.send_request(req).await {
                debug!(session_id = %self.session_id, error = %err, "remote subscribe failed");
            }
        }

        let inner = Arc::clone(&self.inner);
        let session_id = self.session_id.clone();
        Subscription::new(rx, move || {
            if let Some(state) = inner.sessions.lock().unwrap().get_mut(&session_id) {
                state.subs.remove(&sub_id);
            }
        })
    }

    async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        self.inner
            .writer
            .write_data(FRAME_INPUT, &self.session_id, data)
            .await
            .map_err(|err| SessionError::Transient(format!("write input: {err}")))?;
        Ok(data.len())
    }

    async fn done(&self) {
        let mut rx = self.inner.done_receiver(&self.session_id);
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_ids_are_monotonic_strings() {
        let (closed_tx, _) = watch::channel(false);
        let (stream, _other) = tokio::net::UnixStream::pair().unwrap();
        let (_read, write) = stream.into_split();
        let inner = ClientInner {
            writer: FrameWriter::new(write),
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            req_counter: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(1),
            closed_tx,
        };
        assert_eq!(inner.next_request_id(), "r1");
        assert_eq!(inner.next_request_id(), "r2");
        assert_eq!(inner.next_request_id(), "r3");
    }
}
