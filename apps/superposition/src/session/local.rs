//! In-process PTY session backend.
//!
//! Each session owns one child process on a PTY. A dedicated reader thread
//! pulls output in 32 KiB chunks, appends to the replay buffer and fans the
//! chunk out to subscribers; a reaper thread waits on the child and signals
//! completion exactly once. Blocking PTY syscalls stay confined to those
//! threads.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{
    SessionError, SessionHandle, SessionManager, Subscription, INITIAL_PTY_COLS, INITIAL_PTY_ROWS,
    PTY_READ_BUFFER_BYTES, REPLAY_BUFFER_BYTES, SUBSCRIBER_QUEUE_CHUNKS,
};

/// Bounded byte buffer holding the most recent suffix of a session's output.
pub(crate) struct ReplayBuffer {
    buf: Vec<u8>,
    bound: usize,
}

impl ReplayBuffer {
    pub(crate) fn new(bound: usize) -> Self {
        Self {
            buf: Vec::new(),
            bound,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.bound {
            let excess = self.buf.len() - self.bound;
            self.buf.drain(..excess);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

/// Fan-out of one producer to many bounded, lossy sinks. Sends never block
/// the producer; a full queue drops the chunk.
pub(crate) struct SubscriberSet {
    senders: Arc<Mutex<HashMap<u64, mpsc::Sender<Bytes>>>>,
    next_id: AtomicU64,
}

impl SubscriberSet {
    pub(crate) fn new() -> Self {
        Self {
            senders: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CHUNKS);
        self.senders.lock().unwrap().insert(id, tx);
        let senders = Arc::clone(&self.senders);
        Subscription::new(rx, move || {
            senders.lock().unwrap().remove(&id);
        })
    }

    pub(crate) fn broadcast(&self, chunk: Bytes) {
        let senders = self.senders.lock().unwrap();
        for tx in senders.values() {
            let _ = tx.try_send(chunk.clone());
        }
    }

    /// Dropping the senders ends every subscriber's stream.
    pub(crate) fn close_all(&self) {
        self.senders.lock().unwrap().clear();
    }
}

pub struct PtySession {
    id: String,
    pid: u32,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    replay: Mutex<ReplayBuffer>,
    subscribers: SubscriberSet,
    stopped: AtomicBool,
    done_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .finish()
    }
}

impl PtySession {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn resize_pty(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        let guard = self.master.lock().unwrap();
        let master = guard
            .as_ref()
            .ok_or_else(|| SessionError::Transient("session stopped".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SessionError::Transient(err.to_string()))
    }

    /// SIGTERM the child and release the PTY. Idempotent; the reaper still
    /// drives the session to its exited state.
    fn terminate(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.pid != 0 {
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
            }
        }
        self.writer.lock().unwrap().take();
        self.master.lock().unwrap().take();
    }
}

#[async_trait]
impl SessionHandle for PtySession {
    async fn replay(&self) -> Vec<u8> {
        self.replay.lock().unwrap().snapshot()
    }

    async fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        let mut guard = self.writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| SessionError::Transient("session stopped".into()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|err| SessionError::Transient(err.to_string()))?;
        Ok(data.len())
    }

    async fn done(&self) {
        let mut rx = self.done_rx.clone();
        // An error means the sender is gone, which only happens past exit.
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Session manager that owns PTYs directly.
pub struct LocalManager {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
    exit_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LocalManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            exit_tx: None,
        }
    }

    /// Container mode: session ids are sent on `exit_tx` after the child is
    /// reaped, so the owner can broadcast the exit and drop the entry.
    pub fn with_exit_notify(exit_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            exit_tx: Some(exit_tx),
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }

    pub fn remove(&self, id: &str) {
        self.sessions.write().unwrap().remove(id);
    }

    fn session(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.read().unwrap().get(id).cloned()
    }
}

impl Default for LocalManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionManager for LocalManager {
    async fn start(
        &self,
        id: &str,
        cli_type: &str,
        work_dir: &Path,
    ) -> Result<(Arc<dyn SessionHandle>, u32), SessionError> {
        if self.sessions.read().unwrap().contains_key(id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }

        // The PTY layer only reports exec failures through the child's exit
        // status, so resolve the command and working directory up front.
        if crate::preflight::look_path(cli_type).is_none() {
            return Err(SessionError::SpawnFailed(format!(
                "{cli_type}: executable not found on PATH"
            )));
        }
        if !work_dir.is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory not accessible: {}",
                work_dir.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: INITIAL_PTY_ROWS,
                cols: INITIAL_PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SessionError::SpawnFailed(err.to_string()))?;

        let mut cmd = CommandBuilder::new(cli_type);
        cmd.cwd(work_dir);
        cmd.env("TERM", "xterm-256color");
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| SessionError::SpawnFailed(err.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SessionError::SpawnFailed(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| SessionError::SpawnFailed(err.to_string()))?;

        let (done_tx, done_rx) = watch::channel(false);
        let session = Arc::new(PtySession {
            id: id.to_string(),
            pid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            replay: Mutex::new(ReplayBuffer::new(REPLAY_BUFFER_BYTES)),
            subscribers: SubscriberSet::new(),
            stopped: AtomicBool::new(false),
            done_rx,
        });

        // Register before the reaper can run, so an instantly-exiting child
        // still finds its table entry when the exit notification fires.
        self.sessions
            .write()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&session));

        // PTY output -> replay buffer + subscriber fan-out. Read errors are
        // end-of-output; the thread closes every sink on its way out.
        let producer = Arc::clone(&session);
        let mut reader = reader;
        thread::spawn(move || {
            let mut buf = vec![0u8; PTY_READ_BUFFER_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        producer.replay.lock().unwrap().push(&chunk);
                        producer.subscribers.broadcast(chunk);
                    }
                }
            }
            producer.subscribers.close_all();
            debug!(session_id = %producer.id, "pty output drained");
        });

        // Reap the child and signal completion exactly once.
        let reaped = Arc::clone(&session);
        let exit_tx = self.exit_tx.clone();
        let session_id = id.to_string();
        thread::spawn(move || {
            let _ = child.wait();
            reaped.stopped.store(true, Ordering::SeqCst);
            let _ = done_tx.send(true);
            debug!(session_id = %session_id, "child exited");
            if let Some(tx) = exit_tx {
                let _ = tx.send(session_id);
            }
        });

        Ok((session as Arc<dyn SessionHandle>, pid))
    }

    async fn stop(&self, id: &str) -> Result<(), SessionError> {
        let session = self.sessions.write().unwrap().remove(id);
        if let Some(session) = session {
            session.terminate();
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<Arc<dyn SessionHandle>> {
        self.session(id).map(|s| s as Arc<dyn SessionHandle>)
    }

    async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        let session = self
            .session(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.resize_pty(rows, cols)
    }

    async fn stop_all(&self) {
        let sessions: Vec<Arc<PtySession>> =
            self.sessions.write().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_keeps_most_recent_suffix() {
        let mut replay = ReplayBuffer::new(8);
        replay.push(b"01234567");
        assert_eq!(replay.snapshot(), b"01234567");

        // One byte over the bound drops exactly the first byte.
        replay.push(b"8");
        assert_eq!(replay.snapshot(), b"12345678");

        replay.push(b"abcdefghij");
        assert_eq!(replay.snapshot(), b"cdefghij");
    }

    #[test]
    fn replay_single_push_larger_than_bound() {
        let mut replay = ReplayBuffer::new(4);
        replay.push(b"abcdefgh");
        assert_eq!(replay.snapshot(), b"efgh");
    }

    #[tokio::test]
    async fn fanout_preserves_order_across_subscribers() {
        let set = SubscriberSet::new();
        let mut a = set.subscribe();
        let mut b = set.subscribe();

        set.broadcast(Bytes::from_static(b"one"));
        set.broadcast(Bytes::from_static(b"two"));

        assert_eq!(a.recv().await.unwrap(), "one");
        assert_eq!(a.recv().await.unwrap(), "two");
        assert_eq!(b.recv().await.unwrap(), "one");
        assert_eq!(b.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn overflow_drops_the_newest_chunk() {
        let set = SubscriberSet::new();
        let mut sub = set.subscribe();

        for i in 0..SUBSCRIBER_QUEUE_CHUNKS {
            set.broadcast(Bytes::from(format!("{i}")));
        }
        // Queue is full; the producer must not block and the chunk is lost.
        set.broadcast(Bytes::from_static(b"overflow"));
        set.close_all();

        let mut received = Vec::new();
        while let Some(chunk) = sub.recv().await {
            received.push(chunk);
        }
        assert_eq!(received.len(), SUBSCRIBER_QUEUE_CHUNKS);
        assert_eq!(received[0], "0");
        assert!(received.iter().all(|c| c != "overflow"));
    }

    #[tokio::test]
    async fn detach_on_drop_stops_delivery() {
        let set = SubscriberSet::new();
        let sub = set.subscribe();
        drop(sub);
        // No receiver left; the broadcast must not panic or block.
        set.broadcast(Bytes::from_static(b"late"));
        assert!(set.senders.lock().unwrap().is_empty());
    }
}
