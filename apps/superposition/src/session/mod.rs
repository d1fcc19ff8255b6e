//! Session manager contract consumed by the WebSocket bridge and REST layer.
//!
//! Two interchangeable backends: [`local::LocalManager`] owns PTYs in-process;
//! `shepherd::client::ShepherdClient` proxies to the long-lived supervisor.
//! Behaviour is observationally identical modulo the shepherd's cross-restart
//! persistence.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod local;

/// Bound on the per-session replay buffer; newly attached consumers receive
/// at most this much of the output suffix.
pub const REPLAY_BUFFER_BYTES: usize = 100 * 1024;
/// Per-subscriber queue depth; chunks past this are dropped, never blocked on.
pub const SUBSCRIBER_QUEUE_CHUNKS: usize = 256;
/// PTY read buffer size.
pub const PTY_READ_BUFFER_BYTES: usize = 32 * 1024;

pub const INITIAL_PTY_ROWS: u16 = 40;
pub const INITIAL_PTY_COLS: u16 = 120;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Transient(String),
    #[error("client closed")]
    ClientClosed,
}

/// A live attachment to a session's output stream. Dropping it detaches the
/// subscriber; the channel also ends when the session exits.
pub struct Subscription {
    receiver: mpsc::Receiver<Bytes>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Bytes>, detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            detach: Some(Box::new(detach)),
        }
    }

    /// Next output chunk, or `None` once the session has exited.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

#[async_trait]
pub trait SessionHandle: Send + Sync + std::fmt::Debug {
    /// Snapshot of the most recent output, bounded to [`REPLAY_BUFFER_BYTES`].
    async fn replay(&self) -> Vec<u8>;

    /// Attach a bounded, lossy sink receiving every chunk emitted after this
    /// call. Call [`SessionHandle::replay`] first to observe the prefix.
    async fn subscribe(&self) -> Subscription;

    /// Write input bytes to the PTY; returns the number of bytes written.
    async fn write(&self, data: &[u8]) -> Result<usize, SessionError>;

    /// Resolves once the child process has exited. Signalled exactly once.
    async fn done(&self);
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn start(
        &self,
        id: &str,
        cli_type: &str,
        work_dir: &Path,
    ) -> Result<(Arc<dyn SessionHandle>, u32), SessionError>;

    /// Stop a session. Unknown ids are a no-op.
    async fn stop(&self, id: &str) -> Result<(), SessionError>;

    async fn get(&self, id: &str) -> Option<Arc<dyn SessionHandle>>;

    async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), SessionError>;

    async fn stop_all(&self);
}
