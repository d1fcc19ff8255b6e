//! Wire protocol between the shepherd and its clients.
//!
//! Frames are length-prefixed: a 4-byte big-endian length (counting the type
//! byte and the payload), a 1-byte type tag, then the payload. Control frames
//! carry a JSON [`Request`] or [`Response`]; output and input frames carry
//! `(id_len: u8) · session id · raw bytes`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// JSON control message.
pub const FRAME_CONTROL: u8 = 0x01;
/// PTY output: session id + raw bytes.
pub const FRAME_OUTPUT: u8 = 0x02;
/// PTY input: session id + raw bytes.
pub const FRAME_INPUT: u8 = 0x03;

/// Frames larger than this are protocol errors, rejected before allocation.
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("data payload too short")]
    ShortDataPayload,
    #[error("control payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Start,
    Stop,
    Resize,
    Replay,
    Subscribe,
    List,
    Ping,
    StopAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Started,
    Stopped,
    Error,
    Replay,
    List,
    Pong,
    Exited,
    StopDone,
    Resized,
    Subscribed,
}

/// Control message from a client to the shepherd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request correlation id.
    pub id: String,
    pub command: Command,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

impl Request {
    pub fn new(id: String, command: Command) -> Self {
        Self {
            id,
            command,
            session_id: None,
            cli_type: None,
            work_dir: None,
            rows: None,
            cols: None,
        }
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Control message from the shepherd to a client. Synchronous responses echo
/// the request id; asynchronous `Exited` notifications carry an empty id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: String,
    pub event: Event,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<String>>,
}

impl Response {
    pub fn event(id: &str, event: Event) -> Self {
        Self {
            id: id.to_string(),
            event,
            pid: None,
            error: None,
            session_id: None,
            data: None,
            sessions: None,
        }
    }

    pub fn error(id: &str, message: impl Into<String>) -> Self {
        let mut resp = Self::event(id, Event::Error);
        resp.error = Some(message.into());
        resp
    }

    /// Asynchronous exit notification; carries no correlation id.
    pub fn exited(session_id: &str) -> Self {
        let mut resp = Self::event("", Event::Exited);
        resp.session_id = Some(session_id.to_string());
        resp
    }
}

/// Encode one frame into a contiguous buffer so it can be written with a
/// single call under the connection's write lock.
pub fn encode_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32 + 1;
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

/// Read one frame. Length 0 and lengths above [`MAX_FRAME_LEN`] are rejected
/// before any payload allocation happens.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut type_buf = [0u8; 1];
    reader.read_exact(&mut type_buf).await?;
    let mut payload = vec![0u8; len as usize - 1];
    reader.read_exact(&mut payload).await?;
    Ok((type_buf[0], payload))
}

/// Build an output/input payload: `(id_len: u8) · id · data`.
pub fn encode_data_payload(session_id: &str, data: &[u8]) -> Vec<u8> {
    let id = session_id.as_bytes();
    debug_assert!(id.len() <= u8::MAX as usize, "session id too long for wire");
    let mut payload = Vec::with_capacity(1 + id.len() + data.len());
    payload.push(id.len() as u8);
    payload.extend_from_slice(id);
    payload.extend_from_slice(data);
    payload
}

/// Split an output/input payload into its session id and data.
pub fn parse_data_payload(payload: &[u8]) -> Result<(&str, &[u8]), ProtocolError> {
    let id_len = *payload.first().ok_or(ProtocolError::ShortDataPayload)? as usize;
    if payload.len() < 1 + id_len {
        return Err(ProtocolError::ShortDataPayload);
    }
    let id = std::str::from_utf8(&payload[1..1 + id_len])
        .map_err(|_| ProtocolError::ShortDataPayload)?;
    Ok((id, &payload[1 + id_len..]))
}

/// Write half of a connection. Frames are encoded up front and written whole
/// under the lock so concurrent producers never interleave frame bodies. The
/// lock is never held across a read.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub async fn write_control<T: Serialize>(&self, msg: &T) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(msg)?;
        self.write_raw(FRAME_CONTROL, &payload).await
    }

    pub async fn write_data(
        &self,
        frame_type: u8,
        session_id: &str,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let payload = encode_data_payload(session_id, data);
        self.write_raw(frame_type, &payload).await
    }

    async fn write_raw(&self, frame_type: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode_frame(frame_type, payload);
        let mut guard = self.inner.lock().await;
        guard.write_all(&frame).await?;
        guard.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        let _ = guard.shutdown().await;
    }
}
