//! Gateway side of the reverse tunnel: accepts one authenticated outbound
//! WebSocket from superposition and runs the yamux client session over it,
//! opening a multiplexed stream per proxied user request. At most one tunnel
//! exists at a time; a newcomer replaces the old session.

use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, warn};

use super::GatewayState;
use crate::tunnel::{WsConn, GATEWAY_SECRET_HEADER};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("gateway not connected to superposition")]
    NotConnected,
    #[error("tunnel stream failed: {0}")]
    Stream(String),
}

type OpenReply = oneshot::Sender<Result<yamux::Stream, TunnelError>>;

struct ActiveTunnel {
    open_tx: mpsc::Sender<OpenReply>,
    shutdown_tx: watch::Sender<bool>,
    generation: u64,
}

pub struct Tunnel {
    secret: String,
    active: Mutex<Option<ActiveTunnel>>,
    generation: AtomicU64,
}

impl Tunnel {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn connected(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Open a new multiplexed stream to superposition.
    pub async fn open_stream(&self) -> Result<yamux::Stream, TunnelError> {
        let open_tx = {
            let guard = self.active.lock().unwrap();
            guard
                .as_ref()
                .map(|active| active.open_tx.clone())
                .ok_or(TunnelError::NotConnected)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        open_tx
            .send(reply_tx)
            .await
            .map_err(|_| TunnelError::NotConnected)?;
        reply_rx.await.map_err(|_| TunnelError::NotConnected)?
    }

    /// Drive one tunnel session until it closes or is replaced. The session
    /// owner is this task; stream-open requests arrive over a channel.
    async fn run_session(self: Arc<Self>, socket: WebSocket) {
        info!("superposition connected");

        let (open_tx, mut open_rx) = mpsc::channel::<OpenReply>(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut guard = self.active.lock().unwrap();
            if let Some(old) = guard.take() {
                let _ = old.shutdown_tx.send(true);
                info!("replaced existing tunnel connection");
            }
            *guard = Some(ActiveTunnel {
                open_tx,
                shutdown_tx,
                generation,
            });
        }

        // The gateway is the yamux client: it opens streams, superposition
        // accepts them. Inbound streams are not part of the protocol.
        let io = WsConn::from_axum_socket(socket).compat();
        let mut connection =
            yamux::Connection::new(io, yamux::Config::default(), yamux::Mode::Client);

        loop {
            tokio::select! {
                request = open_rx.recv() => {
                    let Some(reply) = request else { break };
                    let opened = poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                    match opened {
                        Ok(stream) => {
                            let _ = reply.send(Ok(stream));
                        }
                        Err(err) => {
                            warn!(error = %err, "open stream failed");
                            let _ = reply.send(Err(TunnelError::Stream(err.to_string())));
                            break;
                        }
                    }
                }
                inbound = poll_fn(|cx| connection.poll_next_inbound(cx)) => {
                    match inbound {
                        Some(Ok(stream)) => {
                            debug!("dropping unexpected inbound stream");
                            drop(stream);
                        }
                        Some(Err(err)) => {
                            debug!(error = %err, "tunnel session error");
                            break;
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        let mut guard = self.active.lock().unwrap();
        if guard.as_ref().map(|active| active.generation) == Some(generation) {
            *guard = None;
        }
        info!("superposition disconnected");
    }
}

/// `/tunnel` endpoint: authorised by the pre-shared secret header, never by
/// user session cookies. The secret is checked before the upgrade.
pub async fn tunnel_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let provided = headers
        .get(GATEWAY_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided != Some(state.tunnel.secret.as_str()) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };
    let tunnel = Arc::clone(&state.tunnel);
    ws.on_upgrade(move |socket| tunnel.run_session(socket))
}
