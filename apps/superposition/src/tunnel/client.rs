//! Reverse-tunnel client: dials the gateway, runs a yamux session in the
//! server role, and bridges every inbound stream onto the local HTTP server.
//! Reconnects forever with bounded exponential backoff.

use std::future::poll_fn;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::{WsConn, GATEWAY_SECRET_HEADER};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Next reconnect delay: doubles up to the cap.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

pub struct TunnelClient {
    gateway_url: String,
    secret: String,
    local_addr: String,
}

impl TunnelClient {
    pub fn new(gateway_url: String, secret: String, local_addr: String) -> Self {
        Self {
            gateway_url,
            secret,
            local_addr,
        }
    }

    /// Connect and serve tunnel traffic, reconnecting on every failure.
    /// Never returns; run it on its own task.
    pub async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Err(err) = self.connect(&mut backoff).await {
                warn!(error = %err, "tunnel connection failed");
            }
            debug!(delay_secs = backoff.as_secs(), "tunnel reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn connect(&self, backoff: &mut Duration) -> Result<()> {
        // The gateway usually runs on a self-signed certificate; the
        // pre-shared secret authenticates the connection, not cert identity.
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("build tls connector")?;

        let mut request = self
            .gateway_url
            .as_str()
            .into_client_request()
            .context("build tunnel request")?;
        request.headers_mut().insert(
            GATEWAY_SECRET_HEADER,
            HeaderValue::from_str(&self.secret).context("secret header value")?,
        );

        let (ws, _) =
            connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls)))
                .await
                .context("dial gateway")?;
        info!(url = %self.gateway_url, "connected to gateway");
        *backoff = INITIAL_BACKOFF;

        // Superposition is the yamux server: the gateway opens a stream per
        // incoming user request.
        let io = WsConn::from_client_stream(ws).compat();
        let mut connection =
            yamux::Connection::new(io, yamux::Config::default(), yamux::Mode::Server);

        while let Some(inbound) = poll_fn(|cx| connection.poll_next_inbound(cx)).await {
            let stream = inbound.context("accept tunnel stream")?;
            let local_addr = self.local_addr.clone();
            tokio::spawn(handle_stream(stream, local_addr));
        }
        Ok(())
    }
}

/// Splice one tunnel stream onto a fresh loopback connection. EOF on either
/// direction propagates as a half-close so in-flight bytes still drain.
async fn handle_stream(stream: yamux::Stream, local_addr: String) {
    let mut local = match TcpStream::connect(&local_addr).await {
        Ok(local) => local,
        Err(err) => {
            warn!(addr = %local_addr, error = %err, "dial local server failed");
            return;
        }
    };

    let mut stream = stream.compat();
    if let Err(err) = tokio::io::copy_bidirectional(&mut stream, &mut local).await {
        debug!(error = %err, "tunnel stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_to_the_cap() {
        let mut delay = INITIAL_BACKOFF;
        let mut schedule = vec![delay];
        for _ in 0..6 {
            delay = next_backoff(delay);
            schedule.push(delay);
        }
        let secs: Vec<u64> = schedule.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, [1, 2, 4, 8, 16, 30, 30]);
    }
}
