//! Proxies user HTTP and WebSocket traffic through the tunnel. Each request
//! gets its own multiplexed stream; an HTTP/1 client handshake runs over the
//! stream, so upgrades and streamed bodies behave exactly like a direct
//! connection.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, warn};

use super::GatewayState;

pub async fn proxy_handler(State(state): State<GatewayState>, req: Request) -> Response {
    let path = req.uri().path();
    let is_api = path.starts_with("/api/");
    let is_ws = path.starts_with("/ws/");

    if !is_api && !is_ws {
        return frontend_fallback();
    }

    let wants_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_ws && wants_upgrade {
        proxy_websocket(state, req).await
    } else {
        proxy_http(state, req).await
    }
}

async fn proxy_http(state: GatewayState, req: Request) -> Response {
    let stream = match state.tunnel.open_stream().await {
        Ok(stream) => stream,
        Err(_) => return not_connected(),
    };

    let io = TokioIo::new(stream.compat());
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(parts) => parts,
        Err(err) => {
            warn!(error = %err, "tunnel handshake failed");
            return bad_gateway("tunnel write failed");
        }
    };
    tokio::spawn(async move {
        let _ = conn.await;
    });

    match sender.send_request(req).await {
        Ok(resp) => resp.map(Body::new).into_response(),
        Err(err) => {
            warn!(error = %err, "proxy request failed");
            bad_gateway("tunnel read failed")
        }
    }
}

/// Forward the upgrade request through the tunnel, mirror the 101 back to
/// the user, then splice raw bytes both ways with half-close propagation.
async fn proxy_websocket(state: GatewayState, mut req: Request) -> Response {
    let stream = match state.tunnel.open_stream().await {
        Ok(stream) => stream,
        Err(_) => return not_connected(),
    };

    // Taken before the request is consumed; resolves once the 101 reaches
    // the user's connection.
    let client_upgrade = hyper::upgrade::on(&mut req);

    let io = TokioIo::new(stream.compat());
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(parts) => parts,
        Err(err) => {
            warn!(error = %err, "tunnel handshake failed");
            return bad_gateway("tunnel write failed");
        }
    };
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });

    let upstream_resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(error = %err, "websocket upgrade through tunnel failed");
            return bad_gateway("tunnel read failed");
        }
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        return upstream_resp.map(Body::new).into_response();
    }

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in upstream_resp.headers() {
        builder = builder.header(name, value);
    }

    tokio::spawn(async move {
        let upstream = match hyper::upgrade::on(upstream_resp).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                debug!(error = %err, "upstream upgrade failed");
                return;
            }
        };
        let client = match client_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                debug!(error = %err, "client upgrade failed");
                return;
            }
        };

        let mut upstream = TokioIo::new(upstream);
        let mut client = TokioIo::new(client);
        if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            debug!(error = %err, "websocket proxy ended");
        }
    });

    match builder.body(Body::empty()) {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "build upgrade response failed");
            bad_gateway("tunnel read failed")
        }
    }
}

fn not_connected() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"error":"gateway not connected to superposition"}"#,
    )
        .into_response()
}

fn bad_gateway(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "application/json")],
        format!(r#"{{"error":"{message}"}}"#),
    )
        .into_response()
}

/// The frontend bundle is served by the embedding process; standalone
/// gateways answer with a pointer instead of a broken SPA.
fn frontend_fallback() -> Response {
    Html(
        "<!doctype html><html><body><h1>Superposition Gateway</h1>\
         <p>No frontend bundle is installed on this gateway.</p></body></html>",
    )
    .into_response()
}
