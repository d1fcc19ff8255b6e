//! Public HTTPS gateway: single-credential authentication plus tunnel
//! multiplexing. User traffic under `/api/` and `/ws/` is proxied through the
//! reverse tunnel to the superposition server; everything else falls back to
//! the frontend handler supplied by the embedding process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::State;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::RngCore;
use serde_json::json;
use tracing::info;

use crate::config::DataPaths;

pub mod auth;
pub mod login;
pub mod proxy;
pub mod tls;
pub mod tunnel;

pub use auth::Auth;
pub use tunnel::Tunnel;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub username: String,
    pub password: String,
    pub secret: String,
}

impl GatewayConfig {
    pub fn from_env(port: u16, tls_cert: Option<PathBuf>, tls_key: Option<PathBuf>) -> Self {
        Self {
            port,
            tls_cert,
            tls_key,
            username: std::env::var("SP_USERNAME").unwrap_or_default(),
            password: std::env::var("SP_PASSWORD").unwrap_or_default(),
            secret: std::env::var("SP_GATEWAY_SECRET").unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub auth: Arc<Auth>,
    pub tunnel: Arc<Tunnel>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/auth/login", get(auth::login_page).post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/tunnel", get(tunnel::tunnel_handler))
        .route("/gateway/health", get(gateway_health))
        .fallback(proxy::proxy_handler)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state)
}

/// Liveness probe, exempt from auth. Uses a distinct path so `/api/health`
/// is proxied to the superposition server; frontends read `connected` to
/// tell "server offline" apart from network errors.
async fn gateway_health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "gateway": true,
        "connected": state.tunnel.connected(),
    }))
}

pub async fn run(cfg: GatewayConfig, paths: &DataPaths) -> Result<()> {
    if cfg.username.is_empty() || cfg.password.is_empty() {
        bail!("SP_USERNAME and SP_PASSWORD environment variables are required");
    }

    let secret = if cfg.secret.is_empty() {
        generate_secret()
    } else {
        cfg.secret.clone()
    };

    let state = GatewayState {
        auth: Arc::new(Auth::new(cfg.username.clone(), cfg.password.clone())),
        tunnel: Arc::new(Tunnel::new(secret.clone())),
    };
    let app = router(state);

    let cert = cfg.tls_cert.clone().unwrap_or_else(|| paths.gateway_tls_cert());
    let key = cfg.tls_key.clone().unwrap_or_else(|| paths.gateway_tls_key());
    let rustls_config = tls::load_config(&cert, &key).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    println!("Superposition Gateway");
    println!("=====================");
    println!();
    println!("Listening on https://{addr}");
    println!("Tunnel secret: {secret}");
    println!();
    println!("Connect superposition with:");
    println!("  superposition --gateway {} --gateway-secret {secret}", tunnel_url(cfg.port));
    println!();

    info!(%addr, "gateway listening");
    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service())
        .await
        .context("gateway server")?;
    Ok(())
}

fn tunnel_url(port: u16) -> String {
    if port == 443 {
        "wss://YOUR_HOST/tunnel".to_string()
    } else {
        format!("wss://YOUR_HOST:{port}/tunnel")
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
