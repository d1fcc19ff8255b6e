//! Loads cached TLS material for the gateway listener. Minting the
//! self-signed pair is handled by the deployment tooling; this only reads
//! the PEMs it left behind.

use std::path::Path;

use anyhow::{bail, Context, Result};
use axum_server::tls_rustls::RustlsConfig;

pub async fn load_config(cert: &Path, key: &Path) -> Result<RustlsConfig> {
    if !cert.exists() || !key.exists() {
        bail!(
            "TLS material not found ({} / {}); pass --tls-cert/--tls-key or place PEMs there",
            cert.display(),
            key.display()
        );
    }
    RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("load TLS config from {}", cert.display()))
}
