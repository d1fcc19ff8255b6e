use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use directories::BaseDirs;

/// Filesystem layout of the superposition data directory.
///
/// Everything the server and the shepherd persist lives under one root,
/// `$SUPERPOSITION_DATA_DIR` or `~/.superposition`.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn resolve() -> Result<Self> {
        if let Ok(dir) = env::var("SUPERPOSITION_DATA_DIR") {
            if !dir.trim().is_empty() {
                return Ok(Self { root: PathBuf::from(dir) });
            }
        }
        let base = BaseDirs::new().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self {
            root: base.home_dir().join(".superposition"),
        })
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Bare clones of tracked repositories.
    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    /// Active checkouts, one directory per session id.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn shepherd_socket(&self) -> PathBuf {
        self.root.join("shepherd.sock")
    }

    pub fn shepherd_pid(&self) -> PathBuf {
        self.root.join("shepherd.pid")
    }

    pub fn gateway_tls_dir(&self) -> PathBuf {
        self.root.join("gateway-tls")
    }

    pub fn gateway_tls_cert(&self) -> PathBuf {
        self.gateway_tls_dir().join("cert.pem")
    }

    pub fn gateway_tls_key(&self) -> PathBuf {
        self.gateway_tls_dir().join("key.pem")
    }
}
