use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use superposition::config::DataPaths;
use superposition::gateway::{self, GatewayConfig};
use superposition::preflight;
use superposition::server::{self, AppState, SessionRecord, SessionRegistry, SessionStatus};
use superposition::session::local::LocalManager;
use superposition::session::SessionManager;
use superposition::shepherd::{self, daemon, ShepherdClient};
use superposition::tunnel::TunnelClient;

#[derive(Parser)]
#[command(name = "superposition", about = "AI coding sessions, multiplexed to the browser")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Server port.
    #[arg(long, default_value_t = 8800)]
    port: u16,

    /// Gateway tunnel endpoint, e.g. wss://gateway.example.com/tunnel.
    #[arg(long)]
    gateway: Option<String>,

    /// Pre-shared tunnel secret issued by the gateway.
    #[arg(long)]
    gateway_secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the PTY supervisor process.
    Shepherd,
    /// Run the public HTTPS gateway.
    Gateway {
        #[arg(long, default_value_t = 443)]
        port: u16,
        #[arg(long)]
        tls_cert: Option<PathBuf>,
        #[arg(long)]
        tls_key: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let paths = match DataPaths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("failed to resolve data directory: {err:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Commands::Shepherd) => run_shepherd(&paths).await,
        Some(Commands::Gateway {
            port,
            tls_cert,
            tls_key,
        }) => gateway::run(GatewayConfig::from_env(port, tls_cert, tls_key), &paths).await,
        None => serve(cli.port, cli.gateway, cli.gateway_secret, &paths).await,
    };

    if let Err(err) = result {
        error!(error = %err, "fatal");
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("superposition=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_shepherd(paths: &DataPaths) -> Result<()> {
    match daemon::run(paths).await {
        Ok(()) => Ok(()),
        Err(daemon::ShepherdError::AlreadyRunning) => {
            eprintln!("shepherd already running");
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

async fn serve(
    port: u16,
    gateway_url: Option<String>,
    gateway_secret: Option<String>,
    paths: &DataPaths,
) -> Result<()> {
    println!("Superposition - AI Coding Sessions");
    println!("===================================");
    println!();

    println!("Running preflight checks...");
    let (clis, git_ok) = preflight::check_all();
    if !git_ok {
        println!();
        println!("git is required. Please install git and try again.");
        std::process::exit(1);
    }
    println!();

    // Prefer the shepherd so sessions survive server restarts; fall back to
    // owning PTYs in-process when it never answers.
    let shepherd_client: Option<Arc<ShepherdClient>> = match shepherd::connect_or_spawn(paths).await
    {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            warn!(error = %err, "shepherd unavailable, falling back to in-process PTY manager");
            None
        }
    };

    let manager: Arc<dyn SessionManager> = match &shepherd_client {
        Some(client) => Arc::clone(client) as Arc<dyn SessionManager>,
        None => Arc::new(LocalManager::new()),
    };

    let registry = Arc::new(SessionRegistry::new());
    if let Some(client) = &shepherd_client {
        reconcile_sessions(Arc::clone(&registry), Arc::clone(client)).await;
    }

    let state = AppState::new(manager, registry, clis, git_ok);
    let app = server::router(state);

    match (gateway_url, gateway_secret) {
        (Some(url), Some(secret)) => {
            let tunnel = TunnelClient::new(url, secret, format!("127.0.0.1:{port}"));
            tokio::spawn(tunnel.run());
        }
        (Some(_), None) | (None, Some(_)) => {
            warn!("both --gateway and --gateway-secret are required; tunnel disabled");
        }
        (None, None) => {}
    }

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("Server running at http://{addr}");
    info!(%addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shepherd_client))
        .await?;
    println!("Server stopped.");
    Ok(())
}

/// Resolves on SIGINT/SIGTERM. Sessions stay alive in the shepherd; only the
/// client connection closes. A grace period bounds connection draining.
async fn shutdown_signal(shepherd_client: Option<Arc<ShepherdClient>>) {
    let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
    match sigterm {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    println!("\nShutting down...");
    if let Some(client) = shepherd_client {
        client.close().await;
    }

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        info!("shutdown grace period elapsed");
        std::process::exit(0);
    });
}

/// Bring the in-memory registry in line with the shepherd: live sessions are
/// adopted as running records and watched for exit. Records for sessions the
/// shepherd no longer knows simply never appear; durable stores reconcile the
/// other direction externally.
async fn reconcile_sessions(registry: Arc<SessionRegistry>, client: Arc<ShepherdClient>) {
    let ids = match client.list_sessions().await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(error = %err, "failed to list shepherd sessions");
            return;
        }
    };

    let count = ids.len();
    for id in ids {
        let mut done_rx = client.adopt(&id);
        registry.insert(SessionRecord {
            id: id.clone(),
            cli_type: String::new(),
            work_dir: String::new(),
            status: SessionStatus::Running,
            pid: None,
            created_at: Utc::now(),
        });

        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let _ = done_rx.wait_for(|done| *done).await;
            registry.mark_stopped(&id);
            info!(session_id = %id, "session stopped (detected via shepherd)");
        });
    }

    if count > 0 {
        info!(count, "re-adopted sessions from shepherd");
    }
}
