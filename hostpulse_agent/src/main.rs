//! Entry point for hostpulse_agent. Parses args, opens the store and serves.

use std::net::SocketAddr;
use std::time::Duration;

use hostpulse_agent::config::{parse_args, Config, ParsedArgs, USAGE};
use hostpulse_agent::metrics::SysinfoSource;
use hostpulse_agent::retention::spawn_retention;
use hostpulse_agent::sampler::Sampler;
use hostpulse_agent::session::SessionManager;
use hostpulse_agent::store::Store;
use hostpulse_agent::{serve, AppState};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RETENTION_PERIOD: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let parsed = match parse_args(std::env::args()) {
        Ok(ParsedArgs::Help) => {
            println!("{USAGE}");
            return Ok(());
        }
        Ok(p) => p,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    let config = Config::from_env(parsed);

    // no durable storage, no service
    let store = match Store::open(&config.db_path).await {
        Ok(s) => s,
        Err(e) => {
            error!("Fatal init error: {e}");
            std::process::exit(1);
        }
    };

    let sampler = Sampler::new(SysinfoSource::new(config.gpu_enabled, config.temp_enabled));
    let sessions = SessionManager::new(sampler, store.clone(), config.intervals);
    let state = AppState::new(sessions.clone(), store.clone());

    let retention = config
        .retention
        .map(|max_age| spawn_retention(store.clone(), RETENTION_PERIOD, max_age));

    let listener = TcpListener::bind(SocketAddr::new(config.bind, config.port)).await?;
    info!("Agent running at http://{}", listener.local_addr()?);

    let ceiling = config.shutdown_timeout;
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutting down...");
        // force exit if something hangs
        tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            warn!("Shutdown exceeded {:?}, forcing exit", ceiling);
            std::process::exit(1);
        });
        sessions.shutdown(ceiling / 2).await;
    };

    serve(listener, state, shutdown).await?;

    if let Some(h) = retention {
        h.abort();
    }
    store.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
