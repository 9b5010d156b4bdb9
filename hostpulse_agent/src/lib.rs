//! hostpulse agent: samples host telemetry, streams it to WebSocket subscribers,
//! records every sample in SQLite and serves range queries over that history.

pub mod config;
pub mod error;
pub mod gpu;
pub mod history;
pub mod metrics;
pub mod retention;
pub mod routes;
pub mod sampler;
pub mod session;
pub mod state;
pub mod store;
pub mod types;
pub mod ws;

use std::future::Future;

use tokio::net::TcpListener;

pub use state::AppState;

/// Serve the agent's routes on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
