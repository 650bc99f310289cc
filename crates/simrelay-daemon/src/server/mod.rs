//! HTTP surface: SSE event stream plus start/stop commands.

mod error;
pub mod routes;

use std::future::IntoFuture;
use std::net::SocketAddr;

use tracing::{info, warn};

pub use error::ApiError;
pub use routes::{AppState, build_router};

/// Serve the API on `addr` until ctrl-c, then shut down any running
/// session before returning.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let supervisor = std::sync::Arc::clone(&state.supervisor);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    // SSE connections never finish on their own, so shutdown does not wait
    // for in-flight requests.
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            if supervisor.shutdown().await {
                info!("Supervisor idle");
            } else {
                warn!("Simulation did not exit before shutdown");
            }
        }
    }
    Ok(())
}
