//! simrelay Daemon
//!
//! Supervises the simulation engine and streams its output to every
//! connected client over Server-Sent Events.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use simrelay_core::config::load_config;
use simrelay_core::tracing_init::{default_filter, init_tracing};
use simrelay_daemon::hub::BroadcastHub;
use simrelay_daemon::server::{self, AppState};
use simrelay_daemon::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "simrelay-daemon")]
#[command(version, about = "simrelay daemon - simulation supervisor and event relay")]
struct Args {
    /// Settings file; replaces the `.simrelay/settings.json` project lookup
    #[arg(long, env = "SIMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Executable used to run the simulation engine
    #[arg(long)]
    program: Option<PathBuf>,

    /// Dataset base path passed to the engine as `--base_path`
    #[arg(long)]
    base_path: Option<String>,

    /// Seconds to wait for graceful shutdown of the engine before SIGKILL (0 waits forever)
    #[arg(long)]
    terminate_timeout: Option<u64>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SIMRELAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = std::env::current_dir().ok();
    let mut config = load_config(project_dir.as_deref(), args.config.as_deref())?;

    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(program) = args.program {
        config.engine.program = program;
    }
    if let Some(base_path) = args.base_path {
        config
            .engine
            .default_parameters
            .insert("base_path".to_string(), base_path);
    }
    if let Some(secs) = args.terminate_timeout {
        config.engine.terminate_timeout_secs = secs;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }

    init_tracing(&default_filter(&config.server.log_level), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.addr,
        program = %config.engine.program.display(),
        targets = config.targets.0.len(),
        "Starting simrelay-daemon"
    );

    let hub = Arc::new(BroadcastHub::new(config.hub.clone()));
    let supervisor = Arc::new(Supervisor::new(
        config.engine.clone(),
        hub.create_event_forwarder(),
    ));

    let state = AppState {
        supervisor,
        hub,
        targets: Arc::new(config.targets.clone()),
    };

    server::serve(config.server.addr, state).await
}
