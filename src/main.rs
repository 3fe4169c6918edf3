//! cmux-hostshell binary entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use cmux_hostshell::pty::EnvironmentResolver;
use cmux_hostshell::{build_router, AppState, ProtocolHandler, SessionRegistry, TerminalConfig};

/// WebSocket terminal bridge to the local or host shell.
#[derive(Parser, Debug)]
#[command(name = "cmux-hostshell")]
#[command(about = "WebSocket terminal bridge to the local or host shell")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "BIND", default_value = "127.0.0.1:39385")]
    bind: SocketAddr,

    /// Directory with a web client to serve at `/`
    #[arg(long, env = "STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    terminal: TerminalConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = Arc::new(args.terminal.normalized());
    info!(
        bind = %args.bind,
        buffer_size = config.buffer_size,
        flush_interval_ms = config.flush_interval_ms,
        init_timeout_ms = config.init_timeout_ms,
        simple_mode = config.force_simple_mode,
        nsenter = %config.nsenter_path,
        "Starting cmux-hostshell"
    );

    let resolver = Arc::new(EnvironmentResolver::new(&config));
    let registry = Arc::new(SessionRegistry::new(config, resolver));
    let handler = Arc::new(ProtocolHandler::new(registry));
    let app = build_router(
        AppState {
            handler: handler.clone(),
        },
        args.static_dir,
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .tcp_nodelay(true)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, closing terminal sessions");
    handler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
