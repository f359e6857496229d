/// Relay Orchestrator Daemon - Main entry point
/// Runs the coordination runtime against a watched directory of agent memory logs
use clap::Parser;
use relay_core::config::ConfigLoader;
use relay_core::Runtime;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "relay-daemon",
    about = "Coordination runtime for a fleet of externally spawned agents",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// Directory to watch for agent memory logs
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Root directory to watch (overrides config)"
    )]
    watch: Option<PathBuf>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        default_value = "info",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.parse()?))
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();

    info!("Starting relay orchestrator daemon v{}", env!("CARGO_PKG_VERSION"));

    let loader = ConfigLoader::discover(args.config.as_deref());
    let mut config = loader.load()?;
    info!(strategy = ?loader.strategy(), "configuration loaded");

    if let Some(watch) = args.watch {
        config.watcher.watch_paths = vec![watch.to_str().unwrap_or(".").to_string()];
    }

    info!(
        database = %config.store.database_path,
        watch_paths = ?config.watcher.watch_paths,
        "runtime configuration",
    );

    let runtime = Runtime::new(config).await?;

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let signal_handler = tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C signal handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("received CTRL+C signal"),
            () = terminate => info!("received SIGTERM signal"),
        }

        let _ = tx.send(()).await;
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let runtime_handle = tokio::spawn(async move {
        if let Err(e) = runtime.run(shutdown_rx).await {
            tracing::error!(error = %e, "runtime exited with an error");
        }
    });

    tokio::select! {
        _ = signal_handler => {
            info!("shutting down daemon...");
        }
        _ = rx.recv() => {
            info!("shutting down daemon...");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = runtime_handle.await;

    info!("relay orchestrator daemon stopped");
    Ok(())
}
