//! nodegate: admission server binary.
//!
//! Loads the TOML config, starts one listener per enabled protocol, and
//! prints server events until interrupted.

use clap::{Parser, ValueEnum};
use nodegate_core::ServerEvent;
use nodegate_server::config::{ConfigOverrides, ServerConfig};
use nodegate_server::Server;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// How events are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventFormat {
    /// Events are only logged.
    Text,
    /// One JSON object per event on stdout.
    Json,
}

/// nodegate: BBS connection admission server
#[derive(Parser, Debug)]
#[command(name = "nodegate", version, about = "BBS connection admission server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.nodegate/config.toml")]
    config: String,

    /// Working directory for workers; list files resolve against it
    #[arg(long)]
    home: Option<String>,

    /// Worker executable for telnet and SSH sessions
    #[arg(long)]
    executable: Option<String>,

    /// Telnet listen port
    #[arg(long)]
    telnet_port: Option<u16>,

    /// SSH listen port
    #[arg(long)]
    ssh_port: Option<u16>,

    /// BinkP listen port
    #[arg(long)]
    binkp_port: Option<u16>,

    /// Accept SSH connections
    #[arg(long)]
    enable_ssh: bool,

    /// Accept BinkP connections
    #[arg(long)]
    enable_binkp: bool,

    /// Start the local console node on startup
    #[arg(long)]
    launch_local: bool,

    /// Event output format
    #[arg(long, value_enum, default_value_t = EventFormat::Text)]
    events: EventFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    // Logs go to stderr so JSON events own stdout.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting nodegate");

    let overrides = ConfigOverrides {
        home: cli.home,
        executable: cli.executable,
        telnet_port: cli.telnet_port,
        ssh_port: cli.ssh_port,
        binkp_port: cli.binkp_port,
        enable_ssh: cli.enable_ssh,
        enable_binkp: cli.enable_binkp,
        launch_local_node: cli.launch_local,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = Server::new(config);
    let printer = (cli.events == EventFormat::Json)
        .then(|| tokio::spawn(print_events(server.subscribe())));

    if let Err(e) = server.start().await {
        error!(error = %e, "failed to start");
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");
    server.stop().await;

    if let Some(printer) = printer {
        printer.abort();
    }
    info!("nodegate stopped");
}

/// Write each event as a JSON line on stdout.
async fn print_events(mut rx: broadcast::Receiver<ServerEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "event not serializable"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
