use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sandboxd_server::AppState;
use sandboxd_shared::shell_session::SessionRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod config;
mod logging;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(about = "Persistent shell sessions with streamed command logs", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the config file (defaults to ~/.sandboxd/config.toml when present)
    #[arg(long, global = true, env = "SANDBOXD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Serve(Overrides),

    /// Print the effective configuration as TOML and exit
    Config(Overrides),
}

/// Flags that take precedence over the config file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Address to listen on, e.g. 127.0.0.1:4096
    #[arg(long, env = "SANDBOXD_BIND")]
    bind: Option<String>,

    /// State directory; sessions are kept under <config-dir>/sessions
    #[arg(long, env = "SANDBOXD_CONFIG_DIR")]
    config_dir: Option<String>,

    /// Working directory for every new shell
    #[arg(long, env = "SANDBOXD_WORK_DIR")]
    work_dir: Option<String>,

    /// Shell binary used for sessions
    #[arg(long, env = "SANDBOXD_SHELL")]
    shell: Option<String>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long, env = "SANDBOXD_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// How often logs and exit codes are polled, e.g. 50ms
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// How long a deleted session's processes get after SIGTERM, e.g. 5s
    #[arg(long, value_parser = humantime::parse_duration)]
    terminate_grace_period: Option<Duration>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "SANDBOXD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Also write daily-rotated log files into this directory
    #[arg(long, env = "SANDBOXD_LOG_DIR")]
    log_dir: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(config_dir) = self.config_dir {
            config.config_dir = config_dir;
        }
        if let Some(work_dir) = self.work_dir {
            config.work_dir = Some(work_dir);
        }
        if let Some(shell) = self.shell {
            config.shell = shell;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(poll_interval) = self.poll_interval {
            config.poll_interval = poll_interval;
        }
        if let Some(grace) = self.terminate_grace_period {
            config.terminate_grace_period = grace;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        if let Some(log_dir) = self.log_dir {
            config.log_dir = Some(log_dir);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DaemonConfig::load_default().context("Failed to load default config")?,
    };

    match cli
        .command
        .unwrap_or_else(|| Commands::Serve(Overrides::default()))
    {
        Commands::Serve(overrides) => {
            overrides.apply(&mut config);
            config.validate()?;
            let _log_guard = logging::init(&config.log_level, config.log_dir().as_deref())
                .context("Failed to initialize logging")?;
            serve(config).await
        }
        Commands::Config(overrides) => {
            overrides.apply(&mut config);
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    let session_config = config.session_config();
    tokio::fs::create_dir_all(&session_config.sessions_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create sessions directory {}",
                session_config.sessions_dir.display()
            )
        })?;

    info!(
        sessions_dir = %session_config.sessions_dir.display(),
        shell = %session_config.shell,
        max_sessions = session_config.max_sessions,
        poll_interval = %humantime::format_duration(session_config.poll_interval),
        "Session registry ready"
    );

    let registry = Arc::new(SessionRegistry::new(session_config));
    let app = sandboxd_server::router(AppState::new(registry.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(address = %listener.local_addr()?, "sandboxd listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!(sessions = registry.session_count().await, "Shutting down, deleting sessions");
    registry.shutdown().await;

    serve_result.context("Server error")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
