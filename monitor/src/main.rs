//! obs-monitor command line entry point
//!
//! Connects to OBS over obs-websocket and writes one row of stream health
//! metrics per writer interval until OBS exits or the process is interrupted.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use obs_monitor::{
    config::MonitorConfig,
    error::{MonitorError, Result},
    monitor::{Collaborators, Monitor},
    obs_client::{ConnectOptions, ObsClient},
    pinger::SystemPing,
    system_stats::SysinfoStats,
};

/// OBS stream monitor command line interface
#[derive(Parser)]
#[command(name = "obs-monitor")]
#[command(about = "Monitor OBS stream health: ping latency, output counters and resource usage")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "OBS_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// OBS WebSocket host
    #[arg(long)]
    host: Option<String>,

    /// OBS WebSocket port
    #[arg(long)]
    port: Option<u16>,

    /// OBS WebSocket password (prompted for when not set)
    #[arg(long, env = "OBS_MONITOR_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// CSV file to write metrics to
    #[arg(long, conflicts_with = "no_csv")]
    csv: Option<PathBuf>,

    /// Disable CSV output
    #[arg(long)]
    no_csv: bool,

    /// Metric collection interval in milliseconds
    #[arg(long)]
    metric_interval: Option<u64>,

    /// Writer interval in milliseconds
    #[arg(long)]
    writer_interval: Option<u64>,

    /// Do not print the metrics table
    #[arg(long)]
    no_console: bool,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Monitor until OBS exits or the process is interrupted (default)
    Run,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

impl Cli {
    /// Command line flags take precedence over every other source
    fn apply_overrides(&self, config: &mut MonitorConfig) {
        if let Some(host) = &self.host {
            config.obs.host = host.clone();
        }
        if let Some(port) = self.port {
            config.obs.port = port;
        }
        if let Some(password) = &self.password {
            config.obs.password = Some(password.clone());
        }
        if let Some(csv) = &self.csv {
            config.output.csv_path = Some(csv.clone());
        }
        if self.no_csv {
            config.output.csv_path = None;
        }
        if let Some(interval) = self.metric_interval {
            config.sampling.metric_interval_ms = interval;
        }
        if let Some(interval) = self.writer_interval {
            config.sampling.writer_interval_ms = interval;
        }
        if self.no_console {
            config.output.console = false;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
        if let Some(path) = &self.log_file {
            config.logging.file_path = Some(path.clone());
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configuration comes first: it decides where logs go
    let config = load_configuration(&cli);

    let guard = match initialize_logging(config.as_ref().ok(), &cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            process::exit(1);
        }
    };

    let code = match config {
        Ok(config) => {
            let result = match &cli.command {
                Some(Commands::Config { show }) => handle_config(&config, *show),
                Some(Commands::Run) | None => run_monitor(config).await,
            };
            match result {
                Ok(()) => 0,
                Err(e) => {
                    error!(category = e.category(), "{}", e);
                    e.exit_code()
                }
            }
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            e.exit_code()
        }
    };

    // process::exit skips destructors; the log file is flushed when the guard drops
    drop(guard);
    if code != 0 {
        process::exit(code);
    }
}

/// Initialize logging based on configuration
fn initialize_logging(config: Option<&MonitorConfig>, cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let level_name = config
        .map(|c| c.logging.level.clone())
        .or_else(|| cli.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let log_level = match level_name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let json = config.map(|c| c.logging.json).unwrap_or(cli.json_logs);
    let log_file = config
        .and_then(|c| c.logging.file_path.clone())
        .or_else(|| cli.log_file.clone());

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("obs_monitor={}", log_level).parse()?)
        .add_directive("tokio_tungstenite=warn".parse()?)
        .add_directive("tungstenite=warn".parse()?);

    // The metrics table owns stdout
    let console_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Defaults, file, environment, then flags
fn load_configuration(cli: &Cli) -> Result<MonitorConfig> {
    let path = match &cli.config {
        Some(path) => {
            if !path.exists() {
                return Err(obs_monitor::error::ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            Some(path.clone())
        }
        None => MonitorConfig::default_config_path().ok(),
    };

    let mut config = MonitorConfig::load_with_fallback(path.as_ref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn handle_config(config: &MonitorConfig, show: bool) -> Result<()> {
    if show {
        println!("{}", config.to_toml()?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

async fn run_monitor(mut config: MonitorConfig) -> Result<()> {
    if config.obs.password.is_none() {
        let password = tokio::task::spawn_blocking(|| {
            rpassword::prompt_password("Enter OBS WebSocket password: ")
        })
        .await
        .map_err(|e| MonitorError::Generic(format!("password prompt failed: {e}")))??;
        config.obs.password = Some(password).filter(|p| !p.is_empty());
    }

    let options = ConnectOptions {
        host: config.obs.host.clone(),
        port: config.obs.port,
        password: config.obs.password.clone(),
        request_timeout: config.obs.request_timeout(),
    };
    let client = ObsClient::connect(&options).await?;

    let collaborators = Collaborators {
        control: Arc::new(client),
        probe: Arc::new(SystemPing::new()),
        system: Arc::new(SysinfoStats::new()),
    };
    let mut monitor = Monitor::new(config, collaborators);
    monitor.start().await?;
    info!("Press Ctrl-C to exit");

    tokio::select! {
        signal = wait_for_shutdown() => {
            signal?;
            info!("Received interrupt signal, shutting down");
        }
        _ = monitor.wait() => {}
    }

    monitor.shutdown().await?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
