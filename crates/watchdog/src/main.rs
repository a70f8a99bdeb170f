//! Watchdog CLI - alerts on errors from supervised processes.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use notify::Notifier;
use watchdog::config::{
    BufferConfig, DedupConfig, DirectoryConfig, RateLimitConfig, RetryConfig, ServerConfig,
};
use watchdog::{Pm2Supervisor, Supervisor, WatchdogConfig, WatchdogService};

/// Watchdog - turn process supervisor errors into Slack/Discord alerts.
#[derive(Parser)]
#[command(name = "watchdog")]
#[command(about = "Error alerting for supervised processes")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "WATCHDOG_LOG_FORMAT")]
    log_format: LogFormat,

    /// PM2 executable
    #[arg(long, global = true, default_value = "pm2", env = "WATCHDOG_PM2_BIN")]
    pm2_bin: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the supervisor and deliver alerts until interrupted
    Run(RunArgs),

    /// Print the current process listing as JSON and exit
    Processes,
}

#[derive(Args)]
struct RunArgs {
    /// Address of the status server
    #[arg(long, default_value = "127.0.0.1:9615", env = "WATCHDOG_BIND")]
    bind: SocketAddr,

    /// Log lines kept per process
    #[arg(long, default_value = "100", env = "WATCHDOG_BUFFER_CAPACITY")]
    buffer_capacity: usize,

    /// Log lines attached to each alert
    #[arg(long, default_value = "30", env = "WATCHDOG_CONTEXT_LINES")]
    context_lines: usize,

    /// Milliseconds to wait for trailing stack frames before an alert is built
    #[arg(long, default_value = "250", env = "WATCHDOG_CONTEXT_DELAY_MS")]
    context_delay_ms: u64,

    /// Seconds an identical error stays suppressed
    #[arg(long, default_value = "300", env = "WATCHDOG_DEBOUNCE_SECS")]
    debounce_secs: u64,

    /// Seconds a process listing is cached
    #[arg(long, default_value = "5", env = "WATCHDOG_DIRECTORY_TTL_SECS")]
    directory_ttl_secs: u64,

    /// First retry delay in milliseconds
    #[arg(long, default_value = "1000", env = "WATCHDOG_RETRY_INITIAL_MS")]
    retry_initial_ms: u64,

    /// Longest retry delay in milliseconds
    #[arg(long, default_value = "32000", env = "WATCHDOG_RETRY_MAX_MS")]
    retry_max_ms: u64,

    /// Failed retries before an alert is dead-lettered
    #[arg(long, default_value = "5", env = "WATCHDOG_MAX_RETRIES")]
    max_retries: u32,

    /// Dead-letter entries kept
    #[arg(long, default_value = "100", env = "WATCHDOG_DEAD_LETTER_CAPACITY")]
    dead_letter_capacity: usize,

    /// Requests per minute per client on /status
    #[arg(long, default_value = "30", env = "WATCHDOG_STATUS_RATE_LIMIT")]
    status_rate_limit: u32,

    /// Requests per minute per client on /health
    #[arg(long, default_value = "60", env = "WATCHDOG_HEALTH_RATE_LIMIT")]
    health_rate_limit: u32,
}

impl RunArgs {
    fn into_config(self) -> WatchdogConfig {
        WatchdogConfig {
            buffer: BufferConfig {
                capacity: self.buffer_capacity,
                context_lines: self.context_lines,
                context_delay: Duration::from_millis(self.context_delay_ms),
            },
            dedup: DedupConfig {
                debounce_window: Duration::from_secs(self.debounce_secs),
                ..DedupConfig::default()
            },
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(self.retry_initial_ms),
                max_backoff: Duration::from_millis(self.retry_max_ms),
                max_retries: self.max_retries,
                dead_letter_capacity: self.dead_letter_capacity,
                ..RetryConfig::default()
            },
            directory: DirectoryConfig {
                ttl: Duration::from_secs(self.directory_ttl_secs),
            },
            rate_limit: RateLimitConfig {
                status_max_requests: self.status_rate_limit,
                health_max_requests: self.health_rate_limit,
                ..RateLimitConfig::default()
            },
            server: ServerConfig { bind: self.bind },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let supervisor: Arc<dyn Supervisor> = Arc::new(Pm2Supervisor::new(cli.pm2_bin));

    match cli.command {
        Commands::Run(args) => run(args.into_config(), supervisor).await,
        Commands::Processes => {
            let processes = supervisor
                .list_processes()
                .await
                .context("Failed to list supervised processes")?;
            println!("{}", serde_json::to_string_pretty(&processes)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "watchdog=debug,notify=debug,info"
    } else {
        "watchdog=info,notify=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run(config: WatchdogConfig, supervisor: Arc<dyn Supervisor>) -> Result<()> {
    config.validate()?;

    let notifier = Arc::new(Notifier::from_env());
    let mut service = WatchdogService::new(config, supervisor, notifier);
    service.start().await?;
    service.serve_http();

    let result = tokio::select! {
        () = async { tokio::signal::ctrl_c().await.ok(); } => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
        result = service.closed() => result,
    };

    service.stop().await;
    result
}
