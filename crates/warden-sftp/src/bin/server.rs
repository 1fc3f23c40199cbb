//! SFTP Server Binary
//!
//! NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation)
//! Implementation: Loads configuration, sets up logging and runs the server.
//! Any startup problem exits with status 1 before the socket is served.
//!
//! Run with: cargo run --bin warden-sftp-server -- --config /etc/warden/sftp.toml

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use warden_sftp::{Config, LogFormat, LoggingConfig, MutationPolicy, Server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host key path
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// What mutating requests do
    #[arg(long, value_enum)]
    mutations: Option<MutationPolicy>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

impl Args {
    fn apply(self, mut config: Config) -> Config {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host_key) = self.host_key {
            config.host_key_path = host_key;
        }
        if let Some(mutations) = self.mutations {
            config.mutations = mutations;
        }
        if let Some(log_format) = self.log_format {
            config.logging.format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.logging.file = Some(log_file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        config
    }
}

/// Initialize tracing; the returned guard must live as long as the process
/// when logging to a file.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || EnvFilter::new(logging.level.clone());

    let file_writer = logging.file.as_ref().and_then(|log_file| {
        let dir = log_file.parent()?;
        let name = log_file.file_name()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Failed to create log directory {}: {e}", dir.display());
            eprintln!("Falling back to stderr logging");
            return None;
        }
        Some(tracing_appender::non_blocking(
            tracing_appender::rolling::daily(dir, name),
        ))
    });

    match (file_writer, logging.format) {
        (Some((writer, guard)), LogFormat::Json) => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_current_span(true)
                .init();
            Some(guard)
        }
        (Some((writer, guard)), LogFormat::Text) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        (None, LogFormat::Json) => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_current_span(true)
                .init();
            None
        }
        (None, LogFormat::Text) => {
            tracing_subscriber::fmt().with_env_filter(filter()).init();
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let mut args = Args::parse();
    let check_only = args.check_config;

    let config = match args.config.take() {
        Some(path) => match Config::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    let config = args.apply(config);

    let _log_guard = init_logging(&config.logging);

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Warden SFTP Server"
    );

    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        host_key = ?config.host_key_path,
        customers = config.customers.len(),
        mutations = ?config.mutations,
        timeout_secs = config.timeout_secs,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "SFTP Server Configuration"
    );

    if let Err(e) = config.validate() {
        error!(
            event = "configuration_validation_failed",
            error = %e,
            "Configuration validation failed"
        );
        std::process::exit(1);
    }

    if check_only {
        info!(event = "configuration_valid", "Configuration is valid");
        return;
    }

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!(
                event = "server_creation_failed",
                error = %e,
                "Failed to create server"
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(
            event = "server_error",
            error = %e,
            "Server encountered an error"
        );
        std::process::exit(1);
    }
}
