use clap::{Args, Parser, Subcommand};
use cove::config::CallConfig;
use cove::session::{CallRole, SessionController, SessionError};
use cove::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = if cli.localhost_only {
        CallConfig::localhost(&cli.signaling_server, cli.user)
    } else {
        CallConfig::new(&cli.signaling_server, cli.user)
    }
    .with_ice_servers(cli.ice_servers);

    let role = match cli.command {
        Some(Command::Call) | None => CallRole::Offerer,
        Some(Command::Wait) => CallRole::Answerer,
    };
    info!(
        identity = %config.identity,
        server = %config.signaling_base,
        ?role,
        "starting session"
    );

    let mut controller = SessionController::connect(config).await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    controller.run(role, shutdown_rx).await?;
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "cove",
    about = "Negotiate a two-party media call through a signaling server",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "COVE_SIGNALING_SERVER",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL for the signaling server"
    )]
    signaling_server: String,

    #[arg(
        long,
        global = true,
        env = "COVE_USER",
        help = "Identity announced on the signaling channel (random when omitted)"
    )]
    user: Option<String>,

    #[arg(
        long = "ice-server",
        global = true,
        value_name = "URL",
        help = "ICE server URL (repeatable; defaults to a public STUN server)"
    )]
    ice_servers: Vec<String>,

    #[arg(
        long,
        global = true,
        help = "Skip STUN/TURN; candidates stay on local interfaces"
    )]
    localhost_only: bool,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "COVE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "COVE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a call: publish an offer and wait for the answer.
    Call,
    /// Wait for a call: answer the first offer that arrives.
    Wait,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}
