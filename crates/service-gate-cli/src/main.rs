// crates/service-gate-cli/src/main.rs
// ============================================================================
// Module: Service Gate CLI Entry Point
// Description: Command dispatcher for the service gate binary.
// Purpose: Load configuration, install logging, and run the listeners.
// Dependencies: clap, service-gate-config, service-gate-server, tokio, tracing.
// ============================================================================

//! ## Overview
//! `service-gate serve` loads the TOML configuration, installs the tracing
//! subscriber, and runs the API and gateway listeners until Ctrl-C.
//! `service-gate config check` validates a configuration file and exits.
//!
//! Security posture: configuration is untrusted input and is validated before
//! any listener binds.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use service_gate_config::ServiceGateConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable holding the log filter.
const LOG_ENV: &str = "RUST_LOG";
/// Filter used when neither the environment nor config sets one.
const DEFAULT_LOG_FILTER: &str = "info";

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level command line.
#[derive(Parser, Debug)]
#[command(name = "service-gate", version, disable_help_subcommand = true)]
struct Cli {
    /// Command to run.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the API and gateway listeners.
    Serve(ServeCommand),
    /// Configuration utilities.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Arguments of `serve`.
#[derive(Args, Debug)]
struct ServeCommand {
    /// Config file; falls back to `SERVICE_GATE_CONFIG`, then `service-gate.toml`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Loads and validates a config file.
    Check(ConfigCheckCommand),
}

/// Arguments of `config check`.
#[derive(Args, Debug)]
struct ConfigCheckCommand {
    /// Config file; falls back to `SERVICE_GATE_CONFIG`, then `service-gate.toml`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI failure carrying the message shown to the operator.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// Result alias for CLI operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Dispatches the parsed command.
async fn run(cli: Cli) -> CliResult<ExitCode> {
    match cli.command {
        Commands::Serve(command) => command_serve(command).await,
        Commands::Config {
            command: ConfigCommand::Check(command),
        } => command_config_check(&command),
    }
}

// ============================================================================
// SECTION: Serve Command
// ============================================================================

/// Executes the `serve` command.
async fn command_serve(command: ServeCommand) -> CliResult<ExitCode> {
    let config = ServiceGateConfig::load(command.config.as_deref())
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    let env_filter = std::env::var(LOG_ENV).ok();
    init_logging(&log_directive(env_filter.as_deref(), config.logging.filter.as_deref()))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => warn!(error = %err, "signal handler failed; shutting down"),
        }
        on_signal.cancel();
    });

    info!(bind = %config.server.bind, owner = %config.identity.owner, "starting service gate");
    service_gate_server::serve(&config, cancel)
        .await
        .map_err(|err| CliError::new(format!("server failed: {err}")))?;
    info!("service gate stopped");
    Ok(ExitCode::SUCCESS)
}

/// Picks the log filter: environment, then config, then [`DEFAULT_LOG_FILTER`].
fn log_directive(env: Option<&str>, config: Option<&str>) -> String {
    [env, config]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|directive| !directive.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

/// Installs the global `fmt` subscriber with `directive`.
fn init_logging(directive: &str) -> CliResult<()> {
    let filter = EnvFilter::try_new(directive)
        .map_err(|err| CliError::new(format!("invalid log filter {directive}: {err}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| CliError::new(format!("failed to install logging: {err}")))
}

// ============================================================================
// SECTION: Config Commands
// ============================================================================

/// Executes `config check`.
fn command_config_check(command: &ConfigCheckCommand) -> CliResult<ExitCode> {
    let config = ServiceGateConfig::load(command.config.as_deref())
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    let summary = format!(
        "config ok: owner={} namespace={} providers={} credentials={} roles={}",
        config.identity.owner,
        config.tenant().namespace,
        config.bootstrap.providers.len(),
        config.bootstrap.credentials.len(),
        config.bootstrap.roles.len(),
    );
    write_stdout_line(&summary)
        .map_err(|err| CliError::new(format!("failed to write stdout: {err}")))?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Output
// ============================================================================

/// Writes a line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Reports `message` on stderr and returns a failing exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
