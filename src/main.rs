//! shellguard - guarded terminal sessions
//!
//! ## Modes
//!
//! **run**: Starts a managed session with the current terminal as its
//! primary channel. Output is scanned; dangerous output suspends input until
//! the unlock gesture is pressed twice.
//!
//! **watch**: Monitors a log stream (file, command or stdin) with the same
//! scanner, holding output back while blocked.
//!
//! **scan**: Classifies text once and prints the verdict as JSON.
//!
//! **config**: Prints the effective configuration.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shellguard::{
    client,
    config::{ConfigError, EngineConfig},
    pty::BackendKind,
    scanner::ThreatScanner,
    session::{CreateRequest, OwnerInfo, SessionFactory},
    terminal,
    watch::{self, WatchExit, WatchOptions, WatchSource},
};

/// shellguard - guarded terminal sessions
#[derive(ClapParser, Debug)]
#[command(name = "shellguard", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the config file (default: ~/.config/shellguard/config.toml)
    #[arg(long, global = true, env = "SHELLGUARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a guarded session in this terminal (the default)
    Run {
        /// What to run in the session
        #[arg(long, value_enum, default_value_t = BackendKind::Shell)]
        backend: BackendKind,

        /// Session id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Working directory for the child
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Watch a log stream and block on dangerous output
    Watch {
        /// Follow this file
        #[arg(long, conflicts_with = "command")]
        file: Option<PathBuf>,

        /// Run this command (via sh -c) and watch its stdout
        #[arg(long)]
        command: Option<String>,

        /// Read the stream from stdin (also the default)
        #[arg(value_name = "-")]
        stdin: Option<String>,
    },

    /// Classify text from a file or stdin and print the verdict
    Scan {
        /// File to scan; stdin when omitted or "-"
        file: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Error, Debug)]
pub enum ShellguardError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] client::ClientError),

    #[error(transparent)]
    Watch(#[from] watch::WatchError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid arguments: {0}")]
    Usage(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("shellguard: {err}");
            1
        }
    };
    // Blocking stdin readers may still be parked in read(); do not wait for them.
    std::process::exit(code);
}

/// Tracing goes to stderr: stdout carries the session's terminal output.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shellguard=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<i32, ShellguardError> {
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run {
        backend: BackendKind::Shell,
        id: None,
        cwd: None,
    }) {
        Commands::Run { backend, id, cwd } => run_session(config, backend, id, cwd).await,
        Commands::Watch { file, command, stdin } => run_watch(config, file, command, stdin).await,
        Commands::Scan { file } => run_scan(&config, file),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(0)
        }
    }
}

// ── Local session ──────────────────────────────────────────────────

async fn run_session(
    config: EngineConfig,
    backend: BackendKind,
    id: Option<String>,
    cwd: Option<PathBuf>,
) -> Result<i32, ShellguardError> {
    let factory = SessionFactory::new(config)?;
    tracing::info!(%backend, gesture = %factory.gesture().label(), "starting guarded session");

    let request = CreateRequest {
        id,
        backend,
        cwd,
        owner: OwnerInfo {
            remote_addr: None,
            label: std::env::var("USER").ok(),
        },
        ..CreateRequest::default()
    };
    let result = client::run_local(&factory, request).await;
    factory.shutdown_all().await;

    let reason = result?;
    terminal::write_stdout(format!("\r\n[session ended: {reason}]\r\n").as_bytes())?;
    Ok(0)
}

// ── Watch mode ─────────────────────────────────────────────────────

async fn run_watch(
    config: EngineConfig,
    file: Option<PathBuf>,
    command: Option<String>,
    stdin: Option<String>,
) -> Result<i32, ShellguardError> {
    let source = match (file, command, stdin.as_deref()) {
        (Some(path), None, None) => WatchSource::File(path),
        (None, Some(cmd), None) => WatchSource::Command(cmd),
        (None, None, None) | (None, None, Some("-")) => WatchSource::Stdin,
        (None, None, Some(other)) => {
            return Err(ShellguardError::Usage(format!(
                "unexpected argument {other:?}; use --file PATH to follow a file"
            )))
        }
        _ => return Err(ShellguardError::Usage("choose one of --file, --command or -".into())),
    };

    let scanner = Arc::new(ThreatScanner::from_config(&config.scanner).map_err(ConfigError::from)?);
    let options = WatchOptions {
        source,
        gesture: config.gesture()?,
        carry_limit: config.scanner.carry_limit,
        hold_limit: config.history_limit,
        poll_interval: config.poll_interval(),
    };

    let summary = watch::run_watch(options, scanner).await?;
    eprintln!(
        "\r\nshellguard: watched {} bytes, {} block(s)",
        summary.bytes, summary.blocks
    );
    Ok(match summary.exit {
        WatchExit::SourceEnded => 0,
        WatchExit::Interrupted => 130,
    })
}

// ── One-shot scan ──────────────────────────────────────────────────

fn run_scan(config: &EngineConfig, file: Option<PathBuf>) -> Result<i32, ShellguardError> {
    let text = match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(&path)?,
        _ => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    let scanner = ThreatScanner::from_config(&config.scanner).map_err(ConfigError::from)?;
    let verdict = scanner.scan(&text);
    println!("{}", serde_json::to_string_pretty(&verdict)?);

    // Non-zero when the text would have blocked input.
    Ok(if verdict.should_block { 2 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_watch_file() {
        let cli = Cli::try_parse_from(["shellguard", "watch", "--file", "/var/log/syslog"]).unwrap();
        match cli.command {
            Some(Commands::Watch { file, command, stdin }) => {
                assert_eq!(file, Some(PathBuf::from("/var/log/syslog")));
                assert!(command.is_none());
                assert!(stdin.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_run_with_backend() {
        let cli = Cli::try_parse_from(["shellguard", "run", "--backend", "agent", "--id", "a1"]).unwrap();
        match cli.command {
            Some(Commands::Run { backend, id, .. }) => {
                assert_eq!(backend, BackendKind::Agent);
                assert_eq!(id.as_deref(), Some("a1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_config_flag() {
        let cli = Cli::try_parse_from(["shellguard", "config", "--config", "/tmp/x.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
    }
}
