//! sessionguard - an interactive shell over an authenticated API session.
//!
//! Signs in, keeps the session alive across expired access tokens, and lets
//! you issue authenticated GET requests against the configured API.

mod shell;

use anyhow::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionguard_core::{Config, SessionContext};

use shell::Shell;

/// Log file prefix inside the log directory
const LOG_FILE_PREFIX: &str = "sessionguard.log";

/// Initialize the tracing subscriber for logging.
/// Logs go to a daily rolling file so they never interleave with the prompt.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_dir = config.log_dir().ok()?;
    std::fs::create_dir_all(&log_dir).ok()?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let _log_guard = init_tracing(&config);
    info!(api = %config.api_base_url, "sessionguard starting");

    let session = SessionContext::from_config(&config)?;
    session.initialize().await;

    let mut shell = Shell::new(session, config);

    // A single command runs non-interactively: `sessionguard status`
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        shell.run_command(&args.join(" ")).await?;
        return Ok(());
    }

    let result = shell.run().await;
    if let Err(ref e) = result {
        eprintln!("Error: {}", e);
    }

    info!("sessionguard shutting down");
    result
}
