//! mailmirror - keep a local SQLite mirror of a Gmail mailbox
//!
//! The first Ctrl+C lets in-flight messages finish and reports a partial
//! summary; a second one abandons them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use mail::{
    GmailAuth, GmailClient, GmailCredentials, MessageId, ShutdownCoordinator, SqliteMailStore,
    SyncEngine, SyncError, SyncMode, SyncSettings, SyncSummary,
};

#[derive(Parser)]
#[command(name = "mailmirror")]
#[command(version)]
#[command(about = "Mirror a Gmail mailbox into a local SQLite database")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the message database (overrides settings.json)
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new messages (everything newer than the last sync)
    Sync {
        /// List the whole mailbox and reconcile deletions before fetching
        #[arg(long)]
        full_sync: bool,

        /// Number of concurrent fetch workers
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
        workers: Option<u16>,
    },

    /// Re-fetch a single message even if it is already stored
    SyncMessage {
        #[arg(long, value_name = "ID")]
        message_id: String,
    },

    /// Mark locally stored messages that no longer exist remotely as deleted
    SyncDeletedMessages,

    /// Run the OAuth flow and store a token
    Auth,

    /// Remove the stored OAuth token
    Logout,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    config::init().context("Failed to initialize config directory")?;

    let mut settings = SyncSettings::load()?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = Some(dir);
    }

    let creds = GmailCredentials::load()?;
    let auth = GmailAuth::new(creds.client_id, creds.client_secret)?;

    let (full_sync, workers) = match &cli.command {
        Command::Logout => {
            auth.logout()?;
            info!("Stored Gmail token removed");
            return Ok(());
        }
        Command::Sync { full_sync, workers } => (*full_sync, workers.map(usize::from)),
        _ => (false, None),
    };

    let client = GmailClient::with_timeout(auth, settings.request_timeout());
    // Complete any interactive login before workers start
    client.authenticate()?;
    if matches!(cli.command, Command::Auth) {
        info!("Gmail authentication complete");
        return Ok(());
    }

    config::ensure_dir(&settings.data_dir()?)?;
    let db_path = settings.database_path()?;
    let store = SqliteMailStore::new(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    info!("Using database {}", db_path.display());

    let engine = SyncEngine::new(Arc::new(client), Arc::new(store))
        .with_workers(workers.unwrap_or_else(|| settings.workers()))
        .with_retry_policy(settings.retry_policy());

    let shutdown = Arc::new(ShutdownCoordinator::new());
    watch_interrupts(Arc::clone(&shutdown));

    let result = match cli.command {
        Command::Sync { .. } => {
            let mode = if full_sync {
                SyncMode::Full
            } else {
                SyncMode::Incremental
            };
            engine.sync(mode, &shutdown)
        }
        Command::SyncMessage { message_id } => {
            engine.sync_message(&MessageId::new(message_id), &shutdown)
        }
        Command::SyncDeletedMessages => engine.sync_deleted_messages(&shutdown),
        Command::Auth | Command::Logout => return Ok(()),
    };

    report(result)
}

fn report(result: Result<SyncSummary, SyncError>) -> Result<()> {
    let summary = result?;
    if summary.failed > 0 {
        warn!(
            "{} messages failed and will be retried on the next sync",
            summary.failed
        );
        for failure in summary.failures.iter().take(10) {
            warn!("  {}: {}", failure.id, failure.reason);
        }
    }
    println!(
        "fetched={} skipped={} failed={} deleted={} restored={} not_started={} abandoned={} interrupted={}",
        summary.fetched,
        summary.skipped,
        summary.failed,
        summary.deleted,
        summary.restored,
        summary.not_started,
        summary.abandoned,
        summary.interrupted
    );
    Ok(())
}

/// Forward Ctrl+C to the coordinator for the lifetime of the process
///
/// The OS handler is installed before this returns; only the wait runs on
/// the signal thread.
fn watch_interrupts(shutdown: Arc<ShutdownCoordinator>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Interrupt handling unavailable: {}", e);
            return;
        }
    };
    let listener = {
        let _guard = runtime.enter();
        interrupt_listener()
    };
    let mut listener = match listener {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
    };

    let spawned = std::thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            runtime.block_on(async {
                while listener.recv().await.is_some() {
                    shutdown.request_shutdown();
                }
            });
        });
    if let Err(e) = spawned {
        warn!("Failed to start signal thread: {}", e);
    }
}

#[cfg(unix)]
fn interrupt_listener() -> std::io::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
}

#[cfg(windows)]
fn interrupt_listener() -> std::io::Result<tokio::signal::windows::CtrlC> {
    tokio::signal::windows::ctrl_c()
}
