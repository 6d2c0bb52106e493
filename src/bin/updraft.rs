//! Command-line host for the updater.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use updraft::update::{InstallReport, RelaunchOutcome};
use updraft::{SessionState, UpdateAvailability, UpdateCoordinator, UpdateEvent, UpdaterConfig};

/// Updraft: check for, download and install application updates.
#[derive(Parser)]
#[command(name = "updraft", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Ask the release index whether an update is available.
    Check,

    /// Check, then download the update without installing it.
    Download,

    /// Install the previously downloaded update and relaunch.
    Install,

    /// Check, download and install in one go.
    Update,

    /// Show the session state and any pending download.
    Status,

    /// Discard the pending download.
    Abandon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => UpdaterConfig::from_file(path)?,
        None => {
            let default_path = UpdaterConfig::default_config_path();
            if default_path.exists() {
                UpdaterConfig::from_file(&default_path)?
            } else {
                UpdaterConfig::default()
            }
        }
    };

    let coordinator = UpdateCoordinator::new(config)?;
    let printer = tokio::spawn(print_events(coordinator.subscribe()));

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, cancelling...");
            cancel_clone.cancel();
        }
    });

    let result = match cli.command {
        Command::Check => run_check(&coordinator, &cancel).await.map(|_| ()),
        Command::Download => run_download(&coordinator, &cancel).await,
        Command::Install => run_install(&coordinator, &cancel).await,
        Command::Update => run_update(&coordinator, &cancel).await,
        Command::Status => show_status(&coordinator),
        Command::Abandon => abandon(&coordinator),
    };

    // Closing the channel ends the printer once it has drained.
    drop(coordinator);
    let _ = printer.await;
    result
}

/// Stderr logging plus a daily log file; the guard flushes the file on
/// drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("updraft=info,reqwest=warn,hyper=warn")
    });
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let logs_dir = updraft::app_dirs::logs_dir();
    if std::fs::create_dir_all(&logs_dir).is_err() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&logs_dir, "updraft.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Some(guard)
}

async fn print_events(mut rx: broadcast::Receiver<UpdateEvent>) {
    let mut last_percent = None;
    loop {
        match rx.recv().await {
            Ok(event @ UpdateEvent::Downloading { percent, .. }) => {
                // One line per percent change keeps the terminal readable.
                if percent != last_percent {
                    last_percent = percent;
                    println!("{event}");
                }
            }
            Ok(event) => println!("{event}"),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_check(
    coordinator: &UpdateCoordinator,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    match coordinator.check(cancel).await? {
        UpdateAvailability::NoUpdate { current_version } => {
            println!("Up to date (v{current_version})");
            Ok(false)
        }
        UpdateAvailability::Available(update) => {
            let direction = if update.is_downgrade {
                "downgrade"
            } else {
                "update"
            };
            println!(
                "{direction} available: v{} -> v{} ({})",
                update.current_version, update.version, update.asset.filename
            );
            if !update.notes.trim().is_empty() {
                println!("\n{}\n", update.notes.trim());
            }
            Ok(true)
        }
    }
}

async fn run_download(
    coordinator: &UpdateCoordinator,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if !run_check(coordinator, cancel).await? {
        return Ok(());
    }
    let pending = coordinator.download_update(cancel).await?;
    println!(
        "Downloaded v{} to {}",
        pending.target_version,
        pending.artifact_path.display()
    );
    Ok(())
}

async fn run_install(
    coordinator: &UpdateCoordinator,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    coordinator.recover()?;
    let report = coordinator.install_and_relaunch(cancel).await?;
    print_report(&report);
    Ok(())
}

async fn run_update(
    coordinator: &UpdateCoordinator,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if coordinator.recover()?.is_none() {
        if !run_check(coordinator, cancel).await? {
            return Ok(());
        }
        coordinator.download_update(cancel).await?;
    }
    let report = coordinator.install_and_relaunch(cancel).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &InstallReport) {
    println!("Installed to {}", report.installed_path.display());
    if let Some(backup) = &report.backup_path {
        println!("Previous version kept at {}", backup.display());
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    match &report.relaunch {
        RelaunchOutcome::Scheduled(handle) => {
            println!("Relaunching (helper pid {})", handle.pid);
        }
        RelaunchOutcome::Disabled => println!("Relaunch disabled; start the application manually"),
        RelaunchOutcome::SkippedAfterCancel => {
            println!("Relaunch skipped after cancellation; start the application manually");
        }
        RelaunchOutcome::Failed(reason) => {
            println!("Could not relaunch ({reason}); start the application manually");
        }
    }
}

fn show_status(coordinator: &UpdateCoordinator) -> anyhow::Result<()> {
    let recovered = coordinator.recover()?;
    let state = coordinator.status();
    println!("Platform: {}", coordinator.platform());
    println!(
        "Installed version: v{}",
        coordinator.config().app.current_version
    );
    match (&state, recovered) {
        (SessionState::Downloaded(_), Some(pending)) => println!(
            "Pending update: v{} at {} (downloaded {})",
            pending.target_version,
            pending.artifact_path.display(),
            pending.downloaded_at.format("%Y-%m-%d %H:%M UTC")
        ),
        _ => println!("No pending update"),
    }
    match coordinator.install_target() {
        Ok(path) => println!("Install path: {}", path.display()),
        Err(e) => println!("Install path: unknown ({e})"),
    }
    Ok(())
}

fn abandon(coordinator: &UpdateCoordinator) -> anyhow::Result<()> {
    match coordinator.abandon_pending()? {
        Some(pending) => println!("Discarded pending update v{}", pending.target_version),
        None => println!("No pending update"),
    }
    Ok(())
}
