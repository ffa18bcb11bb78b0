//! CLI binary for channel-updater.

use anyhow::{Context, bail};
use channel_updater::update::{
    CheckOutcome, CheckReport, DownloadReport, InstallReport, JsonFileStore, UpdateDecision,
};
use channel_updater::{Channel, CheckTrigger, UpdateConfig, UpdateCoordinator, UpdateStatus};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Check, download and install application updates per release channel.
#[derive(Parser)]
#[command(name = "channel-update", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the persisted update state (JSON).
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Check every channel and print the decision.
    Check,

    /// Check, then download the offered version.
    Download,

    /// Check, download, then launch the system installer.
    Install,

    /// Re-check as if switching to another channel.
    Switch {
        /// Channel to switch to.
        channel: String,

        /// Download the offered version after the check.
        #[arg(long)]
        download: bool,
    },

    /// Check, then stop prompting for the offered version.
    Skip,

    /// Forget the skipped version.
    ClearSkip,

    /// Run the periodic auto-check until Ctrl+C.
    Watch,

    /// Write the effective configuration as TOML.
    WriteConfig {
        /// Destination (defaults to the user config path).
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("channel_updater=info,channel_update=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => UpdateConfig::from_file(path)
            .with_context(|| format!("cannot load config from {}", path.display()))?,
        None => {
            let default_path = UpdateConfig::default_config_path();
            if default_path.exists() {
                UpdateConfig::from_file(&default_path)?
            } else {
                UpdateConfig::default()
            }
        }
    };

    if let Command::WriteConfig { path } = &cli.command {
        let path = path.clone().unwrap_or_else(UpdateConfig::default_config_path);
        config.save_to_file(&path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let state_path = cli.state.unwrap_or_else(JsonFileStore::default_path);
    let store = Arc::new(JsonFileStore::open(state_path));
    let coordinator = Arc::new(UpdateCoordinator::from_config(&config, store)?);

    match cli.command {
        Command::Check => {
            run_check(&coordinator).await?;
        }
        Command::Download => {
            run_check(&coordinator).await?;
            run_download(&coordinator).await?;
        }
        Command::Install => {
            run_check(&coordinator).await?;
            run_download(&coordinator).await?;
            match coordinator.install().await? {
                InstallReport::Launched => println!("installer launched"),
                InstallReport::Failed(e) => bail!("{e}"),
            }
        }
        Command::Switch { channel, download } => {
            let report = coordinator.switch_channel(Channel::from(channel.as_str())).await;
            print_report(&report)?;
            if download {
                run_download(&coordinator).await?;
            }
        }
        Command::Skip => {
            run_check(&coordinator).await?;
            let version = coordinator.skip()?;
            println!("skipping {version}");
        }
        Command::ClearSkip => {
            coordinator.clear_skip()?;
            println!("skip marker cleared");
        }
        Command::Watch => run_watch(&coordinator).await?,
        Command::WriteConfig { .. } => {}
    }

    Ok(())
}

async fn run_check(coordinator: &UpdateCoordinator) -> anyhow::Result<()> {
    let report = coordinator.check(CheckTrigger::Manual).await;
    print_report(&report)
}

fn print_report(report: &CheckReport) -> anyhow::Result<()> {
    match report {
        CheckReport::Completed(CheckOutcome::Decided(decision)) => {
            print_decision(decision);
            Ok(())
        }
        CheckReport::Completed(CheckOutcome::Failed { reason, .. }) => {
            bail!("update check failed: {reason}")
        }
        CheckReport::AlreadyInFlight => bail!("a check is already running"),
        CheckReport::Busy => bail!("a download or install is in progress"),
    }
}

fn print_decision(decision: &UpdateDecision) {
    println!(
        "{} -> {}: {}",
        decision.current_channel, decision.target_channel, decision.reason
    );
    println!("  latest:    {}", decision.latest_version);
    println!("  baseline:  {}", decision.baseline_version);
    println!(
        "  available: {}",
        if decision.is_update_available { "yes" } else { "no" }
    );
    if !decision.available_versions.is_empty() {
        let versions: Vec<String> = decision
            .available_versions
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  versions:  {}", versions.join(", "));
    }
    if let Some(upstream) = &decision.upstream_version {
        println!("  upstream:  {upstream}");
    }
}

async fn run_download(coordinator: &Arc<UpdateCoordinator>) -> anyhow::Result<()> {
    let state = coordinator.state();
    if state.status == UpdateStatus::Skipped {
        info!("offered version is skipped; downloading anyway");
    }

    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("  {msg} [{bar:30}] {pos:>3}%") {
        pb.set_style(style);
    }
    if let Some(decision) = &state.decision {
        pb.set_message(format!("v{}", decision.latest_version));
    }

    let mut rx = coordinator.subscribe();
    let bar = pb.clone();
    let progress = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let percent = rx.borrow_and_update().download.as_ref().map(|t| t.progress_percent);
            if let Some(p) = percent {
                bar.set_position(u64::from(p));
            }
        }
    });

    let report = coordinator.download().await?;
    progress.abort();
    pb.finish_and_clear();

    match report {
        DownloadReport::Completed(path) => {
            println!("downloaded {}", path.display());
            Ok(())
        }
        DownloadReport::Failed { reason } => bail!("download failed: {reason}"),
        DownloadReport::Superseded => bail!("download was superseded"),
    }
}

async fn run_watch(coordinator: &Arc<UpdateCoordinator>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    if let Some(CheckReport::Completed(CheckOutcome::Decided(decision))) =
        coordinator.initialize().await
    {
        print_decision(&decision);
    }

    let Some(timer) = coordinator.spawn_auto_check(cancel.clone()) else {
        bail!("auto-check is disabled or background timers are not allowed");
    };

    let mut rx = coordinator.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = rx.borrow_and_update().clone();
                if state.should_prompt
                    && let Some(decision) = &state.decision
                {
                    println!("update available: {}", decision.latest_version);
                }
            }
        }
    }

    timer.await.context("auto-check task panicked")?;
    Ok(())
}
