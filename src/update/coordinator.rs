//! Update lifecycle state machine.
//!
//! [`UpdateCoordinator`] owns the one [`CoordinatorState`] record and is the
//! only writer. Every transition happens under a single mutex and is
//! published through a [`watch`] channel, so observers always see a
//! consistent snapshot.
//!
//! ```text
//! Idle -> Checking -> CheckFailed | NoUpdate | UpdateAvailable | Skipped
//! UpdateAvailable -> Downloading -> DownloadFailed | Downloaded
//! Downloaded -> Installing -> InstallFailed | Done
//! any -> ChannelSwitchRequested -> Checking
//! Downloaded | Done -> Checking -> Downloaded | Done   (same version still offered)
//! ```

use crate::channel::Channel;
use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::update::checker::{CheckRequest, VersionCheck, VersionChecker};
use crate::update::decision::{CheckOutcome, UpdateDecision};
use crate::update::download::{
    ArtifactFetch, DownloadError, DownloadTask, Downloader, ProgressCallback,
};
use crate::update::install::{InstallError, PackageInstaller, platform_installer};
use crate::update::state::{Clock, KeyValueStore, SystemClock, UpdateState};
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the coordinator is in the update lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    Checking,
    CheckFailed,
    NoUpdate,
    UpdateAvailable,
    /// An update exists but its version is the skipped one.
    Skipped,
    ChannelSwitchRequested,
    Downloading,
    DownloadFailed,
    Downloaded,
    Installing,
    InstallFailed,
    /// The system installer was launched.
    Done,
}

/// Snapshot of everything an observer may show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorState {
    pub status: UpdateStatus,
    pub current_channel: Channel,
    pub desired_channel: Channel,
    pub current_version: Version,
    /// Latest decision. Kept across failed checks.
    pub decision: Option<UpdateDecision>,
    /// An update is available and not skipped.
    pub should_prompt: bool,
    pub skipped_version: Option<Version>,
    pub download: Option<DownloadTask>,
    pub artifact: Option<PathBuf>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub install_error: Option<InstallError>,
}

/// What started a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTrigger {
    Manual,
    Timer,
    Startup,
}

/// Result of asking for a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckReport {
    /// This call ran the check.
    Completed(CheckOutcome),
    /// Another check was already running; its result will be published.
    AlreadyInFlight,
    /// A download or install is in progress.
    Busy,
}

/// Result of a download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadReport {
    Completed(PathBuf),
    Failed { reason: String },
    /// A newer download or a channel switch replaced this one.
    Superseded,
}

/// Result of an install request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallReport {
    Launched,
    Failed(InstallError),
}

/// A request that the current state does not allow.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no update is available")]
    NoUpdate,
    #[error("no version has been checked yet")]
    NoDecision,
    #[error("nothing has been downloaded")]
    NotDownloaded,
    #[error("a check or install is in progress")]
    Busy,
    #[error(transparent)]
    Storage(#[from] UpdateError),
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    auto_check_enabled: bool,
    background_timers: bool,
    check_interval: Duration,
}

struct Inner {
    state: CoordinatorState,
    check_in_flight: bool,
    download_generation: u64,
    download_cancel: Option<CancellationToken>,
    /// Version of `state.artifact`.
    artifact_version: Option<Version>,
    /// The installer was launched for `artifact_version`.
    launched: bool,
}

impl Inner {
    fn set_status(&mut self, status: UpdateStatus) {
        if self.state.status != status {
            debug!(from = ?self.state.status, to = ?status, "update status changed");
            self.state.status = status;
        }
    }

    fn check_request(&self) -> CheckRequest {
        CheckRequest {
            current_channel: self.state.current_channel.clone(),
            current_version: self.state.current_version.clone(),
            desired_channel: self.state.desired_channel.clone(),
        }
    }

    /// Status to return to after a check that leaves the artifact in place.
    fn artifact_status(&self) -> Option<UpdateStatus> {
        self.state.artifact.as_ref()?;
        Some(if self.launched {
            UpdateStatus::Done
        } else {
            UpdateStatus::Downloaded
        })
    }

    fn forget_artifact(&mut self) {
        self.state.artifact = None;
        self.artifact_version = None;
        self.launched = false;
    }

    /// Cancel any running download and forget its results.
    fn abandon_download(&mut self) {
        if let Some(token) = self.download_cancel.take() {
            token.cancel();
            self.download_generation += 1;
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    tx: watch::Sender<CoordinatorState>,
}

impl Shared {
    /// Mutate under the lock, then publish the resulting snapshot.
    fn update<R>(&self, apply: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let result = apply(&mut inner);
        self.tx.send_if_modified(|published| {
            if *published == inner.state {
                false
            } else {
                *published = inner.state.clone();
                true
            }
        });
        result
    }
}

/// Drives checks, downloads and installs for one installed application.
pub struct UpdateCoordinator {
    checker: Arc<dyn VersionCheck>,
    fetcher: Arc<dyn ArtifactFetch>,
    installer: Arc<dyn PackageInstaller>,
    persisted: UpdateState,
    clock: Arc<dyn Clock>,
    schedule: Schedule,
    shared: Arc<Shared>,
    transfer_lock: tokio::sync::Mutex<()>,
}

impl UpdateCoordinator {
    /// Create a coordinator around the given components.
    pub fn new(
        config: &UpdateConfig,
        checker: Arc<dyn VersionCheck>,
        fetcher: Arc<dyn ArtifactFetch>,
        installer: Arc<dyn PackageInstaller>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let persisted = UpdateState::new(store);
        let skipped_version = persisted.skip_version().unwrap_or_else(|e| {
            warn!("cannot read skipped version: {e}");
            None
        });
        let last_check = persisted.last_check().unwrap_or_default();

        let state = CoordinatorState {
            status: UpdateStatus::Idle,
            current_channel: config.current_channel.clone(),
            desired_channel: config.current_channel.clone(),
            current_version: config.installed_version(),
            decision: None,
            should_prompt: false,
            skipped_version,
            download: None,
            artifact: None,
            last_check,
            last_error: None,
            install_error: None,
        };
        let (tx, _) = watch::channel(state.clone());

        Self {
            checker,
            fetcher,
            installer,
            persisted,
            clock: Arc::new(SystemClock),
            schedule: Schedule {
                auto_check_enabled: config.auto_check_enabled,
                background_timers: config.background_timers,
                check_interval: config.check_interval(),
            },
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state,
                    check_in_flight: false,
                    download_generation: 0,
                    download_cancel: None,
                    artifact_version: None,
                    launched: false,
                }),
                tx,
            }),
            transfer_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a coordinator with the HTTP checker, HTTP downloader and the
    /// installer for this platform.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be constructed.
    pub fn from_config(config: &UpdateConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let checker = Arc::new(VersionChecker::new(config)?);
        let downloader = Downloader::new(config)?;
        let installer: Arc<dyn PackageInstaller> = Arc::from(platform_installer(
            config.install_authority.as_deref(),
            downloader.artifact_dir(),
        ));
        Ok(Self::new(
            config,
            checker,
            Arc::new(downloader),
            installer,
            store,
        ))
    }

    /// Replace the clock used for check timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current snapshot.
    pub fn state(&self) -> CoordinatorState {
        self.shared.tx.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.shared.tx.subscribe()
    }

    /// Application-start hook: runs a check when auto-check is on and the
    /// last successful check is older than the check interval.
    pub async fn initialize(&self) -> Option<CheckReport> {
        if !self.schedule.auto_check_enabled {
            debug!("auto-check disabled; skipping startup check");
            return None;
        }
        if !self.check_is_due() {
            debug!("last check is recent; skipping startup check");
            return None;
        }
        Some(self.check(CheckTrigger::Startup).await)
    }

    /// Start the periodic check timer. Returns `None` when auto-check is off
    /// or the host does not allow background timers.
    pub fn spawn_auto_check(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.schedule.auto_check_enabled || !self.schedule.background_timers {
            return None;
        }
        let coordinator = Arc::clone(self);
        let interval = self.schedule.check_interval;
        Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "auto-check timer started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("auto-check timer stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if coordinator.check_is_due() {
                            coordinator.check(CheckTrigger::Timer).await;
                        }
                    }
                }
            }
        }))
    }

    fn check_is_due(&self) -> bool {
        self.persisted
            .check_is_due(self.clock.now(), self.schedule.check_interval)
            .unwrap_or_else(|e| {
                warn!("cannot read last check time: {e}");
                true
            })
    }

    /// Check every channel and record the decision.
    ///
    /// Concurrent calls share one check round: only the first runs it.
    pub async fn check(&self, trigger: CheckTrigger) -> CheckReport {
        let admitted = self.shared.update(|inner| {
            if inner.check_in_flight {
                return Err(CheckReport::AlreadyInFlight);
            }
            if matches!(
                inner.state.status,
                UpdateStatus::Downloading | UpdateStatus::Installing
            ) {
                return Err(CheckReport::Busy);
            }
            inner.check_in_flight = true;
            inner.set_status(UpdateStatus::Checking);
            inner.state.last_error = None;
            Ok(inner.check_request())
        });
        let mut request = match admitted {
            Ok(request) => request,
            Err(report) => {
                debug!(?trigger, ?report, "check not started");
                return report;
            }
        };

        loop {
            info!(
                ?trigger,
                current = %request.current_version,
                channel = %request.current_channel,
                desired = %request.desired_channel,
                "checking for updates"
            );
            let outcome = self.checker.check(&request).await;

            let rerun = self.shared.update(|inner| {
                if inner.state.desired_channel != request.desired_channel {
                    // Channel switched mid-flight; this result is stale.
                    inner.set_status(UpdateStatus::Checking);
                    return Some(inner.check_request());
                }
                inner.check_in_flight = false;
                self.apply_outcome(inner, &outcome);
                None
            });
            match rerun {
                Some(next) => request = next,
                None => {
                    if outcome.decision().is_some() {
                        self.record_check_time();
                    }
                    return CheckReport::Completed(outcome);
                }
            }
        }
    }

    fn apply_outcome(&self, inner: &mut Inner, outcome: &CheckOutcome) {
        match outcome {
            CheckOutcome::Decided(decision) => {
                inner.state.last_check = Some(self.clock.now());

                let skipped = decision.is_update_available
                    && inner
                        .state
                        .skipped_version
                        .as_ref()
                        .is_some_and(|v| v == &decision.latest_version);
                let artifact_current = decision.is_update_available
                    && !skipped
                    && inner.artifact_version.as_ref() == Some(&decision.latest_version);
                if !artifact_current {
                    inner.forget_artifact();
                }
                let status = if !decision.is_update_available {
                    UpdateStatus::NoUpdate
                } else if skipped {
                    UpdateStatus::Skipped
                } else {
                    inner
                        .artifact_status()
                        .unwrap_or(UpdateStatus::UpdateAvailable)
                };
                info!(
                    latest = %decision.latest_version,
                    target = %decision.target_channel,
                    available = decision.is_update_available,
                    skipped,
                    "{}",
                    decision.reason
                );
                inner.state.should_prompt = matches!(
                    status,
                    UpdateStatus::UpdateAvailable | UpdateStatus::Downloaded
                );
                inner.state.decision = Some(decision.clone());
                inner.set_status(status);
            }
            CheckOutcome::Failed { channel, reason } => {
                warn!(channel = ?channel.as_ref().map(Channel::as_str), "update check failed: {reason}");
                inner.state.last_error = Some(reason.clone());
                match inner.artifact_status() {
                    Some(status) => inner.set_status(status),
                    None => {
                        inner.state.should_prompt = false;
                        inner.set_status(UpdateStatus::CheckFailed);
                    }
                }
            }
        }
    }

    fn record_check_time(&self) {
        let now = self.state().last_check.unwrap_or_else(|| self.clock.now());
        if let Err(e) = self.persisted.mark_checked(now) {
            warn!("cannot record check time: {e}");
        }
    }

    /// Switch the desired channel and re-check with baseline gating.
    ///
    /// A running download is cancelled. Rejected while installing.
    pub async fn switch_channel(&self, desired: Channel) -> CheckReport {
        let accepted = self.shared.update(|inner| {
            if inner.state.status == UpdateStatus::Installing {
                return false;
            }
            inner.abandon_download();
            info!(from = %inner.state.desired_channel, to = %desired, "channel switch requested");
            inner.state.desired_channel = desired;
            inner.state.decision = None;
            inner.state.should_prompt = false;
            inner.state.download = None;
            inner.forget_artifact();
            inner.set_status(UpdateStatus::ChannelSwitchRequested);
            true
        });
        if !accepted {
            return CheckReport::Busy;
        }
        self.check(CheckTrigger::Manual).await
    }

    /// Download the decided version.
    ///
    /// A download already running is cancelled and replaced by this one.
    ///
    /// # Errors
    ///
    /// Returns an error if no update is available or an install is running.
    pub async fn download(&self) -> std::result::Result<DownloadReport, CoordinatorError> {
        let admitted = self.shared.update(|inner| -> std::result::Result<_, CoordinatorError> {
            if inner.check_in_flight || inner.state.status == UpdateStatus::Installing {
                return Err(CoordinatorError::Busy);
            }
            let decision = inner
                .state
                .decision
                .as_ref()
                .filter(|d| d.is_update_available)
                .ok_or(CoordinatorError::NoUpdate)?;
            let version = decision.latest_version.clone();
            let channel = decision.target_channel.clone();

            if inner.download_cancel.is_some() {
                info!(%version, "restarting in-flight download");
            }
            inner.abandon_download();
            inner.download_generation += 1;
            let cancel = CancellationToken::new();
            inner.download_cancel = Some(cancel.clone());
            inner.state.download = None;
            inner.forget_artifact();
            inner.state.last_error = None;
            inner.set_status(UpdateStatus::Downloading);
            Ok((inner.download_generation, cancel, version, channel))
        });
        let (generation, cancel, version, channel) = admitted?;

        // Wait for a superseded transfer to let go of the partial file.
        let _transfer = self.transfer_lock.lock().await;
        if cancel.is_cancelled() {
            return Ok(DownloadReport::Superseded);
        }

        let shared = Arc::clone(&self.shared);
        let on_progress: ProgressCallback = Arc::new(move |task: &DownloadTask| {
            shared.update(|inner| {
                if inner.download_generation == generation {
                    inner.state.download = Some(task.clone());
                }
            });
        });

        let result = self
            .fetcher
            .download(&version, &channel, on_progress, cancel)
            .await;

        let report = self.shared.update(|inner| {
            if inner.download_generation != generation {
                return DownloadReport::Superseded;
            }
            inner.download_cancel = None;
            match &result {
                Ok(path) => {
                    inner.state.artifact = Some(path.clone());
                    inner.artifact_version = Some(version.clone());
                    inner.set_status(UpdateStatus::Downloaded);
                    DownloadReport::Completed(path.clone())
                }
                Err(DownloadError::Cancelled { .. }) => {
                    inner.set_status(UpdateStatus::UpdateAvailable);
                    DownloadReport::Superseded
                }
                Err(e) => {
                    inner.state.last_error = Some(e.to_string());
                    inner.set_status(UpdateStatus::DownloadFailed);
                    DownloadReport::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        });

        if let (DownloadReport::Failed { .. }, Err(e)) = (&report, &result) {
            if let Some(partial) = e.partial_path() {
                match tokio::fs::remove_file(partial).await {
                    Ok(()) => debug!(path = %partial.display(), "discarded partial download"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(path = %partial.display(), "cannot discard partial download: {err}"),
                }
            }
        }
        Ok(report)
    }

    /// Hand the downloaded artifact to the installer.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is downloaded or an install is running.
    pub async fn install(&self) -> std::result::Result<InstallReport, CoordinatorError> {
        let artifact = self.shared.update(|inner| {
            match (inner.state.status, inner.state.artifact.clone()) {
                (UpdateStatus::Installing, _) => Err(CoordinatorError::Busy),
                (UpdateStatus::Downloaded | UpdateStatus::InstallFailed, Some(path)) => {
                    inner.state.install_error = None;
                    inner.set_status(UpdateStatus::Installing);
                    Ok(path)
                }
                _ => Err(CoordinatorError::NotDownloaded),
            }
        })?;

        info!(path = %artifact.display(), "installing update");
        let result = self.installer.install(&artifact).await;

        Ok(self.shared.update(|inner| match result {
            Ok(()) => {
                inner.launched = true;
                inner.state.should_prompt = false;
                inner.set_status(UpdateStatus::Done);
                InstallReport::Launched
            }
            Err(e) => {
                warn!("install failed: {e}");
                inner.state.last_error = Some(e.to_string());
                inner.state.install_error = Some(e.clone());
                inner.set_status(UpdateStatus::InstallFailed);
                InstallReport::Failed(e)
            }
        }))
    }

    /// Stop prompting for the decided version.
    ///
    /// # Errors
    ///
    /// Returns an error if no version is known or the marker cannot be stored.
    pub fn skip(&self) -> std::result::Result<Version, CoordinatorError> {
        let version = self
            .state()
            .decision
            .map(|d| d.latest_version)
            .ok_or(CoordinatorError::NoDecision)?;
        self.persisted.set_skip_version(&version)?;
        info!(%version, "version skipped");

        self.shared.update(|inner| {
            inner.state.skipped_version = Some(version.clone());
            let offered = inner
                .state
                .decision
                .as_ref()
                .is_some_and(|d| d.latest_version == version);
            if offered {
                inner.state.should_prompt = false;
                if inner.state.status == UpdateStatus::UpdateAvailable {
                    inner.set_status(UpdateStatus::Skipped);
                }
            }
        });
        Ok(version)
    }

    /// Forget the skipped version.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be removed from storage.
    pub fn clear_skip(&self) -> std::result::Result<(), CoordinatorError> {
        self.persisted.clear_skip_version()?;
        self.shared.update(|inner| {
            inner.state.skipped_version = None;
            if inner.state.status == UpdateStatus::Skipped {
                inner.state.should_prompt = true;
                inner.set_status(UpdateStatus::UpdateAvailable);
            }
        });
        Ok(())
    }
}
