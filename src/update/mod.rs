//! Channel-aware self-update.
//!
//! Checks each release channel for its latest version, gates channel
//! switches on baselines, downloads packages with resume and retention, and
//! hands them to the platform installer. [`UpdateCoordinator`] ties the
//! pieces into one observable state machine.

pub mod checker;
pub mod coordinator;
pub mod decision;
pub mod download;
pub mod install;
pub mod state;

pub use checker::{CheckRequest, FetchError, VersionCheck, VersionChecker};
pub use coordinator::{
    CheckReport, CheckTrigger, CoordinatorError, CoordinatorState, DownloadReport, InstallReport,
    UpdateCoordinator, UpdateStatus,
};
pub use decision::{
    ChannelDecisionEngine, ChannelSnapshot, CheckOutcome, DecisionKind, ExcludedChannel,
    UpdateDecision,
};
pub use download::{
    ArtifactFetch, DownloadError, DownloadStatus, DownloadTask, Downloader, ProgressCallback,
};
pub use install::{
    InstallCapability, InstallError, IntentInstaller, PackageInstaller, UnsupportedInstaller,
    platform_installer,
};
pub use state::{JsonFileStore, KeyValueStore, MemoryStore, UpdateState};
