//! Channel-aware self-update core for a sideloaded Android application.
//!
//! # Architecture
//!
//! - **Version**: dot-separated numeric versions with an optional channel tag
//! - **Channels**: per-channel version sources, baselines and download URLs
//! - **Checker**: concurrent descriptor fetches with timeout and retry
//! - **Decision engine**: baseline gating for channel switches
//! - **Downloader**: resumable transfers with artifact retention
//! - **Installer**: hand-off to the system package installer
//! - **Coordinator**: the state machine observers subscribe to

pub mod channel;
pub mod config;
pub mod error;
pub mod retry;
pub mod update;
pub mod version;

pub use channel::{Channel, ChannelRole, ChannelSpec, DescriptorFormat, UrlSource};
pub use config::UpdateConfig;
pub use error::{Result, UpdateError};
pub use update::{CheckTrigger, CoordinatorState, UpdateCoordinator, UpdateStatus};
pub use version::{Version, compare};
