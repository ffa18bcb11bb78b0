//! Per-channel version checks.
//!
//! Fetches each channel's version descriptor concurrently, every request with
//! its own timeout and retry budget, and feeds the results to the
//! [`ChannelDecisionEngine`]. A channel that cannot be read is excluded from
//! the decision; only a round where no gating channel answers fails.

use crate::channel::{Channel, ChannelRole, ChannelSpec, DescriptorFormat};
use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::retry::{RetryError, RetryPolicy, Transient, retry_with_backoff};
use crate::update::decision::{ChannelDecisionEngine, ChannelSnapshot, CheckOutcome};
use crate::version::Version;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a single descriptor fetch failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// No response within the request timeout.
    #[error("timed out")]
    Timeout,
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Server answered with a non-success status.
    #[error("HTTP {0}")]
    Status(u16),
    /// Body was not a usable version descriptor.
    #[error("malformed descriptor: {0}")]
    Malformed(String),
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) | Self::Transport(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Who is asking and where they want to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub current_channel: Channel,
    pub current_version: Version,
    pub desired_channel: Channel,
}

/// Something that can produce a [`CheckOutcome`].
///
/// Implemented by [`VersionChecker`]; the coordinator only sees this trait.
#[async_trait]
pub trait VersionCheck: Send + Sync {
    /// Run one check round. Never fails: failures are part of the outcome.
    async fn check(&self, request: &CheckRequest) -> CheckOutcome;
}

/// Fetches channel descriptors over HTTP.
pub struct VersionChecker {
    client: reqwest::Client,
    channels: Vec<ChannelSpec>,
    engine: ChannelDecisionEngine,
    retry: RetryPolicy,
    timeout: Duration,
    cache_bust: bool,
}

impl VersionChecker {
    /// Build a checker from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &UpdateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("channel-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpdateError::Client(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Build a checker around an existing client.
    pub fn with_client(client: reqwest::Client, config: &UpdateConfig) -> Self {
        Self {
            client,
            channels: config.channels.clone(),
            engine: ChannelDecisionEngine::new(config.baselines()),
            retry: config.check_retry(),
            timeout: Duration::from_millis(config.timeout_ms),
            cache_bust: config.cache_bust,
        }
    }

    /// Query every configured channel concurrently.
    pub async fn snapshot(&self, current_version: &Version) -> ChannelSnapshot {
        let fetches = self.channels.iter().map(|spec| async move {
            let result = self.fetch_channel(spec, current_version).await;
            (spec, result)
        });

        let mut snapshot = ChannelSnapshot::default();
        for (spec, result) in join_all(fetches).await {
            match (spec.role, result) {
                (ChannelRole::Gating, Ok(version)) => {
                    info!(channel = %spec.name, %version, "channel version fetched");
                    snapshot.latest.insert(spec.name.clone(), version);
                }
                (ChannelRole::Gating, Err(e)) => {
                    warn!(channel = %spec.name, "channel unavailable: {e}");
                    snapshot.unavailable.insert(spec.name.clone(), e.to_string());
                }
                (ChannelRole::Reference, Ok(version)) => {
                    debug!(channel = %spec.name, %version, "reference version fetched");
                    snapshot.upstream = Some(version);
                }
                (ChannelRole::Reference, Err(e)) => {
                    debug!(channel = %spec.name, "reference channel unavailable: {e}");
                }
            }
        }
        snapshot
    }

    async fn fetch_channel(
        &self,
        spec: &ChannelSpec,
        current_version: &Version,
    ) -> std::result::Result<Version, RetryError<FetchError>> {
        let url = self.descriptor_url(spec, current_version);
        debug!(channel = %spec.name, %url, "fetching version descriptor");
        retry_with_backoff(self.retry, spec.name.as_str(), |_| {
            self.fetch_once(&url, spec.format)
        })
        .await
    }

    async fn fetch_once(
        &self,
        url: &str,
        format: DescriptorFormat,
    ) -> std::result::Result<Version, FetchError> {
        let resp = self.client.get(url).timeout(self.timeout).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        parse_descriptor(&body, format)
    }

    fn descriptor_url(&self, spec: &ChannelSpec, current_version: &Version) -> String {
        let url = spec.version_source.resolve(current_version);
        if !self.cache_bust {
            return url;
        }
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}t={}", chrono::Utc::now().timestamp_millis())
    }
}

#[async_trait]
impl VersionCheck for VersionChecker {
    async fn check(&self, request: &CheckRequest) -> CheckOutcome {
        let snapshot = self.snapshot(&request.current_version).await;

        if snapshot.all_unavailable() {
            let detail = snapshot
                .unavailable
                .iter()
                .map(|(c, r)| format!("{c}: {r}"))
                .collect::<Vec<_>>()
                .join("; ");
            return CheckOutcome::Failed {
                channel: None,
                reason: format!("no channel could be checked ({detail})"),
            };
        }

        self.engine.decide(
            &request.current_channel,
            &request.current_version,
            &request.desired_channel,
            &snapshot,
        )
    }
}

/// Extract the version from a descriptor body.
fn parse_descriptor(body: &str, format: DescriptorFormat) -> std::result::Result<Version, FetchError> {
    let json: serde_json::Value =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let raw = match format {
        DescriptorFormat::Manifest => json.get("version").and_then(|v| v.as_str()),
        DescriptorFormat::ReleaseListing => {
            // Either a single release object or a listing, newest first.
            let release = json.as_array().and_then(|a| a.first()).unwrap_or(&json);
            release.get("tag_name").and_then(|v| v.as_str())
        }
    };

    let raw = raw
        .map(str::trim)
        .filter(|s| s.chars().any(|c| c.is_ascii_digit()))
        .ok_or_else(|| FetchError::Malformed("missing version field".to_owned()))?;

    Ok(Version::parse(raw))
}
