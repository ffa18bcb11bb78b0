//! Release channels and their locators.

use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a release track (`dev`, `tag`, `upstream`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    /// Create a channel from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The rolling development channel.
    pub fn dev() -> Self {
        Self::new("dev")
    }

    /// The tagged-release channel.
    pub fn tag() -> Self {
        Self::new("tag")
    }

    /// The read-only upstream reference channel.
    pub fn upstream() -> Self {
        Self::new("upstream")
    }

    /// The channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A URL that is either fixed or derived from a version string.
///
/// Templates substitute `{version}` with the version's numeric part
/// (channel tag and leading `v` removed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum UrlSource {
    /// Fixed URL.
    Static(String),
    /// URL template containing `{version}`.
    Templated(String),
}

impl UrlSource {
    /// Resolve the URL for `version`.
    pub fn resolve(&self, version: &Version) -> String {
        match self {
            Self::Static(url) => url.clone(),
            Self::Templated(template) => template.replace("{version}", &version.normalized()),
        }
    }
}

/// Whether a channel takes part in update decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// A channel devices can run and switch to.
    #[default]
    Gating,
    /// Shown for reference only; never gates or offers an update.
    Reference,
}

/// Shape of the version document a channel publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorFormat {
    /// Package manifest with a top-level `version` field.
    #[default]
    Manifest,
    /// Release listing entry with a `tag_name` field (e.g. `v1.3.11.001`).
    ReleaseListing,
}

/// Everything the updater knows about one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel name.
    pub name: Channel,
    /// Minimum version a device must run before switching to this channel.
    pub baseline_version: Version,
    /// Decision participation.
    #[serde(default)]
    pub role: ChannelRole,
    /// Descriptor payload shape.
    #[serde(default)]
    pub format: DescriptorFormat,
    /// Where the channel's version descriptor lives.
    pub version_source: UrlSource,
    /// Download locator for a release on this channel.
    pub download_url: UrlSource,
}

impl ChannelSpec {
    /// Returns `true` for channels that participate in gating decisions.
    pub fn is_gating(&self) -> bool {
        self.role == ChannelRole::Gating
    }
}
