//! Dotted-numeric release versions with optional channel tags.
//!
//! Release versions look like `1.3.11.001`, optionally followed by a channel
//! tag such as `-dev` or `-tag`. Ordering only looks at the numeric
//! components: the tag is kept for display and for channel admission but is
//! ignored by [`compare`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A parsed release version.
///
/// Equality and ordering ignore the channel tag and treat missing trailing
/// components as zero, so `1.3`, `1.3.0` and `1.3.0-dev` are all equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Version {
    raw: String,
    components: Vec<u64>,
    tag: Option<String>,
}

impl Version {
    /// Parse a version string. Never fails: non-numeric components become 0.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let body = raw.strip_prefix('v').unwrap_or(raw);
        let (numeric, tag) = match body.split_once('-') {
            Some((n, t)) if !t.is_empty() => (n, Some(t.to_owned())),
            Some((n, _)) => (n, None),
            None => (body, None),
        };
        let components = numeric
            .split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect();

        Self {
            raw: raw.to_owned(),
            components,
            tag,
        }
    }

    /// The string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The numeric components, in order.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Channel tag after the first `-`, if any (e.g. `"dev"`).
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The version without its channel tag or leading `v`.
    pub fn normalized(&self) -> String {
        let body = self.raw.strip_prefix('v').unwrap_or(&self.raw);
        match body.split_once('-') {
            Some((numeric, _)) => numeric.to_owned(),
            None => body.to_owned(),
        }
    }

    /// Returns `true` for an untagged four-part release such as `1.3.11.001`.
    pub fn is_plain_release(&self) -> bool {
        let parts: Vec<&str> = self.raw.split('.').collect();
        parts.len() == 4
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    }

    /// Returns a copy carrying `tag` as its channel suffix.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self::parse(&format!("{}-{tag}", self.normalized()))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<String> for Version {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for Version {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.raw
    }
}

/// Compare two version strings, ignoring channel tags.
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_suffix_is_ignored() {
        assert_eq!(compare("1.3.11.001-dev", "1.3.11.001-tag"), Ordering::Equal);
    }

    #[test]
    fn later_patch_is_greater() {
        assert_eq!(compare("1.3.11.002", "1.3.11.001"), Ordering::Greater);
        assert_eq!(compare("1.3.11.001", "1.3.11.002"), Ordering::Less);
    }

    #[test]
    fn missing_components_are_zero() {
        assert_eq!(compare("1.3", "1.3.0"), Ordering::Equal);
        assert_eq!(compare("1.3", "1.3.0.1"), Ordering::Less);
    }

    #[test]
    fn leading_zeros_are_numeric() {
        assert_eq!(compare("1.3.11.010", "1.3.11.9"), Ordering::Greater);
    }

    #[test]
    fn malformed_components_compare_as_zero() {
        assert_eq!(compare("1.x.2", "1.0.2"), Ordering::Equal);
        assert_eq!(compare("", "0"), Ordering::Equal);
    }

    #[test]
    fn git_tag_prefix_is_ignored() {
        assert_eq!(compare("v1.3.11.001", "1.3.11.001"), Ordering::Equal);
    }

    #[test]
    fn parse_keeps_tag_and_raw() {
        let v = Version::parse("1.3.11.001-dev");
        assert_eq!(v.tag(), Some("dev"));
        assert_eq!(v.normalized(), "1.3.11.001");
        assert_eq!(v.to_string(), "1.3.11.001-dev");
        assert_eq!(v.components(), &[1, 3, 11, 1]);
    }

    #[test]
    fn with_tag_replaces_suffix() {
        let v = Version::parse("1.3.11.001-dev").with_tag("tag");
        assert_eq!(v.as_str(), "1.3.11.001-tag");
    }

    #[test]
    fn sorting_is_total_modulo_suffix() {
        let mut versions: Vec<Version> = ["1.3.11.002-dev", "1.2", "1.3.11.001-tag", "1.10"]
            .into_iter()
            .map(Version::parse)
            .collect();
        versions.sort();
        let raw: Vec<&str> = versions.iter().map(Version::as_str).collect();
        assert_eq!(raw, ["1.2", "1.3.11.001-tag", "1.3.11.002-dev", "1.10"]);
    }

    #[test]
    fn serde_uses_plain_string() {
        let v = Version::parse("1.3.11.001-tag");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#""1.3.11.001-tag""#);
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "1.3.11.001-tag");
    }
}
