//! Channel-aware update decisions.
//!
//! [`ChannelDecisionEngine`] turns the latest version known for each channel
//! into an [`UpdateDecision`] for one device. Switching to another channel is
//! gated on that channel's baseline: a device below the baseline is offered
//! the baseline itself before anything newer.

use crate::channel::Channel;
use crate::version::Version;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The device must install the target channel's baseline first.
    BaselineRequired,
    /// The target channel has a newer release.
    NewerOnChannel,
    /// The device already runs the target channel's latest release.
    AlreadyLatest,
}

impl DecisionKind {
    /// Human-readable summary.
    pub fn summary(self) -> &'static str {
        match self {
            Self::BaselineRequired => "baseline required before channel switch",
            Self::NewerOnChannel => "newer version on channel",
            Self::AlreadyLatest => "already latest",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.summary())
    }
}

/// A channel left out of a decision because its latest version is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedChannel {
    pub channel: Channel,
    pub reason: String,
}

/// Result of evaluating whether, and why, an update is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateDecision {
    /// Whether the device should install `latest_version`.
    pub is_update_available: bool,
    /// Version to offer. Always belongs to `target_channel`.
    pub latest_version: Version,
    /// Channel the installed build came from.
    pub current_channel: Channel,
    /// Channel this decision is for (current or desired).
    pub target_channel: Channel,
    /// Baseline of `target_channel`.
    pub baseline_version: Version,
    /// Versions the device may pick on `target_channel`, newest first.
    pub available_versions: Vec<Version>,
    pub kind: DecisionKind,
    /// Summary plus any exclusions.
    pub reason: String,
    pub excluded: Vec<ExcludedChannel>,
    /// Latest version on the reference channel, for display only.
    pub upstream_version: Option<Version>,
}

/// What a check produced. A failed check still yields a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// A decision was reached.
    Decided(UpdateDecision),
    /// No decision could be reached for `channel`.
    Failed {
        /// Channel the failure is about, when it concerns a single one.
        channel: Option<Channel>,
        reason: String,
    },
}

impl CheckOutcome {
    /// The decision, if one was reached.
    pub fn decision(&self) -> Option<&UpdateDecision> {
        match self {
            Self::Decided(d) => Some(d),
            Self::Failed { .. } => None,
        }
    }
}

/// Latest versions gathered from every channel in one check round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Latest version per gating channel that answered.
    pub latest: BTreeMap<Channel, Version>,
    /// Gating channels that could not be read, with the reason.
    pub unavailable: BTreeMap<Channel, String>,
    /// Latest version of the reference channel, if it answered.
    pub upstream: Option<Version>,
}

impl ChannelSnapshot {
    /// Returns `true` when no gating channel answered.
    pub fn all_unavailable(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Computes [`UpdateDecision`]s from channel snapshots and baselines.
#[derive(Debug, Clone, Default)]
pub struct ChannelDecisionEngine {
    baselines: BTreeMap<Channel, Version>,
}

impl ChannelDecisionEngine {
    /// Create an engine with the baseline of every gating channel.
    pub fn new(baselines: BTreeMap<Channel, Version>) -> Self {
        Self { baselines }
    }

    /// Baseline configured for `channel`.
    pub fn baseline(&self, channel: &Channel) -> Option<&Version> {
        self.baselines.get(channel)
    }

    /// Decide what `current_version` on `current_channel` should do when the
    /// user wants to be on `desired_channel`.
    pub fn decide(
        &self,
        current_channel: &Channel,
        current_version: &Version,
        desired_channel: &Channel,
        snapshot: &ChannelSnapshot,
    ) -> CheckOutcome {
        let Some(baseline) = self.baselines.get(desired_channel) else {
            return CheckOutcome::Failed {
                channel: Some(desired_channel.clone()),
                reason: format!("channel `{desired_channel}` is not configured"),
            };
        };

        let excluded: Vec<ExcludedChannel> = snapshot
            .unavailable
            .iter()
            .map(|(channel, reason)| ExcludedChannel {
                channel: channel.clone(),
                reason: reason.clone(),
            })
            .collect();

        let switching = desired_channel != current_channel;
        let (kind, latest) = if switching && current_version < baseline {
            (DecisionKind::BaselineRequired, baseline.clone())
        } else {
            let Some(latest) = snapshot.latest.get(desired_channel) else {
                let why = snapshot
                    .unavailable
                    .get(desired_channel)
                    .map_or("no version reported", String::as_str);
                return CheckOutcome::Failed {
                    channel: Some(desired_channel.clone()),
                    reason: format!("latest version on `{desired_channel}` is unavailable: {why}"),
                };
            };
            let kind = if current_version < latest {
                DecisionKind::NewerOnChannel
            } else {
                DecisionKind::AlreadyLatest
            };
            (kind, latest.clone())
        };

        CheckOutcome::Decided(UpdateDecision {
            is_update_available: kind != DecisionKind::AlreadyLatest,
            latest_version: latest,
            current_channel: current_channel.clone(),
            target_channel: desired_channel.clone(),
            baseline_version: baseline.clone(),
            available_versions: self.available_versions(desired_channel, snapshot),
            kind,
            reason: reason_text(kind, &excluded),
            excluded,
            upstream_version: snapshot.upstream.clone(),
        })
    }

    /// Candidate versions for `target`: every channel's latest and baseline
    /// whose shape `target` accepts.
    fn available_versions(&self, target: &Channel, snapshot: &ChannelSnapshot) -> Vec<Version> {
        let target_baseline = self.baselines.get(target);
        let mut candidates: Vec<Version> = Vec::new();
        for (channel, baseline) in &self.baselines {
            let latest = snapshot.latest.get(channel);
            for version in latest.into_iter().chain(std::iter::once(baseline)) {
                let admitted = accepts(target, target_baseline, version);
                if admitted && !candidates.iter().any(|c| c.as_str() == version.as_str()) {
                    candidates.push(version.clone());
                }
            }
        }
        candidates.sort_by(|a, b| b.cmp(a));
        candidates
    }
}

/// Whether `target` may offer `version`: its own baseline, an untagged
/// four-part release on the tag channel, or a version tagged with the
/// channel name anywhere else.
fn accepts(target: &Channel, baseline: Option<&Version>, version: &Version) -> bool {
    if baseline.is_some_and(|b| b.as_str() == version.as_str()) {
        return true;
    }
    if *target == Channel::tag() {
        version.is_plain_release()
    } else {
        version.tag() == Some(target.as_str())
    }
}

fn reason_text(kind: DecisionKind, excluded: &[ExcludedChannel]) -> String {
    if excluded.is_empty() {
        return kind.summary().to_owned();
    }
    let list = excluded
        .iter()
        .map(|e| format!("{} ({})", e.channel, e.reason))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}; excluded: {list}", kind.summary())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s)
    }

    fn engine() -> ChannelDecisionEngine {
        ChannelDecisionEngine::new(BTreeMap::from([
            (Channel::dev(), v("1.3.11.001")),
            (Channel::tag(), v("1.3.11.001")),
        ]))
    }

    fn snapshot(entries: &[(&str, &str)]) -> ChannelSnapshot {
        ChannelSnapshot {
            latest: entries
                .iter()
                .map(|(c, ver)| (Channel::from(*c), v(ver)))
                .collect(),
            ..Default::default()
        }
    }

    fn decided(outcome: CheckOutcome) -> UpdateDecision {
        match outcome {
            CheckOutcome::Decided(d) => d,
            CheckOutcome::Failed { reason, .. } => panic!("expected decision, got failure: {reason}"),
        }
    }

    #[test]
    fn switch_below_baseline_requires_baseline() {
        let snap = snapshot(&[("dev", "1.4.0.000-dev"), ("tag", "1.3.12.000")]);
        let d = decided(engine().decide(&Channel::dev(), &v("1.0.0.000"), &Channel::tag(), &snap));
        assert!(d.is_update_available);
        assert_eq!(d.latest_version.as_str(), "1.3.11.001");
        assert_eq!(d.kind, DecisionKind::BaselineRequired);
        assert!(d.reason.starts_with("baseline required"));
        assert_eq!(d.target_channel, Channel::tag());
    }

    #[test]
    fn switch_gate_applies_even_when_target_unknown() {
        let mut snap = snapshot(&[("dev", "1.4.0.000-dev")]);
        snap.unavailable.insert(Channel::tag(), "timeout".to_owned());
        let d = decided(engine().decide(&Channel::dev(), &v("1.0.0.000"), &Channel::tag(), &snap));
        assert_eq!(d.kind, DecisionKind::BaselineRequired);
        assert!(d.reason.contains("excluded: tag (timeout)"));
    }

    #[test]
    fn switch_above_baseline_uses_desired_latest() {
        let snap = snapshot(&[("dev", "1.4.0.000-dev"), ("tag", "1.3.12.000")]);
        let d = decided(engine().decide(&Channel::dev(), &v("1.3.11.005-dev"), &Channel::tag(), &snap));
        assert_eq!(d.kind, DecisionKind::NewerOnChannel);
        assert_eq!(d.latest_version.as_str(), "1.3.12.000");
    }

    #[test]
    fn same_channel_up_to_date() {
        let snap = snapshot(&[("tag", "1.3.11.001")]);
        let d = decided(engine().decide(&Channel::tag(), &v("1.3.11.001-tag"), &Channel::tag(), &snap));
        assert!(!d.is_update_available);
        assert_eq!(d.kind, DecisionKind::AlreadyLatest);
        assert_eq!(d.reason, "already latest");
    }

    #[test]
    fn same_channel_ahead_of_latest_is_not_an_update() {
        let snap = snapshot(&[("tag", "1.3.11.001")]);
        let d = decided(engine().decide(&Channel::tag(), &v("1.3.12"), &Channel::tag(), &snap));
        assert!(!d.is_update_available);
    }

    #[test]
    fn same_channel_behind_offers_latest() {
        let snap = snapshot(&[("tag", "1.3.11.001"), ("dev", "1.3.12.000-dev")]);
        let d = decided(engine().decide(&Channel::tag(), &v("1.3.10.000-tag"), &Channel::tag(), &snap));
        assert!(d.is_update_available);
        assert_eq!(d.latest_version.as_str(), "1.3.11.001");
        assert_eq!(d.reason, "newer version on channel");
        let available: Vec<&str> = d.available_versions.iter().map(Version::as_str).collect();
        assert!(available.contains(&"1.3.11.001"));
        assert!(!available.contains(&"1.3.12.000-dev"));
    }

    #[test]
    fn unknown_target_latest_fails_without_fabricating() {
        let mut snap = snapshot(&[("dev", "1.4.0.000-dev")]);
        snap.unavailable.insert(Channel::tag(), "HTTP 503".to_owned());
        match engine().decide(&Channel::tag(), &v("1.3.10.000"), &Channel::tag(), &snap) {
            CheckOutcome::Failed { channel, reason } => {
                assert_eq!(channel, Some(Channel::tag()));
                assert!(reason.contains("HTTP 503"));
            }
            CheckOutcome::Decided(d) => panic!("unexpected decision: {d:?}"),
        }
    }

    #[test]
    fn unavailable_other_channel_is_recorded() {
        let mut snap = snapshot(&[("tag", "1.3.11.001")]);
        snap.unavailable.insert(Channel::dev(), "malformed descriptor".to_owned());
        let d = decided(engine().decide(&Channel::tag(), &v("1.3.10.000"), &Channel::tag(), &snap));
        assert!(d.is_update_available);
        assert_eq!(d.excluded.len(), 1);
        assert_eq!(d.excluded[0].channel, Channel::dev());
        assert!(d.reason.contains("dev (malformed descriptor)"));
    }

    #[test]
    fn unconfigured_desired_channel_fails() {
        let snap = snapshot(&[("tag", "1.3.11.001")]);
        let outcome = engine().decide(&Channel::tag(), &v("1.3.10"), &Channel::from("beta"), &snap);
        assert!(matches!(outcome, CheckOutcome::Failed { .. }));
    }

    #[test]
    fn dev_target_admits_dev_tagged_versions() {
        let snap = snapshot(&[("dev", "1.3.12.000-dev"), ("tag", "1.3.11.005-dev")]);
        let d = decided(engine().decide(&Channel::dev(), &v("1.3.11.001-dev"), &Channel::dev(), &snap));
        let available: Vec<&str> = d.available_versions.iter().map(Version::as_str).collect();
        assert_eq!(available, ["1.3.12.000-dev", "1.3.11.005-dev", "1.3.11.001"]);
    }

    #[test]
    fn upstream_is_carried_for_display() {
        let mut snap = snapshot(&[("tag", "1.3.11.001")]);
        snap.upstream = Some(v("2.0.0"));
        let d = decided(engine().decide(&Channel::tag(), &v("1.3.11.001"), &Channel::tag(), &snap));
        assert!(!d.is_update_available);
        assert_eq!(d.upstream_version.unwrap().as_str(), "2.0.0");
    }

    #[test]
    fn tag_target_admits_by_version_shape() {
        let snap = snapshot(&[("dev", "1.3.12.000-dev"), ("tag", "1.3.12.001-dev")]);
        let d = decided(engine().decide(&Channel::tag(), &v("1.3.11.001"), &Channel::tag(), &snap));
        let available: Vec<&str> = d.available_versions.iter().map(Version::as_str).collect();
        assert_eq!(available, ["1.3.11.001"]);
    }

    #[test]
    fn plain_release_shape() {
        assert!(v("1.3.11.001").is_plain_release());
        assert!(!v("1.3.11.001-tag").is_plain_release());
        assert!(!v("v1.3.11.001").is_plain_release());
        assert!(!v("1.3.11").is_plain_release());
    }
}
