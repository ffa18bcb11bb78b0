//! Shared fixtures for the HTTP integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use channel_updater::{
    Channel, ChannelRole, ChannelSpec, DescriptorFormat, UpdateConfig, UrlSource, Version,
};
use serde_json::json;
use std::path::Path;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const BASELINE: &str = "1.3.11.001";

/// Config whose channels all point at `server`, with near-zero backoff.
pub fn config_for(server: &MockServer, artifact_dir: &Path) -> UpdateConfig {
    let uri = server.uri();
    let download = UrlSource::Templated(format!("{uri}/releases/v{{version}}/app.apk"));
    UpdateConfig {
        current_channel: Channel::tag(),
        installed_version: Some(Version::parse("1.3.10.000-tag")),
        timeout_ms: 2_000,
        check_retry_delay_ms: 1,
        download_retry_delay_ms: 1,
        artifact_dir: Some(artifact_dir.to_path_buf()),
        channels: vec![
            ChannelSpec {
                name: Channel::dev(),
                baseline_version: Version::parse(BASELINE),
                role: ChannelRole::Gating,
                format: DescriptorFormat::Manifest,
                version_source: UrlSource::Static(format!("{uri}/dev/package.json")),
                download_url: download.clone(),
            },
            ChannelSpec {
                name: Channel::tag(),
                baseline_version: Version::parse(BASELINE),
                role: ChannelRole::Gating,
                format: DescriptorFormat::Manifest,
                version_source: UrlSource::Templated(format!(
                    "{uri}/tags/v{{version}}/package.json"
                )),
                download_url: download,
            },
        ],
        ..Default::default()
    }
}

/// A manifest body reporting `version`.
pub fn manifest(version: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "name": "OrionTV", "version": version }))
}

/// Serve `version` as the manifest at `route`.
pub async fn serve_manifest(server: &MockServer, route: &str, version: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(manifest(version))
        .mount(server)
        .await;
}

/// Deterministic package bytes.
pub fn package_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
