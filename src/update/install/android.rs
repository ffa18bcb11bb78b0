//! Android install host backed by the activity manager (`am`).

use super::{HostError, InstallHost, InstallIntent};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Launches intents with `am start` and shares artifacts through a content
/// provider rooted at `shared_root`.
#[derive(Debug, Clone)]
pub struct ActivityManagerHost {
    authority: String,
    shared_root: PathBuf,
    program: PathBuf,
}

impl ActivityManagerHost {
    pub fn new(authority: impl Into<String>, shared_root: impl Into<PathBuf>) -> Self {
        Self {
            authority: authority.into(),
            shared_root: shared_root.into(),
            program: PathBuf::from("am"),
        }
    }

    /// Use a different activity manager executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl InstallHost for ActivityManagerHost {
    async fn content_uri(&self, artifact: &Path) -> Result<String, HostError> {
        let relative = artifact.strip_prefix(&self.shared_root).map_err(|_| {
            HostError(format!(
                "{} is outside the shared directory {}",
                artifact.display(),
                self.shared_root.display()
            ))
        })?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                _ => return Err(HostError(format!("unsupported path {}", artifact.display()))),
            }
        }
        Ok(format!("content://{}/{}", self.authority, segments.join("/")))
    }

    async fn launch(&self, intent: &InstallIntent) -> Result<(), HostError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("start")
            .args(["-a", &intent.action])
            .args(["-d", &intent.data_uri])
            .args(["-t", &intent.mime_type])
            .args(["-f", &intent.flags.to_string()])
            .output()
            .await
            .map_err(|e| HostError(format!("cannot run {}: {e}", self.program.display())))?;

        // `am` exits 0 even when the intent did not resolve.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || stdout.contains("Error") || stderr.contains("Error") {
            let message = format!("{}\n{}", stderr.trim(), stdout.trim());
            tracing::warn!(status = ?output.status.code(), "activity manager rejected intent");
            return Err(HostError(message.trim().to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::update::install::{InstallError, IntentInstaller, PackageInstaller};

    #[tokio::test]
    async fn content_uri_is_relative_to_shared_root() {
        let host = ActivityManagerHost::new("app.fileprovider", "/data/files");
        let uri = host
            .content_uri(Path::new("/data/files/updates/App_v1.0.apk"))
            .await
            .unwrap();
        assert_eq!(uri, "content://app.fileprovider/updates/App_v1.0.apk");
    }

    #[tokio::test]
    async fn content_uri_rejects_paths_outside_root() {
        let host = ActivityManagerHost::new("app.fileprovider", "/data/files");
        assert!(host.content_uri(Path::new("/sdcard/App.apk")).await.is_err());
    }

    #[cfg(unix)]
    fn fake_am(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("am");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresolved_intent_maps_to_no_installer() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("App_v1.0.apk");
        std::fs::write(&artifact, b"pkg").unwrap();
        let am = fake_am(
            dir.path(),
            "echo 'Error: Activity not started, unable to resolve Intent'",
        );

        let installer =
            IntentInstaller::new(ActivityManagerHost::new("p", dir.path()).with_program(am));
        assert_eq!(
            installer.install(&artifact).await.unwrap_err(),
            InstallError::NoInstallerAvailable
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn security_exception_maps_to_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("App_v1.0.apk");
        std::fs::write(&artifact, b"pkg").unwrap();
        let am = fake_am(
            dir.path(),
            "echo 'java.lang.SecurityException: Permission Denial' >&2; exit 255",
        );

        let installer =
            IntentInstaller::new(ActivityManagerHost::new("p", dir.path()).with_program(am));
        assert_eq!(
            installer.install(&artifact).await.unwrap_err(),
            InstallError::PermissionDenied
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_start_passes_intent_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("App_v1.0.apk");
        std::fs::write(&artifact, b"pkg").unwrap();
        let log = dir.path().join("args.log");
        let am = fake_am(
            dir.path(),
            &format!("echo \"$@\" > {}; echo 'Starting: Intent'", log.display()),
        );

        let installer =
            IntentInstaller::new(ActivityManagerHost::new("p", dir.path()).with_program(am));
        installer.install(&artifact).await.unwrap();

        let args = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            args.trim(),
            "start -a android.intent.action.VIEW -d content://p/App_v1.0.apk \
             -t application/vnd.android.package-archive -f 268435457"
        );
    }
}
