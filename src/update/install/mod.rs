//! Handing a downloaded package to the operating system's installer.
//!
//! [`PackageInstaller`] is the seam the coordinator talks to. On Android the
//! [`IntentInstaller`] fires a `VIEW` intent with the package MIME type and a
//! content URI for the artifact, via an [`InstallHost`]. Everywhere else the
//! [`UnsupportedInstaller`] reports that installing is not possible.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

mod android;
mod stub;

pub use android::ActivityManagerHost;
pub use stub::UnsupportedInstaller;

/// Intent action that opens the system package installer.
pub const VIEW_ACTION: &str = "android.intent.action.VIEW";
/// MIME type of an installable package.
pub const PACKAGE_MIME_TYPE: &str = "application/vnd.android.package-archive";
/// Start the installer in its own task.
pub const FLAG_ACTIVITY_NEW_TASK: u32 = 0x1000_0000;
/// Let the installer read the content URI.
pub const FLAG_GRANT_READ_URI_PERMISSION: u32 = 0x0000_0001;

/// Whether this host can install packages at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallCapability {
    CanInstallPackages,
    Unsupported,
}

/// Why an install could not be started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum InstallError {
    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),
    #[error("no installer available on this device")]
    NoInstallerAvailable,
    #[error("permission to install packages was denied")]
    PermissionDenied,
    #[error("installing packages is not supported on this platform")]
    Unsupported,
    #[error("install failed: {0}")]
    Unknown(String),
}

impl InstallError {
    /// Map a host failure message onto an install error.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("activity not found")
            || lower.contains("no activity found")
            || lower.contains("unable to resolve intent")
        {
            Self::NoInstallerAvailable
        } else if lower.contains("permission") || lower.contains("securityexception") {
            Self::PermissionDenied
        } else {
            Self::Unknown(message.trim().to_owned())
        }
    }
}

/// Starts installation of a downloaded package.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    fn capability(&self) -> InstallCapability;

    /// Hand `artifact` to the system installer. Success means the installer
    /// was launched, not that the package was installed.
    async fn install(&self, artifact: &Path) -> Result<(), InstallError>;
}

/// An intent to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallIntent {
    pub action: String,
    pub data_uri: String,
    pub mime_type: String,
    pub flags: u32,
}

impl InstallIntent {
    /// The package install intent for `data_uri`.
    pub fn view_package(data_uri: String) -> Self {
        Self {
            action: VIEW_ACTION.to_owned(),
            data_uri,
            mime_type: PACKAGE_MIME_TYPE.to_owned(),
            flags: FLAG_ACTIVITY_NEW_TASK | FLAG_GRANT_READ_URI_PERMISSION,
        }
    }
}

/// Failure reported by an [`InstallHost`], as free text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

/// Platform services an [`IntentInstaller`] needs.
#[async_trait]
pub trait InstallHost: Send + Sync {
    /// A URI other apps can read `artifact` through.
    async fn content_uri(&self, artifact: &Path) -> Result<String, HostError>;

    async fn launch(&self, intent: &InstallIntent) -> Result<(), HostError>;
}

/// Installs by launching a package `VIEW` intent through `H`.
pub struct IntentInstaller<H> {
    host: H,
}

impl<H: InstallHost> IntentInstaller<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }
}

#[async_trait]
impl<H: InstallHost> PackageInstaller for IntentInstaller<H> {
    fn capability(&self) -> InstallCapability {
        InstallCapability::CanInstallPackages
    }

    async fn install(&self, artifact: &Path) -> Result<(), InstallError> {
        if !tokio::fs::try_exists(artifact).await.unwrap_or(false) {
            return Err(InstallError::ArtifactNotFound(artifact.to_path_buf()));
        }

        let uri = self
            .host
            .content_uri(artifact)
            .await
            .map_err(|e| InstallError::classify(&e.0))?;
        let intent = InstallIntent::view_package(uri);
        tracing::info!(uri = %intent.data_uri, flags = intent.flags, "launching package installer");

        self.host
            .launch(&intent)
            .await
            .map_err(|e| InstallError::classify(&e.0))
    }
}

/// Create the installer for the current platform.
///
/// Android hosts with a configured content authority get an
/// [`IntentInstaller`]; every other host gets an [`UnsupportedInstaller`].
pub fn platform_installer(
    authority: Option<&str>,
    shared_root: &Path,
) -> Box<dyn PackageInstaller> {
    #[cfg(target_os = "android")]
    {
        match authority {
            Some(authority) => Box::new(IntentInstaller::new(ActivityManagerHost::new(
                authority,
                shared_root,
            ))),
            None => Box::new(UnsupportedInstaller),
        }
    }
    #[cfg(not(target_os = "android"))]
    {
        let _ = (authority, shared_root);
        Box::new(UnsupportedInstaller)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHost {
        launch_error: Option<String>,
        launched: Mutex<Vec<InstallIntent>>,
    }

    #[async_trait]
    impl InstallHost for FakeHost {
        async fn content_uri(&self, artifact: &Path) -> Result<String, HostError> {
            let name = artifact.file_name().unwrap().to_string_lossy();
            Ok(format!("content://test.provider/{name}"))
        }

        async fn launch(&self, intent: &InstallIntent) -> Result<(), HostError> {
            self.launched.lock().unwrap().push(intent.clone());
            match &self.launch_error {
                Some(msg) => Err(HostError(msg.clone())),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn classify_host_messages() {
        assert_eq!(
            InstallError::classify("android.content.ActivityNotFoundException: Activity not found"),
            InstallError::NoInstallerAvailable
        );
        assert_eq!(
            InstallError::classify("Error: Activity not started, unable to resolve Intent"),
            InstallError::NoInstallerAvailable
        );
        assert_eq!(
            InstallError::classify("java.lang.SecurityException: Permission Denial"),
            InstallError::PermissionDenied
        );
        assert_eq!(
            InstallError::classify("  boom  "),
            InstallError::Unknown("boom".to_owned())
        );
    }

    #[test]
    fn view_intent_carries_package_mime_and_flags() {
        let intent = InstallIntent::view_package("content://a/b.apk".to_owned());
        assert_eq!(intent.action, "android.intent.action.VIEW");
        assert_eq!(intent.mime_type, "application/vnd.android.package-archive");
        assert_eq!(intent.flags, 0x1000_0001);
    }

    #[tokio::test]
    async fn missing_artifact_is_reported_before_launch() {
        let installer = IntentInstaller::new(FakeHost::default());
        let err = installer
            .install(Path::new("/nonexistent/App_v1.0.apk"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::ArtifactNotFound(_)));
        assert!(installer.host.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn install_launches_view_intent() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("App_v1.3.11.002.apk");
        std::fs::write(&artifact, b"pkg").unwrap();

        let installer = IntentInstaller::new(FakeHost::default());
        assert_eq!(installer.capability(), InstallCapability::CanInstallPackages);
        installer.install(&artifact).await.unwrap();

        let launched = installer.host.launched.lock().unwrap();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].data_uri, "content://test.provider/App_v1.3.11.002.apk");
    }

    #[tokio::test]
    async fn launch_failure_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("App_v1.0.apk");
        std::fs::write(&artifact, b"pkg").unwrap();

        let installer = IntentInstaller::new(FakeHost {
            launch_error: Some("No Activity found to handle Intent".to_owned()),
            ..Default::default()
        });
        assert_eq!(
            installer.install(&artifact).await.unwrap_err(),
            InstallError::NoInstallerAvailable
        );
    }

    #[cfg(not(target_os = "android"))]
    #[tokio::test]
    async fn platform_installer_is_unsupported_off_android() {
        let installer = platform_installer(Some("app.provider"), Path::new("/tmp"));
        assert_eq!(installer.capability(), InstallCapability::Unsupported);
        assert_eq!(
            installer.install(Path::new("/tmp/x.apk")).await.unwrap_err(),
            InstallError::Unsupported
        );
    }
}
