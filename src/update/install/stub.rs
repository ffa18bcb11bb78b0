//! Installer for hosts that cannot install packages.

use super::{InstallCapability, InstallError, PackageInstaller};
use async_trait::async_trait;
use std::path::Path;

/// Always reports [`InstallError::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedInstaller;

#[async_trait]
impl PackageInstaller for UnsupportedInstaller {
    fn capability(&self) -> InstallCapability {
        InstallCapability::Unsupported
    }

    async fn install(&self, _artifact: &Path) -> Result<(), InstallError> {
        Err(InstallError::Unsupported)
    }
}
