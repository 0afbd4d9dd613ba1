use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{WalletError, WalletResult};

/// Manages filesystem paths used by the key store.
#[derive(Debug, Clone)]
pub struct StorePaths {
    /// Root directory for key store data.
    root_dir: PathBuf,
    /// Directory holding one file per secure-storage entry.
    secure_dir: PathBuf,
    /// Path to persisted key store configuration.
    config_file: PathBuf,
}

impl StorePaths {
    /// Directory name for secure-storage entries.
    pub const SECURE_DIRNAME: &'static str = "secure";
    /// Default configuration file name.
    pub const CONFIG_FILENAME: &'static str = "keystore.config";

    /// Create a new path manager rooted at the provided directory.
    pub fn new(root: impl AsRef<Path>) -> WalletResult<Self> {
        let root_dir = root.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(WalletError::StorageFailure(
                "Key store root directory cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            secure_dir: root_dir.join(Self::SECURE_DIRNAME),
            config_file: root_dir.join(Self::CONFIG_FILENAME),
            root_dir,
        })
    }

    /// Ensure the directory structure exists, creating missing folders.
    pub fn ensure_directories(&self) -> WalletResult<()> {
        fs::create_dir_all(&self.root_dir)?;
        fs::create_dir_all(&self.secure_dir)?;
        restrict_directory(&self.secure_dir)?;
        Ok(())
    }

    pub fn secure_dir(&self) -> &Path {
        &self.secure_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

#[cfg(unix)]
fn restrict_directory(dir: &Path) -> WalletResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_directory(_dir: &Path) -> WalletResult<()> {
    Ok(())
}
