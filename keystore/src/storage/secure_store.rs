/// Byte-oriented secure key-value storage.
///
/// Hosts provide the platform keychain through [`SecureStore`]. Two backends
/// ship with the crate: an in-memory map and a directory of owner-only files.
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use zeroize::Zeroizing;

use super::StorePaths;
use crate::errors::{WalletError, WalletResult};

static STORAGE_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,128}$").expect("storage key pattern is valid"));

/// Secure key-value store supplied by the host platform.
pub trait SecureStore: fmt::Debug + Send + Sync {
    fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> WalletResult<()>;
    fn delete(&self, key: &str) -> WalletResult<()>;
}

impl<T: SecureStore + ?Sized> SecureStore for Arc<T> {
    fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> WalletResult<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> WalletResult<()> {
        (**self).delete(key)
    }
}

/// Check that a key is usable by every backend (including as a file name).
pub fn validate_storage_key(key: &str) -> WalletResult<()> {
    if !STORAGE_KEY_PATTERN.is_match(key) || key.starts_with('.') {
        return Err(WalletError::ValidationError(format!(
            "Invalid storage key '{}'",
            key
        )));
    }
    Ok(())
}

/// Volatile store used by tests and hosts without persistent secure storage.
#[derive(Default)]
pub struct MemorySecureStore {
    entries: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for MemorySecureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySecureStore")
            .field("entries", &self.len())
            .finish()
    }
}

impl SecureStore for MemorySecureStore {
    fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>> {
        validate_storage_key(key)?;
        Ok(self.entries.read().get(key).map(|value| value.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> WalletResult<()> {
        validate_storage_key(key)?;
        self.entries
            .write()
            .insert(key.to_string(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &str) -> WalletResult<()> {
        validate_storage_key(key)?;
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Store keeping each entry in its own file, written atomically.
#[derive(Debug, Clone)]
pub struct FileSecureStore {
    dir: PathBuf,
}

impl FileSecureStore {
    const ENTRY_EXTENSION: &'static str = "entry";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn from_paths(paths: &StorePaths) -> Self {
        Self::new(paths.secure_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> WalletResult<PathBuf> {
        validate_storage_key(key)?;
        Ok(self
            .dir
            .join(format!("{}.{}", key, Self::ENTRY_EXTENSION)))
    }
}

impl SecureStore for FileSecureStore {
    fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> WalletResult<()> {
        let path = self.entry_path(key)?;
        let mut file = create_atomic_file(&path)?;
        file.write_all(value)?;
        file.sync_all()?;
        finalize_atomic_file(file, &path)?;
        log::debug!("Persisted secure entry {} ({} bytes)", key, value.len());
        Ok(())
    }

    fn delete(&self, key: &str) -> WalletResult<()> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn create_atomic_file(path: &Path) -> WalletResult<File> {
    let dir = path
        .parent()
        .ok_or_else(|| WalletError::StorageFailure("Invalid entry path".to_string()))?;
    fs::create_dir_all(dir)?;
    let tmp_path = path.with_extension("new");
    let file = File::create(&tmp_path)?;
    restrict_file(&tmp_path)?;
    Ok(file)
}

fn finalize_atomic_file(mut file: File, final_path: &Path) -> WalletResult<()> {
    file.flush()?;
    drop(file);
    let tmp_path = final_path.with_extension("new");
    fs::rename(tmp_path, final_path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> WalletResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> WalletResult<()> {
    Ok(())
}
