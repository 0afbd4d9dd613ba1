use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};
use crate::storage::{validate_storage_key, StorePaths};
use crate::wallet_store::DEFAULT_STORAGE_KEY;

const CONFIG_VERSION: u16 = 1;

const ENV_AUTO_LOCK_SECONDS: &str = "KEYSTORE_AUTO_LOCK_SECONDS";
const ENV_MAX_FAILED_ATTEMPTS: &str = "KEYSTORE_MAX_FAILED_ATTEMPTS";
const ENV_ENABLE_BIOMETRICS: &str = "KEYSTORE_ENABLE_BIOMETRICS";
const ENV_CHUNK_BYTES: &str = "KEYSTORE_CHUNK_BYTES";
const OVERRIDE_KEYS: [&str; 4] = [
    ENV_AUTO_LOCK_SECONDS,
    ENV_MAX_FAILED_ATTEMPTS,
    ENV_ENABLE_BIOMETRICS,
    ENV_CHUNK_BYTES,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Seconds of inactivity before the session locks. 0 disables auto-lock.
    pub auto_lock_seconds: u64,
    pub max_failed_attempts: u32,
    pub backoff_base_millis: u64,
    pub backoff_cap_millis: u64,
    pub biometrics_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_lock_seconds: 300,
            max_failed_attempts: 5,
            backoff_base_millis: 1_000,
            backoff_cap_millis: 32_000,
            biometrics_enabled: false,
        }
    }
}

impl SessionConfig {
    pub fn auto_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_lock_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_millis)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_millis.max(self.backoff_base_millis))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub storage_key: String,
    /// Largest value written to one secure-store entry. 0 disables chunking.
    pub chunk_bytes: usize,
    pub require_bip39: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            chunk_bytes: 2_048,
            require_bip39: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystoreConfig {
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub environment: String,
    pub last_updated: DateTime<Utc>,
    pub version: u16,
}

impl KeystoreConfig {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            environment: environment.into(),
            last_updated: Utc::now(),
            version: CONFIG_VERSION,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn validate(&self) -> WalletResult<()> {
        if self.session.max_failed_attempts == 0 {
            return Err(WalletError::ValidationError(
                "max_failed_attempts must be at least 1".to_string(),
            ));
        }
        validate_storage_key(&self.storage.storage_key)
    }

    /// Apply overrides from any key lookup. Values carrying control
    /// characters are ignored; malformed values are rejected.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> WalletResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| -> Option<String> {
            let value = lookup(key)?;
            if value.chars().any(|c| c.is_control()) {
                log::warn!("Ignoring {} override containing control characters", key);
                return None;
            }
            Some(value.trim().to_string())
        };

        if let Some(value) = read(ENV_AUTO_LOCK_SECONDS) {
            self.session.auto_lock_seconds = parse_u64_value(&value, ENV_AUTO_LOCK_SECONDS)?;
        }
        if let Some(value) = read(ENV_MAX_FAILED_ATTEMPTS) {
            let attempts = parse_u64_value(&value, ENV_MAX_FAILED_ATTEMPTS)?;
            self.session.max_failed_attempts = u32::try_from(attempts).map_err(|_| {
                WalletError::ValidationError(format!(
                    "Configuration key '{}' is out of range",
                    ENV_MAX_FAILED_ATTEMPTS
                ))
            })?;
        }
        if let Some(value) = read(ENV_ENABLE_BIOMETRICS) {
            self.session.biometrics_enabled = parse_bool_flag(&value, ENV_ENABLE_BIOMETRICS)?;
        }
        if let Some(value) = read(ENV_CHUNK_BYTES) {
            let bytes = parse_u64_value(&value, ENV_CHUNK_BYTES)?;
            self.storage.chunk_bytes = usize::try_from(bytes).map_err(|_| {
                WalletError::ValidationError(format!(
                    "Configuration key '{}' is out of range",
                    ENV_CHUNK_BYTES
                ))
            })?;
        }

        self.validate()
    }
}

/// `KEYSTORE_*` overrides captured once at startup. They sit on top of
/// whatever config is on disk and are re-applied after every reload, so a
/// persisted update never silently undoes them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    values: HashMap<String, String>,
}

impl ConfigOverrides {
    pub fn none() -> Self {
        Self::default()
    }

    /// Snapshot the override variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_pairs(
            OVERRIDE_KEYS
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|value| (*key, value))),
        )
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .filter(|(key, _)| OVERRIDE_KEYS.contains(&key.as_str()))
            .collect();
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn apply(&self, config: &mut KeystoreConfig) -> WalletResult<()> {
        config.apply_overrides(|key| self.values.get(key).cloned())
    }
}

fn parse_bool_flag(value: &str, key: &str) -> WalletResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WalletError::ValidationError(format!(
            "Configuration key '{}' expects a boolean, got '{}'",
            key, value
        ))),
    }
}

fn parse_u64_value(value: &str, key: &str) -> WalletResult<u64> {
    value.parse::<u64>().map_err(|_| {
        WalletError::ValidationError(format!(
            "Configuration key '{}' expects an unsigned integer, got '{}'",
            key, value
        ))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: KeystoreConfig,
    modified_at_unix: i64,
}

/// Handles persistence of keystore configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_paths(paths: &StorePaths) -> Self {
        Self {
            path: paths.config_file().to_path_buf(),
        }
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load_or_default(&self, environment: impl Into<String>) -> WalletResult<KeystoreConfig> {
        if !self.path.exists() {
            let config = KeystoreConfig::new(environment);
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != CONFIG_VERSION {
            return Err(WalletError::ValidationError(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(WalletError::ValidationError(
                "Config integrity verification failed".to_string(),
            ));
        }

        envelope.payload.validate()?;
        Ok(envelope.payload)
    }

    pub fn save(&self, config: &KeystoreConfig) -> WalletResult<()> {
        config.validate()?;
        let mut payload = config.clone();
        payload.touch();

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(&payload)?,
            modified_at_unix: payload.last_updated.timestamp(),
            payload,
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        let tmp_path = self.path.with_extension("new");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &self.path)?;
        log::debug!("Saved keystore config to {}", self.path.display());
        Ok(())
    }

    pub fn update<F>(
        &self,
        environment: impl Into<String>,
        updater: F,
    ) -> WalletResult<KeystoreConfig>
    where
        F: FnOnce(&mut KeystoreConfig) -> WalletResult<()>,
    {
        let mut config = self.load_or_default(environment)?;
        updater(&mut config)?;
        config.touch();
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &KeystoreConfig) -> WalletResult<[u8; 32]> {
    let mut hasher = Blake3::new();
    let encoded = serde_json::to_vec(config)?;
    hasher.update(&encoded);
    Ok(*hasher.finalize().as_bytes())
}
