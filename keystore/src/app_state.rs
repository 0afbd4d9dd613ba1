use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::biometric::{BiometricAuthenticator, BiometricGate, BiometricStatus};
use crate::clock::{Clock, SystemClock};
use crate::config_store::{ConfigOverrides, ConfigStore, KeystoreConfig};
use crate::crypto::CryptoEngine;
use crate::errors::WalletResult;
use crate::session::{SessionGuard, SessionOptions};
use crate::storage::{ChunkedSecureStore, FileSecureStore, SecureStore, StorePaths};
use crate::timer::{Scheduler, TokioScheduler};
use crate::wallet_store::WalletStore;

const ENV_KEYSTORE_ENV: &str = "KEYSTORE_ENV";

/// Everything a host needs, wired from one root directory.
#[derive(Debug)]
pub struct KeystoreContext {
    paths: StorePaths,
    config_store: ConfigStore,
    config: KeystoreConfig,
    overrides: ConfigOverrides,
    wallets: Arc<WalletStore>,
    session: SessionGuard,
    environment: String,
}

impl KeystoreContext {
    /// Initialise with the system clock and a tokio scheduler bound to the
    /// current runtime.
    pub fn initialize(root_dir: PathBuf) -> WalletResult<Self> {
        let scheduler = TokioScheduler::current()?;
        Self::initialize_with(root_dir, Arc::new(SystemClock), Arc::new(scheduler))
    }

    pub fn initialize_with(
        root_dir: PathBuf,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> WalletResult<Self> {
        Self::build(
            root_dir,
            CryptoEngine::new(clock.clone()),
            ConfigOverrides::from_env(),
            clock,
            scheduler,
        )
    }

    pub(crate) fn build(
        root_dir: PathBuf,
        crypto: CryptoEngine,
        overrides: ConfigOverrides,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> WalletResult<Self> {
        let environment =
            std::env::var(ENV_KEYSTORE_ENV).unwrap_or_else(|_| "development".to_string());
        let paths = StorePaths::new(&root_dir)?;
        paths.ensure_directories()?;

        let config_store = ConfigStore::from_paths(&paths);
        let mut config = config_store.load_or_default(environment.clone())?;
        overrides.apply(&mut config)?;

        let wallets = Arc::new(
            WalletStore::new(secure_store_for(&paths, &config)?, crypto)
                .with_storage_key(config.storage.storage_key.clone())?
                .with_bip39_validation(config.storage.require_bip39),
        );
        let session = SessionGuard::new(
            wallets.clone(),
            clock,
            scheduler,
            SessionOptions::from(&config.session),
        );

        log::info!(
            "Keystore initialised at {} ({} environment)",
            paths.root_dir().display(),
            environment
        );
        Ok(Self {
            paths,
            config_store,
            config,
            overrides,
            wallets,
            session,
            environment,
        })
    }

    pub fn wallets(&self) -> &Arc<WalletStore> {
        &self.wallets
    }

    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config_store
    }

    pub fn config(&self) -> &KeystoreConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Install the platform biometric prompt, subject to configuration.
    pub fn attach_biometrics(&self, authenticator: Arc<dyn BiometricAuthenticator>) {
        self.session.set_biometrics(Some(BiometricGate::new(
            authenticator,
            self.config.session.biometrics_enabled,
        )));
    }

    pub fn biometric_status(&self) -> BiometricStatus {
        self.session
            .biometrics()
            .map(|gate| gate.status())
            .unwrap_or_else(BiometricStatus::unavailable)
    }

    /// Persist a config change. Session settings that can change live (the
    /// auto-lock timeout and biometric policy) apply immediately; the rest
    /// take effect on the next initialisation. Startup overrides still win
    /// over the persisted values, and the returned config reflects them.
    pub fn update_config<F>(&mut self, updater: F) -> WalletResult<KeystoreConfig>
    where
        F: FnOnce(&mut KeystoreConfig) -> WalletResult<()>,
    {
        let mut updated = self
            .config_store
            .update(self.environment.clone(), updater)?;
        self.overrides.apply(&mut updated)?;
        self.session
            .set_auto_lock_timeout(updated.session.auto_lock_timeout());
        if let Some(gate) = self.session.biometrics() {
            self.session.set_biometrics(Some(BiometricGate::new(
                gate.authenticator(),
                updated.session.biometrics_enabled,
            )));
        }
        self.config = updated.clone();
        Ok(updated)
    }
}

fn secure_store_for(
    paths: &StorePaths,
    config: &KeystoreConfig,
) -> WalletResult<Arc<dyn SecureStore>> {
    let files = FileSecureStore::from_paths(paths);
    if config.storage.chunk_bytes == 0 {
        return Ok(Arc::new(files));
    }
    Ok(Arc::new(ChunkedSecureStore::new(
        files,
        config.storage.chunk_bytes,
    )?))
}

/// Keystore context shared between host command handlers.
#[derive(Debug, Clone)]
pub struct SharedKeystoreContext(pub Arc<RwLock<KeystoreContext>>);

impl SharedKeystoreContext {
    pub fn new(inner: KeystoreContext) -> Self {
        Self(Arc::new(RwLock::new(inner)))
    }

    pub fn read<F, T>(&self, op: F) -> WalletResult<T>
    where
        F: FnOnce(&KeystoreContext) -> WalletResult<T>,
    {
        let guard = self.0.read();
        op(&guard)
    }

    pub fn write<F, T>(&self, op: F) -> WalletResult<T>
    where
        F: FnOnce(&mut KeystoreContext) -> WalletResult<T>,
    {
        let mut guard = self.0.write();
        op(&mut guard)
    }
}
