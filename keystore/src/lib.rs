// lib.rs - Encrypted multi-wallet key store and session guard

pub mod app_state;
pub mod biometric;
pub mod clock;
pub mod config_store;
pub mod crypto;
pub mod errors;
pub mod lifecycle;
pub mod session;
pub mod storage;
pub mod timer;
pub mod validation;
pub mod wallet_store;

// Re-export common types
pub use app_state::{KeystoreContext, SharedKeystoreContext};
pub use biometric::{
    BiometricAuthenticator, BiometricFactor, BiometricGate, BiometricStatus,
    ScriptedAuthenticator,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config_store::{
    ConfigOverrides, ConfigStore, KeystoreConfig, SessionConfig, StorageConfig,
};
pub use crypto::{CryptoEngine, EncryptedBlob, IntegrityReport, SymmetricKey};
pub use errors::{WalletError, WalletResult};
pub use lifecycle::{spawn_lifecycle_watcher, AppLifecycle};
pub use session::{
    LockReason, SessionEvent, SessionGuard, SessionOptions, SessionState, UnlockMethod,
};
pub use storage::{
    ChunkedSecureStore, FileSecureStore, MemorySecureStore, MultiWalletStorage, SecureStore,
    StorePaths,
};
pub use timer::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use validation::InputValidator;
pub use wallet_store::{ActiveWalletInfo, MasterKeySummary, UnlockedMasterKey, WalletStore};
