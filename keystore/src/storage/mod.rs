pub mod chunked;
pub mod paths;
pub mod schema;
pub mod secure_store;

pub use chunked::ChunkedSecureStore;
pub use paths::StorePaths;
pub use schema::{
    MasterKeyEntry, MultiWalletStorage, SubWalletEntry, MAIN_WALLET_INDEX, MAIN_WALLET_NICKNAME,
    MAX_SUB_WALLETS, STORAGE_VERSION,
};
pub use secure_store::{validate_storage_key, FileSecureStore, MemorySecureStore, SecureStore};
