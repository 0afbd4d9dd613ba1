/// Persisted hierarchy of master keys and their sub-wallets.
///
/// Every operation loads the root document fresh from secure storage.
/// Mutations run load → validate → mutate → persist under one process-wide
/// writer lock, so concurrent callers never lose each other's updates, and a
/// failed operation never writes.
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoEngine};
use crate::errors::{WalletError, WalletResult};
use crate::storage::{
    validate_storage_key, MasterKeyEntry, MultiWalletStorage, SecureStore, SubWalletEntry,
    MAIN_WALLET_INDEX, MAIN_WALLET_NICKNAME,
};
use crate::validation::InputValidator;

/// Secure-storage key holding the root document.
pub const DEFAULT_STORAGE_KEY: &str = "multi_wallet_storage";

/// Currently selected wallet, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWalletInfo {
    pub master_key_id: Uuid,
    pub master_key_nickname: String,
    pub sub_wallet_index: u8,
    pub sub_wallet_nickname: String,
}

/// Master key metadata without the sealed mnemonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeySummary {
    pub id: Uuid,
    pub nickname: String,
    pub is_active: bool,
    pub sub_wallets: Vec<SubWalletEntry>,
    pub archived_sub_wallets: Vec<SubWalletEntry>,
    pub created_at: i64,
    pub last_used_at: i64,
    pub sealed_at: i64,
    pub is_expanded: bool,
    pub can_create_sub_wallets: bool,
}

/// A master key opened with the right PIN.
pub struct UnlockedMasterKey {
    pub id: Uuid,
    pub mnemonic: Zeroizing<String>,
}

impl std::fmt::Debug for UnlockedMasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedMasterKey")
            .field("id", &self.id)
            .field("mnemonic", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct WalletStore {
    store: Arc<dyn SecureStore>,
    crypto: CryptoEngine,
    validator: InputValidator,
    storage_key: String,
    require_bip39: bool,
    write_lock: Mutex<()>,
}

impl WalletStore {
    pub fn new(store: Arc<dyn SecureStore>, crypto: CryptoEngine) -> Self {
        Self {
            store,
            crypto,
            validator: InputValidator::new(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            require_bip39: false,
            write_lock: Mutex::new(()),
        }
    }

    /// Keep the root document under a different secure-storage key.
    pub fn with_storage_key(mut self, key: impl Into<String>) -> WalletResult<Self> {
        let key = key.into();
        validate_storage_key(&key)?;
        self.storage_key = key;
        Ok(self)
    }

    /// Reject mnemonics that are not valid English BIP39 phrases.
    pub fn with_bip39_validation(mut self, enabled: bool) -> Self {
        self.require_bip39 = enabled;
        self
    }

    pub fn crypto(&self) -> &CryptoEngine {
        &self.crypto
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn now(&self) -> i64 {
        self.crypto.clock().now_millis()
    }

    fn load(&self) -> WalletResult<Option<MultiWalletStorage>> {
        match self.store.get(&self.storage_key)? {
            Some(bytes) => Ok(Some(MultiWalletStorage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn persist(&self, storage: &MultiWalletStorage) -> WalletResult<()> {
        storage.validate()?;
        let encoded = Zeroizing::new(storage.encode()?);
        self.store.set(&self.storage_key, &encoded)
    }

    /// Run `op` against a private copy of the root and persist the result only
    /// if `op` succeeds.
    fn mutate<T, F>(&self, op: F) -> WalletResult<T>
    where
        F: FnOnce(&mut MultiWalletStorage, i64) -> WalletResult<T>,
    {
        let _guard = self.write_lock.lock();
        let mut storage = self
            .load()?
            .ok_or_else(|| WalletError::NotFound("No master keys stored".to_string()))?;
        let result = op(&mut storage, self.now())?;
        self.persist(&storage)?;
        Ok(result)
    }

    fn open(&self, entry: &MasterKeyEntry, pin: &SecretString) -> WalletResult<Zeroizing<String>> {
        let mnemonic = self
            .crypto
            .decrypt(&entry.encrypted_mnemonic, pin)
            .map_err(|_| {
                WalletError::Unauthorized(format!("PIN does not open master key {}", entry.id))
            })?;
        self.crypto
            .validate_integrity(entry.encrypted_mnemonic.timestamp);
        Ok(mnemonic)
    }

    pub fn exists(&self) -> WalletResult<bool> {
        Ok(self.load()?.is_some())
    }

    pub fn create_master_key(
        &self,
        mnemonic: &SecretString,
        nickname: &str,
        pin: &SecretString,
    ) -> WalletResult<Uuid> {
        let nickname = self.validator.validate_nickname(nickname)?;
        self.validator.validate_new_pin(pin)?;
        self.validator.validate_mnemonic_text(mnemonic)?;
        if self.require_bip39 {
            crypto::validate_mnemonic(mnemonic.expose_secret())?;
        }

        let encrypted_mnemonic = self.crypto.encrypt(mnemonic.expose_secret(), pin)?;

        let _guard = self.write_lock.lock();
        let now = self.now();
        let entry = MasterKeyEntry {
            id: self.crypto.generate_id(),
            nickname,
            encrypted_mnemonic,
            sub_wallets: vec![SubWalletEntry::new(
                MAIN_WALLET_INDEX,
                MAIN_WALLET_NICKNAME,
                now,
            )],
            archived_sub_wallets: Vec::new(),
            created_at: now,
            last_used_at: now,
            is_expanded: false,
            can_create_sub_wallets: true,
        };
        let id = entry.id;

        let storage = match self.load()? {
            Some(mut storage) => {
                storage.master_keys.push(entry);
                storage
            }
            None => MultiWalletStorage::new(entry),
        };
        self.persist(&storage)?;

        log::info!(
            "Created master key {} ({} master keys stored)",
            id,
            storage.master_keys.len()
        );
        Ok(id)
    }

    pub fn get_master_key_mnemonic(
        &self,
        id: &Uuid,
        pin: &SecretString,
    ) -> WalletResult<Zeroizing<String>> {
        let storage = self
            .load()?
            .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
        let entry = storage
            .master_key(id)
            .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
        self.open(entry, pin)
    }

    /// Check a PIN against one master key without returning the secret.
    pub fn verify_pin(&self, id: &Uuid, pin: &SecretString) -> WalletResult<bool> {
        let storage = self
            .load()?
            .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
        let entry = storage
            .master_key(id)
            .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
        Ok(self.crypto.verify_pin(&entry.encrypted_mnemonic, pin))
    }

    /// Try the PIN against the active master key, then every other one.
    /// A match on a non-active key makes it active at its main wallet.
    pub fn try_unlock_any_master_key(
        &self,
        pin: &SecretString,
    ) -> WalletResult<Option<UnlockedMasterKey>> {
        let Some(storage) = self.load()? else {
            return Ok(None);
        };

        let active_id = storage.active_master_key_id;
        let candidates = storage
            .active_master_key()
            .into_iter()
            .chain(storage.master_keys.iter().filter(|entry| entry.id != active_id));

        for entry in candidates {
            let Ok(mnemonic) = self.open(entry, pin) else {
                continue;
            };

            if entry.id != active_id {
                let id = entry.id;
                self.mutate(|storage, now| {
                    let promoted = storage.master_key_mut(&id).ok_or_else(|| {
                        WalletError::NotFound(format!("Master key {}", id))
                    })?;
                    promoted.last_used_at = now;
                    storage.active_master_key_id = id;
                    storage.active_sub_wallet_index = MAIN_WALLET_INDEX;
                    Ok(())
                })?;
                log::info!("PIN matched master key {}; promoted to active", id);
            }

            return Ok(Some(UnlockedMasterKey {
                id: entry.id,
                mnemonic,
            }));
        }

        Ok(None)
    }

    pub fn remove_master_key(&self, id: &Uuid) -> WalletResult<()> {
        self.mutate(|storage, _| {
            let position = storage
                .master_keys
                .iter()
                .position(|entry| &entry.id == id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            if storage.master_keys.len() == 1 {
                return Err(WalletError::InvariantViolation(
                    "Cannot remove the last master key".to_string(),
                ));
            }

            storage.master_keys.remove(position);
            if &storage.active_master_key_id == id {
                storage.active_master_key_id = storage.master_keys[0].id;
                storage.active_sub_wallet_index = MAIN_WALLET_INDEX;
            }
            Ok(())
        })?;
        log::info!("Removed master key {}", id);
        Ok(())
    }

    pub fn rename_master_key(&self, id: &Uuid, nickname: &str) -> WalletResult<()> {
        let nickname = self.validator.validate_nickname(nickname)?;
        self.mutate(|storage, _| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            entry.nickname = nickname;
            Ok(())
        })
    }

    /// Rename an active or archived sub-wallet.
    pub fn rename_sub_wallet(&self, id: &Uuid, index: u8, nickname: &str) -> WalletResult<()> {
        let nickname = self.validator.validate_nickname(nickname)?;
        self.mutate(|storage, _| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            let sub_wallet = entry
                .sub_wallets
                .iter_mut()
                .chain(entry.archived_sub_wallets.iter_mut())
                .find(|sub_wallet| sub_wallet.index == index)
                .ok_or_else(|| {
                    WalletError::NotFound(format!("Sub-wallet {} of master key {}", index, id))
                })?;
            sub_wallet.nickname = nickname;
            Ok(())
        })
    }

    pub fn add_sub_wallet(&self, id: &Uuid, nickname: &str) -> WalletResult<u8> {
        let nickname = self.validator.validate_nickname(nickname)?;
        let index = self.mutate(|storage, now| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            if !entry.can_create_sub_wallets {
                return Err(WalletError::PermissionDenied(format!(
                    "Master key {} does not allow sub-wallets",
                    id
                )));
            }
            let index = entry.next_free_index().ok_or_else(|| {
                WalletError::LimitExceeded(format!(
                    "Master key {} has no free sub-wallet index",
                    id
                ))
            })?;

            entry
                .sub_wallets
                .push(SubWalletEntry::new(index, nickname, now));
            entry.sub_wallets.sort_by_key(|sub_wallet| sub_wallet.index);
            Ok(index)
        })?;
        log::debug!("Added sub-wallet {} to master key {}", index, id);
        Ok(index)
    }

    pub fn archive_sub_wallet(&self, id: &Uuid, index: u8) -> WalletResult<()> {
        self.mutate(|storage, now| {
            let is_active_master = &storage.active_master_key_id == id;
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            let position = entry
                .sub_wallets
                .iter()
                .position(|sub_wallet| sub_wallet.index == index)
                .ok_or_else(|| {
                    WalletError::NotFound(format!("Sub-wallet {} of master key {}", index, id))
                })?;
            if index == MAIN_WALLET_INDEX {
                return Err(WalletError::InvariantViolation(
                    "The main wallet cannot be archived".to_string(),
                ));
            }

            let mut sub_wallet = entry.sub_wallets.remove(position);
            sub_wallet.archived_at = Some(now);
            entry.archived_sub_wallets.push(sub_wallet);

            if is_active_master && storage.active_sub_wallet_index == index {
                storage.active_sub_wallet_index = MAIN_WALLET_INDEX;
            }
            Ok(())
        })
    }

    pub fn restore_sub_wallet(&self, id: &Uuid, index: u8) -> WalletResult<()> {
        self.mutate(|storage, _| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            let position = entry
                .archived_sub_wallets
                .iter()
                .position(|sub_wallet| sub_wallet.index == index)
                .ok_or_else(|| {
                    WalletError::NotFound(format!(
                        "Archived sub-wallet {} of master key {}",
                        index, id
                    ))
                })?;

            let mut sub_wallet = entry.archived_sub_wallets.remove(position);
            sub_wallet.archived_at = None;
            entry.sub_wallets.push(sub_wallet);
            entry.sub_wallets.sort_by_key(|sub_wallet| sub_wallet.index);
            Ok(())
        })
    }

    pub fn set_active_wallet(&self, id: &Uuid, index: u8) -> WalletResult<()> {
        self.mutate(|storage, now| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            let sub_wallet = entry.sub_wallet_mut(index).ok_or_else(|| {
                WalletError::NotFound(format!("Sub-wallet {} of master key {}", index, id))
            })?;

            sub_wallet.last_used_at = now;
            entry.last_used_at = now;
            storage.active_master_key_id = *id;
            storage.active_sub_wallet_index = index;
            Ok(())
        })
    }

    pub fn get_active_wallet_info(&self) -> WalletResult<Option<ActiveWalletInfo>> {
        let Some(storage) = self.load()? else {
            return Ok(None);
        };
        let info = storage.active_master_key().and_then(|entry| {
            entry
                .sub_wallet(storage.active_sub_wallet_index)
                .map(|sub_wallet| ActiveWalletInfo {
                    master_key_id: entry.id,
                    master_key_nickname: entry.nickname.clone(),
                    sub_wallet_index: sub_wallet.index,
                    sub_wallet_nickname: sub_wallet.nickname.clone(),
                })
        });
        Ok(info)
    }

    pub fn active_master_key_id(&self) -> WalletResult<Option<Uuid>> {
        Ok(self.load()?.map(|storage| storage.active_master_key_id))
    }

    pub fn list_master_keys(&self) -> WalletResult<Vec<MasterKeySummary>> {
        let Some(storage) = self.load()? else {
            return Ok(Vec::new());
        };
        Ok(storage
            .master_keys
            .iter()
            .map(|entry| MasterKeySummary {
                id: entry.id,
                nickname: entry.nickname.clone(),
                is_active: entry.id == storage.active_master_key_id,
                sub_wallets: entry.sub_wallets.clone(),
                archived_sub_wallets: entry.archived_sub_wallets.clone(),
                created_at: entry.created_at,
                last_used_at: entry.last_used_at,
                sealed_at: entry.encrypted_mnemonic.timestamp,
                is_expanded: entry.is_expanded,
                can_create_sub_wallets: entry.can_create_sub_wallets,
            })
            .collect())
    }

    /// Re-encrypt one master key's mnemonic under a new PIN.
    pub fn change_pin(
        &self,
        id: &Uuid,
        current_pin: &SecretString,
        new_pin: &SecretString,
    ) -> WalletResult<()> {
        self.validator.validate_new_pin(new_pin)?;
        let mnemonic = self.get_master_key_mnemonic(id, current_pin)?;
        let resealed = self.crypto.encrypt(&mnemonic, new_pin)?;
        let sealed_with = self
            .load()?
            .and_then(|storage| storage.master_key(id).map(|e| e.encrypted_mnemonic.clone()));

        self.mutate(|storage, _| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            // Refuse if another writer resealed the key since we opened it.
            if Some(&entry.encrypted_mnemonic) != sealed_with.as_ref() {
                return Err(WalletError::Unauthorized(format!(
                    "Master key {} changed during PIN update",
                    id
                )));
            }
            entry.encrypted_mnemonic = resealed;
            Ok(())
        })?;
        log::info!("Changed PIN for master key {}", id);
        Ok(())
    }

    pub fn set_master_key_expanded(&self, id: &Uuid, expanded: bool) -> WalletResult<()> {
        self.mutate(|storage, _| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            entry.is_expanded = expanded;
            Ok(())
        })
    }

    pub fn set_sub_wallet_creation(&self, id: &Uuid, allowed: bool) -> WalletResult<()> {
        self.mutate(|storage, _| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            entry.can_create_sub_wallets = allowed;
            Ok(())
        })
    }

    pub fn mark_sub_wallet_activity(
        &self,
        id: &Uuid,
        index: u8,
        has_activity: bool,
    ) -> WalletResult<()> {
        self.mutate(|storage, _| {
            let entry = storage
                .master_key_mut(id)
                .ok_or_else(|| WalletError::NotFound(format!("Master key {}", id)))?;
            let sub_wallet = entry
                .sub_wallets
                .iter_mut()
                .chain(entry.archived_sub_wallets.iter_mut())
                .find(|sub_wallet| sub_wallet.index == index)
                .ok_or_else(|| {
                    WalletError::NotFound(format!("Sub-wallet {} of master key {}", index, id))
                })?;
            sub_wallet.has_activity = Some(has_activity);
            Ok(())
        })
    }

    /// Delete the root document and every master key with it.
    pub fn erase_all(&self) -> WalletResult<()> {
        let _guard = self.write_lock.lock();
        self.store.delete(&self.storage_key)?;
        log::warn!("Erased all master keys");
        Ok(())
    }
}
