/// Persisted layout of the multi-wallet root document.
///
/// The whole hierarchy is one JSON document (camelCase fields, epoch
/// millisecond timestamps) stored under a single secure-storage key.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedBlob;
use crate::errors::{WalletError, WalletResult};

/// Schema version this build reads and writes.
pub const STORAGE_VERSION: u32 = 1;
/// Index space per master key, shared by active and archived sub-wallets.
pub const MAX_SUB_WALLETS: usize = 20;
/// Index of the master key's own wallet.
pub const MAIN_WALLET_INDEX: u8 = 0;
pub const MAIN_WALLET_NICKNAME: &str = "Main Wallet";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWalletEntry {
    pub index: u8,
    pub nickname: String,
    pub created_at: i64,
    pub last_used_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<i64>,
    /// Whether on-chain activity was observed. `None` means not yet checked,
    /// which reads as `false` through [`SubWalletEntry::has_activity`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_activity: Option<bool>,
}

impl SubWalletEntry {
    pub fn new(index: u8, nickname: impl Into<String>, now: i64) -> Self {
        Self {
            index,
            nickname: nickname.into(),
            created_at: now,
            last_used_at: now,
            archived_at: None,
            has_activity: None,
        }
    }

    pub fn has_activity(&self) -> bool {
        self.has_activity.unwrap_or(false)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyEntry {
    pub id: Uuid,
    pub nickname: String,
    pub encrypted_mnemonic: EncryptedBlob,
    pub sub_wallets: Vec<SubWalletEntry>,
    #[serde(default)]
    pub archived_sub_wallets: Vec<SubWalletEntry>,
    pub created_at: i64,
    pub last_used_at: i64,
    #[serde(default)]
    pub is_expanded: bool,
    #[serde(default = "default_can_create_sub_wallets")]
    pub can_create_sub_wallets: bool,
}

fn default_can_create_sub_wallets() -> bool {
    true
}

impl MasterKeyEntry {
    pub fn sub_wallet(&self, index: u8) -> Option<&SubWalletEntry> {
        self.sub_wallets.iter().find(|entry| entry.index == index)
    }

    pub fn sub_wallet_mut(&mut self, index: u8) -> Option<&mut SubWalletEntry> {
        self.sub_wallets.iter_mut().find(|entry| entry.index == index)
    }

    pub fn archived_sub_wallet(&self, index: u8) -> Option<&SubWalletEntry> {
        self.archived_sub_wallets
            .iter()
            .find(|entry| entry.index == index)
    }

    /// Every index currently reserved, active or archived.
    pub fn occupied_indices(&self) -> impl Iterator<Item = u8> + '_ {
        self.sub_wallets
            .iter()
            .chain(self.archived_sub_wallets.iter())
            .map(|entry| entry.index)
    }

    /// Lowest free index in `1..MAX_SUB_WALLETS`, if any.
    pub fn next_free_index(&self) -> Option<u8> {
        let occupied: HashSet<u8> = self.occupied_indices().collect();
        (1..MAX_SUB_WALLETS as u8).find(|index| !occupied.contains(index))
    }

    fn validate(&self) -> WalletResult<()> {
        let mut seen = HashSet::new();
        for index in self.occupied_indices() {
            if usize::from(index) >= MAX_SUB_WALLETS {
                return Err(WalletError::InvariantViolation(format!(
                    "Master key {} has out-of-range sub-wallet index {}",
                    self.id, index
                )));
            }
            if !seen.insert(index) {
                return Err(WalletError::InvariantViolation(format!(
                    "Master key {} has duplicate sub-wallet index {}",
                    self.id, index
                )));
            }
        }
        if self.sub_wallet(MAIN_WALLET_INDEX).is_none() {
            return Err(WalletError::InvariantViolation(format!(
                "Master key {} is missing its main wallet",
                self.id
            )));
        }
        Ok(())
    }
}

/// Root document: every master key plus the active selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiWalletStorage {
    pub master_keys: Vec<MasterKeyEntry>,
    pub active_master_key_id: Uuid,
    pub active_sub_wallet_index: u8,
    pub version: u32,
}

impl MultiWalletStorage {
    pub fn new(first: MasterKeyEntry) -> Self {
        Self {
            active_master_key_id: first.id,
            active_sub_wallet_index: MAIN_WALLET_INDEX,
            master_keys: vec![first],
            version: STORAGE_VERSION,
        }
    }

    pub fn master_key(&self, id: &Uuid) -> Option<&MasterKeyEntry> {
        self.master_keys.iter().find(|entry| &entry.id == id)
    }

    pub fn master_key_mut(&mut self, id: &Uuid) -> Option<&mut MasterKeyEntry> {
        self.master_keys.iter_mut().find(|entry| &entry.id == id)
    }

    pub fn active_master_key(&self) -> Option<&MasterKeyEntry> {
        self.master_key(&self.active_master_key_id)
    }

    /// Parse a persisted document. Fails hard on a version mismatch or a
    /// broken invariant; there is no migration.
    pub fn decode(bytes: &[u8]) -> WalletResult<Self> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        if probe.version != STORAGE_VERSION {
            return Err(WalletError::ValidationError(format!(
                "Unsupported storage version: {} (expected {})",
                probe.version, STORAGE_VERSION
            )));
        }

        let storage: MultiWalletStorage = serde_json::from_slice(bytes)?;
        storage.validate()?;
        Ok(storage)
    }

    pub fn encode(&self) -> WalletResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> WalletResult<()> {
        if self.master_keys.is_empty() {
            return Err(WalletError::InvariantViolation(
                "Storage holds no master keys".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for entry in &self.master_keys {
            if !ids.insert(entry.id) {
                return Err(WalletError::InvariantViolation(format!(
                    "Duplicate master key id {}",
                    entry.id
                )));
            }
            entry.validate()?;
        }

        let active = self.active_master_key().ok_or_else(|| {
            WalletError::InvariantViolation(format!(
                "Active master key {} does not exist",
                self.active_master_key_id
            ))
        })?;
        if active.sub_wallet(self.active_sub_wallet_index).is_none() {
            return Err(WalletError::InvariantViolation(format!(
                "Active sub-wallet {} is not an active wallet of {}",
                self.active_sub_wallet_index, active.id
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}
