/// PIN-based key derivation and authenticated encryption of wallet secrets.
///
/// A master key's mnemonic is sealed with AES-256-GCM under a key derived from
/// the user's PIN with PBKDF2-HMAC-SHA256. There is no separate PIN hash: the
/// only proof of PIN knowledge is a successful AEAD open of the real secret.
use std::num::NonZeroU32;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::pbkdf2;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::errors::{WalletError, WalletResult};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const PIN_KDF_SALT: &[u8] = b"multiwallet-keystore.pin-kdf.v1";

const MAX_AGE_MILLIS: i64 = 90 * 24 * 60 * 60 * 1000;

/// Symmetric key derived from a PIN. Zeroized on drop.
pub struct SymmetricKey(Zeroizing<[u8; KEY_LEN]>);

impl SymmetricKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Ciphertext (with appended GCM tag), the IV used, and the sealing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_iv")]
    pub iv: [u8; IV_LEN],
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

/// Classification of a blob timestamp relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityReport {
    Fresh,
    /// Older than 90 days.
    Stale { age_days: i64 },
    /// Later than now, which suggests the clock was rolled back.
    FutureDated { ahead_millis: i64 },
}

impl IntegrityReport {
    pub fn as_warning(&self) -> Option<WalletError> {
        match self {
            IntegrityReport::Fresh => None,
            IntegrityReport::Stale { age_days } => Some(WalletError::IntegrityWarning(format!(
                "encrypted data is {} days old",
                age_days
            ))),
            IntegrityReport::FutureDated { ahead_millis } => {
                Some(WalletError::IntegrityWarning(format!(
                    "encrypted data timestamp is {} ms in the future",
                    ahead_millis
                )))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CryptoEngine {
    clock: Arc<dyn Clock>,
    iterations: NonZeroU32,
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl CryptoEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            iterations: NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN),
        }
    }

    /// Engine with a non-standard PBKDF2 iteration count.
    ///
    /// Blobs do not record the count, so data sealed by one engine only opens
    /// with an engine using the same count. Intended for tests.
    pub fn with_iterations(clock: Arc<dyn Clock>, iterations: NonZeroU32) -> Self {
        Self { clock, iterations }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn derive_key(&self, pin: &SecretString) -> SymmetricKey {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            PIN_KDF_SALT,
            pin.expose_secret().as_bytes(),
            key.as_mut(),
        );
        SymmetricKey(key)
    }

    pub fn encrypt(&self, plaintext: &str, pin: &SecretString) -> WalletResult<EncryptedBlob> {
        let key = self.derive_key(pin);

        let mut iv = [0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| WalletError::CryptoError(format!("Failed to generate IV: {}", e)))?;

        let mut buffer = Zeroizing::new(plaintext.as_bytes().to_vec());
        let ciphertext = encrypt_aes_gcm(&key, Nonce::assume_unique_for_key(iv), &mut buffer)?;

        Ok(EncryptedBlob {
            ciphertext,
            iv,
            timestamp: self.clock.now_millis(),
        })
    }

    /// Open a blob. A wrong PIN and a corrupted blob both yield
    /// [`WalletError::DecryptionFailed`].
    pub fn decrypt(&self, blob: &EncryptedBlob, pin: &SecretString) -> WalletResult<Zeroizing<String>> {
        let key = self.derive_key(pin);
        let plaintext = decrypt_aes_gcm(&key, Nonce::assume_unique_for_key(blob.iv), &blob.ciphertext)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| WalletError::DecryptionFailed)?;
        Ok(Zeroizing::new(text.to_string()))
    }

    pub fn verify_pin(&self, blob: &EncryptedBlob, pin: &SecretString) -> bool {
        self.decrypt(blob, pin).is_ok()
    }

    pub fn integrity_report(&self, timestamp: i64) -> IntegrityReport {
        let now = self.clock.now_millis();
        let age = now.saturating_sub(timestamp);
        if age < 0 {
            IntegrityReport::FutureDated {
                ahead_millis: age.saturating_neg(),
            }
        } else if age > MAX_AGE_MILLIS {
            IntegrityReport::Stale {
                age_days: age / (24 * 60 * 60 * 1000),
            }
        } else {
            IntegrityReport::Fresh
        }
    }

    /// Advisory age check. Anomalies are logged, never rejected.
    pub fn validate_integrity(&self, timestamp: i64) -> bool {
        if let Some(warning) = self.integrity_report(timestamp).as_warning() {
            log::warn!("{}", warning);
        }
        true
    }

    pub fn generate_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Generate a BIP39 mnemonic with the given word count.
pub fn generate_mnemonic(word_count: u32) -> WalletResult<Zeroizing<String>> {
    use bip39::Mnemonic;

    let entropy_bits = match word_count {
        12 => 128,
        15 => 160,
        18 => 192,
        21 => 224,
        24 => 256,
        _ => {
            return Err(WalletError::ValidationError(
                "Invalid word count: must be 12, 15, 18, 21, or 24".to_string(),
            ))
        }
    };

    let mut entropy = Zeroizing::new(vec![0u8; entropy_bits / 8]);
    OsRng
        .try_fill_bytes(&mut entropy)
        .map_err(|e| WalletError::CryptoError(format!("Failed to generate entropy: {}", e)))?;

    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| WalletError::CryptoError(format!("Failed to create mnemonic: {}", e)))?;

    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Validate an English BIP39 mnemonic phrase.
pub fn validate_mnemonic(phrase: &str) -> WalletResult<()> {
    use bip39::{Language, Mnemonic};

    Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| WalletError::ValidationError(format!("Invalid mnemonic: {}", e)))?;

    Ok(())
}

fn encrypt_aes_gcm(
    key: &SymmetricKey,
    nonce: Nonce,
    buffer: &mut Zeroizing<Vec<u8>>,
) -> WalletResult<Vec<u8>> {
    let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key.as_bytes())
        .map_err(|e| WalletError::CryptoError(format!("Invalid encryption key: {e}")))?;
    let key = LessSafeKey::new(unbound_key);

    let mut in_out: Vec<u8> = buffer.iter().copied().collect();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| WalletError::CryptoError("Encryption failure".to_string()))?;
    Ok(in_out)
}

fn decrypt_aes_gcm(
    key: &SymmetricKey,
    nonce: Nonce,
    ciphertext: &[u8],
) -> WalletResult<Zeroizing<Vec<u8>>> {
    let unbound_key =
        UnboundKey::new(&aead::AES_256_GCM, key.as_bytes()).map_err(|_| WalletError::DecryptionFailed)?;
    let key = LessSafeKey::new(unbound_key);

    if ciphertext.len() < aead::AES_256_GCM.tag_len() {
        return Err(WalletError::DecryptionFailed);
    }

    let mut in_out = Zeroizing::new(ciphertext.to_vec());
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), in_out.as_mut_slice())
        .map_err(|_| WalletError::DecryptionFailed)?;
    let plaintext_len = plaintext.len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod hex_iv {
    use super::IV_LEN;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(iv: &[u8; IV_LEN], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(iv))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; IV_LEN], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let mut iv = [0u8; IV_LEN];
        hex::decode_to_slice(encoded, &mut iv).map_err(serde::de::Error::custom)?;
        Ok(iv)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    pub(crate) fn fast_engine(clock: Arc<dyn Clock>) -> CryptoEngine {
        CryptoEngine::with_iterations(clock, NonZeroU32::new(10).unwrap())
    }

    fn pin(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn derive_key_is_deterministic() {
        let engine = CryptoEngine::default();
        let first = engine.derive_key(&pin("1234"));
        let second = engine.derive_key(&pin("1234"));
        let other = engine.derive_key(&pin("1235"));
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_ne!(first.as_bytes(), other.as_bytes());
    }

    #[test]
    fn derive_key_matches_pbkdf2_parameters() {
        let engine = CryptoEngine::default();
        let key = engine.derive_key(&pin("0000"));

        let mut expected = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
            PIN_KDF_SALT,
            b"0000",
            &mut expected,
        );
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn encrypt_then_decrypt_round_trip() {
        let engine = fast_engine(Arc::new(SystemClock));
        for (message, secret) in [(ABANDON, "1234"), ("", "0"), ("ünïcødé ✓", "pin with spaces")] {
            let blob = engine.encrypt(message, &pin(secret)).unwrap();
            let plaintext = engine.decrypt(&blob, &pin(secret)).unwrap();
            assert_eq!(plaintext.as_str(), message);
        }
    }

    #[test]
    fn full_strength_round_trip() {
        let engine = CryptoEngine::default();
        let blob = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        assert_eq!(engine.decrypt(&blob, &pin("1234")).unwrap().as_str(), ABANDON);
    }

    #[test]
    fn wrong_pin_is_rejected() {
        let engine = fast_engine(Arc::new(SystemClock));
        let blob = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        let err = engine.decrypt(&blob, &pin("4321")).unwrap_err();
        assert_eq!(err, WalletError::DecryptionFailed);
    }

    #[test]
    fn tampered_ciphertext_is_indistinguishable_from_wrong_pin() {
        let engine = fast_engine(Arc::new(SystemClock));
        let mut blob = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        blob.ciphertext[0] ^= 0x01;
        assert_eq!(
            engine.decrypt(&blob, &pin("1234")).unwrap_err(),
            WalletError::DecryptionFailed
        );

        let mut truncated = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        truncated.ciphertext.truncate(4);
        assert_eq!(
            engine.decrypt(&truncated, &pin("1234")).unwrap_err(),
            WalletError::DecryptionFailed
        );

        let mut wrong_iv = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        wrong_iv.iv[11] ^= 0xFF;
        assert_eq!(
            engine.decrypt(&wrong_iv, &pin("1234")).unwrap_err(),
            WalletError::DecryptionFailed
        );
    }

    #[test]
    fn iv_is_fresh_per_call() {
        let engine = fast_engine(Arc::new(SystemClock));
        let first = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        let second = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn verify_pin_never_propagates_errors() {
        let engine = fast_engine(Arc::new(SystemClock));
        let blob = engine.encrypt(ABANDON, &pin("1234")).unwrap();
        assert!(engine.verify_pin(&blob, &pin("1234")));
        assert!(!engine.verify_pin(&blob, &pin("1234x")));

        let empty = EncryptedBlob {
            ciphertext: Vec::new(),
            iv: [0u8; IV_LEN],
            timestamp: 0,
        };
        assert!(!engine.verify_pin(&empty, &pin("1234")));
    }

    #[test]
    fn timestamp_comes_from_clock() {
        let clock = Arc::new(ManualClock::at_epoch());
        let engine = fast_engine(clock.clone());
        let blob = engine.encrypt("secret", &pin("1")).unwrap();
        assert_eq!(blob.timestamp, clock.now_millis());
    }

    #[test]
    fn integrity_check_is_advisory() {
        let clock = Arc::new(ManualClock::at_epoch());
        let engine = fast_engine(clock.clone());
        let sealed_at = clock.now_millis();

        assert_eq!(engine.integrity_report(sealed_at), IntegrityReport::Fresh);

        clock.advance(Duration::from_secs(91 * 24 * 60 * 60));
        assert_eq!(
            engine.integrity_report(sealed_at),
            IntegrityReport::Stale { age_days: 91 }
        );
        assert!(engine.validate_integrity(sealed_at));

        let future = clock.now_millis() + 5_000;
        assert_eq!(
            engine.integrity_report(future),
            IntegrityReport::FutureDated { ahead_millis: 5_000 }
        );
        assert!(engine.validate_integrity(future));
        assert!(matches!(
            engine.integrity_report(future).as_warning(),
            Some(WalletError::IntegrityWarning(_))
        ));
    }

    #[test]
    fn blob_serializes_as_hex() {
        let engine = fast_engine(Arc::new(SystemClock));
        let blob = engine.encrypt("x", &pin("1")).unwrap();
        let json = serde_json::to_value(&blob).unwrap();
        assert_eq!(json["iv"].as_str().unwrap().len(), IV_LEN * 2);
        let restored: EncryptedBlob = serde_json::from_value(json).unwrap();
        assert_eq!(restored, blob);
    }

    #[test]
    fn generated_ids_are_v4_and_unique() {
        let engine = CryptoEngine::default();
        let first = engine.generate_id();
        let second = engine.generate_id();
        assert_ne!(first, second);
        assert_eq!(first.get_version_num(), 4);
    }

    #[test]
    fn mnemonic_generation_and_validation() {
        let mnemonic = generate_mnemonic(12).unwrap();
        assert_eq!(mnemonic.split_whitespace().count(), 12);
        validate_mnemonic(&mnemonic).unwrap();
        validate_mnemonic(ABANDON).unwrap();

        assert!(matches!(
            generate_mnemonic(13),
            Err(WalletError::ValidationError(_))
        ));
        assert!(matches!(
            validate_mnemonic("abandon abandon"),
            Err(WalletError::ValidationError(_))
        ));
    }
}
