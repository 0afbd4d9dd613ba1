use crate::errors::{WalletError, WalletResult};
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

pub const MAX_NICKNAME_CHARS: usize = 64;
pub const MIN_PIN_CHARS: usize = 4;
pub const MAX_PIN_CHARS: usize = 64;

static PIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\S+$").expect("PIN pattern is valid"));

// Common injection patterns that have no business in a nickname
static MALICIOUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)<script",
        r"(?i)javascript:",
        r"(?i)data:text/html",
        r"(?i)vbscript:",
        r"(?i)onload=",
        r"(?i)onerror=",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("malicious pattern is valid"))
    .collect()
});

/// Input validation for values that end up in the persisted root document.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a master-key or sub-wallet nickname and return it trimmed.
    pub fn validate_nickname(&self, nickname: &str) -> WalletResult<String> {
        let trimmed = nickname.trim();
        if trimmed.is_empty() {
            return Err(WalletError::ValidationError(
                "Nickname cannot be empty".to_string(),
            ));
        }

        if trimmed.chars().count() > MAX_NICKNAME_CHARS {
            return Err(WalletError::ValidationError(format!(
                "Nickname exceeds {} characters",
                MAX_NICKNAME_CHARS
            )));
        }

        if trimmed.chars().any(|c| c.is_control()) {
            return Err(WalletError::ValidationError(
                "Nickname contains control characters".to_string(),
            ));
        }

        self.check_basic_security(trimmed)?;
        Ok(trimmed.to_string())
    }

    /// Validate a PIN chosen for a new or re-encrypted secret.
    pub fn validate_new_pin(&self, pin: &SecretString) -> WalletResult<()> {
        let pin = pin.expose_secret();
        let length = pin.chars().count();
        if length < MIN_PIN_CHARS {
            return Err(WalletError::ValidationError(format!(
                "PIN must be at least {} characters",
                MIN_PIN_CHARS
            )));
        }

        if length > MAX_PIN_CHARS {
            return Err(WalletError::ValidationError(format!(
                "PIN must be at most {} characters",
                MAX_PIN_CHARS
            )));
        }

        if !PIN_PATTERN.is_match(pin) {
            return Err(WalletError::ValidationError(
                "PIN cannot contain whitespace".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate that a mnemonic is non-empty; word-list checks are optional.
    pub fn validate_mnemonic_text(&self, mnemonic: &SecretString) -> WalletResult<()> {
        if mnemonic.expose_secret().trim().is_empty() {
            return Err(WalletError::ValidationError(
                "Mnemonic cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn check_basic_security(&self, input: &str) -> WalletResult<()> {
        if MALICIOUS_PATTERNS
            .iter()
            .any(|pattern| pattern.is_match(input))
        {
            return Err(WalletError::ValidationError(
                "Input contains disallowed content".to_string(),
            ));
        }
        Ok(())
    }
}
