/// Biometric gate used as a PIN substitute by the session.
///
/// The host supplies a [`BiometricAuthenticator`] wrapping the platform prompt.
/// [`BiometricGate`] layers the keystore policy on top: the feature must be
/// enabled in configuration, hardware must be available and enrolled, and
/// every prompt needs a short, non-empty reason.
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};

const MAX_REASON_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiometricFactor {
    Fingerprint,
    Face,
    Iris,
    Voice,
}

impl BiometricFactor {
    pub fn parse(value: &str) -> WalletResult<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(WalletError::ValidationError(
                "Biometric factor cannot be empty".to_string(),
            ));
        }
        match normalized.as_str() {
            "fingerprint" => Ok(Self::Fingerprint),
            "face" => Ok(Self::Face),
            "iris" => Ok(Self::Iris),
            "voice" => Ok(Self::Voice),
            _ => Err(WalletError::ValidationError(format!(
                "Unsupported biometric factor '{}'",
                value
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BiometricFactor::Fingerprint => "fingerprint",
            BiometricFactor::Face => "face",
            BiometricFactor::Iris => "iris",
            BiometricFactor::Voice => "voice",
        }
    }
}

impl fmt::Display for BiometricFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricStatus {
    pub available: bool,
    pub enrolled: bool,
    pub supported_types: Vec<BiometricFactor>,
}

impl BiometricStatus {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            enrolled: false,
            supported_types: Vec::new(),
        }
    }

    /// Build a status from what a platform bridge reports, with the supported
    /// factors as a comma-separated list such as `"fingerprint,face"`.
    pub fn from_host(available: bool, enrolled: bool, supported: &str) -> WalletResult<Self> {
        let mut supported_types = Vec::new();
        for item in supported.split(',').filter(|item| !item.trim().is_empty()) {
            let factor = BiometricFactor::parse(item)?;
            if !supported_types.contains(&factor) {
                supported_types.push(factor);
            }
        }
        if available && supported_types.is_empty() {
            return Err(WalletError::ValidationError(
                "Available biometric hardware must report at least one factor".to_string(),
            ));
        }
        Ok(Self {
            available,
            enrolled,
            supported_types,
        })
    }

    /// Factors as a comma-separated list, the inverse of [`Self::from_host`].
    pub fn describe_factors(&self) -> String {
        self.supported_types
            .iter()
            .map(BiometricFactor::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Platform biometric prompt.
pub trait BiometricAuthenticator: fmt::Debug + Send + Sync {
    fn status(&self) -> BiometricStatus;

    /// Show the platform prompt. `Ok(())` means the user was recognised.
    fn authenticate(&self, reason: &str) -> WalletResult<()>;
}

#[derive(Debug, Clone)]
pub struct BiometricGate {
    authenticator: Arc<dyn BiometricAuthenticator>,
    enabled: bool,
}

impl BiometricGate {
    pub fn new(authenticator: Arc<dyn BiometricAuthenticator>, enabled: bool) -> Self {
        Self {
            authenticator,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn authenticator(&self) -> Arc<dyn BiometricAuthenticator> {
        Arc::clone(&self.authenticator)
    }

    /// Status as seen through policy: a disabled gate reports nothing.
    pub fn status(&self) -> BiometricStatus {
        if !self.enabled {
            return BiometricStatus::unavailable();
        }
        let status = self.authenticator.status();
        BiometricStatus {
            enrolled: status.available && status.enrolled,
            supported_types: if status.available {
                status.supported_types
            } else {
                Vec::new()
            },
            available: status.available,
        }
    }

    pub fn authenticate(&self, reason: &str) -> WalletResult<()> {
        if !self.enabled {
            return Err(WalletError::PermissionDenied(
                "Biometric authentication disabled by security policy".to_string(),
            ));
        }

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WalletError::ValidationError(
                "Biometric unlock reason cannot be empty".to_string(),
            ));
        }
        if reason.len() > MAX_REASON_LENGTH {
            return Err(WalletError::ValidationError(format!(
                "Biometric unlock reason exceeds {} characters",
                MAX_REASON_LENGTH
            )));
        }

        let status = self.authenticator.status();
        if !status.available {
            return Err(WalletError::PermissionDenied(
                "Biometric hardware unavailable".to_string(),
            ));
        }
        if !status.enrolled {
            return Err(WalletError::PermissionDenied(
                "No biometric enrollment detected".to_string(),
            ));
        }

        log::debug!("Prompting for biometric unlock ({})", status.describe_factors());
        self.authenticator.authenticate(reason)
    }
}

/// Authenticator with scripted answers, for hosts without biometric hardware
/// and for tests.
#[derive(Debug)]
pub struct ScriptedAuthenticator {
    status: BiometricStatus,
    approve: Mutex<bool>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAuthenticator {
    pub fn new(status: BiometricStatus, approve: bool) -> Self {
        Self {
            status,
            approve: Mutex::new(approve),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Enrolled fingerprint reader that approves every prompt.
    pub fn approving() -> Self {
        Self::new(
            BiometricStatus {
                available: true,
                enrolled: true,
                supported_types: vec![BiometricFactor::Fingerprint],
            },
            true,
        )
    }

    pub fn set_approve(&self, approve: bool) {
        *self.approve.lock() = approve;
    }

    /// Reasons passed to every prompt so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

impl BiometricAuthenticator for ScriptedAuthenticator {
    fn status(&self) -> BiometricStatus {
        self.status.clone()
    }

    fn authenticate(&self, reason: &str) -> WalletResult<()> {
        self.prompts.lock().push(reason.to_string());
        if *self.approve.lock() {
            Ok(())
        } else {
            Err(WalletError::Unauthorized(
                "Biometric authentication rejected".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_parsing() {
        assert_eq!(
            BiometricFactor::parse(" Face ").unwrap(),
            BiometricFactor::Face
        );
        assert!(BiometricFactor::parse("").is_err());
        assert!(BiometricFactor::parse("palm").is_err());
        assert_eq!(BiometricFactor::Iris.as_str(), "iris");
        assert_eq!(BiometricFactor::Voice.to_string(), "voice");
    }

    #[test]
    fn host_status_parses_factor_list() {
        let status = BiometricStatus::from_host(true, true, "Fingerprint, face,,face").unwrap();
        assert_eq!(
            status.supported_types,
            vec![BiometricFactor::Fingerprint, BiometricFactor::Face]
        );
        assert_eq!(status.describe_factors(), "fingerprint,face");

        assert!(matches!(
            BiometricStatus::from_host(true, true, "fingerprint,palm"),
            Err(WalletError::ValidationError(_))
        ));
        assert!(matches!(
            BiometricStatus::from_host(true, false, " , "),
            Err(WalletError::ValidationError(_))
        ));
        assert_eq!(
            BiometricStatus::from_host(false, false, "").unwrap(),
            BiometricStatus::unavailable()
        );
    }

    #[test]
    fn host_status_drives_the_gate() {
        let status = BiometricStatus::from_host(true, true, "iris").unwrap();
        let gate = BiometricGate::new(Arc::new(ScriptedAuthenticator::new(status, true)), true);
        assert_eq!(gate.status().supported_types, vec![BiometricFactor::Iris]);
        gate.authenticate("Unlock wallet").unwrap();
    }

    #[test]
    fn disabled_gate_hides_hardware() {
        let gate = BiometricGate::new(Arc::new(ScriptedAuthenticator::approving()), false);
        assert_eq!(gate.status(), BiometricStatus::unavailable());
        assert!(matches!(
            gate.authenticate("Unlock wallet"),
            Err(WalletError::PermissionDenied(_))
        ));
    }

    #[test]
    fn reason_is_validated_before_prompting() {
        let authenticator = Arc::new(ScriptedAuthenticator::approving());
        let gate = BiometricGate::new(authenticator.clone(), true);

        assert!(matches!(
            gate.authenticate("   "),
            Err(WalletError::ValidationError(_))
        ));
        assert!(matches!(
            gate.authenticate(&"r".repeat(MAX_REASON_LENGTH + 1)),
            Err(WalletError::ValidationError(_))
        ));
        assert!(authenticator.prompts().is_empty());

        gate.authenticate(" Unlock wallet ").unwrap();
        assert_eq!(authenticator.prompts(), vec!["Unlock wallet".to_string()]);
    }

    #[test]
    fn enrollment_is_required() {
        let authenticator = ScriptedAuthenticator::new(
            BiometricStatus {
                available: true,
                enrolled: false,
                supported_types: vec![BiometricFactor::Face],
            },
            true,
        );
        let gate = BiometricGate::new(Arc::new(authenticator), true);
        assert!(!gate.status().enrolled);
        assert!(matches!(
            gate.authenticate("Unlock wallet"),
            Err(WalletError::PermissionDenied(msg)) if msg.contains("enrollment")
        ));
    }

    #[test]
    fn rejection_is_unauthorized() {
        let authenticator = Arc::new(ScriptedAuthenticator::approving());
        authenticator.set_approve(false);
        let gate = BiometricGate::new(authenticator, true);
        assert!(matches!(
            gate.authenticate("Unlock wallet"),
            Err(WalletError::Unauthorized(_))
        ));
    }
}
