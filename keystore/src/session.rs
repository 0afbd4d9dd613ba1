/// Lock/unlock state machine layered over a [`WalletStore`].
///
/// The session never holds decrypted secrets. Unlocking proves the PIN by
/// opening the sealed mnemonic; the session then tracks activity and locks
/// itself once `now - last_activity` exceeds the auto-lock timeout. Expiry is
/// checked by a deferred timer, on app foreground, and on every state query.
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::biometric::BiometricGate;
use crate::clock::Clock;
use crate::config_store::SessionConfig;
use crate::errors::{WalletError, WalletResult};
use crate::lifecycle::AppLifecycle;
use crate::storage::MAIN_WALLET_INDEX;
use crate::timer::{Scheduler, TimerHandle};
use crate::wallet_store::{UnlockedMasterKey, WalletStore};

const EVENT_CAPACITY: usize = 32;
const MAX_BACKOFF_EXPONENT: u32 = 8;
// Floor for re-arming a timer that fired exactly at the boundary.
const MIN_TIMER_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockReason {
    Manual,
    Timeout,
    /// The unlocked master key was deleted from the store.
    MasterKeyRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockMethod {
    Pin,
    Biometric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Unlocked {
        master_key_id: Uuid,
        method: UnlockMethod,
    },
    Locked {
        reason: LockReason,
    },
    SubWalletSelected {
        master_key_id: Uuid,
        index: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub auto_lock_timeout: Duration,
    pub max_failed_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            auto_lock_timeout: config.auto_lock_timeout(),
            max_failed_attempts: config.max_failed_attempts.max(1),
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
        }
    }
}

#[derive(Debug)]
struct SessionCore {
    state: SessionState,
    master_key_id: Option<Uuid>,
    sub_wallet_index: u8,
    last_activity: Option<DateTime<Utc>>,
    auto_lock_timeout: Duration,
    timer: Option<TimerHandle>,
    last_lock_reason: Option<LockReason>,
    failed_attempts: u32,
    backoff_exponent: u32,
    next_allowed_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct SessionInner {
    store: Arc<WalletStore>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    biometrics: RwLock<Option<BiometricGate>>,
    options: SessionOptions,
    core: Mutex<SessionCore>,
    events: broadcast::Sender<SessionEvent>,
}

/// Guards access to the wallet store behind a PIN or biometric unlock.
#[derive(Debug, Clone)]
pub struct SessionGuard {
    inner: Arc<SessionInner>,
}

impl SessionGuard {
    pub fn new(
        store: Arc<WalletStore>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        options: SessionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let core = SessionCore {
            state: SessionState::Locked,
            master_key_id: None,
            sub_wallet_index: MAIN_WALLET_INDEX,
            last_activity: None,
            auto_lock_timeout: options.auto_lock_timeout,
            timer: None,
            last_lock_reason: None,
            failed_attempts: 0,
            backoff_exponent: 0,
            next_allowed_attempt: None,
        };
        Self {
            inner: Arc::new(SessionInner {
                store,
                clock,
                scheduler,
                biometrics: RwLock::new(None),
                options,
                core: Mutex::new(core),
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<WalletStore> {
        &self.inner.store
    }

    pub fn set_biometrics(&self, gate: Option<BiometricGate>) {
        *self.inner.biometrics.write() = gate;
    }

    pub fn biometrics(&self) -> Option<BiometricGate> {
        self.inner.biometrics.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Current state after applying any due auto-lock.
    pub fn state(&self) -> SessionState {
        self.check_auto_lock();
        self.inner.core.lock().state
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    pub fn current_master_key_id(&self) -> Option<Uuid> {
        self.inner.core.lock().master_key_id
    }

    pub fn current_sub_wallet_index(&self) -> u8 {
        self.inner.core.lock().sub_wallet_index
    }

    pub fn last_lock_reason(&self) -> Option<LockReason> {
        self.inner.core.lock().last_lock_reason
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.inner.core.lock().last_activity
    }

    pub fn auto_lock_timeout(&self) -> Duration {
        self.inner.core.lock().auto_lock_timeout
    }

    pub fn remaining_attempts(&self) -> u32 {
        let core = self.inner.core.lock();
        self.inner
            .options
            .max_failed_attempts
            .saturating_sub(core.failed_attempts)
    }

    /// Verify `pin` against the selected master key (or the store's active
    /// one) and unlock.
    pub fn unlock(&self, pin: &SecretString) -> WalletResult<()> {
        self.ensure_attempt_allowed()?;
        let target = self.target_master_key()?;

        if !self.inner.store.verify_pin(&target, pin)? {
            return Err(self.register_failed_attempt());
        }

        let index = self.persisted_sub_wallet_for(&target)?;
        self.enter_unlocked(target, index, UnlockMethod::Pin);
        Ok(())
    }

    /// Try `pin` against every master key; the matching key becomes current.
    pub fn unlock_any(&self, pin: &SecretString) -> WalletResult<UnlockedMasterKey> {
        self.ensure_attempt_allowed()?;
        let Some(unlocked) = self.inner.store.try_unlock_any_master_key(pin)? else {
            return Err(self.register_failed_attempt());
        };

        let index = self.persisted_sub_wallet_for(&unlocked.id)?;
        self.enter_unlocked(unlocked.id, index, UnlockMethod::Pin);
        Ok(unlocked)
    }

    /// Unlock through the platform biometric prompt instead of a PIN.
    pub fn unlock_with_biometric(&self, reason: &str) -> WalletResult<()> {
        let gate = self.biometrics().ok_or_else(|| {
            WalletError::PermissionDenied("Biometric unlock is not configured".to_string())
        })?;
        self.ensure_attempt_allowed()?;
        let target = self.target_master_key()?;

        gate.authenticate(reason)?;

        let index = self.persisted_sub_wallet_for(&target)?;
        self.enter_unlocked(target, index, UnlockMethod::Biometric);
        Ok(())
    }

    /// Switch to another master key. Always asks for that key's PIN.
    pub fn switch_master_key(&self, id: &Uuid, pin: &SecretString) -> WalletResult<()> {
        self.ensure_attempt_allowed()?;
        if !self.inner.store.verify_pin(id, pin)? {
            return Err(self.register_failed_attempt());
        }

        self.inner.store.set_active_wallet(id, MAIN_WALLET_INDEX)?;
        self.enter_unlocked(*id, MAIN_WALLET_INDEX, UnlockMethod::Pin);
        log::info!("Switched session to master key {}", id);
        Ok(())
    }

    /// Select a sub-wallet of the current master key. No PIN is needed.
    pub fn select_sub_wallet(&self, index: u8) -> WalletResult<()> {
        let target = self.target_master_key()?;
        self.inner.store.set_active_wallet(&target, index)?;

        {
            let mut core = self.inner.core.lock();
            core.master_key_id = Some(target);
            core.sub_wallet_index = index;
        }
        self.update_activity();
        self.emit(SessionEvent::SubWalletSelected {
            master_key_id: target,
            index,
        });
        Ok(())
    }

    pub fn lock(&self) {
        self.lock_with(LockReason::Manual);
    }

    /// Refresh the inactivity window. Returns false when the session is
    /// locked (including when it just expired).
    pub fn update_activity(&self) -> bool {
        if self.check_auto_lock() {
            return false;
        }

        let mut core = self.inner.core.lock();
        if core.state != SessionState::Unlocked {
            return false;
        }
        core.last_activity = Some(self.inner.clock.now());
        let timeout = core.auto_lock_timeout;
        self.arm_timer(&mut core, timeout);
        true
    }

    /// Lock if the inactivity window has passed. Returns true when this call
    /// performed the lock.
    pub fn check_auto_lock(&self) -> bool {
        let event = {
            let mut core = self.inner.core.lock();
            match self.remaining_before_lock(&core) {
                Some(remaining) if remaining.is_zero() => {
                    Self::transition_locked(&mut core, LockReason::Timeout)
                }
                _ => None,
            }
        };

        match event {
            Some(event) => {
                log::info!("Session auto-locked after inactivity");
                self.emit(event);
                true
            }
            None => false,
        }
    }

    pub fn handle_lifecycle(&self, event: AppLifecycle) {
        match event {
            AppLifecycle::Foreground => {
                self.check_auto_lock();
            }
            AppLifecycle::Background => {
                log::debug!("App moved to background; auto-lock timer keeps running");
            }
        }
    }

    /// Seconds left before auto-lock, rounded up. `None` while locked or
    /// when auto-lock is disabled.
    pub fn seconds_until_auto_lock(&self) -> Option<u64> {
        self.check_auto_lock();
        let core = self.inner.core.lock();
        let remaining = self.remaining_before_lock(&core)?;
        let mut seconds = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            seconds += 1;
        }
        Some(seconds)
    }

    /// Change the auto-lock timeout. Zero disables auto-lock.
    pub fn set_auto_lock_timeout(&self, timeout: Duration) {
        {
            let mut core = self.inner.core.lock();
            core.auto_lock_timeout = timeout;
            if core.state != SessionState::Unlocked {
                return;
            }
        }

        if self.check_auto_lock() {
            return;
        }
        let mut core = self.inner.core.lock();
        if let Some(remaining) = self.remaining_before_lock(&core) {
            self.arm_timer(&mut core, remaining);
        } else {
            core.timer = None;
        }
    }

    fn lock_with(&self, reason: LockReason) {
        let event = {
            let mut core = self.inner.core.lock();
            let event = Self::transition_locked(&mut core, reason);
            core.last_activity = None;
            core.timer = None;
            event
        };
        if let Some(event) = event {
            log::info!("Session locked ({:?})", reason);
            self.emit(event);
        }
    }

    fn transition_locked(core: &mut SessionCore, reason: LockReason) -> Option<SessionEvent> {
        if core.state != SessionState::Unlocked {
            return None;
        }
        core.state = SessionState::Locked;
        core.last_activity = None;
        core.timer = None;
        core.last_lock_reason = Some(reason);
        Some(SessionEvent::Locked { reason })
    }

    /// Time left before the session must lock, or `None` if it cannot
    /// auto-lock right now.
    fn remaining_before_lock(&self, core: &SessionCore) -> Option<Duration> {
        if core.state != SessionState::Unlocked || core.auto_lock_timeout.is_zero() {
            return None;
        }
        let last_activity = core.last_activity?;
        let elapsed = self
            .inner
            .clock
            .now()
            .signed_duration_since(last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if elapsed > core.auto_lock_timeout {
            Some(Duration::ZERO)
        } else {
            // Expiry needs strictly more than the timeout to have elapsed.
            Some((core.auto_lock_timeout - elapsed).max(MIN_TIMER_DELAY))
        }
    }

    fn arm_timer(&self, core: &mut SessionCore, delay: Duration) {
        if core.auto_lock_timeout.is_zero() {
            core.timer = None;
            return;
        }
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    SessionGuard { inner }.on_timer();
                }
            }),
        );
        core.timer = Some(handle);
    }

    fn on_timer(&self) {
        if self.check_auto_lock() {
            return;
        }
        let mut core = self.inner.core.lock();
        if let Some(remaining) = self.remaining_before_lock(&core) {
            self.arm_timer(&mut core, remaining);
        }
    }

    fn enter_unlocked(&self, master_key_id: Uuid, sub_wallet_index: u8, method: UnlockMethod) {
        {
            let mut core = self.inner.core.lock();
            core.state = SessionState::Unlocked;
            core.master_key_id = Some(master_key_id);
            core.sub_wallet_index = sub_wallet_index;
            core.last_activity = Some(self.inner.clock.now());
            core.failed_attempts = 0;
            core.backoff_exponent = 0;
            core.next_allowed_attempt = None;
            let timeout = core.auto_lock_timeout;
            self.arm_timer(&mut core, timeout);
        }
        log::info!("Session unlocked for master key {} ({:?})", master_key_id, method);
        self.emit(SessionEvent::Unlocked {
            master_key_id,
            method,
        });
    }

    fn ensure_attempt_allowed(&self) -> WalletResult<()> {
        let core = self.inner.core.lock();
        let Some(until) = core.next_allowed_attempt else {
            return Ok(());
        };
        let now = self.inner.clock.now();
        if now < until {
            let remaining = until.signed_duration_since(now).num_milliseconds();
            return Err(WalletError::PermissionDenied(format!(
                "Unlock temporarily disabled. Retry in {}.{:03} seconds",
                remaining / 1000,
                remaining % 1000
            )));
        }
        Ok(())
    }

    /// Record a failed PIN and return the error to surface.
    fn register_failed_attempt(&self) -> WalletError {
        let options = &self.inner.options;
        let mut core = self.inner.core.lock();
        core.failed_attempts = core.failed_attempts.saturating_add(1);

        let delay = if core.failed_attempts >= options.max_failed_attempts {
            options.backoff_cap
        } else {
            core.backoff_exponent = (core.backoff_exponent + 1).min(MAX_BACKOFF_EXPONENT);
            let multiplier = 1_u32 << core.backoff_exponent.saturating_sub(1);
            options
                .backoff_base
                .checked_mul(multiplier)
                .unwrap_or(options.backoff_cap)
                .min(options.backoff_cap)
        };
        let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let now = self.inner.clock.now();
        core.next_allowed_attempt = Some(now.checked_add_signed(delta).unwrap_or(now));

        let remaining = options
            .max_failed_attempts
            .saturating_sub(core.failed_attempts);
        log::warn!(
            "Unlock attempt rejected ({} failures, next attempt in {:?})",
            core.failed_attempts,
            delay
        );
        WalletError::Unauthorized(format!(
            "Incorrect PIN ({} attempts remaining before maximum backoff)",
            remaining
        ))
    }

    /// Master key the next unlock targets: the session's selection if it
    /// still exists, else the store's active key.
    fn target_master_key(&self) -> WalletResult<Uuid> {
        let selected = self.inner.core.lock().master_key_id;
        if let Some(id) = selected {
            let still_stored = self
                .inner
                .store
                .list_master_keys()?
                .iter()
                .any(|summary| summary.id == id);
            if still_stored {
                return Ok(id);
            }
            self.forget_master_key(id);
        }
        self.inner
            .store
            .active_master_key_id()?
            .ok_or_else(|| WalletError::NotFound("No master key to unlock".to_string()))
    }

    /// Drop a selection whose master key is gone. An unlock of that key never
    /// carries over to whichever key the store falls back to.
    fn forget_master_key(&self, id: Uuid) {
        let event = {
            let mut core = self.inner.core.lock();
            if core.master_key_id != Some(id) {
                return;
            }
            core.master_key_id = None;
            core.sub_wallet_index = MAIN_WALLET_INDEX;
            Self::transition_locked(&mut core, LockReason::MasterKeyRemoved)
        };
        if let Some(event) = event {
            log::warn!("Master key {} no longer stored, session locked", id);
            self.emit(event);
        }
    }

    fn persisted_sub_wallet_for(&self, id: &Uuid) -> WalletResult<u8> {
        Ok(self
            .inner
            .store
            .get_active_wallet_info()?
            .filter(|info| &info.master_key_id == id)
            .map(|info| info.sub_wallet_index)
            .unwrap_or(MAIN_WALLET_INDEX))
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometric::ScriptedAuthenticator;
    use crate::clock::ManualClock;
    use crate::crypto::tests::fast_engine;
    use crate::storage::MemorySecureStore;
    use crate::timer::ManualScheduler;
    use crate::wallet_store::tests::{secret, ABANDON, ZOO};

    struct Harness {
        guard: SessionGuard,
        store: Arc<WalletStore>,
        clock: Arc<ManualClock>,
        scheduler: Arc<ManualScheduler>,
        first: Uuid,
    }

    impl Harness {
        fn new(options: SessionOptions) -> Self {
            let clock = Arc::new(ManualClock::at_epoch());
            let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
            let store = Arc::new(WalletStore::new(
                Arc::new(MemorySecureStore::new()),
                fast_engine(clock.clone()),
            ));
            let first = store
                .create_master_key(&secret(ABANDON), "Wallet A", &secret("1234"))
                .unwrap();
            let guard = SessionGuard::new(store.clone(), clock.clone(), scheduler.clone(), options);
            Self {
                guard,
                store,
                clock,
                scheduler,
                first,
            }
        }

        fn advance(&self, by: Duration) {
            self.clock.advance(by);
            self.scheduler.run_due();
        }
    }

    fn five_minutes() -> SessionOptions {
        SessionOptions {
            auto_lock_timeout: Duration::from_secs(300),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn starts_locked_and_unlocks_with_pin() {
        let harness = Harness::new(five_minutes());
        assert!(!harness.guard.is_unlocked());

        harness.guard.unlock(&secret("1234")).unwrap();
        assert!(harness.guard.is_unlocked());
        assert_eq!(harness.guard.current_master_key_id(), Some(harness.first));
        assert_eq!(harness.guard.current_sub_wallet_index(), 0);
    }

    #[test]
    fn wrong_pin_stays_locked() {
        let harness = Harness::new(five_minutes());
        let err = harness.guard.unlock(&secret("0000")).unwrap_err();
        assert!(matches!(err, WalletError::Unauthorized(_)));
        assert!(!harness.guard.is_unlocked());
        assert_eq!(harness.guard.remaining_attempts(), 4);
    }

    #[test]
    fn unlock_without_master_key_is_not_found() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(WalletStore::new(
            Arc::new(MemorySecureStore::new()),
            fast_engine(clock.clone()),
        ));
        let guard = SessionGuard::new(
            store,
            clock.clone(),
            Arc::new(ManualScheduler::new(clock)),
            SessionOptions::default(),
        );
        assert!(matches!(
            guard.unlock(&secret("1234")),
            Err(WalletError::NotFound(_))
        ));
    }

    #[test]
    fn lock_holds_until_next_unlock() {
        let harness = Harness::new(five_minutes());
        harness.guard.unlock(&secret("1234")).unwrap();

        harness.guard.lock();
        assert!(!harness.guard.is_unlocked());
        assert_eq!(harness.guard.last_activity(), None);
        assert_eq!(harness.scheduler.pending(), 0);
        assert_eq!(harness.guard.last_lock_reason(), Some(LockReason::Manual));

        harness.advance(Duration::from_secs(30));
        assert!(!harness.guard.is_unlocked());
        assert!(!harness.guard.update_activity());

        harness.guard.unlock(&secret("1234")).unwrap();
        assert!(harness.guard.is_unlocked());
    }

    #[test]
    fn auto_lock_fires_strictly_after_timeout() {
        let harness = Harness::new(five_minutes());
        harness.guard.unlock(&secret("1234")).unwrap();

        harness.advance(Duration::from_secs(299));
        assert!(harness.guard.is_unlocked());

        harness.advance(Duration::from_secs(1));
        assert!(harness.guard.is_unlocked(), "exactly 300s is not past the timeout");

        harness.advance(Duration::from_millis(1));
        assert!(!harness.guard.is_unlocked());
        assert_eq!(harness.guard.last_lock_reason(), Some(LockReason::Timeout));
    }

    #[test]
    fn deferred_timer_locks_without_queries() {
        let harness = Harness::new(five_minutes());
        let mut events = harness.guard.subscribe();
        harness.guard.unlock(&secret("1234")).unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Unlocked {
                method: UnlockMethod::Pin,
                ..
            }
        ));

        harness.advance(Duration::from_secs(301));
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Locked {
                reason: LockReason::Timeout
            }
        );

        // querying afterwards does not emit a second lock event
        assert!(!harness.guard.is_unlocked());
        harness.guard.lock();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn activity_pushes_the_deadline_back() {
        let harness = Harness::new(five_minutes());
        harness.guard.unlock(&secret("1234")).unwrap();

        harness.advance(Duration::from_secs(200));
        assert!(harness.guard.update_activity());
        assert_eq!(harness.scheduler.pending(), 1);

        harness.advance(Duration::from_secs(200));
        assert!(harness.guard.is_unlocked());
        assert_eq!(harness.guard.seconds_until_auto_lock(), Some(100));

        harness.advance(Duration::from_secs(101));
        assert!(!harness.guard.is_unlocked());
    }

    #[test]
    fn foreground_rechecks_expiry() {
        let harness = Harness::new(five_minutes());
        harness.guard.unlock(&secret("1234")).unwrap();
        harness.guard.handle_lifecycle(AppLifecycle::Background);

        // timers do not run while suspended
        harness.clock.advance(Duration::from_secs(600));
        harness.guard.handle_lifecycle(AppLifecycle::Foreground);
        assert_eq!(harness.guard.last_lock_reason(), Some(LockReason::Timeout));
        assert!(!harness.guard.is_unlocked());
    }

    #[test]
    fn zero_timeout_disables_auto_lock() {
        let harness = Harness::new(SessionOptions {
            auto_lock_timeout: Duration::ZERO,
            ..SessionOptions::default()
        });
        harness.guard.unlock(&secret("1234")).unwrap();
        assert_eq!(harness.scheduler.pending(), 0);

        harness.advance(Duration::from_secs(86_400));
        assert!(harness.guard.is_unlocked());
        assert_eq!(harness.guard.seconds_until_auto_lock(), None);
    }

    #[test]
    fn changing_timeout_reschedules() {
        let harness = Harness::new(five_minutes());
        harness.guard.unlock(&secret("1234")).unwrap();
        harness.advance(Duration::from_secs(100));

        harness.guard.set_auto_lock_timeout(Duration::from_secs(60));
        assert!(!harness.guard.is_unlocked(), "100s idle exceeds the new 60s timeout");

        harness.guard.unlock(&secret("1234")).unwrap();
        harness.guard.set_auto_lock_timeout(Duration::from_secs(120));
        harness.advance(Duration::from_secs(121));
        assert!(!harness.guard.is_unlocked());
    }

    #[test]
    fn select_sub_wallet_needs_no_pin() {
        let harness = Harness::new(five_minutes());
        let index = harness
            .store
            .add_sub_wallet(&harness.first, "Spending")
            .unwrap();
        let mut events = harness.guard.subscribe();

        harness.guard.select_sub_wallet(index).unwrap();
        assert_eq!(harness.guard.current_sub_wallet_index(), index);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SubWalletSelected {
                master_key_id: harness.first,
                index
            }
        );
        let info = harness.store.get_active_wallet_info().unwrap().unwrap();
        assert_eq!(info.sub_wallet_index, index);

        assert!(matches!(
            harness.guard.select_sub_wallet(17),
            Err(WalletError::NotFound(_))
        ));

        // a later unlock resumes on the persisted sub-wallet
        harness.guard.unlock(&secret("1234")).unwrap();
        assert_eq!(harness.guard.current_sub_wallet_index(), index);
    }

    #[test]
    fn removed_master_key_locks_instead_of_adopting_fallback() {
        let harness = Harness::new(five_minutes());
        let second = harness
            .store
            .create_master_key(&secret(ZOO), "Wallet B", &secret("5678"))
            .unwrap();
        harness.guard.unlock(&secret("1234")).unwrap();
        let mut events = harness.guard.subscribe();

        harness.store.remove_master_key(&harness.first).unwrap();
        harness.guard.select_sub_wallet(MAIN_WALLET_INDEX).unwrap();

        assert!(!harness.guard.is_unlocked());
        assert_eq!(harness.guard.current_master_key_id(), Some(second));
        assert_eq!(
            harness.guard.last_lock_reason(),
            Some(LockReason::MasterKeyRemoved)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Locked {
                reason: LockReason::MasterKeyRemoved
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SubWalletSelected {
                master_key_id: second,
                index: MAIN_WALLET_INDEX
            }
        );

        // the fallback key still needs its own PIN
        assert!(matches!(
            harness.guard.unlock(&secret("1234")),
            Err(WalletError::Unauthorized(_))
        ));
        harness.advance(Duration::from_secs(2));
        harness.guard.unlock(&secret("5678")).unwrap();
        assert_eq!(harness.guard.current_master_key_id(), Some(second));
    }

    #[test]
    fn switch_master_key_verifies_target_pin() {
        let harness = Harness::new(five_minutes());
        let second = harness
            .store
            .create_master_key(&secret(ZOO), "Wallet B", &secret("5678"))
            .unwrap();
        harness.guard.unlock(&secret("1234")).unwrap();

        let err = harness
            .guard
            .switch_master_key(&second, &secret("1234"))
            .unwrap_err();
        assert!(matches!(err, WalletError::Unauthorized(_)));
        assert_eq!(harness.guard.current_master_key_id(), Some(harness.first));

        harness.clock.advance(Duration::from_secs(2));
        harness
            .guard
            .switch_master_key(&second, &secret("5678"))
            .unwrap();
        assert_eq!(harness.guard.current_master_key_id(), Some(second));
        assert_eq!(harness.store.active_master_key_id().unwrap(), Some(second));

        assert!(matches!(
            harness.guard.switch_master_key(&Uuid::new_v4(), &secret("5678")),
            Err(WalletError::NotFound(_))
        ));
    }

    #[test]
    fn unlock_any_selects_matching_key() {
        let harness = Harness::new(five_minutes());
        let second = harness
            .store
            .create_master_key(&secret(ZOO), "Wallet B", &secret("5678"))
            .unwrap();

        let unlocked = harness.guard.unlock_any(&secret("5678")).unwrap();
        assert_eq!(unlocked.id, second);
        assert_eq!(unlocked.mnemonic.as_str(), ZOO);
        assert_eq!(harness.guard.current_master_key_id(), Some(second));
        assert!(harness.guard.is_unlocked());
    }

    #[test]
    fn failed_attempts_back_off() {
        let harness = Harness::new(SessionOptions {
            max_failed_attempts: 3,
            ..five_minutes()
        });

        assert!(matches!(
            harness.guard.unlock(&secret("0000")),
            Err(WalletError::Unauthorized(_))
        ));
        let err = harness.guard.unlock(&secret("1234")).unwrap_err();
        assert!(matches!(err, WalletError::PermissionDenied(msg) if msg.contains("Retry")));

        harness.clock.advance(Duration::from_secs(1));
        assert!(harness.guard.unlock(&secret("0000")).is_err());
        harness.clock.advance(Duration::from_secs(1));
        assert!(matches!(
            harness.guard.unlock(&secret("1234")),
            Err(WalletError::PermissionDenied(_))
        ));

        harness.clock.advance(Duration::from_secs(1));
        assert!(harness.guard.unlock(&secret("0000")).is_err());
        assert_eq!(harness.guard.remaining_attempts(), 0);

        // the maximum applies the capped window
        harness.clock.advance(Duration::from_secs(31));
        assert!(matches!(
            harness.guard.unlock(&secret("1234")),
            Err(WalletError::PermissionDenied(_))
        ));
        harness.clock.advance(Duration::from_secs(1));
        harness.guard.unlock(&secret("1234")).unwrap();
        assert_eq!(harness.guard.remaining_attempts(), 3);
    }

    #[test]
    fn biometric_unlock_substitutes_for_pin() {
        let harness = Harness::new(five_minutes());
        assert!(matches!(
            harness.guard.unlock_with_biometric("Unlock wallet"),
            Err(WalletError::PermissionDenied(_))
        ));

        let authenticator = Arc::new(ScriptedAuthenticator::approving());
        harness
            .guard
            .set_biometrics(Some(BiometricGate::new(authenticator.clone(), true)));
        let mut events = harness.guard.subscribe();

        harness.guard.unlock_with_biometric("Unlock wallet").unwrap();
        assert!(harness.guard.is_unlocked());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Unlocked {
                master_key_id: harness.first,
                method: UnlockMethod::Biometric
            }
        );

        harness.guard.lock();
        authenticator.set_approve(false);
        assert!(matches!(
            harness.guard.unlock_with_biometric("Unlock wallet"),
            Err(WalletError::Unauthorized(_))
        ));
        assert!(!harness.guard.is_unlocked());
        assert_eq!(harness.guard.remaining_attempts(), 5);
    }

    #[test]
    fn dropped_guard_leaves_timer_inert() {
        let harness = Harness::new(five_minutes());
        harness.guard.unlock(&secret("1234")).unwrap();
        let scheduler = harness.scheduler.clone();
        let clock = harness.clock.clone();
        drop(harness);

        clock.advance(Duration::from_secs(400));
        assert_eq!(scheduler.run_due(), 0);
    }
}
