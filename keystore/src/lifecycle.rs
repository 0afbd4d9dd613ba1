/// App foreground/background notifications feeding the session.
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::SessionGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Forward lifecycle events to `guard` until the sender side closes.
pub fn spawn_lifecycle_watcher(
    guard: SessionGuard,
    mut events: mpsc::Receiver<AppLifecycle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log::debug!("Lifecycle event: {:?}", event);
            guard.handle_lifecycle(event);
        }
        log::debug!("Lifecycle channel closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::tests::fast_engine;
    use crate::session::{LockReason, SessionOptions};
    use crate::storage::MemorySecureStore;
    use crate::timer::ManualScheduler;
    use crate::wallet_store::tests::{secret, ABANDON};
    use crate::wallet_store::WalletStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn foreground_event_locks_expired_session() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(WalletStore::new(
            Arc::new(MemorySecureStore::new()),
            fast_engine(clock.clone()),
        ));
        store
            .create_master_key(&secret(ABANDON), "Wallet A", &secret("1234"))
            .unwrap();
        let guard = SessionGuard::new(
            store,
            clock.clone(),
            Arc::new(ManualScheduler::new(clock.clone())),
            SessionOptions {
                auto_lock_timeout: Duration::from_secs(60),
                ..SessionOptions::default()
            },
        );
        guard.unlock(&secret("1234")).unwrap();

        let (tx, rx) = mpsc::channel(4);
        let watcher = spawn_lifecycle_watcher(guard.clone(), rx);

        tx.send(AppLifecycle::Background).await.unwrap();
        clock.advance(Duration::from_secs(61));
        tx.send(AppLifecycle::Foreground).await.unwrap();
        drop(tx);
        watcher.await.unwrap();

        assert_eq!(guard.last_lock_reason(), Some(LockReason::Timeout));
        assert!(!guard.is_unlocked());
    }
}
