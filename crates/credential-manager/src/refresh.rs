//! Proactive background token refresh
//!
//! One task per manager wakes every check interval and runs the same
//! `refresh_if_needed` path the startup check uses. Failures are logged and
//! retried on the next tick; the loop only exits on cancellation or when the
//! manager itself has been dropped.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::manager::{CredentialManager, RefreshOutcome};

/// Spawn the periodic refresh task for `manager`.
///
/// The task holds only a weak reference so an abandoned manager does not keep
/// its loop alive.
pub(crate) fn spawn_refresh_loop(manager: &CredentialManager) -> JoinHandle<()> {
    let weak = manager.downgrade();
    let cancel = manager.cancel_token();
    let interval = manager.check_interval();
    let name = manager.name().to_string();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick; start() just ran a check
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(provider = %name, "refresh loop cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let Some(inner) = weak.upgrade() else {
                debug!(provider = %name, "manager dropped, refresh loop exiting");
                break;
            };
            let manager = CredentialManager::from_inner(inner);

            // Not raced against cancellation: a rotated refresh token must
            // reach the store once the exchange has happened.
            match manager.refresh_if_needed().await {
                Ok(RefreshOutcome::NotNeeded) => {}
                Ok(outcome) => {
                    info!(provider = %name, outcome = outcome.label(), "background refresh check")
                }
                Err(e) if e.is_revoked() => {
                    warn!(provider = %name, error = %e, "refresh token rejected, provider will become unavailable at expiry")
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "background refresh failed, will retry next cycle")
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chrono::TimeDelta;
    use tokio_util::sync::CancellationToken;

    use crate::manager::tests::{MemoryStore, StubRefresher, manager, record};
    use crate::manager::{CredentialManager, Lifecycle, ManagerOptions};

    #[tokio::test]
    async fn loop_refreshes_once_token_enters_window() {
        let refresher = StubRefresher::new(Duration::ZERO);
        // Outside the 60s window at start, inside it after ~500ms.
        let m = manager(
            MemoryStore::new(record(Some(TimeDelta::milliseconds(60_400)))),
            refresher.clone(),
            Duration::from_millis(50),
        )
        .await;

        m.start().await;
        assert_eq!(refresher.calls(), 0);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(refresher.calls(), 1);
        assert_eq!(m.authorization_header().await.unwrap(), "Bearer at_1");
        m.shutdown().await;
    }

    #[tokio::test]
    async fn loop_keeps_retrying_after_failures() {
        let refresher = StubRefresher::new(Duration::ZERO);
        refresher.fail.store(true, Ordering::SeqCst);
        let m = manager(
            MemoryStore::new(record(Some(TimeDelta::seconds(10)))),
            refresher.clone(),
            Duration::from_millis(20),
        )
        .await;

        m.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(refresher.calls() >= 3, "calls: {}", refresher.calls());

        refresher.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(m.authorization_header().await.unwrap().starts_with("Bearer at_"));
        assert_ne!(m.authorization_header().await.unwrap(), "Bearer at_loaded");
        m.shutdown().await;
    }

    #[tokio::test]
    async fn parent_cancellation_stops_the_loop() {
        let refresher = StubRefresher::new(Duration::ZERO);
        refresher.fail.store(true, Ordering::SeqCst);
        let parent = CancellationToken::new();
        let m = CredentialManager::new(
            "test",
            MemoryStore::new(record(Some(TimeDelta::seconds(10)))),
            refresher.clone(),
            ManagerOptions {
                refresh_window: Duration::from_secs(60),
                check_interval: Duration::from_millis(20),
                parent_cancel: Some(parent.clone()),
            },
        )
        .await
        .unwrap();

        m.start().await;
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = refresher.calls();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(refresher.calls(), calls);

        // Shutdown still completes and records the terminal state.
        m.shutdown().await;
        assert_eq!(m.lifecycle().await, Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn dropped_manager_ends_loop() {
        let refresher = StubRefresher::new(Duration::ZERO);
        refresher.fail.store(true, Ordering::SeqCst);
        let m = manager(
            MemoryStore::new(record(Some(TimeDelta::seconds(10)))),
            refresher.clone(),
            Duration::from_millis(20),
        )
        .await;

        m.start().await;
        drop(m);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let calls = refresher.calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(refresher.calls(), calls);
        assert_eq!(Arc::strong_count(&refresher), 1);
    }
}
