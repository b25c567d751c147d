//! Stale session cleanup
//!
//! One task per manager prunes failed sessions every `cleanup_interval`.
//! It only holds a weak reference, so it ends with the last manager clone.

use std::sync::Arc;
use tokio::time::MissedTickBehavior;

use super::lock;
use super::manager::SessionManager;

impl SessionManager {
    /// Start the cleanup task unless it is already running.
    pub(super) fn spawn_cleanup(&self) {
        let mut task = lock(&self.inner.cleanup);
        if task.is_some() {
            return;
        }

        let manager = Arc::downgrade(&self.inner);
        let cleanup_interval = self.inner.config.cleanup_interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(inner) = manager.upgrade() else {
                    break;
                };
                let removed = SessionManager { inner }.prune_stale();
                if removed > 0 {
                    log::info!("Cleanup removed {} stale session(s)", removed);
                }
            }

            log::debug!("Session cleanup stopped");
        }));
    }
}
