//! Background keepalive
//!
//! One task per session wakes every `check_interval` and sends NOOP once the
//! connection has been idle for `idle_threshold`. The task never waits for
//! the connection: if a foreground command holds it, the tick is skipped.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

use super::lock;
use super::manager::{ConnectionSlot, SessionManager, SessionSlot};
use super::SessionState;
use crate::mail::transport::TransportError;
use crate::mail::{MailError, MailResult};

impl SessionManager {
    /// Start the keepalive task for `slot` unless one is already running.
    pub(super) fn spawn_keepalive(&self, slot: &Arc<SessionSlot>) {
        let mut task = lock(&slot.keepalive);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        // Weak, so idle sessions do not keep a dropped manager alive
        let manager = Arc::downgrade(&self.inner);
        let slot = Arc::clone(slot);
        let check_interval = self.inner.config.keepalive.check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = slot.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = manager.upgrade() else {
                    break;
                };
                SessionManager { inner }.keepalive_tick(&slot).await;
            }

            log::debug!("Keepalive for session {} stopped", slot.id);
        });

        *task = Some(handle);
    }

    async fn keepalive_tick(&self, slot: &Arc<SessionSlot>) {
        let session = slot.snapshot();
        if session.state != SessionState::Connected {
            return;
        }
        if session.idle_for(Utc::now()) < self.inner.config.keepalive.idle_threshold {
            return;
        }

        let Ok(mut guard) = slot.conn.try_lock() else {
            log::debug!("Session {} busy, skipping keepalive", slot.id);
            return;
        };

        match self.probe(slot, &mut guard).await {
            Ok(()) => log::debug!("Keepalive NOOP ok for session {}", slot.id),
            Err(err) => log::warn!("Keepalive failed for session {}: {}", slot.id, err),
        }
    }

    /// NOOP on a locked connection. Any failure marks the session broken.
    pub(super) async fn probe(&self, slot: &Arc<SessionSlot>, guard: &mut ConnectionSlot) -> MailResult<()> {
        if slot.state() != SessionState::Connected {
            return Err(MailError::NotConnected);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(MailError::NotConnected);
        };

        match tokio::time::timeout(self.inner.config.imap.command_timeout, conn.noop()).await {
            Ok(Ok(())) => {
                slot.update(|s| {
                    s.last_probe_ok = true;
                    s.touch();
                });
                Ok(())
            }
            Ok(Err(err)) => {
                self.mark_broken(slot, guard, &err);
                Err(MailError::ConnectionLost(err.sanitized().to_string()))
            }
            Err(_) => {
                self.mark_broken(slot, guard, &TransportError::Timeout);
                Err(MailError::ConnectionLost("Keepalive probe timed out".to_string()))
            }
        }
    }
}
