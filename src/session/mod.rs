//! # Session Module
//!
//! Owns one authenticated IMAP connection per account and drives it through
//! an explicit state machine:
//!
//! ```text
//! (none) ──connect──▶ Connecting ──login+probe ok──▶ Connected
//!                        │  ▲                          │    │
//!              failure   ▼  │ retry after backoff      │    │ disconnect
//!                       Error ◀──── probe/command abort┘    ▼
//!                         └──────── disconnect ───▶ Disconnected
//! ```
//!
//! - **Manager**: registry keyed by address, connect/disconnect, command serialization
//! - **Backoff**: pure delay policy plus an injectable sleeper
//! - **Keepalive**: background NOOP during idle periods
//! - **Lockout**: progressive lock after repeated authentication failures
//! - **Cleanup**: periodic pruning of stale failed sessions

pub mod backoff;
mod cleanup;
mod keepalive;
pub mod lockout;
mod manager;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::mail::{MailError, MailResult};

pub use backoff::{backoff, jittered_backoff, Sleeper, TokioSleeper};
pub use lockout::AuthLockout;
pub use manager::{SessionManager, SessionStats};

/// Opaque session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Error => "ERROR",
        }
    }

    /// Edges of the session state machine. Everything else is rejected.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Error, Connecting)
                | (Error, Disconnected)
                | (Disconnected, Connecting)
        )
    }

    pub fn transition(self, next: SessionState) -> MailResult<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MailError::InvalidTransition { from: self, to: next })
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session.
///
/// The live record is owned by the manager; callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub address: String,
    pub state: SessionState,
    pub selected_folder: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Outcome of the most recent liveness probe
    pub last_probe_ok: bool,
}

impl Session {
    /// New session, registered in `Connecting`
    pub fn new(address: &str) -> Self {
        Self {
            id: SessionId::new(),
            address: address.to_string(),
            state: SessionState::Connecting,
            selected_folder: None,
            connected_at: None,
            last_activity_at: Utc::now(),
            retry_count: 0,
            last_probe_ok: false,
        }
    }

    /// Apply a state change, with the bookkeeping each edge implies.
    pub fn transition(&mut self, next: SessionState) -> MailResult<()> {
        self.state = self.state.transition(next)?;

        match next {
            SessionState::Connected => {
                let now = Utc::now();
                self.connected_at = Some(now);
                self.last_activity_at = now;
                self.retry_count = 0;
                self.last_probe_ok = true;
            }
            SessionState::Error => self.last_probe_ok = false,
            SessionState::Disconnected => {
                self.last_probe_ok = false;
                self.selected_folder = None;
            }
            SessionState::Connecting => {}
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn is_alive(&self) -> bool {
        self.state == SessionState::Connected && self.last_probe_ok
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or_default()
    }

    /// Non-connected sessions idle longer than `max_idle`
    pub fn is_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        self.state != SessionState::Connected && self.idle_for(now) > max_idle
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            address: self.address.clone(),
        }
    }
}

/// Reference to a registered session, returned by `SessionManager::connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub id: SessionId,
    pub address: String,
}

/// Result of a connect call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was established
    Connected(SessionHandle),
    /// The address already had a live or in-progress session
    AlreadyConnected(SessionHandle),
}

impl ConnectOutcome {
    pub fn handle(&self) -> &SessionHandle {
        match self {
            ConnectOutcome::Connected(handle) | ConnectOutcome::AlreadyConnected(handle) => handle,
        }
    }

    pub fn into_handle(self) -> SessionHandle {
        match self {
            ConnectOutcome::Connected(handle) | ConnectOutcome::AlreadyConnected(handle) => handle,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ConnectOutcome::Connected(_))
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("Session mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}
