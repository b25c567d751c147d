//! Session Manager
//!
//! Registry of sessions keyed by normalized address, the connect/retry driver,
//! and the serialized command path every folder and fetch operation goes
//! through. Each session owns one transport connection behind an async mutex;
//! holding that mutex is the only way to put a command on the wire.

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::{jittered_backoff, Sleeper, TokioSleeper};
use super::lockout::AuthLockout;
use super::{lock, ConnectOutcome, Session, SessionHandle, SessionId, SessionState};
use crate::mail::credentials::{hash_address, normalize_address, Credentials, Secret};
use crate::mail::transport::{Connection, Connector, MailboxCounts, TransportError};
use crate::mail::{AsyncImapConnector, MailError, MailResult, SessionConfig};

pub(crate) type ConnectionSlot = Option<Box<dyn Connection>>;

/// Command run against the locked connection
pub(crate) type CommandFuture<'c, T> = BoxFuture<'c, Result<T, TransportError>>;

/// Live state of one registered session
pub(super) struct SessionSlot {
    pub(super) id: SessionId,
    key: String,
    info: StdMutex<Session>,
    pub(super) conn: AsyncMutex<ConnectionSlot>,
    /// Kept for automatic reconnect; zeroized when the slot drops
    secret: StdMutex<Secret>,
    pub(super) reconnecting: AtomicBool,
    /// Set while a caller's connect drives the retry loop
    connecting: AtomicBool,
    /// Cancelled on disconnect or prune; stops keepalive and reconnect
    pub(super) shutdown: CancellationToken,
    pub(super) keepalive: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionSlot {
    fn new(session: Session, key: String, secret: Secret) -> Self {
        Self {
            id: session.id,
            key,
            info: StdMutex::new(session),
            conn: AsyncMutex::new(None),
            secret: StdMutex::new(secret),
            reconnecting: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            keepalive: StdMutex::new(None),
        }
    }

    pub(super) fn snapshot(&self) -> Session {
        lock(&self.info).clone()
    }

    pub(super) fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut lock(&self.info))
    }

    pub(super) fn state(&self) -> SessionState {
        lock(&self.info).state
    }

    fn handle(&self) -> SessionHandle {
        lock(&self.info).handle()
    }

    /// Hashed address for log lines
    pub(super) fn account(&self) -> String {
        hash_address(&self.key)
    }

    /// A connect or reconnect is in progress, possibly sleeping in backoff
    fn is_busy(&self) -> bool {
        self.connecting.load(Ordering::SeqCst) || self.reconnecting.load(Ordering::SeqCst)
    }

    fn stop_tasks(&self) {
        self.shutdown.cancel();
        if let Some(handle) = lock(&self.keepalive).take() {
            handle.abort();
        }
    }
}

/// Clears the connecting flag when a connect returns or is dropped.
/// A connect dropped mid-attempt leaves the session in `Error`.
struct ConnectGuard<'a>(&'a SessionSlot);

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.0.state() == SessionState::Connecting {
            if let Err(err) = self.0.update(|s| s.transition(SessionState::Error)) {
                log::debug!("Session {}: {}", self.0.id, err);
            }
        }
        self.0.connecting.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Registry {
    by_address: HashMap<String, SessionId>,
    sessions: HashMap<SessionId, Arc<SessionSlot>>,
}

pub(super) struct Inner {
    connector: Arc<dyn Connector>,
    pub(super) config: SessionConfig,
    sleeper: Arc<dyn Sleeper>,
    registry: StdMutex<Registry>,
    lockout: AuthLockout,
    pub(super) cleanup: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.cleanup).take() {
            handle.abort();
        }
    }
}

/// Session counts by state
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub reconnecting: usize,
    pub stale: usize,
    pub by_state: HashMap<String, usize>,
}

enum Claim {
    Existing(SessionHandle),
    Fresh(Arc<SessionSlot>),
}

enum AttemptError {
    Rejected,
    Cancelled,
    Failed(TransportError),
}

/// Connection plus the folder that was re-selected on it, if any
type Established = (Box<dyn Connection>, Option<String>);

/// Supervises sessions for any number of accounts.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    pub(super) inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> MailResult<Self> {
        Self::with_sleeper(connector, config, Arc::new(TokioSleeper))
    }

    /// Manager whose retry delays go through `sleeper`
    pub fn with_sleeper(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> MailResult<Self> {
        config
            .validate()
            .map_err(|errors| MailError::Config(errors.join("; ")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                connector,
                config,
                sleeper,
                registry: StdMutex::new(Registry::default()),
                lockout: AuthLockout::new(),
                cleanup: StdMutex::new(None),
            }),
        })
    }

    /// Manager backed by real TLS connections
    pub fn imap(config: SessionConfig) -> MailResult<Self> {
        let connector = Arc::new(AsyncImapConnector::new(config.imap.clone()));
        Self::new(connector, config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Validate the pair, then connect.
    pub async fn connect(&self, address: &str, secret: &str) -> MailResult<ConnectOutcome> {
        let mut credentials = Credentials::new(address, secret)?;
        self.connect_with(&mut credentials, &CancellationToken::new()).await
    }

    /// Connect with already validated credentials.
    ///
    /// Returns `AlreadyConnected` with the existing handle when the address has
    /// a session that is connecting, connected or reconnecting. Cancelling
    /// `cancel` during login leaves the session in `Error`.
    pub async fn connect_with(
        &self,
        credentials: &mut Credentials,
        cancel: &CancellationToken,
    ) -> MailResult<ConnectOutcome> {
        let account = hash_address(&credentials.address);

        if let Err(retry_after_secs) = self.inner.lockout.check(&credentials.address) {
            log::warn!("Connect refused for account {}: locked out", account);
            return Err(MailError::LockedOut { retry_after_secs });
        }

        self.spawn_cleanup();

        let slot = match self.claim(credentials)? {
            Claim::Existing(handle) => {
                log::debug!("Account {} already has session {}", account, handle.id);
                return Ok(ConnectOutcome::AlreadyConnected(handle));
            }
            Claim::Fresh(slot) => slot,
        };
        let _driving = ConnectGuard(&slot);

        log::info!("Connecting session {} for account {}", slot.id, account);

        match self.establish(&slot, credentials.secret(), cancel).await {
            Ok(()) => {
                credentials.mark_used();
                self.inner.lockout.clear(&credentials.address);
                self.spawn_keepalive(&slot);
                log::info!("Session {} connected", slot.id);
                Ok(ConnectOutcome::Connected(slot.handle()))
            }
            Err(err) => {
                if matches!(err, MailError::AuthenticationFailed(_)) {
                    self.inner.lockout.record_failure(&credentials.address);
                }
                log::error!("Session {} failed to connect: {}", slot.id, err);
                Err(err)
            }
        }
    }

    /// Register a session for the address, or report the existing one.
    ///
    /// Check and insert happen under one registry lock, so two concurrent
    /// connects for the same address cannot both get `Fresh`. A slot whose
    /// connect is still retrying counts as taken.
    fn claim(&self, credentials: &Credentials) -> MailResult<Claim> {
        let key = normalize_address(&credentials.address);
        let mut registry = lock(&self.inner.registry);

        let existing = registry
            .by_address
            .get(&key)
            .and_then(|id| registry.sessions.get(id))
            .cloned();

        if let Some(slot) = existing {
            let busy = matches!(slot.state(), SessionState::Connecting | SessionState::Connected)
                || slot.is_busy();
            if busy {
                return Ok(Claim::Existing(slot.handle()));
            }

            // Failed session: fresh attempt on the same slot
            slot.update(|s| {
                s.retry_count = 0;
                s.transition(SessionState::Connecting)
            })?;
            *lock(&slot.secret) = credentials.secret().clone();
            slot.connecting.store(true, Ordering::SeqCst);
            return Ok(Claim::Fresh(slot));
        }

        let session = Session::new(&credentials.address);
        let slot = Arc::new(SessionSlot::new(session, key.clone(), credentials.secret().clone()));
        slot.connecting.store(true, Ordering::SeqCst);
        registry.by_address.insert(key, slot.id);
        registry.sessions.insert(slot.id, Arc::clone(&slot));
        Ok(Claim::Fresh(slot))
    }

    /// Retry driver: attempt, back off, attempt again until connected,
    /// rejected, cancelled or out of retries. Expects `Connecting`.
    async fn establish(
        &self,
        slot: &Arc<SessionSlot>,
        secret: &Secret,
        cancel: &CancellationToken,
    ) -> MailResult<()> {
        let policy = &self.inner.config.retry;

        loop {
            let outcome = self.attempt(slot, secret, cancel).await;
            if slot.shutdown.is_cancelled() {
                return Err(MailError::Cancelled);
            }

            match outcome {
                Ok(established) => return self.install(slot, established).await,
                Err(AttemptError::Rejected) => {
                    slot.update(|s| {
                        s.retry_count += 1;
                        s.transition(SessionState::Error)
                    })?;
                    return Err(MailError::AuthenticationFailed(
                        "Invalid email or password".to_string(),
                    ));
                }
                Err(AttemptError::Cancelled) => {
                    slot.update(|s| s.transition(SessionState::Error))?;
                    log::info!("Connect for session {} cancelled", slot.id);
                    return Err(MailError::Cancelled);
                }
                Err(AttemptError::Failed(err)) => {
                    let retry_count = slot.update(|s| {
                        s.retry_count += 1;
                        s.transition(SessionState::Error).map(|_| s.retry_count)
                    })?;

                    log::warn!(
                        "Session {} attempt {}/{} failed: {}",
                        slot.id,
                        retry_count,
                        policy.max_retries,
                        err.sanitized()
                    );

                    if retry_count >= policy.max_retries {
                        return Err(MailError::ConnectionFailed {
                            attempts: retry_count,
                            reason: err.sanitized().to_string(),
                        });
                    }

                    let delay = jittered_backoff(policy, retry_count - 1);
                    log::info!("Retrying session {} in {:?}", slot.id, delay);

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(MailError::Cancelled),
                        _ = slot.shutdown.cancelled() => return Err(MailError::Cancelled),
                        _ = self.inner.sleeper.sleep(delay) => {}
                    }

                    slot.update(|s| s.transition(SessionState::Connecting))?;
                }
            }
        }
    }

    /// One login, probe and re-select, bounded by the connect timeout.
    async fn attempt(
        &self,
        slot: &Arc<SessionSlot>,
        secret: &Secret,
        cancel: &CancellationToken,
    ) -> Result<Established, AttemptError> {
        let session = slot.snapshot();
        let connector = &self.inner.connector;
        let account = slot.account();

        let login = async move {
            let mut conn = connector.connect(&session.address, secret).await?;
            conn.noop().await?;

            let mut reselected = None;
            if let Some(folder) = session.selected_folder {
                match conn.select(&folder).await {
                    Ok(_) => reselected = Some(folder),
                    Err(err) if err.is_connection_abort() => return Err(err),
                    Err(err) => log::warn!(
                        "Account {} could not re-select its folder: {}",
                        account,
                        err.sanitized()
                    ),
                }
            }
            Ok::<_, TransportError>((conn, reselected))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            _ = slot.shutdown.cancelled() => Err(AttemptError::Cancelled),
            outcome = tokio::time::timeout(self.inner.config.imap.connect_timeout, login) => match outcome {
                Ok(Ok(established)) => Ok(established),
                Ok(Err(TransportError::Rejected(_))) => Err(AttemptError::Rejected),
                Ok(Err(err)) => Err(AttemptError::Failed(err)),
                Err(_) => Err(AttemptError::Failed(TransportError::Timeout)),
            },
        }
    }

    async fn install(&self, slot: &Arc<SessionSlot>, (conn, reselected): Established) -> MailResult<()> {
        let mut guard = slot.conn.lock().await;
        if slot.shutdown.is_cancelled() {
            return Err(MailError::Cancelled);
        }

        *guard = Some(conn);
        slot.update(|s| {
            s.selected_folder = reselected;
            s.transition(SessionState::Connected)
        })
    }

    pub(super) fn spawn_reconnect(&self, slot: Arc<SessionSlot>) {
        if slot.shutdown.is_cancelled() || slot.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect(&slot).await;
            slot.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect(&self, slot: &Arc<SessionSlot>) {
        let secret = lock(&slot.secret).clone();

        if let Err(err) = slot.update(|s| s.transition(SessionState::Connecting)) {
            log::debug!("Session {} not reconnecting: {}", slot.id, err);
            return;
        }

        log::info!("Reconnecting session {} for account {}", slot.id, slot.account());
        match self.establish(slot, &secret, &slot.shutdown).await {
            Ok(()) => log::info!("Session {} reconnected", slot.id),
            Err(err) => log::error!("Session {} gave up reconnecting: {}", slot.id, err),
        }
    }

    /// Drop a broken connection, move to `Error` and start reconnecting.
    pub(super) fn mark_broken(&self, slot: &Arc<SessionSlot>, conn: &mut ConnectionSlot, err: &TransportError) {
        conn.take();

        if slot.update(|s| s.transition(SessionState::Error)).is_err() {
            return;
        }

        log::warn!("Session {} lost its connection: {}", slot.id, err.sanitized());
        self.spawn_reconnect(Arc::clone(slot));
    }

    /// Log out and deregister. Unknown or already removed ids are a no-op.
    pub async fn disconnect(&self, id: SessionId) {
        let Some(slot) = self.deregister(id) else {
            log::debug!("Disconnect for unknown session {}", id);
            return;
        };

        slot.stop_tasks();

        let selected = slot.snapshot().selected_folder;
        let timeout = self.inner.config.imap.command_timeout;

        let mut guard = slot.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            if selected.is_some() {
                match tokio::time::timeout(timeout, conn.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => log::warn!("Closing folder for session {} failed: {}", id, err.sanitized()),
                    Err(_) => log::warn!("Closing folder for session {} timed out", id),
                }
            }

            match tokio::time::timeout(timeout, conn.logout()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::warn!("Logout for session {} failed: {}", id, err.sanitized()),
                Err(_) => log::warn!("Logout for session {} timed out", id),
            }
        }
        drop(guard);

        if let Err(err) = slot.update(|s| s.transition(SessionState::Disconnected)) {
            log::debug!("Session {}: {}", id, err);
        }
        log::info!("Session {} disconnected", id);
    }

    fn deregister(&self, id: SessionId) -> Option<Arc<SessionSlot>> {
        let mut registry = lock(&self.inner.registry);
        let slot = registry.sessions.remove(&id)?;
        if registry.by_address.get(&slot.key) == Some(&id) {
            registry.by_address.remove(&slot.key);
        }
        Some(slot)
    }

    /// Connected with a successful last probe. No I/O.
    pub fn is_alive(&self, id: SessionId) -> bool {
        self.slot(id).is_some_and(|slot| slot.snapshot().is_alive())
    }

    /// Probe the connection now, waiting for any in-flight command.
    pub async fn keepalive(&self, id: SessionId) -> MailResult<()> {
        let slot = self.connected_slot(id)?;
        let mut guard = slot.conn.lock().await;
        self.probe(&slot, &mut guard).await
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    pub fn session_for(&self, address: &str) -> Option<Session> {
        let registry = lock(&self.inner.registry);
        registry
            .by_address
            .get(&normalize_address(address))
            .and_then(|id| registry.sessions.get(id))
            .map(|slot| slot.snapshot())
    }

    pub fn session_stats(&self) -> SessionStats {
        let now = Utc::now();
        let stale_after = self.inner.config.stale_after;
        let registry = lock(&self.inner.registry);

        let mut stats = SessionStats {
            total: registry.sessions.len(),
            ..SessionStats::default()
        };

        for slot in registry.sessions.values() {
            let session = slot.snapshot();
            if session.is_alive() {
                stats.active += 1;
            }
            if slot.reconnecting.load(Ordering::SeqCst) {
                stats.reconnecting += 1;
            } else if !slot.is_busy() && session.is_stale(now, stale_after) {
                stats.stale += 1;
            }
            *stats.by_state.entry(session.state.to_string()).or_insert(0) += 1;
        }

        stats
    }

    /// Remove failed sessions idle longer than `stale_after`.
    /// Returns how many were removed. Also runs every `cleanup_interval`
    /// once the manager has seen a connect.
    pub fn prune_stale(&self) -> usize {
        let now = Utc::now();
        let stale_after = self.inner.config.stale_after;

        let removed: Vec<Arc<SessionSlot>> = {
            let mut registry = lock(&self.inner.registry);

            let stale_ids: Vec<SessionId> = registry
                .sessions
                .values()
                .filter(|slot| {
                    let session = slot.snapshot();
                    matches!(session.state, SessionState::Error | SessionState::Disconnected)
                        && !slot.is_busy()
                        && session.is_stale(now, stale_after)
                })
                .map(|slot| slot.id)
                .collect();

            stale_ids
                .iter()
                .filter_map(|id| {
                    let slot = registry.sessions.remove(id)?;
                    if registry.by_address.get(&slot.key) == Some(id) {
                        registry.by_address.remove(&slot.key);
                    }
                    Some(slot)
                })
                .collect()
        };

        for slot in &removed {
            slot.stop_tasks();
            log::info!("Pruned stale session {}", slot.id);
        }

        removed.len()
    }

    fn slot(&self, id: SessionId) -> Option<Arc<SessionSlot>> {
        lock(&self.inner.registry).sessions.get(&id).cloned()
    }

    fn connected_slot(&self, id: SessionId) -> MailResult<Arc<SessionSlot>> {
        match self.slot(id) {
            Some(slot) if slot.state() == SessionState::Connected => Ok(slot),
            _ => Err(MailError::NotConnected),
        }
    }

    /// Snapshot of a session that is currently connected
    pub(crate) fn connected_session(&self, id: SessionId) -> MailResult<Session> {
        self.connected_slot(id).map(|slot| slot.snapshot())
    }

    /// Run one command with exclusive use of the connection.
    ///
    /// Abort-class failures and timeouts mark the session broken and start a
    /// reconnect. Cancellation drops the command and then probes; the session
    /// stays connected if the probe succeeds.
    pub(crate) async fn execute<T, F>(
        &self,
        id: SessionId,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> MailResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn Connection) -> CommandFuture<'c, T> + Send,
    {
        let slot = self.connected_slot(id)?;
        let mut guard = slot.conn.lock().await;
        self.run_locked(&slot, &mut guard, timeout, cancel, op).await
    }

    /// SELECT and record the folder on the session under the same lock
    pub(crate) async fn select_mailbox(&self, id: SessionId, mailbox: &str) -> MailResult<MailboxCounts> {
        let slot = self.connected_slot(id)?;
        let mut guard = slot.conn.lock().await;

        let name = mailbox.to_string();
        let result = self
            .run_locked(&slot, &mut guard, self.inner.config.imap.command_timeout, None, move |conn| {
                Box::pin(async move { conn.select(&name).await })
            })
            .await;

        // A failed SELECT leaves no mailbox selected
        let selected = result.as_ref().ok().map(|_| mailbox.to_string());
        slot.update(|s| s.selected_folder = selected);

        result
    }

    async fn run_locked<T, F>(
        &self,
        slot: &Arc<SessionSlot>,
        guard: &mut ConnectionSlot,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> MailResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn Connection) -> CommandFuture<'c, T> + Send,
    {
        if slot.state() != SessionState::Connected {
            return Err(MailError::NotConnected);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(MailError::NotConnected);
        };

        let command = tokio::time::timeout(timeout, op(conn.as_mut()));
        let outcome = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => None,
                outcome = command => Some(outcome),
            },
            None => Some(command.await),
        };

        match outcome {
            Some(Ok(Ok(value))) => {
                slot.update(|s| s.touch());
                Ok(value)
            }
            Some(Ok(Err(err))) if err.is_connection_abort() => {
                self.mark_broken(slot, guard, &err);
                Err(MailError::ConnectionLost(err.sanitized().to_string()))
            }
            Some(Ok(Err(err))) => {
                slot.update(|s| s.touch());
                Err(MailError::Protocol(err.to_string()))
            }
            Some(Err(_)) => {
                self.mark_broken(slot, guard, &TransportError::Timeout);
                Err(MailError::ConnectionLost("Command timed out".to_string()))
            }
            None => {
                self.recover_after_cancel(slot, guard).await;
                Err(MailError::Cancelled)
            }
        }
    }

    async fn recover_after_cancel(&self, slot: &Arc<SessionSlot>, guard: &mut ConnectionSlot) {
        let Some(conn) = guard.as_mut() else {
            return;
        };

        match tokio::time::timeout(self.inner.config.imap.command_timeout, conn.noop()).await {
            Ok(Ok(())) => log::debug!("Session {} healthy after cancelled command", slot.id),
            Ok(Err(err)) => self.mark_broken(slot, guard, &err),
            Err(_) => self.mark_broken(slot, guard, &TransportError::Timeout),
        }
    }
}
