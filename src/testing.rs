//! Scripted IMAP server double for unit tests
//!
//! Every command is written to a wire log. Commands are tracked per account
//! while in flight; a command that starts before the previous one on the same
//! account finished is counted as an interleave.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::mail::config::{ImapConfig, KeepaliveConfig, RetryPolicy, SessionConfig};
use crate::mail::credentials::{normalize_address, Secret};
use crate::mail::transport::{Connection, Connector, MailboxCounts, RawMailbox, RawMessage, TransportError};
use crate::mail::FetchCriteria;
use crate::session::{lock, Sleeper};

pub(crate) const ADDRESS: &str = "user@gmail.com";
pub(crate) const APP_PASSWORD: &str = "abcdefghijklmnop";

/// How the next login attempt behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Login {
    Accept,
    Reject,
    Unreachable,
    /// Never answers; only a timeout or cancellation ends it
    Hang,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    flags: Vec<String>,
}

impl StoredMessage {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

#[derive(Default)]
struct ServerState {
    logins: VecDeque<Login>,
    login_attempts: u32,
    live_connections: u32,
    mailboxes: Vec<RawMailbox>,
    messages: HashMap<String, Vec<StoredMessage>>,
    wire: Vec<String>,
    in_flight: HashSet<String>,
    interleaved: u32,
    failing_noops: u32,
    failing_fetches: u32,
    fetch_delay: Option<Duration>,
}

/// In-memory server; clones share state
#[derive(Clone, Default)]
pub(crate) struct MockServer {
    state: Arc<StdMutex<ServerState>>,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// INBOX, the usual `[Gmail]` tree and one user label
    pub(crate) fn gmail() -> Self {
        let server = Self::new();
        server.add_mailbox("INBOX", &["\\HasNoChildren"]);
        server.add_mailbox("[Gmail]", &["\\Noselect", "\\HasChildren"]);
        server.add_mailbox("[Gmail]/Sent Mail", &["\\Sent"]);
        server.add_mailbox("[Gmail]/Drafts", &["\\Drafts"]);
        server.add_mailbox("[Gmail]/Trash", &["\\Trash"]);
        server.add_mailbox("Work", &["\\HasNoChildren"]);
        server
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub(crate) fn add_mailbox(&self, name: &str, attributes: &[&str]) {
        let mut state = lock(&self.state);
        state.mailboxes.push(RawMailbox {
            name: name.to_string(),
            delimiter: Some("/".to_string()),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        });
        state.messages.entry(name.to_string()).or_default();
    }

    pub(crate) fn add_message(&self, mailbox: &str, raw: &str, flags: &[&str]) {
        lock(&self.state)
            .messages
            .entry(mailbox.to_string())
            .or_default()
            .push(StoredMessage {
                body: raw.as_bytes().to_vec(),
                flags: flags.iter().map(|f| f.to_string()).collect(),
            });
    }

    /// Outcomes for the next logins; once exhausted every login is accepted
    pub(crate) fn script_logins(&self, logins: &[Login]) {
        lock(&self.state).logins.extend(logins.iter().copied());
    }

    pub(crate) fn fail_next_noops(&self, count: u32) {
        lock(&self.state).failing_noops = count;
    }

    pub(crate) fn fail_next_fetches(&self, count: u32) {
        lock(&self.state).failing_fetches = count;
    }

    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        lock(&self.state).fetch_delay = Some(delay);
    }

    pub(crate) fn wire(&self) -> Vec<String> {
        lock(&self.state).wire.clone()
    }

    pub(crate) fn count_commands(&self, prefix: &str) -> usize {
        lock(&self.state)
            .wire
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub(crate) fn interleaved(&self) -> u32 {
        lock(&self.state).interleaved
    }

    pub(crate) fn login_attempts(&self) -> u32 {
        lock(&self.state).login_attempts
    }

    pub(crate) fn live_connections(&self) -> u32 {
        lock(&self.state).live_connections
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(&self, address: &str, _secret: &Secret) -> Result<Box<dyn Connection>, TransportError> {
        let login = {
            let mut state = lock(&self.state);
            state.login_attempts += 1;
            state.wire.push("LOGIN".to_string());
            state.logins.pop_front().unwrap_or(Login::Accept)
        };

        match login {
            Login::Accept => {
                lock(&self.state).live_connections += 1;
                Ok(Box::new(MockConnection {
                    state: Arc::clone(&self.state),
                    account: normalize_address(address),
                    selected: None,
                    broken: false,
                }))
            }
            Login::Reject => Err(TransportError::Rejected(
                "[AUTHENTICATIONFAILED] Invalid credentials".to_string(),
            )),
            Login::Unreachable => Err(TransportError::Io("connection refused".to_string())),
            Login::Hang => futures::future::pending().await,
        }
    }
}

/// Marks a command in flight until dropped
struct InFlight {
    state: Arc<StdMutex<ServerState>>,
    account: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.state).in_flight.remove(&self.account);
    }
}

struct MockConnection {
    state: Arc<StdMutex<ServerState>>,
    account: String,
    selected: Option<String>,
    broken: bool,
}

impl MockConnection {
    fn begin(&self, command: String) -> Result<InFlight, TransportError> {
        {
            let mut state = lock(&self.state);
            if !state.in_flight.insert(self.account.clone()) {
                state.interleaved += 1;
            }
            state.wire.push(command);
        }

        let guard = InFlight {
            state: Arc::clone(&self.state),
            account: self.account.clone(),
        };
        if self.broken {
            return Err(TransportError::ConnectionLost);
        }
        Ok(guard)
    }

    fn counts(&self, mailbox: &str) -> Result<MailboxCounts, TransportError> {
        let state = lock(&self.state);
        let known = state
            .mailboxes
            .iter()
            .find(|m| m.name == mailbox)
            .ok_or_else(|| TransportError::Protocol("[NONEXISTENT] Unknown Mailbox".to_string()))?;
        if known.has_attribute("\\Noselect") {
            return Err(TransportError::Protocol("[NONEXISTENT] Mailbox not selectable".to_string()));
        }

        let messages = state.messages.get(mailbox).map(Vec::as_slice).unwrap_or_default();
        Ok(MailboxCounts {
            exists: messages.len() as u32,
            recent: messages.iter().filter(|m| m.has_flag("\\Recent")).count() as u32,
            unseen: messages.iter().filter(|m| !m.has_flag("\\Seen")).count() as u32,
        })
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.live_connections = state.live_connections.saturating_sub(1);
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn noop(&mut self) -> Result<(), TransportError> {
        let _guard = self.begin("NOOP".to_string())?;
        let mut state = lock(&self.state);
        if state.failing_noops > 0 {
            state.failing_noops -= 1;
            self.broken = true;
            return Err(TransportError::ConnectionLost);
        }
        Ok(())
    }

    async fn list(&mut self) -> Result<Vec<RawMailbox>, TransportError> {
        let _guard = self.begin("LIST".to_string())?;
        // Release the state lock before the in-flight guard drops
        let mailboxes = lock(&self.state).mailboxes.clone();
        Ok(mailboxes)
    }

    async fn select(&mut self, mailbox: &str) -> Result<MailboxCounts, TransportError> {
        let _guard = self.begin(format!("SELECT {}", mailbox))?;
        self.selected = None;
        let counts = self.counts(mailbox)?;
        self.selected = Some(mailbox.to_string());
        Ok(counts)
    }

    async fn status(&mut self, mailbox: &str) -> Result<MailboxCounts, TransportError> {
        let _guard = self.begin(format!("STATUS {}", mailbox))?;
        self.counts(mailbox)
    }

    async fn search(&mut self, criteria: FetchCriteria) -> Result<Vec<u32>, TransportError> {
        let _guard = self.begin(format!("SEARCH {}", criteria.as_imap()))?;
        let mailbox = self
            .selected
            .clone()
            .ok_or_else(|| TransportError::Protocol("No mailbox selected".to_string()))?;

        let state = lock(&self.state);
        let messages = state.messages.get(&mailbox).map(Vec::as_slice).unwrap_or_default();
        Ok(messages
            .iter()
            .enumerate()
            .filter(|(_, m)| match criteria {
                FetchCriteria::All => true,
                FetchCriteria::Unseen => !m.has_flag("\\Seen"),
                FetchCriteria::Recent => m.has_flag("\\Recent"),
            })
            .map(|(index, _)| index as u32 + 1)
            .collect())
    }

    async fn fetch(&mut self, seqs: &[u32]) -> Result<Vec<RawMessage>, TransportError> {
        let _guard = self.begin(format!("FETCH {}", crate::mail::transport::sequence_set(seqs)))?;

        let delay = lock(&self.state).fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mailbox = self
            .selected
            .clone()
            .ok_or_else(|| TransportError::Protocol("No mailbox selected".to_string()))?;

        let mut state = lock(&self.state);
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            self.broken = true;
            return Err(TransportError::Io("connection reset by peer".to_string()));
        }

        let messages = state.messages.get(&mailbox).cloned().unwrap_or_default();
        Ok(seqs
            .iter()
            .filter_map(|&seq| {
                let message = messages.get(seq.checked_sub(1)? as usize)?;
                Some(RawMessage {
                    seq,
                    uid: Some(seq + 1000),
                    flags: message.flags.clone(),
                    internal_date: None,
                    size: Some(message.body.len() as u32),
                    body: message.body.clone(),
                })
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _guard = self.begin("CLOSE".to_string())?;
        self.selected = None;
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        let _guard = self.begin("LOGOUT".to_string())?;
        self.broken = true;
        Ok(())
    }
}

/// Records requested delays and returns immediately
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    delays: StdMutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn delays(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        lock(&self.delays).push(duration);
        tokio::task::yield_now().await;
    }
}

/// Short timeouts, no jitter, keepalive effectively off
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        imap: ImapConfig {
            connect_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
            fetch_timeout: Duration::from_millis(500),
            ..ImapConfig::default()
        },
        retry: RetryPolicy {
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        },
        keepalive: KeepaliveConfig {
            idle_threshold: Duration::from_secs(3600),
            check_interval: Duration::from_secs(3600),
        },
        ..SessionConfig::default()
    }
}

/// Minimal RFC 822 message
pub(crate) fn rfc822(from: &str, subject: &str, body: &str) -> String {
    format!(
        "From: {from}\r\nTo: user@gmail.com\r\nSubject: {subject}\r\n\
         Date: Mon, 6 Jan 2025 10:00:00 +0000\r\nMessage-ID: <{subject}@example.com>\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
    )
}
