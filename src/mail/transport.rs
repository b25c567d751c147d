//! Connection transport abstraction
//!
//! A `Connector` opens an encrypted socket and authenticates; the resulting
//! `Connection` executes one command at a time. The session layer owns the
//! connection and never hands it to callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::credentials::Secret;
use super::FetchCriteria;

/// Failure reported by the wire layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Server refused the credentials
    #[error("credentials rejected by server")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("timed out")]
    Timeout,

    /// Server answered NO/BAD to a command other than login
    #[error("server refused command: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Failures after which the connection can no longer be trusted.
    pub fn is_connection_abort(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::Tls(_)
                | TransportError::ConnectionLost
                | TransportError::Timeout
        )
    }

    /// Generic category suitable for logs and user-facing text.
    pub fn sanitized(&self) -> &'static str {
        match self {
            TransportError::Rejected(_) => "Authentication credentials rejected",
            TransportError::Tls(_) => "SSL/TLS connection error",
            TransportError::Protocol(_) => "Server refused command",
            _ => "Connection error",
        }
    }
}

/// Raw LIST entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMailbox {
    pub name: String,
    pub delimiter: Option<String>,
    /// Name attributes such as `\Noselect`
    pub attributes: Vec<String>,
}

impl RawMailbox {
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|a| a.eq_ignore_ascii_case(attribute))
    }
}

/// Counts from SELECT or STATUS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxCounts {
    pub exists: u32,
    pub recent: u32,
    pub unseen: u32,
}

/// Raw FETCH item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub seq: u32,
    pub uid: Option<u32>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub size: Option<u32>,
    /// Full RFC 822 bytes
    pub body: Vec<u8>,
}

impl RawMessage {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// Opens authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str, secret: &Secret) -> Result<Box<dyn Connection>, TransportError>;
}

/// Authenticated, single-stream IMAP connection.
///
/// Not safe for concurrent use: callers serialize every command.
#[async_trait]
pub trait Connection: Send {
    /// Liveness probe
    async fn noop(&mut self) -> Result<(), TransportError>;

    async fn list(&mut self) -> Result<Vec<RawMailbox>, TransportError>;

    async fn select(&mut self, mailbox: &str) -> Result<MailboxCounts, TransportError>;

    /// Counts without changing the selected mailbox
    async fn status(&mut self, mailbox: &str) -> Result<MailboxCounts, TransportError>;

    /// Sequence numbers matching `criteria` in the selected mailbox
    async fn search(&mut self, criteria: FetchCriteria) -> Result<Vec<u32>, TransportError>;

    async fn fetch(&mut self, seqs: &[u32]) -> Result<Vec<RawMessage>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    async fn logout(&mut self) -> Result<(), TransportError>;
}

/// Compact IMAP sequence set, e.g. `1:3,7,9:10`.
pub fn sequence_set(seqs: &[u32]) -> String {
    let mut sorted = seqs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while end.checked_add(1).is_some_and(|next| iter.peek() == Some(&next)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_set_ranges() {
        assert_eq!(sequence_set(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(sequence_set(&[5]), "5");
        assert_eq!(sequence_set(&[3, 1, 2, 2]), "1:3");
        assert_eq!(sequence_set(&[]), "");
        assert_eq!(sequence_set(&[u32::MAX - 1, u32::MAX]), format!("{}:{}", u32::MAX - 1, u32::MAX));
        assert_eq!(sequence_set(&[u32::MAX]), u32::MAX.to_string());
    }

    #[test]
    fn test_abort_classification() {
        assert!(TransportError::ConnectionLost.is_connection_abort());
        assert!(TransportError::Timeout.is_connection_abort());
        assert!(TransportError::Io("reset".into()).is_connection_abort());
        assert!(!TransportError::Protocol("NO".into()).is_connection_abort());
        assert!(!TransportError::Rejected("NO".into()).is_connection_abort());
    }

    #[test]
    fn test_sanitized_text_hides_server_detail() {
        let err = TransportError::Rejected("[AUTHENTICATIONFAILED] Invalid credentials for bob".into());
        assert_eq!(err.sanitized(), "Authentication credentials rejected");
        assert!(!err.to_string().contains("bob"));
    }
}
