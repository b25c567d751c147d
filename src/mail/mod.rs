//! # Gmail IMAP - Mail Module
//!
//! Protocol client, configuration, credential validation, folder catalog and
//! message retrieval.

pub mod async_imap;
pub mod config;
pub mod credentials;
pub mod fetcher;
pub mod folders;
pub mod transport;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionState;

// Re-export commonly used types
pub use async_imap::AsyncImapConnector;
pub use config::{ImapConfig, KeepaliveConfig, RetryPolicy, SessionConfig};
pub use credentials::{validate, Credentials, Secret, ValidationError};
pub use fetcher::MessageFetcher;
pub use folders::FolderCatalog;
pub use transport::{Connection, Connector, TransportError};

/// Result type alias for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Unified error type for session, folder and fetch operations.
///
/// No variant carries the account secret.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Too many failed authentication attempts, try again in {retry_after_secs} seconds")]
    LockedOut { retry_after_secs: u64 },

    #[error("Connection failed after {attempts} attempts: {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    /// An established connection broke; automatic reconnect has started
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No folder selected")]
    NoFolderSelected,

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Folder is not selectable: {0}")]
    NotSelectable(String),

    #[error("Batch fetch failed: {0}")]
    FetchFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IMAP error: {0}")]
    Protocol(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret store error: {0}")]
    Store(String),
}

impl MailError {
    /// Connectivity and batch failures may succeed when repeated as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MailError::ConnectionFailed { .. }
                | MailError::ConnectionLost(_)
                | MailError::FetchFailed(_)
        )
    }
}

/// Folder kinds, derived from the server name and LIST attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FolderKind {
    Inbox,
    Sent,
    Drafts,
    Trash,
    #[default]
    UserLabel,
    System,
}

impl FolderKind {
    /// Map a raw mailbox name onto the fixed Gmail classification table.
    pub fn from_name(name: &str) -> Self {
        match name {
            n if n.eq_ignore_ascii_case("INBOX") => FolderKind::Inbox,
            "[Gmail]/Sent Mail" => FolderKind::Sent,
            "[Gmail]/Drafts" => FolderKind::Drafts,
            "[Gmail]/Trash" => FolderKind::Trash,
            "[Gmail]" => FolderKind::System,
            _ => FolderKind::UserLabel,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FolderKind::Inbox => "inbox",
            FolderKind::Sent => "sent",
            FolderKind::Drafts => "drafts",
            FolderKind::Trash => "trash",
            FolderKind::UserLabel => "label",
            FolderKind::System => "system",
        }
    }
}

/// Mailbox as discovered through LIST. Never constructed by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub name: String,
    pub display_name: String,
    pub kind: FolderKind,
    pub message_count: Option<u32>,
    pub unread_count: Option<u32>,
    pub selectable: bool,
    pub delimiter: String,
}

/// Counts reported by SELECT or STATUS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMetadata {
    pub name: String,
    pub message_count: u32,
    pub recent_count: u32,
    pub unread_count: u32,
    pub selectable: bool,
}

/// Search criteria accepted by the batch fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchCriteria {
    #[default]
    All,
    Unseen,
    Recent,
}

impl FetchCriteria {
    /// IMAP SEARCH key
    pub fn as_imap(&self) -> &'static str {
        match self {
            FetchCriteria::All => "ALL",
            FetchCriteria::Unseen => "UNSEEN",
            FetchCriteria::Recent => "RECENT",
        }
    }
}

/// Normalized message handed to the classification pipeline.
///
/// Lives only for the caller's processing window; nothing in this crate
/// writes it to durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: u32,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub date: DateTime<Utc>,
    pub snippet: String,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub is_unread: bool,
}
