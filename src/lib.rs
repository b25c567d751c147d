//! # Gmail IMAP Session
//!
//! Authenticated IMAP sessions against Gmail: credential checks, a supervised
//! connection per account with retry and keepalive, a cached folder catalog
//! and bounded message batch fetching.
//!
//! ```no_run
//! use gmail_imap_session::{
//!     FetchCriteria, FolderCatalog, MailError, MessageFetcher, SessionConfig, SessionManager,
//! };
//!
//! # async fn demo() -> gmail_imap_session::MailResult<()> {
//! let config = SessionConfig::from_env().map_err(MailError::Config)?;
//! let manager = SessionManager::imap(config)?;
//! let id = manager.connect("user@gmail.com", "abcdefghijklmnop").await?.into_handle().id;
//!
//! let folders = FolderCatalog::new(manager.clone());
//! folders.select_folder(id, "INBOX").await?;
//!
//! let messages = MessageFetcher::new(manager.clone())
//!     .fetch_messages(id, 10, FetchCriteria::Unseen)
//!     .await?;
//! println!("{} unread", messages.len());
//!
//! manager.disconnect(id).await;
//! # Ok(())
//! # }
//! ```

pub mod mail;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use mail::{
    Credentials, FetchCriteria, Folder, FolderCatalog, FolderKind, FolderMetadata, MailError,
    MailResult, MessageFetcher, MessageRecord, Secret, SessionConfig, ValidationError,
};
pub use session::{ConnectOutcome, Session, SessionHandle, SessionId, SessionManager, SessionState};
pub use store::{KeyringStore, MemoryStore, SecretStore};

/// Load `.env` and install the `env_logger` backend (default level `info`).
///
/// Safe to call more than once; later calls leave the first logger in place.
pub fn init_logging() {
    dotenvy::dotenv().ok();

    if env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .is_err()
    {
        log::debug!("Logger already initialized");
    }
}
