//! Async IMAP transport using async-imap
//!
//! TLS is always on (port 993 by default) and certificate validation is never
//! relaxed.

use crate::mail::{
    config::ImapConfig,
    credentials::Secret,
    transport::{sequence_set, Connection, Connector, MailboxCounts, RawMailbox, RawMessage, TransportError},
    FetchCriteria,
};
use async_imap::types::{Flag, NameAttribute};
use async_imap::Session;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use tokio_util::compat::TokioAsyncReadCompatExt;

type TlsStream = async_native_tls::TlsStream<tokio_util::compat::Compat<tokio::net::TcpStream>>;

/// Translate an async-imap error into the transport taxonomy
fn map_imap_error(err: async_imap::error::Error) -> TransportError {
    use async_imap::error::Error;

    match err {
        Error::Io(e) => TransportError::Io(e.to_string()),
        Error::ConnectionLost => TransportError::ConnectionLost,
        Error::No(msg) | Error::Bad(msg) => TransportError::Protocol(msg),
        other => TransportError::Protocol(other.to_string()),
    }
}

fn flag_to_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

fn attribute_to_string(attribute: &NameAttribute<'_>) -> String {
    match attribute {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::Extension(name) => name.to_string(),
        other => format!("\\{:?}", other),
    }
}

/// Opens TLS connections to the configured server
pub struct AsyncImapConnector {
    config: ImapConfig,
}

impl AsyncImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        if !config.is_gmail_host() {
            log::warn!(
                "Server {} is not a recognized Gmail domain, certificate validation may fail",
                config.host
            );
        }
        Self { config }
    }
}

#[async_trait]
impl Connector for AsyncImapConnector {
    async fn connect(&self, address: &str, secret: &Secret) -> Result<Box<dyn Connection>, TransportError> {
        let endpoint = format!("{}:{}", self.config.host, self.config.port);

        let stream = tokio::net::TcpStream::connect(&endpoint)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        // Convert to futures-io compatible stream
        let compat_stream = stream.compat();

        let tls_stream = async_native_tls::TlsConnector::new()
            .connect(&self.config.host, compat_stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream);

        let session = client.login(address, secret.expose()).await.map_err(|(err, _client)| {
            match err {
                async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
                    TransportError::Rejected(msg)
                }
                other => map_imap_error(other),
            }
        })?;

        log::debug!("Async IMAP session opened on {}", self.config.host);
        Ok(Box::new(AsyncImapConnection { session }))
    }
}

/// Authenticated async-imap session
pub struct AsyncImapConnection {
    session: Session<TlsStream>,
}

#[async_trait]
impl Connection for AsyncImapConnection {
    async fn noop(&mut self) -> Result<(), TransportError> {
        self.session.noop().await.map_err(map_imap_error)
    }

    async fn list(&mut self) -> Result<Vec<RawMailbox>, TransportError> {
        let names: Vec<_> = self
            .session
            .list(Some(""), Some("*"))
            .await
            .map_err(map_imap_error)?
            .try_collect()
            .await
            .map_err(map_imap_error)?;

        Ok(names
            .iter()
            .map(|mb| RawMailbox {
                name: mb.name().to_string(),
                delimiter: mb.delimiter().map(|d| d.to_string()),
                attributes: mb.attributes().iter().map(attribute_to_string).collect(),
            })
            .collect())
    }

    async fn select(&mut self, mailbox: &str) -> Result<MailboxCounts, TransportError> {
        let selected = self.session.select(mailbox).await.map_err(map_imap_error)?;

        // SELECT's UNSEEN is the first unseen sequence number, not a count
        let status = self
            .session
            .status(mailbox, "(MESSAGES UNSEEN)")
            .await
            .map_err(map_imap_error)?;

        Ok(MailboxCounts {
            exists: selected.exists,
            recent: selected.recent,
            unseen: status.unseen.unwrap_or(0),
        })
    }

    async fn status(&mut self, mailbox: &str) -> Result<MailboxCounts, TransportError> {
        let status = self
            .session
            .status(mailbox, "(MESSAGES RECENT UNSEEN)")
            .await
            .map_err(map_imap_error)?;

        Ok(MailboxCounts {
            exists: status.exists,
            recent: status.recent,
            unseen: status.unseen.unwrap_or(0),
        })
    }

    async fn search(&mut self, criteria: FetchCriteria) -> Result<Vec<u32>, TransportError> {
        let found = self
            .session
            .search(criteria.as_imap())
            .await
            .map_err(map_imap_error)?;

        let mut seqs: Vec<u32> = found.into_iter().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn fetch(&mut self, seqs: &[u32]) -> Result<Vec<RawMessage>, TransportError> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }

        // PEEK keeps \Seen untouched
        let fetches: Vec<_> = self
            .session
            .fetch(sequence_set(seqs), "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])")
            .await
            .map_err(map_imap_error)?
            .try_collect()
            .await
            .map_err(map_imap_error)?;

        Ok(fetches
            .iter()
            .map(|message| RawMessage {
                seq: message.message,
                uid: message.uid,
                flags: message.flags().map(|f| flag_to_string(&f)).collect(),
                internal_date: message.internal_date().map(|d| d.with_timezone(&Utc)),
                size: message.size,
                body: message.body().map(|b| b.to_vec()).unwrap_or_default(),
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session.close().await.map_err(map_imap_error)
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        self.session.logout().await.map_err(map_imap_error)
    }
}
