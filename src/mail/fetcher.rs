//! Message batch fetcher
//!
//! Retrieves up to `limit` messages from the session's selected folder and
//! normalizes them into `MessageRecord`s. A batch is all-or-nothing: any
//! failure part way through discards everything fetched so far.

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser};
use tokio_util::sync::CancellationToken;

use super::transport::RawMessage;
use super::{FetchCriteria, MailError, MailResult, MessageRecord};
use crate::session::{SessionId, SessionManager};

/// Batch size matching the classification pipeline
pub const DEFAULT_BATCH_LIMIT: usize = 10;

const SNIPPET_CHARS: usize = 100;

#[derive(Clone)]
pub struct MessageFetcher {
    manager: SessionManager,
}

impl MessageFetcher {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    pub async fn fetch_messages(
        &self,
        id: SessionId,
        limit: usize,
        criteria: FetchCriteria,
    ) -> MailResult<Vec<MessageRecord>> {
        self.fetch_messages_with(id, limit, criteria, &CancellationToken::new())
            .await
    }

    /// Fetch the newest `limit` messages matching `criteria`, in server order.
    ///
    /// `limit == 0` returns an empty batch without touching the session.
    /// Cancelling leaves a healthy session connected.
    pub async fn fetch_messages_with(
        &self,
        id: SessionId,
        limit: usize,
        criteria: FetchCriteria,
        cancel: &CancellationToken,
    ) -> MailResult<Vec<MessageRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let session = self.manager.connected_session(id)?;
        let folder = session.selected_folder.ok_or(MailError::NoFolderSelected)?;

        let timeout = self.manager.config().imap.fetch_timeout;
        let result: MailResult<(usize, Vec<RawMessage>)> = self
            .manager
            .execute(id, timeout, Some(cancel), move |conn| {
                Box::pin(async move {
                    let seqs = conn.search(criteria).await?;
                    let batch = &seqs[seqs.len().saturating_sub(limit)..];
                    let messages = conn.fetch(batch).await?;
                    Ok((batch.len(), messages))
                })
            })
            .await;

        let (requested, raw) = match result {
            Ok(batch) => batch,
            Err(err @ (MailError::NotConnected | MailError::Cancelled)) => return Err(err),
            Err(err) => {
                log::error!("Batch fetch from '{}' failed for session {}: {}", folder, id, err);
                return Err(MailError::FetchFailed(err.to_string()));
            }
        };

        if raw.len() != requested {
            log::error!(
                "Incomplete batch from '{}': {} of {} messages",
                folder,
                raw.len(),
                requested
            );
            return Err(MailError::FetchFailed(format!(
                "server returned {} of {} messages",
                raw.len(),
                requested
            )));
        }

        let max_body_bytes = self.manager.config().imap.max_body_bytes;
        let records: Vec<MessageRecord> = raw
            .iter()
            .map(|message| normalize(message, &folder, max_body_bytes))
            .collect();

        log::info!(
            "Fetched {} messages ({}) from '{}' for session {}",
            records.len(),
            criteria.as_imap(),
            folder,
            id
        );
        Ok(records)
    }
}

/// Turn a raw FETCH item into a record. Never fails: unparseable messages
/// produce a record with empty fields.
pub fn normalize(raw: &RawMessage, folder: &str, max_body_bytes: usize) -> MessageRecord {
    let is_unread = !raw.has_flag("\\Seen");
    let fallback_date = raw.internal_date.unwrap_or_else(Utc::now);

    let Some(message) = MessageParser::default().parse(&raw.body) else {
        log::warn!("Message {} could not be parsed", raw.seq);
        return MessageRecord {
            id: raw.seq,
            thread_id: None,
            subject: String::new(),
            sender: String::new(),
            recipients: Vec::new(),
            date: fallback_date,
            snippet: String::new(),
            body_plain: None,
            body_html: None,
            labels: vec![folder.to_string()],
            has_attachments: false,
            is_unread,
        };
    };

    let sender = message
        .from()
        .and_then(|from| from.first())
        .and_then(|addr| addr.address.as_ref().or(addr.name.as_ref()))
        .map(|s| s.to_string())
        .unwrap_or_default();

    let recipients = message
        .to()
        .map(|to| {
            to.iter()
                .filter_map(|addr| addr.address.as_ref().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let date = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(fallback_date);

    // HTML stands in for the plain body when there is no text part
    let body_html = message
        .body_html(0)
        .map(|html| truncate_utf8(html.to_string(), max_body_bytes));
    let body_plain = message
        .body_text(0)
        .map(|text| truncate_utf8(text.to_string(), max_body_bytes))
        .or_else(|| body_html.clone());

    let snippet = body_plain.as_deref().map(snippet).unwrap_or_default();

    MessageRecord {
        id: raw.seq,
        thread_id: thread_root(&message),
        subject: message.subject().unwrap_or_default().to_string(),
        sender,
        recipients,
        date,
        snippet,
        body_plain,
        body_html,
        labels: vec![folder.to_string()],
        has_attachments: message.attachment_count() > 0,
        is_unread,
    }
}

/// Oldest message id of the conversation
fn thread_root(message: &mail_parser::Message<'_>) -> Option<String> {
    let first = |value: &HeaderValue<'_>| match value {
        HeaderValue::Text(id) => Some(id.to_string()),
        HeaderValue::TextList(ids) => ids.first().map(|id| id.to_string()),
        _ => None,
    };

    first(message.references())
        .or_else(|| first(message.in_reply_to()))
        .or_else(|| message.message_id().map(|id| id.to_string()))
}

fn snippet(body: &str) -> String {
    let collapsed: String = body
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.chars().take(SNIPPET_CHARS).collect()
}

fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() > max_bytes {
        let mut end = max_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
