//! Folder catalog
//!
//! Lists mailboxes for a connected session, classifies them against the fixed
//! Gmail table and keeps the last listing per connection in a TTL cache.
//! Selection is only allowed for names present in that listing.

use moka::future::Cache;
use std::sync::Arc;

use super::transport::{MailboxCounts, RawMailbox};
use super::{Folder, FolderKind, FolderMetadata, MailError, MailResult};
use crate::session::{SessionId, SessionManager};

const GMAIL_PREFIX: &str = "[Gmail]/";
const NOSELECT: &str = "\\Noselect";
const MAX_CACHED_LISTINGS: u64 = 1_000;

/// Listings are cached per connection: a reconnect starts a new epoch.
type CatalogKey = (SessionId, i64);

/// Build a `Folder` from a LIST entry
pub fn folder_from_raw(raw: &RawMailbox) -> Folder {
    let kind = FolderKind::from_name(&raw.name);
    let selectable = kind != FolderKind::System && !raw.has_attribute(NOSELECT);
    let display_name = raw
        .name
        .strip_prefix(GMAIL_PREFIX)
        .unwrap_or(&raw.name)
        .to_string();

    Folder {
        name: raw.name.clone(),
        display_name,
        kind,
        message_count: None,
        unread_count: None,
        selectable,
        delimiter: raw.delimiter.clone().unwrap_or_else(|| "/".to_string()),
    }
}

fn find<'a>(folders: &'a [Folder], name: &str) -> Option<&'a Folder> {
    folders.iter().find(|folder| {
        folder.name == name || (folder.kind == FolderKind::Inbox && name.eq_ignore_ascii_case("INBOX"))
    })
}

#[derive(Clone)]
pub struct FolderCatalog {
    manager: SessionManager,
    cache: Cache<CatalogKey, Arc<Vec<Folder>>>,
}

impl FolderCatalog {
    pub fn new(manager: SessionManager) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_CACHED_LISTINGS)
            .time_to_live(manager.config().folder_cache_ttl)
            .build();

        Self { manager, cache }
    }

    fn cache_key(&self, id: SessionId) -> MailResult<CatalogKey> {
        let session = self.manager.connected_session(id)?;
        let epoch = session
            .connected_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_default();
        Ok((id, epoch))
    }

    /// All mailboxes of a connected session. Served from cache unless
    /// `force_refresh` is set or the cached listing expired.
    pub async fn list_folders(&self, id: SessionId, force_refresh: bool) -> MailResult<Vec<Folder>> {
        let key = self.cache_key(id)?;

        if !force_refresh {
            if let Some(cached) = self.cache.get(&key).await {
                log::debug!("Returning cached folders for session {}", id);
                return Ok(cached.as_ref().clone());
            }
        }

        let timeout = self.manager.config().imap.command_timeout;
        let raw: Vec<RawMailbox> = self
            .manager
            .execute(id, timeout, None, |conn| Box::pin(async move { conn.list().await }))
            .await?;

        let folders: Vec<Folder> = raw.iter().map(folder_from_raw).collect();
        log::info!("Listed {} folders for session {}", folders.len(), id);

        self.cache.insert(key, Arc::new(folders.clone())).await;
        Ok(folders)
    }

    /// Last listing, fetching one if none is cached
    async fn known_folders(&self, id: SessionId) -> MailResult<Arc<Vec<Folder>>> {
        let key = self.cache_key(id)?;
        match self.cache.get(&key).await {
            Some(cached) => Ok(cached),
            None => self.list_folders(id, false).await.map(Arc::new),
        }
    }

    async fn resolve(&self, id: SessionId, name: &str) -> MailResult<Folder> {
        let folders = self.known_folders(id).await?;
        let folder = find(&folders, name).ok_or_else(|| MailError::FolderNotFound(name.to_string()))?;

        if !folder.selectable {
            return Err(MailError::NotSelectable(name.to_string()));
        }
        Ok(folder.clone())
    }

    /// Make `name` the session's active mailbox.
    pub async fn select_folder(&self, id: SessionId, name: &str) -> MailResult<FolderMetadata> {
        let folder = self.resolve(id, name).await?;
        let counts = self.manager.select_mailbox(id, &folder.name).await?;

        log::info!(
            "Selected folder '{}' for session {}: {} messages",
            folder.name,
            id,
            counts.exists
        );
        self.remember_counts(id, &folder.name, counts).await;
        Ok(metadata(&folder, counts))
    }

    /// Counts for `name` without changing the selected folder
    pub async fn get_folder_status(&self, id: SessionId, name: &str) -> MailResult<FolderMetadata> {
        let folder = self.resolve(id, name).await?;

        let mailbox = folder.name.clone();
        let timeout = self.manager.config().imap.command_timeout;
        let counts: MailboxCounts = self
            .manager
            .execute(id, timeout, None, move |conn| {
                Box::pin(async move { conn.status(&mailbox).await })
            })
            .await?;

        log::debug!("Folder status for '{}': {} messages", folder.name, counts.exists);
        self.remember_counts(id, &folder.name, counts).await;
        Ok(metadata(&folder, counts))
    }

    /// Fold fresh counts into the cached listing
    async fn remember_counts(&self, id: SessionId, name: &str, counts: MailboxCounts) {
        let Ok(key) = self.cache_key(id) else {
            return;
        };
        let Some(cached) = self.cache.get(&key).await else {
            return;
        };

        let mut folders = cached.as_ref().clone();
        if let Some(folder) = folders.iter_mut().find(|f| f.name == name) {
            folder.message_count = Some(counts.exists);
            folder.unread_count = Some(counts.unseen);
            self.cache.insert(key, Arc::new(folders)).await;
        }
    }
}

fn metadata(folder: &Folder, counts: MailboxCounts) -> FolderMetadata {
    FolderMetadata {
        name: folder.name.clone(),
        message_count: counts.exists,
        recent_count: counts.recent,
        unread_count: counts.unseen,
        selectable: folder.selectable,
    }
}
