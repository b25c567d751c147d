//! Secret storage
//!
//! Where app passwords live between runs. The session manager never reads a
//! store itself; callers load a secret and pass it to `connect`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use crate::mail::credentials::normalize_address;
use crate::mail::{MailError, MailResult, Secret};
use crate::session::lock;

/// Keyring service name
pub const SERVICE: &str = "gmail_imap_session";

pub trait SecretStore: Send + Sync {
    fn save(&self, address: &str, secret: &Secret) -> MailResult<()>;

    /// `None` when nothing is stored for the address
    fn load(&self, address: &str) -> MailResult<Option<Secret>>;

    /// Returns whether anything was removed
    fn delete(&self, address: &str) -> MailResult<bool>;

    fn has(&self, address: &str) -> MailResult<bool> {
        Ok(self.load(address)?.is_some())
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    secrets: StdMutex<HashMap<String, Secret>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn save(&self, address: &str, secret: &Secret) -> MailResult<()> {
        lock(&self.secrets).insert(normalize_address(address), secret.clone());
        Ok(())
    }

    fn load(&self, address: &str) -> MailResult<Option<Secret>> {
        Ok(lock(&self.secrets).get(&normalize_address(address)).cloned())
    }

    fn delete(&self, address: &str) -> MailResult<bool> {
        Ok(lock(&self.secrets).remove(&normalize_address(address)).is_some())
    }
}

/// OS keyring store, one entry per normalized address
pub struct KeyringStore {
    service: String,
    entries: StdMutex<HashMap<String, Arc<keyring::Entry>>>,
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE)
    }
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entries: StdMutex::new(HashMap::new()),
        }
    }

    fn entry(&self, address: &str) -> MailResult<Arc<keyring::Entry>> {
        let key = normalize_address(address);
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(&key) {
            return Ok(Arc::clone(entry));
        }

        let entry = keyring::Entry::new(&self.service, &key).map_err(|e| {
            log::error!("keyring Entry::new failed for service={:?}: {}", self.service, e);
            MailError::Store(format!("keyring error: {e}"))
        })?;
        let entry = Arc::new(entry);
        entries.insert(key, Arc::clone(&entry));
        Ok(entry)
    }
}

impl SecretStore for KeyringStore {
    fn save(&self, address: &str, secret: &Secret) -> MailResult<()> {
        log::debug!("keyring SET: service={:?}", self.service);
        self.entry(address)?.set_password(secret.expose()).map_err(|e| {
            log::error!("keyring set_password failed: {e}");
            MailError::Store(format!("keyring set: {e}"))
        })
    }

    fn load(&self, address: &str) -> MailResult<Option<Secret>> {
        log::debug!("keyring GET: service={:?}", self.service);
        match self.entry(address)?.get_password() {
            Ok(password) => Ok(Some(Secret::new(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                log::warn!("keyring get_password failed: {e}");
                Err(MailError::Store(format!("keyring get: {e}")))
            }
        }
    }

    fn delete(&self, address: &str) -> MailResult<bool> {
        log::debug!("keyring DELETE: service={:?}", self.service);
        match self.entry(address)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => {
                log::error!("keyring delete_credential failed: {e}");
                Err(MailError::Store(format!("keyring delete: {e}")))
            }
        }
    }
}
