//! Credential validation and secret handling
//!
//! Validation is pure: no I/O and no logging. Failures name the offending
//! field, never its value.

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const MIN_SECRET_LEN: usize = 8;
pub const MAX_SECRET_LEN: usize = 64;

static EMAIL_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn email_pattern() -> Option<&'static Regex> {
    EMAIL_PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok())
        .as_ref()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("address is not a valid email address")]
    InvalidAddress,

    #[error("secret length must be between 8 and 64 characters")]
    InvalidSecretLength,
}

/// Check address grammar and secret length before any network attempt.
pub fn validate(address: &str, secret: &str) -> Result<(), ValidationError> {
    if !email_pattern().is_some_and(|re| re.is_match(address)) {
        return Err(ValidationError::InvalidAddress);
    }

    let len = secret.chars().count();
    if !(MIN_SECRET_LEN..=MAX_SECRET_LEN).contains(&len) {
        return Err(ValidationError::InvalidSecretLength);
    }

    Ok(())
}

/// Account password or app-specific password. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Use sparingly: the only legitimate reader is the transport login.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Validated login pair
#[derive(Debug, Clone)]
pub struct Credentials {
    pub address: String,
    secret: Secret,
    pub created_at: DateTime<Utc>,
    /// Set only after a successful authenticated command
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(address: &str, secret: &str) -> Result<Self, ValidationError> {
        validate(address, secret)?;
        Ok(Self {
            address: address.to_string(),
            secret: Secret::new(secret),
            created_at: Utc::now(),
            last_used_at: None,
        })
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn mark_used(&mut self) {
        self.last_used_at = Some(Utc::now());
    }
}

/// Registry key: addresses compare case-insensitively.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Short stable identifier for log lines, so addresses never appear in clear.
pub fn hash_address(address: &str) -> String {
    let digest = Sha256::digest(normalize_address(address).as_bytes());
    hex::encode(digest)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pair() {
        assert!(validate("user@gmail.com", "abcdefghijklmnop").is_ok());
        assert!(validate("first.last+tag@example.co.uk", "Secr3t!!").is_ok());
    }

    #[test]
    fn test_malformed_address() {
        assert_eq!(
            validate("not-an-email", "abcdefghijklmnop"),
            Err(ValidationError::InvalidAddress)
        );
        assert_eq!(validate("user@localhost", "abcdefghijklmnop"), Err(ValidationError::InvalidAddress));
        assert_eq!(validate("", "abcdefghijklmnop"), Err(ValidationError::InvalidAddress));
    }

    #[test]
    fn test_secret_length_bounds() {
        assert_eq!(validate("user@gmail.com", "short"), Err(ValidationError::InvalidSecretLength));
        assert_eq!(validate("user@gmail.com", &"x".repeat(7)), Err(ValidationError::InvalidSecretLength));
        assert!(validate("user@gmail.com", &"x".repeat(8)).is_ok());
        assert!(validate("user@gmail.com", &"x".repeat(64)).is_ok());
        assert_eq!(validate("user@gmail.com", &"x".repeat(65)), Err(ValidationError::InvalidSecretLength));
    }

    #[test]
    fn test_error_messages_never_contain_secret() {
        let secret = "hunter2";
        let err = validate("user@gmail.com", secret).unwrap_err();
        assert!(!err.to_string().contains(secret));
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let creds = Credentials::new("user@gmail.com", "abcdefghijklmnop").unwrap();
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("abcdefghijklmnop"));
        assert!(creds.last_used_at.is_none());
    }

    #[test]
    fn test_hash_address_is_stable_and_case_insensitive() {
        let a = hash_address("User@Gmail.com");
        let b = hash_address("user@gmail.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(!a.contains('@'));
    }
}
