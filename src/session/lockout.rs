//! Authentication lockout
//!
//! Failures are counted per address inside a sliding window. From the fifth
//! failure on, the address is locked for `2^(failures - 4)` minutes, capped
//! at 64, so repeated bad passwords cannot trip the provider's own lock.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use super::lock;
use crate::mail::credentials::normalize_address;

const FAILURE_WINDOW_MINUTES: i64 = 15;
const LOCK_THRESHOLD: u32 = 5;
const MAX_LOCK_MINUTES: i64 = 64;

#[derive(Debug, Clone)]
struct FailureRecord {
    failures: u32,
    window_start: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct AuthLockout {
    records: StdMutex<HashMap<String, FailureRecord>>,
}

impl AuthLockout {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Err(seconds)` while the address is locked
    pub fn check(&self, address: &str) -> Result<(), u64> {
        self.check_at(address, Utc::now())
    }

    /// Count a rejected login; returns the lock length in seconds if this
    /// failure locked the address.
    pub fn record_failure(&self, address: &str) -> Option<u64> {
        self.record_failure_at(address, Utc::now())
    }

    pub fn clear(&self, address: &str) {
        lock(&self.records).remove(&normalize_address(address));
    }

    pub fn failures(&self, address: &str) -> u32 {
        lock(&self.records)
            .get(&normalize_address(address))
            .map_or(0, |record| record.failures)
    }

    fn check_at(&self, address: &str, now: DateTime<Utc>) -> Result<(), u64> {
        let records = lock(&self.records);
        match records.get(&normalize_address(address)).and_then(|r| r.locked_until) {
            Some(until) if until > now => {
                let remaining = (until - now).num_milliseconds();
                Err(((remaining + 999) / 1000).max(1) as u64)
            }
            _ => Ok(()),
        }
    }

    fn record_failure_at(&self, address: &str, now: DateTime<Utc>) -> Option<u64> {
        let mut records = lock(&self.records);
        let record = records
            .entry(normalize_address(address))
            .or_insert_with(|| FailureRecord {
                failures: 0,
                window_start: now,
                locked_until: None,
            });

        let window_expired = now - record.window_start > Duration::minutes(FAILURE_WINDOW_MINUTES);
        let lock_active = record.locked_until.is_some_and(|until| until > now);
        if window_expired && !lock_active {
            record.failures = 0;
            record.window_start = now;
            record.locked_until = None;
        }

        record.failures += 1;
        if record.failures < LOCK_THRESHOLD {
            return None;
        }

        let exponent = (record.failures - LOCK_THRESHOLD + 1).min(6);
        let minutes = 2i64.pow(exponent).min(MAX_LOCK_MINUTES);
        record.locked_until = Some(now + Duration::minutes(minutes));

        log::warn!(
            "Authentication locked for {} minutes after {} failures",
            minutes,
            record.failures
        );
        Some((minutes * 60) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "user@gmail.com";

    #[test]
    fn test_four_failures_do_not_lock() {
        let lockout = AuthLockout::new();
        let now = Utc::now();
        for _ in 0..4 {
            assert_eq!(lockout.record_failure_at(ADDRESS, now), None);
        }
        assert!(lockout.check_at(ADDRESS, now).is_ok());
        assert_eq!(lockout.failures(ADDRESS), 4);
    }

    #[test]
    fn test_fifth_failure_locks_for_two_minutes() {
        let lockout = AuthLockout::new();
        let now = Utc::now();
        for _ in 0..4 {
            lockout.record_failure_at(ADDRESS, now);
        }
        assert_eq!(lockout.record_failure_at(ADDRESS, now), Some(120));
        assert_eq!(lockout.check_at(ADDRESS, now), Err(120));
        assert!(lockout.check_at(ADDRESS, now + Duration::minutes(3)).is_ok());
    }

    #[test]
    fn test_lock_doubles_and_caps() {
        let lockout = AuthLockout::new();
        let mut now = Utc::now();
        let mut last = None;
        for _ in 0..12 {
            last = lockout.record_failure_at(ADDRESS, now);
            now += Duration::seconds(1);
        }
        assert_eq!(last, Some(64 * 60));
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let lockout = AuthLockout::new();
        let now = Utc::now();
        for _ in 0..4 {
            lockout.record_failure_at(ADDRESS, now);
        }
        let later = now + Duration::minutes(FAILURE_WINDOW_MINUTES + 1);
        assert_eq!(lockout.record_failure_at(ADDRESS, later), None);
        assert_eq!(lockout.failures(ADDRESS), 1);
    }

    #[test]
    fn test_clear_and_case_insensitive_keys() {
        let lockout = AuthLockout::new();
        let now = Utc::now();
        for _ in 0..5 {
            lockout.record_failure_at("User@Gmail.com", now);
        }
        assert!(lockout.check_at(ADDRESS, now).is_err());

        lockout.clear(ADDRESS);
        assert!(lockout.check_at("USER@gmail.com", now).is_ok());
        assert_eq!(lockout.failures(ADDRESS), 0);
    }
}
