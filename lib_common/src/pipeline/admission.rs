//! # Admission Guard
//!
//! Rejects a request outright when another request with the same admission key
//! is still in flight. The pending entry is tied to an [`AdmissionPermit`]
//! whose `Drop` removes it, so cleanup happens on every exit path: normal
//! return, error, panic unwinding, or a cancelled future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Subject used when a request carries no identity.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("a request for {key} is already in progress since {started_at}")]
pub struct AdmissionConflict {
    pub key: String,
    pub started_at: DateTime<Utc>,
}

/// `<subject>-<METHOD>-<path>`.
pub fn request_key(subject: Option<&str>, method: &str, path: &str) -> String {
    let subject = subject.filter(|s| !s.is_empty()).unwrap_or(ANONYMOUS);
    format!("{}-{}-{}", subject, method.to_ascii_uppercase(), path)
}

/// Stronger variant: also distinguishes requests by query string.
pub fn request_key_with_query(subject: Option<&str>, method: &str, path: &str, query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    format!("{}-{}", request_key(subject, method, path), hex::encode(digest))
}

#[derive(Debug, Default)]
struct Pending {
    started: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionGuard {
    pending: Arc<Mutex<Pending>>,
}

impl AdmissionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admits the request or reports the operation already holding `key`.
    pub fn try_admit(&self, key: impl Into<String>) -> Result<AdmissionPermit, AdmissionConflict> {
        let key = key.into();
        let mut pending = self.lock();
        if let Some(started_at) = pending.started.get(&key) {
            debug!(key = %key, "Duplicate in-flight request rejected");
            return Err(AdmissionConflict {
                key,
                started_at: *started_at,
            });
        }
        pending.started.insert(key.clone(), Utc::now());
        Ok(AdmissionPermit {
            guard: self.clone(),
            key,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.lock().started.len()
    }
}

/// Held for the duration of an admitted request.
#[derive(Debug)]
#[must_use = "the request is only guarded while the permit is held"]
pub struct AdmissionPermit {
    guard: AdmissionGuard,
    key: String,
}

impl AdmissionPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.guard.lock().started.remove(&self.key);
    }
}
