//! Folder path resolution with a TTL cache.
//!
//! Folder ids are stable but lookups are chatty; the review surface
//! resolves the same handful of paths on every approval. Entries expire
//! so renames are eventually noticed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::MailApiError;
use crate::mail::MessageOps;

const DEFAULT_TTL_SECONDS: i64 = 300;

/// Path → folder-id cache in front of the transport folder ops.
pub struct FolderCache {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    ttl_seconds: i64,
}

impl Default for FolderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    fn cached(&self, path: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        let (id, cached_at) = entries.get(path)?;
        if Utc::now() - *cached_at > Duration::seconds(self.ttl_seconds) {
            return None;
        }
        Some(id.clone())
    }

    fn insert(&self, path: &str, id: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_string(), (id.to_string(), Utc::now()));
    }

    /// Resolve a folder path to its id, if the folder exists.
    pub async fn resolve(
        &self,
        ops: &MessageOps,
        path: &str,
    ) -> Result<Option<String>, MailApiError> {
        if let Some(id) = self.cached(path) {
            debug!(path = %path, "Folder id cache hit");
            return Ok(Some(id));
        }
        let id = ops.get_folder_id(path).await?;
        if let Some(ref id) = id {
            self.insert(path, id);
        }
        Ok(id)
    }

    /// Resolve a folder path, creating it (and missing ancestors) when
    /// absent.
    pub async fn ensure(&self, ops: &MessageOps, path: &str) -> Result<String, MailApiError> {
        if let Some(id) = self.resolve(ops, path).await? {
            return Ok(id);
        }
        let id = ops.create_folder(path).await?;
        self.insert(path, &id);
        Ok(id)
    }

    /// Drop all cached entries (e.g. after a bulk folder reorg).
    pub fn invalidate(&self) {
        self.entries.lock().unwrap().clear();
    }
}
