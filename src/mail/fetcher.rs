//! Incremental mail fetching with per-folder delta cursors.
//!
//! Delta-first strategy per watched folder:
//! 1. Load the `delta_token_{folder}` cursor from agent state.
//! 2. Non-empty cursor → delta query; store the returned cursor.
//! 3. Expired cursor (410) → store the empty-string sentinel and use
//!    the timestamp window for this cycle; the delta path is not
//!    retried until the next cycle.
//! 4. Empty-string sentinel → timestamp window this cycle, then drop
//!    the key so the following cycle re-establishes delta with an
//!    initial sync.
//! 5. Any other transport error → counts against the Graph degradation
//!    counter and the folder is skipped for the cycle.
//!
//! Results are deduplicated by message id across folders.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::TriageConfig;
use crate::error::{DatabaseError, MailApiError};
use crate::mail::{ListQuery, MESSAGE_FIELDS, MessageOps, RawMessage};
use crate::store::{STATE_LAST_PROCESSED, Store, delta_token_key};

/// Outcome of one fetch pass over the watched folders.
#[derive(Debug, Default)]
pub struct FetchResult {
    /// New messages, deduplicated across folders.
    pub messages: Vec<RawMessage>,
    /// Folders that failed with a degradation-relevant transport error.
    pub graph_failures: u32,
    /// Folders fetched successfully.
    pub graph_successes: u32,
}

/// Delta-first fetcher over the rate-limited ops layer.
pub struct MailFetcher {
    ops: Arc<MessageOps>,
}

impl MailFetcher {
    pub fn new(ops: Arc<MessageOps>) -> Self {
        Self { ops }
    }

    /// Fetch the messages new to this cycle from every watched folder.
    pub async fn fetch_new(
        &self,
        store: &Store,
        config: &TriageConfig,
    ) -> Result<FetchResult, DatabaseError> {
        let mut result = FetchResult::default();
        let mut seen_ids: HashSet<String> = HashSet::new();

        for folder in &config.watch_folders {
            match self.fetch_folder(store, config, folder).await? {
                FolderOutcome::Messages(messages) => {
                    result.graph_successes += 1;
                    for msg in messages {
                        if !msg.id.is_empty() && seen_ids.insert(msg.id.clone()) {
                            result.messages.push(msg);
                        }
                    }
                }
                FolderOutcome::Failed => {
                    result.graph_failures += 1;
                }
            }
        }

        debug!(count = result.messages.len(), "Emails fetched");
        Ok(result)
    }

    async fn fetch_folder(
        &self,
        store: &Store,
        config: &TriageConfig,
        folder: &str,
    ) -> Result<FolderOutcome, DatabaseError> {
        let key = delta_token_key(folder);
        let cursor = store.get_state(&key).await?;

        match cursor {
            // Cleared sentinel: the cursor expired last cycle. Use the
            // timestamp window now and drop the key so the next cycle
            // re-establishes delta from scratch.
            Some(sentinel) if sentinel.is_empty() => {
                let outcome = self.fetch_by_timestamp(store, config, folder).await?;
                if matches!(outcome, FolderOutcome::Messages(_)) {
                    store.delete_state(&key).await?;
                }
                Ok(outcome)
            }
            cursor => {
                let cursor_ref = cursor.as_deref().filter(|c| !c.is_empty());
                match self.ops.get_delta_messages(folder, cursor_ref).await {
                    Ok(page) => {
                        store.set_state(&key, &page.new_cursor).await?;
                        info!(
                            folder = %folder,
                            count = page.messages.len(),
                            "Delta fetch complete"
                        );
                        Ok(FolderOutcome::Messages(page.messages))
                    }
                    Err(MailApiError::DeltaTokenExpired { .. }) => {
                        warn!(folder = %folder, "Delta token expired, falling back to timestamp window");
                        store.set_state(&key, "").await?;
                        self.fetch_by_timestamp(store, config, folder).await
                    }
                    Err(e) => {
                        error!(folder = %folder, error = %e, "Fetch folder failed");
                        Ok(FolderOutcome::Failed)
                    }
                }
            }
        }
    }

    /// Timestamp-window fallback keyed off `last_processed_timestamp`
    /// (or the lookback window on first run).
    async fn fetch_by_timestamp(
        &self,
        store: &Store,
        config: &TriageConfig,
        folder: &str,
    ) -> Result<FolderOutcome, DatabaseError> {
        let cutoff = self.window_cutoff(store, config).await?;
        let query = ListQuery {
            select: Some(MESSAGE_FIELDS.to_string()),
            filter: Some(format!(
                "receivedDateTime ge {}",
                cutoff.format("%Y-%m-%dT%H:%M:%SZ")
            )),
            order_by: Some("receivedDateTime desc".to_string()),
            top: 50,
            max_items: Some(config.batch_size * 2),
        };

        match self.ops.list_messages(folder, &query).await {
            Ok(messages) => Ok(FolderOutcome::Messages(messages)),
            Err(e) => {
                error!(folder = %folder, error = %e, "Fetch folder failed");
                Ok(FolderOutcome::Failed)
            }
        }
    }

    async fn window_cutoff(
        &self,
        store: &Store,
        config: &TriageConfig,
    ) -> Result<DateTime<Utc>, DatabaseError> {
        let lookback = Utc::now() - chrono::Duration::hours(config.lookback_hours as i64);
        match store.get_state(STATE_LAST_PROCESSED).await? {
            Some(ts) => match DateTime::parse_from_rfc3339(&ts) {
                Ok(dt) => Ok(dt.with_timezone(&Utc)),
                Err(_) => {
                    warn!(value = %ts, "Invalid last processed timestamp");
                    Ok(lookback)
                }
            },
            None => Ok(lookback),
        }
    }
}

enum FolderOutcome {
    Messages(Vec<RawMessage>),
    Failed,
}
