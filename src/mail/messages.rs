//! Message operations layered on the raw transport.
//!
//! Every call passes through a process-global token bucket (10 req/s,
//! burst 10). Moves are idempotent; category merges use optimistic
//! concurrency with bounded conflict retries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leaky_bucket::RateLimiter;
use tracing::{debug, info, warn};

use crate::error::MailApiError;
use crate::mail::{DeltaPage, ListQuery, MailTransport, RawMessage};

/// Maximum retries for optimistic-concurrency conflicts on category
/// merges.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Mail API request budget.
const RATE_PER_SEC: usize = 10;
const BURST_CAPACITY: usize = 10;

/// Rate-limited, idempotency-aware message operations.
pub struct MessageOps {
    transport: Arc<dyn MailTransport>,
    limiter: RateLimiter,
}

impl MessageOps {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        let limiter = RateLimiter::builder()
            .initial(BURST_CAPACITY)
            .max(BURST_CAPACITY)
            .refill(RATE_PER_SEC)
            .interval(Duration::from_secs(1))
            .build();
        Self { transport, limiter }
    }

    async fn acquire(&self) {
        self.limiter.acquire_one().await;
    }

    /// List messages from a folder, trimming to `max_items`.
    pub async fn list_messages(
        &self,
        folder: &str,
        query: &ListQuery,
    ) -> Result<Vec<RawMessage>, MailApiError> {
        self.acquire().await;
        let mut messages = self.transport.list_messages(folder, query).await?;
        if let Some(max) = query.max_items {
            messages.truncate(max as usize);
        }
        debug!(folder = %folder, count = messages.len(), "Messages listed");
        Ok(messages)
    }

    /// Incremental sync passthrough.
    pub async fn get_delta_messages(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, MailApiError> {
        self.acquire().await;
        self.transport.get_delta_messages(folder_id, cursor).await
    }

    pub async fn get_message(
        &self,
        message_id: &str,
        select: Option<&str>,
    ) -> Result<RawMessage, MailApiError> {
        self.acquire().await;
        self.transport.get_message(message_id, select).await
    }

    /// Move a message, skipping the move call when it already sits in
    /// the destination folder.
    pub async fn move_message(
        &self,
        message_id: &str,
        destination_folder_id: &str,
    ) -> Result<RawMessage, MailApiError> {
        let current = self
            .get_message(message_id, Some("id,parentFolderId"))
            .await?;
        if current.parent_folder_id.as_deref() == Some(destination_folder_id) {
            info!(
                message_id = %truncate_id(message_id),
                "Message already in destination folder, skipping move"
            );
            return Ok(current);
        }

        self.acquire().await;
        let moved = self
            .transport
            .move_message(message_id, destination_folder_id)
            .await?;
        info!(
            message_id = %truncate_id(message_id),
            folder_id = %truncate_id(destination_folder_id),
            "Message moved"
        );
        Ok(moved)
    }

    /// Replace the category set on a message.
    pub async fn set_categories(
        &self,
        message_id: &str,
        categories: &[String],
    ) -> Result<RawMessage, MailApiError> {
        self.acquire().await;
        let updated = self
            .transport
            .patch_categories(message_id, categories, None)
            .await?;
        info!(
            message_id = %truncate_id(message_id),
            categories = ?categories,
            "Message categories replaced"
        );
        Ok(updated)
    }

    /// Merge categories into a message without dropping existing ones.
    ///
    /// Reads the current set with its entity tag, merges (order
    /// preserved, no duplicates), and writes conditionally. A
    /// concurrent writer surfaces as [`MailApiError::Conflict`]; the
    /// merge re-reads and retries up to [`MAX_CONFLICT_RETRIES`] times.
    pub async fn add_categories(
        &self,
        message_id: &str,
        new_categories: &[String],
    ) -> Result<RawMessage, MailApiError> {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let current = self.get_message(message_id, Some("categories")).await?;
            let mut merged = current.categories.clone();
            for cat in new_categories {
                if !merged.contains(cat) {
                    merged.push(cat.clone());
                }
            }

            if merged == current.categories {
                debug!(
                    message_id = %truncate_id(message_id),
                    "Categories already present, no update needed"
                );
                return Ok(current);
            }

            self.acquire().await;
            match self
                .transport
                .patch_categories(message_id, &merged, current.etag.as_deref())
                .await
            {
                Ok(updated) => {
                    info!(
                        message_id = %truncate_id(message_id),
                        categories = ?merged,
                        "Message categories merged"
                    );
                    return Ok(updated);
                }
                Err(MailApiError::Conflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                    warn!(
                        message_id = %truncate_id(message_id),
                        attempt,
                        "Category merge conflict, retrying with fresh data"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(MailApiError::Conflict {
            resource_id: message_id.to_string(),
            message: format!(
                "Failed to update categories after {MAX_CONFLICT_RETRIES} attempts due to \
                 concurrent modifications"
            ),
        })
    }

    pub async fn get_thread_messages(
        &self,
        conversation_id: &str,
        max_messages: u32,
        select: Option<&str>,
    ) -> Result<Vec<RawMessage>, MailApiError> {
        self.acquire().await;
        self.transport
            .get_thread_messages(conversation_id, max_messages, select)
            .await
    }

    pub async fn get_folder_id(&self, path: &str) -> Result<Option<String>, MailApiError> {
        self.acquire().await;
        self.transport.get_folder_id(path).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<String, MailApiError> {
        self.acquire().await;
        self.transport.create_folder(path).await
    }

    /// Whether the user has replied in a conversation. Prefers the
    /// per-cycle cache; falls back to one listing query without it.
    pub async fn check_reply_state(
        &self,
        conversation_id: &str,
        cache: Option<&SentItemsCache>,
    ) -> Result<bool, MailApiError> {
        if let Some(cache) = cache {
            return Ok(cache.has_replied(conversation_id));
        }

        let query = ListQuery {
            select: Some("conversationId,receivedDateTime".to_string()),
            filter: Some(format!("conversationId eq '{conversation_id}'")),
            order_by: Some("receivedDateTime desc".to_string()),
            top: 1,
            max_items: Some(1),
        };
        let sent = self.list_messages("SentItems", &query).await?;
        Ok(!sent.is_empty())
    }
}

fn truncate_id(id: &str) -> String {
    if id.len() > 20 {
        format!("{}...", &id[..20])
    } else {
        id.to_string()
    }
}

/// Snapshot of recent sent items for reply-state detection.
///
/// Refreshed once at the start of each triage cycle and read-only for
/// the rest of it. Membership of a conversation id counts as "user has
/// replied" regardless of message ordering.
#[derive(Debug, Default)]
pub struct SentItemsCache {
    conversation_ids: HashSet<String>,
    last_sent_times: HashMap<String, DateTime<Utc>>,
    last_refresh: Option<DateTime<Utc>>,
}

impl SentItemsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the cache from sent items of the last `hours`.
    /// Returns the number of conversations cached.
    pub async fn refresh(&mut self, ops: &MessageOps, hours: u32) -> Result<usize, MailApiError> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
        let query = ListQuery {
            select: Some("conversationId,receivedDateTime".to_string()),
            filter: Some(format!(
                "receivedDateTime ge {}",
                cutoff.format("%Y-%m-%dT%H:%M:%SZ")
            )),
            order_by: Some("receivedDateTime desc".to_string()),
            top: 50,
            max_items: None,
        };
        let sent_items = ops.list_messages("SentItems", &query).await?;

        self.conversation_ids.clear();
        self.last_sent_times.clear();
        for item in &sent_items {
            let Some(conv_id) = item.conversation_id.clone() else {
                continue;
            };
            if let Some(sent_at) = item.received_at {
                let entry = self
                    .last_sent_times
                    .entry(conv_id.clone())
                    .or_insert(sent_at);
                if sent_at > *entry {
                    *entry = sent_at;
                }
            }
            self.conversation_ids.insert(conv_id);
        }
        self.last_refresh = Some(Utc::now());

        info!(
            conversations = self.conversation_ids.len(),
            items = sent_items.len(),
            hours,
            "Sent items cache refreshed"
        );
        Ok(self.conversation_ids.len())
    }

    pub fn has_replied(&self, conversation_id: &str) -> bool {
        self.conversation_ids.contains(conversation_id)
    }

    pub fn last_reply_time(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        self.last_sent_times.get(conversation_id).copied()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversation_ids.len()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory transport fake shared by mail/triage tests.

    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::mail::{DeltaPage, EmailAddress, ListQuery, MailTransport, RawMessage};

    #[derive(Debug, Default)]
    pub struct CallCounts {
        pub list: u32,
        pub delta: u32,
        pub get: u32,
        pub moves: u32,
        pub patches: u32,
        pub thread: u32,
    }

    /// Scripted transport: folders of messages, per-folder delta
    /// behavior, injectable conflicts.
    pub struct FakeTransport {
        pub state: Mutex<FakeState>,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub folders: HashMap<String, Vec<RawMessage>>,
        pub sent_items: Vec<RawMessage>,
        pub delta_pages: HashMap<String, Result<DeltaPage, MailApiError>>,
        pub messages: HashMap<String, RawMessage>,
        pub conflicts_remaining: u32,
        pub calls: CallCounts,
        pub last_delta_cursor: Option<Option<String>>,
        pub last_list_filter: Option<String>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(FakeState::default()),
            }
        }

        pub fn message(id: &str, sender: &str, subject: &str) -> RawMessage {
            RawMessage {
                id: id.to_string(),
                conversation_id: Some(format!("conv-{id}")),
                subject: Some(subject.to_string()),
                from: Some(EmailAddress {
                    address: sender.to_string(),
                    name: Some("Test Sender".to_string()),
                }),
                received_at: Some(Utc::now()),
                body_preview: Some("A short preview.".to_string()),
                importance: Some("normal".to_string()),
                flag_status: Some("notFlagged".to_string()),
                ..RawMessage::default()
            }
        }

        pub fn put_message(&self, msg: RawMessage) {
            self.state
                .lock()
                .unwrap()
                .messages
                .insert(msg.id.clone(), msg);
        }

        pub fn calls(&self) -> CallCounts {
            let state = self.state.lock().unwrap();
            CallCounts {
                list: state.calls.list,
                delta: state.calls.delta,
                get: state.calls.get,
                moves: state.calls.moves,
                patches: state.calls.patches,
                thread: state.calls.thread,
            }
        }
    }

    fn clone_delta(page: &Result<DeltaPage, MailApiError>) -> Result<DeltaPage, MailApiError> {
        match page {
            Ok(p) => Ok(DeltaPage {
                messages: p.messages.clone(),
                new_cursor: p.new_cursor.clone(),
            }),
            Err(MailApiError::DeltaTokenExpired { folder }) => Err(MailApiError::DeltaTokenExpired {
                folder: folder.clone(),
            }),
            Err(MailApiError::Status {
                status_code,
                message,
            }) => Err(MailApiError::Status {
                status_code: *status_code,
                message: message.clone(),
            }),
            Err(e) => Err(MailApiError::Connection(e.to_string())),
        }
    }

    #[async_trait]
    impl MailTransport for FakeTransport {
        async fn list_messages(
            &self,
            folder: &str,
            query: &ListQuery,
        ) -> Result<Vec<RawMessage>, MailApiError> {
            let mut state = self.state.lock().unwrap();
            state.calls.list += 1;
            state.last_list_filter = query.filter.clone();
            if folder.eq_ignore_ascii_case("SentItems") {
                return Ok(state.sent_items.clone());
            }
            Ok(state.folders.get(folder).cloned().unwrap_or_default())
        }

        async fn get_delta_messages(
            &self,
            folder_id: &str,
            cursor: Option<&str>,
        ) -> Result<DeltaPage, MailApiError> {
            let mut state = self.state.lock().unwrap();
            state.calls.delta += 1;
            state.last_delta_cursor = Some(cursor.map(|s| s.to_string()));
            match state.delta_pages.get(folder_id) {
                Some(page) => clone_delta(page),
                None => Ok(DeltaPage {
                    messages: Vec::new(),
                    new_cursor: "cursor-default".to_string(),
                }),
            }
        }

        async fn get_message(
            &self,
            message_id: &str,
            _select: Option<&str>,
        ) -> Result<RawMessage, MailApiError> {
            let mut state = self.state.lock().unwrap();
            state.calls.get += 1;
            state
                .messages
                .get(message_id)
                .cloned()
                .ok_or_else(|| MailApiError::NotFound(message_id.to_string()))
        }

        async fn move_message(
            &self,
            message_id: &str,
            destination_folder_id: &str,
        ) -> Result<RawMessage, MailApiError> {
            let mut state = self.state.lock().unwrap();
            state.calls.moves += 1;
            let msg = state
                .messages
                .get_mut(message_id)
                .ok_or_else(|| MailApiError::NotFound(message_id.to_string()))?;
            msg.parent_folder_id = Some(destination_folder_id.to_string());
            Ok(msg.clone())
        }

        async fn patch_categories(
            &self,
            message_id: &str,
            categories: &[String],
            _if_match: Option<&str>,
        ) -> Result<RawMessage, MailApiError> {
            let mut state = self.state.lock().unwrap();
            state.calls.patches += 1;
            if state.conflicts_remaining > 0 {
                state.conflicts_remaining -= 1;
                return Err(MailApiError::Conflict {
                    resource_id: message_id.to_string(),
                    message: "precondition failed".to_string(),
                });
            }
            let msg = state
                .messages
                .get_mut(message_id)
                .ok_or_else(|| MailApiError::NotFound(message_id.to_string()))?;
            msg.categories = categories.to_vec();
            Ok(msg.clone())
        }

        async fn get_thread_messages(
            &self,
            conversation_id: &str,
            max_messages: u32,
            _select: Option<&str>,
        ) -> Result<Vec<RawMessage>, MailApiError> {
            let mut state = self.state.lock().unwrap();
            state.calls.thread += 1;
            let mut messages: Vec<RawMessage> = state
                .folders
                .values()
                .flatten()
                .chain(state.messages.values())
                .filter(|m| m.conversation_id.as_deref() == Some(conversation_id))
                .cloned()
                .collect();
            messages.truncate(max_messages as usize);
            Ok(messages)
        }

        async fn get_folder_id(&self, path: &str) -> Result<Option<String>, MailApiError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .folders
                .contains_key(path)
                .then(|| format!("id-{path}")))
        }

        async fn create_folder(&self, path: &str) -> Result<String, MailApiError> {
            let mut state = self.state.lock().unwrap();
            state.folders.entry(path.to_string()).or_default();
            Ok(format!("id-{path}"))
        }
    }
}
