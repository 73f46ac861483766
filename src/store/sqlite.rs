//! SQLite-backed store — owns every persisted row.
//!
//! All mutations are transactional; concurrent writers (the triage
//! engine and the cross-process review surface) coordinate through the
//! database's locking with a 10 s busy timeout. Reads never block
//! writes under WAL. Other components hold value copies only.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Connection, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::models::{
    ActionDetails, ActionLogEntry, ActionType, ClassificationStatus, Correction, CycleInfo, Email,
    LlmLogEntry, LlmPromptPayload, LlmResponsePayload, Priority, SenderCategory, SenderHistory,
    SenderProfile, StoreStats, Suggestion, SuggestionStatus, WaitingFor, WaitingStatus,
};

/// Default hard cap on stored snippet characters.
pub const DEFAULT_MAX_SNIPPET_LENGTH: usize = 1000;

/// Reserved agent-state keys.
pub const STATE_LAST_PROCESSED: &str = "last_processed_timestamp";
pub const STATE_LAST_CYCLE: &str = "last_triage_cycle";
pub const STATE_LAST_CYCLE_ID: &str = "last_triage_cycle_id";
pub const STATE_PREFERENCES: &str = "classification_preferences";
pub const STATE_PREFERENCES_UPDATED: &str = "preferences_updated_at";

/// Per-folder delta cursor key.
pub fn delta_token_key(folder: &str) -> String {
    format!("delta_token_{folder}")
}

const EMAIL_COLUMNS: &str = "id, conversation_id, conversation_index, subject, sender_email, \
     sender_name, received_at, snippet, current_folder, web_link, importance, is_read, \
     flag_status, has_user_reply, inherited_folder, processed_at, classification_json, \
     classification_attempts, classification_status";

const SUGGESTION_COLUMNS: &str = "id, email_id, created_at, suggested_folder, \
     suggested_priority, suggested_action_type, confidence, reasoning, status, \
     approved_folder, approved_priority, approved_action_type, resolved_at";

const WAITING_FOR_COLUMNS: &str = "id, email_id, conversation_id, waiting_since, \
     expected_from, description, status, nudge_after_hours, resolved_at";

const SENDER_PROFILE_COLUMNS: &str = "email, display_name, domain, category, default_folder, \
     email_count, last_seen, auto_rule_candidate, updated_at";

/// SQLite store for all triage agent state.
///
/// `libsql::Connection` is `Send + Sync`; the store is shared via `Arc`.
pub struct Store {
    conn: Connection,
    max_snippet_len: usize,
}

impl Store {
    /// Open (or create) a local database file, apply PRAGMAs, and run
    /// schema initialization.
    pub async fn open(path: &Path, max_snippet_len: usize) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::Open(format!("Failed to create data directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            conn,
            max_snippet_len,
        };
        store.apply_pragmas().await?;
        migrations::init_schema(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            conn,
            max_snippet_len: DEFAULT_MAX_SNIPPET_LENGTH,
        };
        store.apply_pragmas().await?;
        migrations::init_schema(&store.conn).await?;
        Ok(store)
    }

    /// WAL + busy_timeout 10s + foreign keys, applied per connection.
    async fn apply_pragmas(&self) -> Result<(), DatabaseError> {
        for pragma in [
            "PRAGMA busy_timeout = 10000",
            "PRAGMA foreign_keys = ON",
            "PRAGMA journal_mode = WAL",
            "PRAGMA synchronous = NORMAL",
        ] {
            // query() tolerates pragmas that return a result row
            let mut rows = self.conn.query(pragma, ()).await?;
            let _ = rows.next().await;
        }
        Ok(())
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Raw connection handle for test fixtures (backdating rows).
    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    fn truncate_snippet(&self, email: &Email) -> Option<String> {
        let snippet = email.snippet.as_ref()?;
        if snippet.chars().count() > self.max_snippet_len {
            warn!(
                email_id = %email.id,
                original_length = snippet.chars().count(),
                "Truncated oversized snippet"
            );
            Some(snippet.chars().take(self.max_snippet_len).collect())
        } else {
            Some(snippet.clone())
        }
    }

    // ── Email operations ────────────────────────────────────────────

    /// Upsert an email by id, truncating the snippet to the storage cap.
    pub async fn save_email(&self, email: &Email) -> Result<(), DatabaseError> {
        let snippet = self.truncate_snippet(email);
        self.conn()
            .execute(EMAIL_UPSERT_SQL, email_upsert_params(email, snippet)?)
            .await?;
        debug!(email_id = %email.id, "Email saved");
        Ok(())
    }

    /// Upsert a batch of emails in a single transaction.
    ///
    /// Returns the number of emails written. An empty batch is a no-op.
    pub async fn save_emails_batch(&self, emails: &[Email]) -> Result<usize, DatabaseError> {
        if emails.is_empty() {
            return Ok(0);
        }
        let tx = self.conn().transaction().await?;
        for email in emails {
            let snippet = self.truncate_snippet(email);
            tx.execute(EMAIL_UPSERT_SQL, email_upsert_params(email, snippet)?)
                .await?;
        }
        tx.commit().await?;
        debug!(count = emails.len(), "Batch saved emails");
        Ok(emails.len())
    }

    pub async fn get_email(&self, email_id: &str) -> Result<Option<Email>, DatabaseError> {
        let sql = format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1");
        let mut rows = self.conn().query(&sql, params![email_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_email(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn email_exists(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM emails WHERE id = ?1", params![email_id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Fetch a batch of emails by id, preserving input order for ids
    /// that exist.
    pub async fn get_emails_batch(&self, ids: &[String]) -> Result<Vec<Email>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id IN ({placeholders})");
        let values = ids
            .iter()
            .map(|id| libsql::Value::Text(id.clone()))
            .collect::<Vec<_>>();
        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await?;

        let mut by_id: HashMap<String, Email> = HashMap::new();
        while let Some(row) = rows.next().await? {
            let email = row_to_email(&row)?;
            by_id.insert(email.id.clone(), email);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Most recent resolved folder decision for a conversation: the
    /// newest approved-or-partial suggestion across the thread by
    /// received time. Fuel for thread inheritance.
    pub async fn get_thread_classification(
        &self,
        conversation_id: &str,
    ) -> Result<Option<(String, f64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT s.approved_folder, s.confidence
                 FROM emails e
                 JOIN suggestions s ON e.id = s.email_id
                 WHERE e.conversation_id = ?1
                 AND s.status IN ('approved', 'partial')
                 AND s.approved_folder IS NOT NULL
                 ORDER BY e.received_at DESC
                 LIMIT 1",
                params![conversation_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let folder: String = row.get(0)?;
                let confidence: f64 = row.get(1)?;
                Ok(Some((folder, confidence)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_emails_by_status(
        &self,
        status: ClassificationStatus,
        limit: u32,
    ) -> Result<Vec<Email>, DatabaseError> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE classification_status = ?1
             ORDER BY received_at DESC
             LIMIT ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![status.as_str(), limit as i64])
            .await?;
        collect_emails(&mut rows).await
    }

    /// Emails in a conversation, newest first, optionally excluding the
    /// current message.
    pub async fn get_thread_emails(
        &self,
        conversation_id: &str,
        exclude_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Email>, DatabaseError> {
        let mut rows = match exclude_id {
            Some(exclude) => {
                let sql = format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails
                     WHERE conversation_id = ?1 AND id != ?2
                     ORDER BY received_at DESC
                     LIMIT ?3"
                );
                self.conn()
                    .query(&sql, params![conversation_id, exclude, limit as i64])
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails
                     WHERE conversation_id = ?1
                     ORDER BY received_at DESC
                     LIMIT ?2"
                );
                self.conn()
                    .query(&sql, params![conversation_id, limit as i64])
                    .await?
            }
        };
        collect_emails(&mut rows).await
    }

    /// Pending emails with no suggestion row, FIFO by received time.
    /// These are the backlog left behind by degraded mode.
    pub async fn get_backlog_emails(&self, limit: u32) -> Result<Vec<Email>, DatabaseError> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails e
             WHERE e.classification_status = 'pending'
             AND NOT EXISTS (SELECT 1 FROM suggestions s WHERE s.email_id = e.id)
             ORDER BY e.received_at ASC
             LIMIT ?1"
        );
        let mut rows = self.conn().query(&sql, params![limit as i64]).await?;
        collect_emails(&mut rows).await
    }

    pub async fn update_classification_status(
        &self,
        email_id: &str,
        status: ClassificationStatus,
        classification_json: Option<&serde_json::Value>,
    ) -> Result<(), DatabaseError> {
        match classification_json {
            Some(value) => {
                let json = serde_json::to_string(value)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                self.conn()
                    .execute(
                        "UPDATE emails
                         SET classification_status = ?1,
                             classification_json = ?2,
                             processed_at = ?3
                         WHERE id = ?4",
                        params![status.as_str(), json, now_str(), email_id],
                    )
                    .await?;
            }
            None => {
                self.conn()
                    .execute(
                        "UPDATE emails
                         SET classification_status = ?1,
                             processed_at = ?2
                         WHERE id = ?3",
                        params![status.as_str(), now_str(), email_id],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Atomic increment-and-return of the classification attempt
    /// counter. Returns 0 when the email row is absent.
    pub async fn increment_classification_attempts(
        &self,
        email_id: &str,
    ) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE emails
                 SET classification_attempts = classification_attempts + 1
                 WHERE id = ?1
                 RETURNING classification_attempts",
                params![email_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let count: i64 = row.get(0)?;
                Ok(count as u32)
            }
            None => {
                warn!(email_id = %email_id, "Email not found for attempt increment");
                Ok(0)
            }
        }
    }

    // ── Suggestion operations ───────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_suggestion(
        &self,
        email_id: &str,
        suggested_folder: &str,
        suggested_priority: Priority,
        suggested_action_type: ActionType,
        confidence: f64,
        reasoning: &str,
    ) -> Result<i64, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO suggestions (
                     email_id, created_at, suggested_folder, suggested_priority,
                     suggested_action_type, confidence, reasoning
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    email_id,
                    now_str(),
                    suggested_folder,
                    suggested_priority.as_str(),
                    suggested_action_type.as_str(),
                    confidence,
                    reasoning
                ],
            )
            .await?;
        let suggestion_id = self.conn().last_insert_rowid();
        debug!(
            suggestion_id,
            email_id = %email_id,
            folder = %suggested_folder,
            "Suggestion created"
        );
        Ok(suggestion_id)
    }

    pub async fn get_suggestion(
        &self,
        suggestion_id: i64,
    ) -> Result<Option<Suggestion>, DatabaseError> {
        let sql = format!("SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE id = ?1");
        let mut rows = self.conn().query(&sql, params![suggestion_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_suggestion(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_pending_suggestions(&self, limit: u32) -> Result<Vec<Suggestion>, DatabaseError> {
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM suggestions
             WHERE status = 'pending'
             ORDER BY created_at DESC
             LIMIT ?1"
        );
        let mut rows = self.conn().query(&sql, params![limit as i64]).await?;
        collect_suggestions(&mut rows).await
    }

    /// Approve a suggestion, optionally with corrections.
    ///
    /// One atomic conditional update guarded by `status = 'pending'`:
    /// status becomes `partial` when any approved value differs from the
    /// suggested value, else `approved`; omitted overrides fall back to
    /// the suggested values. Returns false when the row is missing or a
    /// concurrent approver already resolved it — callers must treat
    /// false as "someone else won".
    pub async fn approve_suggestion(
        &self,
        suggestion_id: i64,
        approved_folder: Option<&str>,
        approved_priority: Option<Priority>,
        approved_action_type: Option<ActionType>,
    ) -> Result<bool, DatabaseError> {
        let folder = approved_folder;
        let priority = approved_priority.map(|p| p.as_str());
        let action = approved_action_type.map(|a| a.as_str());

        let mut rows = self
            .conn()
            .query(
                "UPDATE suggestions
                 SET status = CASE
                     WHEN (?1 IS NOT NULL AND ?2 != suggested_folder)
                          OR (?3 IS NOT NULL AND ?4 != suggested_priority)
                          OR (?5 IS NOT NULL AND ?6 != suggested_action_type)
                     THEN 'partial'
                     ELSE 'approved'
                 END,
                 approved_folder = COALESCE(?7, suggested_folder),
                 approved_priority = COALESCE(?8, suggested_priority),
                 approved_action_type = COALESCE(?9, suggested_action_type),
                 resolved_at = ?10
                 WHERE id = ?11 AND status = 'pending'
                 RETURNING id, status, approved_folder",
                params![
                    folder, folder, priority, priority, action, action, folder, priority, action,
                    now_str(), suggestion_id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let status: String = row.get(1)?;
                let approved: String = row.get(2)?;
                info!(
                    suggestion_id,
                    status = %status,
                    folder = %approved,
                    "Suggestion approved"
                );
                Ok(true)
            }
            None => {
                warn!(suggestion_id, "Suggestion not found or already resolved");
                Ok(false)
            }
        }
    }

    /// Reject a pending suggestion. Resolved rows are left untouched.
    pub async fn reject_suggestion(&self, suggestion_id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE suggestions
                 SET status = 'rejected', resolved_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_str(), suggestion_id],
            )
            .await?;
        if changed > 0 {
            info!(suggestion_id, "Suggestion rejected");
        }
        Ok(changed > 0)
    }

    /// Expire pending suggestions older than `days`. Returns the count.
    pub async fn expire_old_suggestions(&self, days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let expired = self
            .conn()
            .execute(
                "UPDATE suggestions
                 SET status = 'rejected', resolved_at = ?1
                 WHERE status = 'pending' AND created_at < ?2",
                params![now_str(), format_ts(cutoff)],
            )
            .await?;
        if expired > 0 {
            info!(count = expired, days, "Expired old suggestions");
        }
        Ok(expired as usize)
    }

    /// Suggestions resolved as approved or partial within the window.
    /// The review surface builds confusion matrices from these.
    pub async fn get_resolved_suggestions(&self, days: u32) -> Result<Vec<Suggestion>, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM suggestions
             WHERE status IN ('approved', 'partial')
             AND resolved_at >= ?1
             ORDER BY resolved_at DESC"
        );
        let mut rows = self.conn().query(&sql, params![format_ts(cutoff)]).await?;
        collect_suggestions(&mut rows).await
    }

    /// User corrections (partial resolutions) within the window, joined
    /// with sender and subject for the preference learner.
    pub async fn get_recent_corrections(&self, days: u32) -> Result<Vec<Correction>, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let mut rows = self
            .conn()
            .query(
                "SELECT s.id, s.email_id, e.sender_email, e.subject,
                        s.suggested_folder, s.suggested_priority, s.suggested_action_type,
                        s.approved_folder, s.approved_priority, s.approved_action_type,
                        s.resolved_at
                 FROM suggestions s
                 JOIN emails e ON e.id = s.email_id
                 WHERE s.status = 'partial' AND s.resolved_at >= ?1
                 ORDER BY s.resolved_at DESC",
                params![format_ts(cutoff)],
            )
            .await?;

        let mut corrections = Vec::new();
        while let Some(row) = rows.next().await? {
            corrections.push(Correction {
                suggestion_id: row.get(0)?,
                email_id: row.get(1)?,
                sender_email: row.get::<String>(2).ok(),
                subject: row.get::<String>(3).ok(),
                suggested_folder: row.get(4)?,
                suggested_priority: parse_priority(&row.get::<String>(5)?),
                suggested_action_type: parse_action(&row.get::<String>(6)?),
                approved_folder: row.get::<String>(7).ok(),
                approved_priority: row.get::<String>(8).ok().and_then(|s| Priority::parse_str(&s)),
                approved_action_type: row
                    .get::<String>(9)
                    .ok()
                    .and_then(|s| ActionType::parse_str(&s)),
                resolved_at: row.get::<String>(10).ok().map(|s| parse_datetime(&s)),
            });
        }
        Ok(corrections)
    }

    /// Count of corrections resolved at or after `since`.
    pub async fn get_correction_count_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM suggestions
                 WHERE status = 'partial' AND resolved_at >= ?1",
                params![format_ts(since)],
            )
            .await?;
        let row = rows.next().await?.ok_or_else(|| {
            DatabaseError::Query("COUNT query returned no row".to_string())
        })?;
        let count: i64 = row.get(0)?;
        Ok(count as u32)
    }

    // ── Waiting-for operations ──────────────────────────────────────

    pub async fn create_waiting_for(
        &self,
        email_id: &str,
        conversation_id: &str,
        expected_from: &str,
        description: &str,
        nudge_after_hours: u32,
    ) -> Result<i64, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO waiting_for (
                     email_id, conversation_id, waiting_since,
                     expected_from, description, nudge_after_hours
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    email_id,
                    conversation_id,
                    now_str(),
                    expected_from,
                    description,
                    nudge_after_hours as i64
                ],
            )
            .await?;
        Ok(self.conn().last_insert_rowid())
    }

    pub async fn get_active_waiting_for(&self) -> Result<Vec<WaitingFor>, DatabaseError> {
        let sql = format!(
            "SELECT {WAITING_FOR_COLUMNS} FROM waiting_for
             WHERE status = 'waiting'
             ORDER BY waiting_since ASC"
        );
        let mut rows = self.conn().query(&sql, ()).await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_waiting_for(&row)?);
        }
        Ok(items)
    }

    pub async fn resolve_waiting_for(
        &self,
        waiting_for_id: i64,
        status: WaitingStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE waiting_for SET status = ?1, resolved_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_str(), waiting_for_id],
            )
            .await?;
        Ok(())
    }

    /// Most recent active waiting-for tracker on a conversation, if any.
    pub async fn check_waiting_for_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<WaitingFor>, DatabaseError> {
        let sql = format!(
            "SELECT {WAITING_FOR_COLUMNS} FROM waiting_for
             WHERE conversation_id = ?1 AND status = 'waiting'
             ORDER BY waiting_since DESC
             LIMIT 1"
        );
        let mut rows = self.conn().query(&sql, params![conversation_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_waiting_for(&row)?)),
            None => Ok(None),
        }
    }

    // ── Agent state operations ──────────────────────────────────────

    pub async fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM agent_state WHERE key = ?1", params![key])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agent_state (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, value, now_str()],
            )
            .await?;
        Ok(())
    }

    pub async fn delete_state(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM agent_state WHERE key = ?1", params![key])
            .await?;
        Ok(())
    }

    /// Cycle summary for the review surface, derived from the reserved
    /// state keys.
    pub async fn get_cycle_info(&self) -> Result<CycleInfo, DatabaseError> {
        Ok(CycleInfo {
            last_cycle_at: self
                .get_state(STATE_LAST_CYCLE)
                .await?
                .map(|s| parse_datetime(&s)),
            last_cycle_id: self.get_state(STATE_LAST_CYCLE_ID).await?,
            last_processed_timestamp: self
                .get_state(STATE_LAST_PROCESSED)
                .await?
                .map(|s| parse_datetime(&s)),
        })
    }

    // ── Sender profile operations ───────────────────────────────────

    /// Insert or update a sender profile (keyed by lowercased address).
    ///
    /// A non-`unknown` category overrides `unknown` but an `unknown`
    /// upsert never downgrades an existing category; the email count
    /// only moves forward.
    pub async fn upsert_sender_profile(
        &self,
        email: &str,
        display_name: Option<&str>,
        category: SenderCategory,
        increment_count: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(SENDER_UPSERT_SQL, sender_upsert_params(email, display_name, category, increment_count))
            .await?;
        Ok(())
    }

    /// Batch profile upsert in one transaction; every entry increments.
    pub async fn upsert_sender_profiles_batch(
        &self,
        profiles: &[(String, Option<String>)],
    ) -> Result<usize, DatabaseError> {
        if profiles.is_empty() {
            return Ok(0);
        }
        let tx = self.conn().transaction().await?;
        for (email, display_name) in profiles {
            tx.execute(
                SENDER_UPSERT_SQL,
                sender_upsert_params(email, display_name.as_deref(), SenderCategory::Unknown, true),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(profiles.len())
    }

    pub async fn get_sender_profile(
        &self,
        email: &str,
    ) -> Result<Option<SenderProfile>, DatabaseError> {
        let sql = format!("SELECT {SENDER_PROFILE_COLUMNS} FROM sender_profiles WHERE email = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![email.to_lowercase()])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_sender_profile(&row)?)),
            None => Ok(None),
        }
    }

    /// Folder distribution of resolved suggestions for one sender.
    pub async fn get_sender_history(&self, sender_email: &str) -> Result<SenderHistory, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT s.approved_folder, COUNT(*) as count
                 FROM emails e
                 JOIN suggestions s ON e.id = s.email_id
                 WHERE LOWER(e.sender_email) = ?1
                 AND s.status IN ('approved', 'partial')
                 AND s.approved_folder IS NOT NULL
                 GROUP BY s.approved_folder",
                params![sender_email.to_lowercase()],
            )
            .await?;

        let mut history = SenderHistory {
            email: sender_email.to_lowercase(),
            ..SenderHistory::default()
        };
        while let Some(row) = rows.next().await? {
            let folder: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            history.total_emails += count as u32;
            history.folder_distribution.insert(folder, count as u32);
        }
        Ok(history)
    }

    /// Sender histories for many senders in one query.
    pub async fn get_sender_histories_batch(
        &self,
        sender_emails: &[String],
    ) -> Result<HashMap<String, SenderHistory>, DatabaseError> {
        if sender_emails.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = sender_emails.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT LOWER(e.sender_email) as sender, s.approved_folder, COUNT(*) as count
             FROM emails e
             JOIN suggestions s ON e.id = s.email_id
             WHERE LOWER(e.sender_email) IN ({placeholders})
             AND s.status IN ('approved', 'partial')
             AND s.approved_folder IS NOT NULL
             GROUP BY LOWER(e.sender_email), s.approved_folder"
        );
        let values = sender_emails
            .iter()
            .map(|e| libsql::Value::Text(e.to_lowercase()))
            .collect::<Vec<_>>();
        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await?;

        let mut result: HashMap<String, SenderHistory> = sender_emails
            .iter()
            .map(|e| {
                let lower = e.to_lowercase();
                (
                    lower.clone(),
                    SenderHistory {
                        email: lower,
                        ..SenderHistory::default()
                    },
                )
            })
            .collect();

        while let Some(row) = rows.next().await? {
            let sender: String = row.get(0)?;
            let folder: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            if let Some(history) = result.get_mut(&sender) {
                history.total_emails += count as u32;
                history.folder_distribution.insert(folder, count as u32);
            }
        }
        Ok(result)
    }

    pub async fn update_sender_default_folder(
        &self,
        email: &str,
        default_folder: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sender_profiles
                 SET default_folder = ?1, updated_at = ?2
                 WHERE email = ?3",
                params![default_folder, now_str(), email.to_lowercase()],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_auto_rule_candidate(
        &self,
        email: &str,
        is_candidate: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sender_profiles
                 SET auto_rule_candidate = ?1, updated_at = ?2
                 WHERE email = ?3",
                params![is_candidate as i64, now_str(), email.to_lowercase()],
            )
            .await?;
        Ok(())
    }

    pub async fn get_auto_rule_candidates(&self) -> Result<Vec<SenderProfile>, DatabaseError> {
        let sql = format!(
            "SELECT {SENDER_PROFILE_COLUMNS} FROM sender_profiles
             WHERE auto_rule_candidate = 1
             ORDER BY email_count DESC"
        );
        let mut rows = self.conn().query(&sql, ()).await?;
        let mut profiles = Vec::new();
        while let Some(row) = rows.next().await? {
            profiles.push(row_to_sender_profile(&row)?);
        }
        Ok(profiles)
    }

    // ── Audit log operations ────────────────────────────────────────

    pub async fn log_action(
        &self,
        action_type: &str,
        email_id: Option<&str>,
        details: Option<&ActionDetails>,
        triggered_by: &str,
        triage_cycle_id: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let details_json = details
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO action_log (
                     timestamp, action_type, email_id, triage_cycle_id,
                     details_json, triggered_by
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![now_str(), action_type, email_id, triage_cycle_id, details_json, triggered_by],
            )
            .await?;
        Ok(self.conn().last_insert_rowid())
    }

    pub async fn get_action_logs(
        &self,
        limit: u32,
        email_id: Option<&str>,
        action_type: Option<&str>,
    ) -> Result<Vec<ActionLogEntry>, DatabaseError> {
        let mut sql = String::from(
            "SELECT id, timestamp, action_type, email_id, triage_cycle_id, details_json, \
             triggered_by FROM action_log WHERE 1=1",
        );
        let mut values: Vec<libsql::Value> = Vec::new();
        if let Some(email) = email_id {
            sql.push_str(" AND email_id = ?");
            values.push(libsql::Value::Text(email.to_string()));
        }
        if let Some(action) = action_type {
            sql.push_str(" AND action_type = ?");
            values.push(libsql::Value::Text(action.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        values.push(libsql::Value::Integer(limit as i64));

        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(ActionLogEntry {
                id: row.get(0)?,
                timestamp: parse_datetime(&row.get::<String>(1)?),
                action_type: row.get(2)?,
                email_id: row.get::<String>(3).ok(),
                triage_cycle_id: row.get::<String>(4).ok(),
                details: row
                    .get::<String>(5)
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok()),
                triggered_by: row.get(6)?,
            });
        }
        Ok(entries)
    }

    /// Persist one LLM audit row. Callers treat failures here as
    /// non-fatal; the classification itself has already been decided.
    pub async fn log_llm_request(&self, record: &LlmRequestRecord<'_>) -> Result<i64, DatabaseError> {
        let prompt_json = record
            .prompt
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let response_json = record
            .response
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let tool_call_json = record
            .tool_call
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO llm_request_log (
                     timestamp, task_type, model, email_id, triage_cycle_id,
                     prompt_json, response_json, tool_call_json,
                     input_tokens, output_tokens, duration_ms, error
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    now_str(),
                    record.task_type,
                    record.model,
                    record.email_id,
                    record.triage_cycle_id,
                    prompt_json,
                    response_json,
                    tool_call_json,
                    record.input_tokens.map(|t| t as i64),
                    record.output_tokens.map(|t| t as i64),
                    record.duration_ms.map(|d| d as i64),
                    record.error
                ],
            )
            .await?;
        Ok(self.conn().last_insert_rowid())
    }

    pub async fn get_llm_logs(
        &self,
        limit: u32,
        email_id: Option<&str>,
        triage_cycle_id: Option<&str>,
    ) -> Result<Vec<LlmLogEntry>, DatabaseError> {
        let mut sql = String::from(
            "SELECT id, timestamp, task_type, model, email_id, triage_cycle_id, prompt_json, \
             response_json, tool_call_json, input_tokens, output_tokens, duration_ms, error \
             FROM llm_request_log WHERE 1=1",
        );
        let mut values: Vec<libsql::Value> = Vec::new();
        if let Some(email) = email_id {
            sql.push_str(" AND email_id = ?");
            values.push(libsql::Value::Text(email.to_string()));
        }
        if let Some(cycle) = triage_cycle_id {
            sql.push_str(" AND triage_cycle_id = ?");
            values.push(libsql::Value::Text(cycle.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        values.push(libsql::Value::Integer(limit as i64));

        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(LlmLogEntry {
                id: row.get(0)?,
                timestamp: parse_datetime(&row.get::<String>(1)?),
                task_type: row.get(2)?,
                model: row.get(3)?,
                email_id: row.get::<String>(4).ok(),
                triage_cycle_id: row.get::<String>(5).ok(),
                prompt: row
                    .get::<String>(6)
                    .ok()
                    .and_then(|s| serde_json::from_str::<LlmPromptPayload>(&s).ok()),
                response: row
                    .get::<String>(7)
                    .ok()
                    .and_then(|s| serde_json::from_str::<LlmResponsePayload>(&s).ok()),
                tool_call: row
                    .get::<String>(8)
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok()),
                input_tokens: row.get::<i64>(9).ok().map(|t| t as u32),
                output_tokens: row.get::<i64>(10).ok().map(|t| t as u32),
                duration_ms: row.get::<i64>(11).ok().map(|d| d as u32),
                error: row.get::<String>(12).ok(),
            });
        }
        Ok(entries)
    }

    /// Delete LLM audit rows older than the retention window.
    pub async fn prune_llm_logs(&self, retention_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM llm_request_log WHERE timestamp < ?1",
                params![format_ts(cutoff)],
            )
            .await?;
        if deleted > 0 {
            info!(deleted, retention_days, "Pruned LLM logs");
        }
        Ok(deleted as usize)
    }

    // ── Maintenance & stats ─────────────────────────────────────────

    /// Reclaim deleted space. Requires exclusive access; run after
    /// pruning, not mid-cycle.
    pub async fn vacuum(&self) -> Result<(), DatabaseError> {
        self.conn().execute("VACUUM", ()).await?;
        info!("Database vacuumed");
        Ok(())
    }

    /// Refresh query planner statistics after bulk writes.
    pub async fn analyze(&self) -> Result<(), DatabaseError> {
        self.conn().execute("ANALYZE", ()).await?;
        info!("Database analyzed");
        Ok(())
    }

    /// Dashboard counters.
    pub async fn get_stats(&self) -> Result<StoreStats, DatabaseError> {
        let mut stats = StoreStats::default();

        let mut rows = self
            .conn()
            .query(
                "SELECT classification_status, COUNT(*) FROM emails GROUP BY classification_status",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            stats.emails_by_status.insert(status, count as u32);
        }

        stats.pending_suggestions = self
            .scalar_count("SELECT COUNT(*) FROM suggestions WHERE status = 'pending'")
            .await?;
        stats.active_waiting_for = self
            .scalar_count("SELECT COUNT(*) FROM waiting_for WHERE status = 'waiting'")
            .await?;
        stats.total_senders = self.scalar_count("SELECT COUNT(*) FROM sender_profiles").await?;
        stats.auto_rule_candidates = self
            .scalar_count("SELECT COUNT(*) FROM sender_profiles WHERE auto_rule_candidate = 1")
            .await?;

        let yesterday = Utc::now() - Duration::days(1);
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM action_log WHERE timestamp > ?1",
                params![format_ts(yesterday)],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            let count: i64 = row.get(0)?;
            stats.actions_last_24h = count as u32;
        }

        Ok(stats)
    }

    async fn scalar_count(&self, sql: &str) -> Result<u32, DatabaseError> {
        let mut rows = self.conn().query(sql, ()).await?;
        match rows.next().await? {
            Some(row) => {
                let count: i64 = row.get(0)?;
                Ok(count as u32)
            }
            None => Ok(0),
        }
    }
}

/// Borrowed record for one LLM audit row.
pub struct LlmRequestRecord<'a> {
    pub task_type: &'a str,
    pub model: &'a str,
    pub email_id: Option<&'a str>,
    pub triage_cycle_id: Option<&'a str>,
    pub prompt: Option<&'a LlmPromptPayload>,
    pub response: Option<&'a LlmResponsePayload>,
    pub tool_call: Option<&'a serde_json::Value>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub duration_ms: Option<u32>,
    pub error: Option<&'a str>,
}

// ── SQL + row mapping helpers ───────────────────────────────────────

const EMAIL_UPSERT_SQL: &str = "INSERT INTO emails (
         id, conversation_id, conversation_index, subject, sender_email, sender_name,
         received_at, snippet, current_folder, web_link, importance, is_read, flag_status,
         has_user_reply, inherited_folder, processed_at, classification_json,
         classification_attempts, classification_status
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
     ON CONFLICT(id) DO UPDATE SET
         conversation_id = excluded.conversation_id,
         conversation_index = excluded.conversation_index,
         subject = excluded.subject,
         sender_email = excluded.sender_email,
         sender_name = excluded.sender_name,
         received_at = excluded.received_at,
         snippet = excluded.snippet,
         current_folder = excluded.current_folder,
         web_link = excluded.web_link,
         importance = excluded.importance,
         is_read = excluded.is_read,
         flag_status = excluded.flag_status,
         has_user_reply = excluded.has_user_reply,
         inherited_folder = excluded.inherited_folder,
         processed_at = excluded.processed_at,
         classification_json = excluded.classification_json,
         classification_attempts = excluded.classification_attempts,
         classification_status = excluded.classification_status";

fn email_upsert_params(
    email: &Email,
    snippet: Option<String>,
) -> Result<Vec<libsql::Value>, DatabaseError> {
    use libsql::Value;
    let classification_json = email
        .classification_json
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(vec![
        Value::Text(email.id.clone()),
        opt_text(email.conversation_id.clone()),
        opt_text(email.conversation_index.clone()),
        opt_text(email.subject.clone()),
        opt_text(email.sender_email.clone()),
        opt_text(email.sender_name.clone()),
        opt_text(email.received_at.map(format_ts)),
        opt_text(snippet),
        opt_text(email.current_folder.clone()),
        opt_text(email.web_link.clone()),
        Value::Text(email.importance.clone()),
        Value::Integer(email.is_read as i64),
        Value::Text(email.flag_status.clone()),
        Value::Integer(email.has_user_reply as i64),
        opt_text(email.inherited_folder.clone()),
        opt_text(email.processed_at.map(format_ts)),
        opt_text(classification_json),
        Value::Integer(email.classification_attempts as i64),
        Value::Text(email.classification_status.as_str().to_string()),
    ])
}

const SENDER_UPSERT_SQL: &str = "INSERT INTO sender_profiles (
         email, display_name, domain, category, email_count, last_seen, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(email) DO UPDATE SET
         display_name = COALESCE(excluded.display_name, display_name),
         category = CASE WHEN excluded.category != 'unknown'
                        THEN excluded.category ELSE category END,
         email_count = CASE WHEN ?8 THEN email_count + 1 ELSE email_count END,
         last_seen = excluded.last_seen,
         updated_at = excluded.updated_at";

fn sender_upsert_params(
    email: &str,
    display_name: Option<&str>,
    category: SenderCategory,
    increment_count: bool,
) -> Vec<libsql::Value> {
    use libsql::Value;
    let domain = email.split('@').nth(1).map(|d| d.to_lowercase());
    let now = now_str();
    vec![
        Value::Text(email.to_lowercase()),
        opt_text(display_name.map(|s| s.to_string())),
        opt_text(domain),
        Value::Text(category.as_str().to_string()),
        Value::Integer(increment_count as i64),
        Value::Text(now.clone()),
        Value::Text(now),
        Value::Integer(increment_count as i64),
    ]
}

fn opt_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn now_str() -> String {
    format_ts(Utc::now())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into `DateTime<Utc>`.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_priority(s: &str) -> Priority {
    Priority::parse_str(s).unwrap_or(Priority::P4Low)
}

fn parse_action(s: &str) -> ActionType {
    ActionType::parse_str(s).unwrap_or(ActionType::FyiOnly)
}

fn row_to_email(row: &libsql::Row) -> Result<Email, DatabaseError> {
    Ok(Email {
        id: row.get(0)?,
        conversation_id: row.get::<String>(1).ok(),
        conversation_index: row.get::<String>(2).ok(),
        subject: row.get::<String>(3).ok(),
        sender_email: row.get::<String>(4).ok(),
        sender_name: row.get::<String>(5).ok(),
        received_at: row.get::<String>(6).ok().map(|s| parse_datetime(&s)),
        snippet: row.get::<String>(7).ok(),
        current_folder: row.get::<String>(8).ok(),
        web_link: row.get::<String>(9).ok(),
        importance: row.get(10)?,
        is_read: row.get::<i64>(11)? != 0,
        flag_status: row.get(12)?,
        has_user_reply: row.get::<i64>(13)? != 0,
        inherited_folder: row.get::<String>(14).ok(),
        processed_at: row.get::<String>(15).ok().map(|s| parse_datetime(&s)),
        classification_json: row
            .get::<String>(16)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
        classification_attempts: row.get::<i64>(17)? as u32,
        classification_status: ClassificationStatus::parse_str(&row.get::<String>(18)?)
            .unwrap_or(ClassificationStatus::Pending),
    })
}

fn row_to_suggestion(row: &libsql::Row) -> Result<Suggestion, DatabaseError> {
    Ok(Suggestion {
        id: row.get(0)?,
        email_id: row.get(1)?,
        created_at: parse_datetime(&row.get::<String>(2)?),
        suggested_folder: row.get(3)?,
        suggested_priority: parse_priority(&row.get::<String>(4)?),
        suggested_action_type: parse_action(&row.get::<String>(5)?),
        confidence: row.get(6)?,
        reasoning: row.get(7)?,
        status: SuggestionStatus::parse_str(&row.get::<String>(8)?)
            .unwrap_or(SuggestionStatus::Pending),
        approved_folder: row.get::<String>(9).ok(),
        approved_priority: row.get::<String>(10).ok().and_then(|s| Priority::parse_str(&s)),
        approved_action_type: row
            .get::<String>(11)
            .ok()
            .and_then(|s| ActionType::parse_str(&s)),
        resolved_at: row.get::<String>(12).ok().map(|s| parse_datetime(&s)),
    })
}

fn row_to_waiting_for(row: &libsql::Row) -> Result<WaitingFor, DatabaseError> {
    Ok(WaitingFor {
        id: row.get(0)?,
        email_id: row.get(1)?,
        conversation_id: row.get::<String>(2).ok(),
        waiting_since: row.get::<String>(3).ok().map(|s| parse_datetime(&s)),
        expected_from: row.get::<String>(4).ok(),
        description: row.get::<String>(5).ok(),
        status: WaitingStatus::parse_str(&row.get::<String>(6)?).unwrap_or(WaitingStatus::Waiting),
        nudge_after_hours: row.get::<i64>(7)? as u32,
        resolved_at: row.get::<String>(8).ok().map(|s| parse_datetime(&s)),
    })
}

fn row_to_sender_profile(row: &libsql::Row) -> Result<SenderProfile, DatabaseError> {
    Ok(SenderProfile {
        email: row.get(0)?,
        display_name: row.get::<String>(1).ok(),
        domain: row.get::<String>(2).ok(),
        category: SenderCategory::parse_str(&row.get::<String>(3)?)
            .unwrap_or(SenderCategory::Unknown),
        default_folder: row.get::<String>(4).ok(),
        email_count: row.get::<i64>(5)? as u32,
        last_seen: row.get::<String>(6).ok().map(|s| parse_datetime(&s)),
        auto_rule_candidate: row.get::<i64>(7)? != 0,
        updated_at: row.get::<String>(8).ok().map(|s| parse_datetime(&s)),
    })
}

async fn collect_emails(rows: &mut libsql::Rows) -> Result<Vec<Email>, DatabaseError> {
    let mut emails = Vec::new();
    while let Some(row) = rows.next().await? {
        emails.push(row_to_email(&row)?);
    }
    Ok(emails)
}

async fn collect_suggestions(rows: &mut libsql::Rows) -> Result<Vec<Suggestion>, DatabaseError> {
    let mut suggestions = Vec::new();
    while let Some(row) = rows.next().await? {
        suggestions.push(row_to_suggestion(&row)?);
    }
    Ok(suggestions)
}
