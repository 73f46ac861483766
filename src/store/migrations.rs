//! Database schema initialization.
//!
//! Single `init_schema()` creates all tables idempotently with
//! `CREATE TABLE IF NOT EXISTS`. No migration tracking, no version
//! table. PRAGMAs are applied per connection in the store.

use libsql::Connection;

use crate::error::DatabaseError;

/// Complete schema — all 7 tables with indexes.
const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS emails (
        id TEXT PRIMARY KEY,
        conversation_id TEXT,
        conversation_index TEXT,
        subject TEXT,
        sender_email TEXT,
        sender_name TEXT,
        received_at TEXT,
        snippet TEXT,
        current_folder TEXT,
        web_link TEXT,
        importance TEXT NOT NULL DEFAULT 'normal',
        is_read INTEGER NOT NULL DEFAULT 0,
        flag_status TEXT NOT NULL DEFAULT 'notFlagged',
        has_user_reply INTEGER NOT NULL DEFAULT 0,
        inherited_folder TEXT,
        processed_at TEXT,
        classification_json TEXT,
        classification_attempts INTEGER NOT NULL DEFAULT 0,
        classification_status TEXT NOT NULL DEFAULT 'pending'
    );
    CREATE INDEX IF NOT EXISTS idx_emails_conversation ON emails(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_emails_sender ON emails(sender_email);
    CREATE INDEX IF NOT EXISTS idx_emails_received ON emails(received_at);
    CREATE INDEX IF NOT EXISTS idx_emails_status ON emails(classification_status);

    CREATE TABLE IF NOT EXISTS suggestions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id TEXT NOT NULL REFERENCES emails(id),
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        suggested_folder TEXT NOT NULL,
        suggested_priority TEXT NOT NULL,
        suggested_action_type TEXT NOT NULL,
        confidence REAL NOT NULL,
        reasoning TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        approved_folder TEXT,
        approved_priority TEXT,
        approved_action_type TEXT,
        resolved_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_suggestions_email ON suggestions(email_id);
    CREATE INDEX IF NOT EXISTS idx_suggestions_status ON suggestions(status);
    CREATE INDEX IF NOT EXISTS idx_suggestions_resolved ON suggestions(resolved_at);

    CREATE TABLE IF NOT EXISTS waiting_for (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id TEXT NOT NULL REFERENCES emails(id),
        conversation_id TEXT,
        waiting_since TEXT,
        expected_from TEXT,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'waiting',
        nudge_after_hours INTEGER NOT NULL DEFAULT 48,
        resolved_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_waiting_for_status ON waiting_for(status);
    CREATE INDEX IF NOT EXISTS idx_waiting_for_conversation ON waiting_for(conversation_id);

    CREATE TABLE IF NOT EXISTS sender_profiles (
        email TEXT PRIMARY KEY,
        display_name TEXT,
        domain TEXT,
        category TEXT NOT NULL DEFAULT 'unknown',
        default_folder TEXT,
        email_count INTEGER NOT NULL DEFAULT 0,
        last_seen TEXT,
        auto_rule_candidate INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_sender_profiles_domain ON sender_profiles(domain);
    CREATE INDEX IF NOT EXISTS idx_sender_profiles_candidate
        ON sender_profiles(auto_rule_candidate);

    CREATE TABLE IF NOT EXISTS agent_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT
    );

    CREATE TABLE IF NOT EXISTS action_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL DEFAULT (datetime('now')),
        action_type TEXT NOT NULL,
        email_id TEXT,
        triage_cycle_id TEXT,
        details_json TEXT,
        triggered_by TEXT NOT NULL DEFAULT 'auto'
    );
    CREATE INDEX IF NOT EXISTS idx_action_log_email ON action_log(email_id);
    CREATE INDEX IF NOT EXISTS idx_action_log_type ON action_log(action_type);
    CREATE INDEX IF NOT EXISTS idx_action_log_timestamp ON action_log(timestamp);

    CREATE TABLE IF NOT EXISTS llm_request_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL DEFAULT (datetime('now')),
        task_type TEXT NOT NULL,
        model TEXT NOT NULL,
        email_id TEXT,
        triage_cycle_id TEXT,
        prompt_json TEXT,
        response_json TEXT,
        tool_call_json TEXT,
        input_tokens INTEGER,
        output_tokens INTEGER,
        duration_ms INTEGER,
        error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_llm_log_email ON llm_request_log(email_id);
    CREATE INDEX IF NOT EXISTS idx_llm_log_cycle ON llm_request_log(triage_cycle_id);
    CREATE INDEX IF NOT EXISTS idx_llm_log_timestamp ON llm_request_log(timestamp);
"#;

/// Create all tables and indexes idempotently.
///
/// Safe to call on every startup.
pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(SCHEMA)
        .await
        .map_err(|e| DatabaseError::Migration(format!("Schema initialization failed: {e}")))?;

    tracing::info!("Database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn creates_all_tables() {
        let conn = test_conn().await;
        init_schema(&conn).await.unwrap();

        let expected_tables = [
            "emails",
            "suggestions",
            "waiting_for",
            "sender_profiles",
            "agent_state",
            "action_log",
            "llm_request_log",
        ];

        for table in &expected_tables {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn is_idempotent() {
        let conn = test_conn().await;
        init_schema(&conn).await.unwrap();
        init_schema(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM sqlite_master WHERE type='table'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert!(count >= 7, "Expected at least 7 tables, got {count}");
    }

    #[tokio::test]
    async fn email_columns_exist() {
        let conn = test_conn().await;
        init_schema(&conn).await.unwrap();

        let cols = get_column_names(&conn, "emails").await;
        for col in &[
            "id",
            "conversation_id",
            "conversation_index",
            "subject",
            "sender_email",
            "sender_name",
            "received_at",
            "snippet",
            "current_folder",
            "web_link",
            "importance",
            "is_read",
            "flag_status",
            "has_user_reply",
            "inherited_folder",
            "processed_at",
            "classification_json",
            "classification_attempts",
            "classification_status",
        ] {
            assert!(cols.contains(&col.to_string()), "emails.{col} missing");
        }
    }

    #[tokio::test]
    async fn suggestion_columns_exist() {
        let conn = test_conn().await;
        init_schema(&conn).await.unwrap();

        let cols = get_column_names(&conn, "suggestions").await;
        for col in &[
            "id",
            "email_id",
            "created_at",
            "suggested_folder",
            "suggested_priority",
            "suggested_action_type",
            "confidence",
            "reasoning",
            "status",
            "approved_folder",
            "approved_priority",
            "approved_action_type",
            "resolved_at",
        ] {
            assert!(cols.contains(&col.to_string()), "suggestions.{col} missing");
        }
    }

    async fn get_column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut rows = conn
            .query(&format!("PRAGMA table_info({table})"), ())
            .await
            .unwrap();
        let mut cols = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let name: String = row.get(1).unwrap();
            cols.push(name);
        }
        cols
    }
}
