//! Row types and closed enums for the persistence layer.
//!
//! Enum values carry the exact wire strings used both in the database
//! and in the mail provider's category labels, so the same constants
//! flow from the classifier through storage to the review surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Priority level applied to a triaged email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "P1 - Urgent Important")]
    P1UrgentImportant,
    #[serde(rename = "P2 - Important")]
    P2Important,
    #[serde(rename = "P3 - Urgent Low")]
    P3UrgentLow,
    #[serde(rename = "P4 - Low")]
    P4Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::P1UrgentImportant,
        Priority::P2Important,
        Priority::P3UrgentLow,
        Priority::P4Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1UrgentImportant => "P1 - Urgent Important",
            Priority::P2Important => "P2 - Important",
            Priority::P3UrgentLow => "P3 - Urgent Low",
            Priority::P4Low => "P4 - Low",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

/// Action type applied to a triaged email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "Needs Reply")]
    NeedsReply,
    #[serde(rename = "Review")]
    Review,
    #[serde(rename = "Delegated")]
    Delegated,
    #[serde(rename = "FYI Only")]
    FyiOnly,
    #[serde(rename = "Waiting For")]
    WaitingFor,
    #[serde(rename = "Scheduled")]
    Scheduled,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::NeedsReply,
        ActionType::Review,
        ActionType::Delegated,
        ActionType::FyiOnly,
        ActionType::WaitingFor,
        ActionType::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::NeedsReply => "Needs Reply",
            ActionType::Review => "Review",
            ActionType::Delegated => "Delegated",
            ActionType::FyiOnly => "FYI Only",
            ActionType::WaitingFor => "Waiting For",
            ActionType::Scheduled => "Scheduled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

/// Lifecycle of a suggestion. All non-pending states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
    /// Approved with at least one correction.
    Partial,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Partial => "partial",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SuggestionStatus::Pending),
            "approved" => Some(SuggestionStatus::Approved),
            "rejected" => Some(SuggestionStatus::Rejected),
            "partial" => Some(SuggestionStatus::Partial),
            _ => None,
        }
    }
}

/// Email classification lifecycle. `Classified` and `Failed` are
/// terminal; only a ≥3 attempt count may transition to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationStatus {
    Pending,
    Classified,
    Failed,
}

impl ClassificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationStatus::Pending => "pending",
            ClassificationStatus::Classified => "classified",
            ClassificationStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ClassificationStatus::Pending),
            "classified" => Some(ClassificationStatus::Classified),
            "failed" => Some(ClassificationStatus::Failed),
            _ => None,
        }
    }
}

/// Waiting-for tracker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitingStatus {
    Waiting,
    Received,
    Expired,
}

impl WaitingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitingStatus::Waiting => "waiting",
            WaitingStatus::Received => "received",
            WaitingStatus::Expired => "expired",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(WaitingStatus::Waiting),
            "received" => Some(WaitingStatus::Received),
            "expired" => Some(WaitingStatus::Expired),
            _ => None,
        }
    }
}

/// Sender category. `Unknown` is the default and the only value a
/// profile upsert may silently replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderCategory {
    KeyContact,
    Newsletter,
    Automated,
    Internal,
    Client,
    Vendor,
    Unknown,
}

impl SenderCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderCategory::KeyContact => "key_contact",
            SenderCategory::Newsletter => "newsletter",
            SenderCategory::Automated => "automated",
            SenderCategory::Internal => "internal",
            SenderCategory::Client => "client",
            SenderCategory::Vendor => "vendor",
            SenderCategory::Unknown => "unknown",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "key_contact" => Some(SenderCategory::KeyContact),
            "newsletter" => Some(SenderCategory::Newsletter),
            "automated" => Some(SenderCategory::Automated),
            "internal" => Some(SenderCategory::Internal),
            "client" => Some(SenderCategory::Client),
            "vendor" => Some(SenderCategory::Vendor),
            "unknown" => Some(SenderCategory::Unknown),
            _ => None,
        }
    }
}

/// A persisted email. Identity is the provider's opaque message id.
#[derive(Debug, Clone)]
pub struct Email {
    pub id: String,
    pub conversation_id: Option<String>,
    /// Opaque base64 conversation index from the provider; drives
    /// thread-depth calculation.
    pub conversation_index: Option<String>,
    pub subject: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    /// Cleaned body snippet; truncated at write time.
    pub snippet: Option<String>,
    pub current_folder: Option<String>,
    pub web_link: Option<String>,
    pub importance: String,
    pub is_read: bool,
    pub flag_status: String,
    pub has_user_reply: bool,
    pub inherited_folder: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub classification_json: Option<serde_json::Value>,
    pub classification_attempts: u32,
    pub classification_status: ClassificationStatus,
}

impl Email {
    /// New unprocessed email with the given id; the remaining fields
    /// default to an unclassified state.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            conversation_id: None,
            conversation_index: None,
            subject: None,
            sender_email: None,
            sender_name: None,
            received_at: None,
            snippet: None,
            current_folder: None,
            web_link: None,
            importance: "normal".to_string(),
            is_read: false,
            flag_status: "notFlagged".to_string(),
            has_user_reply: false,
            inherited_folder: None,
            processed_at: None,
            classification_json: None,
            classification_attempts: 0,
            classification_status: ClassificationStatus::Pending,
        }
    }
}

/// A triage suggestion awaiting (or past) user review.
#[derive(Debug, Clone)]
pub struct Suggestion {
    pub id: i64,
    pub email_id: String,
    pub created_at: DateTime<Utc>,
    pub suggested_folder: String,
    pub suggested_priority: Priority,
    pub suggested_action_type: ActionType,
    pub confidence: f64,
    pub reasoning: String,
    pub status: SuggestionStatus,
    pub approved_folder: Option<String>,
    pub approved_priority: Option<Priority>,
    pub approved_action_type: Option<ActionType>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A waiting-for tracker created when a classification yields
/// action type "Waiting For" with a known counterpart.
#[derive(Debug, Clone)]
pub struct WaitingFor {
    pub id: i64,
    pub email_id: String,
    pub conversation_id: Option<String>,
    pub waiting_since: Option<DateTime<Utc>>,
    pub expected_from: Option<String>,
    pub description: Option<String>,
    pub status: WaitingStatus,
    pub nudge_after_hours: u32,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Aggregated profile for one sender, keyed by lowercased address.
#[derive(Debug, Clone)]
pub struct SenderProfile {
    pub email: String,
    pub display_name: Option<String>,
    pub domain: Option<String>,
    pub category: SenderCategory,
    pub default_folder: Option<String>,
    pub email_count: u32,
    pub last_seen: Option<DateTime<Utc>>,
    pub auto_rule_candidate: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Folder distribution for one sender's resolved suggestions.
#[derive(Debug, Clone, Default)]
pub struct SenderHistory {
    pub email: String,
    pub total_emails: u32,
    pub folder_distribution: HashMap<String, u32>,
}

/// A user correction: a suggestion resolved as `partial`, joined with
/// its email. Fed to the preference learner.
#[derive(Debug, Clone)]
pub struct Correction {
    pub suggestion_id: i64,
    pub email_id: String,
    pub sender_email: Option<String>,
    pub subject: Option<String>,
    pub suggested_folder: String,
    pub suggested_priority: Priority,
    pub suggested_action_type: ActionType,
    pub approved_folder: Option<String>,
    pub approved_priority: Option<Priority>,
    pub approved_action_type: Option<ActionType>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Audit payload for an action log row. A closed union per producing
/// site rather than a free-form map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDetails {
    /// Auto-rule classification, self-approved.
    Classify {
        method: String,
        folder: String,
        priority: Priority,
        action_type: ActionType,
        reasoning: String,
    },
    /// LLM (or inherited) suggestion awaiting review.
    Suggest {
        method: String,
        folder: String,
        priority: Priority,
        action_type: ActionType,
        confidence: f64,
        inherited_folder: bool,
    },
    /// Message moved by the review surface.
    Move {
        folder: String,
        destination_folder_id: String,
    },
    /// Categories applied by the review surface.
    Categorize { categories: Vec<String> },
}

/// An action audit row.
#[derive(Debug, Clone)]
pub struct ActionLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub email_id: Option<String>,
    pub triage_cycle_id: Option<String>,
    pub details: Option<ActionDetails>,
    pub triggered_by: String,
}

/// Serialized prompt stored with an LLM audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmPromptPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<LlmPromptMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmPromptMessage {
    pub role: String,
    pub content: String,
}

/// Serialized response stored with an LLM audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponsePayload {
    pub model: String,
    pub stop_reason: Option<String>,
    pub content: Vec<serde_json::Value>,
}

/// An LLM request audit row.
#[derive(Debug, Clone)]
pub struct LlmLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub task_type: String,
    pub model: String,
    pub email_id: Option<String>,
    pub triage_cycle_id: Option<String>,
    pub prompt: Option<LlmPromptPayload>,
    pub response: Option<LlmResponsePayload>,
    pub tool_call: Option<serde_json::Value>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub duration_ms: Option<u32>,
    pub error: Option<String>,
}

/// Dashboard counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub emails_by_status: HashMap<String, u32>,
    pub pending_suggestions: u32,
    pub active_waiting_for: u32,
    pub total_senders: u32,
    pub auto_rule_candidates: u32,
    pub actions_last_24h: u32,
}

/// Cycle summary derived from the reserved agent-state keys, exposed to
/// the review surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleInfo {
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_id: Option<String>,
    pub last_processed_timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trips_wire_strings() {
        for p in Priority::ALL {
            assert_eq!(Priority::parse_str(p.as_str()), Some(p));
        }
        assert_eq!(Priority::parse_str("P5 - Nope"), None);
    }

    #[test]
    fn action_type_round_trips_wire_strings() {
        for a in ActionType::ALL {
            assert_eq!(ActionType::parse_str(a.as_str()), Some(a));
        }
        assert_eq!(ActionType::parse_str("Snooze"), None);
    }

    #[test]
    fn priority_serde_uses_category_labels() {
        let json = serde_json::to_string(&Priority::P1UrgentImportant).unwrap();
        assert_eq!(json, "\"P1 - Urgent Important\"");
        let back: Priority = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Priority::P1UrgentImportant);
    }

    #[test]
    fn action_details_serialize_tagged() {
        let details = ActionDetails::Suggest {
            method: "claude_tool_use".into(),
            folder: "Projects/Alpha".into(),
            priority: Priority::P2Important,
            action_type: ActionType::Review,
            confidence: 0.88,
            inherited_folder: false,
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["kind"], "suggest");
        assert_eq!(value["priority"], "P2 - Important");
    }

    #[test]
    fn email_defaults_are_unclassified() {
        let email = Email::new("msg-1");
        assert_eq!(email.classification_status, ClassificationStatus::Pending);
        assert_eq!(email.classification_attempts, 0);
        assert_eq!(email.importance, "normal");
        assert!(!email.is_read);
    }
}
