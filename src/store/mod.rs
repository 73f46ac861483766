//! Durable state: emails, suggestions, waiting-for trackers, sender
//! profiles, agent state, and audit logs.

pub mod migrations;
pub mod models;
pub mod report;
pub mod sqlite;

pub use models::*;
pub use report::{ConfusionReport, MIN_RESOLVED_FOR_REPORT, confusion_report};
pub use sqlite::{
    DEFAULT_MAX_SNIPPET_LENGTH, LlmRequestRecord, STATE_LAST_CYCLE, STATE_LAST_CYCLE_ID,
    STATE_LAST_PROCESSED, STATE_PREFERENCES, STATE_PREFERENCES_UPDATED, Store, delta_token_key,
};
