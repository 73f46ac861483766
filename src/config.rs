//! Typed application configuration.
//!
//! Mirrors the structure of the user's config file. The loader itself is
//! external; this module owns the types, the serde defaults, and the
//! range validation applied on startup and on every hot reload. A reload
//! that fails validation keeps the previous config; the engine swaps the
//! config by value at cycle boundaries.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::models::{ActionType, Priority};

/// Triage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// How often to run a triage cycle (minutes).
    pub interval_minutes: u32,
    /// On restart, re-check emails from this window (hours).
    pub lookback_hours: u32,
    /// Max emails to process per cycle.
    pub batch_size: u32,
    /// Folders to monitor for new emails.
    pub watch_folders: Vec<String>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            lookback_hours: 2,
            batch_size: 20,
            watch_folders: vec!["Inbox".to_string()],
        }
    }
}

/// Model selection per task type. Opaque identifiers passed through to
/// the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub triage: String,
    pub dry_run: String,
    pub chat: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            triage: "claude-haiku-4-5-20251001".to_string(),
            dry_run: "claude-haiku-4-5-20251001".to_string(),
            chat: "claude-sonnet-4-5-20250929".to_string(),
        }
    }
}

/// Snippet storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnippetConfig {
    /// Hard upper bound on stored snippet characters.
    pub max_length: usize,
}

impl Default for SnippetConfig {
    fn default() -> Self {
        Self { max_length: 1000 }
    }
}

/// Pattern signals for project/area matching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Subject line patterns (case-insensitive).
    pub subjects: Vec<String>,
    /// Sender patterns (supports wildcards like *@domain.com).
    pub senders: Vec<String>,
    /// Body content keywords.
    pub body_keywords: Vec<String>,
}

/// Active project with defined outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// Mail folder path, e.g. "Projects/Alpha".
    pub folder: String,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default = "ProjectConfig::default_priority")]
    pub priority_default: Priority,
}

impl ProjectConfig {
    fn default_priority() -> Priority {
        Priority::P2Important
    }
}

/// Ongoing responsibility with no end date. Area names double as the
/// taxonomy categories applied when a message is moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    pub name: String,
    pub folder: String,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default = "AreaConfig::default_priority")]
    pub priority_default: Priority,
}

impl AreaConfig {
    fn default_priority() -> Priority {
        Priority::P3UrgentLow
    }
}

/// Matching criteria for an auto-routing rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRuleMatch {
    /// Sender patterns; exact addresses or `*@domain` wildcards.
    pub senders: Vec<String>,
    /// Subject substrings, matched case-insensitively.
    pub subjects: Vec<String>,
}

/// Action applied when an auto-rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRuleAction {
    pub folder: String,
    pub category: ActionType,
    pub priority: Priority,
}

/// High-confidence routing rule that bypasses the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRuleConfig {
    pub name: String,
    pub r#match: AutoRuleMatch,
    pub action: AutoRuleAction,
}

/// Key contact for priority boosting in the classifier prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyContactConfig {
    pub email: String,
    pub role: String,
    #[serde(default = "KeyContactConfig::default_boost")]
    pub priority_boost: u32,
}

impl KeyContactConfig {
    fn default_boost() -> u32 {
        1
    }
}

/// Aging thresholds for review-surface alerts and waiting-for nudges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingConfig {
    pub needs_reply_warning_hours: u32,
    pub needs_reply_critical_hours: u32,
    pub waiting_for_nudge_hours: u32,
    pub waiting_for_escalate_hours: u32,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            needs_reply_warning_hours: 24,
            needs_reply_critical_hours: 48,
            waiting_for_nudge_hours: 48,
            waiting_for_escalate_hours: 96,
        }
    }
}

/// Suggestion queue management.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionQueueConfig {
    /// Auto-expire pending suggestions older than N days.
    pub expire_after_days: u32,
}

impl Default for SuggestionQueueConfig {
    fn default() -> Self {
        Self {
            expire_after_days: 14,
        }
    }
}

/// LLM request audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmLoggingConfig {
    pub enabled: bool,
    pub retention_days: u32,
    /// Store full prompts (disable to save disk space).
    pub log_prompts: bool,
    pub log_responses: bool,
}

impl Default for LlmLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            log_prompts: true,
            log_responses: true,
        }
    }
}

/// Preference learning from user corrections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    /// Minimum corrections since the last update before re-learning.
    pub min_corrections_to_update: u32,
    /// Days of corrections fed into the update prompt.
    pub lookback_days: u32,
    /// Word cap applied to the learned preference blob.
    pub max_preferences_words: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_corrections_to_update: 3,
            lookback_days: 7,
            max_preferences_words: 500,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub triage: TriageConfig,
    pub models: ModelsConfig,
    pub snippet: SnippetConfig,
    pub projects: Vec<ProjectConfig>,
    pub areas: Vec<AreaConfig>,
    pub auto_rules: Vec<AutoRuleConfig>,
    pub key_contacts: Vec<KeyContactConfig>,
    pub aging: AgingConfig,
    pub suggestion_queue: SuggestionQueueConfig,
    pub llm_logging: LlmLoggingConfig,
    pub learning: LearningConfig,
}

impl AppConfig {
    /// Validate ranges. Called by the loader on startup and hot reload;
    /// a failing reload keeps the previous config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        range_check(
            "triage.interval_minutes",
            self.triage.interval_minutes,
            1,
            1440,
        )?;
        range_check("triage.lookback_hours", self.triage.lookback_hours, 1, 168)?;
        range_check("triage.batch_size", self.triage.batch_size, 1, 100)?;
        if self.triage.watch_folders.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "triage.watch_folders".into(),
                message: "at least one watched folder is required".into(),
            });
        }
        range_check(
            "snippet.max_length",
            self.snippet.max_length as u32,
            100,
            10_000,
        )?;
        range_check(
            "suggestion_queue.expire_after_days",
            self.suggestion_queue.expire_after_days,
            1,
            90,
        )?;
        range_check(
            "llm_logging.retention_days",
            self.llm_logging.retention_days,
            1,
            365,
        )?;
        if self.learning.enabled {
            range_check(
                "learning.min_corrections_to_update",
                self.learning.min_corrections_to_update,
                1,
                100,
            )?;
            range_check("learning.lookback_days", self.learning.lookback_days, 1, 90)?;
            range_check(
                "learning.max_preferences_words",
                self.learning.max_preferences_words as u32,
                50,
                5000,
            )?;
        }
        for folder in self
            .projects
            .iter()
            .map(|p| &p.folder)
            .chain(self.areas.iter().map(|a| &a.folder))
            .chain(self.auto_rules.iter().map(|r| &r.action.folder))
        {
            if folder.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "folder".into(),
                    message: "folder path cannot be empty".into(),
                });
            }
            if folder.contains("..") {
                return Err(ConfigError::InvalidValue {
                    key: "folder".into(),
                    message: format!("folder path '{folder}' cannot contain '..'"),
                });
            }
        }
        Ok(())
    }
}

fn range_check(key: &str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} is outside the allowed range {min}..={max}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_interval() {
        let mut config = AppConfig::default();
        config.triage.interval_minutes = 0;
        assert!(config.validate().is_err());

        config.triage.interval_minutes = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_watch_folders() {
        let mut config = AppConfig::default();
        config.triage.watch_folders.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("watch_folders"));
    }

    #[test]
    fn rejects_traversal_in_rule_folder() {
        let mut config = AppConfig::default();
        config.auto_rules.push(AutoRuleConfig {
            name: "bad".into(),
            r#match: AutoRuleMatch::default(),
            action: AutoRuleAction {
                folder: "../evil".into(),
                category: ActionType::FyiOnly,
                priority: Priority::P4Low,
            },
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.triage.interval_minutes, 15);
        assert_eq!(config.triage.watch_folders, vec!["Inbox"]);
        assert_eq!(config.snippet.max_length, 1000);
        assert!(config.learning.enabled);
    }

    #[test]
    fn deserializes_auto_rule_with_wire_enum_strings() {
        let json = r#"{
            "name": "newsletters",
            "match": {"senders": ["*@news.example.com"]},
            "action": {
                "folder": "Reference/Newsletters",
                "category": "FYI Only",
                "priority": "P4 - Low"
            }
        }"#;
        let rule: AutoRuleConfig = serde_json::from_str(json).unwrap();
        assert_eq!(rule.action.category, ActionType::FyiOnly);
        assert_eq!(rule.action.priority, Priority::P4Low);
    }

    #[test]
    fn learning_ranges_only_checked_when_enabled() {
        let mut config = AppConfig::default();
        config.learning.min_corrections_to_update = 0;
        assert!(config.validate().is_err());

        config.learning.enabled = false;
        config.validate().unwrap();
    }
}
