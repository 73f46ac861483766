//! Preference learner — turns user corrections into prompt guidance.
//!
//! Runs opportunistically after a triage cycle. When enough corrections
//! have accumulated since the last update, it asks the LLM to rewrite
//! the natural-language preference blob embedded in the classifier's
//! system prompt. Any LLM failure leaves the existing blob untouched.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::classifier::prompts::build_preference_update_prompt;
use crate::config::AppConfig;
use crate::error::DatabaseError;
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};
use crate::store::{STATE_PREFERENCES, STATE_PREFERENCES_UPDATED, Store};

/// Outcome of one learner pass that actually ran an update.
#[derive(Debug, Clone)]
pub struct LearnOutcome {
    pub corrections_analyzed: usize,
    pub changed: bool,
    pub word_count: usize,
}

pub struct PreferenceLearner {
    store: Arc<Store>,
    provider: Arc<dyn LlmProvider>,
}

impl PreferenceLearner {
    pub fn new(store: Arc<Store>, provider: Arc<dyn LlmProvider>) -> Self {
        Self { store, provider }
    }

    /// Update the preference blob when the correction threshold is met.
    ///
    /// Returns `None` when learning is disabled, below threshold, or
    /// the LLM failed (the stored blob is preserved in every case).
    pub async fn check_and_update(
        &self,
        config: &AppConfig,
    ) -> Result<Option<LearnOutcome>, DatabaseError> {
        if !config.learning.enabled {
            return Ok(None);
        }

        let since = self.last_updated_at(config).await?;
        let count = self.store.get_correction_count_since(since).await?;
        if count < config.learning.min_corrections_to_update {
            return Ok(None);
        }

        let corrections = self
            .store
            .get_recent_corrections(config.learning.lookback_days)
            .await?;
        if corrections.is_empty() {
            return Ok(None);
        }

        let current = self.store.get_state(STATE_PREFERENCES).await?;
        let prompt = build_preference_update_prompt(&corrections, current.as_deref());

        let request = ChatRequest::new(
            config.models.chat.clone(),
            vec![ChatMessage::user(prompt)],
        )
        .with_max_tokens(1024);

        let response = match self.provider.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Preference update failed; keeping existing preferences");
                return Ok(None);
            }
        };

        let blob = truncate_words(
            response.text().trim(),
            config.learning.max_preferences_words,
        );
        if blob.is_empty() {
            warn!("Preference update produced an empty blob; keeping existing preferences");
            return Ok(None);
        }

        let changed = current.as_deref() != Some(blob.as_str());
        self.store.set_state(STATE_PREFERENCES, &blob).await?;
        self.store
            .set_state(STATE_PREFERENCES_UPDATED, &Utc::now().to_rfc3339())
            .await?;

        let word_count = blob.split_whitespace().count();
        info!(
            corrections = corrections.len(),
            words = word_count,
            changed,
            "Classification preferences updated"
        );

        Ok(Some(LearnOutcome {
            corrections_analyzed: corrections.len(),
            changed,
            word_count,
        }))
    }

    /// Timestamp of the last successful update, or the start of the
    /// lookback window when none is recorded.
    async fn last_updated_at(&self, config: &AppConfig) -> Result<DateTime<Utc>, DatabaseError> {
        let fallback = Utc::now() - Duration::days(config.learning.lookback_days as i64);
        Ok(self
            .store
            .get_state(STATE_PREFERENCES_UPDATED)
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(fallback))
    }
}

/// Cap a blob at `max_words` whitespace-separated words.
fn truncate_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return text.to_string();
    }
    words[..max_words].join(" ")
}
