//! Email classifier — the decision ladder for one message.
//!
//! Order: auto-rules (deterministic, bypasses the LLM) → thread
//! inheritance (folder only) → LLM tool call with validated structured
//! output. Invalid output retries with an unchanged message list up to
//! three attempts; transport-level failures are not re-retried here.

pub mod auto_rules;
pub mod learner;
pub mod prompts;

pub use auto_rules::{AutoRuleMatch, match_rules};
pub use learner::{LearnOutcome, PreferenceLearner};

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::config::AppConfig;
use crate::error::{ClassificationError, LlmError};
use crate::llm::{ChatMessage, ChatRequest, ChatResponse, ContentBlock, LlmProvider};
use crate::store::models::{ActionType, Email, LlmPromptMessage, LlmPromptPayload, LlmResponsePayload, Priority};
use crate::store::{LlmRequestRecord, STATE_PREFERENCES, Store};
use crate::triage::context::{ClassificationContext, INHERITANCE_CONFIDENCE};

/// Max classification attempts before marking as failed.
pub const MAX_CLASSIFICATION_ATTEMPTS: u32 = 3;

/// Ladder outcome methods.
pub const METHOD_AUTO_RULE: &str = "auto_rule";
pub const METHOD_TOOL_USE: &str = "claude_tool_use";
pub const METHOD_INHERITED: &str = "claude_inherited";

/// Who/what an awaited reply is expected from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WaitingForDetail {
    #[serde(default)]
    pub expected_from: String,
    #[serde(default)]
    pub description: String,
}

/// Result of classifying one email. Serialized into the email's
/// `classification_json` blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub folder: String,
    pub priority: Priority,
    pub action_type: ActionType,
    pub confidence: f64,
    pub reasoning: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for_detail: Option<WaitingForDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_new_project: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inherited_folder: bool,
}

impl ClassificationResult {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Classifies emails via auto-rules and the LLM capability.
pub struct EmailClassifier {
    provider: Arc<dyn LlmProvider>,
    store: Arc<Store>,
    config: AppConfig,
    system_prompt: Option<String>,
}

impl EmailClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>, store: Arc<Store>, config: AppConfig) -> Self {
        Self {
            provider,
            store,
            config,
            system_prompt: None,
        }
    }

    /// Swap in a new config; the system prompt is rebuilt on the next
    /// refresh.
    pub fn update_config(&mut self, config: AppConfig) {
        self.config = config;
        self.system_prompt = None;
    }

    /// Rebuild the system prompt from current config and the learned
    /// preference blob. Called at the start of each triage cycle.
    pub async fn refresh_system_prompt(&mut self) -> Result<(), crate::error::DatabaseError> {
        let preferences = self.store.get_state(STATE_PREFERENCES).await?;
        self.system_prompt = Some(prompts::build_system_prompt(
            &self.config,
            preferences.as_deref(),
        ));
        Ok(())
    }

    /// Fast deterministic check against the configured auto-rules.
    pub fn classify_with_auto_rules(
        &self,
        sender_email: &str,
        subject: &str,
    ) -> Option<ClassificationResult> {
        let hit = match_rules(&self.config.auto_rules, sender_email, subject)?;
        Some(ClassificationResult {
            folder: hit.rule.action.folder.clone(),
            priority: hit.rule.action.priority,
            action_type: hit.rule.action.category,
            confidence: 1.0,
            reasoning: hit.match_reason,
            method: METHOD_AUTO_RULE.to_string(),
            waiting_for_detail: None,
            suggested_new_project: None,
            inherited_folder: false,
        })
    }

    /// Classify via the LLM with a forced `classify_email` tool call.
    ///
    /// When the context carries an inherited folder, the model's folder
    /// answer is discarded: the inherited folder wins, confidence is
    /// pinned, and only priority and action type come from the model.
    pub async fn classify_with_llm(
        &self,
        email: &Email,
        context: &ClassificationContext,
        triage_cycle_id: &str,
    ) -> Result<ClassificationResult, ClassificationError> {
        let system = self.system_prompt.clone().unwrap_or_else(|| {
            prompts::build_system_prompt(&self.config, None)
        });
        let user_message = prompts::build_user_message(email, context);
        let messages = vec![ChatMessage::user(user_message)];
        let model = self.config.models.triage.clone();

        let mut last_error = String::from("no attempts made");

        for attempt in 1..=MAX_CLASSIFICATION_ATTEMPTS {
            let request = ChatRequest::new(model.clone(), messages.clone())
                .with_system(system.clone())
                .with_max_tokens(1024)
                .with_forced_tool(prompts::classify_email_tool());
            let started = Instant::now();

            match self.provider.complete(request).await {
                Ok(response) => {
                    let duration_ms = started.elapsed().as_millis() as u32;
                    let tool_call = response.tool_call(prompts::CLASSIFY_TOOL_NAME).cloned();

                    let Some(input) = tool_call else {
                        last_error =
                            "No tool call in response (unexpected with forced tool_choice)"
                                .to_string();
                        warn!(
                            email_id = %email.id,
                            attempt,
                            "Classification response missing tool call"
                        );
                        self.log_request(
                            &model,
                            &messages,
                            Some(&response),
                            None,
                            duration_ms,
                            Some(&email.id),
                            triage_cycle_id,
                            Some(&last_error),
                        )
                        .await;
                        continue;
                    };

                    match validate_tool_call(&input) {
                        Err(validation_error) => {
                            last_error = validation_error;
                            warn!(
                                email_id = %email.id,
                                attempt,
                                error = %last_error,
                                "Classification response invalid"
                            );
                            self.log_request(
                                &model,
                                &messages,
                                Some(&response),
                                Some(&input),
                                duration_ms,
                                Some(&email.id),
                                triage_cycle_id,
                                Some(&last_error),
                            )
                            .await;
                            continue;
                        }
                        Ok(output) => {
                            self.log_request(
                                &model,
                                &messages,
                                Some(&response),
                                Some(&input),
                                duration_ms,
                                Some(&email.id),
                                triage_cycle_id,
                                None,
                            )
                            .await;
                            return Ok(build_result(output, context));
                        }
                    }
                }
                Err(e) => {
                    let duration_ms = started.elapsed().as_millis() as u32;
                    last_error = e.to_string();
                    error!(
                        email_id = %email.id,
                        attempt,
                        error = %last_error,
                        "Classification call failed"
                    );
                    self.log_request(
                        &model,
                        &messages,
                        None,
                        None,
                        duration_ms,
                        Some(&email.id),
                        triage_cycle_id,
                        Some(&last_error),
                    )
                    .await;
                    // The transport already retried transient failures;
                    // nothing to gain from another app-level pass.
                    match e {
                        LlmError::RateLimited { .. }
                        | LlmError::Connection(_)
                        | LlmError::Status { .. } => break,
                        LlmError::InvalidResponse(_) => continue,
                    }
                }
            }
        }

        Err(ClassificationError {
            email_id: email.id.clone(),
            attempts: MAX_CLASSIFICATION_ATTEMPTS,
            last_error,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        response: Option<&ChatResponse>,
        tool_call: Option<&Value>,
        duration_ms: u32,
        email_id: Option<&str>,
        triage_cycle_id: &str,
        error: Option<&str>,
    ) {
        if !self.config.llm_logging.enabled {
            return;
        }

        let prompt = LlmPromptPayload {
            system: if self.config.llm_logging.log_prompts {
                self.system_prompt.clone()
            } else {
                None
            },
            messages: messages
                .iter()
                .map(|m| LlmPromptMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
        };

        let mut input_tokens = None;
        let mut output_tokens = None;
        let response_payload = match response {
            Some(r) if self.config.llm_logging.log_responses => {
                input_tokens = Some(r.usage.input_tokens);
                output_tokens = Some(r.usage.output_tokens);
                Some(LlmResponsePayload {
                    model: r.model.clone(),
                    stop_reason: r.stop_reason.clone(),
                    content: r
                        .content
                        .iter()
                        .map(content_block_to_value)
                        .collect(),
                })
            }
            _ => None,
        };

        let record = LlmRequestRecord {
            task_type: "triage",
            model,
            email_id,
            triage_cycle_id: Some(triage_cycle_id),
            prompt: Some(&prompt),
            response: response_payload.as_ref(),
            tool_call,
            input_tokens,
            output_tokens,
            duration_ms: Some(duration_ms),
            error,
        };

        // Audit failures never block classification
        if let Err(e) = self.store.log_llm_request(&record).await {
            warn!(error = %e, email_id = ?email_id, "Failed to write LLM audit row");
        }
    }
}

/// Validated tool output before inheritance is applied.
#[derive(Debug)]
struct ClassifyOutput {
    folder: String,
    priority: Priority,
    action_type: ActionType,
    confidence: f64,
    reasoning: String,
    waiting_for_detail: Option<WaitingForDetail>,
    suggested_new_project: Option<String>,
}

/// Validate the tool call fields; an error message describes the first
/// violation found.
fn validate_tool_call(input: &Value) -> Result<ClassifyOutput, String> {
    let missing: Vec<&str> = ["folder", "priority", "action_type", "confidence", "reasoning"]
        .into_iter()
        .filter(|field| input.get(field).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(format!("Missing required fields: {}", missing.join(", ")));
    }

    let priority_str = input["priority"].as_str().unwrap_or_default();
    let Some(priority) = Priority::parse_str(priority_str) else {
        return Err(format!("Invalid priority: '{priority_str}'"));
    };

    let action_str = input["action_type"].as_str().unwrap_or_default();
    let Some(action_type) = ActionType::parse_str(action_str) else {
        return Err(format!("Invalid action_type: '{action_str}'"));
    };

    let Some(confidence) = input["confidence"].as_f64() else {
        return Err(format!("Invalid confidence: {}", input["confidence"]));
    };
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!(
            "Invalid confidence: {confidence}. Must be between 0.0 and 1.0"
        ));
    }

    let folder = input["folder"].as_str().unwrap_or_default().trim().to_string();
    if folder.is_empty() {
        return Err("Empty folder path".to_string());
    }

    let reasoning = input["reasoning"].as_str().unwrap_or_default().to_string();

    let waiting_for_detail = input
        .get("waiting_for_detail")
        .and_then(|v| v.as_object())
        .map(|obj| WaitingForDetail {
            expected_from: obj
                .get("expected_from")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            description: obj
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
        .filter(|d| !d.expected_from.is_empty() || !d.description.is_empty());

    let suggested_new_project = input
        .get("suggested_new_project")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(ClassifyOutput {
        folder,
        priority,
        action_type,
        confidence,
        reasoning,
        waiting_for_detail,
        suggested_new_project,
    })
}

/// Merge the validated output with the context. An inherited folder
/// overrides the model's folder and pins the confidence.
fn build_result(output: ClassifyOutput, context: &ClassificationContext) -> ClassificationResult {
    let (folder, method, confidence, inherited) = match &context.inherited_folder {
        Some(inherited) => (
            inherited.clone(),
            METHOD_INHERITED.to_string(),
            INHERITANCE_CONFIDENCE,
            true,
        ),
        None => (
            output.folder,
            METHOD_TOOL_USE.to_string(),
            output.confidence,
            false,
        ),
    };

    ClassificationResult {
        folder,
        priority: output.priority,
        action_type: output.action_type,
        confidence,
        reasoning: output.reasoning,
        method,
        waiting_for_detail: output.waiting_for_detail,
        suggested_new_project: output.suggested_new_project,
        inherited_folder: inherited,
    }
}

fn content_block_to_value(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted LLM provider shared by classifier and engine tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::Usage;

    pub struct FakeProvider {
        pub responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
        pub calls: Mutex<u32>,
        /// When the queue runs dry, fall back to this behavior.
        pub default_response: Mutex<Option<Result<ChatResponse, LlmError>>>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                calls: Mutex::new(0),
                default_response: Mutex::new(None),
            }
        }

        pub fn push(&self, response: Result<ChatResponse, LlmError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub fn set_default(&self, response: Result<ChatResponse, LlmError>) {
            *self.default_response.lock().unwrap() = Some(response);
        }

        pub fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }

        pub fn tool_response(input: serde_json::Value) -> ChatResponse {
            ChatResponse {
                model: "fake-model".to_string(),
                stop_reason: Some("tool_use".to_string()),
                content: vec![ContentBlock::ToolUse {
                    id: "tool-1".to_string(),
                    name: prompts::CLASSIFY_TOOL_NAME.to_string(),
                    input,
                }],
                usage: Usage {
                    input_tokens: 500,
                    output_tokens: 80,
                },
            }
        }

        pub fn text_response(text: &str) -> ChatResponse {
            ChatResponse {
                model: "fake-model".to_string(),
                stop_reason: Some("end_turn".to_string()),
                content: vec![ContentBlock::Text {
                    text: text.to_string(),
                }],
                usage: Usage::default(),
            }
        }

        pub fn valid_classification(folder: &str, priority: &str, action: &str) -> ChatResponse {
            Self::tool_response(serde_json::json!({
                "folder": folder,
                "priority": priority,
                "action_type": action,
                "confidence": 0.88,
                "reasoning": "Active project correspondence",
            }))
        }
    }

    fn clone_result(
        r: &Result<ChatResponse, LlmError>,
    ) -> Result<ChatResponse, LlmError> {
        match r {
            Ok(resp) => Ok(ChatResponse {
                model: resp.model.clone(),
                stop_reason: resp.stop_reason.clone(),
                content: resp.content.clone(),
                usage: resp.usage,
            }),
            Err(LlmError::RateLimited { retry_after }) => Err(LlmError::RateLimited {
                retry_after: *retry_after,
            }),
            Err(LlmError::Connection(m)) => Err(LlmError::Connection(m.clone())),
            Err(LlmError::Status {
                status_code,
                message,
            }) => Err(LlmError::Status {
                status_code: *status_code,
                message: message.clone(),
            }),
            Err(LlmError::InvalidResponse(m)) => Err(LlmError::InvalidResponse(m.clone())),
        }
    }

    #[async_trait]
    impl LlmProvider for FakeProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(next) = self.responses.lock().unwrap().pop_front() {
                return next;
            }
            match &*self.default_response.lock().unwrap() {
                Some(default) => clone_result(default),
                None => Err(LlmError::Connection("no scripted response".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeProvider;
    use super::*;
    use crate::config::{AutoRuleAction, AutoRuleConfig, AutoRuleMatch as MatchConfig};

    fn sample_email() -> Email {
        let mut email = Email::new("msg-1");
        email.sender_email = Some("alice@example.com".to_string());
        email.sender_name = Some("Alice".to_string());
        email.subject = Some("Project kickoff".to_string());
        email.snippet = Some("Short preview".to_string());
        email
    }

    async fn classifier_with(provider: Arc<FakeProvider>, config: AppConfig) -> EmailClassifier {
        let store = Arc::new(Store::in_memory().await.unwrap());
        store.save_email(&sample_email()).await.unwrap();
        EmailClassifier::new(provider, store, config)
    }

    fn newsletter_rule_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.auto_rules.push(AutoRuleConfig {
            name: "newsletters".to_string(),
            r#match: MatchConfig {
                senders: vec!["*@news.example.com".to_string()],
                subjects: vec![],
            },
            action: AutoRuleAction {
                folder: "Reference/Newsletters".to_string(),
                category: ActionType::FyiOnly,
                priority: Priority::P4Low,
            },
        });
        config
    }

    // ── Auto rules through the classifier ───────────────────────────

    #[tokio::test]
    async fn auto_rule_match_yields_full_confidence_result() {
        let provider = Arc::new(FakeProvider::new());
        let classifier = classifier_with(Arc::clone(&provider), newsletter_rule_config()).await;

        let result = classifier
            .classify_with_auto_rules("a@news.example.com", "Weekly digest")
            .unwrap();
        assert_eq!(result.method, METHOD_AUTO_RULE);
        assert_eq!(result.folder, "Reference/Newsletters");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.priority, Priority::P4Low);
        // The LLM was never touched
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn auto_rule_no_match_returns_none() {
        let provider = Arc::new(FakeProvider::new());
        let classifier = classifier_with(provider, newsletter_rule_config()).await;
        assert!(
            classifier
                .classify_with_auto_rules("human@corp.com", "Question")
                .is_none()
        );
    }

    // ── LLM ladder ──────────────────────────────────────────────────

    #[tokio::test]
    async fn valid_tool_call_classifies_first_try() {
        let provider = Arc::new(FakeProvider::new());
        provider.push(Ok(FakeProvider::valid_classification(
            "Projects/Alpha",
            "P2 - Important",
            "Review",
        )));
        let mut classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;
        classifier.refresh_system_prompt().await.unwrap();

        let result = classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-1")
            .await
            .unwrap();

        assert_eq!(result.method, METHOD_TOOL_USE);
        assert_eq!(result.folder, "Projects/Alpha");
        assert_eq!(result.priority, Priority::P2Important);
        assert_eq!(result.action_type, ActionType::Review);
        assert!(!result.inherited_folder);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn inherited_folder_overrides_model_folder() {
        let provider = Arc::new(FakeProvider::new());
        provider.push(Ok(FakeProvider::valid_classification(
            "Projects/Beta",
            "P2 - Important",
            "Review",
        )));
        let classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;

        let context = ClassificationContext {
            inherited_folder: Some("Projects/Alpha".to_string()),
            ..ClassificationContext::default()
        };
        let result = classifier
            .classify_with_llm(&sample_email(), &context, "cycle-1")
            .await
            .unwrap();

        assert_eq!(result.folder, "Projects/Alpha");
        assert_eq!(result.method, METHOD_INHERITED);
        assert_eq!(result.confidence, INHERITANCE_CONFIDENCE);
        assert!(result.inherited_folder);
        // Priority and action still came from the model
        assert_eq!(result.priority, Priority::P2Important);
        assert_eq!(result.action_type, ActionType::Review);
    }

    #[tokio::test]
    async fn invalid_output_retries_up_to_three_attempts() {
        let provider = Arc::new(FakeProvider::new());
        // Two invalid responses, then a valid one
        provider.push(Ok(FakeProvider::tool_response(serde_json::json!({
            "folder": "Projects/Alpha",
            "priority": "P9 - Wrong",
            "action_type": "Review",
            "confidence": 0.8,
            "reasoning": "r",
        }))));
        provider.push(Ok(FakeProvider::text_response("no tool call here")));
        provider.push(Ok(FakeProvider::valid_classification(
            "Projects/Alpha",
            "P2 - Important",
            "Review",
        )));
        let classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;

        let result = classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-1")
            .await
            .unwrap();
        assert_eq!(result.folder, "Projects/Alpha");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_raise_classification_error() {
        let provider = Arc::new(FakeProvider::new());
        for _ in 0..3 {
            provider.push(Ok(FakeProvider::text_response("still no tool call")));
        }
        let classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;

        let error = classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-1")
            .await
            .unwrap_err();
        assert_eq!(error.email_id, "msg-1");
        assert_eq!(error.attempts, MAX_CLASSIFICATION_ATTEMPTS);
        assert!(error.last_error.contains("No tool call"));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn rate_limit_does_not_retry_at_app_level() {
        let provider = Arc::new(FakeProvider::new());
        provider.push(Err(LlmError::RateLimited { retry_after: None }));
        let classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;

        let error = classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-1")
            .await
            .unwrap_err();
        assert!(error.last_error.contains("rate limited"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn connection_error_does_not_retry_at_app_level() {
        let provider = Arc::new(FakeProvider::new());
        provider.push(Err(LlmError::Connection("reset by peer".to_string())));
        let classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;

        let error = classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-1")
            .await
            .unwrap_err();
        assert_eq!(provider.calls(), 1);
        assert!(error.last_error.contains("reset by peer"));
    }

    #[tokio::test]
    async fn waiting_for_detail_is_extracted() {
        let provider = Arc::new(FakeProvider::new());
        provider.push(Ok(FakeProvider::tool_response(serde_json::json!({
            "folder": "Projects/Alpha",
            "priority": "P2 - Important",
            "action_type": "Waiting For",
            "confidence": 0.9,
            "reasoning": "Awaiting contract",
            "waiting_for_detail": {
                "expected_from": "legal@corp.com",
                "description": "signed contract",
                "extraneous": "ignored"
            },
            "suggested_new_project": "  ",
        }))));
        let classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;

        let result = classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-1")
            .await
            .unwrap();
        let detail = result.waiting_for_detail.unwrap();
        assert_eq!(detail.expected_from, "legal@corp.com");
        assert_eq!(detail.description, "signed contract");
        // Blank suggested project is dropped
        assert!(result.suggested_new_project.is_none());
    }

    #[tokio::test]
    async fn audit_rows_written_for_success_and_failure() {
        let provider = Arc::new(FakeProvider::new());
        provider.push(Ok(FakeProvider::text_response("bad")));
        provider.push(Ok(FakeProvider::valid_classification(
            "Projects/Alpha",
            "P2 - Important",
            "Review",
        )));
        let mut classifier = classifier_with(Arc::clone(&provider), AppConfig::default()).await;
        classifier.refresh_system_prompt().await.unwrap();

        classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-7")
            .await
            .unwrap();

        let logs = classifier
            .store
            .get_llm_logs(10, Some("msg-1"), Some("cycle-7"))
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        // One failed attempt, one success
        assert_eq!(logs.iter().filter(|l| l.error.is_some()).count(), 1);
        assert!(logs.iter().all(|l| l.task_type == "triage"));
        assert!(logs.iter().any(|l| l.input_tokens == Some(500)));
    }

    #[tokio::test]
    async fn audit_disabled_writes_nothing() {
        let provider = Arc::new(FakeProvider::new());
        provider.push(Ok(FakeProvider::valid_classification(
            "Projects/Alpha",
            "P2 - Important",
            "Review",
        )));
        let mut config = AppConfig::default();
        config.llm_logging.enabled = false;
        let classifier = classifier_with(Arc::clone(&provider), config).await;

        classifier
            .classify_with_llm(&sample_email(), &ClassificationContext::default(), "cycle-1")
            .await
            .unwrap();

        assert!(
            classifier
                .store
                .get_llm_logs(10, None, None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    // ── Validation unit tests ───────────────────────────────────────

    #[test]
    fn validate_rejects_missing_fields() {
        let error = validate_tool_call(&serde_json::json!({"folder": "X"})).unwrap_err();
        assert!(error.contains("Missing required fields"));
        assert!(error.contains("priority"));
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        let error = validate_tool_call(&serde_json::json!({
            "folder": "X",
            "priority": "P4 - Low",
            "action_type": "Review",
            "confidence": 1.5,
            "reasoning": "r",
        }))
        .unwrap_err();
        assert!(error.contains("confidence"));
    }

    #[test]
    fn validate_rejects_empty_folder() {
        let error = validate_tool_call(&serde_json::json!({
            "folder": "   ",
            "priority": "P4 - Low",
            "action_type": "Review",
            "confidence": 0.5,
            "reasoning": "r",
        }))
        .unwrap_err();
        assert_eq!(error, "Empty folder path");
    }

    #[test]
    fn classification_result_json_omits_empty_optionals() {
        let result = ClassificationResult {
            folder: "Archive".to_string(),
            priority: Priority::P4Low,
            action_type: ActionType::FyiOnly,
            confidence: 0.7,
            reasoning: "r".to_string(),
            method: METHOD_TOOL_USE.to_string(),
            waiting_for_detail: None,
            suggested_new_project: None,
            inherited_folder: false,
        };
        let json = result.to_json();
        assert!(json.get("waiting_for_detail").is_none());
        assert!(json.get("suggested_new_project").is_none());
        assert!(json.get("inherited_folder").is_none());
        assert_eq!(json["priority"], "P4 - Low");
    }
}
