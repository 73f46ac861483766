//! Triage engine — the periodic driver.
//!
//! Each cycle: rebuild the classifier system prompt, refresh the
//! sent-items cache, fetch new messages (delta-first), route each one
//! through the classification ladder, persist suggestions, run
//! maintenance, and sweep the backlog after an outage. A fresh cycle id
//! correlates every audit row written along the way.
//!
//! Degradation: three consecutive failures on either external API flip
//! the engine into degraded mode. Degraded on the LLM side, new
//! messages are left pending (auto-rules still apply) and one recovery
//! probe per cycle is attempted against the oldest backlog email;
//! success clears degradation and triggers the backlog sweep.

pub mod context;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::{ClassificationResult, EmailClassifier, METHOD_INHERITED, PreferenceLearner};
use crate::config::AppConfig;
use crate::error::DatabaseError;
use crate::llm::LlmProvider;
use crate::mail::{MailFetcher, MailTransport, MessageOps, RawMessage, SentItemsCache};
use crate::store::models::{ActionDetails, ActionType, ClassificationStatus, Email, WaitingStatus};
use crate::store::{
    STATE_LAST_CYCLE, STATE_LAST_CYCLE_ID, STATE_LAST_PROCESSED, Store,
};
use crate::triage::context::ContextAssembler;

/// Consecutive failures on one API before entering degraded mode.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Which external API tripped degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedApi {
    Claude,
    Mail,
}

/// Two independent failure counters plus the degraded summary.
/// Mutated only by the engine (single writer).
#[derive(Debug, Clone, Default)]
pub struct DegradationState {
    pub claude_consecutive_failures: u32,
    pub graph_consecutive_failures: u32,
    degraded_api: Option<DegradedApi>,
    pub degraded_since: Option<DateTime<Utc>>,
}

impl DegradationState {
    pub fn is_degraded(&self) -> bool {
        self.degraded_api.is_some()
    }

    pub fn degraded_api(&self) -> Option<DegradedApi> {
        self.degraded_api
    }

    /// Human-readable reason naming the failing API.
    pub fn degraded_reason(&self) -> Option<String> {
        self.degraded_api.map(|api| match api {
            DegradedApi::Claude => format!(
                "Claude API unavailable: {} consecutive classification failures",
                self.claude_consecutive_failures
            ),
            DegradedApi::Mail => format!(
                "Mail API unavailable: {} consecutive fetch failures",
                self.graph_consecutive_failures
            ),
        })
    }

    pub fn record_claude_failure(&mut self) {
        self.claude_consecutive_failures += 1;
        if self.claude_consecutive_failures >= MAX_CONSECUTIVE_FAILURES
            && self.degraded_api.is_none()
        {
            self.degraded_api = Some(DegradedApi::Claude);
            self.degraded_since = Some(Utc::now());
            warn!(
                consecutive_failures = self.claude_consecutive_failures,
                "Entering degraded mode: Claude API failing; switching to auto-rules only"
            );
        }
    }

    /// Returns true when this success recovered from degraded mode.
    pub fn record_claude_success(&mut self) -> bool {
        self.claude_consecutive_failures = 0;
        if self.degraded_api == Some(DegradedApi::Claude) {
            self.degraded_api = None;
            self.degraded_since = None;
            info!("Exiting degraded mode: Claude API recovered");
            return true;
        }
        false
    }

    pub fn record_graph_failure(&mut self) {
        self.graph_consecutive_failures += 1;
        if self.graph_consecutive_failures >= MAX_CONSECUTIVE_FAILURES
            && self.degraded_api.is_none()
        {
            self.degraded_api = Some(DegradedApi::Mail);
            self.degraded_since = Some(Utc::now());
            warn!(
                consecutive_failures = self.graph_consecutive_failures,
                "Entering degraded mode: mail API failing"
            );
        }
    }

    /// Returns true when this success recovered from degraded mode.
    pub fn record_graph_success(&mut self) -> bool {
        self.graph_consecutive_failures = 0;
        if self.degraded_api == Some(DegradedApi::Mail) {
            self.degraded_api = None;
            self.degraded_since = None;
            info!("Exiting degraded mode: mail API recovered");
            return true;
        }
        false
    }
}

/// Counters for one triage cycle, emitted as the summary log entry.
#[derive(Debug, Clone, Default)]
pub struct TriageCycleResult {
    pub cycle_id: String,
    pub duration_ms: u64,
    pub emails_fetched: usize,
    pub emails_processed: usize,
    pub auto_ruled: usize,
    pub classified: usize,
    pub inherited: usize,
    pub skipped: usize,
    pub failed: usize,
    pub degraded_mode: bool,
    pub suggestions_expired: usize,
    pub logs_pruned: usize,
    pub backlog_processed: usize,
}

/// Outcome of one message through the per-message pipeline.
enum ProcessOutcome {
    Skipped,
    AutoRuled,
    Classified,
    Inherited,
    Failed,
}

/// The periodic triage driver. One instance, one cycle at a time.
pub struct TriageEngine {
    store: Arc<Store>,
    ops: Arc<MessageOps>,
    fetcher: MailFetcher,
    assembler: ContextAssembler,
    classifier: EmailClassifier,
    learner: PreferenceLearner,
    sent_cache: SentItemsCache,
    config: AppConfig,
    degradation: DegradationState,
    cancel: Arc<AtomicBool>,
}

impl TriageEngine {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn MailTransport>,
        provider: Arc<dyn LlmProvider>,
        config: AppConfig,
    ) -> Self {
        let ops = Arc::new(MessageOps::new(transport));
        let fetcher = MailFetcher::new(Arc::clone(&ops));
        let assembler = ContextAssembler::new(Arc::clone(&store), Arc::clone(&ops));
        let classifier =
            EmailClassifier::new(Arc::clone(&provider), Arc::clone(&store), config.clone());
        let learner = PreferenceLearner::new(Arc::clone(&store), provider);

        Self {
            store,
            ops,
            fetcher,
            assembler,
            classifier,
            learner,
            sent_cache: SentItemsCache::new(),
            config,
            degradation: DegradationState::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the config by value. Takes effect from the next cycle.
    pub fn update_config(&mut self, config: AppConfig) {
        self.classifier.update_config(config.clone());
        self.config = config;
    }

    pub fn degradation_state(&self) -> &DegradationState {
        &self.degradation
    }

    pub fn degraded_mode(&self) -> bool {
        self.degradation.is_degraded()
    }

    /// Cooperative cancellation flag, checked between messages.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Execute a single triage cycle.
    pub async fn run_cycle(&mut self) -> TriageCycleResult {
        let cycle_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut result = TriageCycleResult {
            cycle_id: cycle_id.clone(),
            degraded_mode: self.degradation.is_degraded(),
            ..TriageCycleResult::default()
        };

        info!(
            cycle_id = %cycle_id,
            degraded_mode = result.degraded_mode,
            interval_minutes = self.config.triage.interval_minutes,
            "Triage cycle start"
        );

        // 1. Rebuild the system prompt (picks up config + preferences)
        if let Err(e) = self.classifier.refresh_system_prompt().await {
            warn!(cycle_id = %cycle_id, error = %e, "System prompt refresh failed");
        }

        // 2. Refresh the sent-items cache for reply-state detection
        let cache_window = self.config.triage.lookback_hours * 2;
        if let Err(e) = self.sent_cache.refresh(&self.ops, cache_window).await {
            warn!(cycle_id = %cycle_id, error = %e, "Sent cache refresh failed");
        }

        let mut claude_successes = 0usize;

        // 3. Fetch new messages
        match self.fetcher.fetch_new(&self.store, &self.config.triage).await {
            Ok(fetch) => {
                for _ in 0..fetch.graph_failures {
                    self.degradation.record_graph_failure();
                }
                for _ in 0..fetch.graph_successes {
                    self.degradation.record_graph_success();
                }
                result.emails_fetched = fetch.messages.len();

                if fetch.messages.is_empty() {
                    info!(cycle_id = %cycle_id, "No new emails this cycle");
                }

                // 4. Process serially up to batch_size
                let batch: Vec<RawMessage> = fetch
                    .messages
                    .into_iter()
                    .take(self.config.triage.batch_size as usize)
                    .collect();
                for raw in batch {
                    if self.cancel.load(Ordering::Relaxed) {
                        info!(cycle_id = %cycle_id, "Cycle cancelled between messages");
                        break;
                    }
                    match self.process_message(raw, &cycle_id).await {
                        ProcessOutcome::Skipped => result.skipped += 1,
                        ProcessOutcome::AutoRuled => {
                            result.auto_ruled += 1;
                            result.emails_processed += 1;
                        }
                        ProcessOutcome::Classified => {
                            result.classified += 1;
                            result.emails_processed += 1;
                            claude_successes += 1;
                        }
                        ProcessOutcome::Inherited => {
                            result.inherited += 1;
                            result.emails_processed += 1;
                            claude_successes += 1;
                        }
                        ProcessOutcome::Failed => {
                            result.failed += 1;
                            result.emails_processed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!(cycle_id = %cycle_id, error = %e, "Cycle fetch failed");
            }
        }

        // 5. Advance the processed-watermark and cycle-info keys
        let now = Utc::now().to_rfc3339();
        for (key, value) in [
            (STATE_LAST_PROCESSED, now.as_str()),
            (STATE_LAST_CYCLE, now.as_str()),
            (STATE_LAST_CYCLE_ID, cycle_id.as_str()),
        ] {
            if let Err(e) = self.store.set_state(key, value).await {
                warn!(cycle_id = %cycle_id, key = %key, error = %e, "State update failed");
            }
        }

        // 6. Maintenance — failures never abort the cycle
        match self
            .store
            .expire_old_suggestions(self.config.suggestion_queue.expire_after_days)
            .await
        {
            Ok(count) => result.suggestions_expired = count,
            Err(e) => warn!(cycle_id = %cycle_id, error = %e, "Suggestion expiry failed"),
        }
        match self
            .store
            .prune_llm_logs(self.config.llm_logging.retention_days)
            .await
        {
            Ok(count) => result.logs_pruned = count,
            Err(e) => warn!(cycle_id = %cycle_id, error = %e, "Log pruning failed"),
        }

        // 7. Recovery probe while Claude-degraded; backlog sweep once
        // healthy with at least one successful call this cycle
        if self.degradation.degraded_api() == Some(DegradedApi::Claude) {
            if self.probe_recovery(&cycle_id).await {
                claude_successes += 1;
                result.backlog_processed += 1;
            }
        }
        if !self.degradation.is_degraded() && claude_successes > 0 {
            result.backlog_processed += self.process_backlog(&cycle_id).await;
        }

        // 8. Preference learner, opportunistically at cycle end
        match self.learner.check_and_update(&self.config).await {
            Ok(Some(outcome)) => {
                debug!(
                    cycle_id = %cycle_id,
                    corrections = outcome.corrections_analyzed,
                    changed = outcome.changed,
                    "Preference learner ran"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(cycle_id = %cycle_id, error = %e, "Preference learner failed"),
        }

        result.degraded_mode = self.degradation.is_degraded();
        result.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            cycle_id = %cycle_id,
            duration_ms = result.duration_ms,
            emails_fetched = result.emails_fetched,
            emails_processed = result.emails_processed,
            auto_ruled = result.auto_ruled,
            classified = result.classified,
            inherited = result.inherited,
            skipped = result.skipped,
            failed = result.failed,
            degraded_mode = result.degraded_mode,
            suggestions_expired = result.suggestions_expired,
            logs_pruned = result.logs_pruned,
            backlog_processed = result.backlog_processed,
            "Triage cycle complete"
        );

        result
    }

    /// Per-message pipeline: dedup → save → waiting-for resolution →
    /// auto-rules → (degraded short-circuit) → context → LLM → persist.
    async fn process_message(&mut self, raw: RawMessage, cycle_id: &str) -> ProcessOutcome {
        if raw.id.is_empty() {
            return ProcessOutcome::Skipped;
        }

        // 1. Already seen?
        match self.store.email_exists(&raw.id).await {
            Ok(true) => return ProcessOutcome::Skipped,
            Ok(false) => {}
            Err(e) => {
                warn!(email_id = %short(&raw.id), error = %e, "Existence check failed");
                return ProcessOutcome::Skipped;
            }
        }

        // 2. Save
        let email = transform_message(&raw);
        if let Err(e) = self.store.save_email(&email).await {
            error!(email_id = %short(&email.id), error = %e, "Email save failed");
            return ProcessOutcome::Failed;
        }

        // An incoming message from the awaited sender closes any open
        // waiting-for tracker on its conversation.
        self.resolve_waiting_for_if_answered(&email).await;

        // 3. Auto-rules
        if let Some(auto_result) = self.classifier.classify_with_auto_rules(
            email.sender_email.as_deref().unwrap_or(""),
            email.subject.as_deref().unwrap_or(""),
        ) {
            return self.handle_auto_rule(&email, auto_result, cycle_id).await;
        }

        // 4. Claude-degraded: leave pending for the backlog sweep
        if self.degradation.degraded_api() == Some(DegradedApi::Claude) {
            debug!(email_id = %short(&email.id), "Degraded mode, deferring LLM classification");
            return ProcessOutcome::Skipped;
        }

        // 5-7. Full classification
        self.classify_and_store(&email, cycle_id).await
    }

    /// Auto-rule hit: create the suggestion and self-approve it.
    async fn handle_auto_rule(
        &mut self,
        email: &Email,
        result: ClassificationResult,
        cycle_id: &str,
    ) -> ProcessOutcome {
        let stored = async {
            let suggestion_id = self
                .store
                .create_suggestion(
                    &email.id,
                    &result.folder,
                    result.priority,
                    result.action_type,
                    result.confidence,
                    &result.reasoning,
                )
                .await?;
            self.store
                .approve_suggestion(suggestion_id, None, None, None)
                .await?;
            self.store
                .update_classification_status(
                    &email.id,
                    ClassificationStatus::Classified,
                    Some(&result.to_json()),
                )
                .await?;
            self.store
                .log_action(
                    "classify",
                    Some(&email.id),
                    Some(&ActionDetails::Classify {
                        method: result.method.clone(),
                        folder: result.folder.clone(),
                        priority: result.priority,
                        action_type: result.action_type,
                        reasoning: result.reasoning.clone(),
                    }),
                    "auto",
                    Some(cycle_id),
                )
                .await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match stored {
            Ok(()) => {
                info!(
                    email_id = %short(&email.id),
                    folder = %result.folder,
                    "Email auto-ruled"
                );
                ProcessOutcome::AutoRuled
            }
            Err(e) => {
                error!(email_id = %short(&email.id), error = %e, "Auto-rule persist failed");
                ProcessOutcome::Failed
            }
        }
    }

    /// LLM classification with context, then persist the suggestion,
    /// waiting-for tracker, and sender profile.
    async fn classify_and_store(&mut self, email: &Email, cycle_id: &str) -> ProcessOutcome {
        let context = match self.assembler.assemble(email, &self.sent_cache).await {
            Ok(context) => context,
            Err(e) => {
                error!(email_id = %short(&email.id), error = %e, "Context assembly failed");
                return ProcessOutcome::Failed;
            }
        };

        let classification = match self
            .classifier
            .classify_with_llm(email, &context, cycle_id)
            .await
        {
            Ok(classification) => classification,
            Err(e) => {
                warn!(email_id = %short(&email.id), error = %e, "Classification failed");
                match self.store.increment_classification_attempts(&email.id).await {
                    Ok(attempts) if attempts >= 3 => {
                        if let Err(e) = self
                            .store
                            .update_classification_status(
                                &email.id,
                                ClassificationStatus::Failed,
                                None,
                            )
                            .await
                        {
                            warn!(email_id = %short(&email.id), error = %e, "Status update failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(email_id = %short(&email.id), error = %e, "Attempt increment failed")
                    }
                }
                self.degradation.record_claude_failure();
                return ProcessOutcome::Failed;
            }
        };

        self.persist_classification(email, &classification, cycle_id)
            .await
    }

    /// Persist a successful classification: suggestion row, email
    /// status, audit entry, waiting-for tracker, sender profile.
    async fn persist_classification(
        &mut self,
        email: &Email,
        classification: &ClassificationResult,
        cycle_id: &str,
    ) -> ProcessOutcome {
        let stored = async {
            self.store
                .create_suggestion(
                    &email.id,
                    &classification.folder,
                    classification.priority,
                    classification.action_type,
                    classification.confidence,
                    &classification.reasoning,
                )
                .await?;
            self.store
                .update_classification_status(
                    &email.id,
                    ClassificationStatus::Classified,
                    Some(&classification.to_json()),
                )
                .await?;
            self.store
                .log_action(
                    "suggest",
                    Some(&email.id),
                    Some(&ActionDetails::Suggest {
                        method: classification.method.clone(),
                        folder: classification.folder.clone(),
                        priority: classification.priority,
                        action_type: classification.action_type,
                        confidence: classification.confidence,
                        inherited_folder: classification.inherited_folder,
                    }),
                    "auto",
                    Some(cycle_id),
                )
                .await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        if let Err(e) = stored {
            error!(email_id = %short(&email.id), error = %e, "Suggestion persist failed");
            return ProcessOutcome::Failed;
        }

        self.create_waiting_for_if_needed(email, classification).await;

        // Sender profile update is auxiliary; its failure never undoes
        // the suggestion
        if let Some(sender) = email.sender_email.as_deref().filter(|s| !s.is_empty()) {
            if let Err(e) = self
                .store
                .upsert_sender_profile(
                    sender,
                    email.sender_name.as_deref(),
                    crate::store::SenderCategory::Unknown,
                    true,
                )
                .await
            {
                warn!(email_id = %short(&email.id), error = %e, "Sender profile upsert failed");
            }
        }

        self.degradation.record_claude_success();

        info!(
            email_id = %short(&email.id),
            method = %classification.method,
            folder = %classification.folder,
            confidence = classification.confidence,
            "Email classified"
        );

        if classification.method == METHOD_INHERITED {
            ProcessOutcome::Inherited
        } else {
            ProcessOutcome::Classified
        }
    }

    async fn create_waiting_for_if_needed(
        &self,
        email: &Email,
        classification: &ClassificationResult,
    ) {
        if classification.action_type != ActionType::WaitingFor {
            return;
        }
        let Some(detail) = classification
            .waiting_for_detail
            .as_ref()
            .filter(|d| !d.expected_from.is_empty())
        else {
            return;
        };

        match self
            .store
            .create_waiting_for(
                &email.id,
                email.conversation_id.as_deref().unwrap_or(""),
                &detail.expected_from,
                &detail.description,
                self.config.aging.waiting_for_nudge_hours,
            )
            .await
        {
            Ok(_) => {
                info!(
                    email_id = %short(&email.id),
                    expected_from = %detail.expected_from,
                    "Waiting-for tracker created"
                );
            }
            Err(e) => {
                warn!(email_id = %short(&email.id), error = %e, "Waiting-for creation failed");
            }
        }
    }

    /// Resolve an open waiting-for tracker when the awaited sender
    /// replies on the tracked conversation.
    async fn resolve_waiting_for_if_answered(&self, email: &Email) {
        let (Some(conv_id), Some(sender)) =
            (email.conversation_id.as_deref(), email.sender_email.as_deref())
        else {
            return;
        };

        let tracker = match self.store.check_waiting_for_by_conversation(conv_id).await {
            Ok(Some(tracker)) => tracker,
            Ok(None) => return,
            Err(e) => {
                warn!(email_id = %short(&email.id), error = %e, "Waiting-for lookup failed");
                return;
            }
        };

        let expected = tracker.expected_from.as_deref().unwrap_or("");
        if !expected.is_empty() && expected.eq_ignore_ascii_case(sender) {
            if let Err(e) = self
                .store
                .resolve_waiting_for(tracker.id, WaitingStatus::Received)
                .await
            {
                warn!(email_id = %short(&email.id), error = %e, "Waiting-for resolve failed");
            } else {
                info!(
                    email_id = %short(&email.id),
                    expected_from = %expected,
                    "Waiting-for resolved: expected reply arrived"
                );
            }
        }
    }

    /// One LLM attempt against the oldest backlog email while degraded.
    /// Success stores the classification and clears degradation.
    async fn probe_recovery(&mut self, cycle_id: &str) -> bool {
        let candidate = match self.store.get_backlog_emails(1).await {
            Ok(mut emails) => emails.pop(),
            Err(e) => {
                warn!(cycle_id = %cycle_id, error = %e, "Backlog lookup failed");
                return false;
            }
        };
        let Some(email) = candidate else {
            debug!(cycle_id = %cycle_id, "No backlog email available for recovery probe");
            return false;
        };

        debug!(
            cycle_id = %cycle_id,
            email_id = %short(&email.id),
            "Probing Claude recovery with backlog email"
        );

        // Probe failures do not count against the email's
        // classification-attempt budget.
        let context = match self.assembler.assemble(&email, &self.sent_cache).await {
            Ok(context) => context,
            Err(e) => {
                warn!(cycle_id = %cycle_id, error = %e, "Probe context assembly failed");
                return false;
            }
        };
        match self
            .classifier
            .classify_with_llm(&email, &context, cycle_id)
            .await
        {
            Ok(classification) => matches!(
                self.persist_classification(&email, &classification, cycle_id)
                    .await,
                ProcessOutcome::Classified | ProcessOutcome::Inherited
            ),
            Err(e) => {
                debug!(cycle_id = %cycle_id, error = %e, "Recovery probe failed; staying degraded");
                self.degradation.record_claude_failure();
                false
            }
        }
    }

    /// One bounded FIFO pass over pending emails with no suggestion.
    /// Auto-rules were already checked on first arrival; this is the
    /// LLM step only.
    async fn process_backlog(&mut self, cycle_id: &str) -> usize {
        let backlog = match self
            .store
            .get_backlog_emails(self.config.triage.batch_size)
            .await
        {
            Ok(backlog) => backlog,
            Err(e) => {
                warn!(cycle_id = %cycle_id, error = %e, "Backlog fetch failed");
                return 0;
            }
        };
        if backlog.is_empty() {
            return 0;
        }

        info!(cycle_id = %cycle_id, count = backlog.len(), "Processing backlog");
        let mut processed = 0;
        for email in backlog {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if self.degradation.is_degraded() {
                // The API fell over again mid-sweep
                break;
            }
            if matches!(
                self.classify_and_store(&email, cycle_id).await,
                ProcessOutcome::Classified | ProcessOutcome::Inherited
            ) {
                processed += 1;
            }
        }
        processed
    }
}

/// Project a transport message onto a pending email row.
fn transform_message(raw: &RawMessage) -> Email {
    let mut email = Email::new(raw.id.clone());
    email.conversation_id = raw.conversation_id.clone();
    email.conversation_index = raw.conversation_index.clone();
    email.subject = raw.subject.clone();
    email.sender_email = raw.sender_address().map(|s| s.to_string());
    email.sender_name = raw.sender_name().map(|s| s.to_string());
    email.received_at = raw.received_at;
    email.snippet = raw.body_preview.clone();
    email.web_link = raw.web_link.clone();
    email.importance = raw.importance.clone().unwrap_or_else(|| "normal".to_string());
    email.is_read = raw.is_read;
    email.flag_status = raw
        .flag_status
        .clone()
        .unwrap_or_else(|| "notFlagged".to_string());
    email
}

fn short(id: &str) -> String {
    if id.len() > 20 {
        format!("{}...", &id[..20])
    } else {
        id.to_string()
    }
}

/// Spawn the periodic triage loop.
///
/// A single task owns the engine, so two cycles can never overlap;
/// missed ticks are delayed rather than burst. Setting the shutdown
/// flag stops the loop at the next tick and cancels an in-flight cycle
/// between messages (the engine shares the same flag).
pub fn spawn_triage_loop(mut engine: TriageEngine, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(engine.config.triage.interval_minutes as u64 * 60);
        info!(
            interval_minutes = engine.config.triage.interval_minutes,
            "Triage loop started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Triage loop shutting down");
                return;
            }
            let result = engine.run_cycle().await;
            debug!(
                cycle_id = %result.cycle_id,
                processed = result.emails_processed,
                "Cycle finished"
            );
        }
    })
}
