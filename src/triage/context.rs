//! Per-message classification context assembly.
//!
//! For one incoming message this computes: the thread-inheritance
//! candidate, up to three prior thread messages (store first, transport
//! top-up), the sender's historical folder pattern, the sender profile,
//! and the has-user-replied flag from the sent-items cache.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::mail::{MessageOps, SentItemsCache};
use crate::store::{SenderProfile, Store};

/// Confidence assigned to an inherited folder.
pub const INHERITANCE_CONFIDENCE: f64 = 0.95;

/// Prior messages included in the LLM context.
const MAX_CONTEXT_MESSAGES: usize = 3;

/// A prior message summarized for classification context.
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    pub message_id: String,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub snippet: String,
}

/// Context for an email thread including prior messages.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    pub conversation_id: String,
    /// Up to three prior messages, newest first.
    pub messages: Vec<ThreadMessage>,
    /// Reply depth derived from the conversation index.
    pub thread_depth: u32,
    pub unique_domains: HashSet<String>,
}

/// Result of the thread-inheritance check.
#[derive(Debug, Clone)]
pub struct InheritanceResult {
    pub should_inherit: bool,
    pub inherited_folder: Option<String>,
    pub confidence: f64,
    pub reason: String,
}

impl InheritanceResult {
    pub fn inherit(folder: String) -> Self {
        Self {
            should_inherit: true,
            inherited_folder: Some(folder),
            confidence: INHERITANCE_CONFIDENCE,
            reason: "Thread continues with same topic and participants".to_string(),
        }
    }

    pub fn no_inherit(reason: impl Into<String>) -> Self {
        Self {
            should_inherit: false,
            inherited_folder: None,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

/// Sender history with dominance analysis.
#[derive(Debug, Clone, Default)]
pub struct SenderHistoryAnalysis {
    pub sender_email: String,
    pub total_emails: u32,
    pub dominant_folder: Option<String>,
    pub dominant_count: u32,
    pub dominant_percentage: f64,
}

impl SenderHistoryAnalysis {
    /// A pattern is strong with ≥ 5 historical classifications and
    /// ≥ 80% of them in one folder.
    pub fn has_strong_pattern(&self) -> bool {
        self.total_emails >= 5 && self.dominant_percentage >= 0.8
    }

    /// One-line summary for the prompt, or None for weak patterns.
    pub fn format_for_prompt(&self) -> Option<String> {
        if !self.has_strong_pattern() {
            return None;
        }
        let folder = self.dominant_folder.as_deref()?;
        Some(format!(
            "{}% of emails from this sender are classified to {} ({}/{} emails)",
            (self.dominant_percentage * 100.0) as u32,
            folder,
            self.dominant_count,
            self.total_emails,
        ))
    }
}

/// Everything the classifier prompt needs about one message's
/// surroundings.
#[derive(Debug, Clone, Default)]
pub struct ClassificationContext {
    pub inherited_folder: Option<String>,
    pub thread_context: Option<ThreadContext>,
    pub sender_history: Option<SenderHistoryAnalysis>,
    pub sender_profile: Option<SenderProfile>,
    pub thread_depth: u32,
    pub has_user_reply: bool,
}

/// Builds classification context from the store with transport top-up.
pub struct ContextAssembler {
    store: Arc<Store>,
    ops: Arc<MessageOps>,
}

impl ContextAssembler {
    pub fn new(store: Arc<Store>, ops: Arc<MessageOps>) -> Self {
        Self { store, ops }
    }

    /// Assemble the full context for one message.
    pub async fn assemble(
        &self,
        email: &crate::store::Email,
        sent_cache: &SentItemsCache,
    ) -> Result<ClassificationContext, DatabaseError> {
        let sender_email = email.sender_email.as_deref().unwrap_or("");
        let sender_domain = extract_domain(sender_email);

        let mut context = ClassificationContext::default();

        if let Some(conv_id) = email.conversation_id.as_deref() {
            let inheritance = self
                .check_thread_inheritance(
                    conv_id,
                    email.subject.as_deref().unwrap_or(""),
                    &sender_domain,
                )
                .await?;
            if inheritance.should_inherit {
                context.inherited_folder = inheritance.inherited_folder;
            }

            let thread = self.thread_context(conv_id, &email.id).await?;
            context.thread_depth = thread.thread_depth;
            context.thread_context = Some(thread);

            context.has_user_reply = sent_cache.has_replied(conv_id);
        }

        let history = self.sender_history(sender_email).await?;
        context.sender_history = Some(history);
        context.sender_profile = self.store.get_sender_profile(sender_email).await?;

        Ok(context)
    }

    /// Should this message inherit a prior folder decision?
    ///
    /// Inherit only when the conversation has a resolved classification
    /// AND the normalized subject matches a prior subject AND the
    /// sender's domain already appears in the thread.
    pub async fn check_thread_inheritance(
        &self,
        conversation_id: &str,
        current_subject: &str,
        current_sender_domain: &str,
    ) -> Result<InheritanceResult, DatabaseError> {
        let Some((prior_folder, _)) = self.store.get_thread_classification(conversation_id).await?
        else {
            return Ok(InheritanceResult::no_inherit(
                "No prior classification in thread",
            ));
        };

        let prior_emails = self
            .store
            .get_thread_emails(conversation_id, None, 10)
            .await?;
        if prior_emails.is_empty() {
            return Ok(InheritanceResult::no_inherit(
                "No prior emails found in thread",
            ));
        }

        let normalized_current = normalize_subject(current_subject);
        let prior_subjects: HashSet<String> = prior_emails
            .iter()
            .map(|e| normalize_subject(e.subject.as_deref().unwrap_or("")))
            .collect();

        if !prior_subjects.contains(&normalized_current)
            && !normalized_current.is_empty()
            && prior_subjects.iter().all(|s| !s.is_empty())
        {
            return Ok(InheritanceResult::no_inherit(format!(
                "Subject changed: '{normalized_current}' not in prior subjects"
            )));
        }

        let prior_domains: HashSet<String> = prior_emails
            .iter()
            .filter_map(|e| e.sender_email.as_deref())
            .map(extract_domain)
            .collect();
        let current_domain = current_sender_domain.to_lowercase();

        if !prior_domains.is_empty() && !prior_domains.contains(&current_domain) {
            return Ok(InheritanceResult::no_inherit(format!(
                "New participant domain: {current_domain}"
            )));
        }

        debug!(
            conversation_id = %truncated(conversation_id),
            inherited_folder = %prior_folder,
            "Thread inheritance applied"
        );
        Ok(InheritanceResult::inherit(prior_folder))
    }

    /// Prior thread messages, store first, transport top-up when short.
    pub async fn thread_context(
        &self,
        conversation_id: &str,
        exclude_message_id: &str,
    ) -> Result<ThreadContext, DatabaseError> {
        let mut context = ThreadContext {
            conversation_id: conversation_id.to_string(),
            ..ThreadContext::default()
        };

        let local = self
            .store
            .get_thread_emails(
                conversation_id,
                Some(exclude_message_id),
                (MAX_CONTEXT_MESSAGES + 1) as u32,
            )
            .await?;

        for email in local.iter().take(MAX_CONTEXT_MESSAGES) {
            context.messages.push(ThreadMessage {
                message_id: email.id.clone(),
                sender_email: email.sender_email.clone().unwrap_or_default(),
                sender_name: email.sender_name.clone(),
                subject: email.subject.clone().unwrap_or_default(),
                received_at: email.received_at.unwrap_or_else(Utc::now),
                snippet: email.snippet.clone().unwrap_or_default(),
            });
            if let Some(sender) = email.sender_email.as_deref() {
                context.unique_domains.insert(extract_domain(sender));
            }
            if let Some(index) = email.conversation_index.as_deref() {
                context.thread_depth = context.thread_depth.max(thread_depth(index));
            }
        }

        if context.messages.len() < MAX_CONTEXT_MESSAGES {
            match self
                .ops
                .get_thread_messages(conversation_id, (MAX_CONTEXT_MESSAGES + 1) as u32, None)
                .await
            {
                Ok(api_messages) => {
                    let known: HashSet<String> =
                        context.messages.iter().map(|m| m.message_id.clone()).collect();
                    for msg in api_messages {
                        if msg.id == exclude_message_id || known.contains(&msg.id) {
                            continue;
                        }
                        if context.messages.len() >= MAX_CONTEXT_MESSAGES {
                            break;
                        }
                        if let Some(sender) = msg.sender_address() {
                            context.unique_domains.insert(extract_domain(sender));
                        }
                        if let Some(index) = msg.conversation_index.as_deref() {
                            context.thread_depth = context.thread_depth.max(thread_depth(index));
                        }
                        context.messages.push(ThreadMessage {
                            message_id: msg.id.clone(),
                            sender_email: msg.sender_address().unwrap_or_default().to_string(),
                            sender_name: msg.sender_name().map(|s| s.to_string()),
                            subject: msg.subject.clone().unwrap_or_default(),
                            received_at: msg.received_at.unwrap_or_else(Utc::now),
                            snippet: msg.body_preview.clone().unwrap_or_default(),
                        });
                    }
                }
                Err(e) => {
                    // Empty context is acceptable
                    warn!(
                        conversation_id = %truncated(conversation_id),
                        error = %e,
                        "Failed to fetch thread context from mail API"
                    );
                }
            }
        }

        Ok(context)
    }

    /// Sender history with dominant-folder analysis.
    pub async fn sender_history(
        &self,
        sender_email: &str,
    ) -> Result<SenderHistoryAnalysis, DatabaseError> {
        let history = self.store.get_sender_history(sender_email).await?;

        let mut analysis = SenderHistoryAnalysis {
            sender_email: sender_email.to_lowercase(),
            total_emails: history.total_emails,
            ..SenderHistoryAnalysis::default()
        };

        if history.total_emails > 0 {
            for (folder, count) in &history.folder_distribution {
                let percentage = *count as f64 / history.total_emails as f64;
                if percentage > analysis.dominant_percentage {
                    analysis.dominant_percentage = percentage;
                    analysis.dominant_count = *count;
                    analysis.dominant_folder = Some(folder.clone());
                }
            }
        }

        Ok(analysis)
    }
}

/// Strip chained Re:/Fwd:/FW: prefixes, trim, lowercase. Idempotent.
pub fn normalize_subject(subject: &str) -> String {
    static PREFIX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let prefix = PREFIX.get_or_init(|| Regex::new(r"^(?i:(re|fwd|fw)):\s*").unwrap());

    let mut normalized = subject.trim();
    loop {
        match prefix.find(normalized) {
            Some(m) => normalized = normalized[m.end()..].trim_start(),
            None => break,
        }
    }
    normalized.trim().to_lowercase()
}

/// Lowercased domain of an address, or empty when malformed.
pub fn extract_domain(email: &str) -> String {
    email
        .split_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .unwrap_or_default()
}

/// Reply depth from the opaque conversation index: the first 22 decoded
/// bytes are the thread root, each further 5 bytes one reply level.
pub fn thread_depth(conversation_index: &str) -> u32 {
    if conversation_index.is_empty() {
        return 0;
    }
    match BASE64.decode(conversation_index) {
        Ok(decoded) if decoded.len() > 22 => ((decoded.len() - 22) / 5) as u32,
        _ => 0,
    }
}

fn truncated(id: &str) -> String {
    if id.len() > 20 {
        format!("{}...", &id[..20])
    } else {
        id.to_string()
    }
}
