//! Prompt assembly and the classification tool schema.
//!
//! The system prompt depends only on config and learned preferences, so
//! it is rebuilt once per triage cycle. The user message is assembled
//! per email with conditional context sections.

use indoc::indoc;

use crate::config::AppConfig;
use crate::llm::ToolDefinition;
use crate::store::models::{Correction, Email};
use crate::triage::context::ClassificationContext;

/// Name of the forced classification tool.
pub const CLASSIFY_TOOL_NAME: &str = "classify_email";

/// The forced tool the classifier calls for structured output.
pub fn classify_email_tool() -> ToolDefinition {
    ToolDefinition {
        name: CLASSIFY_TOOL_NAME.to_string(),
        description: "Classify an email into the organizational structure".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "folder": {
                    "type": "string",
                    "description":
                        "Exact folder path from the structure (e.g., 'Projects/Tradecore Steel')"
                },
                "priority": {
                    "type": "string",
                    "enum": [
                        "P1 - Urgent Important",
                        "P2 - Important",
                        "P3 - Urgent Low",
                        "P4 - Low"
                    ]
                },
                "action_type": {
                    "type": "string",
                    "enum": [
                        "Needs Reply",
                        "Review",
                        "Delegated",
                        "FYI Only",
                        "Waiting For",
                        "Scheduled"
                    ]
                },
                "confidence": {
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0,
                    "description": "Classification confidence score"
                },
                "reasoning": {
                    "type": "string",
                    "description": "One sentence explaining the classification"
                },
                "waiting_for_detail": {
                    "type": ["object", "null"],
                    "properties": {
                        "expected_from": {"type": "string"},
                        "description": {"type": "string"}
                    },
                    "description":
                        "If action_type is Waiting For, who and what we're waiting for"
                },
                "suggested_new_project": {
                    "type": ["string", "null"],
                    "description":
                        "If the email doesn't fit existing structure, suggest a new project name"
                }
            },
            "required": ["folder", "priority", "action_type", "confidence", "reasoning"]
        }),
    }
}

const SYSTEM_PROMPT_TEMPLATE: &str = indoc! {"
    You are a personal email triage assistant. Classify incoming emails
    using the classify_email tool.

    FOLDER STRUCTURE:
    {folders}

    PRIORITY LEVELS:
    - P1 - Urgent Important: Needs action today. Client escalations, deadlines, blockers, executive requests.
    - P2 - Important: Needs action this week. Strategic work, key decisions, planning, important relationships.
    - P3 - Urgent Low: Quick action or delegate. Routine requests, standard replies, operational tasks.
    - P4 - Low: Archive or defer. FYI, informational, newsletters, automated.

    ACTION TYPES:
    - Needs Reply: The user needs to respond to this email AND has not already replied.
    - Review: The user needs to review an attachment, document, or decision.
    - Delegated: This should be forwarded to someone else.
    - FYI Only: Informational, no action required.
    - Waiting For: The user previously sent something and is awaiting a response.
    - Scheduled: Action planned for a specific date.

    KEY CONTACTS (priority boost):
    {key_contacts}

    CLASSIFICATION HINTS:
    - Use the thread context to understand short replies (e.g., \"Sounds good\" only makes sense in the context of the preceding message).
    - The sender's importance flag (high/normal/low) is a useful signal: senders rarely mark emails as \"high importance\" without reason.
    - If a sender history is provided, treat it as a strong prior for the folder assignment, but override it if the email content clearly indicates a different topic.
    - If an inherited_folder is provided, the folder has already been determined by thread inheritance. Focus your classification on priority and action_type only.
    - Thread depth indicates how deep in a reply chain this email is. Very deep threads (depth > 5) are more likely FYI/informational unless the latest message introduces a new request.
    - If a sender profile is provided, treat it as context for classification. A sender categorized as 'newsletter' or 'automated' is a strong signal for P4/FYI Only. A sender categorized as 'client' or 'key_contact' warrants higher priority.

    LEARNED PREFERENCES (from user correction history):
    {preferences}
    (These preferences reflect patterns the user has established through corrections. Treat them as strong guidance -- they represent the user's actual intent when the standard signals were ambiguous or misleading.)"
};

/// Assemble the system prompt from the folder taxonomy, key contacts,
/// and the learned preference blob.
pub fn build_system_prompt(config: &AppConfig, preferences: Option<&str>) -> String {
    SYSTEM_PROMPT_TEMPLATE
        .replace("{folders}", &build_folder_list(config))
        .replace("{key_contacts}", &build_key_contacts(config))
        .replace(
            "{preferences}",
            preferences
                .filter(|p| !p.trim().is_empty())
                .unwrap_or("No learned preferences yet."),
        )
}

fn build_folder_list(config: &AppConfig) -> String {
    let mut lines: Vec<String> = Vec::new();

    if !config.projects.is_empty() {
        lines.push("Projects/".to_string());
        for project in &config.projects {
            lines.push(format!("  {}", project.folder));
        }
    }
    if !config.areas.is_empty() {
        lines.push("Areas/".to_string());
        for area in &config.areas {
            lines.push(format!("  {}", area.folder));
        }
    }
    lines.push("Reference/".to_string());
    lines.push("  Reference/Newsletters".to_string());
    lines.push("  Reference/Dev Notifications".to_string());
    lines.push("  Reference/Calendar".to_string());
    lines.push("  Reference/Industry".to_string());
    lines.push("  Reference/Vendor Updates".to_string());
    lines.push("Archive/".to_string());

    lines.join("\n")
}

fn build_key_contacts(config: &AppConfig) -> String {
    if config.key_contacts.is_empty() {
        return "None configured.".to_string();
    }
    config
        .key_contacts
        .iter()
        .map(|contact| {
            let plural = if contact.priority_boost == 1 { "" } else { "s" };
            format!(
                "- {} ({}): +{} priority level{}",
                contact.email, contact.role, contact.priority_boost, plural
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assemble the per-email user message with conditional context
/// sections: sender history only when strong, sender profile only when
/// categorized, thread context when present.
pub fn build_user_message(email: &Email, context: &ClassificationContext) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push("Classify this email:".to_string());
    parts.push(String::new());
    parts.push(format!(
        "From: {} <{}>",
        email.sender_name.as_deref().unwrap_or(""),
        email.sender_email.as_deref().unwrap_or(""),
    ));
    parts.push(format!(
        "Subject: {}",
        email.subject.as_deref().unwrap_or("")
    ));
    parts.push(format!(
        "Received: {}",
        email
            .received_at
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string()),
    ));
    parts.push(format!("Importance: {}", email.importance));
    parts.push(format!(
        "Read status: {}",
        if email.is_read { "Read" } else { "Unread" }
    ));
    parts.push(format!("Flag: {}", email.flag_status));
    parts.push(format!("Thread depth: {}", context.thread_depth));

    if context.has_user_reply {
        parts.push("Reply state: User has already replied to this thread".to_string());
    } else {
        parts.push("Reply state: User has NOT replied to this thread".to_string());
    }

    if let Some(folder) = &context.inherited_folder {
        parts.push(format!(
            "Inherited folder (from thread): {folder} (classify priority and action_type only)"
        ));
    }

    parts.push(format!(
        "Body snippet (cleaned): {}",
        email.snippet.as_deref().unwrap_or("")
    ));
    parts.push(String::new());

    if let Some(line) = context
        .sender_history
        .as_ref()
        .and_then(|h| h.format_for_prompt())
    {
        parts.push(format!("Sender history: {line}"));
    }

    if let Some(profile) = context
        .sender_profile
        .as_ref()
        .filter(|p| p.category != crate::store::SenderCategory::Unknown)
    {
        parts.push(format!(
            "Sender profile: Category: {} | Default folder: {} | Emails seen: {}",
            profile.category.as_str(),
            profile.default_folder.as_deref().unwrap_or("none"),
            profile.email_count,
        ));
    }

    parts.push(String::new());
    parts.push("Thread context (prior messages, newest first):".to_string());
    match context.thread_context.as_ref().filter(|t| !t.messages.is_empty()) {
        Some(thread) => {
            for (i, msg) in thread.messages.iter().enumerate() {
                parts.push(format!(
                    "  [{}] From: {} <{}>",
                    i + 1,
                    msg.sender_name.as_deref().unwrap_or("Unknown"),
                    msg.sender_email,
                ));
                parts.push(format!("      Subject: {}", msg.subject));
                parts.push(format!(
                    "      Date: {}",
                    msg.received_at.format("%Y-%m-%d %H:%M")
                ));
                parts.push(format!("      Snippet: {}", msg.snippet));
                parts.push(String::new());
            }
        }
        None => parts.push("No prior messages in this thread.".to_string()),
    }

    parts.join("\n")
}

const PREFERENCE_UPDATE_TEMPLATE: &str = indoc! {"
    You maintain a short set of email classification preferences learned
    from a user's corrections. The triage assistant embeds these
    preferences in its system prompt.

    Below are the user's recent corrections (what the assistant
    suggested vs what the user chose), followed by the current
    preference notes.

    RECENT CORRECTIONS:
    {corrections}

    CURRENT PREFERENCES:
    {current}

    Rewrite the preference notes to incorporate the patterns visible in
    these corrections. Keep existing preferences that are not
    contradicted. Be specific (name senders, domains, folders,
    priorities). Output ONLY the updated preference notes as a short
    bulleted list, nothing else."
};

/// Assemble the preference-update prompt for the learner.
pub fn build_preference_update_prompt(corrections: &[Correction], current: Option<&str>) -> String {
    let formatted = if corrections.is_empty() {
        "(none)".to_string()
    } else {
        corrections
            .iter()
            .map(format_correction)
            .collect::<Vec<_>>()
            .join("\n")
    };

    PREFERENCE_UPDATE_TEMPLATE
        .replace("{corrections}", &formatted)
        .replace(
            "{current}",
            current
                .filter(|c| !c.trim().is_empty())
                .unwrap_or("(no preferences yet)"),
        )
}

fn format_correction(c: &Correction) -> String {
    let mut changes: Vec<String> = Vec::new();
    if let Some(approved) = &c.approved_folder {
        if *approved != c.suggested_folder {
            changes.push(format!("folder {} -> {}", c.suggested_folder, approved));
        }
    }
    if let Some(approved) = c.approved_priority {
        if approved != c.suggested_priority {
            changes.push(format!(
                "priority {} -> {}",
                c.suggested_priority.as_str(),
                approved.as_str()
            ));
        }
    }
    if let Some(approved) = c.approved_action_type {
        if approved != c.suggested_action_type {
            changes.push(format!(
                "action {} -> {}",
                c.suggested_action_type.as_str(),
                approved.as_str()
            ));
        }
    }
    format!(
        "- From {} | Subject: {} | {}",
        c.sender_email.as_deref().unwrap_or("unknown"),
        c.subject.as_deref().unwrap_or(""),
        changes.join(", "),
    )
}
