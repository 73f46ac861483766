//! Auto-rule matching — the deterministic fast path of the ladder.
//!
//! A rule matches when the sender address matches any of its sender
//! patterns (exact or `*@domain` wildcard) OR the subject contains any
//! of its subject substrings case-insensitively. First matching rule in
//! config order wins; a match bypasses the LLM entirely.

use tracing::debug;

use crate::config::AutoRuleConfig;

/// A rule hit with the predicate that fired.
#[derive(Debug, Clone)]
pub struct AutoRuleMatch<'a> {
    pub rule: &'a AutoRuleConfig,
    pub match_reason: String,
}

/// Find the first rule matching a sender/subject pair.
pub fn match_rules<'a>(
    rules: &'a [AutoRuleConfig],
    sender_email: &str,
    subject: &str,
) -> Option<AutoRuleMatch<'a>> {
    let sender_lower = sender_email.to_lowercase();
    let subject_lower = subject.to_lowercase();

    for rule in rules {
        if let Some(pattern) = rule
            .r#match
            .senders
            .iter()
            .find(|p| sender_matches(&sender_lower, p))
        {
            debug!(rule = %rule.name, pattern = %pattern, "Auto-rule sender match");
            return Some(AutoRuleMatch {
                rule,
                match_reason: format!(
                    "Auto-rule '{}': sender matched pattern '{}'",
                    rule.name, pattern
                ),
            });
        }

        if let Some(substring) = rule
            .r#match
            .subjects
            .iter()
            .find(|s| !s.is_empty() && subject_lower.contains(&s.to_lowercase()))
        {
            debug!(rule = %rule.name, substring = %substring, "Auto-rule subject match");
            return Some(AutoRuleMatch {
                rule,
                match_reason: format!(
                    "Auto-rule '{}': subject matched '{}'",
                    rule.name, substring
                ),
            });
        }
    }

    None
}

/// Exact address match, or `*@domain` wildcard against the domain part.
fn sender_matches(sender_lower: &str, pattern: &str) -> bool {
    let pattern_lower = pattern.to_lowercase();
    if let Some(domain) = pattern_lower.strip_prefix("*@") {
        return sender_lower
            .split_once('@')
            .is_some_and(|(_, sender_domain)| sender_domain == domain);
    }
    sender_lower == pattern_lower
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoRuleAction, AutoRuleMatch as MatchConfig};
    use crate::store::models::{ActionType, Priority};

    fn rule(name: &str, senders: Vec<&str>, subjects: Vec<&str>, folder: &str) -> AutoRuleConfig {
        AutoRuleConfig {
            name: name.to_string(),
            r#match: MatchConfig {
                senders: senders.into_iter().map(String::from).collect(),
                subjects: subjects.into_iter().map(String::from).collect(),
            },
            action: AutoRuleAction {
                folder: folder.to_string(),
                category: ActionType::FyiOnly,
                priority: Priority::P4Low,
            },
        }
    }

    #[test]
    fn wildcard_sender_match() {
        let rules = vec![rule(
            "newsletters",
            vec!["*@news.example.com"],
            vec![],
            "Reference/Newsletters",
        )];
        let hit = match_rules(&rules, "digest@news.example.com", "Weekly digest").unwrap();
        assert_eq!(hit.rule.name, "newsletters");
        assert!(hit.match_reason.contains("sender matched"));
        assert!(hit.match_reason.contains("*@news.example.com"));
    }

    #[test]
    fn wildcard_requires_full_domain_match() {
        let rules = vec![rule("r", vec!["*@example.com"], vec![], "Archive")];
        // Subdomain is a different domain
        assert!(match_rules(&rules, "a@sub.example.com", "s").is_none());
        assert!(match_rules(&rules, "a@notexample.com", "s").is_none());
        assert!(match_rules(&rules, "a@example.com", "s").is_some());
    }

    #[test]
    fn exact_sender_match_is_case_insensitive() {
        let rules = vec![rule("r", vec!["Boss@Corp.com"], vec![], "Areas/Exec")];
        assert!(match_rules(&rules, "boss@corp.COM", "s").is_some());
        assert!(match_rules(&rules, "notboss@corp.com", "s").is_none());
    }

    #[test]
    fn subject_substring_match_is_case_insensitive() {
        let rules = vec![rule("invoices", vec![], vec!["Invoice #"], "Areas/Finance")];
        let hit = match_rules(&rules, "anyone@anywhere.com", "Your INVOICE #1234 is ready").unwrap();
        assert_eq!(hit.rule.name, "invoices");
        assert!(hit.match_reason.contains("subject matched"));
    }

    #[test]
    fn first_matching_rule_wins_in_config_order() {
        let rules = vec![
            rule("first", vec!["*@example.com"], vec![], "A"),
            rule("second", vec!["*@example.com"], vec![], "B"),
        ];
        let hit = match_rules(&rules, "x@example.com", "s").unwrap();
        assert_eq!(hit.rule.name, "first");
    }

    #[test]
    fn sender_is_checked_before_subject_within_a_rule() {
        let rules = vec![rule(
            "both",
            vec!["*@example.com"],
            vec!["digest"],
            "Reference/Newsletters",
        )];
        let hit = match_rules(&rules, "a@example.com", "Weekly digest").unwrap();
        assert!(hit.match_reason.contains("sender matched"));
    }

    #[test]
    fn no_match_returns_none() {
        let rules = vec![rule("r", vec!["*@alpha.com"], vec!["quarterly"], "A")];
        assert!(match_rules(&rules, "someone@beta.com", "Status update").is_none());
    }

    #[test]
    fn empty_rules_never_match() {
        assert!(match_rules(&[], "a@b.com", "anything").is_none());
    }

    #[test]
    fn empty_subject_pattern_does_not_match_everything() {
        let rules = vec![rule("degenerate", vec![], vec![""], "A")];
        assert!(match_rules(&rules, "a@b.com", "anything").is_none());
    }
}
