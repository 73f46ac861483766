//! Classification accuracy report built from resolved suggestions.
//!
//! The review surface feeds `Store::get_resolved_suggestions` output in
//! here to render confusion matrices. The report is withheld until
//! enough resolutions exist to say anything meaningful.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::models::{Suggestion, SuggestionStatus};

/// Minimum resolved suggestions before a report is produced.
pub const MIN_RESOLVED_FOR_REPORT: usize = 10;

/// Confusion counts for one dimension: (suggested, approved) → count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfusionMatrix {
    pub cells: HashMap<String, u32>,
    pub agreements: u32,
    pub total: u32,
}

impl ConfusionMatrix {
    fn record(&mut self, suggested: &str, approved: &str) {
        *self
            .cells
            .entry(format!("{suggested} -> {approved}"))
            .or_insert(0) += 1;
        if suggested == approved {
            self.agreements += 1;
        }
        self.total += 1;
    }

    /// Fraction of resolutions where the user kept the suggested value.
    pub fn agreement_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.agreements as f64 / self.total as f64
        }
    }
}

/// Accuracy report across the three classified dimensions.
#[derive(Debug, Clone, Serialize)]
pub struct ConfusionReport {
    pub resolved_count: usize,
    pub folder: ConfusionMatrix,
    pub priority: ConfusionMatrix,
    pub action_type: ConfusionMatrix,
}

/// Build a report from resolved (approved or partial) suggestions.
///
/// Returns `None` when fewer than [`MIN_RESOLVED_FOR_REPORT`] resolved
/// rows are supplied.
pub fn confusion_report(resolved: &[Suggestion]) -> Option<ConfusionReport> {
    let rows: Vec<&Suggestion> = resolved
        .iter()
        .filter(|s| {
            matches!(
                s.status,
                SuggestionStatus::Approved | SuggestionStatus::Partial
            )
        })
        .collect();
    if rows.len() < MIN_RESOLVED_FOR_REPORT {
        return None;
    }

    let mut report = ConfusionReport {
        resolved_count: rows.len(),
        folder: ConfusionMatrix::default(),
        priority: ConfusionMatrix::default(),
        action_type: ConfusionMatrix::default(),
    };

    for s in rows {
        if let Some(approved) = &s.approved_folder {
            report.folder.record(&s.suggested_folder, approved);
        }
        if let Some(approved) = s.approved_priority {
            report
                .priority
                .record(s.suggested_priority.as_str(), approved.as_str());
        }
        if let Some(approved) = s.approved_action_type {
            report
                .action_type
                .record(s.suggested_action_type.as_str(), approved.as_str());
        }
    }

    Some(report)
}
