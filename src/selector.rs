//! Variant selection: deterministically pick the exported "final" variant
//! and the row's aggregate status from the generated set.
//!
//! One blocked variant must not poison an otherwise-OK row: the row only
//! fails when every variant failed the copy guard.

use crate::llm::DraftEmailVariant;
use std::collections::BTreeSet;

pub const FAILED_COPY_GUARD_FLAG: &str = "failed_copy_guard";
pub const LIMITED_SOURCES_FLAG: &str = "limited_sources";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStatus {
    Ok,
    FailedCopyGuard,
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub selected_variant: String,
    pub status: SelectionStatus,
    /// Row-level exported risk flags.
    pub warning_flags: Vec<String>,
    /// Bounded human-readable warning; empty when there is nothing to say.
    pub warning_message: String,
}

/// Pick the final variant for a row.
///
/// The recommended id wins if it passed the copy guard; otherwise the first
/// passing id in stable A,B,C order; if nothing passed, the recommended (or
/// first produced) id is still exported, flagged as blocked.
pub fn select_final_variant(
    variants: &[DraftEmailVariant],
    recommended: &str,
    dossier_has_sources: bool,
) -> SelectionOutcome {
    let passing: Vec<&DraftEmailVariant> = variants
        .iter()
        .filter(|v| !v.risk_flags.iter().any(|f| f == FAILED_COPY_GUARD_FLAG))
        .collect();
    let failed_ids: Vec<String> = variants
        .iter()
        .filter(|v| v.risk_flags.iter().any(|f| f == FAILED_COPY_GUARD_FLAG))
        .map(|v| v.variant.clone())
        .collect();

    let status = if passing.is_empty() {
        SelectionStatus::FailedCopyGuard
    } else {
        SelectionStatus::Ok
    };

    let selected_variant = if passing.iter().any(|v| v.variant == recommended) {
        recommended.to_string()
    } else if let Some(first_passing) = passing.first() {
        first_passing.variant.clone()
    } else if variants.iter().any(|v| v.variant == recommended) {
        recommended.to_string()
    } else {
        variants.first().map(|v| v.variant.clone()).unwrap_or_else(|| "A".to_string())
    };

    let mut flags: BTreeSet<String> = variants
        .iter()
        .find(|v| v.variant == selected_variant)
        .map(|v| v.risk_flags.iter().cloned().collect())
        .unwrap_or_default();
    if status == SelectionStatus::Ok {
        flags.remove(FAILED_COPY_GUARD_FLAG);
    }
    if !dossier_has_sources {
        flags.insert(LIMITED_SOURCES_FLAG.to_string());
    }

    let warning_message = match status {
        SelectionStatus::FailedCopyGuard => "Copy guard non superato dopo repair".to_string(),
        SelectionStatus::Ok if !failed_ids.is_empty() => {
            format!("Copy guard fallito su variante {}", failed_ids.join(", "))
        }
        SelectionStatus::Ok => String::new(),
    };

    SelectionOutcome {
        selected_variant,
        status,
        warning_flags: flags.into_iter().collect(),
        warning_message,
    }
}
