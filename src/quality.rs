//! Quality gate: structural, anti-spam and rewrite-budget checks for a
//! candidate subject/body pair.
//!
//! Pure and deterministic. Each check contributes an independent named flag;
//! a fixed subset of flags is "hard" and can force a variant into the
//! blocked state, the rest are soft advisories.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Subject length budget enforced by the gate.
pub const SUBJECT_MAX_CHARS: usize = 78;
/// At most one exclamation mark across subject and body.
const EXCLAMATION_BUDGET: usize = 1;
/// Bodies longer than this must contain paragraph breaks.
const BODY_WHITESPACE_THRESHOLD: usize = 600;
const MIN_PARAGRAPH_BREAKS: usize = 2;
/// Tolerance band applied on both ends of the rewrite budget.
const REWRITE_TOLERANCE: f64 = 0.10;

/// Clickbait tokens checked against the subject line.
const CLICKBAIT_TOKENS: [&str; 5] = ["gratis", "imperdibile", "solo oggi", "urgente", "adesso"];

/// Flags that alone can force a variant to the blocked state.
const HARD_FLAGS: [&str; 5] = [
    "spam_caps",
    "spam_excessive_exclamation",
    "spam_clickbait_subject",
    "subject_too_long",
    "rewrite_over_target",
];

/// Allowed rewrite ratio range for one variant, as fractions of 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewriteBudget {
    pub min: f64,
    pub max: f64,
}

/// Per-variant rewrite budgets. Later variants are expected to diverge
/// further from the seed template than variant A.
#[derive(Debug, Clone, Copy)]
pub struct RewriteTargets {
    pub a: RewriteBudget,
    pub b: RewriteBudget,
    pub c: RewriteBudget,
}

impl Default for RewriteTargets {
    fn default() -> Self {
        Self {
            a: RewriteBudget { min: 0.25, max: 0.60 },
            b: RewriteBudget { min: 0.35, max: 0.70 },
            c: RewriteBudget { min: 0.45, max: 0.80 },
        }
    }
}

impl RewriteTargets {
    pub fn for_variant(&self, variant_id: &str) -> RewriteBudget {
        match variant_id {
            "B" => self.b,
            "C" => self.c,
            _ => self.a,
        }
    }
}

fn caps_word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b[A-Z]{5,}\b").expect("static pattern"))
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*[a-z_]+\s*\}\}").expect("static pattern"))
}

/// Is `flag` one of the blocking quality flags?
pub fn is_hard_flag(flag: &str) -> bool {
    HARD_FLAGS.contains(&flag)
}

/// Does the set contain at least one blocking flag?
pub fn has_hard_flag<S: AsRef<str>>(flags: &[S]) -> bool {
    flags.iter().any(|flag| is_hard_flag(flag.as_ref()))
}

/// Run every check against the candidate pair.
///
/// Returns a sorted flag set; empty means the pair passed. `seed_template`
/// is the rewrite-budget baseline; with an empty seed the rewrite checks
/// are skipped (no baseline to compare against).
pub fn check(
    subject: &str,
    body: &str,
    variant_id: &str,
    seed_template: &str,
    targets: &RewriteTargets,
) -> Vec<String> {
    let mut flags: BTreeSet<String> = BTreeSet::new();
    let combined = format!("{}\n{}", subject, body);

    if caps_word_pattern().is_match(&combined) {
        flags.insert("spam_caps".to_string());
    }

    if combined.matches('!').count() > EXCLAMATION_BUDGET {
        flags.insert("spam_excessive_exclamation".to_string());
    }

    let subject_lower = subject.to_lowercase();
    if CLICKBAIT_TOKENS.iter().any(|token| subject_lower.contains(token)) {
        flags.insert("spam_clickbait_subject".to_string());
    }

    if subject.chars().count() > SUBJECT_MAX_CHARS {
        flags.insert("subject_too_long".to_string());
    }

    if body.chars().count() > BODY_WHITESPACE_THRESHOLD
        && body.matches("\n\n").count() < MIN_PARAGRAPH_BREAKS
    {
        flags.insert("format_needs_whitespace".to_string());
    }

    if !seed_template.trim().is_empty() {
        let budget = targets.for_variant(variant_id);
        let rewrite = rewrite_ratio(body, seed_template);
        if rewrite < budget.min - REWRITE_TOLERANCE {
            flags.insert("rewrite_under_target".to_string());
        } else if rewrite > budget.max + REWRITE_TOLERANCE {
            flags.insert("rewrite_over_target".to_string());
        }
    }

    flags.into_iter().collect()
}

/// Fraction of the body that diverges from the seed template, in `[0, 1]`.
pub fn rewrite_ratio(body: &str, seed_template: &str) -> f64 {
    let body_norm = normalize_for_similarity(body);
    let seed_norm = normalize_for_similarity(seed_template);
    if body_norm.is_empty() && seed_norm.is_empty() {
        return 0.0;
    }
    let similarity = strsim::normalized_levenshtein(&body_norm, &seed_norm);
    (1.0 - similarity).clamp(0.0, 1.0)
}

fn normalize_for_similarity(text: &str) -> String {
    let without_placeholders = placeholder_pattern().replace_all(text, " ");
    without_placeholders
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "Ciao {{first_name}}, seguiamo aziende come {{company_name}} e \
                        possiamo proporre un confronto operativo. {{sender_name}}";

    fn gate(subject: &str, body: &str) -> Vec<String> {
        check(subject, body, "A", SEED, &RewriteTargets::default())
    }

    #[test]
    fn test_deterministic_for_same_input() {
        let first = gate("Proposta", "corpo della mail");
        let second = gate("Proposta", "corpo della mail");
        assert_eq!(first, second);
    }

    #[test]
    fn test_flags_all_caps_words() {
        let flags = gate("Proposta", "Una proposta IMPORTANTE per voi");
        assert!(flags.contains(&"spam_caps".to_string()));
        assert!(!gate("Proposta", "Una proposta seria").contains(&"spam_caps".to_string()));
    }

    #[test]
    fn test_flags_excessive_exclamation() {
        let flags = gate("Ottima occasione!", "Scrivici subito! Davvero.");
        assert!(flags.contains(&"spam_excessive_exclamation".to_string()));
        let single = gate("Ottima occasione!", "Scrivici quando vuoi.");
        assert!(!single.contains(&"spam_excessive_exclamation".to_string()));
    }

    #[test]
    fn test_flags_clickbait_subject() {
        let flags = gate("Solo oggi una proposta", "corpo");
        assert!(flags.contains(&"spam_clickbait_subject".to_string()));
    }

    #[test]
    fn test_flags_subject_too_long() {
        let long_subject = "a".repeat(SUBJECT_MAX_CHARS + 1);
        let flags = gate(&long_subject, "corpo");
        assert!(flags.contains(&"subject_too_long".to_string()));
    }

    #[test]
    fn test_flags_missing_whitespace_in_long_body() {
        let long_body = "parola ".repeat(120);
        let flags = gate("Proposta", &long_body);
        assert!(flags.contains(&"format_needs_whitespace".to_string()));

        let spaced = format!(
            "{}\n\n{}\n\n{}",
            "parola ".repeat(40),
            "parola ".repeat(40),
            "parola ".repeat(40)
        );
        assert!(!gate("Proposta", &spaced).contains(&"format_needs_whitespace".to_string()));
    }

    #[test]
    fn test_rewrite_under_target_when_body_copies_seed() {
        // Verbatim template copy: rewrite ratio 0, far below the A budget.
        let flags = gate("Proposta", SEED);
        assert!(flags.contains(&"rewrite_under_target".to_string()));
    }

    #[test]
    fn test_rewrite_over_target_when_body_ignores_seed() {
        let body = "Testo completamente diverso che non condivide nulla con il \
                    modello originale, parla di argomenti non correlati e con un \
                    registro differente. "
            .repeat(4);
        let flags = gate("Proposta", &body);
        assert!(flags.contains(&"rewrite_over_target".to_string()));
    }

    #[test]
    fn test_hard_flag_partition() {
        assert!(is_hard_flag("spam_caps"));
        assert!(is_hard_flag("rewrite_over_target"));
        assert!(!is_hard_flag("rewrite_under_target"));
        assert!(!is_hard_flag("format_needs_whitespace"));
        assert!(has_hard_flag(&["format_needs_whitespace", "subject_too_long"]));
        assert!(!has_hard_flag(&["format_needs_whitespace"]));
    }
}
