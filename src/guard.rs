//! Claim guard: brand-safety filter for generated copy.
//!
//! Scans a fixed set of high-risk claim patterns, redacts caller-supplied
//! no-go phrases, and normalizes risky absolute phrasing. Pure and
//! idempotent: re-running the guard on its own output changes nothing.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Marker left in place of a redacted no-go phrase.
pub const REDACTION_MARKER: &str = "[claim-rimosso]";

/// Result of a claim-guard pass.
#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub text: String,
    /// Sorted, deduplicated flag names.
    pub flags: Vec<String>,
}

fn forbidden_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            ("claim_guaranteed", r"(?i)\b(garantit[oaie]|garanzia totale)\b"),
            ("claim_absolute", r"(?i)\b(100%|sempre|mai)\b"),
            ("claim_zero_risk", r"(?i)\b(senza rischi|rischio zero)\b"),
            ("claim_unique", r"(?i)\b(unic[oaie] sul mercato)\b"),
            ("claim_immediate", r"(?i)\b(risultati immediati|subito)\b"),
        ]
        .into_iter()
        .map(|(name, pattern)| (name, Regex::new(pattern).expect("static pattern")))
        .collect()
    })
}

fn soft_rewrites() -> &'static [(Regex, &'static str)] {
    static REWRITES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    REWRITES.get_or_init(|| {
        [
            (r"(?i)\bgarantiamo\b", "puntiamo a"),
            (r"(?i)\bgarantito\b", "stimato"),
            (r"(?i)\bsenza rischi\b", "con rischio controllato"),
        ]
        .into_iter()
        .map(|(pattern, replacement)| {
            (Regex::new(pattern).expect("static pattern"), replacement)
        })
        .collect()
    })
}

/// Scan `text` for risky claims and caller-defined no-go phrases.
///
/// Fixed patterns only raise flags; no-go phrases are additionally replaced
/// with [`REDACTION_MARKER`]. Soft rewrites run unconditionally and are not
/// flagged. Empty input yields empty output with no flags.
pub fn apply_claim_guard(text: &str, no_go_claims: &[String]) -> GuardOutcome {
    let mut flags: BTreeSet<String> = BTreeSet::new();
    let mut cleaned = text.to_string();

    for (name, pattern) in forbidden_patterns() {
        if pattern.is_match(&cleaned) {
            flags.insert((*name).to_string());
        }
    }

    for item in no_go_claims {
        let token = item.trim();
        if token.is_empty() {
            continue;
        }
        let escaped = format!("(?i){}", regex::escape(token));
        if let Ok(pattern) = Regex::new(&escaped) {
            if pattern.is_match(&cleaned) {
                flags.insert(format!("no_go:{}", token));
                cleaned = pattern.replace_all(&cleaned, REDACTION_MARKER).into_owned();
            }
        }
    }

    for (pattern, replacement) in soft_rewrites() {
        cleaned = pattern.replace_all(&cleaned, *replacement).into_owned();
    }

    GuardOutcome {
        text: cleaned,
        flags: flags.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_and_sanitizes_risky_claims() {
        let text = "Oggetto: Soluzione garantita\n\nRisultati garantiti e senza rischi al 100%.";
        let outcome = apply_claim_guard(text, &["risultati garantiti".to_string()]);

        assert!(outcome.flags.iter().any(|f| f == "claim_guaranteed"));
        assert!(outcome.flags.iter().any(|f| f == "claim_zero_risk"));
        assert!(outcome.flags.iter().any(|f| f == "no_go:risultati garantiti"));
        assert!(!outcome.text.to_lowercase().contains("risultati garantiti"));
        assert!(outcome.text.contains(REDACTION_MARKER));
    }

    #[test]
    fn test_soft_rewrites_always_apply() {
        let outcome = apply_claim_guard("Garantiamo il risultato.", &[]);
        assert!(outcome.text.contains("puntiamo a"));
        assert!(!outcome.text.to_lowercase().contains("garantiamo"));
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let text = "Vi garantiamo risultati immediati, senza rischi e sempre puntuali!";
        let first = apply_claim_guard(text, &["risultati immediati".to_string()]);
        let second = apply_claim_guard(&first.text, &["risultati immediati".to_string()]);
        assert_eq!(first.text, second.text);
    }

    #[test]
    fn test_empty_input() {
        let outcome = apply_claim_guard("", &["garantito".to_string()]);
        assert!(outcome.text.is_empty());
        assert!(outcome.flags.is_empty());
    }

    #[test]
    fn test_flags_are_sorted_and_deduped() {
        let text = "sempre sempre mai";
        let outcome = apply_claim_guard(text, &[]);
        assert_eq!(outcome.flags, vec!["claim_absolute".to_string()]);
    }
}
