//! Prompt construction for the generation and repair calls.
//!
//! The user message is a structured JSON payload; the constraint block spells
//! out the full copy contract (variant ids, rewrite budgets, anti-spam rules,
//! length and formatting limits) so the gate rejects less.

use crate::enrichment::EnrichmentDossier;
use crate::leads::{LeadCompany, LeadContact};
use crate::profile::ParentProfile;
use crate::quality::{RewriteBudget, RewriteTargets, SUBJECT_MAX_CHARS};
use serde_json::json;

pub const GENERATION_SYSTEM_PROMPT: &str = "Sei un copywriter B2B senior. Genera email outbound \
in italiano, stile formale-consulenziale. Niente promesse assolute, claim non verificabili o \
fatti inventati. Output SOLO JSON valido con chiavi: variants, recommended_variant, notes.";

pub const REPAIR_SYSTEM_PROMPT: &str = "Sei un revisore di email B2B. Correggi la bozza perche' \
rispetti i vincoli indicati, cambiando il minimo indispensabile. Output SOLO JSON valido con \
chiavi: subject, body.";

/// Build the user payload for the main generation call.
pub fn build_generation_payload(
    parent: &ParentProfile,
    company: &LeadCompany,
    contact: Option<&LeadContact>,
    dossier: &EnrichmentDossier,
    knowledge_snippets: &[String],
    variant_ids: &[&str],
    targets: &RewriteTargets,
) -> String {
    let rewrite_budgets: serde_json::Map<String, serde_json::Value> = variant_ids
        .iter()
        .map(|id| {
            let budget = targets.for_variant(id);
            (
                id.to_string(),
                json!({ "min_pct": (budget.min * 100.0).round(), "max_pct": (budget.max * 100.0).round() }),
            )
        })
        .collect();

    let payload = json!({
        "parent_profile": parent,
        "target_company": company,
        "target_contact": contact,
        "dossier": dossier,
        "retrieved_marketing_knowledge": knowledge_snippets,
        "seed_template": parent.outreach_seed_template,
        "constraints": {
            "language": "italiano",
            "tone": parent.tone,
            "variants_required": variant_ids,
            "rewrite_budget_pct": rewrite_budgets,
            "cta": parent.cta_policy,
            "subject_max_chars": SUBJECT_MAX_CHARS,
            "anti_spam": {
                "no_all_caps_words": true,
                "max_exclamation_marks": 1,
                "no_clickbait_subject": true,
            },
            "formatting": "paragrafi separati da riga vuota, niente muri di testo",
            "no_invented_facts": true,
            "no_absolute_claims": true,
            "no_ai_disclosure": true,
        },
    });
    payload.to_string()
}

/// Build the user payload for the repair sub-call: the failing pair, its
/// budget and the specific flags to clear.
pub fn build_repair_payload(
    seed_template: &str,
    subject: &str,
    body: &str,
    budget: RewriteBudget,
    flags: &[String],
) -> String {
    let payload = json!({
        "seed_template": seed_template,
        "draft": { "subject": subject, "body": body },
        "rewrite_budget_pct": {
            "min_pct": (budget.min * 100.0).round(),
            "max_pct": (budget.max * 100.0).round(),
        },
        "violations": flags,
        "instructions": "Correggi SOLO le violazioni elencate. Mantieni lingua, tono e contenuto.",
    });
    payload.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_profile;

    #[test]
    fn test_generation_payload_carries_constraint_block() {
        let parent = test_profile();
        let company = crate::leads::LeadCompany {
            company_key: "acme".to_string(),
            company_name: "Acme".to_string(),
            website: Some("https://acme.it".to_string()),
            linkedin_company: None,
            industry: None,
            employee_count: None,
            location: None,
            keywords: None,
            tech: None,
            founded_year: None,
            evidence: Vec::new(),
        };
        let dossier = EnrichmentDossier::default();

        let payload = build_generation_payload(
            &parent,
            &company,
            None,
            &dossier,
            &["snippet".to_string()],
            &["A", "B"],
            &RewriteTargets::default(),
        );
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["constraints"]["variants_required"], json!(["A", "B"]));
        assert_eq!(value["constraints"]["no_absolute_claims"], json!(true));
        assert!(value["constraints"]["rewrite_budget_pct"]["B"]["min_pct"].is_number());
        assert_eq!(value["seed_template"], json!(parent.outreach_seed_template));
    }

    #[test]
    fn test_repair_payload_names_violations() {
        let payload = build_repair_payload(
            "seed",
            "SUBJECT",
            "body",
            RewriteBudget { min: 0.25, max: 0.60 },
            &["spam_caps".to_string()],
        );
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["violations"], json!(["spam_caps"]));
        assert_eq!(value["rewrite_budget_pct"]["max_pct"], json!(60.0));
    }
}
