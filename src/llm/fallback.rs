//! Deterministic fallback rendering of the seed template.
//!
//! No network: placeholders are substituted, up to three fixed textual
//! variants are derived, and each one goes through the same claim guard and
//! quality gate as service output. This keeps the pipeline able to produce
//! valid drafts with zero external dependencies available.

use super::DraftEmailVariant;
use crate::guard::apply_claim_guard;
use crate::leads::{LeadCompany, LeadContact};
use crate::profile::ParentProfile;
use crate::quality::{self, RewriteTargets};
use std::collections::BTreeSet;

/// Conservative confidence for the verbatim render.
const CONFIDENCE_PRIMARY: f64 = 0.62;
/// Conservative confidence for the derived variants.
const CONFIDENCE_SECONDARY: f64 = 0.58;

/// Skeleton used when the parent profile carries no seed template.
const DEFAULT_SEED_TEMPLATE: &str = "Ciao {{first_name}},\n\nseguiamo aziende come \
{{company_name}} e vediamo spesso margini concreti su priorita commerciali ed execution \
operativa.\n\nSe utile, possiamo confrontarci in una call conoscitiva di 20-30 minuti: \
{{booking_link}}\n\nCordiali saluti,\n{{sender_name}} - {{sender_company}} ({{sender_phone}})";

/// Substitute the fixed placeholder tokens into `template`.
pub fn render_seed_template(
    template: &str,
    parent: &ParentProfile,
    company: &LeadCompany,
    contact: Option<&LeadContact>,
) -> String {
    let first_name = contact
        .map(|c| c.full_name.split_whitespace().next().unwrap_or("").to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Team".to_string());

    template
        .replace("{{first_name}}", &first_name)
        .replace("{{company_name}}", &company.company_name)
        .replace("{{sender_name}}", &parent.sender_name)
        .replace("{{sender_company}}", &parent.sender_company)
        .replace("{{sender_phone}}", &parent.sender_phone)
        .replace("{{booking_link}}", &parent.booking_link)
}

/// Render the requested variant ids from the seed template.
///
/// Returns the variants (sorted by id), the recommended id and the union of
/// their risk flags.
pub fn render_fallback_variants(
    parent: &ParentProfile,
    company: &LeadCompany,
    contact: Option<&LeadContact>,
    variant_ids: &[&str],
    targets: &RewriteTargets,
) -> (Vec<DraftEmailVariant>, String, Vec<String>) {
    let template = if parent.outreach_seed_template.trim().is_empty() {
        DEFAULT_SEED_TEMPLATE
    } else {
        parent.outreach_seed_template.as_str()
    };
    let base = render_seed_template(template, parent, company, contact);

    let mut variants = Vec::new();
    let mut global_flags: BTreeSet<String> = BTreeSet::new();

    for id in variant_ids {
        let (subject, body) = match *id {
            "B" => (
                format!("Idea concreta per {}", company.company_name),
                formality_shift(&base),
            ),
            "C" => (
                format!("Proposta di allineamento: {}", company.company_name),
                format!(
                    "Le scrivo sulla base di informazioni pubbliche disponibili su {}.\n\n{}",
                    company.company_name, base
                ),
            ),
            _ => (format!("Confronto operativo per {}", company.company_name), base.clone()),
        };

        let guarded = apply_claim_guard(
            &format!("{}\n\n{}", subject, body),
            &parent.no_go_claims,
        );
        let (subject, body) = match guarded.text.split_once("\n\n") {
            Some((subject_part, body_part)) => {
                (subject_part.trim().to_string(), body_part.trim().to_string())
            }
            None => (subject, guarded.text),
        };

        let mut flags: BTreeSet<String> = guarded.flags.into_iter().collect();
        flags.extend(quality::check(&subject, &body, id, template, targets));
        global_flags.extend(flags.iter().cloned());

        variants.push(DraftEmailVariant {
            variant: (*id).to_string(),
            subject,
            body,
            cta: parent.cta_policy.clone(),
            risk_flags: flags.into_iter().collect(),
            confidence: if *id == "A" { CONFIDENCE_PRIMARY } else { CONFIDENCE_SECONDARY },
        });
    }

    variants.sort_by(|a, b| a.variant.cmp(&b.variant));
    let recommended = variants
        .first()
        .map(|v| v.variant.clone())
        .unwrap_or_else(|| "A".to_string());
    (variants, recommended, global_flags.into_iter().collect())
}

fn formality_shift(body: &str) -> String {
    body.replace("Ciao", "Buongiorno")
        .replace("Se utile", "Se di interesse")
        .replace("possiamo confrontarci", "potremmo confrontarci")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_profile;

    fn company() -> LeadCompany {
        LeadCompany {
            company_key: "beta-srl".to_string(),
            company_name: "Beta SRL".to_string(),
            website: None,
            linkedin_company: None,
            industry: None,
            employee_count: None,
            location: None,
            keywords: None,
            tech: None,
            founded_year: None,
            evidence: Vec::new(),
        }
    }

    fn contact() -> LeadContact {
        LeadContact {
            full_name: "Anna Verdi".to_string(),
            title: Some("Founder".to_string()),
            seniority: None,
            email: Some("anna@example.com".to_string()),
            linkedin_person: None,
            quality_flag: None,
            score: 50.0,
            is_primary_contact: true,
        }
    }

    #[test]
    fn test_render_substitutes_all_placeholders() {
        let parent = test_profile();
        let rendered = render_seed_template(
            &parent.outreach_seed_template,
            &parent,
            &company(),
            Some(&contact()),
        );
        assert!(rendered.contains("Ciao Anna"));
        assert!(rendered.contains("Beta SRL"));
        assert!(rendered.contains("Ivan Lorenzoni"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn test_renders_requested_variants_sorted() {
        let parent = test_profile();
        let (variants, recommended, _) = render_fallback_variants(
            &parent,
            &company(),
            Some(&contact()),
            &["C", "A", "B"],
            &RewriteTargets::default(),
        );
        let ids: Vec<&str> = variants.iter().map(|v| v.variant.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(recommended, "A");
        assert!(variants.iter().all(|v| !v.subject.is_empty() && !v.body.is_empty()));
        assert!((variants[0].confidence - 0.62).abs() < f64::EPSILON);
        assert!((variants[1].confidence - 0.58).abs() < f64::EPSILON);
    }

    #[test]
    fn test_variant_b_shifts_formality() {
        let parent = test_profile();
        let (variants, _, _) = render_fallback_variants(
            &parent,
            &company(),
            Some(&contact()),
            &["A", "B"],
            &RewriteTargets::default(),
        );
        assert!(variants[0].body.starts_with("Ciao"));
        assert!(variants[1].body.starts_with("Buongiorno"));
    }

    #[test]
    fn test_output_respects_claim_guard() {
        let mut parent = test_profile();
        parent.outreach_seed_template =
            "Ciao {{first_name}}, risultato garantito per {{company_name}}.".to_string();
        let (variants, _, flags) = render_fallback_variants(
            &parent,
            &company(),
            Some(&contact()),
            &["A"],
            &RewriteTargets::default(),
        );
        // "garantito" is both a fixed pattern and a profile no-go claim.
        assert!(flags.iter().any(|f| f == "claim_guaranteed"));
        assert!(variants[0].body.contains(crate::guard::REDACTION_MARKER));
        assert!(!variants[0].body.to_lowercase().contains("garantito"));
    }

    #[test]
    fn test_deterministic_output() {
        let parent = test_profile();
        let first = render_fallback_variants(
            &parent,
            &company(),
            Some(&contact()),
            &["A", "B"],
            &RewriteTargets::default(),
        );
        let second = render_fallback_variants(
            &parent,
            &company(),
            Some(&contact()),
            &["A", "B"],
            &RewriteTargets::default(),
        );
        assert_eq!(first.0.len(), second.0.len());
        for (a, b) in first.0.iter().zip(second.0.iter()) {
            assert_eq!(a.subject, b.subject);
            assert_eq!(a.body, b.body);
            assert_eq!(a.risk_flags, b.risk_flags);
        }
    }
}
