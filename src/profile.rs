//! Parent company profiles: the sender-side identity, offer catalog and
//! compliance constraints a campaign generates against.
//!
//! Profiles are authored as TOML files and registered into the store.

use crate::util::slugify;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const REQUIRED_KEYS: [&str; 9] = [
    "company_name",
    "tone",
    "offer_catalog",
    "icp",
    "proof_points",
    "objections",
    "cta_policy",
    "no_go_claims",
    "compliance_notes",
];

pub const DEFAULT_CTA_POLICY: &str = "call conoscitiva 20-30 min";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentProfile {
    #[serde(default)]
    pub slug: String,
    pub company_name: String,
    pub tone: String,
    pub offer_catalog: Vec<String>,
    pub icp: Vec<String>,
    pub proof_points: Vec<String>,
    pub objections: Vec<String>,
    pub cta_policy: String,
    pub no_go_claims: Vec<String>,
    pub compliance_notes: Vec<String>,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_company: String,
    #[serde(default)]
    pub sender_phone: String,
    #[serde(default)]
    pub booking_link: String,
    /// Canonical outreach email skeleton; the rewrite-budget baseline.
    #[serde(default)]
    pub outreach_seed_template: String,
}

/// Load and validate a profile from a TOML file.
pub fn load_parent_profile(path: &Path, slug_override: Option<&str>) -> Result<ParentProfile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile {}", path.display()))?;
    parse_parent_profile(&raw, slug_override)
        .with_context(|| format!("invalid profile {}", path.display()))
}

/// Parse and validate a profile from TOML text.
pub fn parse_parent_profile(raw: &str, slug_override: Option<&str>) -> Result<ParentProfile> {
    let value: toml::Value = toml::from_str(raw).context("profile is not valid TOML")?;
    let table = value
        .as_table()
        .context("profile must be a TOML table")?;

    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .filter(|key| !table.contains_key(**key))
        .copied()
        .collect();
    if !missing.is_empty() {
        bail!("missing required profile keys: {}", missing.join(", "));
    }

    let mut profile: ParentProfile = toml::from_str(raw).context("profile shape mismatch")?;

    let raw_slug = slug_override
        .map(str::to_string)
        .unwrap_or_else(|| profile.slug.clone());
    profile.slug = if raw_slug.trim().is_empty() {
        slugify(&profile.company_name)
    } else {
        slugify(&raw_slug)
    };
    if profile.cta_policy.trim().is_empty() {
        profile.cta_policy = DEFAULT_CTA_POLICY.to_string();
    }

    validate_parent_profile(&profile)?;
    Ok(profile)
}

fn validate_parent_profile(profile: &ParentProfile) -> Result<()> {
    if profile.company_name.trim().is_empty() {
        bail!("company_name cannot be empty");
    }
    if profile.tone.trim().is_empty() {
        bail!("tone cannot be empty");
    }
    if profile.offer_catalog.is_empty() {
        bail!("offer_catalog cannot be empty");
    }
    if profile.icp.is_empty() {
        bail!("icp cannot be empty");
    }
    if profile.cta_policy.trim().is_empty() {
        bail!("cta_policy cannot be empty");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_profile() -> ParentProfile {
    ParentProfile {
        slug: "azienda-a".to_string(),
        company_name: "Azienda A".to_string(),
        tone: "formale-consulenziale".to_string(),
        offer_catalog: vec!["Servizio 1".to_string()],
        icp: vec!["PMI manifatturiere".to_string()],
        proof_points: vec!["Case study".to_string()],
        objections: vec!["budget".to_string()],
        cta_policy: DEFAULT_CTA_POLICY.to_string(),
        no_go_claims: vec!["garantito".to_string()],
        compliance_notes: vec!["uso dati pubblici".to_string()],
        sender_name: "Ivan Lorenzoni".to_string(),
        sender_company: "Contributo Facile".to_string(),
        sender_phone: "+39 02 1234567".to_string(),
        booking_link: "https://cal.example.com/ivan".to_string(),
        outreach_seed_template: "Ciao {{first_name}},\n\nseguiamo aziende come {{company_name}} \
                                 e possiamo proporre un confronto operativo sulle vostre \
                                 priorita commerciali.\n\nSe utile, fissiamo una call: \
                                 {{booking_link}}\n\nCordiali saluti,\n{{sender_name}} - \
                                 {{sender_company}} ({{sender_phone}})"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_TOML: &str = r#"
company_name = "Azienda A"
tone = "formale-consulenziale"
offer_catalog = ["Servizio 1"]
icp = ["PMI"]
proof_points = ["case"]
objections = ["budget"]
cta_policy = "call conoscitiva 20-30 min"
no_go_claims = ["garantito"]
compliance_notes = ["dati pubblici"]
sender_name = "Ivan"
sender_company = "Contributo Facile"
outreach_seed_template = "Ciao {{first_name}}, proposta per {{company_name}}."
"#;

    #[test]
    fn test_parse_valid_profile() {
        let profile = parse_parent_profile(PROFILE_TOML, None).unwrap();
        assert_eq!(profile.slug, "azienda-a");
        assert_eq!(profile.sender_name, "Ivan");
        assert!(profile.outreach_seed_template.contains("{{company_name}}"));
    }

    #[test]
    fn test_slug_override_wins() {
        let profile = parse_parent_profile(PROFILE_TOML, Some("Custom Slug")).unwrap();
        assert_eq!(profile.slug, "custom-slug");
    }

    #[test]
    fn test_missing_required_keys_rejected() {
        let err = parse_parent_profile("company_name = \"X\"", None).unwrap_err();
        assert!(err.to_string().contains("missing required profile keys"));
    }

    #[test]
    fn test_empty_icp_rejected() {
        let raw = PROFILE_TOML.replace("icp = [\"PMI\"]", "icp = []");
        assert!(parse_parent_profile(&raw, None).is_err());
    }
}
