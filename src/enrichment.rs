//! Enrichment: builds the evidence dossier generation works from.
//!
//! Two intensities: `minimal` derives everything from the CSV row, `web`
//! additionally fetches the company homepage (plus a few informative
//! subpages) over plain HTTP. Web enrichment never fails the item — any
//! fetch problem degrades silently into the minimal dossier with an
//! evidence note.

use crate::leads::{LeadCompany, LeadContact};
use crate::util::{collapse_ws, compact_lines};
use anyhow::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

const SITE_SUMMARY_EXCERPT: usize = 1200;
const SITE_SUMMARY_MAX: usize = 2500;
const EXTRA_PAGE_EXCERPT: usize = 500;
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentMode {
    Minimal,
    Web,
}

/// Resolve the requested enrichment mode against the recipient mode.
///
/// `auto` keeps row-mode campaigns cheap (minimal) and gives company-mode
/// campaigns the web tier.
pub fn resolve_enrichment_mode(recipient_mode: &str, requested: &str) -> Result<EnrichmentMode> {
    match requested.to_lowercase().as_str() {
        "auto" => Ok(if recipient_mode == "row" {
            EnrichmentMode::Minimal
        } else {
            EnrichmentMode::Web
        }),
        "minimal" => Ok(EnrichmentMode::Minimal),
        "web" => Ok(EnrichmentMode::Web),
        other => bail!("enrichment_mode must be one of: auto, minimal, web (got {other})"),
    }
}

/// Free-text evidence bundle about a target company. Read-only input to
/// generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentDossier {
    pub site_summary: String,
    pub linkedin_public_summary: String,
    pub pain_hypotheses: Vec<String>,
    pub opportunity_hypotheses: Vec<String>,
    pub evidence: Vec<String>,
    pub sources: Vec<String>,
}

/// Dossier derived purely from the CSV row.
pub fn minimal_dossier(company: &LeadCompany, contact: Option<&LeadContact>) -> EnrichmentDossier {
    let mut evidence = vec![format!(
        "Dossier minimale generato da CSV per {}.",
        company.company_name
    )];
    evidence.extend(company_evidence(company));

    EnrichmentDossier {
        site_summary: String::new(),
        linkedin_public_summary: linkedin_summary(company, contact),
        pain_hypotheses: compact_lines(infer_pains(company), 5),
        opportunity_hypotheses: compact_lines(infer_opportunities(company), 5),
        evidence: compact_lines(evidence, 12),
        sources: vec!["csv://lead-row".to_string()],
    }
}

/// Build the dossier, fetching the company site when in web mode.
///
/// Returns the dossier plus the website that was actually used, if any.
pub async fn build_enrichment_dossier(
    client: &reqwest::Client,
    company: &LeadCompany,
    contact: Option<&LeadContact>,
    mode: EnrichmentMode,
    max_extra_pages: usize,
) -> (EnrichmentDossier, Option<String>) {
    if mode == EnrichmentMode::Minimal || company.website.is_none() {
        let mut dossier = minimal_dossier(company, contact);
        if mode == EnrichmentMode::Web && company.website.is_none() {
            dossier.evidence.push("Nessun sito disponibile per enrichment web".to_string());
            dossier.sources.clear();
        }
        let website = company.website.clone();
        return (dossier, website);
    }

    let website = company.website.clone().unwrap_or_default();
    let mut site_summary = String::new();
    let mut evidence: Vec<String> = Vec::new();
    let mut sources: Vec<String> = Vec::new();

    match fetch_page(client, &website).await {
        Ok(page) => {
            site_summary = page.text.chars().take(SITE_SUMMARY_EXCERPT).collect();
            sources.push(website.clone());
            if !page.title.is_empty() {
                evidence.push(format!("Homepage title: {}", page.title));
            }

            let extra_urls = pick_informative_links(&page.links, &website, max_extra_pages);
            for extra_url in extra_urls {
                match fetch_page(client, &extra_url).await {
                    Ok(extra) => {
                        sources.push(extra_url.clone());
                        if !extra.title.is_empty() {
                            evidence.push(format!("Pagina rilevata: {}", extra.title));
                        }
                        if site_summary.chars().count() < SITE_SUMMARY_MAX - EXTRA_PAGE_EXCERPT {
                            site_summary.push('\n');
                            site_summary
                                .extend(extra.text.chars().take(EXTRA_PAGE_EXCERPT));
                        }
                    }
                    Err(error) => {
                        tracing::debug!(url = %extra_url, %error, "extra page fetch failed");
                    }
                }
            }
        }
        Err(error) => {
            tracing::warn!(url = %website, %error, "website fetch failed, degrading dossier");
            evidence.push("Sito non analizzabile in modo completo".to_string());
        }
    }

    evidence.push(linkedin_summary(company, contact));
    evidence.extend(company_evidence(company));

    let dossier = EnrichmentDossier {
        site_summary: collapse_ws(&site_summary).chars().take(SITE_SUMMARY_MAX).collect(),
        linkedin_public_summary: linkedin_summary(company, contact),
        pain_hypotheses: compact_lines(infer_pains(company), 5),
        opportunity_hypotheses: compact_lines(infer_opportunities(company), 5),
        evidence: compact_lines(evidence, 12),
        sources: compact_lines(sources, 15),
    };
    (dossier, Some(website))
}

struct PageSnapshot {
    title: String,
    text: String,
    links: Vec<String>,
}

async fn fetch_page(client: &reqwest::Client, url: &str) -> Result<PageSnapshot> {
    let response = client.get(url).timeout(FETCH_TIMEOUT).send().await?;
    let html = response.error_for_status()?.text().await?;
    Ok(parse_html(&html))
}

fn title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static pattern"))
}

fn href_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#).expect("static pattern"))
}

fn noise_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
            .expect("static pattern")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]+>").expect("static pattern"))
}

fn parse_html(html: &str) -> PageSnapshot {
    let title = title_pattern()
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|m| collapse_ws(m.as_str()))
        .unwrap_or_default();

    let links: Vec<String> = href_pattern()
        .captures_iter(html)
        .filter_map(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .collect();

    let without_noise = noise_pattern().replace_all(html, " ");
    let text = collapse_ws(&tag_pattern().replace_all(&without_noise, " "));

    PageSnapshot { title, text, links }
}

fn pick_informative_links(links: &[String], base_url: &str, limit: usize) -> Vec<String> {
    if links.is_empty() || limit == 0 {
        return Vec::new();
    }
    let host = url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase().replace("www.", "")))
        .unwrap_or_default();
    let keywords = [
        "about",
        "chi-siamo",
        "azienda",
        "sostenibilita",
        "sustainability",
        "servizi",
        "solutions",
        "news",
    ];

    let mut picked: Vec<String> = Vec::new();
    for link in links {
        let absolute = match url::Url::parse(link) {
            Ok(parsed) => {
                let link_host =
                    parsed.host_str().map(|h| h.to_lowercase().replace("www.", ""));
                if let (Some(link_host), false) = (link_host, host.is_empty()) {
                    if link_host != host {
                        continue;
                    }
                }
                link.clone()
            }
            // Relative link: resolve against the base.
            Err(_) => match url::Url::parse(base_url).and_then(|base| base.join(link)) {
                Ok(joined) => joined.to_string(),
                Err(_) => continue,
            },
        };
        let lower = absolute.to_lowercase();
        if !keywords.iter().any(|token| lower.contains(token)) {
            continue;
        }
        if !picked.contains(&absolute) {
            picked.push(absolute);
        }
        if picked.len() >= limit {
            break;
        }
    }
    picked
}

fn linkedin_summary(company: &LeadCompany, contact: Option<&LeadContact>) -> String {
    let mut items = Vec::new();
    if let Some(link) = &company.linkedin_company {
        items.push(format!("LinkedIn aziendale disponibile: {}", link));
    }
    if let Some(link) = contact.and_then(|c| c.linkedin_person.as_ref()) {
        items.push(format!("LinkedIn referente disponibile: {}", link));
    }
    if items.is_empty() {
        "Nessun profilo LinkedIn pubblico disponibile nel dataset.".to_string()
    } else {
        items.join(" ")
    }
}

fn infer_pains(company: &LeadCompany) -> Vec<String> {
    let keywords = company.keywords.as_deref().unwrap_or("").to_lowercase();
    let industry = company.industry.as_deref().unwrap_or("").to_lowercase();
    let mut out = Vec::new();

    if keywords.contains("manufacturing") || industry.contains("machinery") {
        out.push("possibile pressione su efficienza operativa e continuita produttiva".to_string());
    }
    if keywords.contains("quality") || keywords.contains("iso") {
        out.push("necessita di presidiare standard qualita e compliance".to_string());
    }
    if keywords.contains("automation") || keywords.contains("iot") {
        out.push("integrazione tra sistemi digitali e processi legacy".to_string());
    }
    if keywords.contains("food") || keywords.contains("pharma") {
        out.push("tracciabilita e requisiti normativi stringenti".to_string());
    }

    if out.is_empty() {
        out.push("allineamento tra priorita commerciali e execution operativa".to_string());
    }
    out
}

fn infer_opportunities(company: &LeadCompany) -> Vec<String> {
    let keywords = company.keywords.as_deref().unwrap_or("").to_lowercase();
    let mut out = Vec::new();

    if keywords.contains("sustainability") || keywords.contains("esg") {
        out.push("valorizzare iniziative ESG con messaggi commerciali misurabili".to_string());
    }
    if keywords.contains("innovation") || keywords.contains("high-tech") {
        out.push("accelerare time-to-market su offerte ad alto valore".to_string());
    }
    if keywords.contains("b2b") {
        out.push("migliorare posizionamento e conversione su pipeline enterprise".to_string());
    }

    out.push("definire quick win con impatto commerciale tracciabile".to_string());
    out
}

fn company_evidence(company: &LeadCompany) -> Vec<String> {
    let mut items = Vec::new();
    if let Some(industry) = &company.industry {
        items.push(format!("Industry: {}", industry));
    }
    if let Some(count) = company.employee_count {
        items.push(format!("Employee count stimato: {}", count));
    }
    if let Some(location) = &company.location {
        items.push(format!("Location: {}", location));
    }
    if let Some(year) = company.founded_year {
        items.push(format!("Founded year: {}", year));
    }
    items.extend(company.evidence.clone());
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(keywords: &str) -> LeadCompany {
        LeadCompany {
            company_key: "acme".to_string(),
            company_name: "Acme".to_string(),
            website: Some("https://acme.it".to_string()),
            linkedin_company: None,
            industry: Some("machinery".to_string()),
            employee_count: Some(50),
            location: Some("Bergamo, Lombardy, Italy".to_string()),
            keywords: Some(keywords.to_string()),
            tech: None,
            founded_year: Some(1999),
            evidence: Vec::new(),
        }
    }

    #[test]
    fn test_minimal_dossier_is_always_valid() {
        let dossier = minimal_dossier(&company("automation, b2b"), None);
        assert!(!dossier.pain_hypotheses.is_empty());
        assert!(!dossier.opportunity_hypotheses.is_empty());
        assert_eq!(dossier.sources, vec!["csv://lead-row".to_string()]);
        assert!(dossier.evidence[0].contains("Acme"));
    }

    #[test]
    fn test_infer_pains_reads_signals() {
        let pains = infer_pains(&company("automation, quality"));
        assert!(pains.iter().any(|p| p.contains("qualita")));
        assert!(pains.iter().any(|p| p.contains("sistemi digitali")));

        // Industry "machinery" alone still yields the efficiency hypothesis.
        let generic = infer_pains(&company(""));
        assert_eq!(generic.len(), 1);
        assert!(generic[0].contains("efficienza operativa"));
    }

    #[test]
    fn test_mode_resolution() {
        assert_eq!(resolve_enrichment_mode("row", "auto").unwrap(), EnrichmentMode::Minimal);
        assert_eq!(resolve_enrichment_mode("company", "auto").unwrap(), EnrichmentMode::Web);
        assert_eq!(resolve_enrichment_mode("row", "web").unwrap(), EnrichmentMode::Web);
        assert!(resolve_enrichment_mode("row", "hybrid").is_err());
    }

    #[test]
    fn test_pick_informative_links_same_host_keyword_only() {
        let links = vec![
            "https://acme.it/servizi".to_string(),
            "https://other.it/servizi".to_string(),
            "/chi-siamo".to_string(),
            "https://acme.it/contatti".to_string(),
        ];
        let picked = pick_informative_links(&links, "https://acme.it", 3);
        assert_eq!(
            picked,
            vec![
                "https://acme.it/servizi".to_string(),
                "https://acme.it/chi-siamo".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_html_strips_noise() {
        let html = "<html><head><title>Acme  SpA</title><script>var x=1;</script></head>\
                    <body><p>Benvenuti in <b>Acme</b></p><a href=\"/servizi\">servizi</a></body></html>";
        let page = parse_html(html);
        assert_eq!(page.title, "Acme SpA");
        assert!(page.text.contains("Benvenuti in Acme"));
        assert!(!page.text.contains("var x"));
        assert_eq!(page.links, vec!["/servizi".to_string()]);
    }
}
