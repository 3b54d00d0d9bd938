//! Leads ingestion: CSV reading, header-alias canonicalization, preflight
//! validation, company grouping and contact scoring.
//!
//! Rows are kept twice: the raw row (for export round-trip) and the
//! canonicalized row the engine works on. A row missing required fields is
//! marked invalid here and never reaches generation.

use crate::util::slugify;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use url::Url;

pub type Row = HashMap<String, String>;

/// Canonical header names and the aliases they absorb.
const CANONICAL_HEADER_ALIASES: [(&str, &[&str]); 22] = [
    ("First Name", &["First Name", "firstName", "firstname", "first_name"]),
    ("Last Name", &["Last Name", "lastName", "lastname", "last_name"]),
    ("Full Name", &["Full Name", "fullName", "fullname", "full_name"]),
    ("Title", &["Title", "jobTitle", "job_title", "role"]),
    ("Headline", &["Headline", "headline"]),
    ("Seniority", &["Seniority", "seniority"]),
    ("Email", &["Email", "email", "Email Address", "emailAddress"]),
    ("LinkedIn Link", &["LinkedIn Link", "linkedIn", "linkedin", "linkedin_link"]),
    ("Lead City", &["Lead City", "Company City", "city", "location"]),
    ("Lead State", &["Lead State", "Company State", "state", "province", "region"]),
    ("Lead Country", &["Lead Country", "Company Country", "country"]),
    ("Company Name", &["Company Name", "companyName", "company_name"]),
    ("Industry", &["Industry", "industry"]),
    ("Employee Count", &["Employee Count", "employees", "employeeCount", "employee_count"]),
    ("Cleaned Company Name", &["Cleaned Company Name", "cleanedCompanyName", "companyName"]),
    (
        "MillionVerifier Status",
        &["MillionVerifier Status", "Verification Status", "verificationStatus"],
    ),
    (
        "Company Website Full",
        &["Company Website Full", "website", "Website", "companyWebsite"],
    ),
    (
        "Company LinkedIn Link",
        &["Company LinkedIn Link", "companyLinkedIn", "company_linkedin"],
    ),
    ("Company Keywords", &["Company Keywords", "keywords", "companyKeywords"]),
    (
        "Company Technologies",
        &["Company Technologies", "technologies", "companyTechnologies"],
    ),
    (
        "Company Short Description",
        &["Company Short Description", "description", "Company Description"],
    ),
    ("Company Founded Year", &["Company Founded Year", "founded", "foundedYear"]),
];

/// A missing website does not invalidate a row: those rows go through the
/// deterministic template renderer instead of the service.
pub const DEFAULT_REQUIRED_FIELDS: [&str; 3] = ["Email", "First Name", "Company Name"];

#[derive(Debug, Clone)]
pub struct LeadCsvReadResult {
    pub rows: Vec<Row>,
    pub raw_rows: Vec<Row>,
    pub input_columns: Vec<String>,
    /// canonical name -> source header actually present in the file
    pub header_mapping: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct LeadPreflightRow {
    pub row_index: usize,
    pub row: Row,
    pub raw_row: Row,
    pub missing_required: Vec<String>,
    pub is_valid: bool,
}

#[derive(Debug, Clone)]
pub struct LeadPreflightResult {
    pub rows_total: usize,
    pub rows_valid: usize,
    pub rows_skipped: usize,
    pub required_fields: Vec<String>,
    pub rows: Vec<LeadPreflightRow>,
    pub input_columns: Vec<String>,
    pub header_mapping: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadCompany {
    pub company_key: String,
    pub company_name: String,
    pub website: Option<String>,
    pub linkedin_company: Option<String>,
    pub industry: Option<String>,
    pub employee_count: Option<u32>,
    pub location: Option<String>,
    pub keywords: Option<String>,
    pub tech: Option<String>,
    pub founded_year: Option<u32>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadContact {
    pub full_name: String,
    pub title: Option<String>,
    pub seniority: Option<String>,
    pub email: Option<String>,
    pub linkedin_person: Option<String>,
    pub quality_flag: Option<String>,
    pub score: f64,
    #[serde(default)]
    pub is_primary_contact: bool,
}

/// Read a leads CSV, producing raw rows, canonicalized rows and the header
/// mapping that was applied.
pub fn read_leads_csv_detailed(path: &Path) -> Result<LeadCsvReadResult> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open leads CSV {}", path.display()))?;

    let input_columns: Vec<String> = reader
        .headers()
        .context("leads CSV has no header row")?
        .iter()
        .map(|column| column.trim_start_matches('\u{feff}').to_string())
        .filter(|column| !column.is_empty())
        .collect();

    let normalized_to_original: HashMap<String, String> = input_columns
        .iter()
        .map(|column| (normalize_key(column), column.clone()))
        .collect();

    let mut header_mapping = Vec::new();
    for (canonical, aliases) in CANONICAL_HEADER_ALIASES {
        for alias in aliases {
            if let Some(hit) = normalized_to_original.get(&normalize_key(alias)) {
                header_mapping.push((canonical.to_string(), hit.clone()));
                break;
            }
        }
    }

    let mut raw_rows = Vec::new();
    let mut canonical_rows = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to read leads CSV row")?;
        let mut normalized_raw: Row = Row::new();
        for (column, value) in input_columns.iter().zip(record.iter()) {
            normalized_raw.insert(column.clone(), value.trim().to_string());
        }
        canonical_rows.push(canonicalize_row(&normalized_raw));
        raw_rows.push(normalized_raw);
    }

    Ok(LeadCsvReadResult {
        rows: canonical_rows,
        raw_rows,
        input_columns,
        header_mapping,
    })
}

/// Validate canonicalized rows against the required-field set.
pub fn preflight_leads(data: &LeadCsvReadResult) -> LeadPreflightResult {
    let required_fields: Vec<String> =
        DEFAULT_REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect();
    let mut rows = Vec::new();
    let mut rows_valid = 0;
    let mut rows_skipped = 0;

    for (index, row) in data.rows.iter().enumerate() {
        let missing: Vec<String> = required_fields
            .iter()
            .filter(|field| row.get(*field).map(|v| v.trim().is_empty()).unwrap_or(true))
            .cloned()
            .collect();
        let is_valid = missing.is_empty();
        if is_valid {
            rows_valid += 1;
        } else {
            rows_skipped += 1;
        }
        rows.push(LeadPreflightRow {
            row_index: index + 1,
            row: row.clone(),
            raw_row: data.raw_rows.get(index).cloned().unwrap_or_default(),
            missing_required: missing,
            is_valid,
        });
    }

    LeadPreflightResult {
        rows_total: rows.len(),
        rows_valid,
        rows_skipped,
        required_fields,
        rows,
        input_columns: data.input_columns.clone(),
        header_mapping: data.header_mapping.clone(),
    }
}

pub fn format_header_mapping(mapping: &[(String, String)]) -> String {
    if mapping.is_empty() {
        return "nessuna corrispondenza header rilevata".to_string();
    }
    let mut sorted: Vec<&(String, String)> = mapping.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(canonical, source)| format!("{} <- {}", canonical, source))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Group rows by normalized company key, preserving first-seen order.
pub fn group_rows_by_company(rows: &[Row]) -> Vec<(String, Vec<Row>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
    for row in rows {
        let key = company_key(row);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(row.clone());
    }
    order
        .into_iter()
        .map(|key| {
            let rows = groups.remove(&key).unwrap_or_default();
            (key, rows)
        })
        .collect()
}

/// Build the company plus one contact per row of a company group.
pub fn build_company_and_contacts(company_rows: &[Row]) -> (LeadCompany, Vec<LeadContact>) {
    let first = company_rows.first().cloned().unwrap_or_default();
    let company = LeadCompany {
        company_key: company_key(&first),
        company_name: first_non_empty(&first, &["Company Name", "Cleaned Company Name"])
            .unwrap_or_else(|| "Azienda".to_string()),
        website: clean_url(first.get("Company Website Full")),
        linkedin_company: clean_url(first.get("Company LinkedIn Link")),
        industry: empty_to_none(first.get("Industry")),
        employee_count: parse_int(first.get("Employee Count")),
        location: build_location(&first),
        keywords: empty_to_none(first.get("Company Keywords")),
        tech: empty_to_none(first.get("Company Technologies")),
        founded_year: parse_int(first.get("Company Founded Year")),
        evidence: compact_company_evidence(&first),
    };

    let contacts = company_rows.iter().map(build_contact).collect();
    (company, contacts)
}

pub fn build_contact(row: &Row) -> LeadContact {
    let full_name = first_non_empty(row, &["Full Name"]).unwrap_or_else(|| {
        format!(
            "{} {}",
            row.get("First Name").map(|s| s.trim()).unwrap_or(""),
            row.get("Last Name").map(|s| s.trim()).unwrap_or("")
        )
        .trim()
        .to_string()
    });
    let title = empty_to_none(row.get("Title"));
    let seniority = empty_to_none(row.get("Seniority"));
    let quality_flag = empty_to_none(row.get("MillionVerifier Status"));
    let score = contact_score(seniority.as_deref(), title.as_deref(), quality_flag.as_deref(), row);

    LeadContact {
        full_name: if full_name.is_empty() { "Contatto".to_string() } else { full_name },
        title,
        seniority,
        email: empty_to_none(row.get("Email")),
        linkedin_person: clean_url(row.get("LinkedIn Link")),
        quality_flag,
        score,
        is_primary_contact: false,
    }
}

/// Mark and return the highest-scoring contact.
pub fn select_primary_contact(contacts: &mut [LeadContact]) -> Option<LeadContact> {
    if contacts.is_empty() {
        return None;
    }
    let mut best = 0;
    for (index, contact) in contacts.iter().enumerate() {
        if contact.score > contacts[best].score {
            best = index;
        }
    }
    for (index, contact) in contacts.iter_mut().enumerate() {
        contact.is_primary_contact = index == best;
    }
    Some(contacts[best].clone())
}

fn canonicalize_row(row: &Row) -> Row {
    let normalized_items: HashMap<String, &String> =
        row.iter().map(|(key, value)| (normalize_key(key), value)).collect();

    let mut canonical = Row::new();
    for (target, aliases) in CANONICAL_HEADER_ALIASES {
        let mut value = String::new();
        for alias in aliases {
            if let Some(hit) = normalized_items.get(&normalize_key(alias)) {
                if !hit.trim().is_empty() {
                    value = hit.trim().to_string();
                    break;
                }
            }
        }
        canonical.insert(target.to_string(), value);
    }

    let company_name = canonical.get("Company Name").cloned().unwrap_or_default();
    let cleaned_name = canonical.get("Cleaned Company Name").cloned().unwrap_or_default();
    if company_name.is_empty() && !cleaned_name.is_empty() {
        canonical.insert("Company Name".to_string(), cleaned_name.clone());
    }
    if cleaned_name.is_empty() && !company_name.is_empty() {
        canonical.insert("Cleaned Company Name".to_string(), company_name);
    }

    if canonical.get("Full Name").map(|v| v.is_empty()).unwrap_or(true) {
        let full = format!(
            "{} {}",
            canonical.get("First Name").map(String::as_str).unwrap_or(""),
            canonical.get("Last Name").map(String::as_str).unwrap_or("")
        )
        .trim()
        .to_string();
        canonical.insert("Full Name".to_string(), full);
    }

    if matches!(
        canonical.get("Lead City").map(String::as_str),
        Some("0") | Some("-") | Some("n/a") | Some("N/A")
    ) {
        canonical.insert("Lead City".to_string(), String::new());
    }

    canonical
}

fn normalize_key(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn company_key(row: &Row) -> String {
    if let Some(cleaned) = empty_to_none(row.get("Cleaned Company Name")) {
        return slugify(&cleaned);
    }
    if let Some(website) = clean_url(row.get("Company Website Full")) {
        if let Ok(parsed) = Url::parse(&website) {
            if let Some(host) = parsed.host_str() {
                let host = host.to_lowercase().replace("www.", "");
                if !host.is_empty() {
                    return slugify(&host);
                }
            }
        }
    }
    let fallback = empty_to_none(row.get("Company Name")).unwrap_or_else(|| "azienda".to_string());
    slugify(&fallback)
}

/// Keep a URL only if it parses with an http(s) scheme.
pub fn clean_url(value: Option<&String>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    let parsed = Url::parse(value).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    Some(value.to_string())
}

fn build_location(row: &Row) -> Option<String> {
    let parts: Vec<String> = ["Lead City", "Lead State", "Lead Country"]
        .iter()
        .filter_map(|key| empty_to_none(row.get(*key)))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn parse_int(value: Option<&String>) -> Option<u32> {
    let digits: String = value?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn first_non_empty(row: &Row, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| empty_to_none(row.get(*key)))
}

fn empty_to_none(value: Option<&String>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn compact_company_evidence(row: &Row) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(description) = empty_to_none(row.get("Company Short Description")) {
        out.push(description.chars().take(300).collect());
    }
    if empty_to_none(row.get("Company Keywords")).is_some() {
        out.push("Keywords disponibili".to_string());
    }
    if empty_to_none(row.get("Company Technologies")).is_some() {
        out.push("Stack tecnologico disponibile".to_string());
    }
    out
}

fn contact_score(
    seniority: Option<&str>,
    title: Option<&str>,
    quality_flag: Option<&str>,
    row: &Row,
) -> f64 {
    let mut score = 0.0;

    if let Some(seniority) = seniority {
        score += match seniority.to_lowercase().as_str() {
            "c_suite" => 50.0,
            "founder" => 45.0,
            "owner" => 42.0,
            "executive" => 38.0,
            "director" => 34.0,
            "manager" => 28.0,
            "mid" => 16.0,
            "entry" => 10.0,
            _ => 12.0,
        };
    }

    let title_l = title.unwrap_or("").to_lowercase();
    let title_boosts: [(&str, f64); 7] = [
        ("chief executive officer", 20.0),
        ("amministratore delegato", 20.0),
        ("ceo", 20.0),
        ("founder", 18.0),
        ("general manager", 16.0),
        ("cfo", 14.0),
        ("owner", 13.0),
    ];
    for (token, boost) in title_boosts {
        if title_l.contains(token) {
            score += boost;
        }
    }

    match quality_flag.unwrap_or("").to_lowercase().as_str() {
        "good" => score += 10.0,
        "risky" => score -= 5.0,
        _ => {}
    }

    let completeness_keys = ["Email", "LinkedIn Link", "Headline", "Title", "Seniority"];
    let completeness = completeness_keys
        .iter()
        .filter(|key| empty_to_none(row.get(**key)).is_some())
        .count();
    score += completeness as f64 * 1.5;

    (score * 100.0).round() / 100.0
}
