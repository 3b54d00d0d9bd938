//! Export sinks: the approval CSV (full drafts) and the send-ready subset.
//!
//! Column order is contractual: reviewers key on it and the spreadsheet
//! import does too. Input columns are preserved ahead of the generated ones
//! so the export round-trips the original file.

use crate::campaign::CampaignSummary;
use crate::leads::Row;
use anyhow::{Context, Result};
use std::path::Path;

const APPROVAL_COLUMNS_AB: [&str; 23] = [
    "campaign_id",
    "parent_slug",
    "company_name",
    "contact_name",
    "contact_title",
    "contact_email",
    "variant_a_subject",
    "variant_a_body",
    "variant_b_subject",
    "variant_b_body",
    "recommended_variant",
    "final_subject",
    "final_body",
    "selected_variant",
    "generation_status",
    "generation_warning",
    "error_code",
    "evidence_summary",
    "risk_flags",
    "status",
    "reviewer_notes",
    "approved_variant",
    "updated_at",
];

const APPROVAL_COLUMNS_ABC: [&str; 25] = [
    "campaign_id",
    "parent_slug",
    "company_name",
    "contact_name",
    "contact_title",
    "contact_email",
    "variant_a_subject",
    "variant_a_body",
    "variant_b_subject",
    "variant_b_body",
    "variant_c_subject",
    "variant_c_body",
    "recommended_variant",
    "final_subject",
    "final_body",
    "selected_variant",
    "generation_status",
    "generation_warning",
    "error_code",
    "evidence_summary",
    "risk_flags",
    "status",
    "reviewer_notes",
    "approved_variant",
    "updated_at",
];

/// Reduced column set for the send-ready view.
const SEND_READY_COLUMNS: [&str; 8] = [
    "company_name",
    "contact_name",
    "contact_email",
    "selected_variant",
    "final_subject",
    "final_body",
    "generation_status",
    "status",
];

pub fn approval_columns(output_schema: &str) -> Vec<String> {
    let columns: &[&str] = if output_schema.eq_ignore_ascii_case("abc") {
        &APPROVAL_COLUMNS_ABC
    } else {
        &APPROVAL_COLUMNS_AB
    };
    columns.iter().map(|column| column.to_string()).collect()
}

/// Input columns first, generated columns appended, duplicates dropped.
pub fn merge_columns(input_columns: &[String], generated_columns: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for column in input_columns.iter().chain(generated_columns.iter()) {
        if !out.contains(column) {
            out.push(column.clone());
        }
    }
    out
}

/// Resolve an `auto` export schema from the persisted summary.
pub fn resolve_export_schema(requested: &str, summary: Option<&CampaignSummary>) -> String {
    let mode = requested.to_lowercase();
    if mode == "ab" || mode == "abc" {
        return mode;
    }
    if let Some(summary) = summary {
        let recorded = summary.output_schema.to_lowercase();
        if recorded == "ab" || recorded == "abc" {
            return recorded;
        }
    }
    "ab".to_string()
}

/// Write rows as CSV with an explicit column list; missing cells are empty.
pub fn write_csv(path: &Path, rows: &[Row], columns: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(columns)?;
    for row in rows {
        let record: Vec<&str> =
            columns.iter().map(|column| row.get(column).map(String::as_str).unwrap_or("")).collect();
        writer.write_record(&record)?;
    }
    writer.flush().context("failed to flush CSV")?;
    Ok(())
}

/// Write the send-ready companion file next to the full export.
pub fn write_send_ready_csv(path: &Path, rows: &[Row]) -> Result<()> {
    let columns: Vec<String> = SEND_READY_COLUMNS.iter().map(|c| c.to_string()).collect();
    write_csv(path, rows, &columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_schema_column_sets() {
        let ab = approval_columns("ab");
        assert!(!ab.contains(&"variant_c_subject".to_string()));
        let abc = approval_columns("abc");
        assert!(abc.contains(&"variant_c_subject".to_string()));
        assert!(abc.contains(&"variant_c_body".to_string()));
    }

    #[test]
    fn test_merge_columns_preserves_order_and_dedupes() {
        let input = vec!["Email".to_string(), "company_name".to_string()];
        let generated = vec!["company_name".to_string(), "final_subject".to_string()];
        assert_eq!(
            merge_columns(&input, &generated),
            vec!["Email".to_string(), "company_name".to_string(), "final_subject".to_string()]
        );
    }

    #[test]
    fn test_resolve_export_schema() {
        assert_eq!(resolve_export_schema("abc", None), "abc");
        assert_eq!(resolve_export_schema("auto", None), "ab");

        let mut summary = CampaignSummary::default();
        summary.output_schema = "abc".to_string();
        assert_eq!(resolve_export_schema("auto", Some(&summary)), "abc");
        assert_eq!(resolve_export_schema("ab", Some(&summary)), "ab");
    }

    #[test]
    fn test_write_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/export.csv");
        let rows = vec![
            row(&[("Email", "a@x.it"), ("final_subject", "Proposta")]),
            row(&[("Email", "b@x.it")]),
        ];
        let columns = vec!["Email".to_string(), "final_subject".to_string()];
        write_csv(&path, &rows, &columns).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, columns);
        let records: Vec<HashMap<String, String>> = reader
            .deserialize::<HashMap<String, String>>()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["final_subject"], "Proposta");
        assert_eq!(records[1]["final_subject"], "");
    }
}
