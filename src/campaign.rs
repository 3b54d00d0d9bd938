//! Campaign orchestration: preflight, cost gate, concurrent per-item
//! processing, outcome aggregation, persistence and export.
//!
//! Lifecycle: PREFLIGHT -> COST_CHECK -> RUNNING -> AGGREGATING ->
//! COMPLETED. Two recognized failure exits: validation errors before any
//! item runs, and a fatal generation error mid-run, which cancels all
//! pending work and aborts the whole batch. Every input row always lands in
//! the export with a generation_status; no row is silently dropped.

use crate::config::Config;
use crate::enrichment::{self, EnrichmentDossier, EnrichmentMode};
use crate::export;
use crate::knowledge::build_retrieval_query;
use crate::leads::{
    self, build_company_and_contacts, clean_url, select_primary_contact, LeadPreflightRow, Row,
};
use crate::llm::{
    DraftEmailVariant, GenerationError, GenerationRequest, LlmGateway, LlmPolicy, VariantMode,
};
use crate::profile::ParentProfile;
use crate::selector::{self, SelectionStatus};
use crate::store::{CampaignRecord, Store};
use crate::util::{truncate, utc_now_iso};
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Fixed per-item generation cost used for the preflight estimate.
const UNIT_COST_EUR: f64 = 0.05;
/// Cap applied to exported warning strings.
const WARNING_MAX_CHARS: usize = 240;
/// Progress milestone interval.
const PROGRESS_EVERY: usize = 10;

pub const TEMPLATE_ONLY_FLAG: &str = "template_only_no_website";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientMode {
    /// One generation per company group, sequential.
    Company,
    /// One generation per lead, bounded worker pool.
    Row,
}

impl RecipientMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientMode::Company => "company",
            RecipientMode::Row => "row",
        }
    }
}

impl FromStr for RecipientMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "company" => Ok(RecipientMode::Company),
            "row" => Ok(RecipientMode::Row),
            other => {
                bail!("recipient_mode must be one of: company, row (got {other})")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CampaignOptions {
    pub parent_slug: String,
    pub leads_csv_path: PathBuf,
    pub out_dir: PathBuf,
    pub recipient_mode: RecipientMode,
    pub variant_mode: VariantMode,
    pub output_schema: String,
    pub llm_policy: LlmPolicy,
    pub enrichment_mode: String,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    pub cost_cap_eur: f64,
    pub force_cost_override: bool,
}

/// Counters finalized exactly once at the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign_id: String,
    pub parent_slug: String,
    pub leads_file: String,
    pub status: String,
    pub companies_total: usize,
    pub generated_total: usize,
    pub warnings_total: usize,
    pub recipient_mode: String,
    pub variant_mode: String,
    pub output_schema: String,
    pub llm_policy: String,
    pub rows_total: usize,
    pub rows_valid: usize,
    pub rows_skipped: usize,
    pub rows_generated_ok: usize,
    pub rows_failed: usize,
    pub estimated_cost_eur: f64,
    pub actual_cost_eur: f64,
}

/// Per-item result handed back from a worker to the orchestrator.
#[derive(Debug)]
struct RowOutcome {
    row_index: usize,
    export_row: Row,
    record: Option<CampaignRecord>,
    warning: bool,
    failed: bool,
    fatal_error: bool,
    error_message: Option<String>,
    attempted_generation: bool,
}

/// Running counters accumulated while consuming outcomes.
#[derive(Debug, Default)]
struct Tally {
    warnings: usize,
    generated_ok: usize,
    failed: usize,
    companies: usize,
    attempted: usize,
}

fn consume_outcome(
    outcome: RowOutcome,
    tally: &mut Tally,
    export_rows: &mut Vec<Row>,
    store: &Store,
) -> Result<()> {
    if outcome.warning {
        tally.warnings += 1;
    }
    if outcome.failed {
        tally.failed += 1;
    } else {
        tally.generated_ok += 1;
    }
    if outcome.attempted_generation {
        tally.attempted += 1;
    }
    if let Some(record) = outcome.record {
        store.insert_campaign_result(record)?;
        tally.companies += 1;
    }
    export_rows.push(outcome.export_row);
    Ok(())
}

/// Everything a worker needs; shared read-only across the pool.
struct ItemContext {
    campaign_id: String,
    parent_slug: String,
    parent: ParentProfile,
    store: Arc<Store>,
    gateway: Arc<LlmGateway>,
    http: reqwest::Client,
    enrichment_mode: EnrichmentMode,
    variant_mode: VariantMode,
    llm_policy: LlmPolicy,
    max_retries: u32,
    backoff_base_seconds: f64,
    output_schema: String,
    rag_enabled: bool,
}

/// Run one campaign start to finish.
pub async fn run_campaign(
    config: &Config,
    store: Arc<Store>,
    gateway: Arc<LlmGateway>,
    options: &CampaignOptions,
) -> Result<(CampaignSummary, PathBuf, Vec<Row>)> {
    let output_schema = options.output_schema.to_lowercase();
    if output_schema != "ab" && output_schema != "abc" {
        bail!("output_schema must be one of: ab, abc");
    }

    let parent = store
        .get_parent_profile(&options.parent_slug)?
        .with_context(|| format!("parent profile not found for slug: {}", options.parent_slug))?;

    let csv_data = leads::read_leads_csv_detailed(&options.leads_csv_path)?;
    let preflight = leads::preflight_leads(&csv_data);
    if preflight.rows_total == 0 {
        bail!("leads CSV has no rows");
    }

    tracing::info!(
        mapping = %leads::format_header_mapping(&preflight.header_mapping),
        "preflight header mapping"
    );
    tracing::info!(
        rows = preflight.rows_total,
        valid = preflight.rows_valid,
        skipped = preflight.rows_skipped,
        required = %preflight.required_fields.join(","),
        "preflight"
    );

    // Only items that will actually hit the service count toward the
    // estimate; template-only rows are free.
    let planned = preflight
        .rows
        .iter()
        .filter(|item| item.is_valid && clean_url(item.row.get("Company Website Full")).is_some())
        .count();
    let estimated_cost_eur = round2(planned as f64 * UNIT_COST_EUR);
    if estimated_cost_eur > options.cost_cap_eur && !options.force_cost_override {
        bail!(
            "estimated campaign cost {:.2} EUR exceeds cap {:.2} EUR; \
             use --force-cost-override to continue",
            estimated_cost_eur,
            options.cost_cap_eur
        );
    }

    let enrichment_mode =
        enrichment::resolve_enrichment_mode(options.recipient_mode.as_str(), &options.enrichment_mode)?;

    let campaign_id = store.create_campaign(
        &options.parent_slug,
        &options.leads_csv_path.display().to_string(),
    )?;
    let all_columns =
        export::merge_columns(&preflight.input_columns, &export::approval_columns(&output_schema));

    let ctx = Arc::new(ItemContext {
        campaign_id: campaign_id.clone(),
        parent_slug: options.parent_slug.clone(),
        parent,
        store: store.clone(),
        gateway: gateway.clone(),
        http: reqwest::Client::new(),
        enrichment_mode,
        variant_mode: options.variant_mode,
        llm_policy: options.llm_policy,
        max_retries: options.max_retries,
        backoff_base_seconds: options.backoff_base_seconds,
        output_schema: output_schema.clone(),
        rag_enabled: gateway.is_configured(),
    });

    let outcomes = match options.recipient_mode {
        RecipientMode::Row => run_row_mode(ctx.clone(), &preflight.rows, options.max_concurrency).await,
        RecipientMode::Company => run_company_mode(ctx.clone(), &preflight.rows).await,
    };

    // Fatal short-circuit: nothing from this run is persisted.
    if let Some(fatal) = outcomes.iter().find(|outcome| outcome.fatal_error) {
        let message =
            fatal.error_message.clone().unwrap_or_else(|| "fatal campaign error".to_string());
        bail!("{message}");
    }

    // AGGREGATING: input order first, unmatched leftovers appended.
    let mut by_index: HashMap<usize, RowOutcome> =
        outcomes.into_iter().map(|outcome| (outcome.row_index, outcome)).collect();

    let mut export_rows: Vec<Row> = Vec::new();
    let mut tally = Tally::default();

    for item in &preflight.rows {
        if let Some(outcome) = by_index.remove(&item.row_index) {
            consume_outcome(outcome, &mut tally, &mut export_rows, &store)?;
        } else if !item.is_valid {
            tally.warnings += 1;
            export_rows.push(skipped_validation_row(
                &campaign_id,
                &options.parent_slug,
                item,
                &output_schema,
            ));
        }
    }
    let mut leftovers: Vec<RowOutcome> = by_index.into_values().collect();
    leftovers.sort_by_key(|outcome| outcome.row_index);
    for outcome in leftovers {
        consume_outcome(outcome, &mut tally, &mut export_rows, &store)?;
    }

    std::fs::create_dir_all(&options.out_dir)
        .with_context(|| format!("failed to create {}", options.out_dir.display()))?;
    let export_path = options.out_dir.join(format!("campaign-{campaign_id}.csv"));
    export::write_csv(&export_path, &export_rows, &all_columns)?;
    let send_ready_path = options.out_dir.join(format!("campaign-{campaign_id}-send-ready.csv"));
    export::write_send_ready_csv(&send_ready_path, &export_rows)?;

    let actual_cost_eur = round2(tally.attempted as f64 * UNIT_COST_EUR);
    let summary = CampaignSummary {
        campaign_id: campaign_id.clone(),
        parent_slug: options.parent_slug.clone(),
        leads_file: options.leads_csv_path.display().to_string(),
        status: "COMPLETED".to_string(),
        companies_total: tally.companies,
        generated_total: tally.generated_ok,
        warnings_total: tally.warnings,
        recipient_mode: options.recipient_mode.as_str().to_string(),
        variant_mode: options.variant_mode.as_str().to_string(),
        output_schema,
        llm_policy: options.llm_policy.as_str().to_string(),
        rows_total: preflight.rows_total,
        rows_valid: preflight.rows_valid,
        rows_skipped: preflight.rows_skipped,
        rows_generated_ok: tally.generated_ok,
        rows_failed: tally.failed,
        estimated_cost_eur,
        actual_cost_eur,
    };
    store.finalize_campaign(&campaign_id, &summary)?;
    let purged = store.purge_expired_campaigns(config.retention_days)?;
    if purged > 0 {
        tracing::info!(purged, "expired campaigns purged");
    }

    Ok((summary, export_path, export_rows))
}

/// Bounded fan-out over valid rows with first-fatal-wins cancellation.
async fn run_row_mode(
    ctx: Arc<ItemContext>,
    rows: &[LeadPreflightRow],
    max_concurrency: usize,
) -> Vec<RowOutcome> {
    let valid_rows: Vec<LeadPreflightRow> =
        rows.iter().filter(|item| item.is_valid).cloned().collect();
    if valid_rows.is_empty() {
        return Vec::new();
    }

    let workers = max_concurrency.max(1);
    let total = valid_rows.len();
    let cancel = Arc::new(AtomicBool::new(false));

    let mut stream = futures::stream::iter(valid_rows.into_iter().map(|item| {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        async move {
            if cancel.load(Ordering::SeqCst) {
                return None;
            }
            Some(
                process_item(ctx, vec![item.row.clone()], item.raw_row.clone(), item.row_index)
                    .await,
            )
        }
    }))
    .buffer_unordered(workers);

    let mut outcomes = Vec::new();
    let mut done = 0usize;
    while let Some(result) = stream.next().await {
        let Some(outcome) = result else { continue };
        done += 1;
        if done % PROGRESS_EVERY == 0 || done == total {
            tracing::info!(done, total, "generation progress");
        }
        let fatal = outcome.fatal_error;
        outcomes.push(outcome);
        if fatal {
            // Stop scheduling, drop in-flight work with the stream.
            cancel.store(true, Ordering::SeqCst);
            break;
        }
    }
    outcomes
}

/// One generation per company group, sequential.
async fn run_company_mode(ctx: Arc<ItemContext>, rows: &[LeadPreflightRow]) -> Vec<RowOutcome> {
    let valid_rows: Vec<&LeadPreflightRow> = rows.iter().filter(|item| item.is_valid).collect();

    // Group by normalized company key, preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&LeadPreflightRow>> = HashMap::new();
    for item in valid_rows {
        let key = leads::company_key(&item.row);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(item);
    }

    let mut outcomes = Vec::new();
    for key in order {
        let group = groups.remove(&key).unwrap_or_default();
        let canonical_rows: Vec<Row> = group.iter().map(|item| item.row.clone()).collect();
        let first = match group.first() {
            Some(first) => first,
            None => continue,
        };
        let outcome =
            process_item(ctx.clone(), canonical_rows, first.raw_row.clone(), first.row_index).await;
        let fatal = outcome.fatal_error;
        outcomes.push(outcome);
        if fatal {
            break;
        }
    }
    outcomes
}

/// Per-item processor: enrichment -> generation gateway -> selection.
async fn process_item(
    ctx: Arc<ItemContext>,
    canonical_rows: Vec<Row>,
    raw_row: Row,
    row_index: usize,
) -> RowOutcome {
    let (mut company, mut contacts) = build_company_and_contacts(&canonical_rows);
    let primary_contact = select_primary_contact(&mut contacts);

    let (dossier, discovered_website) = enrichment::build_enrichment_dossier(
        &ctx.http,
        &company,
        primary_contact.as_ref(),
        ctx.enrichment_mode,
        2,
    )
    .await;
    if company.website.is_none() {
        company.website = discovered_website;
    }

    let mut snippets: Vec<String> = Vec::new();
    if ctx.rag_enabled {
        let query = build_retrieval_query(&company, &dossier);
        let embeddings = ctx.gateway.embed_texts(&[query]).await;
        if let Some(query_embedding) = embeddings.first() {
            match ctx.store.search_knowledge_chunks(
                &ctx.parent_slug,
                "marketing",
                query_embedding,
                6,
            ) {
                Ok(hits) => {
                    snippets =
                        hits.into_iter().map(|hit| hit.content).filter(|c| !c.is_empty()).collect();
                }
                Err(error) => {
                    tracing::debug!(%error, "knowledge search failed, continuing without snippets");
                }
            }
        }
    }

    let request = GenerationRequest {
        parent: &ctx.parent,
        company: &company,
        contact: primary_contact.as_ref(),
        dossier: &dossier,
        knowledge_snippets: &snippets,
        variant_mode: ctx.variant_mode,
        policy: ctx.llm_policy,
        max_retries: ctx.max_retries,
        backoff_base_seconds: ctx.backoff_base_seconds,
    };

    // Items without a usable website never call the service: they render
    // from the template and are flagged accordingly.
    let template_only = company.website.is_none();
    let generation = if template_only {
        let mut outcome = ctx.gateway.fallback_outcome(&request);
        for variant in &mut outcome.variants {
            if !variant.risk_flags.iter().any(|f| f == TEMPLATE_ONLY_FLAG) {
                variant.risk_flags.push(TEMPLATE_ONLY_FLAG.to_string());
                variant.risk_flags.sort();
            }
        }
        if !outcome.global_flags.iter().any(|f| f == TEMPLATE_ONLY_FLAG) {
            outcome.global_flags.push(TEMPLATE_ONLY_FLAG.to_string());
            outcome.global_flags.sort();
        }
        Ok(outcome)
    } else {
        ctx.gateway.generate_campaign_variants(&request).await
    };

    let generation = match generation {
        Ok(generation) => generation,
        Err(error @ (GenerationError::Fatal(_) | GenerationError::Unavailable)) => {
            return RowOutcome {
                row_index,
                export_row: Row::new(),
                record: None,
                warning: true,
                failed: true,
                fatal_error: true,
                error_message: Some(error.to_string()),
                attempted_generation: !template_only,
            };
        }
        Err(error @ GenerationError::RetriesExhausted { .. }) => {
            let message = error.to_string();
            let export_row = error_row(
                &ctx.campaign_id,
                &ctx.parent_slug,
                &raw_row,
                &canonical_rows[0],
                "FAILED_LLM_RETRY_EXHAUSTED",
                &message,
                &ctx.output_schema,
            );
            return RowOutcome {
                row_index,
                export_row,
                record: None,
                warning: true,
                failed: true,
                fatal_error: false,
                error_message: Some(message),
                attempted_generation: true,
            };
        }
    };

    let selection = selector::select_final_variant(
        &generation.variants,
        &generation.recommended_variant,
        !dossier.sources.is_empty(),
    );
    let by_name = variants_by_name(&generation.variants);
    let (final_subject, final_body) = by_name
        .get(&selection.selected_variant)
        .map(|(subject, body)| (subject.clone(), body.clone()))
        .unwrap_or_default();

    let (generation_status, error_code) = match selection.status {
        SelectionStatus::Ok => ("OK", ""),
        SelectionStatus::FailedCopyGuard => ("FAILED_COPY_GUARD", "FAILED_COPY_GUARD"),
    };
    let generation_warning = truncate(&selection.warning_message, WARNING_MAX_CHARS);
    let warning = !selection.warning_flags.is_empty() || !generation_warning.is_empty();

    let payload = serde_json::json!({
        "variants": &generation.variants,
        "recommended_variant": &generation.recommended_variant,
        "selected_variant": &selection.selected_variant,
        "final_subject": &final_subject,
        "final_body": &final_body,
        "generation_status": generation_status,
        "generation_warning": &generation_warning,
        "error_code": error_code,
        "dossier": &dossier,
        "risk_flags": &selection.warning_flags,
        "raw_row": &raw_row,
    });

    let now = utc_now_iso();
    let record = CampaignRecord {
        id: Uuid::new_v4().to_string(),
        campaign_id: ctx.campaign_id.clone(),
        parent_slug: ctx.parent_slug.clone(),
        company_key: company.company_key.clone(),
        company_name: company.company_name.clone(),
        contact_name: primary_contact.as_ref().map(|c| c.full_name.clone()).unwrap_or_default(),
        contact_title: primary_contact
            .as_ref()
            .and_then(|c| c.title.clone())
            .unwrap_or_default(),
        contact_email: primary_contact
            .as_ref()
            .and_then(|c| c.email.clone())
            .unwrap_or_default(),
        payload,
        status: "PENDING".to_string(),
        reviewer_notes: String::new(),
        approved_variant: String::new(),
        created_at: now.clone(),
        updated_at: now,
    };

    let export_row = result_row(
        &ctx,
        &raw_row,
        &record,
        &generation.variants,
        &generation.recommended_variant,
        &selection.selected_variant,
        &final_subject,
        &final_body,
        generation_status,
        &generation_warning,
        error_code,
        &selection.warning_flags,
        &dossier,
    );

    RowOutcome {
        row_index,
        export_row,
        record: Some(record),
        warning,
        failed: generation_status != "OK",
        fatal_error: false,
        error_message: None,
        attempted_generation: !template_only,
    }
}

fn variants_by_name(variants: &[DraftEmailVariant]) -> HashMap<String, (String, String)> {
    variants
        .iter()
        .map(|v| (v.variant.to_uppercase(), (v.subject.clone(), v.body.clone())))
        .collect()
}

fn contact_fields_from_row(canonical: &Row) -> (String, String, String) {
    let name = canonical.get("Full Name").cloned().unwrap_or_default();
    let title = canonical.get("Title").cloned().unwrap_or_default();
    let email = canonical.get("Email").cloned().unwrap_or_default();
    (name, title, email)
}

fn skipped_validation_row(
    campaign_id: &str,
    parent_slug: &str,
    item: &LeadPreflightRow,
    output_schema: &str,
) -> Row {
    let (contact_name, title, email) = contact_fields_from_row(&item.row);
    let warning = format!("Missing required fields: {}", item.missing_required.join(", "));

    let mut row = item.raw_row.clone();
    row.insert("campaign_id".to_string(), campaign_id.to_string());
    row.insert("parent_slug".to_string(), parent_slug.to_string());
    row.insert(
        "company_name".to_string(),
        item.row.get("Company Name").cloned().unwrap_or_default(),
    );
    row.insert("contact_name".to_string(), contact_name);
    row.insert("contact_title".to_string(), title);
    row.insert("contact_email".to_string(), email);
    row.insert("recommended_variant".to_string(), String::new());
    row.insert("final_subject".to_string(), String::new());
    row.insert("final_body".to_string(), String::new());
    row.insert("selected_variant".to_string(), String::new());
    row.insert("generation_status".to_string(), "SKIPPED_VALIDATION".to_string());
    row.insert("generation_warning".to_string(), truncate(&warning, WARNING_MAX_CHARS));
    row.insert("error_code".to_string(), "SKIPPED_VALIDATION".to_string());
    row.insert("status".to_string(), "PENDING".to_string());
    row.insert("updated_at".to_string(), utc_now_iso());
    if output_schema == "abc" {
        row.entry("variant_c_subject".to_string()).or_default();
        row.entry("variant_c_body".to_string()).or_default();
    }
    row
}

#[allow(clippy::too_many_arguments)]
fn error_row(
    campaign_id: &str,
    parent_slug: &str,
    raw_row: &Row,
    canonical: &Row,
    error_code: &str,
    warning_message: &str,
    output_schema: &str,
) -> Row {
    let (contact_name, title, email) = contact_fields_from_row(canonical);

    let mut row = raw_row.clone();
    row.insert("campaign_id".to_string(), campaign_id.to_string());
    row.insert("parent_slug".to_string(), parent_slug.to_string());
    row.insert(
        "company_name".to_string(),
        canonical.get("Company Name").cloned().unwrap_or_default(),
    );
    row.insert("contact_name".to_string(), contact_name);
    row.insert("contact_title".to_string(), title);
    row.insert("contact_email".to_string(), email);
    row.insert("recommended_variant".to_string(), String::new());
    row.insert("final_subject".to_string(), String::new());
    row.insert("final_body".to_string(), String::new());
    row.insert("selected_variant".to_string(), String::new());
    row.insert("generation_status".to_string(), "ERROR".to_string());
    row.insert("generation_warning".to_string(), truncate(warning_message, WARNING_MAX_CHARS));
    row.insert("error_code".to_string(), error_code.to_string());
    row.insert("status".to_string(), "PENDING".to_string());
    row.insert("updated_at".to_string(), utc_now_iso());
    if output_schema == "abc" {
        row.entry("variant_c_subject".to_string()).or_default();
        row.entry("variant_c_body".to_string()).or_default();
    }
    row
}

#[allow(clippy::too_many_arguments)]
fn result_row(
    ctx: &ItemContext,
    raw_row: &Row,
    record: &CampaignRecord,
    variants: &[DraftEmailVariant],
    recommended_variant: &str,
    selected_variant: &str,
    final_subject: &str,
    final_body: &str,
    generation_status: &str,
    generation_warning: &str,
    error_code: &str,
    risk_flags: &[String],
    dossier: &EnrichmentDossier,
) -> Row {
    let by_name = variants_by_name(variants);
    let variant = |id: &str| by_name.get(id).cloned().unwrap_or_default();
    let evidence_summary =
        dossier.evidence.iter().take(5).cloned().collect::<Vec<_>>().join("; ");

    let mut row = raw_row.clone();
    row.insert("campaign_id".to_string(), ctx.campaign_id.clone());
    row.insert("parent_slug".to_string(), ctx.parent_slug.clone());
    row.insert("company_name".to_string(), record.company_name.clone());
    row.insert("contact_name".to_string(), record.contact_name.clone());
    row.insert("contact_title".to_string(), record.contact_title.clone());
    row.insert("contact_email".to_string(), record.contact_email.clone());
    let (a_subject, a_body) = variant("A");
    row.insert("variant_a_subject".to_string(), a_subject);
    row.insert("variant_a_body".to_string(), a_body);
    let (b_subject, b_body) = variant("B");
    row.insert("variant_b_subject".to_string(), b_subject);
    row.insert("variant_b_body".to_string(), b_body);
    if ctx.output_schema == "abc" {
        let (c_subject, c_body) = variant("C");
        row.insert("variant_c_subject".to_string(), c_subject);
        row.insert("variant_c_body".to_string(), c_body);
    }
    row.insert("recommended_variant".to_string(), recommended_variant.to_string());
    row.insert("final_subject".to_string(), final_subject.to_string());
    row.insert("final_body".to_string(), final_body.to_string());
    row.insert("selected_variant".to_string(), selected_variant.to_string());
    row.insert("generation_status".to_string(), generation_status.to_string());
    row.insert("generation_warning".to_string(), generation_warning.to_string());
    row.insert("error_code".to_string(), error_code.to_string());
    row.insert("evidence_summary".to_string(), evidence_summary);
    row.insert("risk_flags".to_string(), risk_flags.join("; "));
    row.insert("status".to_string(), record.status.clone());
    row.insert("reviewer_notes".to_string(), record.reviewer_notes.clone());
    row.insert("approved_variant".to_string(), record.approved_variant.clone());
    row.insert("updated_at".to_string(), record.updated_at.clone());
    row
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Summary plus per-status record counts for `campaign status`.
pub fn campaign_status(store: &Store, campaign_id: &str) -> Result<Option<serde_json::Value>> {
    let Some(campaign) = store.get_campaign(campaign_id)? else {
        return Ok(None);
    };

    let mut status_counts: HashMap<String, usize> = HashMap::new();
    for record in &campaign.records {
        *status_counts.entry(record.status.clone()).or_default() += 1;
    }

    Ok(Some(serde_json::json!({
        "campaign_id": campaign.id,
        "parent_slug": campaign.parent_slug,
        "leads_file": campaign.leads_file,
        "status": campaign.status,
        "started_at": campaign.started_at,
        "finished_at": campaign.finished_at,
        "summary": campaign.summary,
        "records_total": campaign.records.len(),
        "record_status_counts": status_counts,
    })))
}

/// Re-export a persisted campaign from its stored records.
pub fn export_campaign(
    store: &Store,
    campaign_id: &str,
    output_path: &Path,
    output_schema: &str,
) -> Result<PathBuf> {
    let campaign = store
        .get_campaign(campaign_id)?
        .with_context(|| format!("campaign not found: {campaign_id}"))?;
    let resolved_schema = export::resolve_export_schema(output_schema, campaign.summary.as_ref());
    let columns = export::approval_columns(&resolved_schema);

    let mut rows: Vec<Row> = Vec::new();
    for record in &campaign.records {
        let payload = &record.payload;
        let variants: HashMap<String, (String, String)> = payload
            .get("variants")
            .and_then(|value| value.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = item.get("variant")?.as_str()?.to_uppercase();
                        let subject =
                            item.get("subject").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        let body =
                            item.get("body").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        Some((id, (subject, body)))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let payload_str = |key: &str| {
            payload.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
        };
        let selected = {
            let raw = payload_str("selected_variant");
            let raw = if raw.is_empty() { payload_str("recommended_variant") } else { raw };
            if raw.is_empty() { "A".to_string() } else { raw.to_uppercase() }
        };
        let variant = |id: &str| variants.get(id).cloned().unwrap_or_default();
        let evidence_summary = payload
            .get("dossier")
            .and_then(|d| d.get("evidence"))
            .and_then(|e| e.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .take(5)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        let risk_flags = payload
            .get("risk_flags")
            .and_then(|f| f.as_array())
            .map(|items| {
                items.iter().filter_map(|item| item.as_str()).collect::<Vec<_>>().join("; ")
            })
            .unwrap_or_default();

        let mut row = Row::new();
        row.insert("campaign_id".to_string(), campaign.id.clone());
        row.insert("parent_slug".to_string(), record.parent_slug.clone());
        row.insert("company_name".to_string(), record.company_name.clone());
        row.insert("contact_name".to_string(), record.contact_name.clone());
        row.insert("contact_title".to_string(), record.contact_title.clone());
        row.insert("contact_email".to_string(), record.contact_email.clone());
        let (a_subject, a_body) = variant("A");
        row.insert("variant_a_subject".to_string(), a_subject);
        row.insert("variant_a_body".to_string(), a_body);
        let (b_subject, b_body) = variant("B");
        row.insert("variant_b_subject".to_string(), b_subject);
        row.insert("variant_b_body".to_string(), b_body);
        let (c_subject, c_body) = variant("C");
        row.insert("variant_c_subject".to_string(), c_subject);
        row.insert("variant_c_body".to_string(), c_body);
        row.insert("recommended_variant".to_string(), payload_str("recommended_variant"));
        let (final_subject, final_body) = variant(&selected);
        row.insert("final_subject".to_string(), final_subject);
        row.insert("final_body".to_string(), final_body);
        row.insert("selected_variant".to_string(), selected);
        row.insert("generation_status".to_string(), {
            let status = payload_str("generation_status");
            if status.is_empty() { "OK".to_string() } else { status }
        });
        row.insert("generation_warning".to_string(), payload_str("generation_warning"));
        row.insert("error_code".to_string(), payload_str("error_code"));
        row.insert("evidence_summary".to_string(), evidence_summary);
        row.insert("risk_flags".to_string(), risk_flags);
        row.insert("status".to_string(), record.status.clone());
        row.insert("reviewer_notes".to_string(), record.reviewer_notes.clone());
        row.insert("approved_variant".to_string(), record.approved_variant.clone());
        row.insert("updated_at".to_string(), record.updated_at.clone());
        rows.push(row);
    }

    export::write_csv(output_path, &rows, &columns)?;
    Ok(output_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::{hash_embedding, ChatService};
    use crate::profile::test_profile;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::Mutex;

    struct ScriptedService {
        responses: Mutex<VecDeque<Result<String>>>,
    }

    impl ScriptedService {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self { responses: Mutex::new(responses.into_iter().collect()) })
        }
    }

    #[async_trait]
    impl ChatService for ScriptedService {
        async fn chat(&self, _system: &str, _user: &str, _json_mode: bool) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| hash_embedding(t)).collect())
        }
    }

    const CLEAN_RESPONSE: &str = r#"{"variants": [
        {"variant": "A", "subject": "Proposta seria", "body": "Testo pulito e sobrio."},
        {"variant": "B", "subject": "Confronto operativo", "body": "Secondo testo pulito."}
    ], "recommended_variant": "A"}"#;

    fn write_leads_csv(path: &Path) {
        let mut file = std::fs::File::create(path).unwrap();
        writeln!(file, "Email,First Name,Last Name,companyName,website,jobTitle").unwrap();
        writeln!(file, "anna@example.com,Anna,Verdi,Beta SRL,https://beta.it,Founder").unwrap();
        writeln!(file, "luca@example.com,Luca,Rossi,Gamma SRL,https://gamma.it,CEO").unwrap();
        writeln!(file, "no-website@example.com,No,Site,Delta SRL,,Owner").unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        store: Arc<Store>,
        leads_path: PathBuf,
        out_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = Arc::new(Store::open(&data_dir).unwrap());
        // Parent profile WITHOUT a seed-template rewrite baseline so the
        // scripted clean responses pass the gate untouched.
        let mut parent = test_profile();
        parent.outreach_seed_template = String::new();
        store.upsert_parent_profile(&parent).unwrap();

        let leads_path = dir.path().join("leads.csv");
        write_leads_csv(&leads_path);

        let config = Config {
            api_key: None,
            chat_model: "gpt-5".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            data_dir,
            retention_days: 90,
        };
        let out_dir = dir.path().join("out");
        Fixture { _dir: dir, config, store, leads_path, out_dir }
    }

    fn options(fixture: &Fixture) -> CampaignOptions {
        CampaignOptions {
            parent_slug: "azienda-a".to_string(),
            leads_csv_path: fixture.leads_path.clone(),
            out_dir: fixture.out_dir.clone(),
            recipient_mode: RecipientMode::Row,
            variant_mode: VariantMode::Ab,
            output_schema: "ab".to_string(),
            llm_policy: LlmPolicy::Strict,
            enrichment_mode: "auto".to_string(),
            max_concurrency: 1,
            max_retries: 1,
            backoff_base_seconds: 0.0,
            cost_cap_eur: 50.0,
            force_cost_override: false,
        }
    }

    #[tokio::test]
    async fn test_row_mode_preserves_input_and_renders_template_only_row() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(Some(ScriptedService::new(vec![
            Ok(CLEAN_RESPONSE.to_string()),
            Ok(CLEAN_RESPONSE.to_string()),
        ]))));

        let (summary, export_path, rows) =
            run_campaign(&fixture.config, fixture.store.clone(), gateway, &options(&fixture))
                .await
                .unwrap();

        assert_eq!(summary.rows_total, 3);
        assert_eq!(summary.rows_valid, 3);
        assert_eq!(summary.rows_skipped, 0);
        assert_eq!(summary.rows_failed, 0);
        assert_eq!(rows.len(), 3);
        assert!(export_path.exists());

        // 1:1 input-to-export mapping, in input order.
        let emails: Vec<&str> =
            rows.iter().map(|row| row.get("Email").unwrap().as_str()).collect();
        assert_eq!(
            emails,
            vec!["anna@example.com", "luca@example.com", "no-website@example.com"]
        );

        // The website-less row went through the template renderer.
        let template_only: Vec<&Row> = rows
            .iter()
            .filter(|row| {
                row.get("risk_flags").map(|f| f.contains(TEMPLATE_ONLY_FLAG)).unwrap_or(false)
            })
            .collect();
        assert_eq!(template_only.len(), 1);
        assert!(!template_only[0].get("final_subject").unwrap().is_empty());
        assert!(!template_only[0].get("final_body").unwrap().is_empty());
        assert_eq!(template_only[0].get("generation_status").unwrap(), "OK");

        // Only the two website rows attempted service generation.
        assert!((summary.estimated_cost_eur - 0.10).abs() < 1e-9);
        assert!((summary.actual_cost_eur - 0.10).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cost_cap_blocks_without_override() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(Some(ScriptedService::new(vec![
            Ok(CLEAN_RESPONSE.to_string()),
            Ok(CLEAN_RESPONSE.to_string()),
        ]))));

        let mut opts = options(&fixture);
        opts.cost_cap_eur = 0.01;
        let error = run_campaign(&fixture.config, fixture.store.clone(), gateway.clone(), &opts)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("exceeds cap"));

        opts.force_cost_override = true;
        let (summary, _, _) =
            run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts).await.unwrap();
        assert!(summary.estimated_cost_eur > 0.01);
    }

    #[tokio::test]
    async fn test_failed_variant_does_not_poison_row() {
        let fixture = fixture();
        // B is spammy, repair stays spammy, service recommends B anyway.
        let gateway = Arc::new(LlmGateway::new(Some(ScriptedService::new(vec![
            Ok(r#"{"variants": [
                {"variant": "A", "subject": "Proposta seria", "body": "Testo pulito."},
                {"variant": "B", "subject": "OFFERTA GRATIS!!!", "body": "Compra ora!!"}
            ], "recommended_variant": "B"}"#
                .to_string()),
            Ok(r#"{"subject": "ANCORA GRATIS!!!", "body": "Sempre urlato!!"}"#.to_string()),
        ]))));

        let dir = tempfile::tempdir().unwrap();
        let leads_path = dir.path().join("one.csv");
        let mut file = std::fs::File::create(&leads_path).unwrap();
        writeln!(file, "Email,First Name,Last Name,companyName,website,jobTitle").unwrap();
        writeln!(file, "anna@example.com,Anna,Verdi,Beta SRL,https://beta.it,Founder").unwrap();
        drop(file);

        let mut opts = options(&fixture);
        opts.leads_csv_path = leads_path;

        let (summary, _, rows) =
            run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts).await.unwrap();

        assert_eq!(summary.rows_failed, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("generation_status").unwrap(), "OK");
        assert_eq!(rows[0].get("selected_variant").unwrap(), "A");
        let warning = rows[0].get("generation_warning").unwrap();
        assert!(warning.contains("Copy guard fallito"));
        assert!(warning.contains('B'));
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_run_and_persists_nothing() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(Some(ScriptedService::new(vec![Err(
            anyhow::anyhow!("chat request failed: quota exceeded for project"),
        )]))));

        let error = run_campaign(&fixture.config, fixture.store.clone(), gateway, &options(&fixture))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("LLM fatal error"));
    }

    #[tokio::test]
    async fn test_strict_policy_without_service_is_fatal() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(None));
        let error = run_campaign(&fixture.config, fixture.store.clone(), gateway, &options(&fixture))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("LLM unavailable"));
    }

    #[tokio::test]
    async fn test_fallback_policy_without_service_completes() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(None));
        let mut opts = options(&fixture);
        opts.llm_policy = LlmPolicy::Fallback;

        let (summary, _, rows) =
            run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts).await.unwrap();
        assert_eq!(summary.rows_generated_ok, 3);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| !row.get("final_subject").unwrap().is_empty()));
    }

    #[tokio::test]
    async fn test_company_mode_groups_rows() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let leads_path = dir.path().join("grouped.csv");
        let mut file = std::fs::File::create(&leads_path).unwrap();
        writeln!(file, "Email,First Name,Last Name,companyName,website,jobTitle").unwrap();
        writeln!(file, "anna@example.com,Anna,Verdi,Beta SRL,https://beta.it,Founder").unwrap();
        writeln!(file, "marco@example.com,Marco,Blu,Beta SRL,https://beta.it,CTO").unwrap();
        writeln!(file, "luca@example.com,Luca,Rossi,Gamma SRL,https://gamma.it,CEO").unwrap();
        drop(file);

        let gateway = Arc::new(LlmGateway::new(Some(ScriptedService::new(vec![
            Ok(CLEAN_RESPONSE.to_string()),
            Ok(CLEAN_RESPONSE.to_string()),
        ]))));

        let mut opts = options(&fixture);
        opts.leads_csv_path = leads_path;
        opts.recipient_mode = RecipientMode::Company;
        opts.enrichment_mode = "minimal".to_string();

        let (summary, _, rows) =
            run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(summary.companies_total, 2);
        assert_eq!(rows[0].get("company_name").unwrap(), "Beta SRL");
        // Highest-scoring contact of the group is the recipient.
        assert_eq!(rows[0].get("contact_name").unwrap(), "Anna Verdi");
        assert_eq!(rows[1].get("company_name").unwrap(), "Gamma SRL");
    }

    #[tokio::test]
    async fn test_export_auto_schema_uses_summary_metadata() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(None));
        let mut opts = options(&fixture);
        opts.llm_policy = LlmPolicy::Fallback;
        opts.variant_mode = VariantMode::Abc;
        opts.output_schema = "abc".to_string();

        let (summary, _, _) =
            run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts).await.unwrap();

        let out = fixture.out_dir.join("re-export.csv");
        export_campaign(&fixture.store, &summary.campaign_id, &out, "auto").unwrap();

        let mut reader = csv::Reader::from_path(&out).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert!(headers.contains(&"variant_c_subject".to_string()));
        assert!(headers.contains(&"variant_c_body".to_string()));
        assert!(reader.records().count() >= 1);
    }

    #[tokio::test]
    async fn test_campaign_status_counts_records() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(None));
        let mut opts = options(&fixture);
        opts.llm_policy = LlmPolicy::Fallback;

        let (summary, _, _) =
            run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts).await.unwrap();

        let status = campaign_status(&fixture.store, &summary.campaign_id).unwrap().unwrap();
        assert_eq!(status["records_total"], 3);
        assert_eq!(status["record_status_counts"]["PENDING"], 3);
        assert_eq!(status["status"], "COMPLETED");

        assert!(campaign_status(&fixture.store, "missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_parent_profile_is_validation_error() {
        let fixture = fixture();
        let gateway = Arc::new(LlmGateway::new(None));
        let mut opts = options(&fixture);
        opts.parent_slug = "sconosciuto".to_string();
        let error = run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("parent profile not found"));
    }

    #[tokio::test]
    async fn test_empty_csv_is_validation_error() {
        let fixture = fixture();
        let empty = fixture.out_dir.join("empty.csv");
        std::fs::create_dir_all(&fixture.out_dir).unwrap();
        std::fs::write(&empty, "Email,First Name,companyName\n").unwrap();

        let gateway = Arc::new(LlmGateway::new(None));
        let mut opts = options(&fixture);
        opts.leads_csv_path = empty;
        opts.llm_policy = LlmPolicy::Fallback;
        let error = run_campaign(&fixture.config, fixture.store.clone(), gateway, &opts)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("no rows"));
    }
}
