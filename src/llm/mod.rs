//! Generation gateway: every call to the generative service goes through
//! the state machine in this module.
//!
//! Per attempt: CALL -> PARSE -> PER_VARIANT_CLEAN -> QUALITY_CHECK ->
//! [REPAIR] -> ACCEPT, wrapped in a bounded retry loop with exponential
//! backoff. Errors are classified before retrying: credential/billing/model
//! failures abort the whole campaign immediately, everything else is
//! transient. With policy `fallback`, transient exhaustion (or a missing
//! credential) degrades to the deterministic template renderer instead of
//! failing the item.

pub mod client;
pub mod fallback;
pub mod parse;
pub mod prompts;

use crate::config::Config;
use crate::enrichment::EnrichmentDossier;
use crate::guard::apply_claim_guard;
use crate::leads::{LeadCompany, LeadContact};
use crate::profile::ParentProfile;
use crate::quality::{self, RewriteTargets};
use anyhow::Result;
use client::{hash_embedding, ChatService, OpenAiClient};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Hard cap applied to subjects during normalization. Deliberately above the
/// quality gate's limit so an over-long subject is flagged and repaired
/// rather than silently truncated into compliance.
const SUBJECT_CLEAN_CAP: usize = 160;

const DEFAULT_SUBJECT: &str = "Proposta di confronto operativo";
const DEFAULT_CONFIDENCE: f64 = 0.65;

/// Substrings that mark a generation error as fatal for the whole campaign.
const FATAL_ERROR_TOKENS: [&str; 6] =
    ["api key", "authentication", "quota", "billing", "model not found", "permission"];

/// One candidate email, identified by letter id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftEmailVariant {
    pub variant: String,
    pub subject: String,
    pub body: String,
    pub cta: String,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    pub confidence: f64,
}

/// Gateway return contract.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub variants: Vec<DraftEmailVariant>,
    pub recommended_variant: String,
    pub global_flags: Vec<String>,
}

/// Classified generation failures (see error taxonomy in the design notes).
#[derive(Debug, Error)]
pub enum GenerationError {
    /// No credential configured; raised only under policy `strict`.
    #[error("LLM unavailable: nessun servizio generativo configurato")]
    Unavailable,
    /// Credential/billing/model-availability failure. Never retried.
    #[error("LLM fatal error: {0}")]
    Fatal(String),
    /// Transient failures exhausted the retry budget under policy `strict`.
    #[error("LLM retry exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantMode {
    Ab,
    Abc,
}

impl VariantMode {
    pub fn ids(&self) -> &'static [&'static str] {
        match self {
            VariantMode::Ab => &["A", "B"],
            VariantMode::Abc => &["A", "B", "C"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantMode::Ab => "ab",
            VariantMode::Abc => "abc",
        }
    }
}

impl FromStr for VariantMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "ab" => Ok(VariantMode::Ab),
            "abc" => Ok(VariantMode::Abc),
            other => Err(anyhow::anyhow!("variant_mode must be one of: ab, abc (got {other})")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmPolicy {
    /// Propagate failures to the caller.
    Strict,
    /// Degrade to the deterministic template renderer.
    Fallback,
}

impl LlmPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmPolicy::Strict => "strict",
            LlmPolicy::Fallback => "fallback",
        }
    }
}

impl FromStr for LlmPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "strict" => Ok(LlmPolicy::Strict),
            "fallback" => Ok(LlmPolicy::Fallback),
            other => {
                Err(anyhow::anyhow!("llm_policy must be one of: strict, fallback (got {other})"))
            }
        }
    }
}

/// Immutable request value threaded through one gateway invocation.
pub struct GenerationRequest<'a> {
    pub parent: &'a ParentProfile,
    pub company: &'a LeadCompany,
    pub contact: Option<&'a LeadContact>,
    pub dossier: &'a EnrichmentDossier,
    pub knowledge_snippets: &'a [String],
    pub variant_mode: VariantMode,
    pub policy: LlmPolicy,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
}

/// Injectable async delay so tests can run the retry loop with a no-op clock.
pub type Sleeper = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

fn tokio_sleeper() -> Sleeper {
    Arc::new(|delay| -> BoxFuture<'static, ()> { Box::pin(tokio::time::sleep(delay)) })
}

pub struct LlmGateway {
    service: Option<Arc<dyn ChatService>>,
    rewrite_targets: RewriteTargets,
    sleeper: Sleeper,
}

impl LlmGateway {
    pub fn new(service: Option<Arc<dyn ChatService>>) -> Self {
        Self { service, rewrite_targets: RewriteTargets::default(), sleeper: tokio_sleeper() }
    }

    /// Build from config: a missing API key leaves the service unconfigured.
    pub fn from_config(config: &Config) -> Self {
        let service: Option<Arc<dyn ChatService>> = config.api_key.as_ref().map(|key| {
            Arc::new(OpenAiClient::new(
                key.clone(),
                config.chat_model.clone(),
                config.embedding_model.clone(),
            )) as Arc<dyn ChatService>
        });
        Self::new(service)
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.service.is_some()
    }

    /// Embed texts, degrading to the deterministic hash embedding when the
    /// service is missing or failing. Empty input yields empty output.
    pub async fn embed_texts(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }
        if let Some(service) = &self.service {
            match service.embed(texts).await {
                Ok(embeddings) if embeddings.len() == texts.len() => return embeddings,
                Ok(_) => {
                    tracing::warn!("embedding response length mismatch, using hash embeddings");
                }
                Err(error) => {
                    tracing::warn!(%error, "embedding request failed, using hash embeddings");
                }
            }
        }
        texts.iter().map(|text| hash_embedding(text)).collect()
    }

    /// Deterministic fallback rendering for the requested variant set.
    pub fn fallback_outcome(&self, request: &GenerationRequest<'_>) -> GenerationOutcome {
        let (variants, recommended, global_flags) = fallback::render_fallback_variants(
            request.parent,
            request.company,
            request.contact,
            request.variant_mode.ids(),
            &self.rewrite_targets,
        );
        GenerationOutcome { variants, recommended_variant: recommended, global_flags }
    }

    /// Run the generation state machine for one item.
    pub async fn generate_campaign_variants(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<GenerationOutcome, GenerationError> {
        let Some(service) = self.service.clone() else {
            return match request.policy {
                LlmPolicy::Strict => Err(GenerationError::Unavailable),
                LlmPolicy::Fallback => Ok(self.fallback_outcome(request)),
            };
        };

        let mut attempt: u32 = 0;
        loop {
            match self.attempt_generation(service.as_ref(), request).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    let message = format!("{error:#}");
                    if is_fatal_error(&message) {
                        return Err(GenerationError::Fatal(message));
                    }
                    if attempt >= request.max_retries {
                        return match request.policy {
                            LlmPolicy::Strict => Err(GenerationError::RetriesExhausted {
                                attempts: attempt + 1,
                                message,
                            }),
                            LlmPolicy::Fallback => {
                                tracing::warn!(
                                    company = %request.company.company_name,
                                    "retries exhausted, degrading to template renderer"
                                );
                                Ok(self.fallback_outcome(request))
                            }
                        };
                    }
                    let delay = request.backoff_base_seconds * 2f64.powi(attempt as i32);
                    tracing::debug!(attempt, delay_seconds = delay, %message, "transient generation error");
                    (self.sleeper)(Duration::from_secs_f64(delay.max(0.0))).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One CALL -> PARSE -> CLEAN -> CHECK -> [REPAIR] -> ACCEPT pass.
    async fn attempt_generation(
        &self,
        service: &dyn ChatService,
        request: &GenerationRequest<'_>,
    ) -> Result<GenerationOutcome> {
        let requested = request.variant_mode.ids();
        let seed_template = request.parent.outreach_seed_template.as_str();

        let user_payload = prompts::build_generation_payload(
            request.parent,
            request.company,
            request.contact,
            request.dossier,
            request.knowledge_snippets,
            requested,
            &self.rewrite_targets,
        );
        let raw_response =
            service.chat(prompts::GENERATION_SYSTEM_PROMPT, &user_payload, true).await?;

        let parsed = parse::parse_generation_response(&raw_response, requested)?;

        let mut variants: Vec<DraftEmailVariant> = Vec::new();
        let mut global_flags: BTreeSet<String> = BTreeSet::new();
        for raw in parsed.variants {
            let variant_id = raw.variant.clone().unwrap_or_else(|| "A".to_string());
            if !requested.contains(&variant_id.as_str()) {
                continue;
            }
            if variants.iter().any(|v| v.variant == variant_id) {
                continue;
            }
            let variant = self
                .finish_variant(service, request, seed_template, &variant_id, &raw)
                .await;
            global_flags.extend(variant.risk_flags.iter().cloned());
            variants.push(variant);
        }

        // Completeness: fill any missing requested id from the deterministic
        // renderer, then fix order and count.
        let missing: Vec<&str> = requested
            .iter()
            .filter(|id| !variants.iter().any(|v| v.variant == **id))
            .copied()
            .collect();
        if !missing.is_empty() {
            let (fallback_variants, _, fallback_flags) = fallback::render_fallback_variants(
                request.parent,
                request.company,
                request.contact,
                &missing,
                &self.rewrite_targets,
            );
            global_flags.extend(fallback_flags);
            variants.extend(fallback_variants);
        }
        variants.sort_by(|a, b| a.variant.cmp(&b.variant));
        variants.truncate(requested.len());

        let recommended = normalize_recommended(parsed.recommended_variant.as_deref(), &variants);

        Ok(GenerationOutcome {
            variants,
            recommended_variant: recommended,
            global_flags: global_flags.into_iter().collect(),
        })
    }

    /// Clean, guard, gate and (when needed) repair one variant.
    async fn finish_variant(
        &self,
        service: &dyn ChatService,
        request: &GenerationRequest<'_>,
        seed_template: &str,
        variant_id: &str,
        raw: &parse::RawVariant,
    ) -> DraftEmailVariant {
        let subject = normalize_subject(raw.subject.as_deref().unwrap_or(DEFAULT_SUBJECT));
        let body = normalize_body(raw.body.as_deref().unwrap_or(""));
        let cta = raw
            .cta
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&request.parent.cta_policy)
            .to_string();
        let confidence = raw.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0);

        let guarded =
            apply_claim_guard(&format!("{}\n\n{}", subject, body), &request.parent.no_go_claims);
        let (subject, body) = match guarded.text.split_once("\n\n") {
            Some((subject_part, body_part)) => {
                (normalize_subject(subject_part), normalize_body(body_part))
            }
            None => (subject, normalize_body(&guarded.text)),
        };
        let mut flags: BTreeSet<String> = guarded.flags.into_iter().collect();

        let quality_flags =
            quality::check(&subject, &body, variant_id, seed_template, &self.rewrite_targets);
        if quality_flags.is_empty() {
            return DraftEmailVariant {
                variant: variant_id.to_string(),
                subject,
                body,
                cta,
                risk_flags: flags.into_iter().collect(),
                confidence,
            };
        }

        let repaired = self
            .repair_variant(service, seed_template, variant_id, &subject, &body, &quality_flags)
            .await;

        let (subject, body) = match repaired {
            Some((repaired_subject, repaired_body)) => {
                let repaired_subject = normalize_subject(&repaired_subject);
                let repaired_body = normalize_body(&repaired_body);
                let residual = quality::check(
                    &repaired_subject,
                    &repaired_body,
                    variant_id,
                    seed_template,
                    &self.rewrite_targets,
                );
                if residual.is_empty() {
                    flags.insert("quality_repaired".to_string());
                    (repaired_subject, repaired_body)
                } else if quality::has_hard_flag(&residual) {
                    // Repair did not clear the blocking flags: keep the
                    // original text and mark the variant blocked.
                    flags.insert("failed_copy_guard".to_string());
                    flags.extend(residual);
                    (subject, body)
                } else {
                    // Soft-only residue: the repaired text is still the
                    // better draft. Deliberate policy, do not block.
                    flags.insert("quality_repaired".to_string());
                    flags.extend(residual);
                    (repaired_subject, repaired_body)
                }
            }
            None => {
                if quality::has_hard_flag(&quality_flags) {
                    flags.insert("failed_copy_guard".to_string());
                }
                flags.extend(quality_flags);
                (subject, body)
            }
        };

        DraftEmailVariant {
            variant: variant_id.to_string(),
            subject,
            body,
            cta,
            risk_flags: flags.into_iter().collect(),
            confidence,
        }
    }

    /// One repair sub-call. Failures and empty fields resolve to `None`.
    async fn repair_variant(
        &self,
        service: &dyn ChatService,
        seed_template: &str,
        variant_id: &str,
        subject: &str,
        body: &str,
        flags: &[String],
    ) -> Option<(String, String)> {
        let payload = prompts::build_repair_payload(
            seed_template,
            subject,
            body,
            self.rewrite_targets.for_variant(variant_id),
            flags,
        );
        match service.chat(prompts::REPAIR_SYSTEM_PROMPT, &payload, true).await {
            Ok(response) => parse::parse_repair_response(&response),
            Err(error) => {
                tracing::debug!(variant = variant_id, %error, "repair sub-call failed");
                None
            }
        }
    }
}

fn is_fatal_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    FATAL_ERROR_TOKENS.iter().any(|token| lowered.contains(token))
}

fn normalize_recommended(value: Option<&str>, variants: &[DraftEmailVariant]) -> String {
    let candidate = value.unwrap_or("A").trim().to_uppercase();
    if variants.iter().any(|v| v.variant == candidate) {
        return candidate;
    }
    variants.first().map(|v| v.variant.clone()).unwrap_or_else(|| "A".to_string())
}

/// Single line, collapsed whitespace, capped length.
fn normalize_subject(raw: &str) -> String {
    let single_line: String = raw.replace(['\r', '\n'], " ");
    let collapsed = crate::util::collapse_ws(&single_line);
    let trimmed = collapsed.trim_start_matches("Oggetto:").trim();
    trimmed.chars().take(SUBJECT_CLEAN_CAP).collect()
}

/// Normalized line endings, blank runs collapsed to one blank line, trimmed.
fn normalize_body(raw: &str) -> String {
    let unix = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unix.len());
    let mut newline_run = 0usize;
    for c in unix.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
        } else {
            newline_run = 0;
            out.push(c);
        }
    }
    out.trim().to_string()
}
