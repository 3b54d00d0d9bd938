//! Knowledge ingestion and retrieval-query building for the RAG path.
//!
//! Accepts markdown/plain-text sources, chunks them with overlap, embeds
//! through the gateway (hash fallback included) and hands everything to the
//! store. Retrieval happens in the store via cosine search.

use crate::enrichment::EnrichmentDossier;
use crate::leads::LeadCompany;
use crate::llm::LlmGateway;
use crate::store::Store;
use crate::util::collapse_ws;
use anyhow::{bail, Context, Result};
use std::path::Path;

const CHUNK_SIZE: usize = 1300;
const CHUNK_OVERLAP: usize = 220;

#[derive(Debug, Clone)]
pub struct KnowledgeIngestResult {
    pub parent_slug: String,
    pub source_path: String,
    pub kind: String,
    pub chunks_total: usize,
    pub embeddings_used: bool,
}

/// Split normalized text into overlapping chunks.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let normalized = collapse_ws(text);
    if normalized.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = normalized.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap);
    }
    chunks
}

/// Ingest one knowledge file for a parent profile.
pub async fn ingest_knowledge_file(
    store: &Store,
    gateway: &LlmGateway,
    parent_slug: &str,
    file_path: &Path,
    kind: &str,
) -> Result<KnowledgeIngestResult> {
    let extension = file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !matches!(extension.as_str(), "md" | "markdown" | "txt") {
        bail!("unsupported knowledge file type .{extension}: use Markdown or plain text");
    }

    let raw = std::fs::read(file_path)
        .with_context(|| format!("failed to read {}", file_path.display()))?;
    let source_hash = blake3::hash(&raw).to_hex().to_string();
    let text = String::from_utf8_lossy(&raw).to_string();
    let chunks = chunk_text(&text, CHUNK_SIZE, CHUNK_OVERLAP);

    let document_id = store.upsert_knowledge_document(
        parent_slug,
        kind,
        &file_path.display().to_string(),
        &source_hash,
    )?;

    let embeddings = gateway.embed_texts(&chunks).await;
    store.insert_knowledge_chunks(&document_id, parent_slug, kind, &chunks, &embeddings)?;

    Ok(KnowledgeIngestResult {
        parent_slug: parent_slug.to_string(),
        source_path: file_path.display().to_string(),
        kind: kind.to_string(),
        chunks_total: chunks.len(),
        embeddings_used: !embeddings.is_empty(),
    })
}

/// Compose the retrieval query for one item from company and dossier hints.
pub fn build_retrieval_query(company: &LeadCompany, dossier: &EnrichmentDossier) -> String {
    let mut hints: Vec<String> = vec![company.company_name.clone()];
    if let Some(industry) = &company.industry {
        hints.push(industry.clone());
    }
    if let Some(keywords) = &company.keywords {
        hints.push(keywords.clone());
    }
    hints.push(dossier.pain_hypotheses.iter().take(2).cloned().collect::<Vec<_>>().join(" "));
    hints.push(
        dossier.opportunity_hypotheses.iter().take(2).cloned().collect::<Vec<_>>().join(" "),
    );

    hints.into_iter().filter(|part| !part.trim().is_empty()).collect::<Vec<_>>().join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_text_overlaps() {
        let text = "abcdefghij".repeat(30); // 300 chars
        let chunks = chunk_text(&text, 100, 20);
        assert!(chunks.len() >= 3);
        // Consecutive chunks share the overlap window.
        let first_tail: String = chunks[0].chars().skip(80).collect();
        assert!(chunks[1].starts_with(&first_tail));
    }

    #[test]
    fn test_chunk_text_empty_and_whitespace() {
        assert!(chunk_text("", 100, 20).is_empty());
        assert!(chunk_text("   \n\t ", 100, 20).is_empty());
    }

    #[test]
    fn test_chunk_text_short_input_single_chunk() {
        let chunks = chunk_text("breve testo di prova", 100, 20);
        assert_eq!(chunks, vec!["breve testo di prova".to_string()]);
    }

    #[test]
    fn test_build_retrieval_query_skips_empty_hints() {
        let company = LeadCompany {
            company_key: "acme".to_string(),
            company_name: "Acme".to_string(),
            website: None,
            linkedin_company: None,
            industry: Some("machinery".to_string()),
            employee_count: None,
            location: None,
            keywords: None,
            tech: None,
            founded_year: None,
            evidence: Vec::new(),
        };
        let dossier = EnrichmentDossier {
            pain_hypotheses: vec!["pressione su efficienza".to_string()],
            ..EnrichmentDossier::default()
        };
        let query = build_retrieval_query(&company, &dossier);
        assert_eq!(query, "Acme | machinery | pressione su efficienza");
    }
}
