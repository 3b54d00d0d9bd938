//! Durable store for profiles, campaigns and knowledge chunks.
//!
//! Everything lives as serde_json files under the data dir. Writes take an
//! advisory file lock (plus an in-process mutex) so concurrent workers and
//! concurrent CLI invocations do not interleave read-modify-write cycles.

use crate::campaign::CampaignSummary;
use crate::profile::ParentProfile;
use crate::util::utc_now_iso;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const PROFILES_FILE: &str = "profiles.json";
const CAMPAIGNS_FILE: &str = "campaigns.json";
const KNOWLEDGE_FILE: &str = "knowledge.json";
const LOCK_FILE: &str = ".mailforge.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: String,
    pub campaign_id: String,
    pub parent_slug: String,
    pub company_key: String,
    pub company_name: String,
    pub contact_name: String,
    pub contact_title: String,
    pub contact_email: String,
    /// Full generation payload: variants, selection, dossier, flags.
    pub payload: serde_json::Value,
    pub status: String,
    #[serde(default)]
    pub reviewer_notes: String,
    #[serde(default)]
    pub approved_variant: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCampaign {
    pub id: String,
    pub parent_slug: String,
    pub leads_file: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub summary: Option<CampaignSummary>,
    #[serde(default)]
    pub records: Vec<CampaignRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub parent_slug: String,
    pub kind: String,
    pub source_path: String,
    pub source_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub document_id: String,
    pub parent_slug: String,
    pub kind: String,
    pub chunk_index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KnowledgeState {
    documents: Vec<KnowledgeDocument>,
    chunks: Vec<KnowledgeChunk>,
}

#[derive(Debug, Clone)]
pub struct KnowledgeHit {
    pub content: String,
    pub similarity: f32,
}

pub struct Store {
    root: PathBuf,
    write_guard: Mutex<()>,
}

impl Store {
    /// Open (creating if needed) the store under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create data dir {}", root.display()))?;
        Ok(Self { root: root.to_path_buf(), write_guard: Mutex::new(()) })
    }

    // ── parent profiles ──────────────────────────────────────────────

    pub fn upsert_parent_profile(&self, profile: &ParentProfile) -> Result<()> {
        self.update_file(PROFILES_FILE, |profiles: &mut HashMap<String, ParentProfile>| {
            profiles.insert(profile.slug.clone(), profile.clone());
            Ok(())
        })
    }

    pub fn get_parent_profile(&self, slug: &str) -> Result<Option<ParentProfile>> {
        let profiles: HashMap<String, ParentProfile> = self.read_file(PROFILES_FILE)?;
        Ok(profiles.get(slug).cloned())
    }

    pub fn list_parent_profiles(&self) -> Result<Vec<ParentProfile>> {
        let profiles: HashMap<String, ParentProfile> = self.read_file(PROFILES_FILE)?;
        let mut out: Vec<ParentProfile> = profiles.into_values().collect();
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }

    // ── campaigns ────────────────────────────────────────────────────

    pub fn create_campaign(&self, parent_slug: &str, leads_file: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let campaign = StoredCampaign {
            id: id.clone(),
            parent_slug: parent_slug.to_string(),
            leads_file: leads_file.to_string(),
            status: "RUNNING".to_string(),
            started_at: utc_now_iso(),
            finished_at: None,
            summary: None,
            records: Vec::new(),
        };
        self.update_file(CAMPAIGNS_FILE, |campaigns: &mut HashMap<String, StoredCampaign>| {
            campaigns.insert(id.clone(), campaign);
            Ok(())
        })?;
        Ok(id)
    }

    pub fn insert_campaign_result(&self, record: CampaignRecord) -> Result<String> {
        let record_id = record.id.clone();
        self.update_file(CAMPAIGNS_FILE, |campaigns: &mut HashMap<String, StoredCampaign>| {
            let campaign = campaigns
                .get_mut(&record.campaign_id)
                .with_context(|| format!("unknown campaign {}", record.campaign_id))?;
            campaign.records.push(record.clone());
            Ok(())
        })?;
        Ok(record_id)
    }

    pub fn finalize_campaign(&self, campaign_id: &str, summary: &CampaignSummary) -> Result<()> {
        self.update_file(CAMPAIGNS_FILE, |campaigns: &mut HashMap<String, StoredCampaign>| {
            let campaign = campaigns
                .get_mut(campaign_id)
                .with_context(|| format!("unknown campaign {campaign_id}"))?;
            campaign.status = summary.status.clone();
            campaign.finished_at = Some(utc_now_iso());
            campaign.summary = Some(summary.clone());
            Ok(())
        })
    }

    pub fn get_campaign(&self, campaign_id: &str) -> Result<Option<StoredCampaign>> {
        let campaigns: HashMap<String, StoredCampaign> = self.read_file(CAMPAIGNS_FILE)?;
        Ok(campaigns.get(campaign_id).cloned())
    }

    /// Drop campaigns whose run started more than `retention_days` ago.
    pub fn purge_expired_campaigns(&self, retention_days: i64) -> Result<usize> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut removed = 0usize;
        self.update_file(CAMPAIGNS_FILE, |campaigns: &mut HashMap<String, StoredCampaign>| {
            campaigns.retain(|_, campaign| {
                let keep = DateTime::parse_from_rfc3339(&campaign.started_at)
                    .map(|started| started.with_timezone(&Utc) >= cutoff)
                    .unwrap_or(true);
                if !keep {
                    removed += 1;
                }
                keep
            });
            Ok(())
        })?;
        Ok(removed)
    }

    // ── knowledge ────────────────────────────────────────────────────

    /// Register (or refresh) a knowledge document; re-ingesting the same
    /// content hash replaces the previous chunks.
    pub fn upsert_knowledge_document(
        &self,
        parent_slug: &str,
        kind: &str,
        source_path: &str,
        source_hash: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let document = KnowledgeDocument {
            id: id.clone(),
            parent_slug: parent_slug.to_string(),
            kind: kind.to_string(),
            source_path: source_path.to_string(),
            source_hash: source_hash.to_string(),
            created_at: utc_now_iso(),
        };
        self.update_file(KNOWLEDGE_FILE, |state: &mut KnowledgeState| {
            let stale: Vec<String> = state
                .documents
                .iter()
                .filter(|doc| {
                    doc.parent_slug == parent_slug
                        && doc.kind == kind
                        && doc.source_hash == source_hash
                })
                .map(|doc| doc.id.clone())
                .collect();
            state.documents.retain(|doc| !stale.contains(&doc.id));
            state.chunks.retain(|chunk| !stale.contains(&chunk.document_id));
            state.documents.push(document);
            Ok(())
        })?;
        Ok(id)
    }

    pub fn insert_knowledge_chunks(
        &self,
        document_id: &str,
        parent_slug: &str,
        kind: &str,
        chunks: &[String],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        self.update_file(KNOWLEDGE_FILE, |state: &mut KnowledgeState| {
            for (index, content) in chunks.iter().enumerate() {
                state.chunks.push(KnowledgeChunk {
                    id: Uuid::new_v4().to_string(),
                    document_id: document_id.to_string(),
                    parent_slug: parent_slug.to_string(),
                    kind: kind.to_string(),
                    chunk_index: index,
                    content: content.clone(),
                    embedding: embeddings.get(index).cloned().unwrap_or_default(),
                });
            }
            Ok(())
        })
    }

    pub fn list_knowledge_documents(&self, parent_slug: &str) -> Result<Vec<KnowledgeDocument>> {
        let state: KnowledgeState = self.read_file(KNOWLEDGE_FILE)?;
        Ok(state
            .documents
            .into_iter()
            .filter(|doc| doc.parent_slug == parent_slug)
            .collect())
    }

    /// Cosine top-k over the stored chunk embeddings.
    pub fn search_knowledge_chunks(
        &self,
        parent_slug: &str,
        kind: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<KnowledgeHit>> {
        let state: KnowledgeState = self.read_file(KNOWLEDGE_FILE)?;
        let mut scored: Vec<KnowledgeHit> = state
            .chunks
            .iter()
            .filter(|chunk| chunk.parent_slug == parent_slug && chunk.kind == kind)
            .map(|chunk| KnowledgeHit {
                content: chunk.content.clone(),
                similarity: cosine_similarity(query, &chunk.embedding),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    // ── file plumbing ────────────────────────────────────────────────

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_file<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("corrupt store file {}", path.display()))
    }

    fn update_file<T, F>(&self, name: &str, mutate: F) -> Result<()>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> Result<()>,
    {
        let _guard = self.write_guard.lock().expect("store mutex poisoned");
        let lock_path = self.path(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
        lock_file.lock_exclusive().context("failed to take store lock")?;

        let result = (|| {
            let mut state: T = self.read_file(name)?;
            mutate(&mut state)?;
            let path = self.path(name);
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_string_pretty(&state)?)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            fs::rename(&tmp, &path)
                .with_context(|| format!("failed to replace {}", path.display()))?;
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_profile;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_profile_roundtrip() {
        let (_dir, store) = store();
        assert!(store.get_parent_profile("azienda-a").unwrap().is_none());

        store.upsert_parent_profile(&test_profile()).unwrap();
        let loaded = store.get_parent_profile("azienda-a").unwrap().unwrap();
        assert_eq!(loaded.company_name, "Azienda A");
        assert_eq!(store.list_parent_profiles().unwrap().len(), 1);
    }

    #[test]
    fn test_campaign_lifecycle() {
        let (_dir, store) = store();
        let campaign_id = store.create_campaign("azienda-a", "leads.csv").unwrap();

        let record = CampaignRecord {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.clone(),
            parent_slug: "azienda-a".to_string(),
            company_key: "beta-srl".to_string(),
            company_name: "Beta SRL".to_string(),
            contact_name: "Anna Verdi".to_string(),
            contact_title: "Founder".to_string(),
            contact_email: "anna@example.com".to_string(),
            payload: serde_json::json!({"selected_variant": "A"}),
            status: "PENDING".to_string(),
            reviewer_notes: String::new(),
            approved_variant: String::new(),
            created_at: utc_now_iso(),
            updated_at: utc_now_iso(),
        };
        store.insert_campaign_result(record).unwrap();

        let loaded = store.get_campaign(&campaign_id).unwrap().unwrap();
        assert_eq!(loaded.status, "RUNNING");
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].payload["selected_variant"], "A");
    }

    #[test]
    fn test_purge_keeps_recent_campaigns() {
        let (_dir, store) = store();
        store.create_campaign("azienda-a", "leads.csv").unwrap();
        let removed = store.purge_expired_campaigns(90).unwrap();
        assert_eq!(removed, 0);
        let campaigns: HashMap<String, StoredCampaign> =
            store.read_file(CAMPAIGNS_FILE).unwrap();
        assert_eq!(campaigns.len(), 1);
    }

    #[test]
    fn test_knowledge_search_ranks_by_cosine() {
        let (_dir, store) = store();
        let doc_id = store
            .upsert_knowledge_document("azienda-a", "marketing", "notes.md", "hash-1")
            .unwrap();
        store
            .insert_knowledge_chunks(
                &doc_id,
                "azienda-a",
                "marketing",
                &["primo".to_string(), "secondo".to_string()],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .unwrap();

        let hits = store
            .search_knowledge_chunks("azienda-a", "marketing", &[0.9, 0.1], 1)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "primo");

        // Re-ingesting the same hash replaces the old chunks.
        let doc_id2 = store
            .upsert_knowledge_document("azienda-a", "marketing", "notes.md", "hash-1")
            .unwrap();
        store
            .insert_knowledge_chunks(
                &doc_id2,
                "azienda-a",
                "marketing",
                &["terzo".to_string()],
                &[vec![1.0, 0.0]],
            )
            .unwrap();
        let hits = store
            .search_knowledge_chunks("azienda-a", "marketing", &[1.0, 0.0], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "terzo");
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
