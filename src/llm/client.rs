//! Chat/embedding service access.
//!
//! `ChatService` is the seam the generation gateway talks through; the
//! production implementation is an OpenAI-compatible HTTP client. Tests and
//! the fallback path never touch the network.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Dimensionality shared by service embeddings and the hash fallback.
pub const EMBEDDING_DIM: usize = 1536;

/// Narrow contract over the generative text service.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// One chat completion; returns the raw assistant text.
    async fn chat(&self, system: &str, user: &str, json_mode: bool) -> Result<String>;

    /// Embed a batch of texts. Empty input must yield empty output.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// OpenAI-compatible HTTP client.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    embedding_model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, chat_model: String, embedding_model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            chat_model,
            embedding_model,
        }
    }

    #[allow(dead_code)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl ChatService for OpenAiClient {
    async fn chat(&self, system: &str, user: &str, json_mode: bool) -> Result<String> {
        let request = ChatRequest {
            model: self.chat_model.clone(),
            messages: vec![
                Message { role: "system".to_string(), content: system.to_string() },
                Message { role: "user".to_string(), content: user.to_string() },
            ],
            response_format: json_mode
                .then(|| ResponseFormat { format_type: "json_object".to_string() }),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .context("chat request failed")?;

        let status = response.status();
        let text = response.text().await.context("chat response unreadable")?;
        if !status.is_success() {
            return Err(status_error("chat", status, &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow!("malformed chat response: {e}: {}", crate::util::truncate(&text, 200)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat response carried no content"))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest { model: &self.embedding_model, input: texts };
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .context("embedding request failed")?;

        let status = response.status();
        let text = response.text().await.context("embedding response unreadable")?;
        if !status.is_success() {
            return Err(status_error("embedding", status, &text));
        }

        let parsed: EmbeddingResponse =
            serde_json::from_str(&text).context("malformed embedding response")?;
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// Shape an HTTP failure so the gateway's fatal-token classifier can see
/// what went wrong.
fn status_error(kind: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let detail = crate::util::truncate(body, 300);
    match status.as_u16() {
        401 | 403 => anyhow!("{kind} authentication failed ({status}): invalid api key: {detail}"),
        402 => anyhow!("{kind} billing problem ({status}): {detail}"),
        404 => anyhow!("{kind} model not found ({status}): {detail}"),
        429 => anyhow!("{kind} rate limited ({status}): {detail}"),
        _ => anyhow!("{kind} request failed ({status}): {detail}"),
    }
}

/// Deterministic embedding used when the service is unconfigured or failing.
///
/// Token hashes scatter signed unit weights over a fixed-size vector which is
/// then L2-normalized; same text, same vector, no network.
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    let lowered = text.to_lowercase();
    let tokens = lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| token.len() >= 2);

    let mut any = false;
    for token in tokens {
        any = true;
        let digest = blake3::hash(token.as_bytes());
        let bytes = digest.as_bytes();
        let idx = u16::from_be_bytes([bytes[0], bytes[1]]) as usize % EMBEDDING_DIM;
        let sign = if bytes[2] % 2 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign;
    }
    if !any {
        return vector;
    }

    let norm: f32 = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector;
    }
    vector.iter().map(|value| value / norm).collect()
}
