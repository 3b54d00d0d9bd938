//! Response parsing for the generation gateway.
//!
//! The generative service answers with JSON, but the variant list arrives in
//! one of three wire shapes: an array of objects, an array of JSON-encoded
//! strings, or an object keyed by variant id. Everything is normalized into
//! one uniform list here; the shapes stay pinned as regression fixtures in
//! the tests below.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;

/// One variant as it came off the wire, before cleaning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVariant {
    pub variant: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub cta: Option<String>,
    pub confidence: Option<f64>,
}

/// Parsed generation response: uniform variant list plus the service's
/// recommendation, if any.
#[derive(Debug, Clone)]
pub struct ParsedGeneration {
    pub variants: Vec<RawVariant>,
    pub recommended_variant: Option<String>,
}

/// Strip markdown code fences from a response.
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Fix common JSON issues in LLM output: trailing commas, smart quotes,
/// stray control characters.
pub fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Parse the top-level generation response.
pub fn parse_generation_response(
    response: &str,
    preferred_order: &[&str],
) -> Result<ParsedGeneration> {
    let clean = strip_markdown_fences(response);
    // A bare-array response must not be narrowed to its first inner object.
    let fragment = if clean.trim_start().starts_with('[') {
        extract_json_fragment(clean, '[', ']')
    } else {
        extract_json_fragment(clean, '{', '}')
    }
    .ok_or_else(|| anyhow!("no JSON found in generation response"))?;
    let sanitized = fix_json_issues(fragment);

    let value: Value = serde_json::from_str(&sanitized)
        .map_err(|e| anyhow!("malformed generation response: {e}"))?;

    let (variants_value, recommended) = match &value {
        Value::Object(map) => {
            let variants = map
                .get("variants")
                .cloned()
                .unwrap_or(Value::Array(Vec::new()));
            let recommended = map
                .get("recommended_variant")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty());
            (variants, recommended)
        }
        Value::Array(_) => (value.clone(), None),
        _ => return Err(anyhow!("generation response is neither object nor array")),
    };

    Ok(ParsedGeneration {
        variants: coerce_variants_raw(&variants_value, preferred_order),
        recommended_variant: recommended,
    })
}

/// Normalize the three documented wire shapes into a uniform variant list.
///
/// A variant that arrives without an id is assigned the next expected id in
/// request order.
pub fn coerce_variants_raw(value: &Value, preferred_order: &[&str]) -> Vec<RawVariant> {
    let mut out: Vec<RawVariant> = Vec::new();

    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) => {
                        if let Ok(variant) =
                            serde_json::from_value::<RawVariant>(item.clone())
                        {
                            out.push(variant);
                        }
                    }
                    // Array of JSON-encoded strings.
                    Value::String(encoded) => {
                        let sanitized = fix_json_issues(strip_markdown_fences(encoded));
                        if let Ok(variant) = serde_json::from_str::<RawVariant>(&sanitized) {
                            out.push(variant);
                        }
                    }
                    _ => {}
                }
            }
        }
        // Object keyed by variant id; request order first, then leftovers.
        Value::Object(map) => {
            let mut seen: Vec<String> = Vec::new();
            for id in preferred_order {
                if let Some(item) = map.get(*id) {
                    if let Ok(mut variant) = serde_json::from_value::<RawVariant>(item.clone()) {
                        variant.variant = Some((*id).to_string());
                        seen.push((*id).to_string());
                        out.push(variant);
                    }
                }
            }
            for (key, item) in map {
                if seen.iter().any(|s| s == key) {
                    continue;
                }
                if let Ok(mut variant) = serde_json::from_value::<RawVariant>(item.clone()) {
                    variant.variant = Some(key.to_uppercase());
                    out.push(variant);
                }
            }
        }
        _ => {}
    }

    for (index, variant) in out.iter_mut().enumerate() {
        let id = variant
            .variant
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase);
        variant.variant = Some(id.unwrap_or_else(|| default_variant_id(index, preferred_order)));
    }

    out
}

fn default_variant_id(index: usize, preferred_order: &[&str]) -> String {
    preferred_order
        .get(index)
        .map(|id| id.to_string())
        .unwrap_or_else(|| ((b'A' + (index as u8 % 26)) as char).to_string())
}

/// Parse the repair sub-call response into a corrected pair.
///
/// Returns `None` when the response is unusable or either field is empty —
/// the gateway then falls back to the original text.
pub fn parse_repair_response(response: &str) -> Option<(String, String)> {
    #[derive(Deserialize)]
    struct RepairedPair {
        subject: Option<String>,
        body: Option<String>,
    }

    let clean = strip_markdown_fences(response);
    let fragment = extract_json_fragment(clean, '{', '}')?;
    let sanitized = fix_json_issues(fragment);
    let parsed: RepairedPair = serde_json::from_str(&sanitized).ok()?;

    let subject = parsed.subject.map(|s| s.trim().to_string()).unwrap_or_default();
    let body = parsed.body.map(|s| s.trim().to_string()).unwrap_or_default();
    if subject.is_empty() || body.is_empty() {
        return None;
    }
    Some((subject, body))
}
