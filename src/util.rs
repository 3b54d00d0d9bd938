//! Small shared helpers: truncation, slugs, whitespace compaction.

use chrono::Utc;

/// Truncate a string for display (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Lowercase ascii slug; spaces become dashes, everything else is dropped.
pub fn slugify(value: &str) -> String {
    let lowered = value.to_lowercase().replace(' ', "-");
    let cleaned: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "item".to_string()
    } else {
        cleaned
    }
}

/// RFC 3339 timestamp for persisted records.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Collapse all whitespace runs into single spaces and trim.
pub fn collapse_ws(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-compact each line and keep at most `limit` non-empty ones.
pub fn compact_lines<I, S>(lines: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for item in lines {
        let compact = collapse_ws(item.as_ref());
        if compact.is_empty() {
            continue;
        }
        out.push(compact);
        if out.len() >= limit {
            break;
        }
    }
    out
}

/// Split a `;`- or `,`-separated value into trimmed non-empty items.
pub fn ensure_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let sep = if trimmed.contains(';') {
        ';'
    } else if trimmed.contains(',') {
        ','
    } else {
        return vec![trimmed.to_string()];
    };
    trimmed
        .split(sep)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
