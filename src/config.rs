//! Configuration: JSON config file with environment overrides.
//!
//! File: `<config dir>/mailforge/config.json`. Environment always wins so
//! CI and one-off runs can redirect the data dir or inject a credential
//! without touching the file. A corrupt config is backed up and replaced by
//! defaults rather than aborting.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-5";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone)]
pub struct Config {
    /// Generative-service credential; `None` leaves the service unconfigured.
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    /// Root of the JSON-file store.
    pub data_dir: PathBuf,
    pub retention_days: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    api_key: Option<String>,
    chat_model: Option<String>,
    embedding_model: Option<String>,
    data_dir: Option<PathBuf>,
    retention_days: Option<i64>,
}

impl Config {
    /// Load config from disk and environment.
    pub fn load() -> Self {
        let file = read_config_file();
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let api_key = env("MAILFORGE_API_KEY")
            .or_else(|| env("OPENAI_API_KEY"))
            .filter(|key| !key.trim().is_empty())
            .or(file.api_key);

        let chat_model = env("MAILFORGE_CHAT_MODEL")
            .or(file.chat_model)
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string());
        let embedding_model = env("MAILFORGE_EMBED_MODEL")
            .or(file.embedding_model)
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());

        let data_dir = env("MAILFORGE_HOME")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(default_data_dir);

        let retention_days = env("MAILFORGE_RETENTION_DAYS")
            .and_then(|raw| raw.parse().ok())
            .or(file.retention_days)
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        Self { api_key, chat_model, embedding_model, data_dir, retention_days }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("mailforge"))
        .unwrap_or_else(|| PathBuf::from(".mailforge"))
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mailforge").join("config.json"))
}

fn read_config_file() -> ConfigFile {
    let Some(path) = config_path() else {
        return ConfigFile::default();
    };
    let Ok(content) = fs::read_to_string(&path) else {
        return ConfigFile::default();
    };
    match serde_json::from_str(&content) {
        Ok(file) => file,
        Err(error) => {
            let backup = path.with_extension("json.corrupt");
            let _ = fs::write(&backup, &content);
            tracing::warn!(
                path = %path.display(),
                %error,
                "config file was corrupt; backup saved, defaults loaded"
            );
            ConfigFile::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_with_empty_sources() {
        let config = Config::resolve(ConfigFile::default(), |_| None);
        assert!(config.api_key.is_none());
        assert_eq!(config.chat_model, DEFAULT_CHAT_MODEL);
        assert_eq!(config.retention_days, DEFAULT_RETENTION_DAYS);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            api_key: Some("file-key".to_string()),
            chat_model: Some("file-model".to_string()),
            ..ConfigFile::default()
        };
        let config = Config::resolve(file, |name| match name {
            "MAILFORGE_API_KEY" => Some("env-key".to_string()),
            "MAILFORGE_RETENTION_DAYS" => Some("30".to_string()),
            _ => None,
        });
        assert_eq!(config.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.chat_model, "file-model");
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn test_blank_env_key_falls_back_to_file() {
        let file = ConfigFile { api_key: Some("file-key".to_string()), ..ConfigFile::default() };
        let config = Config::resolve(file, |name| match name {
            "MAILFORGE_API_KEY" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.api_key.as_deref(), Some("file-key"));
    }
}
