use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::content::NotionSettings;
use crate::database::Channel;
use crate::stage::StageMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelegramMode {
    Webhook,
    Polling,
    Disabled,
}

impl TelegramMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "webhook" => Some(TelegramMode::Webhook),
            "polling" | "poll" | "long_polling" => Some(TelegramMode::Polling),
            "disabled" | "off" | "none" => Some(TelegramMode::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_mode")]
    pub mode: TelegramMode,
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` header on webhook calls.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_telegram_mode() -> TelegramMode {
    TelegramMode::Disabled
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            mode: default_telegram_mode(),
            bot_token: None,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// "required" or "disabled".
    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub cron_secret: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_auth_mode() -> String {
    "required".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_mode: default_auth_mode(),
            token: None,
            cron_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuideConfig {
    // LLM configuration (OpenAI-compatible endpoint)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Optional persona TOML; the built-in persona is used otherwise.
    #[serde(default)]
    pub persona_path: Option<String>,

    // Conversation context
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_reflections_in_prompt")]
    pub reflections_in_prompt: usize,
    #[serde(default = "default_web_max_tokens")]
    pub web_max_tokens: u32,
    #[serde(default = "default_bridge_max_tokens")]
    pub bridge_max_tokens: u32,
    #[serde(default = "default_unregistered_max_tokens")]
    pub unregistered_max_tokens: u32,

    // Memory summary
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: usize,
    #[serde(default = "default_memory_channel")]
    pub memory_channel: Channel,
    #[serde(default = "default_memory_summary_max_chars")]
    pub memory_summary_max_chars: usize,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,

    #[serde(default = "default_reflection_max_chars")]
    pub reflection_max_chars: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Replaces the built-in risk phrase list when set.
    #[serde(default)]
    pub risk_keywords: Option<Vec<String>>,
    #[serde(default)]
    pub stage_map: Option<StageMap>,

    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub notion: NotionSettings,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    30
}

fn default_database_path() -> String {
    "innerpath.db".to_string()
}

fn default_history_window() -> usize {
    20
}

fn default_reflections_in_prompt() -> usize {
    5
}

fn default_web_max_tokens() -> u32 {
    1500
}

fn default_bridge_max_tokens() -> u32 {
    800
}

fn default_unregistered_max_tokens() -> u32 {
    300
}

fn default_memory_threshold() -> usize {
    20
}

fn default_memory_channel() -> Channel {
    Channel::Bridge
}

fn default_memory_summary_max_chars() -> usize {
    2000
}

fn default_summary_max_tokens() -> u32 {
    600
}

fn default_reflection_max_chars() -> usize {
    500
}

fn default_retention_days() -> i64 {
    90
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            generation_timeout_secs: default_generation_timeout_secs(),
            database_path: default_database_path(),
            persona_path: None,
            history_window: default_history_window(),
            reflections_in_prompt: default_reflections_in_prompt(),
            web_max_tokens: default_web_max_tokens(),
            bridge_max_tokens: default_bridge_max_tokens(),
            unregistered_max_tokens: default_unregistered_max_tokens(),
            memory_threshold: default_memory_threshold(),
            memory_channel: default_memory_channel(),
            memory_summary_max_chars: default_memory_summary_max_chars(),
            summary_max_tokens: default_summary_max_tokens(),
            reflection_max_chars: default_reflection_max_chars(),
            retention_days: default_retention_days(),
            risk_keywords: None,
            stage_map: None,
            server: ServerConfig::default(),
            telegram: TelegramConfig::default(),
            notion: NotionSettings::default(),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl GuideConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `INNERPATH_CONFIG` if set, else innerpath_config.toml next to the executable.
    pub fn config_path() -> PathBuf {
        env::var("INNERPATH_CONFIG")
            .ok()
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::get_base_dir().join("innerpath_config.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Load the config file if present, then apply environment overrides.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = if path.exists() {
            match Self::load_from_path(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("{:#}", e);
                    Self::default()
                }
            }
        } else {
            tracing::warn!("No config file found, using defaults + env vars");
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Save config to the resolved config path
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults plus environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("LLM_API_URL").and_then(non_empty) {
            self.llm_api_url = url;
        }
        if let Some(model) = lookup("LLM_MODEL").and_then(non_empty) {
            self.llm_model = model;
        }
        if let Some(key) = lookup("LLM_API_KEY").and_then(non_empty) {
            self.llm_api_key = Some(key);
        }
        if let Some(secs) = lookup("INNERPATH_GENERATION_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.generation_timeout_secs = secs;
        }
        if let Some(path) = lookup("INNERPATH_DATABASE_PATH").and_then(non_empty) {
            self.database_path = path;
        }
        if let Some(path) = lookup("INNERPATH_PERSONA_PATH").and_then(non_empty) {
            self.persona_path = Some(path);
        }
        if let Some(n) = lookup("INNERPATH_HISTORY_WINDOW").and_then(|v| v.trim().parse().ok()) {
            self.history_window = n;
        }
        if let Some(n) = lookup("INNERPATH_MEMORY_THRESHOLD").and_then(|v| v.trim().parse().ok()) {
            self.memory_threshold = n;
        }
        if let Some(days) = lookup("INNERPATH_RETENTION_DAYS").and_then(|v| v.trim().parse().ok()) {
            self.retention_days = days;
        }

        if let Some(bind) = lookup("INNERPATH_BACKEND_BIND").and_then(non_empty) {
            self.server.bind = bind;
        }
        if let Some(mode) = lookup("INNERPATH_BACKEND_AUTH_MODE").and_then(non_empty) {
            self.server.auth_mode = mode;
        }
        if let Some(token) = lookup("INNERPATH_BACKEND_TOKEN").and_then(non_empty) {
            self.server.token = Some(token);
        }
        if let Some(secret) = lookup("CRON_SECRET").and_then(non_empty) {
            self.server.cron_secret = Some(secret);
        }

        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN").and_then(non_empty) {
            self.telegram.bot_token = Some(token);
        }
        if let Some(secret) = lookup("TELEGRAM_WEBHOOK_SECRET").and_then(non_empty) {
            self.telegram.webhook_secret = Some(secret);
        }
        if let Some(raw) = lookup("TELEGRAM_MODE") {
            match TelegramMode::parse(&raw) {
                Some(mode) => self.telegram.mode = mode,
                None => tracing::warn!("Ignoring unknown TELEGRAM_MODE '{}'", raw),
            }
        }
        if let Some(raw) = lookup("TELEGRAM_POLLING") {
            if parse_flag(raw.trim()) {
                self.telegram.mode = TelegramMode::Polling;
            }
        }

        if let Some(token) = lookup("NOTION_TOKEN").and_then(non_empty) {
            self.notion.token = token;
        }
        if let Some(id) = lookup("NOTION_DATABASE_EPISODI").and_then(non_empty) {
            self.notion.episodes_database_id = id;
        }
        if let Some(id) = lookup("NOTION_DATABASE_SETTIMANE").and_then(non_empty) {
            self.notion.weeks_database_id = id;
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.history_window == 0 {
            anyhow::bail!("history_window must be at least 1");
        }
        if self.memory_threshold == 0 {
            anyhow::bail!("memory_threshold must be at least 1");
        }
        if self.reflection_max_chars == 0 {
            anyhow::bail!("reflection_max_chars must be at least 1");
        }
        if self.generation_timeout_secs == 0 {
            anyhow::bail!("generation_timeout_secs must be at least 1");
        }
        if self.retention_days <= 0 {
            anyhow::bail!("retention_days must be positive");
        }
        if self.telegram.mode != TelegramMode::Disabled && self.telegram.bot_token.is_none() {
            anyhow::bail!("telegram.bot_token is required when telegram.mode is not 'disabled'");
        }
        if let Some(map) = &self.stage_map {
            if map.groups.is_empty() {
                anyhow::bail!("stage_map must contain at least one group");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: GuideConfig = toml::from_str(
            r#"
            llm_model = "mistral"
            memory_threshold = 10

            [telegram]
            mode = "polling"
            bot_token = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.llm_model, "mistral");
        assert_eq!(config.memory_threshold, 10);
        assert_eq!(config.history_window, 20);
        assert_eq!(config.reflection_max_chars, 500);
        assert_eq!(config.memory_channel, Channel::Bridge);
        assert_eq!(config.telegram.mode, TelegramMode::Polling);
        assert_eq!(config.server.auth_mode, "required");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("LLM_MODEL", "gpt-4o-mini"),
            ("INNERPATH_DATABASE_PATH", "/tmp/guide.db"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_MODE", "webhook"),
            ("CRON_SECRET", "  "),
            ("INNERPATH_HISTORY_WINDOW", "not a number"),
        ]
        .into_iter()
        .collect();
        let mut config = GuideConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.llm_model, "gpt-4o-mini");
        assert_eq!(config.database_path, "/tmp/guide.db");
        assert_eq!(config.telegram.mode, TelegramMode::Webhook);
        assert_eq!(config.telegram.bot_token.as_deref(), Some("123:abc"));
        assert!(config.server.cron_secret.is_none());
        assert_eq!(config.history_window, 20);
    }

    #[test]
    fn telegram_without_token_is_invalid() {
        let mut config = GuideConfig::default();
        config.telegram.mode = TelegramMode::Webhook;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("innerpath_config.toml");
        let mut config = GuideConfig::default();
        config.stage_map = Some(StageMap::default());
        config.risk_keywords = Some(vec!["crisi".into()]);
        fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = GuideConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.stage_map, Some(StageMap::default()));
        assert_eq!(loaded.risk_keywords, Some(vec!["crisi".to_string()]));
    }
}
