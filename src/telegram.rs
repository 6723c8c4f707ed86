//! Telegram bridge.
//!
//! Inbound updates reach [`handle_update`] either from the webhook route or
//! from the long-polling loop started by [`spawn_polling`]. The sender handle
//! (`message.from.id`) is mapped to a linked profile by the turn pipeline;
//! replies go back to `message.chat.id`.

use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;

use crate::database::Channel;
use crate::pipeline::TurnPipeline;

/// Telegram rejects messages longer than this.
pub const TELEGRAM_MAX_CHARS: usize = 4096;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

// ─── Outbound ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait MessagingBridge: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct TelegramBridge {
    api_base: String,
    client: reqwest::Client,
}

impl TelegramBridge {
    pub fn new(token: &str) -> Self {
        Self::with_api_base(format!("https://api.telegram.org/bot{}", token.trim()))
    }

    pub fn with_api_base(api_base: String) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn poll_updates(&self, offset: i64) -> Option<Vec<Update>> {
        let url = format!("{}/getUpdates", self.api_base);
        let params = serde_json::json!({
            "offset": offset,
            "timeout": 30,
            "allowed_updates": ["message"]
        });

        let resp = match self.client.post(&url).json(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                return None;
            }
        };

        let body: TelegramResponse<Vec<Update>> = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Telegram getUpdates parse error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                return None;
            }
        };

        if !body.ok {
            tracing::warn!(
                "Telegram API returned ok=false: {}",
                body.description.unwrap_or_default()
            );
            tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
            return None;
        }

        Some(body.result.unwrap_or_default())
    }
}

#[async_trait]
impl MessagingBridge for TelegramBridge {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        let url = format!("{}/sendMessage", self.api_base);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": truncate_for_telegram(text),
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Telegram sendMessage request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Telegram sendMessage failed: HTTP {}", resp.status());
        }
        tracing::debug!("Telegram: sent message to chat {}", chat_id);
        Ok(())
    }
}

// ─── Formatting ──────────────────────────────────────────────────────────────

pub fn truncate_for_telegram(text: &str) -> &str {
    match text.char_indices().nth(TELEGRAM_MAX_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn emphasis_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"\*\*([^*\n]+)\*\*", "$1"),
            (r"__([^_\n]+)__", "$1"),
            (r"(^|[\s(])\*([^*\n]+)\*", "$1$2"),
            (r"(^|[\s(])_([^_\n]+)_", "$1$2"),
            (r"(?m)^#{1,6}\s+", ""),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(re) => Some((re, replacement)),
            Err(e) => {
                tracing::error!("Invalid bridge formatting pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
    })
}

/// Drop markdown emphasis and headings, then fit Telegram's length limit.
pub fn sanitize_bridge_text(text: &str) -> String {
    let mut out = text.trim().to_string();
    for (re, replacement) in emphasis_patterns() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    truncate_for_telegram(&out).to_string()
}

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// Route one update through the pipeline and deliver the reply.
/// Returns false when the update carried nothing to answer.
pub async fn handle_update(
    pipeline: &TurnPipeline,
    bridge: &dyn MessagingBridge,
    update: Update,
) -> bool {
    let Some(message) = update.message else {
        return false;
    };
    let Some(text) = message.text.filter(|t| !t.trim().is_empty()) else {
        return false;
    };
    let chat_id = message.chat.id;
    let handle = message.from.map(|u| u.id).unwrap_or(chat_id).to_string();

    let reply = match pipeline.handle_bridge_message(&handle, &text).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!("Telegram: failed to handle message from {}: {}", handle, e);
            let apology = pipeline.fallback_text(Channel::Bridge);
            if let Err(e) = bridge.send(chat_id, &apology).await {
                tracing::warn!("Telegram: apology to chat {} failed: {:#}", chat_id, e);
            }
            return true;
        }
    };

    if let Some(notice) = reply.notice.as_deref() {
        if let Err(e) = bridge.send(chat_id, notice).await {
            tracing::warn!("Telegram: privacy notice to chat {} failed: {:#}", chat_id, e);
        }
    }
    if let Err(e) = bridge.send(chat_id, &reply.text).await {
        tracing::error!("Telegram: reply to chat {} failed: {:#}", chat_id, e);
    }
    true
}

/// Start the long-polling loop. Runs until the process exits.
pub fn spawn_polling(pipeline: TurnPipeline, bridge: Arc<TelegramBridge>) {
    tokio::spawn(async move {
        tracing::info!("Telegram long polling active");
        let mut offset: i64 = 0;
        loop {
            let Some(updates) = bridge.poll_updates(offset).await else {
                continue;
            };
            for update in updates {
                offset = update.update_id + 1;
                handle_update(&pipeline, bridge.as_ref(), update).await;
            }
        }
    });
}
