//! Periodic memory-summary compression.
//!
//! The turn pipeline calls [`MemoryCompressor::maybe_compress`] after each
//! persisted write. When the monitored channel's turn count crosses a
//! multiple of the threshold, a [`CompressionJob`] is queued and the reply
//! goes out without waiting. A [`CompressionWorker`] task drains the queue;
//! its failures are logged and never reach the user.

use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::database::{Channel, ConversationTurn, GuideDatabase, TurnRole};
use crate::error::{GuideError, GuideResult};
use crate::generation::GenerationInvoker;
use crate::llm_client::Message;
use crate::persona::PersonaConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionJob {
    pub user_id: String,
    pub turn_count: usize,
}

/// Compression fires when a write moves the count from `before` to `after`
/// across a positive multiple of `threshold`. The count may be odd after an
/// unpaired user turn or a retention sweep.
pub fn should_compress(before: usize, after: usize, threshold: usize) -> bool {
    threshold > 0 && after > before && after / threshold > before / threshold
}

#[derive(Clone)]
pub struct MemoryCompressor {
    db: Arc<GuideDatabase>,
    channel: Channel,
    threshold: usize,
    jobs: Sender<CompressionJob>,
}

impl MemoryCompressor {
    /// Returns the compressor and the receiving end of its job queue.
    pub fn new(
        db: Arc<GuideDatabase>,
        channel: Channel,
        threshold: usize,
    ) -> (Self, Receiver<CompressionJob>) {
        let (jobs, rx) = flume::unbounded();
        (
            Self {
                db,
                channel,
                threshold,
                jobs,
            },
            rx,
        )
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Queue a compression job if the `added` turns just written crossed a
    /// threshold boundary. Never fails the caller.
    pub fn maybe_compress(&self, user_id: &str, added: usize) -> bool {
        let count = match self.db.count_turns(user_id, self.channel) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to count turns for {}: {:#}", user_id, e);
                return false;
            }
        };
        if !should_compress(count.saturating_sub(added), count, self.threshold) {
            return false;
        }

        let job = CompressionJob {
            user_id: user_id.to_string(),
            turn_count: count,
        };
        match self.jobs.send(job) {
            Ok(()) => {
                tracing::debug!("Queued memory compression for {} at {} turns", user_id, count);
                true
            }
            Err(e) => {
                tracing::warn!("Memory compression queue closed: {}", e);
                false
            }
        }
    }
}

pub struct CompressionWorker {
    db: Arc<GuideDatabase>,
    invoker: GenerationInvoker,
    persona: Arc<PersonaConfig>,
    channel: Channel,
    window: usize,
    max_summary_chars: usize,
    max_tokens: u32,
}

impl CompressionWorker {
    pub fn new(
        db: Arc<GuideDatabase>,
        invoker: GenerationInvoker,
        persona: Arc<PersonaConfig>,
        channel: Channel,
        threshold: usize,
    ) -> Self {
        Self {
            db,
            invoker,
            persona,
            channel,
            window: threshold.saturating_mul(2),
            max_summary_chars: 2000,
            max_tokens: 600,
        }
    }

    pub fn with_limits(mut self, max_summary_chars: usize, max_tokens: u32) -> Self {
        self.max_summary_chars = max_summary_chars;
        self.max_tokens = max_tokens;
        self
    }

    /// Regenerate and store the memory summary for one user.
    pub async fn compress(&self, user_id: &str) -> GuideResult<String> {
        let profile = self
            .db
            .get_profile(user_id)?
            .ok_or_else(|| GuideError::UnknownUser(user_id.to_string()))?;

        let mut turns = self.db.latest_turns(user_id, self.channel, self.window)?;
        turns.reverse();
        if turns.is_empty() {
            return Ok(profile.memory_summary.unwrap_or_default());
        }

        let system_prompt = summary_system_prompt(
            &self.persona.summary_prompt,
            profile.memory_summary.as_deref(),
        );
        let transcript = Message::user(format!(
            "Recent conversation:\n\n{}",
            render_transcript(&turns)
        ));
        let completion = self
            .invoker
            .generate(&system_prompt, &[transcript], self.max_tokens)
            .await?;

        let summary = truncate_chars(completion.text.trim(), self.max_summary_chars);
        self.db
            .set_memory_summary(user_id, &summary)
            .map_err(|e| GuideError::PersistenceWriteFailed(format!("{:#}", e)))?;
        Ok(summary)
    }

    /// Drain the queue until every sender is dropped.
    pub fn spawn(self, jobs: Receiver<CompressionJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(job) = jobs.recv_async().await {
                match self.compress(&job.user_id).await {
                    Ok(summary) => tracing::info!(
                        "Memory summary updated for {} ({} chars, {} turns)",
                        job.user_id,
                        summary.chars().count(),
                        job.turn_count
                    ),
                    Err(e) => tracing::error!(
                        "Memory compression failed for {}: {}",
                        job.user_id,
                        e
                    ),
                }
            }
            tracing::debug!("Memory compression worker stopped");
        })
    }
}

pub fn summary_system_prompt(base: &str, previous: Option<&str>) -> String {
    match previous.map(str::trim).filter(|p| !p.is_empty()) {
        Some(previous) => format!(
            "{}\n\nPrevious notes to update and integrate (keep what still holds):\n{}",
            base.trim(),
            previous
        ),
        None => base.trim().to_string(),
    }
}

fn render_transcript(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| {
            let speaker = match t.role {
                TurnRole::User => "Person",
                TurnRole::Persona => "Guide",
            };
            format!("{}: {}", speaker, t.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
