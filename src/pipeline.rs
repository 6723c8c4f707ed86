//! Per-message turn handling.
//!
//! One inbound message runs: safety scan, stage resolution, allowed-reference
//! lookup, prompt assembly, history load, one generation call, persistence and
//! a possible memory-compression dispatch. Generation failures turn into a
//! channel-specific fallback reply. Persistence failures are logged and the
//! reply is still delivered.

use std::sync::Arc;

use serde::Serialize;

use crate::database::{Channel, GuideDatabase, TurnRole};
use crate::error::{GuideError, GuideResult};
use crate::generation::GenerationInvoker;
use crate::history::HistoryWindowManager;
use crate::llm_client::{Message, Usage};
use crate::memory::MemoryCompressor;
use crate::prompt::PromptAssembler;
use crate::safety::{HighRiskHook, LogOnlyHook, SafetyClassifier};
use crate::spoiler::AntiSpoilerFilter;
use crate::stage::StageResolver;
use crate::telegram::sanitize_bridge_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub history_limit: usize,
    pub web_max_tokens: u32,
    pub bridge_max_tokens: u32,
    pub unregistered_max_tokens: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            history_limit: 20,
            web_max_tokens: 1500,
            bridge_max_tokens: 800,
            unregistered_max_tokens: 300,
        }
    }
}

impl PipelineSettings {
    fn max_tokens(&self, channel: Channel) -> u32 {
        match channel {
            Channel::Web => self.web_max_tokens,
            Channel::Bridge => self.bridge_max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub text: String,
    /// True when `text` is the stock apology instead of a model reply.
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Failure detail for the caller's diagnostics; never shown to the person.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Sent ahead of `text` on a channel's first contact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    pub first_contact: bool,
    pub high_risk: bool,
}

#[derive(Clone)]
pub struct TurnPipeline {
    db: Arc<GuideDatabase>,
    resolver: StageResolver,
    spoiler: AntiSpoilerFilter,
    assembler: Arc<PromptAssembler>,
    history: HistoryWindowManager,
    invoker: GenerationInvoker,
    compressor: MemoryCompressor,
    safety: Arc<SafetyClassifier>,
    hook: Arc<dyn HighRiskHook>,
    settings: PipelineSettings,
}

pub struct TurnPipelineBuilder {
    db: Arc<GuideDatabase>,
    resolver: StageResolver,
    assembler: Arc<PromptAssembler>,
    invoker: GenerationInvoker,
    compressor: MemoryCompressor,
    safety: Arc<SafetyClassifier>,
    hook: Option<Arc<dyn HighRiskHook>>,
    settings: PipelineSettings,
}

impl TurnPipelineBuilder {
    pub fn safety(mut self, classifier: Arc<SafetyClassifier>) -> Self {
        self.safety = classifier;
        self
    }

    pub fn high_risk_hook(mut self, hook: Arc<dyn HighRiskHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> TurnPipeline {
        let hook: Arc<dyn HighRiskHook> = match self.hook {
            Some(hook) => hook,
            None => Arc::new(LogOnlyHook),
        };
        TurnPipeline {
            spoiler: AntiSpoilerFilter::new(self.db.clone()),
            history: HistoryWindowManager::new(self.db.clone()),
            db: self.db,
            resolver: self.resolver,
            assembler: self.assembler,
            invoker: self.invoker,
            compressor: self.compressor,
            safety: self.safety,
            hook,
            settings: self.settings,
        }
    }
}

impl TurnPipeline {
    pub fn builder(
        db: Arc<GuideDatabase>,
        resolver: StageResolver,
        assembler: Arc<PromptAssembler>,
        invoker: GenerationInvoker,
        compressor: MemoryCompressor,
    ) -> TurnPipelineBuilder {
        TurnPipelineBuilder {
            db,
            resolver,
            assembler,
            invoker,
            compressor,
            safety: Arc::new(SafetyClassifier::default()),
            hook: None,
            settings: PipelineSettings::default(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    async fn screen(&self, user_id: &str, text: &str) -> bool {
        let risky = self.safety.is_high_risk(text);
        if risky {
            self.hook.on_high_risk(user_id, text).await;
        }
        risky
    }

    /// Stock apology for `channel`, sent when a turn cannot be answered.
    pub fn fallback_text(&self, channel: Channel) -> String {
        self.assembler
            .persona()
            .fallback
            .for_channel(channel)
            .to_string()
    }

    /// Handle one message from a registered user on `channel`.
    pub async fn handle_message(
        &self,
        user_id: &str,
        channel: Channel,
        text: &str,
    ) -> GuideResult<TurnReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GuideError::InvalidInput("message is empty".into()));
        }
        let high_risk = self.screen(user_id, text).await;

        let stage = self.resolver.resolve_stage(user_id)?;
        let allowed = self.spoiler.allowed_reference_set(user_id)?;
        let profile = self
            .db
            .get_profile(user_id)?
            .ok_or_else(|| GuideError::UnknownUser(user_id.to_string()))?;
        let reflections = self.db.list_reflections(user_id)?;

        let window = self
            .history
            .load_recent_history(user_id, channel, self.settings.history_limit)?;
        let first_contact = window.is_first_contact();
        let mut messages: Vec<Message> = window.map(|turn| Message::from(&turn)).collect();
        messages.push(Message::user(text));

        let system_prompt = self.assembler.assemble_prompt(
            &stage,
            &allowed,
            &profile,
            &reflections,
            channel,
            first_contact,
        );

        let completion = match self
            .invoker
            .generate(&system_prompt, &messages, self.settings.max_tokens(channel))
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!("Generation failed for {} on {}: {}", user_id, channel, e);
                match self.db.record_turn(user_id, channel, TurnRole::User, text) {
                    Ok(_) => self.after_write(user_id, channel, 1),
                    Err(write_err) => tracing::error!(
                        "Failed to persist inbound turn for {} on {}: {:#}",
                        user_id,
                        channel,
                        write_err
                    ),
                }
                return Ok(TurnReply {
                    text: self.fallback_text(channel),
                    fallback: true,
                    usage: None,
                    diagnostic: Some(e.to_string()),
                    notice: None,
                    first_contact,
                    high_risk,
                });
            }
        };

        let reply_text = match channel {
            Channel::Web => completion.text,
            Channel::Bridge => sanitize_bridge_text(&completion.text),
        };

        self.record_exchange(user_id, channel, text, &reply_text);

        let notice = (first_contact && channel == Channel::Bridge)
            .then(|| self.assembler.persona().privacy_notice.clone());

        Ok(TurnReply {
            text: reply_text,
            fallback: false,
            usage: Some(completion.usage),
            diagnostic: None,
            notice,
            first_contact,
            high_risk,
        })
    }

    /// Persist both turns, then check whether compression is due.
    fn record_exchange(&self, user_id: &str, channel: Channel, user_text: &str, persona_text: &str) {
        if let Err(e) = self
            .db
            .record_exchange(user_id, channel, user_text, persona_text)
        {
            let err = GuideError::PersistenceWriteFailed(format!("{:#}", e));
            tracing::error!("{} (user {}, channel {})", err, user_id, channel);
            return;
        }
        self.after_write(user_id, channel, 2);
    }

    fn after_write(&self, user_id: &str, channel: Channel, added: usize) {
        if channel == self.compressor.channel() {
            self.compressor.maybe_compress(user_id, added);
        }
    }

    /// Handle a message arriving on the messaging bridge from `from_handle`.
    pub async fn handle_bridge_message(&self, from_handle: &str, text: &str) -> GuideResult<TurnReply> {
        match self.db.get_profile_by_telegram_id(from_handle)? {
            Some(profile) => {
                self.handle_message(&profile.user_id, Channel::Bridge, text)
                    .await
            }
            None => {
                tracing::info!("Bridge message from unlinked handle {}", from_handle);
                self.handle_unregistered(from_handle, text).await
            }
        }
    }

    async fn handle_unregistered(&self, from_handle: &str, text: &str) -> GuideResult<TurnReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GuideError::InvalidInput("message is empty".into()));
        }
        let high_risk = self.screen(&format!("unregistered:{}", from_handle), text).await;
        let system_prompt = self.assembler.assemble_unregistered_prompt(Channel::Bridge);

        match self
            .invoker
            .generate(
                &system_prompt,
                &[Message::user(text)],
                self.settings.unregistered_max_tokens,
            )
            .await
        {
            Ok(completion) => Ok(TurnReply {
                text: sanitize_bridge_text(&completion.text),
                fallback: false,
                usage: Some(completion.usage),
                diagnostic: None,
                notice: None,
                first_contact: false,
                high_risk,
            }),
            Err(e) => {
                tracing::warn!("Generation failed for unlinked handle {}: {}", from_handle, e);
                Ok(TurnReply {
                    text: self.fallback_text(Channel::Bridge),
                    fallback: true,
                    usage: None,
                    diagnostic: Some(e.to_string()),
                    notice: None,
                    first_contact: false,
                    high_risk,
                })
            }
        }
    }
}
