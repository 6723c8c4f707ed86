use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Receiver;

use crate::config::{GuideConfig, TelegramMode};
use crate::content::{ContentProvider, NotionContentProvider, StaticContentProvider};
use crate::database::GuideDatabase;
use crate::generation::GenerationInvoker;
use crate::llm_client::{ChatModel, LlmClient};
use crate::memory::{CompressionJob, CompressionWorker, MemoryCompressor};
use crate::persona::PersonaConfig;
use crate::pipeline::{PipelineSettings, TurnPipeline};
use crate::progress::ProgressService;
use crate::prompt::PromptAssembler;
use crate::safety::{HighRiskHook, SafetyClassifier};
use crate::stage::{StageMap, StageResolver};
use crate::telegram::TelegramBridge;

pub struct BackendRuntime {
    pub config: GuideConfig,
    pub db: Arc<GuideDatabase>,
    pub pipeline: TurnPipeline,
    pub progress: ProgressService,
    pub telegram: Option<Arc<TelegramBridge>>,
    compression: Option<(CompressionWorker, Receiver<CompressionJob>)>,
}

pub struct BackendRuntimeBuilder {
    config: GuideConfig,
    database: Option<Arc<GuideDatabase>>,
    model: Option<Arc<dyn ChatModel>>,
    content: Option<Arc<dyn ContentProvider>>,
    hook: Option<Arc<dyn HighRiskHook>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: GuideConfig) -> Self {
        Self {
            config,
            database: None,
            model: None,
            content: None,
            hook: None,
        }
    }

    pub fn with_database(mut self, db: Arc<GuideDatabase>) -> Self {
        self.database = Some(db);
        self
    }

    pub fn with_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_content_provider(mut self, content: Arc<dyn ContentProvider>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_high_risk_hook(mut self, hook: Arc<dyn HighRiskHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        config.validate().context("Invalid configuration")?;

        let db = match self.database {
            Some(db) => db,
            None => Arc::new(
                GuideDatabase::new(&config.database_path)
                    .with_context(|| format!("Failed to open database {}", config.database_path))?,
            ),
        };

        let map = Arc::new(config.stage_map.clone().unwrap_or_default());
        let persona = Arc::new(PersonaConfig::load_or_default(config.persona_path.as_deref()));
        let safety = Arc::new(match &config.risk_keywords {
            Some(keywords) => SafetyClassifier::new(keywords),
            None => SafetyClassifier::default(),
        });
        tracing::info!(
            "Persona '{}' with {} stage groups, {} risk phrases",
            persona.name,
            map.groups.len(),
            safety.keyword_count()
        );

        let model: Arc<dyn ChatModel> = match self.model {
            Some(model) => model,
            None => {
                tracing::info!("LLM: {} via {}", config.llm_model, config.llm_api_url);
                Arc::new(LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    config.llm_model.clone(),
                ))
            }
        };
        let invoker = GenerationInvoker::new(
            model,
            Duration::from_secs(config.generation_timeout_secs),
        );

        let content = self.content.unwrap_or_else(|| build_content_provider(&config));

        let resolver = StageResolver::new(db.clone(), map.clone());
        let assembler = Arc::new(PromptAssembler::new(
            persona.clone(),
            map.clone(),
            config.reflections_in_prompt,
        ));
        let (compressor, jobs) =
            MemoryCompressor::new(db.clone(), config.memory_channel, config.memory_threshold);
        let worker = CompressionWorker::new(
            db.clone(),
            invoker.clone(),
            persona,
            config.memory_channel,
            config.memory_threshold,
        )
        .with_limits(config.memory_summary_max_chars, config.summary_max_tokens);

        let mut pipeline = TurnPipeline::builder(
            db.clone(),
            resolver.clone(),
            assembler,
            invoker,
            compressor,
        )
        .safety(safety)
        .settings(PipelineSettings {
            history_limit: config.history_window,
            web_max_tokens: config.web_max_tokens,
            bridge_max_tokens: config.bridge_max_tokens,
            unregistered_max_tokens: config.unregistered_max_tokens,
        });
        if let Some(hook) = self.hook {
            pipeline = pipeline.high_risk_hook(hook);
        }
        let pipeline = pipeline.build();

        let progress = ProgressService::new(db.clone(), resolver, content, config.reflection_max_chars);

        let telegram = match (config.telegram.mode, config.telegram.bot_token.as_deref()) {
            (TelegramMode::Disabled, _) | (_, None) => None,
            (_, Some(token)) => Some(Arc::new(TelegramBridge::new(token))),
        };

        Ok(BackendRuntime {
            config,
            db,
            pipeline,
            progress,
            telegram,
            compression: Some((worker, jobs)),
        })
    }
}

fn build_content_provider(config: &GuideConfig) -> Arc<dyn ContentProvider> {
    if config.notion.is_configured() {
        tracing::info!("Content provider: Notion");
        Arc::new(NotionContentProvider::new(config.notion.clone()))
    } else {
        tracing::warn!("Notion is not configured; episodes and week overviews will be unavailable");
        Arc::new(StaticContentProvider::new())
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: GuideConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }

    /// Start the compression worker and, in polling mode, the Telegram poller.
    /// Must be called from inside a tokio runtime; later calls are no-ops.
    pub fn spawn_background(&mut self) {
        if let Some((worker, jobs)) = self.compression.take() {
            worker.spawn(jobs);
        }
        if self.config.telegram.mode == TelegramMode::Polling {
            if let Some(bridge) = self.telegram.clone() {
                crate::telegram::spawn_polling(self.pipeline.clone(), bridge);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Channel, NewProfile};
    use crate::testing::ScriptedModel;

    #[tokio::test]
    async fn builds_and_serves_a_turn_with_injected_parts() {
        let db = Arc::new(GuideDatabase::open_in_memory().unwrap());
        let mut config = GuideConfig::default();
        config.memory_threshold = 2;
        config.memory_channel = Channel::Web;
        let model = Arc::new(ScriptedModel::replying(["Benvenuta.", "Notes: calm."]));

        let mut runtime = BackendRuntimeBuilder::new(config)
            .with_database(db.clone())
            .with_model(model.clone())
            .with_content_provider(Arc::new(StaticContentProvider::new()))
            .build()
            .unwrap();
        assert!(runtime.telegram.is_none());
        runtime.spawn_background();

        db.create_profile(&NewProfile {
            user_id: "u1".into(),
            name: "Anna".into(),
            ..Default::default()
        })
        .unwrap();
        let reply = runtime
            .pipeline
            .handle_message("u1", Channel::Web, "Ciao")
            .await
            .unwrap();
        assert_eq!(reply.text, "Benvenuta.");

        // The worker picks up the job queued at two turns.
        for _ in 0..50 {
            if db.get_profile("u1").unwrap().unwrap().memory_summary.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            db.get_profile("u1").unwrap().unwrap().memory_summary.as_deref(),
            Some("Notes: calm.")
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = GuideConfig::default();
        config.history_window = 0;
        let result = BackendRuntimeBuilder::new(config)
            .with_database(Arc::new(GuideDatabase::open_in_memory().unwrap()))
            .build();
        assert!(result.is_err());
    }
}
