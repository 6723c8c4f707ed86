use std::sync::Arc;
use std::time::Duration;

use crate::error::{GuideError, GuideResult};
use crate::llm_client::{ChatModel, Completion, Message};

/// Single bounded call to the generative model. No retries.
#[derive(Clone)]
pub struct GenerationInvoker {
    model: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl GenerationInvoker {
    pub fn new(model: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn generate(
        &self,
        system_prompt: &str,
        history: &[Message],
        max_tokens: u32,
    ) -> GuideResult<Completion> {
        let call = self.model.complete(system_prompt, history, max_tokens);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(e)) => Err(GuideError::GenerationFailed(format!("{:#}", e))),
            Err(_) => Err(GuideError::GenerationFailed(format!(
                "model call timed out after {}s",
                self.timeout.as_secs_f32()
            ))),
        }
    }
}
