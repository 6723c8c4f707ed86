use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::database::{ConversationTurn, TurnRole};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for Message {
    fn from(turn: &ConversationTurn) -> Self {
        match turn.role {
            TurnRole::User => Message::user(turn.content.clone()),
            TurnRole::Persona => Message::assistant(turn.content.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// A generative model: system prompt plus ordered messages in, text out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[Message],
        max_tokens: u32,
    ) -> Result<Completion>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature: 0.7,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request<'a>(
        &'a self,
        system_prompt: &str,
        messages: &[Message],
        max_tokens: u32,
    ) -> ChatCompletionRequest<'a> {
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(Message {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        });
        all.extend_from_slice(messages);
        ChatCompletionRequest {
            model: &self.model,
            messages: all,
            temperature: self.temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[Message],
        max_tokens: u32,
    ) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = self.build_request(system_prompt, messages, max_tokens);

        let mut req = self.client.post(&url).json(&request);

        // Local models run without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let text = completion
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(Completion {
            text,
            usage: completion.usage.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    #[test]
    fn request_puts_system_prompt_first() {
        let client = LlmClient::new("http://localhost/v1/".into(), String::new(), "m".into());
        let request = client.build_request("rules", &[Message::user("Ciao")], 800);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["max_tokens"], 800);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "Ciao");
        assert_eq!(client.api_url, "http://localhost/v1");
    }

    #[test]
    fn turns_map_to_chat_roles() {
        let turn = ConversationTurn {
            id: "t".into(),
            user_id: "u".into(),
            channel: crate::database::Channel::Web,
            role: TurnRole::Persona,
            content: "hello".into(),
            created_at: chrono::Utc::now(),
        };
        assert_eq!(Message::from(&turn), Message::assistant("hello"));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn complete_parses_text_and_usage() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                let last = body["messages"]
                    .as_array()
                    .and_then(|m| m.last())
                    .map(|m| m["content"].as_str().unwrap_or_default().to_string())
                    .unwrap_or_default();
                Json(json!({
                    "choices": [{ "message": { "role": "assistant", "content": format!(" echo: {} ", last) } }],
                    "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
                }))
            }),
        );
        let base = serve(router).await;
        let client = LlmClient::new(base, String::new(), "m".into());
        let completion = client
            .complete("rules", &[Message::user("Ciao")], 100)
            .await
            .unwrap();
        assert_eq!(completion.text, "echo: Ciao");
        assert_eq!(completion.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let base = serve(router).await;
        let client = LlmClient::new(base, "key".into(), "m".into());
        let err = client.complete("rules", &[], 100).await.unwrap_err();
        assert!(err.to_string().contains("502"));
    }
}
