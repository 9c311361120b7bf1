//! Chat-endpoint provider: a single synchronous remote call with
//! `{messages, tools?}`, mapping the response into a normalised
//! `{content, tool_calls[]}` shape (§4.G).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channels::{PartialUpdate, StateSnapshot};

use super::{build_output, read_session_id, AgentProvider, ProviderError, TokenUsage};

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

/// Issues one OpenAI-compatible `/chat/completions` call per task. Suitable
/// for self-hosted (Ollama) and cloud chat endpoints alike.
pub struct ChatEndpointProvider {
    role: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ChatEndpointProvider {
    #[must_use]
    pub fn new(role: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(120_000),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AgentProvider for ChatEndpointProvider {
    async fn execute_task(&self, task: &str, state: &StateSnapshot) -> Result<PartialUpdate, ProviderError> {
        let session_id = read_session_id(&self.role, state);

        let mut messages = Vec::new();
        if let Some(resume) = &session_id {
            messages.push(ChatMessage {
                role: "system",
                content: format!("resume-session: {resume}"),
            });
        }
        messages.push(ChatMessage { role: "user", content: task.to_string() });

        let request = ChatRequest { model: &self.model, messages };

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .timeout(self.timeout)
            .json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout {
                    provider: self.name(),
                    elapsed_ms: self.timeout.as_millis() as u64,
                }
            } else {
                ProviderError::Failure { provider: self.name(), message: err.to_string() }
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Failure {
                provider: self.name(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Response { provider: self.name(), message: err.to_string() })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Response {
                provider: self.name(),
                message: "response contained no choices".to_string(),
            })?;

        let content = serde_json::json!({
            "content": choice.message.content.unwrap_or_default(),
            "tool_calls": choice.message.tool_calls,
        });

        let tokens = parsed
            .usage
            .map(|u| TokenUsage {
                cost: self.estimate_cost(u.prompt_tokens, u.completion_tokens),
                turns: 1,
                duration_ms: 0,
                duration_api_ms: 0,
            })
            .unwrap_or_default();

        Ok(build_output(&self.role, content, parsed.id.or(session_id), tokens))
    }

    fn name(&self) -> &'static str {
        "chat_endpoint"
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("provider".into(), Value::String("chat_endpoint".into()));
        map.insert("model".into(), Value::String(self.model.clone()));
        map.insert("base_url".into(), Value::String(self.base_url.clone()));
        map.insert("role".into(), Value::String(self.role.clone()));
        map
    }

    fn estimate_cost(&self, _input_tokens: u64, _output_tokens: u64) -> f64 {
        0.0
    }

    fn role(&self) -> &str {
        &self.role
    }
}
