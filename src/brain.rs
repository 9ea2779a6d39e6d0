//! Client for the external `askAi` content generator.
//!
//! The action layer only relies on the contract
//! `ask(query, mode, history, file?, options?) -> answer | error`;
//! [`ChatCompletionsClient`] fulfils it against an OpenAI-compatible API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Result, UalError};

/// A message in the conversation history sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiMode {
    Plan,
    Classify,
    Clarify,
    Answer,
}

impl AiMode {
    fn system_prompt(self) -> &'static str {
        match self {
            AiMode::Plan => PLAN_PROMPT,
            AiMode::Classify => CLASSIFY_PROMPT,
            AiMode::Clarify => CLARIFY_PROMPT,
            AiMode::Answer => ANSWER_PROMPT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskFile {
    pub name: String,
    pub mime_type: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub query: String,
    pub mode: AiMode,
    pub history: Vec<ChatMessage>,
    pub file: Option<AskFile>,
    pub options: Value,
}

impl AskRequest {
    pub fn new(query: impl Into<String>, mode: AiMode) -> Self {
        Self {
            query: query.into(),
            mode,
            history: Vec::new(),
            file: None,
            options: Value::Null,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }
}

#[async_trait]
pub trait AskAi: Send + Sync {
    async fn ask(&self, request: AskRequest) -> Result<String>;
}

const PLAN_PROMPT: &str = r#"You are a browser automation planner. Given a goal and an optional page snapshot, reply with ONE JSON object:
{"actions":[...],"status":"continue|done","reasoning":"...","answer":"..."}

Each action is one of:
- {"type":"navigate","url":"https://..."}
- {"type":"click","selector":"css"}
- {"type":"type","selector":"css","value":"text"}
- {"type":"press","key":"Enter"}
- {"type":"scroll"}
- {"type":"wait","timeout":1000}
- {"type":"extract","selector":"css"}
- {"type":"screenshot"}

Rules:
1. Return ONLY the JSON object. No markdown, no explanation.
2. Use "done" with an "answer" when the goal is already satisfied by the context.
3. Keep plans minimal."#;

const CLASSIFY_PROMPT: &str = r#"Decide whether a web search query is too ambiguous to answer without asking the user a clarifying question. Reply with exactly one word: AMBIGUOUS or CLEAR."#;

const CLARIFY_PROMPT: &str = r#"The user's search query is ambiguous. Ask ONE short clarifying question that would let you search precisely. Reply with the question only."#;

const ANSWER_PROMPT: &str = r#"Answer the question using ONLY the numbered sources provided. Cite sources inline with markers like [1] or [2] that refer to the source numbers. Never cite a number that is not listed. Be concise."#;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_AI_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ChatCompletionsClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl ChatCompletionsClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_API_BASE)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: &str,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            timeout: DEFAULT_AI_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_messages(&self, request: &AskRequest) -> Vec<Value> {
        let mut messages = vec![json!({"role": "system", "content": request.mode.system_prompt()})];
        messages.extend(
            request
                .history
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content})),
        );

        let mut content = request.query.clone();
        if let Some(file) = &request.file {
            content.push_str(&format!(
                "\n\nAttached file {} ({}):\n{}",
                file.name, file.mime_type, file.content
            ));
        }
        messages.push(json!({"role": "user", "content": content}));
        messages
    }
}

#[async_trait]
impl AskAi for ChatCompletionsClient {
    async fn ask(&self, request: AskRequest) -> Result<String> {
        let temperature = request
            .options
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(0.2);
        let messages = self.build_messages(&request);

        if messages.len() > 20 {
            warn!(count = messages.len(), "conversation history is long");
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.timeout)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": temperature,
            }))
            .send()
            .await
            .map_err(|e| UalError::Ai(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| UalError::Ai(format!("invalid response body: {}", e)))?;

        if !status.is_success() {
            let msg = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(%status, "model API error: {}", msg);
            return Err(UalError::Ai(format!("API error ({}): {}", status, msg)));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| UalError::Ai(format!("no content in response: {}", body)))?;

        debug!(mode = ?request.mode, "model replied: {}", content);
        Ok(strip_fences(content).to_string())
    }
}

/// Strip markdown code fences a model may wrap JSON in.
pub fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
