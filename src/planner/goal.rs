//! Goal-driven planners: ask a model or a remote plan service for the next
//! batch of actions given the goal and a snapshot of the page.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::brain::{AiMode, AskAi, AskRequest, ChatMessage, DEFAULT_AI_TIMEOUT};
use crate::error::{Result, UalError};
use crate::types::WebAction;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ChatMessage>,
}

impl PlanRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    #[serde(default)]
    pub actions: Vec<WebAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

#[async_trait]
pub trait GoalPlanner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse>;
}

/// Plans by prompting the model in `plan` mode.
pub struct LlmGoalPlanner {
    ai: Arc<dyn AskAi>,
}

impl LlmGoalPlanner {
    pub fn new(ai: Arc<dyn AskAi>) -> Self {
        Self { ai }
    }
}

#[async_trait]
impl GoalPlanner for LlmGoalPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let context = request
            .context
            .as_ref()
            .map(|c| serde_json::to_string_pretty(c).unwrap_or_default())
            .unwrap_or_else(|| "none".to_string());
        let query = format!("Goal: {}\n\nContext:\n{}", request.goal, context);

        let reply = self
            .ai
            .ask(AskRequest::new(query, AiMode::Plan).with_history(request.history.clone()))
            .await
            .map_err(|e| UalError::Planning(e.to_string()))?;

        parse_plan_reply(&reply)
    }
}

/// Parse a model reply, keeping only the actions that match the wire form.
pub fn parse_plan_reply(reply: &str) -> Result<PlanResponse> {
    let value: Value = serde_json::from_str(reply)
        .map_err(|e| UalError::Planning(format!("unparseable plan: {}", e)))?;

    let actions = value
        .get("actions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match serde_json::from_value::<WebAction>(item.clone()) {
                    Ok(action) => Some(action),
                    Err(e) => {
                        warn!("dropping invalid planned action {}: {}", item, e);
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let text = |key: &str| value.get(key).and_then(Value::as_str).map(String::from);
    let response = PlanResponse {
        actions,
        status: text("status"),
        reasoning: text("reasoning"),
        answer: text("answer"),
    };
    debug!(actions = response.actions.len(), status = ?response.status, "parsed plan");
    Ok(response)
}

/// Plans by calling another service's plan endpoint.
pub struct RemoteGoalPlanner {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl RemoteGoalPlanner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            timeout: DEFAULT_AI_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl GoalPlanner for RemoteGoalPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| UalError::Planning(format!("plan service unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UalError::Planning(format!("plan service returned {}", status)));
        }
        response
            .json::<PlanResponse>()
            .await
            .map_err(|e| UalError::Planning(format!("invalid plan response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CannedAi {
        reply: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AskAi for CannedAi {
        async fn ask(&self, request: AskRequest) -> Result<String> {
            assert_eq!(request.mode, AiMode::Plan);
            self.seen.lock().unwrap().push(request.query);
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_llm_planner_parses_actions() {
        let ai = Arc::new(CannedAi {
            reply: json!({
                "actions": [
                    {"type": "navigate", "url": "https://example.com"},
                    {"type": "hover", "selector": "#x"},
                    {"type": "click", "selector": "#go"}
                ],
                "status": "continue",
                "reasoning": "open then click"
            })
            .to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let planner = LlmGoalPlanner::new(ai.clone());
        let mut request = PlanRequest::new("click go on example");
        request.context = Some(json!({"url": "about:blank"}));

        let plan = planner.plan(&request).await.unwrap();
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.status.as_deref(), Some("continue"));
        assert!(ai.seen.lock().unwrap()[0].contains("about:blank"));
    }

    #[tokio::test]
    async fn test_llm_planner_rejects_non_json() {
        let planner = LlmGoalPlanner::new(Arc::new(CannedAi {
            reply: "I would open the page".into(),
            seen: Mutex::new(Vec::new()),
        }));
        let err = planner.plan(&PlanRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, UalError::Planning(_)));
    }

    #[tokio::test]
    async fn test_remote_planner() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/plan"))
            .and(body_partial_json(json!({"goal": "find docs"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "actions": [{"type": "navigate", "url": "https://docs.rs"}],
                "status": "done",
                "answer": "see docs.rs"
            })))
            .mount(&server)
            .await;

        let planner = RemoteGoalPlanner::new(format!("{}/plan", server.uri()));
        let plan = planner.plan(&PlanRequest::new("find docs")).await.unwrap();
        assert_eq!(plan.actions, vec![WebAction::Navigate { url: "https://docs.rs".into() }]);
        assert_eq!(plan.answer.as_deref(), Some("see docs.rs"));
    }

    #[tokio::test]
    async fn test_remote_planner_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let planner = RemoteGoalPlanner::new(server.uri());
        let err = planner.plan(&PlanRequest::new("x")).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
