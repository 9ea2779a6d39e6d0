use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single serializable browser action, exchanged between planners,
/// the execution engine and the extension executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebAction {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Type {
        selector: String,
        value: String,
    },
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    Wait {
        #[serde(default = "default_wait_ms")]
        timeout: u64,
    },
    Screenshot,
    Extract {
        #[serde(default = "default_extract_selector")]
        selector: String,
    },
    Press {
        key: String,
    },
}

fn default_wait_ms() -> u64 {
    1000
}

fn default_extract_selector() -> String {
    "body".to_string()
}

impl WebAction {
    /// Short verb used in trace lines ("click", "type", ...).
    pub fn kind(&self) -> &'static str {
        match self {
            WebAction::Navigate { .. } => "navigate",
            WebAction::Click { .. } => "click",
            WebAction::Type { .. } => "type",
            WebAction::Scroll { .. } => "scroll",
            WebAction::Wait { .. } => "wait",
            WebAction::Screenshot => "screenshot",
            WebAction::Extract { .. } => "extract",
            WebAction::Press { .. } => "press",
        }
    }
}

impl fmt::Display for WebAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebAction::Navigate { url } => write!(f, "navigate {}", url),
            WebAction::Click { selector } => write!(f, "click {}", selector),
            WebAction::Type { selector, value } => {
                write!(f, "type {} chars into {}", value.chars().count(), selector)
            }
            WebAction::Scroll { selector: Some(s) } => write!(f, "scroll to {}", s),
            WebAction::Scroll { selector: None } => write!(f, "scroll"),
            WebAction::Wait { timeout } => write!(f, "wait {}ms", timeout),
            WebAction::Screenshot => write!(f, "screenshot"),
            WebAction::Extract { selector } => write!(f, "extract {}", selector),
            WebAction::Press { key } => write!(f, "press {}", key),
        }
    }
}

/// One execution request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub actions: Vec<WebAction>,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<WebAction>) -> Self {
        self.actions = actions;
        self
    }

    /// Whether the goal reads like a search, which makes typing submit with Enter.
    pub fn implies_search(&self) -> bool {
        self.goal.to_lowercase().contains("search")
    }
}

/// Heuristic verdict on whether the target site challenged the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Clean,
    BlockDetected,
}

pub const BOT_CHALLENGE_MARKERS: &[&str] = &["captcha", "robot", "verify you are a human"];

impl BotStatus {
    pub fn detect(title: &str, text: &str) -> Self {
        let title = title.to_lowercase();
        let text = text.to_lowercase();
        let hit = BOT_CHALLENGE_MARKERS
            .iter()
            .any(|m| title.contains(m) || text.contains(m));
        if hit {
            BotStatus::BlockDetected
        } else {
            BotStatus::Clean
        }
    }
}

/// Text pulled out of the page by an `extract` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub label: String,
    pub content: String,
}

/// What the engine observed once all actions ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageData {
    pub title: String,
    pub url: String,
    pub text: String,
    pub bot_status: BotStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extracted: Vec<Extraction>,
    #[serde(default)]
    pub failed_actions: usize,
}

/// Outcome of one task. `steps` is always present, success or not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UalResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_tree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<String>,
}

impl UalResult {
    pub fn failure(error: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            steps,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStepKind {
    Planning,
    Executing,
    Observing,
    Completed,
    Failed,
}

/// UI-facing progress narration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    #[serde(rename = "type")]
    pub kind: AgentStepKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<WebAction>>,
    pub timestamp: DateTime<Utc>,
}

impl AgentStep {
    pub fn new(kind: AgentStepKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            screenshot: None,
            actions: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<WebAction>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_screenshot(mut self, screenshot: Option<String>) -> Self {
        self.screenshot = screenshot;
        self
    }
}

pub const DOM_SNAPSHOT_MAX_CHARS: usize = 4000;
pub const PAGE_TEXT_MAX_CHARS: usize = 2000;
pub const EXTRACT_MAX_CHARS: usize = 2000;

/// Truncate on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_web_action_wire_form() {
        let action: WebAction =
            serde_json::from_value(json!({"type": "type", "selector": "#q", "value": "rust\n"}))
                .unwrap();
        assert_eq!(
            action,
            WebAction::Type {
                selector: "#q".into(),
                value: "rust\n".into()
            }
        );

        let wait: WebAction = serde_json::from_value(json!({"type": "wait"})).unwrap();
        assert_eq!(wait, WebAction::Wait { timeout: 1000 });

        let extract: WebAction = serde_json::from_value(json!({"type": "extract"})).unwrap();
        assert_eq!(extract, WebAction::Extract { selector: "body".into() });

        let scroll = serde_json::to_value(WebAction::Scroll { selector: None }).unwrap();
        assert_eq!(scroll, json!({"type": "scroll"}));
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let parsed = serde_json::from_value::<WebAction>(json!({"type": "hover"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_bot_status_detection() {
        assert_eq!(
            BotStatus::detect("Please verify you are a human", ""),
            BotStatus::BlockDetected
        );
        assert_eq!(
            BotStatus::detect("Search", "Solve this CAPTCHA to continue"),
            BotStatus::BlockDetected
        );
        assert_eq!(BotStatus::detect("GitHub", "Where the world builds software"), BotStatus::Clean);
        assert_eq!(
            serde_json::to_value(BotStatus::BlockDetected).unwrap(),
            json!("BLOCK_DETECTED")
        );
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = UalResult {
            success: true,
            dom_tree: Some("[e0] button".into()),
            data: Some(PageData {
                title: "t".into(),
                url: "u".into(),
                text: "x".into(),
                bot_status: BotStatus::Clean,
                extracted: vec![],
                failed_actions: 1,
            }),
            ..Default::default()
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["domTree"], "[e0] button");
        assert_eq!(v["data"]["botStatus"], "CLEAN");
        assert_eq!(v["data"]["failedActions"], 1);
        assert!(v["steps"].as_array().unwrap().is_empty());
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_task_implies_search() {
        assert!(Task::new("Search for rust books").implies_search());
        assert!(!Task::new("open the docs").implies_search());
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
