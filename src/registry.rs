//! Name-keyed catalogue of invocable actions.
//!
//! Every built-in action lowers to one or more [`WebAction`]s so a plan of
//! several steps can run inside a single browser task, while `execute` runs
//! the action on its own.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::engine::TaskRunner;
use crate::error::{Result, UalError};
use crate::types::{Task, WebAction};

pub type ActionArgs = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Serialize)]
pub struct ActionParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub required: bool,
}

impl ActionParameter {
    pub fn required(name: &str, kind: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            description: description.to_string(),
            required: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ActionParameter>,
}

/// An independently invocable operation.
#[async_trait]
pub trait Action: Send + Sync {
    fn definition(&self) -> &ActionDefinition;

    fn name(&self) -> &str {
        &self.definition().name
    }

    /// Translate bound arguments into wire-form browser actions.
    fn web_actions(&self, args: &ActionArgs) -> Result<Vec<WebAction>>;

    async fn execute(&self, args: &ActionArgs) -> Result<Value>;
}

/// A bound, ready-to-run action.
#[derive(Clone)]
pub struct ActionStep {
    pub action: Arc<dyn Action>,
    pub args: ActionArgs,
}

impl ActionStep {
    pub fn name(&self) -> &str {
        self.action.name()
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

impl std::fmt::Debug for ActionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionStep")
            .field("action", &self.name())
            .field("args", &self.args)
            .finish()
    }
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the browser actions the planners emit.
    pub fn with_builtins(runner: Arc<dyn TaskRunner>) -> Self {
        let registry = Self::new();
        for action in builtin_actions(runner) {
            registry.register(action);
        }
        registry
    }

    /// Registering an existing name replaces the previous action.
    pub fn register(&self, action: Arc<dyn Action>) {
        let name = action.name().to_string();
        debug!(action = %name, "registering action");
        if let Ok(mut actions) = self.actions.write() {
            actions.insert(name, action);
        }
    }

    pub fn get_action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.read().ok()?.get(name).cloned()
    }

    pub fn list_actions(&self) -> Vec<Arc<dyn Action>> {
        let Ok(actions) = self.actions.read() else {
            return Vec::new();
        };
        let mut list: Vec<_> = actions.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    pub fn len(&self) -> usize {
        self.actions.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub const NAVIGATE: &str = "navigate";
pub const WEB_SEARCH: &str = "webSearch";
pub const TYPE_TEXT: &str = "typeText";
pub const CLICK: &str = "click";

const SEARCH_URL_PREFIX: &str = "https://duckduckgo.com/?q=";

type Lowering = fn(&ActionArgs) -> Result<Vec<WebAction>>;

/// Built-in action backed by the execution engine.
pub struct BrowserAction {
    definition: ActionDefinition,
    lower: Lowering,
    runner: Arc<dyn TaskRunner>,
}

impl BrowserAction {
    pub fn new(definition: ActionDefinition, lower: Lowering, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            definition,
            lower,
            runner,
        }
    }
}

#[async_trait]
impl Action for BrowserAction {
    fn definition(&self) -> &ActionDefinition {
        &self.definition
    }

    fn web_actions(&self, args: &ActionArgs) -> Result<Vec<WebAction>> {
        (self.lower)(args)
    }

    async fn execute(&self, args: &ActionArgs) -> Result<Value> {
        let actions = self.web_actions(args)?;
        let goal = format!("{} {}", self.definition.name, Value::Object(args.clone()));
        let result = self.runner.run(Task::new(goal).with_actions(actions)).await;
        if let Some(err) = result.error.as_ref().filter(|_| !result.success) {
            return Err(UalError::Action(err.clone()));
        }
        serde_json::to_value(result).map_err(|e| UalError::Action(e.to_string()))
    }
}

fn required_str<'a>(action: &str, args: &'a ActionArgs, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| UalError::InvalidArgs {
            action: action.to_string(),
            message: format!("missing string argument '{}'", key),
        })
}

fn lower_navigate(args: &ActionArgs) -> Result<Vec<WebAction>> {
    let url = required_str(NAVIGATE, args, "url")?;
    Ok(vec![WebAction::Navigate {
        url: normalize_url(url),
    }])
}

fn lower_web_search(args: &ActionArgs) -> Result<Vec<WebAction>> {
    let query = required_str(WEB_SEARCH, args, "query")?;
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    Ok(vec![WebAction::Navigate {
        url: format!("{}{}", SEARCH_URL_PREFIX, encoded),
    }])
}

fn lower_type_text(args: &ActionArgs) -> Result<Vec<WebAction>> {
    let text = required_str(TYPE_TEXT, args, "text")?;
    let selector = required_str(TYPE_TEXT, args, "selector")?;
    Ok(vec![WebAction::Type {
        selector: selector.to_string(),
        value: text.to_string(),
    }])
}

fn lower_click(args: &ActionArgs) -> Result<Vec<WebAction>> {
    let selector = required_str(CLICK, args, "selector")?;
    Ok(vec![WebAction::Click {
        selector: selector.to_string(),
    }])
}

pub fn builtin_actions(runner: Arc<dyn TaskRunner>) -> Vec<Arc<dyn Action>> {
    let defs: [(ActionDefinition, Lowering); 4] = [
        (
            ActionDefinition {
                name: NAVIGATE.into(),
                description: "Open a URL in the browser".into(),
                parameters: vec![ActionParameter::required("url", "string", "Page to open")],
            },
            lower_navigate,
        ),
        (
            ActionDefinition {
                name: WEB_SEARCH.into(),
                description: "Run a web search for a query".into(),
                parameters: vec![ActionParameter::required("query", "string", "Search terms")],
            },
            lower_web_search,
        ),
        (
            ActionDefinition {
                name: TYPE_TEXT.into(),
                description: "Type text into an input element".into(),
                parameters: vec![
                    ActionParameter::required("text", "string", "Text to type"),
                    ActionParameter::required("selector", "string", "CSS selector of the input"),
                ],
            },
            lower_type_text,
        ),
        (
            ActionDefinition {
                name: CLICK.into(),
                description: "Click an element".into(),
                parameters: vec![ActionParameter::required(
                    "selector",
                    "string",
                    "CSS selector of the element",
                )],
            },
            lower_click,
        ),
    ];

    defs.into_iter()
        .map(|(definition, lower)| {
            Arc::new(BrowserAction::new(definition, lower, runner.clone())) as Arc<dyn Action>
        })
        .collect()
}

/// Prefix bare hosts with `https://`.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches(['.', ',']);
    if trimmed.contains("://") || trimmed.starts_with("about:") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}
