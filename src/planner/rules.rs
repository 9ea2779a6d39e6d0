//! Lexical planner: splits an instruction into clauses and matches each one
//! against an ordered rule table. Clauses that match nothing are dropped.

use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, UalError};
use crate::registry::{
    ActionArgs, ActionRegistry, ActionStep, CLICK, NAVIGATE, TYPE_TEXT, WEB_SEARCH, normalize_url,
};
use crate::types::WebAction;

/// Conjunction markers, longest first so `and then` wins over `and`.
const MARKERS: &[&str] = &[", and then ", " and then ", ", then ", " then ", ", and ", " and "];

const LEADING_CONNECTIVES: &[&str] = &["and then ", "then ", "and "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Navigate,
    WebSearch,
    TypeText,
    Click,
}

impl Intent {
    pub fn action_name(self) -> &'static str {
        match self {
            Intent::Navigate => NAVIGATE,
            Intent::WebSearch => WEB_SEARCH,
            Intent::TypeText => TYPE_TEXT,
            Intent::Click => CLICK,
        }
    }
}

struct Rule {
    intent: Intent,
    pattern: Regex,
    bind: fn(&Captures) -> Option<ActionArgs>,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let rule = |intent: Intent, pattern: &str, bind: fn(&Captures) -> Option<ActionArgs>| Rule {
        intent,
        pattern: Regex::new(pattern).expect("static planner pattern"),
        bind,
    };
    vec![
        rule(
            Intent::Navigate,
            r#"(?i)^(?:open|go\s+to|navigate\s+to|visit)\s+['"]?([^\s'"]+)['"]?$"#,
            bind_navigate,
        ),
        rule(
            Intent::WebSearch,
            r"(?i)^search(?:\s+for)?\s+(.+)$",
            bind_search,
        ),
        rule(
            Intent::TypeText,
            r#"(?i)^type\s+['"](.+?)['"]\s+(?:into|in)\s+['"](.+?)['"]$"#,
            bind_type,
        ),
        rule(Intent::Click, r"(?i)^click(?:\s+on)?\s+(.+)$", bind_click),
    ]
});

fn args_of(pairs: &[(&str, String)]) -> ActionArgs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
        .collect()
}

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '\'' || c == '"').trim()
}

fn bind_navigate(caps: &Captures) -> Option<ActionArgs> {
    let target = caps.get(1)?.as_str();
    let looks_like_url =
        target.contains('.') || target.contains("://") || target.starts_with("localhost");
    if !looks_like_url {
        return None;
    }
    Some(args_of(&[("url", normalize_url(target))]))
}

fn bind_search(caps: &Captures) -> Option<ActionArgs> {
    let query = strip_quotes(caps.get(1)?.as_str());
    if query.is_empty() {
        return None;
    }
    Some(args_of(&[("query", query.to_string())]))
}

fn bind_type(caps: &Captures) -> Option<ActionArgs> {
    let text = caps.get(1)?.as_str();
    let selector = caps.get(2)?.as_str().trim();
    if selector.is_empty() {
        return None;
    }
    Some(args_of(&[("text", text.to_string()), ("selector", selector.to_string())]))
}

fn bind_click(caps: &Captures) -> Option<ActionArgs> {
    let selector = strip_quotes(caps.get(1)?.as_str());
    if selector.is_empty() {
        return None;
    }
    Some(args_of(&[("selector", selector.to_string())]))
}

/// Split on conjunction markers, ignoring markers inside quoted text.
pub fn split_clauses(instruction: &str) -> Vec<String> {
    let bytes = instruction.as_bytes();
    let lower = instruction.to_ascii_lowercase();
    let lower = lower.as_bytes();

    let mut clauses = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if (b == b'\'' || b == b'"') && (i == 0 || bytes[i - 1].is_ascii_whitespace()) => {
                quote = Some(b)
            }
            None => {
                if let Some(marker) = MARKERS.iter().find(|m| lower[i..].starts_with(m.as_bytes()))
                {
                    clauses.push(&instruction[start..i]);
                    i += marker.len();
                    start = i;
                    continue;
                }
            }
        }
        i += 1;
    }
    clauses.push(&instruction[start..]);

    clauses
        .into_iter()
        .map(|c| {
            let mut clause = c.trim().trim_end_matches(['.', ',']).trim();
            for lead in LEADING_CONNECTIVES {
                if clause.get(..lead.len()).is_some_and(|p| p.eq_ignore_ascii_case(lead)) {
                    clause = clause[lead.len()..].trim_start();
                }
            }
            clause.to_string()
        })
        .filter(|c| !c.is_empty())
        .collect()
}

/// Classify one clause. `None` means no rule matched.
pub fn classify(clause: &str) -> Option<(Intent, ActionArgs)> {
    RULES.iter().find_map(|rule| {
        let caps = rule.pattern.captures(clause)?;
        (rule.bind)(&caps).map(|args| (rule.intent, args))
    })
}

pub struct RulePlanner {
    registry: Arc<ActionRegistry>,
}

impl RulePlanner {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    /// Ordered plan for the instruction. May be empty.
    pub fn plan(&self, instruction: &str) -> Vec<ActionStep> {
        let mut steps = Vec::new();
        for clause in split_clauses(instruction) {
            let Some((intent, args)) = classify(&clause) else {
                debug!(clause = %clause, "no rule matched, dropping clause");
                continue;
            };
            let Some(action) = self.registry.get_action(intent.action_name()) else {
                debug!(action = intent.action_name(), "action not registered, dropping clause");
                continue;
            };
            steps.push(ActionStep { action, args });
        }
        steps
    }

    /// Like [`plan`](Self::plan) but an empty plan is an error.
    pub fn plan_or_err(&self, instruction: &str) -> Result<Vec<ActionStep>> {
        let steps = self.plan(instruction);
        if steps.is_empty() {
            return Err(UalError::Planning(format!(
                "no recognizable instruction in '{}'",
                instruction
            )));
        }
        Ok(steps)
    }
}

/// Flatten bound steps into the wire form the executors consume.
pub fn lower_plan(steps: &[ActionStep]) -> Result<Vec<WebAction>> {
    let mut actions = Vec::new();
    for step in steps {
        actions.extend(step.action.web_actions(&step.args)?);
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskRunner;
    use crate::types::{Task, UalResult};
    use async_trait::async_trait;

    struct NoopRunner;

    #[async_trait]
    impl TaskRunner for NoopRunner {
        async fn run(&self, _task: Task) -> UalResult {
            UalResult::default()
        }
    }

    fn planner() -> RulePlanner {
        RulePlanner::new(Arc::new(ActionRegistry::with_builtins(Arc::new(NoopRunner))))
    }

    #[test]
    fn test_open_then_search() {
        let steps = planner().plan("open github.com and then search for puppeteer");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name(), NAVIGATE);
        assert_eq!(steps[0].arg_str("url"), Some("https://github.com"));
        assert_eq!(steps[1].name(), WEB_SEARCH);
        assert_eq!(steps[1].arg_str("query"), Some("puppeteer"));
    }

    #[test]
    fn test_type_and_click() {
        let steps = planner()
            .plan("go to example.com, then type 'black and white' into '#q', and then click on #submit");
        let names: Vec<_> = steps.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec![NAVIGATE, TYPE_TEXT, CLICK]);
        assert_eq!(steps[1].arg_str("text"), Some("black and white"));
        assert_eq!(steps[1].arg_str("selector"), Some("#q"));
        assert_eq!(steps[2].arg_str("selector"), Some("#submit"));
    }

    #[test]
    fn test_unrecognized_clauses_dropped() {
        let steps = planner().plan("make me a sandwich and search rust lifetimes");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].arg_str("query"), Some("rust lifetimes"));
    }

    #[test]
    fn test_malformed_type_clause_produces_no_step() {
        assert!(planner().plan("type hello into the box").is_empty());
    }

    #[test]
    fn test_empty_plan_is_error() {
        for input in ["", "hello there", "open the settings", "please do something"] {
            let err = planner().plan_or_err(input).unwrap_err();
            assert!(matches!(err, UalError::Planning(_)), "input: {input}");
        }
    }

    #[test]
    fn test_split_clauses() {
        assert_eq!(
            split_clauses("Open a.com, and then click #x then search \"cats and dogs\""),
            vec!["Open a.com", "click #x", "search \"cats and dogs\""]
        );
        assert_eq!(split_clauses("then click #b."), vec!["click #b"]);
    }

    #[test]
    fn test_rule_order_is_explicit() {
        let (intent, _) = classify("search for click buttons").unwrap();
        assert_eq!(intent, Intent::WebSearch);
        let (intent, _) = classify("Click on 'button.primary'").unwrap();
        assert_eq!(intent, Intent::Click);
    }

    #[test]
    fn test_lower_plan() {
        let steps = planner().plan("visit docs.rs and click #search");
        let actions = lower_plan(&steps).unwrap();
        assert_eq!(
            actions,
            vec![
                WebAction::Navigate { url: "https://docs.rs".into() },
                WebAction::Click { selector: "#search".into() },
            ]
        );
    }
}
