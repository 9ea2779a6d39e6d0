//! Wire types for the page-resident executor.
//!
//! Requests arrive as `{type: "EXECUTE" | "BROADCAST", action, selector?, value?}`
//! or as the reserved `{action: "HUD_TOGGLE", value: bool}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HUD_TOGGLE: &str = "HUD_TOGGLE";

/// One command for the page, as carried by `EXECUTE` and `BROADCAST`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    pub action: String,
    pub selector: Option<String>,
    pub value: Option<Value>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// The value as text. Numbers and booleans are rendered, null is absent.
    pub fn value_str(&self) -> Option<String> {
        match self.value.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// The value as a whole number, accepting numeric strings.
    pub fn value_i64(&self) -> Option<i64> {
        match self.value.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRequest", into = "RawRequest")]
pub enum ExtensionRequest {
    Execute(Command),
    Broadcast(Command),
    HudToggle { value: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRequest {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

impl TryFrom<RawRequest> for ExtensionRequest {
    type Error = String;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        if raw.action == HUD_TOGGLE {
            return match raw.value {
                Some(Value::Bool(value)) => Ok(ExtensionRequest::HudToggle { value }),
                _ => Err("HUD_TOGGLE requires a boolean value".to_string()),
            };
        }
        let command = Command {
            action: raw.action,
            selector: raw.selector,
            value: raw.value,
        };
        match raw.kind.as_deref() {
            Some("EXECUTE") => Ok(ExtensionRequest::Execute(command)),
            Some("BROADCAST") => Ok(ExtensionRequest::Broadcast(command)),
            Some(other) => Err(format!("Unknown request type: {}", other)),
            None => Err("missing request type".to_string()),
        }
    }
}

impl From<ExtensionRequest> for RawRequest {
    fn from(request: ExtensionRequest) -> Self {
        match request {
            ExtensionRequest::HudToggle { value } => RawRequest {
                kind: None,
                action: HUD_TOGGLE.to_string(),
                selector: None,
                value: Some(Value::Bool(value)),
            },
            ExtensionRequest::Execute(c) => RawRequest {
                kind: Some("EXECUTE".to_string()),
                action: c.action,
                selector: c.selector,
                value: c.value,
            },
            ExtensionRequest::Broadcast(c) => RawRequest {
                kind: Some("BROADCAST".to_string()),
                action: c.action,
                selector: c.selector,
                value: c.value,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExtensionResponse {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Success,
            data: None,
            message: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_execute_and_hud_toggle() {
        let req: ExtensionRequest =
            serde_json::from_value(json!({"type": "EXECUTE", "action": "CLICK", "selector": "#go"}))
                .unwrap();
        assert_eq!(req, ExtensionRequest::Execute(Command::new("CLICK").with_selector("#go")));

        let req: ExtensionRequest =
            serde_json::from_value(json!({"action": "HUD_TOGGLE", "value": true})).unwrap();
        assert_eq!(req, ExtensionRequest::HudToggle { value: true });
    }

    #[test]
    fn test_rejects_malformed_requests() {
        assert!(serde_json::from_value::<ExtensionRequest>(json!({"action": "HUD_TOGGLE", "value": "yes"})).is_err());
        assert!(serde_json::from_value::<ExtensionRequest>(json!({"action": "CLICK"})).is_err());
        assert!(serde_json::from_value::<ExtensionRequest>(json!({"type": "PING", "action": "CLICK"})).is_err());
    }

    #[test]
    fn test_response_wire_form() {
        let value = serde_json::to_value(ExtensionResponse::error("Element not found: #x")).unwrap();
        assert_eq!(value, json!({"status": "ERROR", "message": "Element not found: #x"}));
        assert_eq!(serde_json::to_value(ExtensionResponse::ok()).unwrap(), json!({"status": "SUCCESS"}));
    }

    #[test]
    fn test_command_value_coercion() {
        assert_eq!(Command::new("SCROLL").with_value("300").value_i64(), Some(300));
        assert_eq!(Command::new("SCROLL").with_value(-120).value_i64(), Some(-120));
        assert_eq!(Command::new("TYPE").with_value(42).value_str().as_deref(), Some("42"));
        assert_eq!(Command::new("TYPE").value_str(), None);
    }
}
