//! Page-resident command handler.
//!
//! [`ExtensionExecutor`] performs DOM-level effects through a [`Document`] and
//! turns every outcome, including failures, into an [`ExtensionResponse`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::protocol::{Command, ExtensionRequest, ExtensionResponse};

pub const READ_TEXT_MAX_CHARS: usize = 3000;
pub const READ_MAX_LINKS: usize = 20;
pub const DEFAULT_SCROLL_OFFSET: i64 = 600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Down,
    Press,
    Up,
}

impl KeyPhase {
    pub fn event_name(self) -> &'static str {
        match self {
            KeyPhase::Down => "keydown",
            KeyPhase::Press => "keypress",
            KeyPhase::Up => "keyup",
        }
    }
}

/// The page as the executor sees it.
pub trait Document {
    fn exists(&self, selector: &str) -> Result<bool>;
    fn click(&self, selector: &str) -> Result<()>;
    /// Replace the element's value and fire `input`/`change`.
    fn set_value(&self, selector: &str, value: &str) -> Result<()>;
    fn flash_outline(&self, selector: &str) -> Result<()>;
    fn title(&self) -> Result<String>;
    /// Text of the element, or of the body when no selector is given.
    fn read_text(&self, selector: Option<&str>, limit: usize) -> Result<String>;
    fn links(&self, limit: usize) -> Result<Vec<Link>>;
    fn scroll_into_view(&self, selector: &str) -> Result<()>;
    fn scroll_by(&self, dx: i64, dy: i64) -> Result<()>;
    fn set_location(&self, url: &str) -> Result<()>;
    /// Dispatch one key event to the element, or to the focused element.
    fn dispatch_key(&self, selector: Option<&str>, key: &str, phase: KeyPhase) -> Result<()>;
    fn mount_overlay(&self, status: &str) -> Result<()>;
    fn unmount_overlay(&self) -> Result<()>;
}

pub struct ExtensionExecutor<D> {
    document: D,
    hud_mounted: bool,
}

impl<D: Document> ExtensionExecutor<D> {
    pub fn new(document: D) -> Self {
        Self {
            document,
            hud_mounted: false,
        }
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn hud_mounted(&self) -> bool {
        self.hud_mounted
    }

    /// Handle an untyped message. Malformed messages become error responses.
    pub fn handle_value(&mut self, raw: Value) -> ExtensionResponse {
        match serde_json::from_value::<ExtensionRequest>(raw) {
            Ok(request) => self.handle(request),
            Err(e) => ExtensionResponse::error(format!("Invalid message: {}", e)),
        }
    }

    pub fn handle(&mut self, request: ExtensionRequest) -> ExtensionResponse {
        let outcome = match request {
            ExtensionRequest::HudToggle { value } => self.toggle_hud(value),
            ExtensionRequest::Broadcast(command) => {
                debug!(action = %command.action, "broadcast acknowledged");
                Ok(ExtensionResponse::ok())
            }
            ExtensionRequest::Execute(command) => self.execute(&command),
        };
        outcome.unwrap_or_else(|e| {
            warn!("extension action failed: {}", e);
            ExtensionResponse::error(e.to_string())
        })
    }

    fn execute(&self, command: &Command) -> Result<ExtensionResponse> {
        let selector = command.selector.as_deref();
        match command.action.to_uppercase().as_str() {
            "CLICK" => {
                let Some(sel) = self.resolve(selector)? else {
                    return Ok(not_found(selector));
                };
                self.document.click(sel)?;
                self.document.flash_outline(sel)?;
                Ok(ExtensionResponse::ok())
            }
            "TYPE" => {
                let Some(sel) = self.resolve(selector)? else {
                    return Ok(not_found(selector));
                };
                self.document.set_value(sel, &command.value_str().unwrap_or_default())?;
                self.document.flash_outline(sel)?;
                Ok(ExtensionResponse::ok())
            }
            "READ" => {
                if let Some(sel) = selector
                    && !self.document.exists(sel)?
                {
                    return Ok(not_found(selector));
                }
                let links = self.document.links(READ_MAX_LINKS)?;
                Ok(ExtensionResponse::ok_with(json!({
                    "title": self.document.title()?,
                    "text": self.document.read_text(selector, READ_TEXT_MAX_CHARS)?,
                    "links": links,
                })))
            }
            "SCROLL" => match selector {
                Some(sel) => {
                    if !self.document.exists(sel)? {
                        return Ok(not_found(selector));
                    }
                    self.document.scroll_into_view(sel)?;
                    Ok(ExtensionResponse::ok())
                }
                None => {
                    let dy = command.value_i64().unwrap_or(DEFAULT_SCROLL_OFFSET);
                    self.document.scroll_by(0, dy)?;
                    Ok(ExtensionResponse::ok())
                }
            },
            "NAVIGATE" => match command.value_str().filter(|u| !u.trim().is_empty()) {
                Some(url) => {
                    self.document.set_location(&url)?;
                    Ok(ExtensionResponse::ok())
                }
                None => Ok(ExtensionResponse::error("NAVIGATE requires a url value")),
            },
            "PRESS" => {
                if let Some(sel) = selector
                    && !self.document.exists(sel)?
                {
                    return Ok(not_found(selector));
                }
                let key = command.value_str().unwrap_or_else(|| "Enter".to_string());
                for phase in [KeyPhase::Down, KeyPhase::Press, KeyPhase::Up] {
                    self.document.dispatch_key(selector, &key, phase)?;
                }
                Ok(ExtensionResponse::ok())
            }
            _ => Ok(ExtensionResponse::error(format!(
                "Unknown Action: {}",
                command.action
            ))),
        }
    }

    /// `Some(selector)` when it matches an element.
    fn resolve<'a>(&self, selector: Option<&'a str>) -> Result<Option<&'a str>> {
        match selector {
            Some(sel) if self.document.exists(sel)? => Ok(Some(sel)),
            _ => Ok(None),
        }
    }

    fn toggle_hud(&mut self, mount: bool) -> Result<ExtensionResponse> {
        if mount != self.hud_mounted {
            if mount {
                self.document.mount_overlay("Connected")?;
            } else {
                self.document.unmount_overlay()?;
            }
            self.hud_mounted = mount;
        }
        Ok(ExtensionResponse::ok_with(json!({ "mounted": self.hud_mounted })))
    }
}

fn not_found(selector: Option<&str>) -> ExtensionResponse {
    ExtensionResponse::error(format!("Element not found: {}", selector.unwrap_or("")))
}
