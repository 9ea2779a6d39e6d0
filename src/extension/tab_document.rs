//! [`Document`] over a live Chrome tab, driven by injected JavaScript.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use headless_chrome::{Browser, Tab};
use tracing::info;

use super::executor::{Document, KeyPhase, Link};
use crate::dom::{self, js_str};

const HUD_HOST_ID: &str = "__ual_hud_host";

pub struct TabDocument {
    tab: Arc<Tab>,
    // Keeps the DevTools connection alive when the document attached itself.
    _browser: Option<Browser>,
}

impl TabDocument {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self {
            tab,
            _browser: None,
        }
    }

    /// Attach to a running Chrome through its `ws://` debugger endpoint and
    /// drive its most recently opened tab.
    pub fn attach(debugger_url: &str) -> Result<Self> {
        let browser = Browser::connect(debugger_url.to_string())?;
        let tab = {
            let tabs = browser
                .get_tabs()
                .lock()
                .map_err(|_| anyhow!("tab list lock poisoned"))?;
            tabs.last().cloned()
        };
        let tab = match tab {
            Some(tab) => tab,
            None => browser.new_tab()?,
        };
        info!(url = %tab.get_url(), "extension document attached");
        Ok(Self {
            tab,
            _browser: Some(browser),
        })
    }

    fn run(&self, js: &str) -> Result<bool> {
        dom::eval_bool(&self.tab, js)
    }

    fn require(&self, js: &str, what: &str) -> Result<()> {
        if self.run(js)? {
            Ok(())
        } else {
            Err(anyhow!("{}", what))
        }
    }
}

pub fn exists_js(selector: &str) -> String {
    format!("document.querySelector({}) !== null", js_str(selector))
}

pub fn click_js(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
        js_str(selector)
    )
}

/// Uses the native value setter so framework-controlled inputs notice the change.
pub fn set_value_js(selector: &str, value: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  el.focus();
  const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  const setter = Object.getOwnPropertyDescriptor(proto, 'value');
  if ('value' in el && setter && setter.set) {{ setter.set.call(el, {val}); }}
  else if (el.isContentEditable) {{ el.textContent = {val}; }}
  else {{ el.value = {val}; }}
  el.dispatchEvent(new Event('input', {{bubbles: true}}));
  el.dispatchEvent(new Event('change', {{bubbles: true}}));
  return true;
}})()"#,
        sel = js_str(selector),
        val = js_str(value)
    )
}

pub fn flash_outline_js(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({});
  if (!el) return false;
  const previous = el.style.outline;
  el.style.outline = '3px solid #22c55e';
  setTimeout(() => {{ el.style.outline = previous; }}, 600);
  return true;
}})()"#,
        js_str(selector)
    )
}

pub fn read_text_js(selector: Option<&str>, limit: usize) -> String {
    match selector {
        Some(sel) => dom::extract_text_js(sel, limit),
        None => dom::visible_text_js(limit),
    }
}

pub fn links_js(limit: usize) -> String {
    format!(
        "JSON.stringify([...document.querySelectorAll('a[href]')].slice(0, {}).map(a => ({{text: (a.innerText || '').trim().slice(0, 80), href: a.href}})))",
        limit
    )
}

pub fn scroll_into_view_js(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return false; el.scrollIntoView({{block: 'center', behavior: 'smooth'}}); return true; }})()",
        js_str(selector)
    )
}

pub fn set_location_js(url: &str) -> String {
    format!("window.location.href = {}; true", js_str(url))
}

pub fn key_event_js(selector: Option<&str>, key: &str, phase: KeyPhase) -> String {
    let target = match selector {
        Some(sel) => format!("document.querySelector({})", js_str(sel)),
        None => "(document.activeElement || document.body)".to_string(),
    };
    format!(
        r#"(() => {{
  const el = {target};
  if (!el) return false;
  el.dispatchEvent(new KeyboardEvent({event}, {{key: {key}, bubbles: true, cancelable: true}}));
  return true;
}})()"#,
        target = target,
        event = js_str(phase.event_name()),
        key = js_str(key)
    )
}

/// Shadow-root overlay: click-through except for its Analyze button, and
/// untouched by the host page's CSS.
pub fn mount_overlay_js(status: &str) -> String {
    format!(
        r#"(() => {{
  if (document.getElementById({host_id})) return true;
  const host = document.createElement('div');
  host.id = {host_id};
  host.style.cssText = 'position:fixed;top:12px;right:12px;z-index:2147483647;pointer-events:none;';
  const root = host.attachShadow({{mode: 'closed'}});
  root.innerHTML = `
    <style>
      .hud {{ font: 12px/1.4 system-ui, sans-serif; color: #e5e7eb; background: rgba(17,24,39,.85);
              border-radius: 8px; padding: 8px 12px; display: flex; gap: 8px; align-items: center; }}
      .dot {{ width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }}
      button {{ pointer-events: auto; font: inherit; border: 0; border-radius: 4px; padding: 2px 8px; cursor: pointer; }}
    </style>
    <div class="hud"><span class="dot"></span><span class="status"></span><button>Analyze</button></div>`;
  root.querySelector('.status').textContent = {status};
  root.querySelector('button').addEventListener('click', () => {{ window.__ualAnalyzeRequested = Date.now(); }});
  (document.body || document.documentElement).appendChild(host);
  return true;
}})()"#,
        host_id = js_str(HUD_HOST_ID),
        status = js_str(status)
    )
}

pub fn unmount_overlay_js() -> String {
    format!(
        "(() => {{ const host = document.getElementById({}); if (host) host.remove(); return true; }})()",
        js_str(HUD_HOST_ID)
    )
}

impl Document for TabDocument {
    fn exists(&self, selector: &str) -> Result<bool> {
        self.run(&exists_js(selector))
    }

    fn click(&self, selector: &str) -> Result<()> {
        self.require(&click_js(selector), &format!("Element not found: {}", selector))
    }

    fn set_value(&self, selector: &str, value: &str) -> Result<()> {
        self.require(&set_value_js(selector, value), &format!("Element not found: {}", selector))
    }

    fn flash_outline(&self, selector: &str) -> Result<()> {
        // Cosmetic; a vanished element is not an error here.
        self.run(&flash_outline_js(selector)).map(|_| ())
    }

    fn title(&self) -> Result<String> {
        self.tab.get_title()
    }

    fn read_text(&self, selector: Option<&str>, limit: usize) -> Result<String> {
        dom::eval_string(&self.tab, &read_text_js(selector, limit))
    }

    fn links(&self, limit: usize) -> Result<Vec<Link>> {
        Ok(dom::eval_json(&self.tab, &links_js(limit))?.unwrap_or_default())
    }

    fn scroll_into_view(&self, selector: &str) -> Result<()> {
        self.require(&scroll_into_view_js(selector), &format!("Element not found: {}", selector))
    }

    fn scroll_by(&self, dx: i64, dy: i64) -> Result<()> {
        self.tab.evaluate(&dom::scroll_by_js(dx, dy), false)?;
        Ok(())
    }

    fn set_location(&self, url: &str) -> Result<()> {
        self.tab.evaluate(&set_location_js(url), false)?;
        Ok(())
    }

    fn dispatch_key(&self, selector: Option<&str>, key: &str, phase: KeyPhase) -> Result<()> {
        self.require(&key_event_js(selector, key, phase), "no element to receive key events")
    }

    fn mount_overlay(&self, status: &str) -> Result<()> {
        self.require(&mount_overlay_js(status), "overlay could not be mounted")
    }

    fn unmount_overlay(&self) -> Result<()> {
        self.run(&unmount_overlay_js()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_quote_their_inputs() {
        let js = set_value_js("input[name='q']", "it's \"quoted\"");
        assert!(js.contains(r#""input[name='q']""#));
        assert!(js.contains(r#""it's \"quoted\"""#));
        assert!(set_location_js("https://a.b/?x='1'").contains(r#""https://a.b/?x='1'""#));
    }

    #[test]
    fn test_key_event_targets() {
        let focused = key_event_js(None, "Enter", KeyPhase::Down);
        assert!(focused.contains("document.activeElement"));
        assert!(focused.contains(r#"new KeyboardEvent("keydown""#));
        let targeted = key_event_js(Some("#q"), "a", KeyPhase::Up);
        assert!(targeted.contains(r##"document.querySelector("#q")"##));
        assert!(targeted.contains(r#""keyup""#));
    }

    #[test]
    fn test_overlay_is_isolated_and_click_through() {
        let js = mount_overlay_js("Connected");
        assert!(js.contains("attachShadow"));
        assert!(js.contains("pointer-events:none"));
        assert!(js.contains("Analyze"));
        assert!(unmount_overlay_js().contains(HUD_HOST_ID));
    }

    #[test]
    fn test_read_text_with_and_without_selector() {
        assert!(read_text_js(None, 50).contains("document.body"));
        assert!(read_text_js(Some("main"), 50).contains(r#""main""#));
    }
}
