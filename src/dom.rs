//! JavaScript injected into live pages, plus helpers to evaluate it on a tab.
//!
//! Every script is side-effect free unless its name says otherwise, and every
//! string interpolated into a script goes through [`js_str`].

use anyhow::{Result, anyhow};
use headless_chrome::Tab;
use serde::de::DeserializeOwned;

use crate::types::DOM_SNAPSHOT_MAX_CHARS;

/// Walks the visible DOM (max depth 15) and emits one line per interactive
/// element, tagging each with a `data-eid="[eN]"` attribute so planners can
/// target it, plus short leaf text lines for context.
pub const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','TEMPLATE']);
  const INTERACTIVE = new Set(['a','button','input','textarea','select']);
  const lines = [];
  const seen = new Set();
  let id = 0;

  const visible = (el) => {
    if (el.offsetParent === null && el.tagName !== 'BODY') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  };
  const label = (el) => (el.innerText || el.textContent || '').trim().slice(0, 60);
  const push = (line) => { if (line && !seen.has(line)) { seen.add(line); lines.push(line); } };

  const describe = (el, eid) => {
    const tag = el.tagName.toLowerCase();
    if (tag === 'a') return eid + ' link "' + label(el) + '" -> ' + (el.getAttribute('href') || '');
    if (tag === 'button') return eid + ' button "' + label(el) + '"';
    if (tag === 'select') {
      return eid + ' select [' + [...el.options].map(o => o.text.trim().slice(0, 20)).join('|') + ']';
    }
    let d = eid + ' ' + tag + ' type=' + (el.type || 'text');
    if (el.name) d += ' name=' + el.name;
    if (el.placeholder) d += ' placeholder="' + el.placeholder + '"';
    if (el.value) d += ' value="' + String(el.value).slice(0, 30) + '"';
    return d;
  };

  const walk = (node, depth) => {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName) || !visible(child)) continue;
      if (INTERACTIVE.has(child.tagName.toLowerCase())) {
        const eid = '[e' + (id++) + ']';
        child.setAttribute('data-eid', eid);
        push(describe(child, eid));
      } else if (child.children.length === 0) {
        const t = (child.textContent || '').trim();
        if (t.length > 2 && t.length < 200) push('  "' + t.slice(0, 100) + '"');
      }
      walk(child, depth + 1);
    }
  };

  if (document.body) walk(document.body, 0);
  return lines.join('\n');
})()
"#;

/// Quote a Rust string as a JavaScript string literal.
pub fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

pub fn visible_text_js(limit: usize) -> String {
    format!(
        "(document.body ? document.body.innerText : '').slice(0, {})",
        limit
    )
}

pub fn extract_text_js(selector: &str, limit: usize) -> String {
    format!(
        "((document.querySelector({}) || {{}}).innerText || '').slice(0, {})",
        js_str(selector),
        limit
    )
}

/// Returns `{x, y, width, height}` in viewport coordinates, or null.
pub fn bounding_box_js(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({});
  if (!el) return 'null';
  el.scrollIntoView({{block: 'center', inline: 'center'}});
  const r = el.getBoundingClientRect();
  return JSON.stringify({{x: r.left, y: r.top, width: r.width, height: r.height}});
}})()"#,
        js_str(selector)
    )
}

/// Focus the element and select its whole content so a Backspace clears it.
pub fn select_all_js(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({});
  if (!el) return false;
  el.focus();
  if (typeof el.select === 'function') {{ el.select(); }}
  else {{
    const range = document.createRange();
    range.selectNodeContents(el);
    const sel = window.getSelection();
    sel.removeAllRanges();
    sel.addRange(range);
  }}
  return true;
}})()"#,
        js_str(selector)
    )
}

pub fn scroll_by_js(dx: i64, dy: i64) -> String {
    format!("window.scrollBy({}, {}); true", dx, dy)
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Pointer waypoints sweeping left to right across the box, ending at its centre.
    pub fn sweep(&self, steps: u32) -> Vec<(f64, f64)> {
        let steps = steps.max(1);
        let (cx, cy) = self.center();
        let mut points: Vec<(f64, f64)> = (0..steps)
            .map(|i| {
                let t = (i as f64 + 0.5) / steps as f64;
                let jitter = (rand::random::<f64>() - 0.5) * self.height * 0.2;
                (self.x + self.width * t, cy + jitter)
            })
            .collect();
        points.push((cx, cy));
        points
    }
}

pub fn truncate_snapshot(raw: &str) -> String {
    let total = raw.chars().count();
    if total > DOM_SNAPSHOT_MAX_CHARS {
        let head: String = raw.chars().take(DOM_SNAPSHOT_MAX_CHARS).collect();
        format!("{}\n... [truncated, {} total chars]", head, total)
    } else {
        raw.to_string()
    }
}

/// Evaluate a script that yields a string.
pub fn eval_string(tab: &Tab, js: &str) -> Result<String> {
    let result = tab.evaluate(js, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// Evaluate a script that yields a boolean; non-boolean results count as false.
pub fn eval_bool(tab: &Tab, js: &str) -> Result<bool> {
    let result = tab.evaluate(js, false)?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}

/// Evaluate a script that yields a JSON string and decode it.
pub fn eval_json<T: DeserializeOwned>(tab: &Tab, js: &str) -> Result<Option<T>> {
    let raw = eval_string(tab, js)?;
    if raw.is_empty() || raw == "null" {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| anyhow!("unexpected script result {}: {}", raw, e))
}

pub fn capture_dom_snapshot(tab: &Tab) -> Result<String> {
    Ok(truncate_snapshot(&eval_string(tab, SNAPSHOT_JS)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_str_escapes() {
        assert_eq!(js_str("a'b\"c"), r#""a'b\"c""#);
        assert!(extract_text_js("div[data-x='1']", 10).contains(r#""div[data-x='1']""#));
    }

    #[test]
    fn test_truncate_snapshot() {
        let raw = "x".repeat(DOM_SNAPSHOT_MAX_CHARS + 10);
        let out = truncate_snapshot(&raw);
        assert!(out.ends_with(&format!("[truncated, {} total chars]", DOM_SNAPSHOT_MAX_CHARS + 10)));
        assert_eq!(truncate_snapshot("short"), "short");
    }

    #[test]
    fn test_sweep_stays_inside_box_and_ends_at_center() {
        let bbox = BoundingBox { x: 10.0, y: 20.0, width: 100.0, height: 40.0 };
        let points = bbox.sweep(4);
        assert_eq!(points.len(), 5);
        assert_eq!(*points.last().unwrap(), (60.0, 40.0));
        for (x, y) in &points {
            assert!(*x >= 10.0 && *x <= 110.0);
            assert!(*y >= 20.0 && *y <= 60.0);
        }
    }
}
