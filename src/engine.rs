//! Execution engine: runs an ordered list of [`WebAction`]s against one
//! browser session and folds the observations into a [`UalResult`].
//!
//! A failing action never aborts the task. Its error is recorded in the step
//! trace and the next action runs. Only a launch failure is fatal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{EngineConfig, bounded_wait};
use crate::hands::{BrowserLauncher, BrowserSession, PageDriver};
use crate::registry::normalize_url;
use crate::types::{BotStatus, EXTRACT_MAX_CHARS, Extraction, PageData, Task, UalResult, WebAction};

/// Anything that can carry out a [`Task`].
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Task) -> UalResult;
}

#[derive(Clone)]
pub struct ExecutionEngine {
    launcher: Arc<dyn BrowserLauncher>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: EngineConfig) -> Self {
        Self { launcher, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a task to completion. Blocks the calling thread.
    pub fn run_blocking(&self, task: &Task) -> UalResult {
        let mut steps = vec![format!("Launching browser for goal: {}", task.goal)];

        let session = match self.launcher.launch(task.session_id.as_deref()) {
            Ok(session) => session,
            Err(e) => {
                error!(session = ?task.session_id, "launch failed: {}", e);
                steps.push(format!("Fatal: {}", e));
                return UalResult::failure(e.to_string(), steps);
            }
        };
        steps.push("Browser ready".to_string());

        let result = TaskRun::new(&self.config, task, session.as_ref(), steps).execute();
        session.close();
        result
    }
}

#[async_trait]
impl TaskRunner for ExecutionEngine {
    async fn run(&self, task: Task) -> UalResult {
        let engine = self.clone();
        info!(goal = %task.goal, actions = task.actions.len(), "running task");
        tokio::task::spawn_blocking(move || engine.run_blocking(&task))
            .await
            .unwrap_or_else(|e| {
                error!("task worker panicked: {}", e);
                UalResult::failure(
                    format!("execution worker failed: {}", e),
                    vec!["Fatal: execution worker failed".to_string()],
                )
            })
    }
}

/// State of one task while its actions run.
struct TaskRun<'a> {
    config: &'a EngineConfig,
    task: &'a Task,
    session: &'a dyn BrowserSession,
    steps: Vec<String>,
    screenshot: Option<Vec<u8>>,
    extracted: Vec<Extraction>,
    failed: usize,
}

fn pause(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}

impl<'a> TaskRun<'a> {
    fn new(
        config: &'a EngineConfig,
        task: &'a Task,
        session: &'a dyn BrowserSession,
        steps: Vec<String>,
    ) -> Self {
        Self {
            config,
            task,
            session,
            steps,
            screenshot: None,
            extracted: Vec::new(),
            failed: 0,
        }
    }

    fn execute(mut self) -> UalResult {
        let task = self.task;
        if let Some(url) = &task.url {
            self.attempt(&WebAction::Navigate {
                url: normalize_url(url),
            });
        }
        for action in &task.actions {
            self.attempt(action);
        }
        self.finalize()
    }

    fn attempt(&mut self, action: &WebAction) {
        self.steps.push(format!("Executing: {}", action));
        match self.perform(action) {
            Ok(None) => self.steps.push(format!("Done: {}", action.kind())),
            Ok(Some(note)) => self.steps.push(format!("Done: {} ({})", action.kind(), note)),
            Err(e) => {
                self.failed += 1;
                warn!(action = action.kind(), "action failed: {:#}", e);
                self.steps
                    .push(format!("Warning: Failed: {} - {:#}", action, e));
            }
        }
    }

    fn perform(&mut self, action: &WebAction) -> anyhow::Result<Option<String>> {
        let page = self.session.active_page()?;
        let cfg = self.config;

        match action {
            WebAction::Navigate { url } => {
                let current = page.url();
                if !should_navigate(&current, url) {
                    debug!(%current, target = %url, "already on page, skipping navigation");
                    return Ok(Some(format!("already on {}", current)));
                }
                page.navigate(url, cfg.navigation_timeout)?;
                pause(Duration::from_millis(cfg.pacing.settle_ms));
            }
            WebAction::Click { selector } => {
                page.wait_for_visible(selector, cfg.selector_timeout)?;
                let bbox = page.bounding_box(selector)?;
                for (x, y) in bbox.sweep(cfg.pacing.pointer_steps) {
                    page.move_pointer(x, y)?;
                    pause(Duration::from_millis(cfg.pacing.pointer_step_ms));
                }
                page.click(selector)?;
                pause(Duration::from_millis(cfg.pacing.settle_ms));
            }
            WebAction::Type { selector, value } => {
                page.wait_for_visible(selector, cfg.selector_timeout)?;
                page.select_all(selector)?;
                page.press_key("Backspace")?;

                let text = value.trim_end_matches(['\n', '\r']);
                for c in text.chars() {
                    page.send_char(c)?;
                    pause(cfg.pacing.key_delay());
                }

                let submit = text.len() != value.len() || self.task.implies_search();
                if submit {
                    page.press_key("Enter")?;
                    self.await_navigation(page.as_ref());
                    return Ok(Some("submitted".to_string()));
                }
            }
            WebAction::Press { key } => {
                page.press_key(key)?;
                if key.eq_ignore_ascii_case("enter") {
                    self.await_navigation(page.as_ref());
                }
            }
            WebAction::Wait { timeout } => {
                let (wait, capped) = bounded_wait(*timeout, cfg.max_wait);
                pause(wait);
                if capped {
                    return Ok(Some(format!("capped at {}ms", wait.as_millis())));
                }
            }
            WebAction::Screenshot => {
                self.screenshot = Some(page.screenshot()?);
            }
            WebAction::Scroll { selector: Some(selector) } => {
                // The bounding-box script centres the element as a side effect.
                page.bounding_box(selector)?;
            }
            WebAction::Scroll { selector: None } => page.scroll_by(cfg.scroll_step_px)?,
            WebAction::Extract { selector } => {
                let content = page.extract_text(selector, EXTRACT_MAX_CHARS)?;
                let chars = content.chars().count();
                self.extracted.push(Extraction {
                    label: selector.clone(),
                    content,
                });
                return Ok(Some(format!("{} chars", chars)));
            }
        }
        Ok(None)
    }

    /// Best effort: a key press that does not navigate is not an error.
    fn await_navigation(&self, page: &dyn PageDriver) {
        if let Err(e) = page.wait_for_navigation(self.config.enter_navigation_timeout) {
            debug!("no navigation after Enter: {:#}", e);
        }
    }

    fn finalize(mut self) -> UalResult {
        let page = match self.session.active_page() {
            Ok(page) => page,
            Err(e) => {
                warn!("no page left to observe: {:#}", e);
                self.steps.push(format!("Warning: could not observe final page - {:#}", e));
                return UalResult {
                    success: true,
                    screenshot: self.screenshot.as_deref().map(|b| STANDARD.encode(b)),
                    steps: self.steps,
                    ..Default::default()
                };
            }
        };

        if self.screenshot.is_none() {
            match page.screenshot() {
                Ok(bytes) => self.screenshot = Some(bytes),
                Err(e) => self
                    .steps
                    .push(format!("Warning: closing screenshot failed - {:#}", e)),
            }
        }

        let title = page.title().unwrap_or_default();
        let url = page.url();
        let text = page.visible_text(self.config.text_limit).unwrap_or_default();
        let dom_tree = page.dom_snapshot().ok().filter(|s| !s.is_empty());

        let bot_status = BotStatus::detect(&title, &text);
        if bot_status == BotStatus::BlockDetected {
            warn!(%url, "bot challenge detected");
            self.steps.push(format!("Bot challenge detected on {}", url));
        }
        self.steps.push(format!("Finished on {} ({})", url, title));

        UalResult {
            success: true,
            screenshot: self.screenshot.as_deref().map(|b| STANDARD.encode(b)),
            dom_tree,
            data: Some(PageData {
                title,
                url,
                text,
                bot_status,
                extracted: self.extracted,
                failed_actions: self.failed,
            }),
            error: None,
            steps: self.steps,
        }
    }
}

/// `host+path[?query]` with scheme, `www.` and trailing slash ignored.
fn page_key(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).or_else(|_| Url::parse(&normalize_url(raw))).ok()?;
    let host = parsed.host_str()?.trim_start_matches("www.").to_lowercase();
    let path = parsed.path().trim_end_matches('/');
    let query = parsed.query().map(|q| format!("?{}", q)).unwrap_or_default();
    Some(format!("{}{}{}", host, path, query))
}

/// Navigate unless the page is already showing the target.
pub fn should_navigate(current: &str, target: &str) -> bool {
    let current = current.trim();
    if current.is_empty() || current == "about:blank" || current.starts_with("chrome://") {
        return true;
    }
    match (page_key(current), page_key(target)) {
        (Some(c), Some(t)) => c != t,
        _ => true,
    }
}
