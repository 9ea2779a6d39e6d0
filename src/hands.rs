//! Browser sessions: how the engine gets a browser and talks to its pages.
//!
//! [`BrowserLauncher`] is the strategy chosen once at start-up: launch a fresh
//! Chrome per task ([`LaunchBackend`]) or attach to a running one
//! ([`AttachBackend`]). Both hand back a [`BrowserSession`] whose pages are
//! driven through the synchronous [`PageDriver`] trait.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Deserialize;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use crate::dom::{self, BoundingBox};
use crate::error::UalError;

/// One live page. Implementations block; the engine runs them off the async runtime.
pub trait PageDriver {
    fn url(&self) -> String;
    fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;
    fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()>;
    fn bounding_box(&self, selector: &str) -> Result<BoundingBox>;
    fn move_pointer(&self, x: f64, y: f64) -> Result<()>;
    fn click(&self, selector: &str) -> Result<()>;
    /// Focus the element and select all of its content.
    fn select_all(&self, selector: &str) -> Result<()>;
    fn send_char(&self, c: char) -> Result<()>;
    fn press_key(&self, key: &str) -> Result<()>;
    fn wait_for_navigation(&self, timeout: Duration) -> Result<()>;
    fn scroll_by(&self, dy: i64) -> Result<()>;
    fn screenshot(&self) -> Result<Vec<u8>>;
    fn title(&self) -> Result<String>;
    fn visible_text(&self, limit: usize) -> Result<String>;
    fn extract_text(&self, selector: &str, limit: usize) -> Result<String>;
    fn dom_snapshot(&self) -> Result<String>;
}

pub trait BrowserSession {
    /// The most recently created page. Resolved fresh on every call because
    /// actions may open new top-level contexts.
    fn active_page(&self) -> Result<Arc<dyn PageDriver>>;

    /// Release the browser. Consumes the session.
    fn close(self: Box<Self>);
}

pub trait BrowserLauncher: Send + Sync {
    fn launch(&self, session_id: Option<&str>) -> std::result::Result<Box<dyn BrowserSession>, UalError>;
}

pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36 Edg/122.0.0.0",
];

pub fn pick_user_agent() -> &'static str {
    USER_AGENTS[rand::random::<u32>() as usize % USER_AGENTS.len()]
}

pub const SESSION_ID_MAX_LEN: usize = 64;

/// Session ids become directory names verbatim, so only a safe alphabet is
/// accepted. Rejecting rather than rewriting keeps distinct ids on distinct profiles.
pub fn validate_session_id(id: &str) -> std::result::Result<&str, UalError> {
    let valid = !id.is_empty()
        && id.len() <= SESSION_ID_MAX_LEN
        && !id.chars().all(|c| c == '_' || c == '-')
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(UalError::Launch(format!(
            "invalid session id '{}': use up to {} letters, digits, '-' or '_'",
            id, SESSION_ID_MAX_LEN
        )));
    }
    Ok(id)
}

/// Tracks which session ids are in use so two tasks never share a profile.
#[derive(Clone, Default)]
pub struct SessionLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, session_id: &str) -> std::result::Result<SessionGuard, UalError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| UalError::Launch("session registry poisoned".into()))?;
        if !active.insert(session_id.to_string()) {
            return Err(UalError::SessionBusy(session_id.to_string()));
        }
        Ok(SessionGuard {
            locks: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(session_id))
            .unwrap_or(false)
    }
}

pub struct SessionGuard {
    locks: SessionLocks,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.locks.active.lock() {
            active.remove(&self.session_id);
        }
    }
}

// Helper to find a Chrome executable; `None` lets headless_chrome look for one itself.
pub fn find_chrome() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join("Google").join("Chrome").join("Application").join("chrome.exe"));
    }
    candidates.into_iter().find(|p| p.exists())
}

/// Make a freshly created tab look like an ordinary browser before it loads anything.
fn shape_identity(tab: &Tab, user_agent: &str) -> Result<()> {
    tab.enable_stealth_mode()?;
    tab.set_user_agent(user_agent, Some("en-US,en;q=0.9"), None)?;
    Ok(())
}

/// Launches a new Chrome per task, optionally on a persisted profile.
pub struct LaunchBackend {
    chrome_path: Option<PathBuf>,
    headless: bool,
    profiles_root: PathBuf,
    locks: SessionLocks,
}

impl LaunchBackend {
    pub fn new(chrome_path: Option<PathBuf>, headless: bool, profiles_root: PathBuf) -> Self {
        Self {
            chrome_path,
            headless,
            profiles_root,
            locks: SessionLocks::new(),
        }
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn profile_dir(&self, session_id: &str) -> std::result::Result<PathBuf, UalError> {
        Ok(self.profiles_root.join(validate_session_id(session_id)?))
    }

    fn prepare_profile(dir: &Path) -> std::result::Result<(), UalError> {
        if dir.exists() {
            debug!(profile = %dir.display(), "resuming persisted profile");
            return Ok(());
        }
        info!(profile = %dir.display(), "creating profile");
        std::fs::create_dir_all(dir)
            .map_err(|e| UalError::Launch(format!("cannot create profile {}: {}", dir.display(), e)))
    }
}

impl BrowserLauncher for LaunchBackend {
    fn launch(&self, session_id: Option<&str>) -> std::result::Result<Box<dyn BrowserSession>, UalError> {
        let session_id = session_id.map(validate_session_id).transpose()?;
        let guard = session_id.map(|id| self.locks.acquire(id)).transpose()?;
        let user_data_dir = match session_id {
            Some(id) => {
                let dir = self.profile_dir(id)?;
                Self::prepare_profile(&dir)?;
                Some(dir)
            }
            None => None,
        };

        let user_agent = pick_user_agent();
        let owned_args: Vec<OsString> = [
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-infobars".to_string(),
            "--password-store=basic".to_string(),
            format!("--user-agent={}", user_agent),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        let options = LaunchOptions {
            headless: self.headless,
            path: self.chrome_path.clone().or_else(find_chrome),
            user_data_dir,
            args: owned_args.iter().map(|a| a.as_os_str()).collect(),
            idle_browser_timeout: Duration::from_secs(120),
            ..Default::default()
        };

        info!(session = ?session_id, headless = self.headless, "starting Chrome");
        let browser = Browser::new(options).map_err(|e| {
            warn!("browser launch failed: {}", e);
            UalError::Launch(e.to_string())
        })?;

        let tab = browser
            .new_tab()
            .map_err(|e| UalError::Launch(format!("cannot open tab: {}", e)))?;
        shape_identity(&tab, user_agent)
            .map_err(|e| UalError::Launch(format!("cannot shape identity: {}", e)))?;

        Ok(Box::new(ChromeSession {
            browser,
            opened: Vec::new(),
            owns_browser: true,
            _guard: guard,
        }))
    }
}

pub const DEBUGGER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Turn a remote-debugging address such as `http://127.0.0.1:9222` into the
/// browser's `ws://` endpoint by asking its `/json/version`. Websocket URLs pass through.
pub async fn resolve_debugger_url(
    attach_url: &str,
    timeout: Duration,
) -> std::result::Result<String, UalError> {
    if attach_url.starts_with("ws://") || attach_url.starts_with("wss://") {
        return Ok(attach_url.to_string());
    }
    let endpoint = format!("{}/json/version", attach_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .get(&endpoint)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| UalError::Launch(format!("cannot reach {}: {}", endpoint, e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(UalError::Launch(format!("{} returned {}", endpoint, status)));
    }
    let info: VersionInfo = response
        .json()
        .await
        .map_err(|e| UalError::Launch(format!("no debugger URL at {}: {}", endpoint, e)))?;
    debug!(url = %info.web_socket_debugger_url, "resolved debugger endpoint");
    Ok(info.web_socket_debugger_url)
}

/// Attaches to a Chrome started elsewhere with remote debugging enabled.
/// Expects the browser's `ws://` endpoint; see [`resolve_debugger_url`].
pub struct AttachBackend {
    debugger_url: String,
    locks: SessionLocks,
}

impl AttachBackend {
    pub fn new(debugger_url: impl Into<String>) -> Self {
        Self {
            debugger_url: debugger_url.into(),
            locks: SessionLocks::new(),
        }
    }
}

impl BrowserLauncher for AttachBackend {
    fn launch(&self, session_id: Option<&str>) -> std::result::Result<Box<dyn BrowserSession>, UalError> {
        let guard = session_id.map(|id| self.locks.acquire(id)).transpose()?;

        info!(url = %self.debugger_url, "attaching to running Chrome");
        let browser = Browser::connect(self.debugger_url.clone())
            .map_err(|e| UalError::Launch(format!("attach failed: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| UalError::Launch(format!("cannot open tab: {}", e)))?;
        shape_identity(&tab, pick_user_agent())
            .map_err(|e| UalError::Launch(format!("cannot shape identity: {}", e)))?;

        Ok(Box::new(ChromeSession {
            browser,
            opened: vec![tab],
            owns_browser: false,
            _guard: guard,
        }))
    }
}

pub struct ChromeSession {
    browser: Browser,
    opened: Vec<Arc<Tab>>,
    owns_browser: bool,
    _guard: Option<SessionGuard>,
}

impl BrowserSession for ChromeSession {
    fn active_page(&self) -> Result<Arc<dyn PageDriver>> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map_err(|_| anyhow!("tab list poisoned"))?;
        let tab = tabs.last().cloned().ok_or_else(|| anyhow!("no open pages"))?;
        Ok(Arc::new(ChromePage { tab }) as Arc<dyn PageDriver>)
    }

    fn close(self: Box<Self>) {
        if !self.owns_browser {
            for tab in &self.opened {
                if let Err(e) = tab.close(false) {
                    debug!("closing attached tab failed: {}", e);
                }
            }
        }
        info!("browser session closed");
        // Dropping a launched Browser terminates its process.
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }
}

const VISIBILITY_POLL: Duration = Duration::from_millis(100);

impl PageDriver for ChromePage {
    fn url(&self) -> String {
        self.tab.get_url()
    }

    fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);
        self.tab.navigate_to(url)?.wait_until_navigated()?;
        Ok(())
    }

    fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        self.tab.wait_for_element_with_custom_timeout(selector, timeout)?;
        let js = format!(
            "(() => {{ const el = document.querySelector({}); \
             return !!el && el.getClientRects().length > 0 && getComputedStyle(el).visibility !== 'hidden'; }})()",
            dom::js_str(selector)
        );
        while !dom::eval_bool(&self.tab, &js)? {
            if started.elapsed() >= timeout {
                return Err(anyhow!("Element not visible: {}", selector));
            }
            std::thread::sleep(VISIBILITY_POLL);
        }
        Ok(())
    }

    fn bounding_box(&self, selector: &str) -> Result<BoundingBox> {
        dom::eval_json(&self.tab, &dom::bounding_box_js(selector))?
            .ok_or_else(|| anyhow!("Element not found: {}", selector))
    }

    fn move_pointer(&self, x: f64, y: f64) -> Result<()> {
        self.tab.move_mouse_to_point(Point { x, y })?;
        Ok(())
    }

    fn click(&self, selector: &str) -> Result<()> {
        self.tab.find_element(selector)?.click()?;
        Ok(())
    }

    fn select_all(&self, selector: &str) -> Result<()> {
        if dom::eval_bool(&self.tab, &dom::select_all_js(selector))? {
            Ok(())
        } else {
            Err(anyhow!("Element not found: {}", selector))
        }
    }

    fn send_char(&self, c: char) -> Result<()> {
        self.tab.type_str(&c.to_string())?;
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<()> {
        self.tab.press_key(key)?;
        Ok(())
    }

    fn wait_for_navigation(&self, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);
        self.tab.wait_until_navigated()?;
        Ok(())
    }

    fn scroll_by(&self, dy: i64) -> Result<()> {
        self.tab.evaluate(&dom::scroll_by_js(0, dy), false)?;
        Ok(())
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        self.tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
    }

    fn title(&self) -> Result<String> {
        self.tab.get_title()
    }

    fn visible_text(&self, limit: usize) -> Result<String> {
        dom::eval_string(&self.tab, &dom::visible_text_js(limit))
    }

    fn extract_text(&self, selector: &str, limit: usize) -> Result<String> {
        dom::eval_string(&self.tab, &dom::extract_text_js(selector, limit))
    }

    fn dom_snapshot(&self) -> Result<String> {
        dom::capture_dom_snapshot(&self.tab)
    }
}
