use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Result, UalError};

/// Which browser strategy the engine uses. Chosen once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Launch a fresh Chrome per task.
    Launch,
    /// Attach to an already running Chrome exposing a debugging endpoint.
    Attach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Memory,
    File,
}

/// Command line and environment configuration for the agent server.
#[derive(Debug, Clone, Parser)]
#[command(name = "ual-agent")]
#[command(about = "Universal Action Layer agent server")]
#[command(version)]
pub struct Config {
    #[arg(long, env = "UAL_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "UAL_PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(long, env = "UAL_BACKEND", value_enum, default_value = "launch")]
    pub backend: BackendKind,

    /// Remote debugging address (`http://host:port` or a `ws://` browser
    /// endpoint) used by the attach backend and `--extension-tab`.
    #[arg(long, env = "UAL_ATTACH_URL", default_value = "http://127.0.0.1:9222")]
    pub attach_url: String,

    #[arg(long, env = "UAL_CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    #[arg(long, env = "UAL_HEADLESS", default_value_t = false)]
    pub headless: bool,

    /// Root directory for persisted per-session browser profiles.
    #[arg(long, env = "UAL_PROFILES_DIR")]
    pub profiles_dir: Option<PathBuf>,

    #[arg(long, env = "UAL_STORE", value_enum, default_value = "memory")]
    pub store: StoreKind,

    #[arg(long, env = "UAL_STORE_PATH", default_value = "search_store.json")]
    pub store_path: PathBuf,

    /// SearxNG-compatible JSON search endpoint.
    #[arg(long, env = "UAL_SEARCH_URL")]
    pub search_url: Option<String>,

    /// Remote plan service. When unset, plans come from the local LLM planner.
    #[arg(long, env = "UAL_PLANNER_URL")]
    pub planner_url: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub ai_api_key: Option<String>,

    #[arg(long, env = "UAL_AI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub ai_base_url: String,

    #[arg(long, env = "UAL_AI_MODEL", default_value = "gpt-4o-mini")]
    pub ai_model: String,

    #[arg(long, env = "UAL_MAX_CLARIFICATIONS", default_value_t = 1)]
    pub max_clarifications: usize,

    /// Seconds before a search backend request is abandoned.
    #[arg(long, env = "UAL_SEARCH_TIMEOUT", default_value_t = 10)]
    pub search_timeout: u64,

    /// Seconds before a model or plan service request is abandoned.
    #[arg(long, env = "UAL_AI_TIMEOUT", default_value_t = 60)]
    pub ai_timeout: u64,

    /// Longest pause a single `wait` action may take, in milliseconds.
    #[arg(long, env = "UAL_MAX_WAIT_MS", default_value_t = 30_000)]
    pub max_wait_ms: u64,

    /// Drive the newest tab of the Chrome at `--attach-url` through the
    /// extension routes.
    #[arg(long, env = "UAL_EXTENSION_TAB", default_value_t = false)]
    pub extension_tab: bool,

    #[arg(long, env = "UAL_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| UalError::Config(format!("invalid bind address: {}", e)))
    }

    /// Profile root, defaulting to the platform data directory.
    pub fn profiles_root(&self) -> PathBuf {
        self.profiles_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ual")
                .join("profiles")
        })
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_wait: Duration::from_millis(self.max_wait_ms),
            ..Default::default()
        }
    }
}

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// A requested `wait` in milliseconds, capped at `max`. The flag is set when capped.
pub fn bounded_wait(requested_ms: u64, max: Duration) -> (Duration, bool) {
    let requested = Duration::from_millis(requested_ms);
    if requested > max {
        (max, true)
    } else {
        (requested, false)
    }
}

/// Human-mimicking timing. Randomized delays are drawn uniformly from each range.
#[derive(Debug, Clone)]
pub struct Pacing {
    pub key_delay_ms: (u64, u64),
    pub pointer_steps: u32,
    pub pointer_step_ms: u64,
    pub settle_ms: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            key_delay_ms: (40, 140),
            pointer_steps: 4,
            pointer_step_ms: 25,
            settle_ms: 800,
        }
    }
}

impl Pacing {
    /// No delays at all, for scripted drivers.
    pub fn instant() -> Self {
        Self {
            key_delay_ms: (0, 0),
            pointer_steps: 2,
            pointer_step_ms: 0,
            settle_ms: 0,
        }
    }

    pub fn key_delay(&self) -> Duration {
        let (lo, hi) = self.key_delay_ms;
        if hi <= lo {
            return Duration::from_millis(lo);
        }
        let span = (hi - lo) as f32;
        Duration::from_millis(lo + (rand::random::<f32>() * span) as u64)
    }
}

/// Execution engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub navigation_timeout: Duration,
    pub selector_timeout: Duration,
    pub enter_navigation_timeout: Duration,
    pub scroll_step_px: i64,
    pub text_limit: usize,
    pub max_wait: Duration,
    pub pacing: Pacing,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            selector_timeout: Duration::from_secs(10),
            enter_navigation_timeout: Duration::from_secs(5),
            scroll_step_px: 600,
            text_limit: crate::types::PAGE_TEXT_MAX_CHARS,
            max_wait: DEFAULT_MAX_WAIT,
            pacing: Pacing::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::parse_from(["ual-agent"]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.backend, BackendKind::Launch);
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.max_clarifications, 1);
        assert_eq!(config.search_timeout(), Duration::from_secs(10));
        assert_eq!(config.engine_config().max_wait, DEFAULT_MAX_WAIT);
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn test_config_flags() {
        let config = Config::parse_from([
            "ual-agent",
            "--backend",
            "attach",
            "--store",
            "file",
            "--profiles-dir",
            "/tmp/profiles",
            "--port",
            "8088",
        ]);
        assert_eq!(config.backend, BackendKind::Attach);
        assert_eq!(config.store, StoreKind::File);
        assert_eq!(config.profiles_root(), PathBuf::from("/tmp/profiles"));
        assert_eq!(config.port, 8088);
    }

    #[test]
    fn test_invalid_bind_addr() {
        let mut config = Config::parse_from(["ual-agent"]);
        config.host = "not an ip".into();
        assert!(matches!(config.bind_addr(), Err(UalError::Config(_))));
    }

    #[test]
    fn test_bounded_wait_caps_oversized_requests() {
        let max = Duration::from_secs(30);
        assert_eq!(bounded_wait(250, max), (Duration::from_millis(250), false));
        assert_eq!(bounded_wait(u64::MAX, max), (max, true));
        assert_eq!(bounded_wait(30_000, max), (max, false));
    }

    #[test]
    fn test_pacing_key_delay_in_range() {
        let pacing = Pacing::default();
        for _ in 0..50 {
            let d = pacing.key_delay().as_millis() as u64;
            assert!((40..=140).contains(&d));
        }
        assert_eq!(Pacing::instant().key_delay(), Duration::ZERO);
    }
}
