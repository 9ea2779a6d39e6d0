use thiserror::Error;

/// Errors surfaced by the action layer.
#[derive(Debug, Error)]
pub enum UalError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Could not create a plan: {0}")]
    Planning(String),

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Invalid arguments for {action}: {message}")]
    InvalidArgs { action: String, message: String },

    #[error("Action failed: {0}")]
    Action(String),

    #[error("AI request failed: {0}")]
    Ai(String),

    #[error("Search backend failed: {0}")]
    Search(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Search state not found: {0}")]
    StateNotFound(String),

    #[error("Invalid phase transition: {from} -> {to}")]
    Phase { from: String, to: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl UalError {
    /// Fatal errors abort a task before any action runs.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UalError::Launch(_) | UalError::SessionBusy(_))
    }
}

impl From<reqwest::Error> for UalError {
    fn from(e: reqwest::Error) -> Self {
        UalError::Http(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UalError>;
