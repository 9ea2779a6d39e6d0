//! Entities owned by a search conversation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, UalError};

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    AskUser,
    RunSearch,
    Done,
}

impl Phase {
    /// INIT -> {ASK_USER, RUN_SEARCH} -> DONE. A further clarification round
    /// keeps the state in ASK_USER.
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Init, Phase::AskUser)
                | (Phase::Init, Phase::RunSearch)
                | (Phase::AskUser, Phase::AskUser)
                | (Phase::AskUser, Phase::RunSearch)
                | (Phase::RunSearch, Phase::Done)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::AskUser => "ASK_USER",
            Phase::RunSearch => "RUN_SEARCH",
            Phase::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchState {
    pub id: String,
    pub session_id: String,
    pub initial_query: String,
    pub current_phase: Phase,
    #[serde(default)]
    pub clarifications: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SearchState {
    pub fn new(session_id: impl Into<String>, initial_query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            session_id: session_id.into(),
            initial_query: initial_query.into(),
            current_phase: Phase::Init,
            clarifications: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.current_phase.can_transition_to(next) {
            return Err(UalError::Phase {
                from: self.current_phase.to_string(),
                to: next.to_string(),
            });
        }
        self.current_phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A clarifying question put to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    pub search_state_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInput {
    pub id: String,
    pub search_state_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub id: String,
    pub search_state_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub search_state_id: String,
    pub search_query_id: String,
    /// Dense, 1-based within the state.
    pub rank: usize,
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    pub source_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFeedback {
    pub helpful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub id: String,
    pub search_state_id: String,
    pub answer_text: String,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<AnswerFeedback>,
}

/// Joins an answer to a result it cites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSource {
    pub answer_id: String,
    pub search_result_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_span: Option<String>,
}

/// Everything a state owns, as returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSnapshot {
    pub state: Option<SearchState>,
    pub prompts: Vec<Prompt>,
    pub user_inputs: Vec<UserInput>,
    pub queries: Vec<SearchQuery>,
    pub results: Vec<SearchResult>,
    pub answers: Vec<Answer>,
    pub sources: Vec<AnswerSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use Phase::*;
        assert!(Init.can_transition_to(AskUser));
        assert!(Init.can_transition_to(RunSearch));
        assert!(AskUser.can_transition_to(RunSearch));
        assert!(RunSearch.can_transition_to(Done));
        assert!(!Init.can_transition_to(Done));
        assert!(!RunSearch.can_transition_to(AskUser));
        for next in [Init, AskUser, RunSearch, Done] {
            assert!(!Done.can_transition_to(next));
        }
    }

    #[test]
    fn test_state_rejects_leaving_done() {
        let mut state = SearchState::new("s1", "rust async");
        state.transition(Phase::RunSearch).unwrap();
        state.transition(Phase::Done).unwrap();
        let err = state.transition(Phase::AskUser).unwrap_err();
        assert_eq!(err.to_string(), "Invalid phase transition: DONE -> ASK_USER");
        assert_eq!(state.current_phase, Phase::Done);
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(serde_json::to_value(Phase::AskUser).unwrap(), "ASK_USER");
        assert_eq!(Phase::RunSearch.to_string(), "RUN_SEARCH");
    }
}
