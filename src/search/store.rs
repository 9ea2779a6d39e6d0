//! Persistence for search conversations.
//!
//! One [`SearchStore`] interface, two implementations picked at start-up:
//! [`MemoryStore`] and the JSON-file backed [`JsonFileStore`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::model::{
    Answer, AnswerFeedback, AnswerSource, Prompt, SearchQuery, SearchResult, SearchSnapshot,
    SearchState, UserInput,
};
use crate::error::{Result, UalError};

/// A row appended to a state. Rows are never mutated once added, except for
/// answer feedback.
#[derive(Debug, Clone)]
pub enum Record {
    Prompt(Prompt),
    UserInput(UserInput),
    Query(SearchQuery),
    Result(SearchResult),
    Answer(Answer),
    Source(AnswerSource),
}

#[async_trait]
pub trait SearchStore: Send + Sync {
    async fn save_state(&self, state: &SearchState) -> Result<()>;
    /// Replace an existing state. Fails with `StateNotFound` for unknown ids.
    async fn update_state(&self, state: &SearchState) -> Result<()>;
    async fn load_state(&self, id: &str) -> Result<Option<SearchState>>;
    async fn add(&self, records: Vec<Record>) -> Result<()>;
    /// The state plus everything it owns.
    async fn query(&self, state_id: &str) -> Result<SearchSnapshot>;
    async fn set_feedback(&self, answer_id: &str, feedback: AnswerFeedback) -> Result<Answer>;
}

/// Shared table layout for both stores.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tables {
    states: HashMap<String, SearchState>,
    prompts: Vec<Prompt>,
    user_inputs: Vec<UserInput>,
    queries: Vec<SearchQuery>,
    results: Vec<SearchResult>,
    answers: Vec<Answer>,
    sources: Vec<AnswerSource>,
}

impl Tables {
    fn save_state(&mut self, state: &SearchState) {
        self.states.insert(state.id.clone(), state.clone());
    }

    fn update_state(&mut self, state: &SearchState) -> Result<()> {
        match self.states.get_mut(&state.id) {
            Some(existing) => {
                *existing = state.clone();
                Ok(())
            }
            None => Err(UalError::StateNotFound(state.id.clone())),
        }
    }

    fn add(&mut self, records: Vec<Record>) {
        for record in records {
            match record {
                Record::Prompt(r) => self.prompts.push(r),
                Record::UserInput(r) => self.user_inputs.push(r),
                Record::Query(r) => self.queries.push(r),
                Record::Result(r) => self.results.push(r),
                Record::Answer(r) => self.answers.push(r),
                Record::Source(r) => self.sources.push(r),
            }
        }
    }

    fn query(&self, state_id: &str) -> SearchSnapshot {
        let answers: Vec<Answer> = self
            .answers
            .iter()
            .filter(|a| a.search_state_id == state_id)
            .cloned()
            .collect();
        let mut results: Vec<SearchResult> = self
            .results
            .iter()
            .filter(|r| r.search_state_id == state_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.rank);

        SearchSnapshot {
            state: self.states.get(state_id).cloned(),
            prompts: self
                .prompts
                .iter()
                .filter(|p| p.search_state_id == state_id)
                .cloned()
                .collect(),
            user_inputs: self
                .user_inputs
                .iter()
                .filter(|u| u.search_state_id == state_id)
                .cloned()
                .collect(),
            queries: self
                .queries
                .iter()
                .filter(|q| q.search_state_id == state_id)
                .cloned()
                .collect(),
            results,
            sources: self
                .sources
                .iter()
                .filter(|s| answers.iter().any(|a| a.id == s.answer_id))
                .cloned()
                .collect(),
            answers,
        }
    }

    fn set_feedback(&mut self, answer_id: &str, feedback: AnswerFeedback) -> Result<Answer> {
        let answer = self
            .answers
            .iter_mut()
            .find(|a| a.id == answer_id)
            .ok_or_else(|| UalError::Store(format!("answer not found: {}", answer_id)))?;
        answer.feedback = Some(feedback);
        Ok(answer.clone())
    }
}

/// In-process store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let tables = self.tables.read().map_err(|e| UalError::Store(e.to_string()))?;
        Ok(f(&tables))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.write().map_err(|e| UalError::Store(e.to_string()))?;
        f(&mut tables)
    }
}

#[async_trait]
impl SearchStore for MemoryStore {
    async fn save_state(&self, state: &SearchState) -> Result<()> {
        self.write(|t| {
            t.save_state(state);
            Ok(())
        })
    }

    async fn update_state(&self, state: &SearchState) -> Result<()> {
        self.write(|t| t.update_state(state))
    }

    async fn load_state(&self, id: &str) -> Result<Option<SearchState>> {
        self.read(|t| t.states.get(id).cloned())
    }

    async fn add(&self, records: Vec<Record>) -> Result<()> {
        self.write(|t| {
            t.add(records);
            Ok(())
        })
    }

    async fn query(&self, state_id: &str) -> Result<SearchSnapshot> {
        self.read(|t| t.query(state_id))
    }

    async fn set_feedback(&self, answer_id: &str, feedback: AnswerFeedback) -> Result<Answer> {
        self.write(|t| t.set_feedback(answer_id, feedback))
    }
}

/// Keeps every table in one pretty-printed JSON file, rewritten after each change.
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Open the file, starting empty when it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let file = std::fs::File::open(&path).map_err(|e| UalError::Store(e.to_string()))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| UalError::Store(format!("corrupt store {}: {}", path.display(), e)))?
        } else {
            Tables::default()
        };
        debug!(path = %path.display(), states = tables.states.len(), "search store opened");
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    fn scratch_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(OsString::from).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write the tables to a scratch file and rename it over the store, so a
    /// crash mid-write leaves the previous contents intact.
    async fn persist(&self, tables: &Tables) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(tables).map_err(|e| UalError::Store(e.to_string()))?;
        let path = self.path.clone();
        let scratch = self.scratch_path();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&scratch)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            std::fs::rename(&scratch, &path)
        })
        .await
        .map_err(|e| UalError::Store(format!("store writer failed: {}", e)))?
        .map_err(|e| UalError::Store(e.to_string()))
    }
}

#[async_trait]
impl SearchStore for JsonFileStore {
    async fn save_state(&self, state: &SearchState) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.save_state(state);
        self.persist(&tables).await
    }

    async fn update_state(&self, state: &SearchState) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.update_state(state)?;
        self.persist(&tables).await
    }

    async fn load_state(&self, id: &str) -> Result<Option<SearchState>> {
        Ok(self.tables.lock().await.states.get(id).cloned())
    }

    async fn add(&self, records: Vec<Record>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.add(records);
        self.persist(&tables).await
    }

    async fn query(&self, state_id: &str) -> Result<SearchSnapshot> {
        Ok(self.tables.lock().await.query(state_id))
    }

    async fn set_feedback(&self, answer_id: &str, feedback: AnswerFeedback) -> Result<Answer> {
        let mut tables = self.tables.lock().await;
        let answer = tables.set_feedback(answer_id, feedback)?;
        self.persist(&tables).await?;
        Ok(answer)
    }
}

pub fn feedback(helpful: bool, note: Option<String>) -> AnswerFeedback {
    AnswerFeedback {
        helpful,
        note,
        recorded_at: Utc::now(),
    }
}
