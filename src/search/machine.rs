//! The search/answer state machine.
//!
//! ```text
//! INIT ──► ASK_USER ──► RUN_SEARCH ──► DONE
//!   └───────────────────────┘
//! ```
//!
//! A reply to a clarifying question re-runs [`SearchMachine::decide_next_phase`]
//! on the combined query. Clarification rounds are capped; past the cap the
//! machine searches with what it has.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::{RawHit, SearchBackend, source_domain, synthetic_hit};
use super::model::{
    Answer, AnswerSource, Phase, Prompt, SearchQuery, SearchResult, SearchSnapshot, SearchState,
    UserInput, new_id,
};
use super::store::{Record, SearchStore, feedback};
use super::synthesis::{Synthesizer, link_sources};
use crate::brain::{AiMode, AskAi, AskRequest};
use crate::error::{Result, UalError};

/// Queries with fewer words than this always get a clarifying question.
pub const MIN_QUERY_TOKENS: usize = 2;
pub const DEFAULT_MAX_CLARIFICATIONS: usize = 1;

/// What one step of the machine produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub state: SearchState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Prompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<AnswerSource>,
}

impl SearchOutcome {
    fn asked(state: SearchState, prompt: Prompt) -> Self {
        Self {
            state,
            prompt: Some(prompt),
            answer: None,
            results: Vec::new(),
            sources: Vec::new(),
        }
    }
}

pub struct SearchMachine {
    store: Arc<dyn SearchStore>,
    backend: Arc<dyn SearchBackend>,
    ai: Option<Arc<dyn AskAi>>,
    synthesizer: Synthesizer,
    max_clarifications: usize,
    replying: Mutex<HashSet<String>>,
}

/// Marks one state as having a reply in progress until dropped.
struct ReplyGuard<'a> {
    replying: &'a Mutex<HashSet<String>>,
    state_id: String,
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut replying) = self.replying.lock() {
            replying.remove(&self.state_id);
        }
    }
}

impl SearchMachine {
    pub fn new(
        store: Arc<dyn SearchStore>,
        backend: Arc<dyn SearchBackend>,
        ai: Option<Arc<dyn AskAi>>,
    ) -> Self {
        Self {
            store,
            backend,
            synthesizer: Synthesizer::new(ai.clone()),
            ai,
            max_clarifications: DEFAULT_MAX_CLARIFICATIONS,
            replying: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_max_clarifications(mut self, max: usize) -> Self {
        self.max_clarifications = max;
        self
    }

    /// Open a new conversation turn for `query` and run it as far as it goes.
    pub async fn start(&self, session_id: &str, query: &str) -> Result<SearchOutcome> {
        let state = SearchState::new(session_id, query.trim());
        self.store.save_state(&state).await?;
        info!(state_id = %state.id, session = session_id, "search started: {}", state.initial_query);
        let combined = state.initial_query.clone();
        self.advance(state, &combined).await
    }

    /// Answer the pending clarifying question. A second reply to the same
    /// state while one is still running is rejected with `SessionBusy`.
    pub async fn respond(&self, state_id: &str, text: &str) -> Result<SearchOutcome> {
        let _guard = self.claim_reply(state_id)?;
        let snapshot = self.store.query(state_id).await?;
        let state = snapshot
            .state
            .ok_or_else(|| UalError::StateNotFound(state_id.to_string()))?;
        if state.current_phase != Phase::AskUser {
            return Err(UalError::Phase {
                from: state.current_phase.to_string(),
                to: "reply".to_string(),
            });
        }

        let input = UserInput {
            id: new_id(),
            search_state_id: state.id.clone(),
            prompt_id: snapshot.prompts.last().map(|p| p.id.clone()),
            text: text.trim().to_string(),
            created_at: Utc::now(),
        };
        self.store.add(vec![Record::UserInput(input)]).await?;

        let combined = std::iter::once(state.initial_query.as_str())
            .chain(snapshot.user_inputs.iter().map(|u| u.text.as_str()))
            .chain(std::iter::once(text.trim()))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(state_id, "re-evaluating combined query: {}", combined);
        self.advance(state, &combined).await
    }

    fn claim_reply(&self, state_id: &str) -> Result<ReplyGuard<'_>> {
        let mut replying = self
            .replying
            .lock()
            .map_err(|_| UalError::Store("reply registry poisoned".to_string()))?;
        if !replying.insert(state_id.to_string()) {
            return Err(UalError::SessionBusy(state_id.to_string()));
        }
        Ok(ReplyGuard {
            replying: &self.replying,
            state_id: state_id.to_string(),
        })
    }

    pub async fn get(&self, state_id: &str) -> Result<SearchSnapshot> {
        let snapshot = self.store.query(state_id).await?;
        if snapshot.state.is_none() {
            return Err(UalError::StateNotFound(state_id.to_string()));
        }
        Ok(snapshot)
    }

    pub async fn record_feedback(
        &self,
        answer_id: &str,
        helpful: bool,
        note: Option<String>,
    ) -> Result<Answer> {
        self.store.set_feedback(answer_id, feedback(helpful, note)).await
    }

    /// ASK_USER for short or ambiguous queries, RUN_SEARCH otherwise. A failing
    /// classifier counts as "clear".
    pub async fn decide_next_phase(&self, query: &str) -> Phase {
        if query.split_whitespace().count() < MIN_QUERY_TOKENS {
            return Phase::AskUser;
        }
        let Some(ai) = &self.ai else {
            return Phase::RunSearch;
        };
        match ai.ask(AskRequest::new(query, AiMode::Classify)).await {
            Ok(verdict) if verdict.trim().to_uppercase().starts_with("AMBIGUOUS") => Phase::AskUser,
            Ok(_) => Phase::RunSearch,
            Err(e) => {
                warn!("query classification failed, searching anyway: {}", e);
                Phase::RunSearch
            }
        }
    }

    async fn advance(&self, mut state: SearchState, query: &str) -> Result<SearchOutcome> {
        let mut next = self.decide_next_phase(query).await;
        if next == Phase::AskUser && state.clarifications >= self.max_clarifications {
            debug!(state_id = %state.id, "clarification limit reached");
            next = Phase::RunSearch;
        }

        state.transition(next)?;
        match next {
            Phase::AskUser => {
                state.clarifications += 1;
                let prompt = Prompt {
                    id: new_id(),
                    search_state_id: state.id.clone(),
                    text: self.clarifying_question(query).await,
                    created_at: Utc::now(),
                };
                self.store.add(vec![Record::Prompt(prompt.clone())]).await?;
                self.store.update_state(&state).await?;
                info!(state_id = %state.id, "asking user: {}", prompt.text);
                Ok(SearchOutcome::asked(state, prompt))
            }
            _ => {
                self.store.update_state(&state).await?;
                self.run_search(state, query).await
            }
        }
    }

    async fn clarifying_question(&self, query: &str) -> String {
        if let Some(ai) = &self.ai {
            match ai.ask(AskRequest::new(query, AiMode::Clarify)).await {
                Ok(question) if !question.trim().is_empty() => return question.trim().to_string(),
                Ok(_) => {}
                Err(e) => warn!("clarifying question failed, using template: {}", e),
            }
        }
        format!(
            "Could you say more about what you want to know about \"{}\"?",
            query
        )
    }

    async fn run_search(&self, mut state: SearchState, query: &str) -> Result<SearchOutcome> {
        let search_query = SearchQuery {
            id: new_id(),
            search_state_id: state.id.clone(),
            text: query.to_string(),
            created_at: Utc::now(),
        };

        let hits = match self.backend.search(query).await {
            Ok(hits) if !hits.is_empty() => hits,
            Ok(_) => vec![synthetic_hit(query, "no results")],
            Err(e) => {
                warn!(state_id = %state.id, "search backend unavailable: {}", e);
                vec![synthetic_hit(query, &e.to_string())]
            }
        };
        let results = rank(&state.id, &search_query.id, hits);

        let synthesis = self.synthesizer.synthesize(query, &results).await;
        let answer = Answer {
            id: new_id(),
            search_state_id: state.id.clone(),
            answer_text: synthesis.answer_text,
            summary_text: synthesis.summary_text,
            created_at: Utc::now(),
            feedback: None,
        };
        let sources = link_sources(&answer.id, &answer.answer_text, &results);

        let mut records = vec![Record::Query(search_query)];
        records.extend(results.iter().cloned().map(Record::Result));
        records.push(Record::Answer(answer.clone()));
        records.extend(sources.iter().cloned().map(Record::Source));
        self.store.add(records).await?;

        state.transition(Phase::Done)?;
        self.store.update_state(&state).await?;
        info!(
            state_id = %state.id,
            results = results.len(),
            citations = sources.len(),
            "search done"
        );

        Ok(SearchOutcome {
            state,
            prompt: None,
            answer: Some(answer),
            results,
            sources,
        })
    }
}

/// Dense 1-based ranks in backend order.
fn rank(state_id: &str, query_id: &str, hits: Vec<RawHit>) -> Vec<SearchResult> {
    hits.into_iter()
        .enumerate()
        .map(|(i, hit)| SearchResult {
            id: new_id(),
            search_state_id: state_id.to_string(),
            search_query_id: query_id.to_string(),
            rank: i + 1,
            source_domain: source_domain(&hit.url),
            title: hit.title,
            url: hit.url,
            snippet: hit.snippet,
            full_text: hit.full_text,
            published_date: hit.published_date,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::backend::OfflineBackend;
    use crate::search::store::MemoryStore;
    use crate::search::synthesis::cited_ranks;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticBackend(Vec<RawHit>);

    #[async_trait]
    impl SearchBackend for StaticBackend {
        async fn search(&self, _query: &str) -> Result<Vec<RawHit>> {
            Ok(self.0.clone())
        }
    }

    fn hit(n: usize) -> RawHit {
        RawHit {
            title: format!("Result {}", n),
            url: format!("https://www.site{}.com/page", n),
            snippet: format!("Snippet number {}.", n),
            full_text: None,
            published_date: None,
        }
    }

    /// Scripted model: classification verdict plus a fixed answer.
    struct ScriptedAi {
        verdict: &'static str,
        answer: &'static str,
        modes: Mutex<Vec<AiMode>>,
    }

    #[async_trait]
    impl AskAi for ScriptedAi {
        async fn ask(&self, request: AskRequest) -> Result<String> {
            self.modes.lock().unwrap().push(request.mode);
            Ok(match request.mode {
                AiMode::Classify => self.verdict.to_string(),
                AiMode::Clarify => "Which part of it?".to_string(),
                _ => self.answer.to_string(),
            })
        }
    }

    fn machine(backend: Arc<dyn SearchBackend>, ai: Option<Arc<dyn AskAi>>) -> SearchMachine {
        SearchMachine::new(Arc::new(MemoryStore::new()), backend, ai)
    }

    #[tokio::test]
    async fn test_single_token_query_asks_then_searches() {
        let m = machine(Arc::new(StaticBackend(vec![hit(1), hit(2)])), None);

        let first = m.start("s1", "AI").await.unwrap();
        assert_eq!(first.state.current_phase, Phase::AskUser);
        assert!(first.prompt.unwrap().text.contains("\"AI\""));

        let second = m
            .respond(&first.state.id, "latest breakthroughs in robotics")
            .await
            .unwrap();
        assert_eq!(second.state.id, first.state.id);
        assert_eq!(second.state.current_phase, Phase::Done);
        assert_eq!(second.results.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.results[0].source_domain, "site1.com");

        let snapshot = m.get(&first.state.id).await.unwrap();
        assert_eq!(snapshot.queries[0].text, "AI latest breakthroughs in robotics");
        assert_eq!(snapshot.user_inputs.len(), 1);
        assert_eq!(snapshot.user_inputs[0].prompt_id, Some(snapshot.prompts[0].id.clone()));
    }

    #[tokio::test]
    async fn test_decide_next_phase() {
        let m = machine(Arc::new(OfflineBackend), None);
        assert_eq!(m.decide_next_phase("AI").await, Phase::AskUser);
        assert_eq!(m.decide_next_phase("   ").await, Phase::AskUser);
        assert_eq!(m.decide_next_phase("rust borrow checker").await, Phase::RunSearch);

        let ai = Arc::new(ScriptedAi {
            verdict: "AMBIGUOUS",
            answer: "",
            modes: Mutex::new(Vec::new()),
        });
        let m = machine(Arc::new(OfflineBackend), Some(ai));
        assert_eq!(m.decide_next_phase("apple price").await, Phase::AskUser);
    }

    #[tokio::test]
    async fn test_done_is_terminal() {
        let m = machine(Arc::new(StaticBackend(vec![hit(1)])), None);
        let outcome = m.start("s1", "rust error handling").await.unwrap();
        assert_eq!(outcome.state.current_phase, Phase::Done);

        let err = m.respond(&outcome.state.id, "more").await.unwrap_err();
        assert!(matches!(err, UalError::Phase { .. }));
        let snapshot = m.get(&outcome.state.id).await.unwrap();
        assert_eq!(snapshot.state.unwrap().current_phase, Phase::Done);
        assert!(snapshot.user_inputs.is_empty());
    }

    #[tokio::test]
    async fn test_clarifications_are_bounded() {
        let ai = Arc::new(ScriptedAi {
            verdict: "AMBIGUOUS",
            answer: "It depends [1].",
            modes: Mutex::new(Vec::new()),
        });
        let m = machine(Arc::new(StaticBackend(vec![hit(1)])), Some(ai.clone()))
            .with_max_clarifications(2);

        let first = m.start("s1", "jaguar speed").await.unwrap();
        assert_eq!(first.prompt.as_ref().unwrap().text, "Which part of it?");
        let second = m.respond(&first.state.id, "the animal").await.unwrap();
        assert_eq!(second.state.current_phase, Phase::AskUser);
        assert_eq!(second.state.clarifications, 2);
        let third = m.respond(&first.state.id, "top running speed").await.unwrap();
        assert_eq!(third.state.current_phase, Phase::Done);
        assert_eq!(third.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_outage_yields_synthetic_result() {
        let m = machine(Arc::new(OfflineBackend), None);
        let outcome = m.start("s1", "rust release date").await.unwrap();
        assert_eq!(outcome.state.current_phase, Phase::Done);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].snippet.contains("no search backend configured"));
        assert!(outcome.answer.is_some());
    }

    #[tokio::test]
    async fn test_hung_backend_degrades_to_synthetic_result() {
        use crate::search::backend::SearxBackend;
        use std::time::Duration;
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"results": []}))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        let backend = SearxBackend::new(format!("{}/search", server.uri()))
            .with_timeout(Duration::from_millis(200));
        let m = machine(Arc::new(backend), None);

        let outcome = tokio::time::timeout(Duration::from_secs(5), m.start("s1", "rust release date"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state.current_phase, Phase::Done);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].url.starts_with("https://duckduckgo.com/"));
    }

    struct SlowBackend;

    #[async_trait]
    impl SearchBackend for SlowBackend {
        async fn search(&self, _query: &str) -> Result<Vec<RawHit>> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(vec![hit(1), hit(2)])
        }
    }

    #[tokio::test]
    async fn test_concurrent_replies_search_once() {
        let m = machine(Arc::new(SlowBackend), None);
        let first = m.start("s1", "AI").await.unwrap();
        let id = first.state.id.clone();

        let (a, b) = tokio::join!(
            m.respond(&id, "robot arms"),
            m.respond(&id, "language models")
        );
        let (ok, busy) = if a.is_ok() { (a, b) } else { (b, a) };
        assert_eq!(ok.unwrap().state.current_phase, Phase::Done);
        assert!(matches!(busy, Err(UalError::SessionBusy(_))));

        let snapshot = m.get(&id).await.unwrap();
        assert_eq!(snapshot.results.len(), 2);
        assert_eq!(snapshot.user_inputs.len(), 1);

        let err = m.respond(&id, "again").await.unwrap_err();
        assert!(matches!(err, UalError::Phase { .. }));
    }

    #[tokio::test]
    async fn test_every_marker_has_exactly_one_source() {
        let ai = Arc::new(ScriptedAi {
            verdict: "CLEAR",
            answer: "First fact [2]. Second fact [1][9]. Again [2].",
            modes: Mutex::new(Vec::new()),
        });
        let m = machine(Arc::new(StaticBackend(vec![hit(1), hit(2), hit(3)])), Some(ai.clone()));
        let outcome = m.start("s1", "two facts please").await.unwrap();

        let answer = outcome.answer.unwrap();
        assert!(!answer.answer_text.contains("[9]"));
        let ranks = cited_ranks(&answer.answer_text);
        assert_eq!(ranks.len(), outcome.sources.len());
        for source in &outcome.sources {
            let result = outcome.results.iter().find(|r| r.id == source.search_result_id).unwrap();
            assert!(ranks.contains(&result.rank));
        }
        assert_eq!(
            *ai.modes.lock().unwrap(),
            vec![AiMode::Classify, AiMode::Answer]
        );
    }

    #[tokio::test]
    async fn test_feedback_and_missing_state() {
        let m = machine(Arc::new(StaticBackend(vec![hit(1)])), None);
        let outcome = m.start("s1", "tokio select macro").await.unwrap();
        let answer = outcome.answer.unwrap();
        let updated = m
            .record_feedback(&answer.id, false, Some("too short".into()))
            .await
            .unwrap();
        assert_eq!(updated.feedback.unwrap().note.as_deref(), Some("too short"));

        assert!(matches!(m.get("missing").await, Err(UalError::StateNotFound(_))));
        assert!(matches!(m.respond("missing", "x").await, Err(UalError::StateNotFound(_))));
    }
}
