//! Answer synthesis from ranked results, with citation bookkeeping.
//!
//! A marker `[i]` survives in the answer only when a result of rank `i`
//! exists, and every surviving marker yields exactly one [`AnswerSource`].

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::warn;

use super::model::{AnswerSource, SearchResult};
use crate::brain::{AiMode, AskAi, AskRequest};

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("valid citation regex"));

const EXTRACTIVE_RESULTS: usize = 3;
const SUMMARY_MAX_CHARS: usize = 200;

/// Ranks cited in `text`, in ascending order.
pub fn cited_ranks(text: &str) -> BTreeSet<usize> {
    CITATION
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Drop markers that do not point at a result.
pub fn strip_unmatched_citations(text: &str, results: &[SearchResult]) -> String {
    let stripped = CITATION.replace_all(text, |caps: &regex::Captures| {
        let matched = caps[1]
            .parse::<usize>()
            .is_ok_and(|rank| results.iter().any(|r| r.rank == rank));
        if matched {
            caps[0].to_string()
        } else {
            String::new()
        }
    });
    stripped.replace(" .", ".").replace("  ", " ").trim().to_string()
}

/// One source per distinct marker that matches a result rank.
pub fn link_sources(answer_id: &str, text: &str, results: &[SearchResult]) -> Vec<AnswerSource> {
    cited_ranks(text)
        .into_iter()
        .filter_map(|rank| results.iter().find(|r| r.rank == rank))
        .map(|result| AnswerSource {
            answer_id: answer_id.to_string(),
            search_result_id: result.id.clone(),
            evidence_span: evidence_for(text, result.rank),
        })
        .collect()
}

/// The sentence carrying the first `[rank]` marker.
fn evidence_for(text: &str, rank: usize) -> Option<String> {
    let marker = format!("[{}]", rank);
    let at = text.find(&marker)?;
    let start = text[..at].rfind(['.', '!', '?', '\n']).map(|i| i + 1).unwrap_or(0);
    let span = text[start..at + marker.len()].trim();
    (!span.is_empty()).then(|| span.to_string())
}

/// First sentence, markers removed, bounded.
pub fn summarize(answer_text: &str) -> String {
    let plain = CITATION.replace_all(answer_text, "");
    let first = plain
        .split_inclusive(['.', '!', '?'])
        .next()
        .unwrap_or("")
        .replace(" .", ".");
    crate::types::truncate_chars(first.trim(), SUMMARY_MAX_CHARS)
}

pub fn sources_block(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| format!("[{}] {} ({})\n{}", r.rank, r.title, r.url, r.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Stitch the top snippets together, each cited to its result.
pub fn extractive_answer(results: &[SearchResult]) -> String {
    results
        .iter()
        .take(EXTRACTIVE_RESULTS)
        .filter(|r| !r.snippet.trim().is_empty())
        .map(|r| {
            let snippet = r.snippet.trim().trim_end_matches('.');
            format!("{} [{}].", snippet, r.rank)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer_text: String,
    pub summary_text: String,
}

pub struct Synthesizer {
    ai: Option<Arc<dyn AskAi>>,
}

impl Synthesizer {
    pub fn new(ai: Option<Arc<dyn AskAi>>) -> Self {
        Self { ai }
    }

    pub async fn synthesize(&self, query: &str, results: &[SearchResult]) -> Synthesis {
        let drafted = match &self.ai {
            Some(ai) => {
                let prompt = format!("Question: {}\n\nSources:\n{}", query, sources_block(results));
                match ai.ask(AskRequest::new(prompt, AiMode::Answer)).await {
                    Ok(text) if !text.trim().is_empty() => Some(text),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("answer synthesis failed, using extractive answer: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let raw = drafted.unwrap_or_else(|| extractive_answer(results));
        let answer_text = strip_unmatched_citations(&raw, results);
        Synthesis {
            summary_text: summarize(&answer_text),
            answer_text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, UalError};
    use async_trait::async_trait;

    fn result(rank: usize, snippet: &str) -> SearchResult {
        SearchResult {
            id: format!("r{}", rank),
            search_state_id: "st".into(),
            search_query_id: "q".into(),
            rank,
            title: format!("Title {}", rank),
            url: format!("https://example.com/{}", rank),
            snippet: snippet.into(),
            full_text: None,
            source_domain: "example.com".into(),
            published_date: None,
        }
    }

    struct FixedAi(Result<String>);

    #[async_trait]
    impl AskAi for FixedAi {
        async fn ask(&self, request: AskRequest) -> Result<String> {
            assert_eq!(request.mode, AiMode::Answer);
            assert!(request.query.contains("[1] Title 1"));
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(UalError::Ai(e.to_string())),
            }
        }
    }

    #[test]
    fn test_sources_only_for_matching_markers() {
        let results = vec![result(1, "a"), result(2, "b")];
        let text = strip_unmatched_citations("Rust is fast [1]. It is safe [2][7]. Also [1] again.", &results);
        assert_eq!(text, "Rust is fast [1]. It is safe [2]. Also [1] again.");

        let sources = link_sources("ans", &text, &results);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].search_result_id, "r1");
        assert_eq!(sources[0].evidence_span.as_deref(), Some("Rust is fast [1]"));
        assert_eq!(sources[1].search_result_id, "r2");

        for rank in cited_ranks(&text) {
            assert!(sources.iter().any(|s| s.search_result_id == format!("r{}", rank)));
        }
    }

    #[test]
    fn test_large_markers_are_stripped_too() {
        let results = vec![result(1, "a")];
        let text = "Fact [1]. Other [1000]. Huge [99999999999999999999999].";
        let cleaned = strip_unmatched_citations(text, &results);
        assert_eq!(cleaned, "Fact [1]. Other. Huge.");
        assert_eq!(link_sources("ans", &cleaned, &results).len(), 1);
    }

    #[test]
    fn test_no_markers_no_sources() {
        let results = vec![result(1, "a")];
        assert!(link_sources("ans", "Nothing cited here.", &results).is_empty());
    }

    #[test]
    fn test_extractive_answer_and_summary() {
        let results = vec![result(1, "Tokio is a runtime."), result(2, ""), result(3, "Async book")];
        let text = extractive_answer(&results);
        assert_eq!(text, "Tokio is a runtime [1]. Async book [3].");
        assert_eq!(summarize(&text), "Tokio is a runtime.");
    }

    #[tokio::test]
    async fn test_synthesizer_uses_model_and_strips_bad_markers() {
        let synth = Synthesizer::new(Some(Arc::new(FixedAi(Ok("Use tokio [1] or smol [4].".into())))));
        let out = synth.synthesize("runtime?", &[result(1, "tokio")]).await;
        assert_eq!(out.answer_text, "Use tokio [1] or smol.");
    }

    #[tokio::test]
    async fn test_synthesizer_falls_back_when_model_fails() {
        let synth = Synthesizer::new(Some(Arc::new(FixedAi(Err(UalError::Ai("down".into()))))));
        let out = synth.synthesize("runtime?", &[result(1, "tokio")]).await;
        assert_eq!(out.answer_text, "tokio [1].");
        assert_eq!(out.summary_text, "tokio.");
    }
}
