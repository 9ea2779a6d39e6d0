//! Search/answer pipeline: clarify, search, synthesize a cited answer.

pub mod backend;
pub mod machine;
pub mod model;
pub mod store;
pub mod synthesis;

pub use backend::{OfflineBackend, RawHit, SearchBackend, SearxBackend};
pub use machine::{SearchMachine, SearchOutcome};
pub use model::{Answer, AnswerSource, Phase, Prompt, SearchResult, SearchSnapshot, SearchState};
pub use store::{JsonFileStore, MemoryStore, SearchStore};
