//! Universal Action Layer: turn a natural-language goal into browser actions,
//! run them against a real browser or a live page, and fold the results into
//! cited answers.

pub mod brain;
pub mod client;
pub mod config;
pub mod dom;
pub mod engine;
pub mod error;
pub mod extension;
pub mod face;
pub mod hands;
pub mod planner;
pub mod registry;
pub mod search;
pub mod types;

pub use client::{ExecutionReport, UalClient};
pub use config::{Config, EngineConfig};
pub use engine::{ExecutionEngine, TaskRunner};
pub use error::{Result, UalError};
pub use registry::{Action, ActionRegistry, ActionStep};
pub use types::{AgentStep, Task, UalResult, WebAction};
