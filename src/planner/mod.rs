pub mod goal;
pub mod rules;

pub use goal::{GoalPlanner, LlmGoalPlanner, PlanRequest, PlanResponse, RemoteGoalPlanner};
pub use rules::{RulePlanner, lower_plan};
