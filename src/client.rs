//! The one entry point the rest of the product calls.
//!
//! [`UalClient`] plans (rules first, then the goal planner), hands the plan to
//! the execution engine or to a page-resident executor, and narrates progress
//! as [`AgentStep`]s both in the returned report and on a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_MAX_WAIT, bounded_wait};
use crate::engine::TaskRunner;
use crate::error::{Result, UalError};
use crate::extension::{Command, ExtensionHandle, ExtensionRequest, ExtensionResponse};
use crate::planner::{GoalPlanner, PlanRequest, PlanResponse, RulePlanner, lower_plan};
use crate::registry::{ActionArgs, ActionDefinition, ActionRegistry};
use crate::search::SearchMachine;
use crate::types::{AgentStep, AgentStepKind, Task, UalResult, WebAction};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No plan could be produced for the goal.
    Planning,
    /// The browser session could not be started.
    Fatal,
}

/// What `execute` hands back: the task result plus its narration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    #[serde(flatten)]
    pub result: UalResult,
    pub agent_steps: Vec<AgentStep>,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

/// Outcome of dispatching a plan through the extension channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRun {
    pub steps: Vec<String>,
    pub responses: Vec<ExtensionResponse>,
    pub failed_actions: usize,
}

pub struct UalClient {
    registry: Arc<ActionRegistry>,
    rules: RulePlanner,
    goal_planner: Option<Arc<dyn GoalPlanner>>,
    runner: Arc<dyn TaskRunner>,
    search: Arc<SearchMachine>,
    extension: Option<ExtensionHandle>,
    max_wait: Duration,
    events: broadcast::Sender<AgentStep>,
}

impl UalClient {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        goal_planner: Option<Arc<dyn GoalPlanner>>,
        search: Arc<SearchMachine>,
    ) -> Self {
        let registry = Arc::new(ActionRegistry::with_builtins(runner.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            rules: RulePlanner::new(registry.clone()),
            registry,
            goal_planner,
            runner,
            search,
            extension: None,
            max_wait: DEFAULT_MAX_WAIT,
            events,
        }
    }

    pub fn with_extension(mut self, handle: ExtensionHandle) -> Self {
        self.extension = Some(handle);
        self
    }

    /// Cap for `wait` actions dispatched through the extension.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn search(&self) -> &Arc<SearchMachine> {
        &self.search
    }

    pub fn extension(&self) -> Option<&ExtensionHandle> {
        self.extension.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentStep> {
        self.events.subscribe()
    }

    fn narrate(&self, log: &mut Vec<AgentStep>, step: AgentStep) {
        // No subscribers is fine.
        let _ = self.events.send(step.clone());
        log.push(step);
    }

    pub fn list_actions(&self) -> Vec<ActionDefinition> {
        self.registry
            .list_actions()
            .iter()
            .map(|a| a.definition().clone())
            .collect()
    }

    /// Run one registered action on its own.
    pub async fn run_action(&self, name: &str, args: &ActionArgs) -> Result<Value> {
        let action = self
            .registry
            .get_action(name)
            .ok_or_else(|| UalError::ActionNotFound(name.to_string()))?;
        action.execute(args).await
    }

    /// Wire-form plan for a goal: the rule planner first, the goal planner
    /// when the rules find nothing.
    pub async fn plan(&self, goal: &str) -> Result<Vec<WebAction>> {
        let steps = self.rules.plan(goal);
        if !steps.is_empty() {
            debug!(steps = steps.len(), "rule planner produced a plan");
            return lower_plan(&steps);
        }

        if let Some(planner) = &self.goal_planner {
            let response = planner.plan(&PlanRequest::new(goal)).await?;
            if !response.actions.is_empty() {
                return Ok(response.actions);
            }
        }
        Err(UalError::Planning(format!("no actions for goal '{}'", goal)))
    }

    /// Backs the plan endpoint. The configured goal planner answers; without
    /// one, or when it fails, the rule planner does.
    pub async fn plan_request(&self, request: &PlanRequest) -> Result<PlanResponse> {
        if let Some(planner) = &self.goal_planner {
            match planner.plan(request).await {
                Ok(response) => return Ok(response),
                Err(e) => warn!("goal planner failed, trying rules: {}", e),
            }
        }
        let steps = self.rules.plan_or_err(&request.goal)?;
        Ok(PlanResponse {
            actions: lower_plan(&steps)?,
            status: Some("continue".to_string()),
            reasoning: Some(format!("matched {} instruction(s)", steps.len())),
            answer: None,
        })
    }

    /// Plan when needed, execute, and narrate.
    pub async fn execute(&self, mut task: Task) -> ExecutionReport {
        let mut log = Vec::new();

        if task.actions.is_empty() {
            self.narrate(
                &mut log,
                AgentStep::new(AgentStepKind::Planning, format!("Planning: {}", task.goal)),
            );
            match self.plan(&task.goal).await {
                Ok(actions) => task.actions = actions,
                Err(e) if task.url.is_some() => {
                    info!("no plan for goal, visiting url only: {}", e);
                }
                Err(e) => {
                    let message = e.to_string();
                    self.narrate(&mut log, AgentStep::new(AgentStepKind::Failed, message.clone()));
                    let steps = vec![format!("Planning: {}", task.goal), message.clone()];
                    return ExecutionReport {
                        result: UalResult::failure(message, steps),
                        agent_steps: log,
                        failure: Some(FailureKind::Planning),
                    };
                }
            }
        }

        self.narrate(
            &mut log,
            AgentStep::new(
                AgentStepKind::Executing,
                format!("Executing {} action(s)", task.actions.len()),
            )
            .with_actions(task.actions.clone()),
        );

        let result = self.runner.run(task).await;

        if !result.success {
            let message = result.error.clone().unwrap_or_else(|| "execution failed".to_string());
            self.narrate(&mut log, AgentStep::new(AgentStepKind::Failed, message));
            return ExecutionReport {
                result,
                agent_steps: log,
                failure: Some(FailureKind::Fatal),
            };
        }

        let observed = match &result.data {
            Some(data) => format!("On {} ({:?})", data.url, data.bot_status),
            None => "No page observed".to_string(),
        };
        self.narrate(
            &mut log,
            AgentStep::new(AgentStepKind::Observing, observed).with_screenshot(result.screenshot.clone()),
        );
        let failed = result.data.as_ref().map(|d| d.failed_actions).unwrap_or(0);
        self.narrate(
            &mut log,
            AgentStep::new(
                AgentStepKind::Completed,
                format!("Completed with {} failed action(s)", failed),
            ),
        );

        ExecutionReport {
            result,
            agent_steps: log,
            failure: None,
        }
    }

    /// Dispatch a plan through the page-resident executor, one action at a
    /// time. Failures are recorded and the next action still runs.
    pub async fn execute_via_extension(
        &self,
        handle: &ExtensionHandle,
        actions: &[WebAction],
    ) -> ExtensionRun {
        let mut run = ExtensionRun {
            steps: Vec::new(),
            responses: Vec::new(),
            failed_actions: 0,
        };

        for action in actions {
            run.steps.push(format!("Executing: {}", action));
            let response = match action {
                WebAction::Wait { timeout } => {
                    let (wait, capped) = bounded_wait(*timeout, self.max_wait);
                    if capped {
                        run.steps.push(format!("Wait capped at {}ms", wait.as_millis()));
                    }
                    tokio::time::sleep(wait).await;
                    ExtensionResponse::ok()
                }
                WebAction::Screenshot => {
                    ExtensionResponse::error("screenshot is not available through the extension")
                }
                other => match extension_command(other) {
                    Some(command) => handle.send(ExtensionRequest::Execute(command)).await,
                    None => ExtensionResponse::error(format!("Unknown Action: {}", other.kind())),
                },
            };

            if response.is_success() {
                run.steps.push(format!("Done: {}", action.kind()));
            } else {
                run.failed_actions += 1;
                run.steps.push(format!(
                    "Warning: Failed: {} - {}",
                    action,
                    response.message.as_deref().unwrap_or("unknown error")
                ));
            }
            run.responses.push(response);
        }
        run
    }
}

/// The extension command for a wire action, when the page can perform it.
pub fn extension_command(action: &WebAction) -> Option<Command> {
    let command = match action {
        WebAction::Navigate { url } => Command::new("NAVIGATE").with_value(url.as_str()),
        WebAction::Click { selector } => Command::new("CLICK").with_selector(selector.as_str()),
        WebAction::Type { selector, value } => Command::new("TYPE")
            .with_selector(selector.as_str())
            .with_value(value.as_str()),
        WebAction::Press { key } => Command::new("PRESS").with_value(key.as_str()),
        WebAction::Scroll { selector: Some(s) } => Command::new("SCROLL").with_selector(s.as_str()),
        WebAction::Scroll { selector: None } => Command::new("SCROLL"),
        WebAction::Extract { selector } => Command::new("READ").with_selector(selector.as_str()),
        WebAction::Wait { .. } | WebAction::Screenshot => return None,
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionExecutor;
    use crate::extension::executor::tests::FakeDocument;
    use crate::search::{MemoryStore, OfflineBackend};
    use crate::types::{BotStatus, PageData};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        tasks: Mutex<Vec<Task>>,
        fail_launch: bool,
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, task: Task) -> UalResult {
            let count = task.actions.len();
            self.tasks.lock().unwrap().push(task);
            if self.fail_launch {
                return UalResult::failure(
                    "Browser launch failed: no chrome",
                    vec!["Fatal: Browser launch failed: no chrome".into()],
                );
            }
            UalResult {
                success: true,
                steps: vec!["step".into(); count],
                data: Some(PageData {
                    title: "Example".into(),
                    url: "https://example.com/".into(),
                    text: String::new(),
                    bot_status: BotStatus::Clean,
                    extracted: Vec::new(),
                    failed_actions: 0,
                }),
                ..Default::default()
            }
        }
    }

    struct FixedPlanner(Vec<WebAction>);

    #[async_trait]
    impl GoalPlanner for FixedPlanner {
        async fn plan(&self, _request: &PlanRequest) -> Result<PlanResponse> {
            Ok(PlanResponse {
                actions: self.0.clone(),
                status: Some("continue".into()),
                ..Default::default()
            })
        }
    }

    fn search() -> Arc<SearchMachine> {
        Arc::new(SearchMachine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(OfflineBackend),
            None,
        ))
    }

    fn client(runner: Arc<RecordingRunner>, planner: Option<Arc<dyn GoalPlanner>>) -> UalClient {
        UalClient::new(runner, planner, search())
    }

    #[tokio::test]
    async fn test_execute_plans_with_rules_and_narrates() {
        let runner = Arc::new(RecordingRunner::default());
        let client = client(runner.clone(), None);
        let mut events = client.subscribe();

        let report = client
            .execute(Task::new("open github.com and then search for puppeteer"))
            .await;
        assert!(report.result.success);
        assert!(report.failure.is_none());

        let task = runner.tasks.lock().unwrap()[0].clone();
        assert_eq!(task.actions.len(), 2);
        assert_eq!(task.actions[0], WebAction::Navigate { url: "https://github.com".into() });

        let kinds: Vec<_> = report.agent_steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AgentStepKind::Planning,
                AgentStepKind::Executing,
                AgentStepKind::Observing,
                AgentStepKind::Completed
            ]
        );
        assert_eq!(events.recv().await.unwrap().kind, AgentStepKind::Planning);
    }

    #[tokio::test]
    async fn test_unplannable_goal_is_an_error() {
        let runner = Arc::new(RecordingRunner::default());
        let client = client(runner.clone(), None);

        let report = client.execute(Task::new("make me a sandwich")).await;
        assert!(!report.result.success);
        assert_eq!(report.failure, Some(FailureKind::Planning));
        assert!(report.result.error.unwrap().starts_with("Could not create a plan"));
        assert!(!report.result.steps.is_empty());
        assert!(runner.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_goal_planner_used_when_rules_find_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let planner = Arc::new(FixedPlanner(vec![WebAction::Click { selector: "#buy".into() }]));
        let client = client(runner.clone(), Some(planner));

        let report = client.execute(Task::new("buy the cheapest one")).await;
        assert!(report.result.success);
        assert_eq!(
            runner.tasks.lock().unwrap()[0].actions,
            vec![WebAction::Click { selector: "#buy".into() }]
        );
    }

    #[tokio::test]
    async fn test_url_only_task_runs_without_plan() {
        let runner = Arc::new(RecordingRunner::default());
        let client = client(runner.clone(), None);
        let report = client
            .execute(Task::new("look around").with_url("https://example.com"))
            .await;
        assert!(report.result.success);
        assert!(runner.tasks.lock().unwrap()[0].actions.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_launch_is_reported() {
        let runner = Arc::new(RecordingRunner {
            fail_launch: true,
            ..Default::default()
        });
        let client = client(runner, None);
        let report = client
            .execute(Task::new("x").with_actions(vec![WebAction::Screenshot]))
            .await;
        assert_eq!(report.failure, Some(FailureKind::Fatal));
        assert_eq!(report.agent_steps.last().unwrap().kind, AgentStepKind::Failed);
    }

    #[tokio::test]
    async fn test_run_action_and_listing() {
        let runner = Arc::new(RecordingRunner::default());
        let client = client(runner.clone(), None);

        let names: Vec<_> = client.list_actions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["click", "navigate", "typeText", "webSearch"]);

        let mut args = ActionArgs::new();
        args.insert("url".into(), Value::String("docs.rs".into()));
        let value = client.run_action("navigate", &args).await.unwrap();
        assert_eq!(value["success"], true);

        let err = client.run_action("fly", &ActionArgs::new()).await.unwrap_err();
        assert!(matches!(err, UalError::ActionNotFound(_)));
    }

    #[tokio::test]
    async fn test_plan_request_falls_back_to_rules() {
        let client = client(Arc::new(RecordingRunner::default()), None);
        let response = client
            .plan_request(&PlanRequest::new("go to example.com"))
            .await
            .unwrap();
        assert_eq!(response.actions, vec![WebAction::Navigate { url: "https://example.com".into() }]);
        assert!(client.plan_request(&PlanRequest::new("hmm")).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_via_extension_soft_fails() {
        let client = client(Arc::new(RecordingRunner::default()), None);
        let (handle, _worker) =
            ExtensionHandle::spawn(ExtensionExecutor::new(FakeDocument::with_elements(&["#q"])));

        let run = client
            .execute_via_extension(
                &handle,
                &[
                    WebAction::Type { selector: "#q".into(), value: "rust".into() },
                    WebAction::Click { selector: "#missing".into() },
                    WebAction::Wait { timeout: 1 },
                    WebAction::Screenshot,
                    WebAction::Press { key: "Enter".into() },
                ],
            )
            .await;

        assert_eq!(run.responses.len(), 5);
        assert_eq!(run.failed_actions, 2);
        assert!(run.steps.iter().any(|s| s.contains("Failed: click #missing - Element not found: #missing")));
        assert!(run.steps.len() >= 5);
    }

    #[tokio::test]
    async fn test_extension_wait_is_capped() {
        let client = client(Arc::new(RecordingRunner::default()), None)
            .with_max_wait(Duration::from_millis(5));
        let (handle, _worker) = ExtensionHandle::spawn(ExtensionExecutor::new(FakeDocument::default()));

        let run = tokio::time::timeout(
            Duration::from_secs(5),
            client.execute_via_extension(&handle, &[WebAction::Wait { timeout: u64::MAX }]),
        )
        .await
        .unwrap();

        assert_eq!(run.failed_actions, 0);
        assert!(run.steps.iter().any(|s| s == "Wait capped at 5ms"));
    }

    #[test]
    fn test_extension_command_mapping() {
        let cmd = extension_command(&WebAction::Extract { selector: "main".into() }).unwrap();
        assert_eq!(cmd.action, "READ");
        assert_eq!(cmd.selector.as_deref(), Some("main"));
        assert!(extension_command(&WebAction::Wait { timeout: 5 }).is_none());
    }
}
