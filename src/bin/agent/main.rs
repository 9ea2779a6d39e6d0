use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ual::brain::{AskAi, ChatCompletionsClient};
use ual::config::{BackendKind, Config, StoreKind};
use ual::engine::ExecutionEngine;
use ual::extension::{ExtensionExecutor, ExtensionHandle, TabDocument};
use ual::face::{self, AppState};
use ual::hands::{
    AttachBackend, BrowserLauncher, DEBUGGER_LOOKUP_TIMEOUT, LaunchBackend, resolve_debugger_url,
};
use ual::planner::{GoalPlanner, LlmGoalPlanner, RemoteGoalPlanner};
use ual::search::{
    JsonFileStore, MemoryStore, OfflineBackend, SearchBackend, SearchMachine, SearchStore,
    SearxBackend,
};
use ual::UalClient;

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::parse();
    init_tracing(config.log_json);

    info!(component = "agent", "starting Universal Action Layer agent");

    let needs_debugger = config.backend == BackendKind::Attach || config.extension_tab;
    let debugger_url = if needs_debugger {
        Some(resolve_debugger_url(&config.attach_url, DEBUGGER_LOOKUP_TIMEOUT).await?)
    } else {
        None
    };

    let launcher: Arc<dyn BrowserLauncher> = match (config.backend, &debugger_url) {
        (BackendKind::Attach, Some(url)) => {
            info!(component = "hands", url = %url, "attach backend");
            Arc::new(AttachBackend::new(url.clone()))
        }
        _ => {
            let root = config.profiles_root();
            info!(component = "hands", profiles = %root.display(), "launch backend");
            Arc::new(LaunchBackend::new(config.chrome_path.clone(), config.headless, root))
        }
    };
    let engine_config = config.engine_config();
    let max_wait = engine_config.max_wait;
    let engine = Arc::new(ExecutionEngine::new(launcher, engine_config));

    let ai: Option<Arc<dyn AskAi>> = match &config.ai_api_key {
        Some(key) => Some(Arc::new(
            ChatCompletionsClient::with_base_url(key.clone(), config.ai_model.clone(), &config.ai_base_url)
                .with_timeout(config.ai_timeout()),
        ) as Arc<dyn AskAi>),
        None => {
            warn!(component = "brain", "OPENAI_API_KEY not set; goal planning and answer drafting use fallbacks");
            None
        }
    };

    let goal_planner: Option<Arc<dyn GoalPlanner>> = match (&config.planner_url, &ai) {
        (Some(url), _) => Some(Arc::new(
            RemoteGoalPlanner::new(url.clone()).with_timeout(config.ai_timeout()),
        ) as Arc<dyn GoalPlanner>),
        (None, Some(ai)) => Some(Arc::new(LlmGoalPlanner::new(ai.clone())) as Arc<dyn GoalPlanner>),
        (None, None) => None,
    };

    let store: Arc<dyn SearchStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => Arc::new(JsonFileStore::open(&config.store_path)?),
    };
    let backend: Arc<dyn SearchBackend> = match &config.search_url {
        Some(url) => Arc::new(SearxBackend::new(url.clone()).with_timeout(config.search_timeout())),
        None => {
            warn!(component = "search", "no search URL configured; answers will use placeholder results");
            Arc::new(OfflineBackend)
        }
    };
    let search = Arc::new(
        SearchMachine::new(store, backend, ai.clone()).with_max_clarifications(config.max_clarifications),
    );

    let mut client = UalClient::new(engine, goal_planner, search).with_max_wait(max_wait);

    if config.extension_tab
        && let Some(url) = debugger_url
    {
        let document = tokio::task::spawn_blocking(move || TabDocument::attach(&url)).await??;
        let (handle, _worker) = ExtensionHandle::spawn(ExtensionExecutor::new(document));
        client = client.with_extension(handle);
        info!(component = "agent", "extension routes bound to the attached tab");
    }

    face::serve(config.bind_addr()?, AppState::new(client)).await
}
