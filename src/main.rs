//! Assignment Engine CLI
//!
//! Runs one assignment event through the engine and prints the task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assignment_engine::intake::engine_usernames;
use assignment_engine::{
    ActionCatalog, ActionPipeline, AssignmentEvent, CommandRunner, ContainerSandbox, Dispatcher,
    EngineConfig, GhPublisher, SandboxCommandRunner, SandboxKind, SandboxManager, SandboxProvider,
    TaskState, TaskStore, Validate, WorktreeSandbox, DEFAULT_CONFIG_PATH,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <event.json> [action...]", args[0]);
        eprintln!("\nRuns the assignment in <event.json> through the engine.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  ENGINE_SANDBOX=container|worktree  Select sandbox backend (default: from config)");
        eprintln!("  ENGINE_CONFIG=<path>               Config file (default: {})", DEFAULT_CONFIG_PATH);
        eprintln!("  XBOT_USERNAME=<login>              Extra account to answer assignments for");
        std::process::exit(1);
    }

    if let Err(e) = run(Path::new(&args[1]), &args[2..]).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(event_path: &Path, actions: &[String]) -> assignment_engine::Result<()> {
    let config_path = std::env::var("ENGINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = EngineConfig::load(&config_path)?;
    if let Ok(kind) = std::env::var("ENGINE_SANDBOX") {
        config.sandbox.provider = kind.parse()?;
    }
    for warning in config.validate().into_result()? {
        tracing::warn!(%warning, "config");
    }

    let event = AssignmentEvent::read(event_path)?;
    let usernames = engine_usernames(&config.intake.usernames);
    if !event.is_directed_at(&usernames) {
        let login = event.assignee.as_ref().map(|a| a.login.as_str()).unwrap_or("nobody");
        tracing::info!(assignee = %login, "assignment is not for this engine, ignoring");
        return Ok(());
    }

    let provider: Arc<dyn SandboxProvider> = match config.sandbox.provider {
        SandboxKind::Container => {
            tracing::info!(runtime = %config.sandbox.runtime, image = %config.sandbox.image, "using container sandbox");
            Arc::new(ContainerSandbox::new(config.container_settings()))
        }
        SandboxKind::Worktree => {
            tracing::info!("using worktree sandbox");
            let repo_path = std::env::current_dir()?;
            Arc::new(WorktreeSandbox::new(repo_path, config.sandbox.worktree_base.clone()))
        }
    };

    let sandboxes = Arc::new(SandboxManager::new(provider, config.sandbox_settings()));
    let runner: Arc<dyn CommandRunner> = Arc::new(SandboxCommandRunner::new(Arc::clone(&sandboxes)));
    let pipeline = ActionPipeline::new(
        Arc::new(ActionCatalog::with_defaults()),
        Arc::clone(&runner),
        config.step_timeout(),
    );
    let publisher = Arc::new(GhPublisher::new(runner, config.publisher_settings()));
    let dispatcher = Dispatcher::new(
        Arc::new(TaskStore::new()),
        sandboxes,
        pipeline,
        publisher,
        config.dispatcher_config(),
    )
    .with_status_ledger(config.status_ledger());

    let plan = if actions.is_empty() {
        config.pipeline.default_plan.clone()
    } else {
        actions.to_vec()
    };
    let id = dispatcher.enqueue(event.origin(), plan)?;
    dispatcher.run_until_idle().await;

    let task = dispatcher.get_task(&id)?;
    match serde_json::to_string_pretty(&task) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!(error = %e, "failed to render task"),
    }

    if task.state == TaskState::Failed {
        std::process::exit(1);
    }
    Ok(())
}
