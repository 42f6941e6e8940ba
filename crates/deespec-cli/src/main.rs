mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use deespec_core::lock::LockManager;
use deespec_core::pool::{AgentExecutor, StepResult};
use deespec_core::task::TaskStateMachine;
use deespec_core::WorkflowManager;
use deespec_store::models::{ExecutionState, Step, Task, TaskId, TaskKind, TaskMetadata, TaskStatus};
use deespec_store::repo::sqlite;
use deespec_store::repo::sqlite::{SqliteLockRepository, SqliteNotesRepository, SqliteTaskRepository};
use deespec_store::TaskRepository;
use tokio_util::sync::CancellationToken;

use config::ResolvedConfig;

#[derive(Parser)]
#[command(name = "deespec", about = "Local multi-agent task orchestrator", version)]
struct Cli {
    #[arg(long, global = true)]
    run_root: Option<PathBuf>,

    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow manager loop until interrupted.
    Run,
    /// Task bookkeeping.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Print the resolved configuration and exit.
    Config,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Register a new SBI task.
    Add {
        id: String,
        title: String,
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// List every known task and its status.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("DEESPEC_STDERR_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let resolved = ResolvedConfig::resolve(cli.max_concurrency, cli.run_root)?;

    match cli.command {
        Commands::Run => cmd_run(&resolved).await,
        Commands::Task { command } => cmd_task(&resolved, command).await,
        Commands::Config => {
            println!("{resolved:#?}");
            Ok(())
        }
    }
}

async fn db_path(resolved: &ResolvedConfig) -> PathBuf {
    resolved.run_root.join("var").join("deespec.sqlite3")
}

async fn cmd_run(resolved: &ResolvedConfig) -> Result<()> {
    let pool = sqlite::open(&db_path(resolved).await).await?;
    let task_repo: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let notes_repo = Arc::new(SqliteNotesRepository::new(pool.clone()));
    let lock_repo = Arc::new(SqliteLockRepository::new(pool));
    let locks = Arc::new(LockManager::new(lock_repo));

    let run_guard = locks.acquire_run_lock().await?;
    let cancel = CancellationToken::new();
    let sweeper = locks.spawn_sweeper(cancel.clone());

    let manager = WorkflowManager::with_agent_limits(
        task_repo,
        notes_repo,
        locks,
        Arc::new(UnimplementedExecutor),
        resolved.max_concurrency,
        resolved.agent_limits.clone(),
        resolved.run_root.clone(),
    );

    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        run_cancel.cancel();
    });

    manager.run(cancel.clone()).await?;

    cancel.cancel();
    let _ = sweeper.await;
    run_guard.release().await?;
    Ok(())
}

async fn cmd_task(resolved: &ResolvedConfig, command: TaskCommands) -> Result<()> {
    let pool = sqlite::open(&db_path(resolved).await).await?;
    let task_repo: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool));
    let sm = TaskStateMachine::new(task_repo.clone());

    match command {
        TaskCommands::Add { id, title, depends_on } => {
            let task = Task {
                id: TaskId::from(id.as_str()),
                kind: TaskKind::Sbi,
                parent_id: None,
                title,
                description: String::new(),
                labels: Default::default(),
                assigned_agent: None,
                status: TaskStatus::Pending,
                step: Step::Pick,
                execution: Some(ExecutionState::default()),
                metadata: TaskMetadata {
                    dependencies: depends_on.into_iter().map(TaskId::from).collect(),
                    ..TaskMetadata::default()
                },
            };
            task_repo.create(task).await?;
            println!("registered task {id}");
            Ok(())
        }
        TaskCommands::List => {
            let tasks = sm.list_all().await?;
            for task in tasks {
                println!("{:<20} {:<10} {}", task.id.to_string(), task.status.to_string(), task.title);
            }
            Ok(())
        }
    }
}

/// Placeholder agent backend. Wiring an actual coding-agent subprocess or
/// API client behind [`AgentExecutor`] is the integration point left to the
/// operator's chosen backend; this default makes `deespec run` refuse to
/// silently do nothing.
struct UnimplementedExecutor;

#[async_trait]
impl AgentExecutor for UnimplementedExecutor {
    async fn execute(&self, task: &Task) -> StepResult {
        StepResult::Errored {
            message: format!(
                "no agent backend configured; cannot execute task {}",
                task.id
            ),
        }
    }
}

