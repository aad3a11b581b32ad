use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tasktree::config::Config;
use tasktree::core::{
    ExecutionTreeStore, LocalTreeStore, StepStatus, TaskPlan, TaskStatus, TaskStep,
};
use tasktree::orchestration::{
    ChannelEventBus, EngineContext, ExecutionResult, MemoryCheckpointService, MemoryInbox,
    Scheduler, StepError, StepExecutor, TaskEvent,
};
use tasktree::state::{FileTaskStore, MemoryTaskStore, TaskRepository};
use tasktree::workflow::{TaskStateMachine, TaskTreeAdapter};
use tasktree::{tlog, Result};

/// tasktree - run multi-step task plans as a dependency tree
#[derive(Parser, Debug)]
#[command(name = "tasktree")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TASKTREE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.tasktree/tasktree.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a plan and print its execution order
    Validate {
        /// Plan file (.toml or .json)
        plan: PathBuf,
    },

    /// Execute a plan with the built-in echo executor
    Run {
        /// Plan file (.toml or .json)
        plan: PathBuf,

        /// Maximum steps in flight at once
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Approve every checkpoint as soon as it is reached
        #[arg(long)]
        approve_checkpoints: bool,

        /// Persist tasks and trees under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Pick up a persisted task after a restart and run it to the end
    Resume {
        /// Task id printed by `run`
        task_id: String,

        /// Directory the task was persisted under
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Approve every checkpoint as soon as it is reached
        #[arg(long)]
        approve_checkpoints: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tasktree::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Validate { plan } => run_validate(&plan),
        Command::Run {
            plan,
            max_concurrent,
            approve_checkpoints,
            data_dir,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_plan(&plan, max_concurrent, approve_checkpoints, data_dir))
        }
        Command::Resume {
            task_id,
            data_dir,
            approve_checkpoints,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_resume(&task_id, data_dir, approve_checkpoints))
        }
    }
}

fn load_plan(path: &Path) -> Result<TaskPlan> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(toml::from_str(&content)?)
    }
}

fn run_validate(path: &Path) -> Result<()> {
    let plan = load_plan(path)?;
    match TaskTreeAdapter::validate_steps(&plan.steps) {
        Ok(order) => {
            println!("Plan OK: {} ({} steps)", plan.goal, order.len());
            for (i, step_id) in order.iter().enumerate() {
                let deps = plan
                    .steps
                    .iter()
                    .find(|s| &s.id == step_id)
                    .map(|s| s.dependencies.join(", "))
                    .unwrap_or_default();
                if deps.is_empty() {
                    println!("  {:>2}. {}", i + 1, step_id);
                } else {
                    println!("  {:>2}. {}  (after {})", i + 1, step_id, deps);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Invalid plan: {}", e);
            std::process::exit(1);
        }
    }
}

/// Echoes a step's inputs back as its outputs. A `fail` input fails the
/// step with that message.
struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, step: &TaskStep, _cancel: CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        if let Some(fail) = step.inputs.get("fail") {
            let message = fail
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| fail.to_string());
            return ExecutionResult::failure(
                StepError::new(message),
                started.elapsed().as_millis() as u64,
            );
        }
        ExecutionResult::success(step.inputs.clone(), started.elapsed().as_millis() as u64)
    }
}

/// A scheduler over the configured stores, with its event stream.
struct Engine {
    scheduler: Arc<Scheduler>,
    events: mpsc::Receiver<TaskEvent>,
    checkpoints: Arc<MemoryCheckpointService>,
}

async fn open_engine(config: Config, data_dir: Option<PathBuf>) -> Result<Engine> {
    let data_dir = data_dir.or_else(|| config.data_path());
    let (trees, repo): (Arc<dyn ExecutionTreeStore>, TaskRepository) = match &data_dir {
        Some(dir) => {
            let trees = LocalTreeStore::open(&dir.join("trees")).await?;
            let tasks = FileTaskStore::open(&dir.join("tasks")).await?;
            (
                Arc::new(trees),
                TaskRepository::new(Arc::new(tasks)).with_cache(Arc::new(MemoryTaskStore::new())),
            )
        }
        None => (
            Arc::new(LocalTreeStore::new()),
            TaskRepository::new(Arc::new(MemoryTaskStore::new())),
        ),
    };

    let (bus, events) = ChannelEventBus::new(config.event_buffer);
    let checkpoints = Arc::new(MemoryCheckpointService::new());
    let scheduler = Scheduler::new(EngineContext {
        adapter: TaskTreeAdapter::new(trees),
        state_machine: Arc::new(TaskStateMachine::new(repo)),
        executor: Arc::new(EchoExecutor),
        events: Arc::new(bus),
        inbox: Arc::new(MemoryInbox::new()),
        checkpoints: checkpoints.clone(),
        config: Arc::new(config),
    });
    Ok(Engine {
        scheduler,
        events,
        checkpoints,
    })
}

async fn run_plan(
    path: &Path,
    max_concurrent: Option<usize>,
    approve_checkpoints: bool,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let plan = load_plan(path)?;
    let mut config = Config::load()?;
    if let Some(n) = max_concurrent {
        config.max_concurrent_steps = n;
    }
    let mut engine = open_engine(config, data_dir).await?;

    let task = engine.scheduler.submit_task(plan.into_task()).await?;
    println!("Task {}: {} ({} steps)", task.id, task.goal, task.steps.len());
    tlog!("CLI running task {}", task.id);
    engine.scheduler.start_task(&task.id).await?;

    drive(&mut engine, &task.id, approve_checkpoints).await
}

async fn run_resume(
    task_id: &str,
    data_dir: Option<PathBuf>,
    approve_checkpoints: bool,
) -> Result<()> {
    let mut engine = open_engine(Config::load()?, data_dir).await?;
    let scheduler = Arc::clone(&engine.scheduler);

    let task = scheduler.context().load_task(task_id).await?;
    println!("Task {}: {} ({})", task.id, task.goal, task.status);
    tlog!("CLI resuming task {} from {}", task.id, task.status);

    scheduler.recover_task(task_id).await?;
    match task.status {
        TaskStatus::Paused => {
            scheduler.resume_task(task_id).await?;
        }
        TaskStatus::Ready => {
            scheduler.start_task(task_id).await?;
        }
        _ => {}
    }
    // Approvals do not survive a restart, so parked steps ask again.
    let current = scheduler.context().load_task(task_id).await?;
    if matches!(current.status, TaskStatus::Checkpoint | TaskStatus::Executing) {
        for step in current.steps.iter().filter(|s| s.status == StepStatus::Checkpoint) {
            scheduler.resume_checkpoint(task_id, &step.id).await?;
        }
    }

    drive(&mut engine, task_id, approve_checkpoints).await
}

/// Print events until the task has nothing left in flight, then report.
async fn drive(engine: &mut Engine, task_id: &str, approve_checkpoints: bool) -> Result<()> {
    let scheduler = Arc::clone(&engine.scheduler);
    loop {
        tokio::select! {
            Some(event) = engine.events.recv() => print_event(&event),
            _ = scheduler.wait_idle(task_id) => {
                while let Ok(event) = engine.events.try_recv() {
                    print_event(&event);
                }
                if !approve_checkpoints {
                    break;
                }
                let pending: Vec<_> = engine
                    .checkpoints
                    .pending()
                    .into_iter()
                    .filter(|c| c.task_id == task_id)
                    .collect();
                if pending.is_empty() {
                    break;
                }
                for checkpoint in pending {
                    engine.checkpoints.approve(task_id, &checkpoint.step_id)?;
                    println!("  approved   {}", checkpoint.step_id);
                    scheduler.resume_checkpoint(task_id, &checkpoint.step_id).await?;
                }
            }
        }
    }

    let task = scheduler.context().load_task(task_id).await?;
    println!();
    println!("Status: {}", task.status);
    for step in &task.steps {
        match &step.error_message {
            Some(error) => println!("  {:<20} {:<10} {}", step.id, step.status, error),
            None => println!("  {:<20} {}", step.id, step.status),
        }
    }

    if matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &TaskEvent) {
    match event {
        TaskEvent::StepStarted {
            step_id,
            agent_type,
            ..
        } => println!("  started    {} ({})", step_id, agent_type),
        TaskEvent::StepCompleted {
            step_id,
            execution_time_ms,
            ..
        } => println!("  completed  {} in {}ms", step_id, execution_time_ms),
        TaskEvent::StepFailed {
            step_id,
            error,
            retry_count,
            ..
        } => println!("  failed     {} after {} retries: {}", step_id, retry_count, error),
        TaskEvent::CheckpointCreated {
            step_id, message, ..
        } => println!(
            "  checkpoint {}: {}",
            step_id,
            message.as_deref().unwrap_or("awaiting approval")
        ),
        TaskEvent::TaskCompleted { status, .. } => println!("  task       {}", status),
    }
}
