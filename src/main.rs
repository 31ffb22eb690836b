use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tui_queue_lib::events::{
    OutputPayload, SessionUnhealthyPayload, TaskStatusChangedPayload, UsageLimitPayload,
    EVENT_OUTPUT_LOG, EVENT_SESSION_UNHEALTHY, EVENT_TASK_STATUS_CHANGED, EVENT_USAGE_LIMIT,
};
use tui_queue_lib::history::{JsonHistoryStore, TaskHistory};
use tui_queue_lib::shutdown::{register_signal_handlers, ShutdownState};
use tui_queue_lib::{
    ConfigManager, PermissionMode, Pilot, PilotCommand, PilotConfig, PilotContext, PilotEvent,
    TaskStatus,
};

/// tui-queue - feed a queue of tasks to an interactive coding agent
#[derive(Parser, Debug)]
#[command(name = "tui-queue")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.tui-queue/config.yaml)
    #[arg(long, global = true, env = "TUI_QUEUE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run tasks through the agent, one at a time
    Run {
        /// Task texts, processed in order after any restored ones
        tasks: Vec<String>,

        /// File with one task per line (blank lines and `#` comments skipped)
        #[arg(long)]
        tasks_file: Option<PathBuf>,

        /// default, accept_edits or skip_permissions
        #[arg(long)]
        permission_mode: Option<PermissionMode>,

        /// Agent command to launch instead of the configured one
        #[arg(long)]
        command: Option<String>,

        /// History file (defaults to ~/.tui-queue/history.json)
        #[arg(long)]
        history: Option<PathBuf>,

        /// Do not read or write task history
        #[arg(long)]
        no_history: bool,

        /// Keep running after the queue drains
        #[arg(long)]
        watch: bool,

        /// Print agent output as it arrives
        #[arg(long)]
        show_output: bool,
    },
    /// Write a config file with default values
    InitConfig,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::new(path),
        None => ConfigManager::default_location()
            .context("Could not determine home directory for the config file")?,
    };

    match cli.command {
        Command::InitConfig => {
            if manager.exists() {
                println!("Config already exists at {}", manager.path().display());
            } else {
                manager.initialize()?;
                println!("Config written to {}", manager.path().display());
            }
            Ok(())
        }
        Command::Run {
            tasks,
            tasks_file,
            permission_mode,
            command,
            history,
            no_history,
            watch,
            show_output,
        } => {
            let mut config = if manager.exists() {
                manager.read()?
            } else {
                PilotConfig::default()
            };
            if let Some(command) = command {
                config.session.command = command;
            }
            if let Some(mode) = permission_mode {
                config.queue.permission_mode = mode;
            }

            let mut texts = Vec::new();
            if let Some(ref path) = tasks_file {
                texts.extend(read_tasks_file(path)?);
            }
            texts.extend(tasks);

            let history: Option<Arc<dyn TaskHistory>> = if no_history {
                None
            } else {
                let store = match history {
                    Some(path) => JsonHistoryStore::new(path),
                    None => JsonHistoryStore::default_location()
                        .context("Could not determine home directory for the history file")?,
                };
                Some(Arc::new(store))
            };

            let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
            runtime.block_on(run(config, texts, history, watch, show_output))
        }
    }
}

fn read_tasks_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tasks file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

async fn run(
    config: PilotConfig,
    texts: Vec<String>,
    history: Option<Arc<dyn TaskHistory>>,
    watch: bool,
    show_output: bool,
) -> Result<()> {
    let shutdown = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let mode = config.queue.permission_mode;
    let context = PilotContext::new(config, history.clone())?;
    let pilot = Pilot::new(context);
    tokio::spawn(report_events(pilot.subscribe(), show_output));

    if let Some(ref history) = history {
        match pilot.restore(history.as_ref()) {
            Ok(count) if count > 0 => log::info!("Restored {} tasks from history", count),
            Ok(_) => {}
            Err(e) => log::warn!("Failed to restore history: {:#}", e),
        }
    }
    for text in &texts {
        pilot.execute(PilotCommand::Enqueue { text: text.clone() }).await?;
    }
    if pilot.orchestrator().is_drained() && !watch {
        println!("Nothing to do: the queue is empty");
        return Ok(());
    }

    pilot
        .execute(PilotCommand::StartSession {
            permission_mode: mode,
        })
        .await
        .context("Failed to start the agent session")?;
    pilot
        .execute(PilotCommand::StartQueue {
            permission_mode: mode,
        })
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let orchestrator = pilot.orchestrator();
                if !watch && orchestrator.is_drained() && !orchestrator.is_paused() {
                    break;
                }
            }
        }
    }

    let report = pilot.shutdown();
    if let Some(task_id) = report.interrupted_task {
        log::warn!("Task {} was interrupted and will be marked as such on the next run", task_id);
    }
    shutdown.mark_cleanup_complete();

    let tasks = pilot.orchestrator().snapshot();
    let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
    let failed = tasks.iter().filter(|t| t.status == TaskStatus::Error).count();
    let pending = tasks.iter().filter(|t| t.status == TaskStatus::Pending).count();
    println!("{} completed, {} failed, {} pending", completed, failed, pending);
    Ok(())
}

async fn report_events(
    mut rx: tokio::sync::broadcast::Receiver<PilotEvent>,
    show_output: bool,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event.event.as_str() {
            EVENT_TASK_STATUS_CHANGED => {
                if let Some(p) = event.payload_as::<TaskStatusChangedPayload>() {
                    match p.error {
                        Some(error) => println!("[{}] {} -> {}: {}", p.task_id, p.old_status, p.new_status, error),
                        None => println!("[{}] {} -> {}", p.task_id, p.old_status, p.new_status),
                    }
                }
            }
            EVENT_USAGE_LIMIT => {
                if let Some(p) = event.payload_as::<UsageLimitPayload>() {
                    println!(
                        "Usage limit hit on task {} ({}). Queue paused{}",
                        p.task_id,
                        p.matched_pattern,
                        p.reset_hint
                            .map(|hint| format!(", resets {}", hint))
                            .unwrap_or_default()
                    );
                }
            }
            EVENT_SESSION_UNHEALTHY => {
                if let Some(p) = event.payload_as::<SessionUnhealthyPayload>() {
                    println!("Session {} is unhealthy: {}", p.session_id, p.reason);
                }
            }
            EVENT_OUTPUT_LOG if show_output => {
                if let Some(p) = event.payload_as::<OutputPayload>() {
                    print!("{}", p.text);
                }
            }
            _ => {}
        }
    }
}
