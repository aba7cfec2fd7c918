use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use runwatch::backend::history::fetch_history;
use runwatch::backend::{Backend, HttpBackend, MessageMode, WsTransport};
use runwatch::channel::{ChannelState, RunChannel};
use runwatch::config::RunwatchConfig;
use runwatch::coordinator::{MultiRunCoordinator, RunSlot};
use runwatch::execution::{ExecutionId, ExecutionKind, ExecutionRef};
use runwatch::timeline::{EventKind, TimelineEvent};

#[derive(Parser)]
#[command(
    name = "runwatch",
    about = "Live timelines for browser test runs and model runs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a runwatch.toml (overrides RUNWATCH_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow one execution's timeline until it finishes
    Watch {
        /// Execution id
        id: String,

        /// Kind of execution
        #[arg(long, value_enum, default_value = "test-run")]
        kind: ExecutionKind,

        /// One JSON event per line
        #[arg(long)]
        json: bool,
    },

    /// Load several executions side by side and summarize them
    Compare {
        /// Execution ids
        #[arg(required = true)]
        ids: Vec<String>,

        /// Kind of the executions
        #[arg(long, value_enum, default_value = "test-run")]
        kind: ExecutionKind,
    },

    /// Send a chat message to a model run
    Send {
        /// Model run id
        id: String,

        /// Message text
        text: String,

        /// How the model should handle the message
        #[arg(long, value_enum, default_value = "plan")]
        mode: MessageMode,
    },

    /// Approve the model run's current plan
    Approve {
        /// Model run id
        id: String,
    },

    /// Reject the model run's current plan
    Reject {
        /// Model run id
        id: String,

        /// Why the plan was rejected
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RunwatchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    let backend: Arc<dyn Backend> = Arc::new(
        HttpBackend::new(&config.backend.base_url, config.backend.token.clone(), config.request_timeout())
            .context("invalid backend configuration")?,
    );

    match cli.command {
        Commands::Watch { id, kind, json } => {
            let exec = ExecutionRef {
                kind,
                id: ExecutionId::new(id),
            };
            watch(&config, backend, exec, json).await?;
        }
        Commands::Compare { ids, kind } => {
            let execs: Vec<ExecutionRef> = ids
                .into_iter()
                .map(|id| ExecutionRef {
                    kind,
                    id: ExecutionId::new(id),
                })
                .collect();
            let coordinator = MultiRunCoordinator::new(backend);
            coordinator.load_all(&execs).await;
            print_summary(coordinator.view().iter());
        }
        Commands::Send { id, text, mode } => {
            let (coordinator, exec) = load_model_run(backend, id).await?;
            coordinator.send_message(&exec.id, &text, mode).await?;
            print_timeline(&coordinator, &exec.id);
        }
        Commands::Approve { id } => {
            let (coordinator, exec) = load_model_run(backend, id).await?;
            coordinator.approve_plan(&exec.id).await?;
            println!("Plan for {} approved.", exec.id);
        }
        Commands::Reject { id, reason } => {
            let (coordinator, exec) = load_model_run(backend, id).await?;
            coordinator.reject_plan(&exec.id, reason.as_deref()).await?;
            println!("Plan for {} rejected.", exec.id);
        }
    }

    Ok(())
}

fn init_tracing(config: &RunwatchConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn watch(config: &RunwatchConfig, backend: Arc<dyn Backend>, exec: ExecutionRef, json: bool) -> Result<()> {
    let push = Arc::new(WsTransport::new(
        &config.ws_url()?,
        config.backend.token.clone(),
        config.connect_timeout(),
    )?);

    // History is printed up front, so finished executions still show something.
    let history = fetch_history(backend.as_ref(), &exec)
        .await
        .with_context(|| format!("failed to load {exec}"))?;
    let status = history.meta.status;
    tracing::info!(execution = %exec, %status, "watching execution");

    let channel = RunChannel::spawn(exec.clone(), status, backend, push, config.channel_config());
    let mut snapshots = channel.subscribe();
    let mut printed: HashMap<String, EventKind> = HashMap::new();

    for event in history.into_events(&exec) {
        emit(&event, json)?;
        printed.insert(event.id, event.kind);
    }

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        for event in snapshot.timeline.iter() {
            if printed.get(&event.id) != Some(&event.kind) {
                emit(event, json)?;
                printed.insert(event.id.clone(), event.kind.clone());
            }
        }
        if snapshot.state == ChannelState::Closed {
            if !json {
                println!("{exec} finished: {}", snapshot.status);
            }
            break;
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(execution = %exec, "interrupted");
                break;
            }
        }
    }

    channel.close().await;
    Ok(())
}

async fn load_model_run(backend: Arc<dyn Backend>, id: String) -> Result<(MultiRunCoordinator, ExecutionRef)> {
    let exec = ExecutionRef::model_run(id);
    let coordinator = MultiRunCoordinator::new(backend);
    coordinator.load_all(std::slice::from_ref(&exec)).await;
    if let Some(error) = coordinator.slot(&exec.id).and_then(|s| s.load_error.clone()) {
        anyhow::bail!("failed to load {exec}: {error}");
    }
    Ok((coordinator, exec))
}

fn emit(event: &TimelineEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{}", describe(event));
    }
    Ok(())
}

fn describe(event: &TimelineEvent) -> String {
    let at = event.timestamp.format("%H:%M:%S");
    match &event.kind {
        EventKind::User(m) => format!("{at} user    | {}", m.text),
        EventKind::System(m) => format!("{at} system  | {}", m.text),
        EventKind::Step(s) => {
            let status = serde_json::to_value(s.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            let mut line = format!("{at} step {:<3}| {:<8} {}", s.step_index, status, s.action);
            if let Some(target) = &s.target {
                line.push(' ');
                line.push_str(target);
            }
            if let Some(error) = &s.error {
                line.push_str(" -- ");
                line.push_str(error);
            }
            line
        }
        EventKind::Plan(p) => format!(
            "{at} plan    | {} ({:?}, {} steps){}",
            p.plan_id,
            p.status,
            p.steps.len(),
            p.summary.as_deref().map(|s| format!(": {s}")).unwrap_or_default()
        ),
        EventKind::Error(e) => format!("{at} error   | {}", e.message),
        EventKind::NetworkRequest(n) => format!(
            "{at} net     | {} {} {}",
            n.method,
            n.status.map(|s| s.to_string()).unwrap_or_else(|| "---".to_string()),
            n.url
        ),
        EventKind::ConsoleLog(c) => format!("{at} console | [{}] {}", c.level, c.text),
    }
}

fn print_timeline(coordinator: &MultiRunCoordinator, id: &ExecutionId) {
    if let Some(slot) = coordinator.slot(id) {
        for event in slot.events().iter() {
            println!("{}", describe(event));
        }
    }
}

fn print_summary<'a>(slots: impl Iterator<Item = &'a Arc<RunSlot>>) {
    println!(
        "{:<24} | {:<10} | {:>5} | {:>6} | {:>6} | {:>6} | Error",
        "Execution", "Status", "Steps", "Passed", "Failed", "Healed"
    );
    println!("{:-<24}-|-{:-<10}-|-{:-<5}-|-{:-<6}-|-{:-<6}-|-{:-<6}-|-{:-<20}", "", "", "", "", "", "", "");
    for slot in slots {
        let counters = slot.meta.as_ref().map(|m| m.counters).unwrap_or_default();
        println!(
            "{:<24} | {:<10} | {:>5} | {:>6} | {:>6} | {:>6} | {}",
            slot.execution.id,
            slot.status().to_string(),
            slot.steps().len(),
            counters.passed,
            counters.failed,
            counters.healed,
            slot.load_error.as_deref().unwrap_or("")
        );
    }
}
