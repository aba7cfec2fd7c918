//! Fetch orchestration shared by the live channel and the coordinator, so both
//! merge server state through the same path.

use chrono::Utc;

use super::{Backend, BackendError, Logged};
use crate::execution::{ExecutionKind, ExecutionMeta, ExecutionRef};
use crate::timeline::{ConsoleEntry, EventKind, NetworkEntry, PlanRecord, StepRecord, TimelineEvent};

/// What a poll tick needs: current detail and step list.
#[derive(Debug, Clone)]
pub struct Progress {
    pub meta: ExecutionMeta,
    pub steps: Vec<StepRecord>,
}

pub async fn fetch_progress(backend: &dyn Backend, exec: &ExecutionRef) -> Result<Progress, BackendError> {
    let (meta, steps) = tokio::try_join!(backend.fetch_execution(exec), backend.fetch_steps(exec))?;
    Ok(Progress { meta, steps })
}

/// Everything the backend holds for one execution.
#[derive(Debug, Clone)]
pub struct History {
    pub meta: ExecutionMeta,
    pub steps: Vec<StepRecord>,
    pub plan: Option<PlanRecord>,
    pub network: Vec<Logged<NetworkEntry>>,
    pub console: Vec<Logged<ConsoleEntry>>,
}

/// Detail and steps in parallel; then the plan, only for model runs whose
/// status says one may exist; network and console history only for test runs.
pub async fn fetch_history(backend: &dyn Backend, exec: &ExecutionRef) -> Result<History, BackendError> {
    let Progress { meta, steps } = fetch_progress(backend, exec).await?;

    let (plan, network, console) = match exec.kind {
        ExecutionKind::ModelRun => {
            let plan = if meta.status.may_have_plan() {
                backend.fetch_plan(exec).await?
            } else {
                None
            };
            (plan, Vec::new(), Vec::new())
        }
        ExecutionKind::TestRun => {
            let (network, console) =
                tokio::try_join!(backend.fetch_network(exec), backend.fetch_console(exec))?;
            (None, network, console)
        }
    };

    Ok(History {
        meta,
        steps,
        plan,
        network,
        console,
    })
}

impl Progress {
    pub fn step_events(&self, exec: &ExecutionRef) -> Vec<TimelineEvent> {
        self.steps
            .iter()
            .cloned()
            .map(|step| TimelineEvent::step(exec.id.clone(), step))
            .collect()
    }
}

impl History {
    /// Timeline events in display order: plan, steps, then captured traffic
    /// and console output.
    pub fn into_events(self, exec: &ExecutionRef) -> Vec<TimelineEvent> {
        let id = &exec.id;
        let mut events = Vec::with_capacity(
            self.steps.len() + self.network.len() + self.console.len() + 1,
        );
        if let Some(plan) = self.plan {
            events.push(TimelineEvent::plan(id.clone(), plan));
        }
        events.extend(self.steps.into_iter().map(|s| TimelineEvent::step(id.clone(), s)));
        events.extend(self.network.into_iter().map(|n| TimelineEvent {
            id: n.id,
            execution_id: id.clone(),
            timestamp: n.timestamp.unwrap_or_else(Utc::now),
            kind: EventKind::NetworkRequest(n.entry),
        }));
        events.extend(self.console.into_iter().map(|c| TimelineEvent {
            id: c.id,
            execution_id: id.clone(),
            timestamp: c.timestamp.unwrap_or_else(Utc::now),
            kind: EventKind::ConsoleLog(c.entry),
        }));
        events
    }
}
