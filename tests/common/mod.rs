//! In-process stand-ins for the HTTP backend and the push channel.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{json, Map};
use tokio::sync::{watch, Notify};

use runwatch::backend::{Backend, BackendError, Logged, MessageMode, PushStream, PushTransport};
use runwatch::channel::ChannelSnapshot;
use runwatch::execution::{ExecutionId, ExecutionMeta, ExecutionRef, ExecutionStatus};
use runwatch::timeline::{ConsoleEntry, NetworkEntry, PlanRecord, PlanStatus, PlannedStep, StepRecord, StepStatus};

/// Fixed instants so the same step built twice compares equal.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_767_225_600 + secs, 0).unwrap()
}

pub fn step(index: u32, status: StepStatus) -> StepRecord {
    let at = i64::from(index) * 10;
    StepRecord {
        id: None,
        step_index: index,
        action: if index == 0 {
            "goto https://example.com".to_string()
        } else {
            "click".to_string()
        },
        target: Some(format!("#button-{index}")),
        status,
        duration_ms: Some(120),
        error: (status == StepStatus::Failed).then(|| "element not found".to_string()),
        screenshot_url: None,
        healing_attempts: Vec::new(),
        started_at: Some(ts(at)),
        completed_at: Some(ts(at + 1)),
        extra: Map::new(),
    }
}

/// The same step as the server reports it when it keeps no timings.
pub fn untimed(mut step: StepRecord) -> StepRecord {
    step.started_at = None;
    step.completed_at = None;
    step
}

pub fn plan(plan_id: &str, status: PlanStatus) -> PlanRecord {
    PlanRecord {
        plan_id: plan_id.to_string(),
        status,
        summary: Some("Log in and check the dashboard".to_string()),
        steps: vec![
            PlannedStep {
                action: "goto /login".to_string(),
                description: None,
            },
            PlannedStep {
                action: "click #submit".to_string(),
                description: Some("submit the form".to_string()),
            },
        ],
        created_at: Some(ts(500)),
    }
}

pub fn step_frame(step: &StepRecord) -> String {
    json!({ "type": "run_step_completed", "data": { "step": step } }).to_string()
}

pub fn completed_frame(status: &str, passed: u32, failed: u32) -> String {
    json!({
        "type": "run_completed",
        "data": { "status": status, "total": passed + failed, "passed": passed, "failed": failed }
    })
    .to_string()
}

pub fn network_frame(url: &str) -> String {
    json!({
        "type": "live_network",
        "data": { "url": url, "status": 200, "timestamp": "2026-01-01T00:00:30Z" }
    })
    .to_string()
}

pub fn step_indices(snapshot: &ChannelSnapshot) -> Vec<u32> {
    snapshot.timeline.steps().map(|s| s.step_index).collect()
}

/// Wait until a published snapshot satisfies `pred`.
pub async fn wait_for(
    rx: &mut watch::Receiver<ChannelSnapshot>,
    pred: impl FnMut(&ChannelSnapshot) -> bool,
) -> ChannelSnapshot {
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(pred))
        .await
        .expect("timed out waiting for channel snapshot")
        .expect("channel task dropped its sender")
        .clone()
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockRun {
    pub meta: ExecutionMeta,
    pub steps: Vec<StepRecord>,
    pub plan: Option<PlanRecord>,
    pub network: Vec<Logged<NetworkEntry>>,
    pub console: Vec<Logged<ConsoleEntry>>,
}

impl MockRun {
    pub fn new(id: &str, status: ExecutionStatus) -> Self {
        Self {
            meta: ExecutionMeta::new(ExecutionId::new(id), status),
            steps: Vec::new(),
            plan: None,
            network: Vec::new(),
            console: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<StepRecord>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_plan(mut self, plan: PlanRecord) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_network(mut self, id: &str, url: &str) -> Self {
        self.network.push(Logged {
            id: id.to_string(),
            timestamp: Some(ts(5)),
            entry: NetworkEntry {
                url: url.to_string(),
                method: "GET".to_string(),
                status: Some(200),
                resource_type: "document".to_string(),
                duration_ms: Some(40),
                step_index: Some(0),
            },
        });
        self
    }

    pub fn with_console(mut self, id: &str, text: &str) -> Self {
        self.console.push(Logged {
            id: id.to_string(),
            timestamp: Some(ts(6)),
            entry: ConsoleEntry {
                level: "warn".to_string(),
                text: text.to_string(),
                source_url: None,
                step_index: Some(0),
            },
        });
        self
    }
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, MockRun>,
    /// `(execution, op)`; op `"*"` fails every read.
    failing_loads: HashSet<(String, String)>,
    failing_actions: HashSet<String>,
    calls: Vec<(String, String)>,
    message_gate: Option<Arc<Notify>>,
}

/// Scriptable backend. Actions mutate the stored runs the way a real server
/// would, so a re-sync after an action observes the result.
#[derive(Default)]
pub struct MockBackend {
    inner: Mutex<Inner>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, run: MockRun) {
        let id = run.meta.id.to_string();
        self.inner.lock().unwrap().runs.insert(id, run);
    }

    pub fn set_steps(&self, id: &str, steps: Vec<StepRecord>) {
        self.with_run(id, |run| run.steps = steps);
    }

    pub fn set_status(&self, id: &str, status: ExecutionStatus) {
        self.with_run(id, |run| run.meta.status = status);
    }

    /// Append a console entry with no server timestamp.
    pub fn push_console(&self, id: &str, log_id: &str, text: &str) {
        self.with_run(id, |run| {
            run.console.push(Logged {
                id: log_id.to_string(),
                timestamp: None,
                entry: ConsoleEntry {
                    level: "log".to_string(),
                    text: text.to_string(),
                    source_url: None,
                    step_index: None,
                },
            })
        });
    }

    pub fn run(&self, id: &str) -> MockRun {
        self.inner.lock().unwrap().runs[id].clone()
    }

    /// Every history fetch for `id` fails.
    pub fn fail_loads(&self, id: &str) {
        self.fail_read(id, "*");
    }

    /// Only the step history fetch for `id` fails.
    pub fn fail_steps(&self, id: &str) {
        self.fail_read(id, "steps");
    }

    fn fail_read(&self, id: &str, op: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_loads
            .insert((id.to_string(), op.to_string()));
    }

    /// Every user action on `id` fails.
    pub fn fail_actions(&self, id: &str) {
        self.inner.lock().unwrap().failing_actions.insert(id.to_string());
    }

    /// `send_message` blocks until the returned handle is notified.
    pub fn hold_messages(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner.lock().unwrap().message_gate = Some(gate.clone());
        gate
    }

    /// Number of calls to `op` (e.g. `"steps"`) across all executions.
    pub fn calls(&self, op: &str) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|(o, _)| o == op).count()
    }

    pub fn total_calls(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    fn with_run(&self, id: &str, f: impl FnOnce(&mut MockRun)) {
        let mut inner = self.inner.lock().unwrap();
        f(inner.runs.get_mut(id).expect("unknown mock run"));
    }

    fn read<T>(&self, op: &str, exec: &ExecutionRef, f: impl FnOnce(&MockRun) -> T) -> Result<T, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let id = exec.id.to_string();
        inner.calls.push((op.to_string(), id.clone()));
        let failing = inner.failing_loads.contains(&(id.clone(), "*".to_string()))
            || inner.failing_loads.contains(&(id.clone(), op.to_string()));
        if failing {
            return Err(server_error(exec, op, 500));
        }
        match inner.runs.get(&id) {
            Some(run) => Ok(f(run)),
            None => Err(server_error(exec, op, 404)),
        }
    }

    fn act(&self, op: &str, exec: &ExecutionRef, f: impl FnOnce(&mut MockRun)) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let id = exec.id.to_string();
        inner.calls.push((op.to_string(), id.clone()));
        if inner.failing_actions.contains(&id) {
            return Err(server_error(exec, op, 503));
        }
        match inner.runs.get_mut(&id) {
            Some(run) => {
                f(run);
                Ok(())
            }
            None => Err(server_error(exec, op, 404)),
        }
    }
}

fn server_error(exec: &ExecutionRef, op: &str, status: u16) -> BackendError {
    BackendError::Status {
        url: format!("mock://{}/{}/{op}", exec.kind.resource(), exec.id),
        status,
        body: "mock failure".to_string(),
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn fetch_execution(&self, exec: &ExecutionRef) -> Result<ExecutionMeta, BackendError> {
        self.read("execution", exec, |run| run.meta.clone())
    }

    async fn fetch_steps(&self, exec: &ExecutionRef) -> Result<Vec<StepRecord>, BackendError> {
        self.read("steps", exec, |run| run.steps.clone())
    }

    async fn fetch_network(&self, exec: &ExecutionRef) -> Result<Vec<Logged<NetworkEntry>>, BackendError> {
        self.read("network", exec, |run| run.network.clone())
    }

    async fn fetch_console(&self, exec: &ExecutionRef) -> Result<Vec<Logged<ConsoleEntry>>, BackendError> {
        self.read("console", exec, |run| run.console.clone())
    }

    async fn fetch_plan(&self, exec: &ExecutionRef) -> Result<Option<PlanRecord>, BackendError> {
        self.read("plan", exec, |run| run.plan.clone())
    }

    async fn send_message(&self, exec: &ExecutionRef, _text: &str, mode: MessageMode) -> Result<(), BackendError> {
        let gate = self.inner.lock().unwrap().message_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.act("message", exec, |run| match mode {
            MessageMode::Plan => {
                run.plan = Some(plan("plan-1", PlanStatus::PendingApproval));
                run.meta.status = ExecutionStatus::PlanReady;
            }
            MessageMode::Execute => {
                let next = run.steps.len() as u32;
                run.steps.push(step(next, StepStatus::Passed));
                run.meta.status = ExecutionStatus::Running;
            }
        })
    }

    async fn approve_plan(&self, exec: &ExecutionRef, plan_id: &str) -> Result<(), BackendError> {
        self.act("approve", exec, |run| {
            if let Some(p) = run.plan.as_mut().filter(|p| p.plan_id == plan_id) {
                p.status = PlanStatus::Approved;
            }
            run.meta.status = ExecutionStatus::Approved;
        })
    }

    async fn reject_plan(&self, exec: &ExecutionRef, plan_id: &str, _reason: Option<&str>) -> Result<(), BackendError> {
        self.act("reject", exec, |run| {
            if let Some(p) = run.plan.as_mut().filter(|p| p.plan_id == plan_id) {
                p.status = PlanStatus::Rejected;
            }
            run.meta.status = ExecutionStatus::Rejected;
        })
    }

    async fn cancel(&self, exec: &ExecutionRef) -> Result<(), BackendError> {
        self.act("cancel", exec, |run| run.meta.status = ExecutionStatus::Cancelled)
    }

    async fn undo_to_step(&self, exec: &ExecutionRef, step_index: u32) -> Result<(), BackendError> {
        self.act("undo", exec, |run| run.steps.retain(|s| s.step_index <= step_index))
    }

    async fn replay_from_step(&self, exec: &ExecutionRef, step_index: u32) -> Result<(), BackendError> {
        self.act("replay", exec, |run| {
            for s in run.steps.iter_mut().filter(|s| s.step_index >= step_index) {
                s.status = StepStatus::Pending;
            }
            run.meta.status = ExecutionStatus::Running;
        })
    }
}

// ---------------------------------------------------------------------------
// Push transport
// ---------------------------------------------------------------------------

pub type Feed = mpsc::UnboundedSender<Result<String, BackendError>>;

/// Push transport fed from the test. Executions without a registered feed
/// refuse the connection.
#[derive(Default)]
pub struct MockPush {
    feeds: Mutex<HashMap<String, mpsc::UnboundedReceiver<Result<String, BackendError>>>>,
    subscribes: AtomicUsize,
}

impl MockPush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn feed(&self, id: &str) -> Feed {
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().insert(id.to_string(), rx);
        tx
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for MockPush {
    async fn subscribe(&self, exec: &ExecutionRef) -> Result<PushStream, BackendError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        match self.feeds.lock().unwrap().remove(exec.id.as_str()) {
            Some(rx) => Ok(rx.boxed()),
            None => Err(BackendError::Socket("connection refused".to_string())),
        }
    }
}
