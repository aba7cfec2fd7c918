//! Timeline domain events: one discrete, orderable record per entry in an
//! execution's history.

pub mod store;

pub use self::store::{Selection, TimelineSnapshot, TimelineStore, UpsertOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::ExecutionId;

/// One record in an execution's timeline.
///
/// `id` is the display key (stable for list rendering); deduplication uses
/// [`TimelineEvent::identity_key`], which for steps and plans is the natural key
/// rather than the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Kind-specific payload of a [`TimelineEvent`].
///
/// Chat-style executions produce `User`, `System`, `Step`, `Plan` and `Error`;
/// raw test runs produce `Step`, `NetworkRequest` and `ConsoleLog`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    User(ChatMessage),
    System(ChatMessage),
    Step(StepRecord),
    Plan(PlanRecord),
    Error(ErrorRecord),
    NetworkRequest(NetworkEntry),
    ConsoleLog(ConsoleEntry),
}

/// Deduplication key. Two events with the same key (within one execution)
/// are the same logical entry delivered twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Step(u32),
    Plan(String),
    Entry(String),
}

impl TimelineEvent {
    pub fn identity_key(&self) -> IdentityKey {
        match &self.kind {
            EventKind::Step(step) => IdentityKey::Step(step.step_index),
            EventKind::Plan(plan) => IdentityKey::Plan(plan.plan_id.clone()),
            EventKind::User(_)
            | EventKind::System(_)
            | EventKind::Error(_)
            | EventKind::NetworkRequest(_)
            | EventKind::ConsoleLog(_) => IdentityKey::Entry(self.id.clone()),
        }
    }

    pub fn as_step(&self) -> Option<&StepRecord> {
        match &self.kind {
            EventKind::Step(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_plan(&self) -> Option<&PlanRecord> {
        match &self.kind {
            EventKind::Plan(plan) => Some(plan),
            _ => None,
        }
    }

    /// Short label for logs and terminal rendering.
    pub fn label(&self) -> &'static str {
        match self.kind {
            EventKind::User(_) => "user",
            EventKind::System(_) => "system",
            EventKind::Step(_) => "step",
            EventKind::Plan(_) => "plan",
            EventKind::Error(_) => "error",
            EventKind::NetworkRequest(_) => "network",
            EventKind::ConsoleLog(_) => "console",
        }
    }

    /// Build a step event. Uses the server id when present, otherwise a
    /// key derived from the step index so repeated deliveries share an id.
    pub fn step(execution_id: ExecutionId, step: StepRecord) -> Self {
        let id = step
            .id
            .clone()
            .unwrap_or_else(|| format!("step-{}", step.step_index));
        let timestamp = step
            .completed_at
            .or(step.started_at)
            .unwrap_or_else(Utc::now);
        Self {
            id,
            execution_id,
            timestamp,
            kind: EventKind::Step(step),
        }
    }

    pub fn plan(execution_id: ExecutionId, plan: PlanRecord) -> Self {
        let timestamp = plan.created_at.unwrap_or_else(Utc::now);
        Self {
            id: format!("plan-{}", plan.plan_id),
            execution_id,
            timestamp,
            kind: EventKind::Plan(plan),
        }
    }

    pub fn user(execution_id: ExecutionId, text: impl Into<String>) -> Self {
        Self::local(execution_id, "user", EventKind::User(ChatMessage::new(text)))
    }

    pub fn system(execution_id: ExecutionId, text: impl Into<String>) -> Self {
        Self::local(execution_id, "system", EventKind::System(ChatMessage::new(text)))
    }

    pub fn error(execution_id: ExecutionId, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::local(
            execution_id,
            "error",
            EventKind::Error(ErrorRecord {
                message: message.into(),
                origin,
            }),
        )
    }

    fn local(execution_id: ExecutionId, prefix: &str, kind: EventKind) -> Self {
        Self {
            id: format!("{}-{}", prefix, uuid::Uuid::new_v4()),
            execution_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Healed,
    Skipped,
    #[serde(other)]
    Unknown,
}

/// A self-healing attempt made while executing a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    #[serde(default)]
    pub original_selector: Option<String>,
    #[serde(default)]
    pub healed_selector: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub success: bool,
}

/// One executed step. Fields the backend sends that are not modelled here are
/// kept in `extra` so the record passes through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub step_index: u32,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub healing_attempts: Vec<HealingAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub action: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A proposed plan awaiting (or past) user approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    #[serde(alias = "id")]
    pub plan_id: String,
    pub status: PlanStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlannedStep>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Where an error event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    /// Reported by the backend over the push channel.
    Backend,
    /// Loading the execution's history failed.
    Load,
    /// A user action (send message, plan decision) failed.
    Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub origin: ErrorOrigin,
}

/// A captured network request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub step_index: Option<u32>,
}

/// A captured browser console line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    #[serde(default = "default_console_level")]
    pub level: String,
    #[serde(alias = "message")]
    pub text: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub step_index: Option<u32>,
}

fn default_method() -> String {
    crate::normalizer::DEFAULT_METHOD.to_string()
}

fn default_resource_type() -> String {
    crate::normalizer::DEFAULT_RESOURCE_TYPE.to_string()
}

fn default_console_level() -> String {
    crate::normalizer::DEFAULT_CONSOLE_LEVEL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: u32, status: StepStatus) -> StepRecord {
        StepRecord {
            id: None,
            step_index: index,
            action: "click".to_string(),
            target: None,
            status,
            duration_ms: None,
            error: None,
            screenshot_url: None,
            healing_attempts: Vec::new(),
            started_at: None,
            completed_at: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn test_step_identity_is_index_not_id() {
        let exec = ExecutionId::new("R1");
        let mut a = step(4, StepStatus::Running);
        a.id = Some("srv-1".to_string());
        let b = step(4, StepStatus::Passed);
        let a = TimelineEvent::step(exec.clone(), a);
        let b = TimelineEvent::step(exec, b);
        assert_ne!(a.id, b.id);
        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_step_unknown_fields_pass_through() {
        let raw = r#"{"step_index":0,"action":"goto","status":"passed","selector_score":0.9}"#;
        let record: StepRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.extra.get("selector_score"), Some(&serde_json::json!(0.9)));
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["selector_score"], serde_json::json!(0.9));
    }

    #[test]
    fn test_local_events_get_unique_ids() {
        let exec = ExecutionId::new("M1");
        let a = TimelineEvent::user(exec.clone(), "hello");
        let b = TimelineEvent::user(exec, "hello");
        assert_ne!(a.identity_key(), b.identity_key());
        assert!(a.id.starts_with("user-"));
    }
}
