//! Execution identity, lifecycle status, and server-side metadata.
//!
//! Status transitions are server-authoritative: nothing in this crate infers a
//! new status on its own, it only mirrors what the backend reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque server-issued execution identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which family of execution this is. Raw test runs carry network and console
/// streams; model runs are chat-style and carry plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    TestRun,
    ModelRun,
}

impl ExecutionKind {
    /// Path segment used by the backend for this kind of execution.
    pub fn resource(self) -> &'static str {
        match self {
            ExecutionKind::TestRun => "runs",
            ExecutionKind::ModelRun => "model-runs",
        }
    }
}

/// An execution id together with its kind; enough to address every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionRef {
    pub kind: ExecutionKind,
    pub id: ExecutionId,
}

impl ExecutionRef {
    pub fn test_run(id: impl Into<String>) -> Self {
        Self {
            kind: ExecutionKind::TestRun,
            id: ExecutionId::new(id),
        }
    }

    pub fn model_run(id: impl Into<String>) -> Self {
        Self {
            kind: ExecutionKind::ModelRun,
            id: ExecutionId::new(id),
        }
    }
}

impl fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.resource(), self.id)
    }
}

/// Lifecycle status as reported by the backend.
///
/// Model runs walk `pending -> planning -> plan_ready -> approved|rejected ->
/// running -> completed|failed`, with `queued` as an alternate entry before
/// `running`. Test runs only use the `pending/running/terminal` subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Queued,
    Planning,
    PlanReady,
    Approved,
    Rejected,
    Running,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl ExecutionStatus {
    /// Statuses during which a live channel should be open.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Queued | ExecutionStatus::Running
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the backend may hold a plan for an execution in this status.
    pub fn may_have_plan(self) -> bool {
        !matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Queued | ExecutionStatus::Unknown
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Planning => "planning",
            ExecutionStatus::PlanReady => "plan_ready",
            ExecutionStatus::Approved => "approved",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Aggregate step counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepCounters {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub healed: u32,
}

/// Execution detail as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMeta {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: StepCounters,
    /// Model name for model runs (e.g. the LLM being benchmarked).
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionMeta {
    pub fn new(id: ExecutionId, status: ExecutionStatus) -> Self {
        Self {
            id,
            status,
            started_at: None,
            completed_at: None,
            counters: StepCounters::default(),
            model: None,
            error: None,
        }
    }
}
