//! Wire shapes for messages pushed over the live channel.
//!
//! Envelopes are `{ "type": ..., "data": {...} }`; older producers put the
//! payload fields next to `type` instead of under `data`, so both are accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::{ExecutionStatus, StepCounters};

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Envelope {
    /// The payload, wherever the producer put it.
    pub fn into_payload(self) -> Value {
        match self.data {
            Some(data) => data,
            None => Value::Object(self.rest),
        }
    }
}

/// Message type names this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    StepCompleted,
    RunCompleted,
    Error,
    LiveNetwork,
    LiveConsole,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run_step_completed" | "step_completed" => Some(MessageType::StepCompleted),
            "run_completed" => Some(MessageType::RunCompleted),
            "error" => Some(MessageType::Error),
            "live_network" => Some(MessageType::LiveNetwork),
            "live_console" => Some(MessageType::LiveConsole),
            _ => None,
        }
    }
}

/// Final status pushed when an execution finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompleted {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: StepCounters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    #[serde(alias = "error")]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveNetwork {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub step_index: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConsole {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(alias = "message")]
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub step_index: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}
