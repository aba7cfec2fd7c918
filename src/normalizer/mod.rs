//! Turns raw push-channel messages into typed timeline events.
//!
//! Unknown message types are ignored so newer backends can add messages
//! without breaking older clients. Live network and console entries have no
//! server id when they arrive; they get a synthesized `live-<millis>-<rand>`
//! id and are never reconciled against a persisted id later.

pub mod wire;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use thiserror::Error;

use crate::execution::ExecutionId;
use crate::timeline::{ConsoleEntry, ErrorOrigin, EventKind, ErrorRecord, NetworkEntry, StepRecord, TimelineEvent};

use self::wire::{Envelope, ErrorPayload, LiveConsole, LiveNetwork, MessageType, RunCompleted};

/// Fallback for a live network entry without a method.
pub const DEFAULT_METHOD: &str = "GET";
/// Fallback for a live network entry without a resource type.
pub const DEFAULT_RESOURCE_TYPE: &str = "other";
/// Fallback for a live console entry without a level.
pub const DEFAULT_CONSOLE_LEVEL: &str = "log";

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 9;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of normalizing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Event(TimelineEvent),
    /// The execution reached a final status.
    Completed(RunCompleted),
    Ignore,
}

/// Source of "now" for entries that arrive without a timestamp.
pub type Clock = fn() -> DateTime<Utc>;

/// Per-execution normalizer. Holds the random source used for synthesized
/// ids and the clock used for missing timestamps; fix both for deterministic
/// output.
pub struct EventNormalizer {
    execution_id: ExecutionId,
    rng: StdRng,
    clock: Clock,
}

impl EventNormalizer {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self::with_rng(execution_id, StdRng::from_entropy())
    }

    pub fn with_rng(execution_id: ExecutionId, rng: StdRng) -> Self {
        Self::with_rng_and_clock(execution_id, rng, Utc::now)
    }

    pub fn with_rng_and_clock(execution_id: ExecutionId, rng: StdRng, clock: Clock) -> Self {
        Self { execution_id, rng, clock }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Normalize a raw text frame.
    pub fn normalize_text(&mut self, raw: &str) -> Result<Normalized, NormalizeError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(NormalizeError::InvalidJson)?;
        self.normalize(envelope)
    }

    pub fn normalize(&mut self, envelope: Envelope) -> Result<Normalized, NormalizeError> {
        let Some(kind) = MessageType::parse(&envelope.kind) else {
            return Ok(Normalized::Ignore);
        };
        let payload = envelope.into_payload();

        let normalized = match kind {
            MessageType::StepCompleted => {
                let step = step_from_payload(payload)?;
                Normalized::Event(TimelineEvent::step(self.execution_id.clone(), step))
            }
            MessageType::RunCompleted => {
                Normalized::Completed(decode(payload, "run_completed")?)
            }
            MessageType::Error => {
                let err: ErrorPayload = decode(payload, "error")?;
                let timestamp = (self.clock)();
                Normalized::Event(TimelineEvent {
                    id: self.synthesize_id("error", timestamp),
                    execution_id: self.execution_id.clone(),
                    timestamp,
                    kind: EventKind::Error(ErrorRecord {
                        message: err.message,
                        origin: ErrorOrigin::Backend,
                    }),
                })
            }
            MessageType::LiveNetwork => {
                let net: LiveNetwork = decode(payload, "live_network")?;
                let timestamp = net.timestamp.unwrap_or_else(self.clock);
                Normalized::Event(TimelineEvent {
                    id: self.synthesize_id("live", timestamp),
                    execution_id: self.execution_id.clone(),
                    timestamp,
                    kind: EventKind::NetworkRequest(NetworkEntry {
                        url: net.url,
                        method: net.method.unwrap_or_else(|| DEFAULT_METHOD.to_string()),
                        status: net.status,
                        resource_type: net
                            .resource_type
                            .unwrap_or_else(|| DEFAULT_RESOURCE_TYPE.to_string()),
                        duration_ms: net.duration_ms,
                        step_index: net.step_index,
                    }),
                })
            }
            MessageType::LiveConsole => {
                let log: LiveConsole = decode(payload, "live_console")?;
                let timestamp = log.timestamp.unwrap_or_else(self.clock);
                Normalized::Event(TimelineEvent {
                    id: self.synthesize_id("live", timestamp),
                    execution_id: self.execution_id.clone(),
                    timestamp,
                    kind: EventKind::ConsoleLog(ConsoleEntry {
                        level: log.level.unwrap_or_else(|| DEFAULT_CONSOLE_LEVEL.to_string()),
                        text: log.text,
                        source_url: log.url,
                        step_index: log.step_index,
                    }),
                })
            }
        };
        Ok(normalized)
    }

    fn synthesize_id(&mut self, prefix: &str, timestamp: DateTime<Utc>) -> String {
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[self.rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();
        format!("{}-{}-{}", prefix, timestamp.timestamp_millis(), suffix)
    }
}

/// Accepts both `{ "step": {...} }` and a bare step object.
fn step_from_payload(payload: Value) -> Result<StepRecord, NormalizeError> {
    let step = match payload {
        Value::Object(mut map) if map.contains_key("step") => map.remove("step").unwrap_or(Value::Null),
        other => other,
    };
    decode(step, "step_completed")
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value, kind: &'static str) -> Result<T, NormalizeError> {
    serde_json::from_value(payload).map_err(|source| NormalizeError::Malformed { kind, source })
}
