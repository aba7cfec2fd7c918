//! Backend collaborators: the HTTP API (detail, history, user actions) and the
//! per-execution push channel.
//!
//! Both are traits so the channel and coordinator can be driven by in-process
//! fakes in tests.

pub mod history;
pub mod http;
pub mod ws;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::{ExecutionMeta, ExecutionRef};
use crate::timeline::{ConsoleEntry, NetworkEntry, PlanRecord, StepRecord};

pub use self::http::HttpBackend;
pub use self::ws::WsTransport;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("push channel error: {0}")]
    Socket(String),

    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Other(String),
}

/// How a chat message should be handled by the model run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MessageMode {
    /// Ask the model to produce (or revise) a plan.
    Plan,
    /// Ask the model to act directly.
    Execute,
}

/// A network request or console line fetched from run history.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Logged<T> {
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(flatten)]
    pub entry: T,
}

/// HTTP side of the execution backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_execution(&self, exec: &ExecutionRef) -> Result<ExecutionMeta, BackendError>;

    async fn fetch_steps(&self, exec: &ExecutionRef) -> Result<Vec<StepRecord>, BackendError>;

    async fn fetch_network(&self, exec: &ExecutionRef) -> Result<Vec<Logged<NetworkEntry>>, BackendError>;

    async fn fetch_console(&self, exec: &ExecutionRef) -> Result<Vec<Logged<ConsoleEntry>>, BackendError>;

    /// Current plan, or `None` if the execution has none.
    async fn fetch_plan(&self, exec: &ExecutionRef) -> Result<Option<PlanRecord>, BackendError>;

    async fn send_message(&self, exec: &ExecutionRef, text: &str, mode: MessageMode) -> Result<(), BackendError>;

    async fn approve_plan(&self, exec: &ExecutionRef, plan_id: &str) -> Result<(), BackendError>;

    async fn reject_plan(&self, exec: &ExecutionRef, plan_id: &str, reason: Option<&str>) -> Result<(), BackendError>;

    async fn cancel(&self, exec: &ExecutionRef) -> Result<(), BackendError>;

    async fn undo_to_step(&self, exec: &ExecutionRef, step_index: u32) -> Result<(), BackendError>;

    async fn replay_from_step(&self, exec: &ExecutionRef, step_index: u32) -> Result<(), BackendError>;
}

/// Raw text frames from one execution's push channel. The stream ends when the
/// server closes the connection; dropping it closes the connection.
pub type PushStream = BoxStream<'static, Result<String, BackendError>>;

/// Push side of the execution backend.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(&self, exec: &ExecutionRef) -> Result<PushStream, BackendError>;
}
