use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{Backend, BackendError, Logged, MessageMode};
use crate::execution::{ExecutionKind, ExecutionMeta, ExecutionRef};
use crate::timeline::{ConsoleEntry, NetworkEntry, PlanRecord, StepRecord};

/// REST client for the execution backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url).map_err(|e| BackendError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/api/{resource}/{id}/{tail...}`
    pub fn endpoint(&self, exec: &ExecutionRef, tail: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("api")
            .push(exec.kind.resource())
            .push(exec.id.as_str())
            .extend(tail);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, url: &Url) -> Result<Response, BackendError> {
        builder.send().await.map_err(|source| BackendError::Transport {
            url: url.to_string(),
            source,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, BackendError> {
        debug!(%url, "GET");
        let resp = self.send(self.request(Method::GET, url.clone()), &url).await?;
        let resp = check_status(resp, &url).await?;
        resp.json::<T>().await.map_err(|source| BackendError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn post(&self, url: Url, body: serde_json::Value) -> Result<(), BackendError> {
        debug!(%url, "POST");
        let resp = self
            .send(self.request(Method::POST, url.clone()).json(&body), &url)
            .await?;
        check_status(resp, &url).await?;
        Ok(())
    }
}

async fn check_status(resp: Response, url: &Url) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_execution(&self, exec: &ExecutionRef) -> Result<ExecutionMeta, BackendError> {
        self.get_json(self.endpoint(exec, &[])?).await
    }

    async fn fetch_steps(&self, exec: &ExecutionRef) -> Result<Vec<StepRecord>, BackendError> {
        self.get_json(self.endpoint(exec, &["steps"])?).await
    }

    async fn fetch_network(&self, exec: &ExecutionRef) -> Result<Vec<Logged<NetworkEntry>>, BackendError> {
        if exec.kind != ExecutionKind::TestRun {
            return Ok(Vec::new());
        }
        self.get_json(self.endpoint(exec, &["network"])?).await
    }

    async fn fetch_console(&self, exec: &ExecutionRef) -> Result<Vec<Logged<ConsoleEntry>>, BackendError> {
        if exec.kind != ExecutionKind::TestRun {
            return Ok(Vec::new());
        }
        self.get_json(self.endpoint(exec, &["console"])?).await
    }

    async fn fetch_plan(&self, exec: &ExecutionRef) -> Result<Option<PlanRecord>, BackendError> {
        if exec.kind != ExecutionKind::ModelRun {
            return Ok(None);
        }
        match self.get_json(self.endpoint(exec, &["plan"])?).await {
            Ok(plan) => Ok(Some(plan)),
            Err(BackendError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn send_message(&self, exec: &ExecutionRef, text: &str, mode: MessageMode) -> Result<(), BackendError> {
        let url = self.endpoint(exec, &["messages"])?;
        self.post(url, json!({ "text": text, "mode": mode })).await
    }

    async fn approve_plan(&self, exec: &ExecutionRef, plan_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(exec, &["plan", "approve"])?;
        self.post(url, json!({ "plan_id": plan_id })).await
    }

    async fn reject_plan(&self, exec: &ExecutionRef, plan_id: &str, reason: Option<&str>) -> Result<(), BackendError> {
        let url = self.endpoint(exec, &["plan", "reject"])?;
        self.post(url, json!({ "plan_id": plan_id, "reason": reason })).await
    }

    async fn cancel(&self, exec: &ExecutionRef) -> Result<(), BackendError> {
        let url = self.endpoint(exec, &["cancel"])?;
        self.post(url, json!({})).await
    }

    async fn undo_to_step(&self, exec: &ExecutionRef, step_index: u32) -> Result<(), BackendError> {
        let url = self.endpoint(exec, &["undo"])?;
        self.post(url, json!({ "step_index": step_index })).await
    }

    async fn replay_from_step(&self, exec: &ExecutionRef, step_index: u32) -> Result<(), BackendError> {
        let url = self.endpoint(exec, &["replay"])?;
        self.post(url, json!({ "from_step": step_index })).await
    }
}
