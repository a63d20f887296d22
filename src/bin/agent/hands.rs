//! HTTP client for the automation bridge: the external process that owns
//! the real browser, runs steps, resolves coordinates and samples pages.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use seek_agent::error::CollaboratorError;
use seek_agent::{
    ActionResolver, ActivityIndicator, Coordinates, Observation, Probe, ResolveMode, SampleSource,
    Step, StepExecutor, StepResult, TaskId, VisualContext,
};

const COLLABORATOR: &str = "automation bridge";

#[derive(Deserialize)]
struct Resolved {
    #[serde(default)]
    coordinates: Option<Coordinates>,
}

pub struct AutomationBridge {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl AutomationBridge {
    pub fn new(client: Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn convert(&self, err: reqwest::Error) -> CollaboratorError {
        if err.is_timeout() {
            CollaboratorError::Timeout {
                collaborator: COLLABORATOR,
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            CollaboratorError::failed(COLLABORATOR, err.to_string())
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, CollaboratorError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(path, "bridge request");
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.convert(e))?;
        Self::decode(response, path).await.map_err(|e| self.convert(e))?
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CollaboratorError> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.convert(e))?;
        Self::decode(response, path).await.map_err(|e| self.convert(e))?
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        path: &str,
    ) -> Result<Result<T, CollaboratorError>, reqwest::Error> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Ok(Err(CollaboratorError::failed(
                COLLABORATOR,
                format!("{path} returned {status}: {body}"),
            )));
        }
        Ok(Ok(response.json().await?))
    }
}

#[async_trait]
impl StepExecutor for AutomationBridge {
    async fn run(&self, step: &Step) -> Result<StepResult, CollaboratorError> {
        self.post("steps", step).await
    }

    async fn visual_context(&self) -> Result<VisualContext, CollaboratorError> {
        self.get("context").await
    }
}

#[async_trait]
impl ActionResolver for AutomationBridge {
    async fn resolve(
        &self,
        description: &str,
        mode: ResolveMode,
        context: &VisualContext,
    ) -> Result<Option<Coordinates>, CollaboratorError> {
        let resolved: Resolved = self
            .post(
                "resolve",
                &json!({
                    "description": description,
                    "mode": mode,
                    "viewport": context.viewport,
                    "screenshot": context.screenshot,
                }),
            )
            .await?;
        Ok(resolved.coordinates)
    }
}

#[async_trait]
impl SampleSource for AutomationBridge {
    async fn sample(&self, task_id: &TaskId, probe: &Probe) -> Result<Observation, CollaboratorError> {
        self.post("sample", &json!({ "task_id": task_id, "probe": probe }))
            .await
    }
}

#[async_trait]
impl ActivityIndicator for AutomationBridge {
    async fn set_active(&self, task_id: &TaskId, active: bool) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(self.url("overlay"))
            .timeout(self.timeout)
            .json(&json!({ "task_id": task_id, "active": active }))
            .send()
            .await
            .map_err(|e| self.convert(e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CollaboratorError::failed(
                COLLABORATOR,
                format!("overlay returned {status}"),
            ))
        }
    }
}
