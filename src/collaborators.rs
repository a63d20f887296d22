//! Contracts for the external systems the core drives but does not implement.
//!
//! Every call site in the core converts a failure from these traits into a
//! typed event; nothing here is allowed to abort an orchestration loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CollaboratorError, PlanningError};
use crate::memory::RetryContext;
use crate::seek::{Observation, Probe};
use crate::types::{Coordinates, Plan, Step, StepResult, TaskId, VisualContext};

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub task_id: TaskId,
    pub prompt: String,
    pub context: Option<RetryContext>,
}

/// Turns a prompt (plus failure context on retries) into an ordered plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, PlanningError>;
}

/// Which resolver stage is being asked. The core walks them in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// DOM hints combined with the screenshot.
    Hybrid,
    /// Screenshot only.
    Vision,
}

/// Maps an element description to screen coordinates. `Ok(None)` means not
/// found; returned coordinates are bounds-checked by the caller.
#[async_trait]
pub trait ActionResolver: Send + Sync {
    async fn resolve(
        &self,
        description: &str,
        mode: ResolveMode,
        context: &VisualContext,
    ) -> Result<Option<Coordinates>, CollaboratorError>;
}

/// Runs one step against the page. Owns its own timeout; a timeout comes
/// back as [`CollaboratorError::Timeout`].
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(&self, step: &Step) -> Result<StepResult, CollaboratorError>;

    /// Current viewport and screenshot for coordinate resolution.
    async fn visual_context(&self) -> Result<VisualContext, CollaboratorError>;
}

/// Produces one observation for a monitor.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn sample(&self, task_id: &TaskId, probe: &Probe)
    -> Result<Observation, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient: Option<String>,
    pub message: String,
    /// Base64 image, e.g. the chart that triggered a signal.
    pub attachment: Option<String>,
}

/// Outbound alerts. Never fails: `false` means not delivered, already logged.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> bool;
}

/// Tells a presentation layer that automation is running for a task.
#[async_trait]
pub trait ActivityIndicator: Send + Sync {
    async fn set_active(&self, task_id: &TaskId, active: bool) -> Result<(), CollaboratorError>;
}
