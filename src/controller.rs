//! The agent loop: plan, execute, reflect, retry.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{
    ActionResolver, ActivityIndicator, PlanRequest, Planner, ResolveMode, StepExecutor,
};
use crate::error::{CoordinateOutOfBounds, LocateError};
use crate::events::TaskEvent;
use crate::hub::Publisher;
use crate::memory::TaskMemoryStore;
use crate::types::{
    Coordinates, Plan, Step, StepAction, StepKind, StepResult, Target, TaskId, TaskStatus,
    Viewport, VisualContext,
};

/// Resolver stages tried in order. The flag marks a scroll before the stage.
const LOCATE_CHAIN: [(ResolveMode, bool); 3] = [
    (ResolveMode::Hybrid, false),
    (ResolveMode::Vision, false),
    (ResolveMode::Hybrid, true),
];

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Step kinds whose failure aborts the attempt.
    pub critical_steps: HashSet<StepKind>,
    /// Bound used when the executor cannot report its own viewport.
    pub viewport: Viewport,
    pub max_retries: u32,
    /// Pixels scrolled before the last locate attempt.
    pub scroll_amount: i32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            critical_steps: HashSet::from([StepKind::Navigate, StepKind::Wait]),
            viewport: Viewport::default(),
            max_retries: 2,
            scroll_amount: 500,
        }
    }
}

/// How one plan-and-execute pass ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed {
        steps_executed: usize,
        failed_steps: usize,
    },
    Aborted {
        message: String,
        step_num: Option<usize>,
    },
    Cancelled,
}

struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
}

/// Removes the run's cancellation entry when the execution ends.
struct RunGuard<'a> {
    active: &'a DashMap<TaskId, ActiveRun>,
    task_id: TaskId,
    generation: u64,
    cancel: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.task_id, |_, run| run.generation == self.generation);
    }
}

pub struct TaskController {
    planner: Arc<dyn Planner>,
    executor: Arc<dyn StepExecutor>,
    resolver: Option<Arc<dyn ActionResolver>>,
    indicator: Option<Arc<dyn ActivityIndicator>>,
    publisher: Publisher,
    memory: Arc<TaskMemoryStore>,
    active: DashMap<TaskId, ActiveRun>,
    generation: AtomicU64,
    settings: ControllerSettings,
}

impl TaskController {
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: Arc<dyn StepExecutor>,
        publisher: Publisher,
        memory: Arc<TaskMemoryStore>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            planner,
            executor,
            resolver: None,
            indicator: None,
            publisher,
            memory,
            active: DashMap::new(),
            generation: AtomicU64::new(0),
            settings,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ActionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_indicator(mut self, indicator: Arc<dyn ActivityIndicator>) -> Self {
        self.indicator = Some(indicator);
        self
    }

    pub fn memory(&self) -> &Arc<TaskMemoryStore> {
        &self.memory
    }

    /// Single attempt, no retry. Ends with `task_complete`, `cancelled`, or
    /// a non-retrying `error`.
    pub async fn execute(&self, prompt: &str, task_id: &TaskId) -> AttemptOutcome {
        let Some(run) = self.begin(task_id) else {
            return self.reject_duplicate(task_id);
        };
        self.memory.begin(task_id, prompt);
        self.indicate(task_id, true).await;

        let outcome = self.attempt(prompt, task_id, 1, 1, &run.cancel).await;
        match &outcome {
            AttemptOutcome::Completed {
                steps_executed,
                failed_steps,
            } => self.complete(task_id, *steps_executed, *failed_steps),
            AttemptOutcome::Aborted { message, step_num } => {
                self.memory.set_status(task_id, TaskStatus::Failed);
                self.publisher.emit(
                    task_id,
                    TaskEvent::Error {
                        message: message.clone(),
                        step_num: *step_num,
                        retrying: false,
                    },
                );
            }
            AttemptOutcome::Cancelled => self.cancelled(task_id),
        }

        self.indicate(task_id, false).await;
        outcome
    }

    /// Retry loop around [`TaskController::execute`]. At most
    /// `max_retries + 1` planning attempts; exactly one terminal event.
    pub async fn execute_with_reflection(
        &self,
        prompt: &str,
        task_id: &TaskId,
        max_retries: u32,
    ) -> AttemptOutcome {
        let Some(run) = self.begin(task_id) else {
            return self.reject_duplicate(task_id);
        };
        self.memory.begin(task_id, prompt);
        self.indicate(task_id, true).await;

        let max_attempts = max_retries.saturating_add(1);
        let mut attempt = 1;
        let outcome = loop {
            let outcome = self
                .attempt(prompt, task_id, attempt, max_attempts, &run.cancel)
                .await;
            match &outcome {
                AttemptOutcome::Completed {
                    steps_executed,
                    failed_steps,
                } => {
                    self.complete(task_id, *steps_executed, *failed_steps);
                    break outcome;
                }
                AttemptOutcome::Cancelled => {
                    self.cancelled(task_id);
                    break outcome;
                }
                AttemptOutcome::Aborted { message, step_num } if attempt < max_attempts => {
                    warn!(task_id = %task_id, attempt, error = %message, "attempt failed, replanning");
                    self.publisher.emit(
                        task_id,
                        TaskEvent::Error {
                            message: message.clone(),
                            step_num: *step_num,
                            retrying: true,
                        },
                    );
                    self.memory.increment_retry(task_id);
                    attempt += 1;
                }
                AttemptOutcome::Aborted { message, .. } => {
                    warn!(task_id = %task_id, attempts = attempt, "task failed");
                    self.memory.set_status(task_id, TaskStatus::Failed);
                    self.publisher.emit(
                        task_id,
                        TaskEvent::TaskFailed {
                            message: message.clone(),
                            attempts: attempt,
                        },
                    );
                    break outcome;
                }
            }
        };

        self.indicate(task_id, false).await;
        outcome
    }

    /// Signal a running execution. It stops before its next step.
    ///
    /// The run keeps its slot until it has actually finished, so a new
    /// execution under the same id is refused while the cancelled one is
    /// still inside a collaborator call. Returns `false` when nothing is
    /// running or the run was already told to stop.
    pub fn stop(&self, task_id: &TaskId) -> bool {
        let Some(run) = self.active.get(task_id) else {
            return false;
        };
        if run.cancel.is_cancelled() {
            return false;
        }
        run.cancel.cancel();
        info!(task_id = %task_id, "execution stop requested");
        true
    }

    /// True from `begin` until the run has finished, including the time a
    /// stopped run needs to wind down.
    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.active.contains_key(task_id)
    }

    fn begin(&self, task_id: &TaskId) -> Option<RunGuard<'_>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        match self.active.entry(task_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    generation,
                    cancel: cancel.clone(),
                });
                Some(RunGuard {
                    active: &self.active,
                    task_id: task_id.clone(),
                    generation,
                    cancel,
                })
            }
        }
    }

    fn reject_duplicate(&self, task_id: &TaskId) -> AttemptOutcome {
        let message = format!("task {task_id} is already running");
        warn!(task_id = %task_id, "rejected duplicate execution");
        self.publisher.emit(
            task_id,
            TaskEvent::Error {
                message: message.clone(),
                step_num: None,
                retrying: false,
            },
        );
        AttemptOutcome::Aborted {
            message,
            step_num: None,
        }
    }

    fn complete(&self, task_id: &TaskId, steps_executed: usize, failed_steps: usize) {
        info!(task_id = %task_id, steps_executed, failed_steps, "task complete");
        self.memory.set_status(task_id, TaskStatus::Completed);
        self.publisher.emit(
            task_id,
            TaskEvent::TaskComplete {
                steps_executed,
                failed_steps,
            },
        );
    }

    fn cancelled(&self, task_id: &TaskId) {
        info!(task_id = %task_id, "task cancelled");
        self.memory.set_status(task_id, TaskStatus::Failed);
        self.publisher.emit(task_id, TaskEvent::Cancelled);
    }

    async fn attempt(
        &self,
        prompt: &str,
        task_id: &TaskId,
        attempt: u32,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        if cancel.is_cancelled() {
            return AttemptOutcome::Cancelled;
        }

        self.publisher.emit(
            task_id,
            TaskEvent::Planning {
                attempt,
                max_attempts,
            },
        );
        let (plan, fallback) = self.plan(prompt, task_id, attempt).await;
        self.memory.record_plan(task_id, plan.clone());
        self.publisher.emit(
            task_id,
            TaskEvent::PlanCreated {
                step_count: plan.len(),
                plan: plan.clone(),
                fallback,
            },
        );

        let total = plan.len();
        let mut failed_steps = 0;
        for (index, step) in plan.steps().iter().enumerate() {
            if cancel.is_cancelled() {
                return AttemptOutcome::Cancelled;
            }
            let step_num = index + 1;
            debug!(task_id = %task_id, step_num, action = %step.kind(), "executing step");
            self.publisher.emit(
                task_id,
                TaskEvent::StepStart {
                    step: step.clone(),
                    step_num,
                    total,
                },
            );

            let result = self.run_step(step).await;
            self.memory.record_feedback(task_id, result.clone());
            self.publisher.emit(
                task_id,
                TaskEvent::StepComplete {
                    step: step.clone(),
                    result: result.clone(),
                    step_num,
                    total,
                },
            );

            if result.success {
                continue;
            }
            failed_steps += 1;
            let error = result.error.as_deref().unwrap_or("unknown error");
            if self.settings.critical_steps.contains(&step.kind()) {
                return AttemptOutcome::Aborted {
                    message: format!("critical step {step_num} ({}) failed: {error}", step.kind()),
                    step_num: Some(step_num),
                };
            }
            debug!(task_id = %task_id, step_num, error, "non-critical step failed, continuing");
        }

        AttemptOutcome::Completed {
            steps_executed: total,
            failed_steps,
        }
    }

    /// Ask the planner, substituting the fallback plan on any failure.
    async fn plan(&self, prompt: &str, task_id: &TaskId, attempt: u32) -> (Plan, bool) {
        let request = PlanRequest {
            task_id: task_id.clone(),
            prompt: prompt.to_string(),
            context: if attempt > 1 {
                self.memory.retry_context(task_id)
            } else {
                None
            },
        };

        match self.planner.plan(&request).await {
            Ok(plan) if !plan.is_empty() => (plan, false),
            Ok(_) => {
                warn!(task_id = %task_id, "planner returned no steps, using fallback plan");
                (Plan::fallback(task_id.clone()), true)
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "planning failed, using fallback plan");
                (Plan::fallback(task_id.clone()), true)
            }
        }
    }

    async fn run_step(&self, step: &Step) -> StepResult {
        let started = Instant::now();
        let result = match &step.action {
            StepAction::VisionLocate { description } => match self.locate(description).await {
                Ok(point) => {
                    StepResult::succeeded(step.id.clone(), Some(json!({ "coordinates": point })))
                }
                Err(err) => StepResult::failed(step.id.clone(), err.to_string()),
            },
            action => match action.target() {
                Some(Target::Description(description)) => match self.locate(description).await {
                    Ok(point) => {
                        self.dispatch(&Step::new(step.id.clone(), action.at(point)))
                            .await
                    }
                    // Without a resolver the executor gets the description as is.
                    Err(LocateError::NoResolver) => self.dispatch(step).await,
                    Err(err) => StepResult::failed(step.id.clone(), err.to_string()),
                },
                _ => self.dispatch(step).await,
            },
        };

        if result.duration_ms == 0 {
            result.with_duration(started.elapsed().as_millis() as u64)
        } else {
            result
        }
    }

    async fn dispatch(&self, step: &Step) -> StepResult {
        match self.executor.run(step).await {
            Ok(result) => result,
            Err(err) => {
                warn!(step_id = %step.id, error = %err, "executor call failed");
                StepResult::failed(step.id.clone(), err.to_string())
            }
        }
    }

    /// Walk the resolver chain until a point inside the viewport comes back.
    async fn locate(&self, description: &str) -> Result<Coordinates, LocateError> {
        let resolver = self.resolver.as_ref().ok_or(LocateError::NoResolver)?;
        let mut last_rejected = None;

        for (mode, scroll_first) in LOCATE_CHAIN {
            if scroll_first {
                let scroll = Step::new(
                    "locate-scroll",
                    StepAction::Scroll {
                        amount: self.settings.scroll_amount,
                    },
                );
                if let Err(err) = self.executor.run(&scroll).await {
                    warn!(error = %err, "scroll before retry failed");
                }
            }

            let context = match self.executor.visual_context().await {
                Ok(context) => context,
                Err(err) => {
                    warn!(error = %err, "visual context unavailable");
                    VisualContext {
                        viewport: self.settings.viewport,
                        screenshot: None,
                    }
                }
            };

            match resolver.resolve(description, mode, &context).await {
                Ok(Some(point)) if context.viewport.contains(point) => return Ok(point),
                Ok(Some(point)) => {
                    debug!(%point, viewport = %context.viewport, ?mode, "resolved point out of bounds");
                    last_rejected = Some(CoordinateOutOfBounds {
                        point,
                        viewport: context.viewport,
                    });
                }
                Ok(None) => debug!(?mode, description, "resolver found nothing"),
                Err(err) => warn!(?mode, error = %err, "resolver call failed"),
            }
        }

        Err(LocateError::NotFound {
            description: description.to_string(),
            last_rejected,
        })
    }

    async fn indicate(&self, task_id: &TaskId, active: bool) {
        let Some(indicator) = &self.indicator else {
            return;
        };
        if let Err(err) = indicator.set_active(task_id, active).await {
            warn!(task_id = %task_id, active, error = %err, "activity indicator update failed");
        }
    }
}
