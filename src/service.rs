//! The orchestration service: one owner for the hub, the seek engine, the
//! agent loop and their stores, with an explicit lifecycle.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::collaborators::{
    ActionResolver, ActivityIndicator, Notifier, Planner, SampleSource, StepExecutor,
};
use crate::config::Settings;
use crate::controller::{AttemptOutcome, TaskController};
use crate::error::StartError;
use crate::events::{AgentEvent, EventKind, SeekEvent};
use crate::hub::{EventHub, Publisher, RecentEvents, Subscription, SubscriptionHandle};
use crate::memory::TaskMemoryStore;
use crate::seek::{MonitorHandle, MonitorSpec, SeekEngine, SeekRecord, StrategyKind, StrategySpec};
use crate::types::{TaskId, TaskMemory, TaskStatus};

/// The collaborator set the service is wired with.
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn StepExecutor>,
    pub resolver: Option<Arc<dyn ActionResolver>>,
    pub sampler: Arc<dyn SampleSource>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub indicator: Option<Arc<dyn ActivityIndicator>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub task_id: TaskId,
    pub active: bool,
    pub last_events: Vec<AgentEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
    pub seek_results: Vec<SeekRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuickSeekReport {
    pub task_id: TaskId,
    pub strategy: StrategyKind,
    /// Last event before `stopped`, usually the sample or not-found result.
    pub result: Option<AgentEvent>,
}

#[derive(Debug)]
pub struct Submission {
    pub task_id: TaskId,
    pub handle: JoinHandle<AttemptOutcome>,
}

pub struct Orchestrator {
    publisher: Publisher,
    seek: Arc<SeekEngine>,
    controller: Arc<TaskController>,
    memory: Arc<TaskMemoryStore>,
    max_retries: u32,
}

impl Orchestrator {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        let hub = Arc::new(EventHub::new());
        let recent = Arc::new(RecentEvents::new(settings.recent_events));
        let publisher = Publisher::new(hub, recent);
        let memory = Arc::new(TaskMemoryStore::new());

        let mut seek = SeekEngine::new(publisher.clone(), settings.seek);
        for strategy in StrategyKind::ALL {
            seek = seek.with_source(strategy, collaborators.sampler.clone());
        }
        if let Some(notifier) = collaborators.notifier {
            seek = seek.with_notifier(notifier);
        }

        let max_retries = settings.controller.max_retries;
        let mut controller = TaskController::new(
            collaborators.planner,
            collaborators.executor,
            publisher.clone(),
            memory.clone(),
            settings.controller,
        );
        if let Some(resolver) = collaborators.resolver {
            controller = controller.with_resolver(resolver);
        }
        if let Some(indicator) = collaborators.indicator {
            controller = controller.with_indicator(indicator);
        }

        Self {
            publisher,
            seek: Arc::new(seek),
            controller: Arc::new(controller),
            memory,
            max_retries,
        }
    }

    pub fn seek(&self) -> &Arc<SeekEngine> {
        &self.seek
    }

    pub fn controller(&self) -> &Arc<TaskController> {
        &self.controller
    }

    /// Run a prompt through the reflection loop in the background.
    pub fn submit_task(
        &self,
        prompt: String,
        task_id: Option<TaskId>,
        max_retries: Option<u32>,
    ) -> Submission {
        let task_id = task_id.unwrap_or_else(|| TaskId::generate("task"));
        let max_retries = max_retries.unwrap_or(self.max_retries);
        info!(task_id = %task_id, max_retries, "task submitted");

        let controller = self.controller.clone();
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            controller
                .execute_with_reflection(&prompt, &id, max_retries)
                .await
        });
        Submission { task_id, handle }
    }

    pub fn start_monitor(
        &self,
        task_id: &TaskId,
        spec: &MonitorSpec,
    ) -> Result<MonitorHandle, StartError> {
        self.seek.start(task_id, spec)
    }

    /// One-shot seek with the strategy inferred from the query.
    pub async fn quick_seek(
        &self,
        query: &str,
        screenshot: Option<String>,
    ) -> Result<QuickSeekReport, StartError> {
        let task_id = TaskId::generate("seek");
        let spec = MonitorSpec {
            strategy: StrategySpec::infer(query, screenshot.is_some()),
            continuous: false,
            interval_ms: None,
            notify: None,
            screenshot,
        };

        let mut subscription = self.subscribe(&task_id);
        let outcome = self.seek.start(&task_id, &spec);
        let handle = match outcome {
            Ok(handle) => handle,
            Err(err) => {
                self.unsubscribe(&subscription.handle);
                return Err(err);
            }
        };
        let strategy = handle.key.strategy;
        handle.finished().await;

        let mut result = None;
        while let Ok(event) = subscription.receiver.try_recv() {
            if !matches!(event.kind, EventKind::Seek(SeekEvent::Stopped { .. })) {
                result = Some(event);
            }
        }
        self.unsubscribe(&subscription.handle);

        Ok(QuickSeekReport {
            task_id,
            strategy,
            result,
        })
    }

    /// Signal every monitor and any running execution of the task.
    pub fn stop(&self, task_id: &TaskId) -> bool {
        let monitors = self.seek.stop(task_id);
        let execution = self.controller.stop(task_id);
        monitors || execution
    }

    /// Stop only one strategy's monitor of a task.
    pub fn stop_strategy(&self, task_id: &TaskId, strategy: StrategyKind) -> bool {
        self.seek.stop_strategy(task_id, strategy)
    }

    pub fn update_screenshot(&self, task_id: &TaskId, screenshot: String) -> bool {
        self.seek.update_screenshot(task_id, screenshot)
    }

    pub fn shutdown(&self) -> usize {
        self.seek.stop_all()
    }

    pub fn status(&self, task_id: &TaskId) -> StatusReport {
        StatusReport {
            task_id: task_id.clone(),
            active: self.seek.is_active(task_id) || self.controller.is_running(task_id),
            last_events: self.publisher.recent().latest(task_id),
            task_status: self.memory.status(task_id),
            seek_results: self.seek.history(task_id),
        }
    }

    pub fn subscribe(&self, task_id: &TaskId) -> Subscription {
        self.publisher.hub().subscribe(task_id)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.publisher.hub().unsubscribe(handle)
    }

    /// Deliver an event to every subscriber of every task.
    pub fn broadcast(&self, kind: impl Into<EventKind>) {
        let event = AgentEvent::new(TaskId::from("system"), kind);
        self.publisher.hub().broadcast(&event);
    }

    pub fn history(&self, task_id: &TaskId) -> Vec<SeekRecord> {
        self.seek.history(task_id)
    }

    /// Drop seek results, recent events and reflection memory of a task.
    pub fn clear_history(&self, task_id: &TaskId) -> bool {
        let seek = self.seek.clear_history(task_id);
        let recent = self.publisher.recent().clear(task_id);
        let memory = self.memory.clear(task_id);
        seek || recent || memory
    }

    pub fn memory(&self, task_id: &TaskId) -> Option<TaskMemory> {
        self.memory.get(task_id)
    }

    pub fn memories(&self) -> Vec<TaskMemory> {
        self.memory.all()
    }
}
