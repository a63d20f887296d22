use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::seek::StrategyKind;
use crate::threshold::Operator;
use crate::types::{Coordinates, Plan, Step, StepResult, TaskId};

/// Progress of a seek/monitor loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeekEvent {
    Started {
        strategy: StrategyKind,
        target: String,
        continuous: bool,
        interval_ms: u64,
    },
    Sample {
        strategy: StrategyKind,
        found: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        coordinates: Option<Coordinates>,
        #[serde(skip_serializing_if = "Option::is_none")]
        condition_met: Option<bool>,
    },
    Crossed {
        value: f64,
        threshold: f64,
        operator: Operator,
        message: String,
        notified: Option<bool>,
    },
    Signal {
        summary: String,
        notified: Option<bool>,
    },
    NotFound {
        strategy: StrategyKind,
        target: String,
    },
    /// A chart monitor is sampling without a pushed screenshot.
    ScreenshotNeeded {
        strategy: StrategyKind,
    },
    Error {
        message: String,
    },
    Stopped {
        samples: u64,
    },
}

/// Lifecycle of an agent execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Planning {
        attempt: u32,
        max_attempts: u32,
    },
    PlanCreated {
        plan: Plan,
        step_count: usize,
        fallback: bool,
    },
    StepStart {
        step: Step,
        step_num: usize,
        total: usize,
    },
    StepComplete {
        step: Step,
        result: StepResult,
        step_num: usize,
        total: usize,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_num: Option<usize>,
        retrying: bool,
    },
    TaskComplete {
        steps_executed: usize,
        failed_steps: usize,
    },
    TaskFailed {
        message: String,
        attempts: u32,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventKind {
    Seek(SeekEvent),
    Task(TaskEvent),
}

impl From<SeekEvent> for EventKind {
    fn from(event: SeekEvent) -> Self {
        EventKind::Seek(event)
    }
}

impl From<TaskEvent> for EventKind {
    fn from(event: TaskEvent) -> Self {
        EventKind::Task(event)
    }
}

/// Envelope every subscriber receives: `{task_id, timestamp, type, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentEvent {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl AgentEvent {
    pub fn new(task_id: TaskId, kind: impl Into<EventKind>) -> Self {
        Self {
            task_id,
            timestamp: Utc::now(),
            kind: kind.into(),
        }
    }

    /// Wire name of the event, matching the serialized `type` field.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            EventKind::Seek(event) => match event {
                SeekEvent::Started { .. } => "started",
                SeekEvent::Sample { .. } => "sample",
                SeekEvent::Crossed { .. } => "crossed",
                SeekEvent::Signal { .. } => "signal",
                SeekEvent::NotFound { .. } => "not_found",
                SeekEvent::ScreenshotNeeded { .. } => "screenshot_needed",
                SeekEvent::Error { .. } => "error",
                SeekEvent::Stopped { .. } => "stopped",
            },
            EventKind::Task(event) => match event {
                TaskEvent::Planning { .. } => "planning",
                TaskEvent::PlanCreated { .. } => "plan_created",
                TaskEvent::StepStart { .. } => "step_start",
                TaskEvent::StepComplete { .. } => "step_complete",
                TaskEvent::Error { .. } => "error",
                TaskEvent::TaskComplete { .. } => "task_complete",
                TaskEvent::TaskFailed { .. } => "task_failed",
                TaskEvent::Cancelled => "cancelled",
            },
        }
    }

    /// Whether this event ends its producer's stream.
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            EventKind::Seek(event) => matches!(event, SeekEvent::Stopped { .. }),
            EventKind::Task(event) => matches!(
                event,
                TaskEvent::TaskComplete { .. }
                    | TaskEvent::TaskFailed { .. }
                    | TaskEvent::Cancelled
                    | TaskEvent::Error {
                        retrying: false,
                        ..
                    }
            ),
        }
    }

    pub fn as_seek(&self) -> Option<&SeekEvent> {
        match &self.kind {
            EventKind::Seek(event) => Some(event),
            EventKind::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskEvent> {
        match &self.kind {
            EventKind::Task(event) => Some(event),
            EventKind::Seek(_) => None,
        }
    }
}
