//! Orchestration core for long-running, cancellable agent tasks and page
//! monitors, each streaming typed events to live subscribers.

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod hub;
pub mod memory;
pub mod seek;
pub mod service;
pub mod threshold;
pub mod types;

pub use collaborators::{
    ActionResolver, ActivityIndicator, Notification, Notifier, PlanRequest, Planner, ResolveMode,
    SampleSource, StepExecutor,
};
pub use config::{Cli, Settings};
pub use controller::{AttemptOutcome, ControllerSettings, TaskController};
pub use events::{AgentEvent, EventKind, SeekEvent, TaskEvent};
pub use hub::{EventHub, EventSink, Publisher, RecentEvents, Subscription, SubscriptionHandle};
pub use memory::{RetryContext, TaskMemoryStore};
pub use seek::{MonitorSpec, Observation, Probe, SeekEngine, SeekSettings, StrategyKind, StrategySpec};
pub use service::{Collaborators, Orchestrator, QuickSeekReport, StatusReport, Submission};
pub use threshold::{Operator, ThresholdTracker};
pub use types::{
    Coordinates, Plan, Step, StepAction, StepKind, StepResult, Target, TaskId, TaskMemory,
    TaskStatus, Viewport, VisualContext,
};
