use thiserror::Error;

use crate::types::{Coordinates, Viewport};

/// The planner could not produce a usable plan. Always recovered with a
/// fallback plan by the task controller.
#[derive(Debug, Clone, Error)]
pub enum PlanningError {
    #[error("planner output could not be parsed: {0}")]
    Malformed(String),
    #[error("planner returned an empty plan")]
    Empty,
    #[error("planner request failed: {0}")]
    Request(String),
}

/// Failure of an external collaborator call.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("{collaborator} did not respond within {timeout_ms}ms")]
    Timeout {
        collaborator: &'static str,
        timeout_ms: u64,
    },
    #[error("{collaborator} failed: {message}")]
    Failed {
        collaborator: &'static str,
        message: String,
    },
}

impl CollaboratorError {
    pub fn failed(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            collaborator,
            message: message.into(),
        }
    }
}

/// A monitor specification that cannot run. Fatal to that monitor's start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("element monitor needs exactly one of selector or description")]
    AmbiguousElementTarget,
    #[error("invalid operator: {0}. Use: >, <, >=, <=, ==, !=")]
    InvalidOperator(String),
    #[error("threshold must be a finite number")]
    InvalidThreshold,
    #[error("interval must be at least 1ms")]
    InvalidInterval,
    #[error("no sample source registered for strategy {0}")]
    NoSource(&'static str),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("a {strategy} monitor is already active for task {task_id}")]
    AlreadyActive {
        task_id: String,
        strategy: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("coordinates {point} fall outside viewport {viewport}")]
pub struct CoordinateOutOfBounds {
    pub point: Coordinates,
    pub viewport: Viewport,
}

/// Outcome of the resolver fallback chain once every stage is exhausted.
#[derive(Debug, Clone, Error)]
pub enum LocateError {
    #[error("no action resolver configured")]
    NoResolver,
    #[error("could not locate '{description}' after hybrid, vision and scroll retries")]
    NotFound {
        description: String,
        #[source]
        last_rejected: Option<CoordinateOutOfBounds>,
    },
}

/// Delivery failure inside a notifier adapter. Never leaves the adapter:
/// the notifier contract reports it as `delivered = false`.
#[derive(Debug, Error)]
pub enum NotificationFailure {
    #[error("no recipient configured")]
    NoRecipient,
    #[error("notification endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}
