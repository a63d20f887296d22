use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier partitioning all per-task state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random id with a readable prefix, e.g. `seek-1a2b3c4d`.
    pub fn generate(prefix: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", prefix, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How a click-like step addresses its element. Exactly one form is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Selector(String),
    Description(String),
    Coordinates(Coordinates),
}

/// A single atomic action of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Navigate {
        url: String,
    },
    Click {
        target: Target,
    },
    Type {
        target: Target,
        text: String,
    },
    Scroll {
        amount: i32,
    },
    Wait {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Extract {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    VisionLocate {
        description: String,
    },
    Screenshot,
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::Navigate { .. } => StepKind::Navigate,
            StepAction::Click { .. } => StepKind::Click,
            StepAction::Type { .. } => StepKind::Type,
            StepAction::Scroll { .. } => StepKind::Scroll,
            StepAction::Wait { .. } => StepKind::Wait,
            StepAction::Extract { .. } => StepKind::Extract,
            StepAction::VisionLocate { .. } => StepKind::VisionLocate,
            StepAction::Screenshot => StepKind::Screenshot,
        }
    }

    /// Element target of click-like actions.
    pub fn target(&self) -> Option<&Target> {
        match self {
            StepAction::Click { target } | StepAction::Type { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Copy of this action pointed at resolved coordinates instead.
    pub fn at(&self, coordinates: Coordinates) -> StepAction {
        match self {
            StepAction::Click { .. } | StepAction::VisionLocate { .. } => StepAction::Click {
                target: Target::Coordinates(coordinates),
            },
            StepAction::Type { text, .. } => StepAction::Type {
                target: Target::Coordinates(coordinates),
                text: text.clone(),
            },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub action: StepAction,
}

impl Step {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            action,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

/// Discriminant of [`StepAction`], used for the critical-step allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Navigate,
    Click,
    Type,
    Scroll,
    Wait,
    Extract,
    VisionLocate,
    Screenshot,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Navigate => "navigate",
            StepKind::Click => "click",
            StepKind::Type => "type",
            StepKind::Scroll => "scroll",
            StepKind::Wait => "wait",
            StepKind::Extract => "extract",
            StepKind::VisionLocate => "vision_locate",
            StepKind::Screenshot => "screenshot",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "navigate" => Ok(StepKind::Navigate),
            "click" => Ok(StepKind::Click),
            "type" => Ok(StepKind::Type),
            "scroll" => Ok(StepKind::Scroll),
            "wait" => Ok(StepKind::Wait),
            "extract" => Ok(StepKind::Extract),
            "vision_locate" => Ok(StepKind::VisionLocate),
            "screenshot" => Ok(StepKind::Screenshot),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Ordered steps for one task. Never mutated; a replan builds a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    task_id: TaskId,
    steps: Vec<Step>,
    created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(task_id: TaskId, steps: Vec<Step>) -> Self {
        Self {
            task_id,
            steps,
            created_at: Utc::now(),
        }
    }

    /// Degraded one-step plan used when the planner cannot produce one.
    pub fn fallback(task_id: TaskId) -> Self {
        Self::new(
            task_id,
            vec![Step::new(
                "fallback-1",
                StepAction::Navigate {
                    url: "about:blank".to_string(),
                },
            )],
        )
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<serde_json::Value>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<String>, observation: Option<serde_json::Value>) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            error: None,
            observation,
            duration_ms: 0,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            error: Some(error.into()),
            observation: None,
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Reflection memory of one task, owned by the task controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMemory {
    pub task_id: TaskId,
    pub prompt: String,
    pub plan: Plan,
    pub feedback: Vec<StepResult>,
    pub retry_count: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: i64,
    pub y: i64,
}

impl Coordinates {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl Viewport {
    pub fn contains(&self, point: Coordinates) -> bool {
        point.x >= 0 && point.y >= 0 && point.x < self.width as i64 && point.y < self.height as i64
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Viewport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("viewport must look like 1920x1080, got {s}"))?;
        let width = w.trim().parse().map_err(|_| format!("bad viewport width: {w}"))?;
        let height = h.trim().parse().map_err(|_| format!("bad viewport height: {h}"))?;
        if width == 0 || height == 0 {
            return Err("viewport dimensions must be non-zero".to_string());
        }
        Ok(Self { width, height })
    }
}

/// What a resolver gets to look at: the viewport bound and an optional
/// base64 screenshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualContext {
    pub viewport: Viewport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}
