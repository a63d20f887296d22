//! Command line and environment configuration.

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;

use crate::controller::ControllerSettings;
use crate::seek::SeekSettings;
use crate::types::{StepKind, Viewport};

#[derive(Debug, Clone, Parser)]
#[command(name = "agent", about = "Task orchestration and page monitoring agent")]
pub struct Cli {
    /// Address the HTTP/SSE server listens on.
    #[arg(long, env = "AGENT_BIND", default_value = "127.0.0.1:3000")]
    pub bind: String,

    /// OpenAI-compatible API base URL used for planning.
    #[arg(long, env = "PLANNER_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub planner_url: String,

    #[arg(long, env = "PLANNER_MODEL", default_value = "gpt-5.2")]
    pub planner_model: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub planner_api_key: Option<String>,

    /// Automation bridge that executes steps and samples pages.
    #[arg(long, env = "AUTOMATION_BRIDGE_URL", default_value = "http://127.0.0.1:9333")]
    pub bridge_url: String,

    /// Chat bot webhook for alerts. Alerts are disabled when unset.
    #[arg(long, env = "NOTIFY_URL")]
    pub notify_url: Option<String>,

    #[arg(long, env = "NOTIFY_RECIPIENT")]
    pub notify_recipient: Option<String>,

    #[arg(long, env = "AGENT_MAX_RETRIES", default_value_t = 2)]
    pub max_retries: u32,

    /// Default polling interval for continuous monitors.
    #[arg(long, env = "AGENT_INTERVAL_MS", default_value_t = 2000)]
    pub interval_ms: u64,

    #[arg(long, env = "AGENT_VIEWPORT", default_value = "1920x1080")]
    pub viewport: Viewport,

    /// Step kinds whose failure aborts an attempt.
    #[arg(
        long,
        env = "AGENT_CRITICAL_STEPS",
        value_delimiter = ',',
        default_value = "navigate,wait"
    )]
    pub critical_steps: Vec<StepKind>,

    /// Events kept per task for status queries.
    #[arg(long, env = "AGENT_RECENT_EVENTS", default_value_t = 50)]
    pub recent_events: usize,

    /// Seek results kept per task.
    #[arg(long, env = "AGENT_HISTORY_LIMIT", default_value_t = 500)]
    pub history_limit: usize,

    #[arg(long, env = "AGENT_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    pub request_timeout_secs: u64,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            controller: ControllerSettings {
                critical_steps: self.critical_steps.iter().copied().collect(),
                viewport: self.viewport,
                max_retries: self.max_retries,
                ..ControllerSettings::default()
            },
            seek: SeekSettings {
                default_interval: Duration::from_millis(self.interval_ms.max(1)),
                viewport: self.viewport,
                history_limit: self.history_limit,
            },
            recent_events: self.recent_events,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Everything the orchestration core needs, free of I/O concerns.
#[derive(Debug, Clone)]
pub struct Settings {
    pub controller: ControllerSettings,
    pub seek: SeekSettings,
    pub recent_events: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            controller: ControllerSettings::default(),
            seek: SeekSettings::default(),
            recent_events: 50,
        }
    }
}

impl Settings {
    pub fn critical_steps(&self) -> &HashSet<StepKind> {
        &self.controller.critical_steps
    }
}
