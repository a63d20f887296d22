//! Reflection memory: the plan of the latest attempt and what happened to
//! each of its steps, kept per task so a retry can plan around failures.

use std::fmt::Write as _;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

use crate::types::{Plan, Step, StepResult, TaskId, TaskMemory, TaskStatus};

/// A failed step of the previous attempt, as shown to the planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    pub step: Step,
    pub step_num: usize,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<serde_json::Value>,
}

/// Context handed to the planner on a retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryContext {
    /// 1-based number of the attempt being planned.
    pub attempt: u32,
    pub last_plan: Vec<Step>,
    pub failures: Vec<StepFailure>,
}

impl RetryContext {
    /// Plain-text rendering for prompt-based planners.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Attempt {} of this task. The previous plan had {} steps and failed.\n",
            self.attempt,
            self.last_plan.len()
        );
        for failure in &self.failures {
            let _ = writeln!(
                out,
                "- step {} ({}) failed: {}",
                failure.step_num,
                failure.step.kind(),
                failure.error
            );
        }
        out.push_str("Produce a different plan that avoids these failures.");
        out
    }
}

#[derive(Default)]
pub struct TaskMemoryStore {
    tasks: DashMap<TaskId, TaskMemory>,
}

impl TaskMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh memory for a task, replacing any previous run.
    pub fn begin(&self, task_id: &TaskId, prompt: &str) -> TaskMemory {
        let now = Utc::now();
        let memory = TaskMemory {
            task_id: task_id.clone(),
            prompt: prompt.to_string(),
            plan: Plan::new(task_id.clone(), Vec::new()),
            feedback: Vec::new(),
            retry_count: 0,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(task_id.clone(), memory.clone());
        memory
    }

    /// Install the plan of a new attempt. Feedback always belongs to the
    /// current plan, so it is reset here.
    pub fn record_plan(&self, task_id: &TaskId, plan: Plan) {
        if let Some(mut memory) = self.tasks.get_mut(task_id) {
            memory.plan = plan;
            memory.feedback.clear();
            memory.status = TaskStatus::InProgress;
            memory.updated_at = Utc::now();
        }
    }

    pub fn record_feedback(&self, task_id: &TaskId, result: StepResult) {
        if let Some(mut memory) = self.tasks.get_mut(task_id) {
            memory.feedback.push(result);
            memory.updated_at = Utc::now();
        }
    }

    pub fn increment_retry(&self, task_id: &TaskId) -> u32 {
        match self.tasks.get_mut(task_id) {
            Some(mut memory) => {
                memory.retry_count += 1;
                memory.updated_at = Utc::now();
                memory.retry_count
            }
            None => 0,
        }
    }

    pub fn set_status(&self, task_id: &TaskId, status: TaskStatus) {
        if let Some(mut memory) = self.tasks.get_mut(task_id) {
            memory.status = status;
            memory.updated_at = Utc::now();
        }
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskMemory> {
        self.tasks.get(task_id).map(|m| m.clone())
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|m| m.status)
    }

    pub fn all(&self) -> Vec<TaskMemory> {
        let mut all: Vec<TaskMemory> = self.tasks.iter().map(|m| m.clone()).collect();
        all.sort_by_key(|m| m.created_at);
        all
    }

    pub fn clear(&self, task_id: &TaskId) -> bool {
        self.tasks.remove(task_id).is_some()
    }

    /// Everything that failed in the latest attempt, paired with its step.
    /// `None` until a plan has been recorded.
    pub fn retry_context(&self, task_id: &TaskId) -> Option<RetryContext> {
        let memory = self.tasks.get(task_id)?;
        if memory.plan.is_empty() {
            return None;
        }
        let steps = memory.plan.steps();
        let failures = memory
            .feedback
            .iter()
            .filter(|result| !result.success)
            .filter_map(|result| {
                let index = steps.iter().position(|s| s.id == result.step_id)?;
                Some(StepFailure {
                    step: steps[index].clone(),
                    step_num: index + 1,
                    error: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                    observation: result.observation.clone(),
                })
            })
            .collect();

        Some(RetryContext {
            attempt: memory.retry_count + 1,
            last_plan: steps.to_vec(),
            failures,
        })
    }
}
