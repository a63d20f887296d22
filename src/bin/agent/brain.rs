//! Planner backed by an OpenAI-compatible chat completions endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use seek_agent::error::PlanningError;
use seek_agent::{Plan, PlanRequest, Planner, Step, TaskId};

const SYSTEM_PROMPT: &str = r##"You are a browser automation planner. Turn the user's task into an ordered list of steps for a real browser.

Return ONLY a JSON array. Each element is one step object:
- {"action":"navigate","url":"https://..."}
- {"action":"click","target":{"selector":"#submit"}}
- {"action":"click","target":{"description":"the blue Sign in button"}}
- {"action":"type","target":{"selector":"input[name=q]"},"text":"search query"}
- {"action":"scroll","amount":500}
- {"action":"wait","selector":"#results","timeout_ms":5000}
- {"action":"extract","selector":".price","label":"price"}
- {"action":"vision_locate","description":"the chart legend"}
- {"action":"screenshot"}

Rules:
1. No markdown, no explanation, only the array.
2. Use a CSS selector when you know one, otherwise a short visual description.
3. Keep steps minimal. Do not over-navigate.
4. If a previous attempt failed, do not repeat the failing steps unchanged."##;

pub struct LlmPlanner {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl LlmPlanner {
    pub fn new(client: Client, base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
        }
    }

    fn user_message(request: &PlanRequest) -> String {
        match &request.context {
            Some(context) => format!("Task: {}\n\n{}", request.prompt, context.describe()),
            None => format!("Task: {}", request.prompt),
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, PlanningError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| PlanningError::Request("OPENAI_API_KEY not set".to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": Self::user_message(request)},
                ],
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| PlanningError::Request(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| PlanningError::Request(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(%status, message, "planner API error");
            return Err(PlanningError::Request(format!("{status}: {message}")));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PlanningError::Malformed(format!("no content in response: {body}")))?;
        debug!(task_id = %request.task_id, content, "planner replied");

        parse_plan(&request.task_id, content)
    }
}

/// Parse model output into a plan. Accepts a bare array or `{"steps": [...]}`,
/// optionally wrapped in markdown fences. Missing step ids are filled in.
pub fn parse_plan(task_id: &TaskId, content: &str) -> Result<Plan, PlanningError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: Value =
        serde_json::from_str(cleaned).map_err(|e| PlanningError::Malformed(e.to_string()))?;
    let raw_steps = match value {
        Value::Array(steps) => steps,
        Value::Object(mut object) => match object.remove("steps") {
            Some(Value::Array(steps)) => steps,
            _ => return Err(PlanningError::Malformed("expected a steps array".to_string())),
        },
        _ => return Err(PlanningError::Malformed("expected a JSON array".to_string())),
    };

    let steps = raw_steps
        .into_iter()
        .enumerate()
        .map(|(index, mut raw)| {
            if let Value::Object(object) = &mut raw {
                object
                    .entry("id")
                    .or_insert_with(|| Value::String(format!("step-{}", index + 1)));
            }
            serde_json::from_value::<Step>(raw)
                .map_err(|e| PlanningError::Malformed(format!("step {}: {e}", index + 1)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if steps.is_empty() {
        return Err(PlanningError::Empty);
    }
    Ok(Plan::new(task_id.clone(), steps))
}
