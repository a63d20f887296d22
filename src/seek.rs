//! Seek/monitor engine.
//!
//! Each monitor is one cooperative loop keyed by task id and strategy:
//! sample, evaluate, emit, sleep, repeat until cancelled. Stopping flips a
//! cancellation token that the loop checks at iteration boundaries; an
//! in-flight sample is never interrupted, so cancellation latency is bounded
//! by one sample call.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{Notification, Notifier, SampleSource};
use crate::error::{ConfigError, StartError};
use crate::events::SeekEvent;
use crate::hub::Publisher;
use crate::threshold::{Operator, ThresholdTracker, TrackedState, extract_numeric};
use crate::types::{Coordinates, Target, TaskId, Viewport};

const STOCK_KEYWORDS: &[&str] = &[
    "rsi",
    "macd",
    "sma",
    "ema",
    "resistance",
    "support",
    "breakout",
    "chart",
    "technical",
    "price",
    "volume",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TextExists,
    ElementExists,
    VisionLocate,
    DomValue,
    StockChart,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::TextExists,
        StrategyKind::ElementExists,
        StrategyKind::VisionLocate,
        StrategyKind::DomValue,
        StrategyKind::StockChart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::TextExists => "text_exists",
            StrategyKind::ElementExists => "element_exists",
            StrategyKind::VisionLocate => "vision_locate",
            StrategyKind::DomValue => "dom_value",
            StrategyKind::StockChart => "stock_chart",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitor request as a caller sends it. Checked once by
/// [`MonitorSpec::validate`] before any loop starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSpec {
    #[serde(flatten)]
    pub strategy: StrategySpec,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Recipient for alerts raised by this monitor.
    #[serde(default)]
    pub notify: Option<String>,
    /// Screenshot to analyse instead of capturing a fresh one.
    #[serde(default)]
    pub screenshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategySpec {
    TextExists {
        query: String,
    },
    ElementExists {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    VisionLocate {
        description: String,
    },
    DomValue {
        selector: String,
        threshold: f64,
        operator: String,
    },
    StockChart {
        analysis_prompt: String,
        #[serde(default)]
        symbol: Option<String>,
    },
}

impl StrategySpec {
    /// Guess a strategy for a bare query.
    pub fn infer(query: &str, has_screenshot: bool) -> Self {
        let lowered = query.to_lowercase();
        if STOCK_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            StrategySpec::StockChart {
                analysis_prompt: query.to_string(),
                symbol: None,
            }
        } else if query.contains(['#', '.', '[', '>']) {
            StrategySpec::ElementExists {
                selector: Some(query.to_string()),
                description: None,
            }
        } else if has_screenshot && query.split_whitespace().count() > 2 {
            StrategySpec::VisionLocate {
                description: query.to_string(),
            }
        } else {
            StrategySpec::TextExists {
                query: query.to_string(),
            }
        }
    }
}

fn non_empty(value: &str, field: &'static str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ConfigError::EmptyField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

impl MonitorSpec {
    pub fn validate(
        &self,
        task_id: &TaskId,
        default_interval: Duration,
    ) -> Result<MonitorConfig, ConfigError> {
        let probe = match &self.strategy {
            StrategySpec::TextExists { query } => Probe::TextExists {
                query: non_empty(query, "query")?,
            },
            StrategySpec::ElementExists {
                selector,
                description,
            } => {
                let selector = selector.as_deref().map(str::trim).filter(|s| !s.is_empty());
                let description = description
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                let target = match (selector, description) {
                    (Some(s), None) => Target::Selector(s.to_string()),
                    (None, Some(d)) => Target::Description(d.to_string()),
                    _ => return Err(ConfigError::AmbiguousElementTarget),
                };
                Probe::ElementExists { target }
            }
            StrategySpec::VisionLocate { description } => Probe::VisionLocate {
                description: non_empty(description, "description")?,
                screenshot: self.screenshot.clone(),
            },
            StrategySpec::DomValue {
                selector,
                threshold,
                operator,
            } => {
                if !threshold.is_finite() {
                    return Err(ConfigError::InvalidThreshold);
                }
                Probe::DomValue {
                    selector: non_empty(selector, "selector")?,
                    threshold: *threshold,
                    operator: operator.parse()?,
                }
            }
            StrategySpec::StockChart {
                analysis_prompt,
                symbol,
            } => Probe::StockChart {
                analysis_prompt: non_empty(analysis_prompt, "analysis_prompt")?,
                symbol: symbol.clone(),
                screenshot: self.screenshot.clone(),
            },
        };

        let interval = match self.interval_ms {
            Some(0) => return Err(ConfigError::InvalidInterval),
            Some(ms) => Duration::from_millis(ms),
            None => default_interval,
        };

        Ok(MonitorConfig {
            task_id: task_id.clone(),
            probe,
            continuous: self.continuous,
            interval,
            notify: self.notify.clone().filter(|r| !r.trim().is_empty()),
        })
    }
}

/// Validated description of what a sample source should look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Probe {
    TextExists {
        query: String,
    },
    ElementExists {
        target: Target,
    },
    VisionLocate {
        description: String,
        screenshot: Option<String>,
    },
    DomValue {
        selector: String,
        threshold: f64,
        operator: Operator,
    },
    StockChart {
        analysis_prompt: String,
        symbol: Option<String>,
        screenshot: Option<String>,
    },
}

impl Probe {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Probe::TextExists { .. } => StrategyKind::TextExists,
            Probe::ElementExists { .. } => StrategyKind::ElementExists,
            Probe::VisionLocate { .. } => StrategyKind::VisionLocate,
            Probe::DomValue { .. } => StrategyKind::DomValue,
            Probe::StockChart { .. } => StrategyKind::StockChart,
        }
    }

    pub fn screenshot(&self) -> Option<&str> {
        match self {
            Probe::VisionLocate { screenshot, .. } | Probe::StockChart { screenshot, .. } => {
                screenshot.as_deref()
            }
            _ => None,
        }
    }

    /// The same probe looking at `latest` instead of its configured image.
    /// Strategies that take no screenshot are returned unchanged.
    pub fn with_screenshot(&self, latest: &str) -> Probe {
        let mut probe = self.clone();
        if let Probe::VisionLocate { screenshot, .. } | Probe::StockChart { screenshot, .. } =
            &mut probe
        {
            *screenshot = Some(latest.to_string());
        }
        probe
    }

    /// Human readable target, used in events and alerts.
    pub fn describe(&self) -> String {
        match self {
            Probe::TextExists { query } => query.clone(),
            Probe::ElementExists { target } => match target {
                Target::Selector(s) | Target::Description(s) => s.clone(),
                Target::Coordinates(c) => c.to_string(),
            },
            Probe::VisionLocate { description, .. } => description.clone(),
            Probe::DomValue {
                selector,
                threshold,
                operator,
            } => format!("{selector} {operator} {threshold}"),
            Probe::StockChart {
                analysis_prompt,
                symbol,
                ..
            } => match symbol {
                Some(symbol) => format!("{symbol}: {analysis_prompt}"),
                None => analysis_prompt.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorConfig {
    pub task_id: TaskId,
    pub probe: Probe,
    pub continuous: bool,
    #[serde(with = "millis")]
    pub interval: Duration,
    pub notify: Option<String>,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// What a sample source saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Presence {
        found: bool,
        #[serde(default)]
        coordinates: Option<Coordinates>,
        #[serde(default)]
        text: Option<String>,
    },
    Numeric {
        #[serde(default)]
        value: Option<f64>,
        #[serde(default)]
        text: Option<String>,
    },
    Chart {
        signal_triggered: bool,
        summary: String,
        #[serde(default)]
        screenshot: Option<String>,
    },
}

/// One positive finding kept in a task's seek history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeekRecord {
    pub timestamp: DateTime<Utc>,
    pub strategy: StrategyKind,
    pub found: bool,
    pub value: Option<f64>,
    pub text: Option<String>,
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MonitorKey {
    pub task_id: TaskId,
    pub strategy: StrategyKind,
}

/// Tracker state belongs to one run of a monitor, never to a later restart
/// under the same key.
type RunKey = (MonitorKey, u64);

struct ActiveMonitor {
    generation: u64,
    cancel: CancellationToken,
}

/// Latest screenshot pushed to a running monitor, tagged with the run it was
/// pushed to.
struct PushedScreenshot {
    generation: u64,
    image: String,
}

#[derive(Debug, Clone)]
pub struct SeekSettings {
    pub default_interval: Duration,
    pub viewport: Viewport,
    pub history_limit: usize,
}

impl Default for SeekSettings {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(2),
            viewport: Viewport::default(),
            history_limit: 500,
        }
    }
}

/// A started monitor. Awaiting it yields the number of samples taken.
#[derive(Debug)]
pub struct MonitorHandle {
    pub key: MonitorKey,
    join: JoinHandle<u64>,
}

impl MonitorHandle {
    pub async fn finished(self) -> u64 {
        match self.join.await {
            Ok(samples) => samples,
            Err(err) => {
                warn!(task_id = %self.key.task_id, error = %err, "monitor task aborted");
                0
            }
        }
    }
}

pub struct SeekEngine {
    publisher: Publisher,
    sources: HashMap<StrategyKind, Arc<dyn SampleSource>>,
    notifier: Option<Arc<dyn Notifier>>,
    settings: SeekSettings,
    active: DashMap<MonitorKey, ActiveMonitor>,
    tracker: ThresholdTracker<RunKey>,
    history: DashMap<TaskId, VecDeque<SeekRecord>>,
    screenshots: DashMap<MonitorKey, PushedScreenshot>,
    generation: AtomicU64,
}

impl SeekEngine {
    pub fn new(publisher: Publisher, settings: SeekSettings) -> Self {
        Self {
            publisher,
            sources: HashMap::new(),
            notifier: None,
            settings,
            active: DashMap::new(),
            tracker: ThresholdTracker::new(),
            history: DashMap::new(),
            screenshots: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_source(mut self, strategy: StrategyKind, source: Arc<dyn SampleSource>) -> Self {
        self.sources.insert(strategy, source);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate and launch a monitor loop. Invalid configurations emit an
    /// `error` event and never start.
    pub fn start(
        self: &Arc<Self>,
        task_id: &TaskId,
        spec: &MonitorSpec,
    ) -> Result<MonitorHandle, StartError> {
        let (config, source) = match self.prepare(task_id, spec) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "rejected monitor configuration");
                self.publisher.emit(
                    task_id,
                    SeekEvent::Error {
                        message: err.to_string(),
                    },
                );
                return Err(err.into());
            }
        };

        let strategy = config.probe.kind();
        let key = MonitorKey {
            task_id: task_id.clone(),
            strategy,
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let registered = match self.active.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ActiveMonitor {
                    generation,
                    cancel: cancel.clone(),
                });
                true
            }
        };
        if !registered {
            let err = StartError::AlreadyActive {
                task_id: task_id.to_string(),
                strategy: strategy.as_str(),
            };
            self.publisher.emit(
                task_id,
                SeekEvent::Error {
                    message: err.to_string(),
                },
            );
            return Err(err);
        }

        info!(
            task_id = %task_id,
            strategy = %strategy,
            continuous = config.continuous,
            "starting monitor"
        );
        self.publisher.emit(
            task_id,
            SeekEvent::Started {
                strategy,
                target: config.probe.describe(),
                continuous: config.continuous,
                interval_ms: config.interval.as_millis() as u64,
            },
        );

        let engine = Arc::clone(self);
        let loop_key = key.clone();
        let join = tokio::spawn(async move {
            engine
                .run_loop(loop_key, config, source, cancel, generation)
                .await
        });

        Ok(MonitorHandle { key, join })
    }

    fn prepare(
        &self,
        task_id: &TaskId,
        spec: &MonitorSpec,
    ) -> Result<(MonitorConfig, Arc<dyn SampleSource>), ConfigError> {
        let config = spec.validate(task_id, self.settings.default_interval)?;
        let strategy = config.probe.kind();
        let source = self
            .sources
            .get(&strategy)
            .cloned()
            .ok_or(ConfigError::NoSource(strategy.as_str()))?;
        Ok((config, source))
    }

    async fn run_loop(
        self: Arc<Self>,
        key: MonitorKey,
        config: MonitorConfig,
        source: Arc<dyn SampleSource>,
        cancel: CancellationToken,
        generation: u64,
    ) -> u64 {
        let run_key: RunKey = (key.clone(), generation);
        let mut samples = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            samples += 1;

            let probe = self.current_probe(&key, generation, &config.probe);
            if matches!(probe, Probe::StockChart { screenshot: None, .. }) {
                self.publisher.emit(
                    &key.task_id,
                    SeekEvent::ScreenshotNeeded {
                        strategy: key.strategy,
                    },
                );
            }

            match source.sample(&key.task_id, &probe).await {
                Ok(observation) => {
                    self.handle_observation(&run_key, &config, &probe, observation)
                        .await
                }
                Err(err) => {
                    warn!(task_id = %key.task_id, strategy = %key.strategy, error = %err, "sample failed");
                    self.publisher.emit(
                        &key.task_id,
                        SeekEvent::Error {
                            message: err.to_string(),
                        },
                    );
                }
            }

            if !config.continuous {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.interval) => {}
            }
        }

        self.tracker.forget(&run_key);
        info!(task_id = %key.task_id, strategy = %key.strategy, samples, "monitor stopped");
        // `stopped` goes out while the slot is still held, so a restart's
        // `started` can only follow it.
        let released = self.active.remove_if(&key, |_, monitor| {
            if monitor.generation != generation {
                return false;
            }
            self.publisher
                .emit(&key.task_id, SeekEvent::Stopped { samples });
            true
        });
        if released.is_none() {
            self.publisher
                .emit(&key.task_id, SeekEvent::Stopped { samples });
        }
        self.screenshots
            .remove_if(&key, |_, pushed| pushed.generation == generation);
        samples
    }

    fn current_probe(&self, key: &MonitorKey, generation: u64, configured: &Probe) -> Probe {
        match self.screenshots.get(key) {
            Some(pushed) if pushed.generation == generation => {
                configured.with_screenshot(&pushed.image)
            }
            _ => configured.clone(),
        }
    }

    async fn handle_observation(
        &self,
        run_key: &RunKey,
        config: &MonitorConfig,
        probe: &Probe,
        observation: Observation,
    ) {
        let task_id = &config.task_id;
        let strategy = probe.kind();

        match observation {
            Observation::Presence {
                found,
                coordinates,
                text,
            } => {
                if let Some(point) = coordinates {
                    if !self.settings.viewport.contains(point) {
                        debug!(task_id = %task_id, %point, "sampled coordinates out of bounds");
                        self.publisher.emit(
                            task_id,
                            SeekEvent::NotFound {
                                strategy,
                                target: probe.describe(),
                            },
                        );
                        return;
                    }
                }

                if !found {
                    self.publisher.emit(
                        task_id,
                        SeekEvent::NotFound {
                            strategy,
                            target: probe.describe(),
                        },
                    );
                    return;
                }

                self.record(
                    task_id,
                    SeekRecord {
                        timestamp: Utc::now(),
                        strategy,
                        found: true,
                        value: None,
                        text: text.clone(),
                        coordinates,
                    },
                );
                self.publisher.emit(
                    task_id,
                    SeekEvent::Sample {
                        strategy,
                        found: true,
                        value: None,
                        text,
                        coordinates,
                        condition_met: None,
                    },
                );
            }
            Observation::Numeric { value, text } => {
                let Some(value) = value
                    .filter(|v| v.is_finite())
                    .or_else(|| text.as_deref().and_then(extract_numeric))
                else {
                    debug!(task_id = %task_id, ?text, "sample carried no numeric value");
                    self.publisher.emit(
                        task_id,
                        SeekEvent::NotFound {
                            strategy,
                            target: probe.describe(),
                        },
                    );
                    return;
                };

                let evaluated = match probe {
                    Probe::DomValue {
                        threshold,
                        operator,
                        ..
                    } => Some((
                        self.tracker.check(run_key, Some(value), *threshold, *operator),
                        *threshold,
                        *operator,
                    )),
                    _ => None,
                };

                self.record(
                    task_id,
                    SeekRecord {
                        timestamp: Utc::now(),
                        strategy,
                        found: true,
                        value: Some(value),
                        text: text.clone(),
                        coordinates: None,
                    },
                );
                self.publisher.emit(
                    task_id,
                    SeekEvent::Sample {
                        strategy,
                        found: true,
                        value: Some(value),
                        text,
                        coordinates: None,
                        condition_met: evaluated.map(|(crossing, _, _)| crossing.condition_met),
                    },
                );

                if let Some((crossing, threshold, operator)) = evaluated {
                    if crossing.is_new_crossing {
                        let message = format!(
                            "{} is {} (threshold {} {})",
                            probe.describe(),
                            value,
                            operator,
                            threshold
                        );
                        info!(task_id = %task_id, value, threshold, %operator, "threshold crossed");
                        let notified = self.notify(config, &message, None).await;
                        self.publisher.emit(
                            task_id,
                            SeekEvent::Crossed {
                                value,
                                threshold,
                                operator,
                                message,
                                notified,
                            },
                        );
                    }
                }
            }
            Observation::Chart {
                signal_triggered,
                summary,
                screenshot,
            } => {
                let crossing = self.tracker.observe(run_key, signal_triggered);
                self.record(
                    task_id,
                    SeekRecord {
                        timestamp: Utc::now(),
                        strategy,
                        found: true,
                        value: None,
                        text: Some(summary.clone()),
                        coordinates: None,
                    },
                );
                self.publisher.emit(
                    task_id,
                    SeekEvent::Sample {
                        strategy,
                        found: true,
                        value: None,
                        text: Some(summary.clone()),
                        coordinates: None,
                        condition_met: Some(signal_triggered),
                    },
                );

                if crossing.is_new_crossing {
                    let message = format!(
                        "Signal triggered for {}\n{}\n{}",
                        probe.describe(),
                        summary,
                        Utc::now().format("%H:%M:%S")
                    );
                    info!(task_id = %task_id, "chart signal triggered");
                    let attachment = screenshot.or_else(|| probe.screenshot().map(str::to_string));
                    let notified = self.notify(config, &message, attachment).await;
                    self.publisher
                        .emit(task_id, SeekEvent::Signal { summary, notified });
                }
            }
        }
    }

    async fn notify(
        &self,
        config: &MonitorConfig,
        message: &str,
        attachment: Option<String>,
    ) -> Option<bool> {
        let notifier = self.notifier.as_ref()?;
        let delivered = notifier
            .send(&Notification {
                recipient: config.notify.clone(),
                message: message.to_string(),
                attachment,
            })
            .await;
        if !delivered {
            warn!(task_id = %config.task_id, "alert was not delivered");
        }
        Some(delivered)
    }

    fn record(&self, task_id: &TaskId, record: SeekRecord) {
        let mut history = self.history.entry(task_id.clone()).or_default();
        while history.len() >= self.settings.history_limit.max(1) {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Signal every monitor of a task. True if any was running and not
    /// already stopping.
    ///
    /// A stopped monitor keeps its slot until its loop has emitted
    /// `stopped`, so a restart under the same key is refused until then.
    pub fn stop(&self, task_id: &TaskId) -> bool {
        let mut found = false;
        for monitor in self.active.iter() {
            if &monitor.key().task_id == task_id && !monitor.cancel.is_cancelled() {
                monitor.cancel.cancel();
                found = true;
            }
        }
        if found {
            info!(task_id = %task_id, "stop requested");
        }
        found
    }

    /// Signal one strategy's monitor of a task, leaving the others running.
    pub fn stop_strategy(&self, task_id: &TaskId, strategy: StrategyKind) -> bool {
        let key = MonitorKey {
            task_id: task_id.clone(),
            strategy,
        };
        match self.active.get(&key) {
            Some(monitor) if !monitor.cancel.is_cancelled() => {
                monitor.cancel.cancel();
                info!(task_id = %task_id, %strategy, "stop requested");
                true
            }
            _ => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for monitor in self.active.iter() {
            if !monitor.cancel.is_cancelled() {
                monitor.cancel.cancel();
                stopped += 1;
            }
        }
        stopped
    }

    /// Replace the screenshot that the task's running vision and chart
    /// monitors send with each sample. False when neither is running.
    pub fn update_screenshot(&self, task_id: &TaskId, screenshot: String) -> bool {
        let mut updated = false;
        for strategy in [StrategyKind::VisionLocate, StrategyKind::StockChart] {
            let key = MonitorKey {
                task_id: task_id.clone(),
                strategy,
            };
            // Holding the slot keeps the loop from exiting between the check
            // and the insert.
            let Some(monitor) = self.active.get(&key) else {
                continue;
            };
            if monitor.cancel.is_cancelled() {
                continue;
            }
            self.screenshots.insert(
                key,
                PushedScreenshot {
                    generation: monitor.generation,
                    image: screenshot.clone(),
                },
            );
            updated = true;
        }
        if updated {
            debug!(task_id = %task_id, bytes = screenshot.len(), "screenshot updated");
        }
        updated
    }

    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.active.iter().any(|entry| &entry.key().task_id == task_id)
    }

    pub fn active_monitors(&self) -> Vec<MonitorKey> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Last value and crossed flag of a running monitor.
    pub fn monitor_state(&self, task_id: &TaskId, strategy: StrategyKind) -> Option<TrackedState> {
        let key = MonitorKey {
            task_id: task_id.clone(),
            strategy,
        };
        let generation = self.active.get(&key)?.generation;
        self.tracker.state(&(key, generation))
    }

    pub fn history(&self, task_id: &TaskId) -> Vec<SeekRecord> {
        self.history
            .get(task_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_history(&self, task_id: &TaskId) -> bool {
        self.history.remove(task_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::events::AgentEvent;
    use crate::hub::{EventHub, RecentEvents};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Scripted {
        script: Mutex<VecDeque<Result<Observation, CollaboratorError>>>,
        fallback: Observation,
    }

    impl Scripted {
        fn new(script: Vec<Result<Observation, CollaboratorError>>, fallback: Observation) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
            })
        }
    }

    #[async_trait]
    impl SampleSource for Scripted {
        async fn sample(
            &self,
            _task_id: &TaskId,
            _probe: &Probe,
        ) -> Result<Observation, CollaboratorError> {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> bool {
            self.sent.lock().unwrap().push(notification.clone());
            false
        }
    }

    fn numeric(value: f64) -> Result<Observation, CollaboratorError> {
        Ok(Observation::Numeric {
            value: Some(value),
            text: None,
        })
    }

    fn no_value() -> Observation {
        Observation::Numeric {
            value: None,
            text: Some("--".into()),
        }
    }

    fn engine_with(kind: StrategyKind, source: Arc<dyn SampleSource>) -> (Arc<SeekEngine>, Arc<EventHub>) {
        let hub = Arc::new(EventHub::new());
        let publisher = Publisher::new(hub.clone(), Arc::new(RecentEvents::new(16)));
        let engine = SeekEngine::new(publisher, SeekSettings::default()).with_source(kind, source);
        (Arc::new(engine), hub)
    }

    fn dom_spec(threshold: f64, operator: &str, continuous: bool) -> MonitorSpec {
        MonitorSpec {
            strategy: StrategySpec::DomValue {
                selector: ".change span".into(),
                threshold,
                operator: operator.into(),
            },
            continuous,
            interval_ms: Some(1_000),
            notify: None,
            screenshot: None,
        }
    }

    async fn next(rx: &mut UnboundedReceiver<AgentEvent>) -> SeekEvent {
        rx.recv()
            .await
            .and_then(|e| e.as_seek().cloned())
            .expect("seek event")
    }

    #[tokio::test]
    async fn invalid_operator_is_rejected_before_the_loop_starts() {
        let (engine, hub) = engine_with(StrategyKind::DomValue, Scripted::new(vec![], no_value()));
        let task = TaskId::from("bad-op");
        let mut sub = hub.subscribe(&task);

        let err = engine.start(&task, &dom_spec(1.0, "=>", true)).unwrap_err();

        assert_eq!(err, StartError::Config(ConfigError::InvalidOperator("=>".into())));
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Error { .. }));
        assert!(sub.receiver.try_recv().is_err());
        assert!(!engine.is_active(&task));
    }

    #[tokio::test]
    async fn missing_source_is_a_configuration_error() {
        let (engine, _hub) = engine_with(StrategyKind::TextExists, Scripted::new(vec![], no_value()));
        let err = engine
            .start(&TaskId::from("t"), &dom_spec(1.0, ">", false))
            .unwrap_err();
        assert_eq!(err, StartError::Config(ConfigError::NoSource("dom_value")));
    }

    #[tokio::test]
    async fn one_shot_monitor_samples_once_then_stops() {
        let source = Scripted::new(
            vec![Ok(Observation::Presence {
                found: true,
                coordinates: Some(Coordinates::new(100, 200)),
                text: None,
            })],
            no_value(),
        );
        let (engine, hub) = engine_with(StrategyKind::ElementExists, source);
        let task = TaskId::from("once");
        let mut sub = hub.subscribe(&task);
        let spec = MonitorSpec {
            strategy: StrategySpec::ElementExists {
                selector: Some("#buy".into()),
                description: None,
            },
            continuous: false,
            interval_ms: None,
            notify: None,
            screenshot: None,
        };

        let handle = engine.start(&task, &spec).unwrap();
        assert_eq!(handle.finished().await, 1);

        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Started { .. }));
        assert!(matches!(
            next(&mut sub.receiver).await,
            SeekEvent::Sample { found: true, .. }
        ));
        assert_eq!(next(&mut sub.receiver).await, SeekEvent::Stopped { samples: 1 });
        assert!(!engine.is_active(&task));
        assert_eq!(engine.history(&task).len(), 1);
        assert!(engine.clear_history(&task));
        assert!(engine.history(&task).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_monitor_fires_only_on_new_crossings() {
        let script = [-1.0, -4.0, -5.0, -2.0, -6.0].map(numeric).to_vec();
        let (engine, hub) = engine_with(StrategyKind::DomValue, Scripted::new(script, no_value()));
        let task = TaskId::from("drop");
        let mut sub = hub.subscribe(&task);

        engine.start(&task, &dom_spec(-3.0, "<", true)).unwrap();

        let mut samples = 0;
        let mut crossed = Vec::new();
        while samples < 5 {
            match next(&mut sub.receiver).await {
                SeekEvent::Sample { .. } => samples += 1,
                SeekEvent::Crossed { value, .. } => crossed.push(value),
                _ => {}
            }
        }
        let state = engine.monitor_state(&task, StrategyKind::DomValue).unwrap();
        assert_eq!(state.last_value, Some(-6.0));
        assert!(state.crossed);

        assert!(engine.stop(&task));
        assert!(!engine.stop(&task));

        loop {
            match next(&mut sub.receiver).await {
                SeekEvent::Crossed { value, .. } => crossed.push(value),
                SeekEvent::Stopped { samples } => {
                    assert_eq!(samples, 5);
                    break;
                }
                SeekEvent::Sample { .. } => panic!("sampled after stop"),
                _ => {}
            }
        }
        assert_eq!(crossed, vec![-4.0, -6.0]);
        assert!(engine.monitor_state(&task, StrategyKind::DomValue).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sample_failures_do_not_end_a_continuous_monitor() {
        let script = vec![
            Err(CollaboratorError::Timeout {
                collaborator: "dom",
                timeout_ms: 500,
            }),
            Ok(Observation::Numeric {
                value: None,
                text: Some("+7.5%".into()),
            }),
        ];
        let (engine, hub) = engine_with(StrategyKind::DomValue, Scripted::new(script, no_value()));
        let task = TaskId::from("flaky");
        let mut sub = hub.subscribe(&task);

        engine.start(&task, &dom_spec(5.0, ">", true)).unwrap();

        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Started { .. }));
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Error { .. }));
        assert_eq!(
            next(&mut sub.receiver).await,
            SeekEvent::Sample {
                strategy: StrategyKind::DomValue,
                found: true,
                value: Some(7.5),
                text: Some("+7.5%".into()),
                coordinates: None,
                condition_met: Some(true),
            }
        );
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Crossed { notified: None, .. }));

        engine.stop(&task);
        loop {
            if let SeekEvent::Stopped { .. } = next(&mut sub.receiver).await {
                break;
            }
        }
    }

    #[tokio::test]
    async fn out_of_bounds_vision_hit_counts_as_not_found() {
        let source = Scripted::new(
            vec![Ok(Observation::Presence {
                found: true,
                coordinates: Some(Coordinates::new(5000, 5000)),
                text: None,
            })],
            no_value(),
        );
        let (engine, hub) = engine_with(StrategyKind::VisionLocate, source);
        let task = TaskId::from("vision");
        let mut sub = hub.subscribe(&task);
        let spec = MonitorSpec {
            strategy: StrategySpec::VisionLocate {
                description: "subscribe button".into(),
            },
            continuous: false,
            interval_ms: None,
            notify: None,
            screenshot: None,
        };

        engine.start(&task, &spec).unwrap().finished().await;

        next(&mut sub.receiver).await;
        assert_eq!(
            next(&mut sub.receiver).await,
            SeekEvent::NotFound {
                strategy: StrategyKind::VisionLocate,
                target: "subscribe button".into()
            }
        );
        assert!(engine.history(&task).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn chart_signal_alerts_once_per_edge() {
        let chart = |signal: bool| {
            Ok(Observation::Chart {
                signal_triggered: signal,
                summary: String::from(if signal { "RSI 28" } else { "RSI 45" }),
                screenshot: Some("png".into()),
            })
        };
        let script = vec![chart(true), chart(true), chart(false), chart(true)];
        let source = Scripted::new(
            script,
            Observation::Chart {
                signal_triggered: true,
                summary: "RSI 20".into(),
                screenshot: None,
            },
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let hub = Arc::new(EventHub::new());
        let publisher = Publisher::new(hub.clone(), Arc::new(RecentEvents::new(16)));
        let engine = Arc::new(
            SeekEngine::new(publisher, SeekSettings::default())
                .with_source(StrategyKind::StockChart, source)
                .with_notifier(notifier.clone()),
        );
        let task = TaskId::from("chart");
        let mut sub = hub.subscribe(&task);
        let spec = MonitorSpec {
            strategy: StrategySpec::StockChart {
                analysis_prompt: "RSI below 30".into(),
                symbol: Some("TSLA".into()),
            },
            continuous: true,
            interval_ms: Some(10_000),
            notify: Some("+15550100".into()),
            screenshot: None,
        };

        engine.start(&task, &spec).unwrap();

        let mut samples = 0;
        let mut signals = Vec::new();
        while samples < 4 {
            match next(&mut sub.receiver).await {
                SeekEvent::Sample { .. } => samples += 1,
                SeekEvent::Signal { notified, .. } => signals.push(notified),
                _ => {}
            }
        }
        engine.stop(&task);
        loop {
            match next(&mut sub.receiver).await {
                SeekEvent::Signal { notified, .. } => signals.push(notified),
                SeekEvent::Stopped { .. } => break,
                _ => {}
            }
        }

        assert_eq!(signals, vec![Some(false), Some(false)]);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].recipient.as_deref(), Some("+15550100"));
        assert_eq!(sent[0].attachment.as_deref(), Some("png"));
        assert!(sent[0].message.contains("TSLA"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_is_refused_and_stop_is_idempotent() {
        let (engine, _hub) = engine_with(StrategyKind::DomValue, Scripted::new(vec![], no_value()));
        let task = TaskId::from("dup");

        let handle = engine.start(&task, &dom_spec(1.0, ">", true)).unwrap();
        let err = engine.start(&task, &dom_spec(1.0, ">", true)).unwrap_err();
        assert!(matches!(err, StartError::AlreadyActive { .. }));

        assert!(engine.stop(&task));
        assert!(!engine.stop(&task));
        handle.finished().await;
        assert!(!engine.is_active(&task));

        // The key is free again once stopped.
        let restarted = engine.start(&task, &dom_spec(1.0, ">", false)).unwrap();
        restarted.finished().await;
    }

    #[tokio::test]
    async fn numeric_sample_without_a_value_is_not_found() {
        let (engine, hub) = engine_with(StrategyKind::DomValue, Scripted::new(vec![], no_value()));
        let task = TaskId::from("dash");
        let mut sub = hub.subscribe(&task);

        engine
            .start(&task, &dom_spec(1.0, ">", false))
            .unwrap()
            .finished()
            .await;

        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Started { .. }));
        assert!(matches!(
            next(&mut sub.receiver).await,
            SeekEvent::NotFound {
                strategy: StrategyKind::DomValue,
                ..
            }
        ));
        assert_eq!(next(&mut sub.receiver).await, SeekEvent::Stopped { samples: 1 });
        assert!(engine.history(&task).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_waits_for_the_old_loop() {
        let (engine, hub) = engine_with(StrategyKind::DomValue, Scripted::new(vec![], no_value()));
        let task = TaskId::from("again");
        let mut sub = hub.subscribe(&task);

        let first = engine.start(&task, &dom_spec(1.0, ">", true)).unwrap();
        assert!(engine.stop(&task));
        assert!(engine.is_active(&task));
        let err = engine.start(&task, &dom_spec(1.0, ">", true)).unwrap_err();
        assert!(matches!(err, StartError::AlreadyActive { .. }));

        first.finished().await;
        let second = engine.start(&task, &dom_spec(1.0, ">", true)).unwrap();

        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Started { .. }));
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Error { .. }));
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Stopped { .. }));
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Started { .. }));

        assert!(engine.stop(&task));
        second.finished().await;
        assert!(!engine.is_active(&task));
    }

    /// Remembers the screenshot each sample was asked to look at.
    #[derive(Default)]
    struct SeenScreenshots {
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl SampleSource for SeenScreenshots {
        async fn sample(&self, _: &TaskId, probe: &Probe) -> Result<Observation, CollaboratorError> {
            self.seen
                .lock()
                .unwrap()
                .push(probe.screenshot().map(str::to_string));
            Ok(Observation::Chart {
                signal_triggered: false,
                summary: "flat".into(),
                screenshot: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_screenshot_reaches_the_next_sample() {
        let source = Arc::new(SeenScreenshots::default());
        let (engine, hub) = engine_with(StrategyKind::StockChart, source.clone());
        let task = TaskId::from("live-chart");
        let mut sub = hub.subscribe(&task);
        let spec = MonitorSpec {
            strategy: StrategySpec::StockChart {
                analysis_prompt: "MACD crosses signal".into(),
                symbol: None,
            },
            continuous: true,
            interval_ms: Some(5_000),
            notify: None,
            screenshot: None,
        };

        assert!(!engine.update_screenshot(&task, "early".into()));
        let handle = engine.start(&task, &spec).unwrap();

        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Started { .. }));
        assert_eq!(
            next(&mut sub.receiver).await,
            SeekEvent::ScreenshotNeeded {
                strategy: StrategyKind::StockChart
            }
        );
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Sample { .. }));

        assert!(engine.update_screenshot(&task, "fresh".into()));
        assert!(!engine.update_screenshot(&TaskId::from("other"), "fresh".into()));
        // With a screenshot in place the next poll asks for nothing.
        assert!(matches!(next(&mut sub.receiver).await, SeekEvent::Sample { .. }));

        assert!(engine.stop(&task));
        handle.finished().await;
        assert_eq!(
            *source.seen.lock().unwrap(),
            vec![None, Some("fresh".to_string())]
        );
        assert!(!engine.update_screenshot(&task, "late".into()));
        assert!(engine.screenshots.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_strategy_leaves_other_monitors_of_the_task_running() {
        let hub = Arc::new(EventHub::new());
        let publisher = Publisher::new(hub.clone(), Arc::new(RecentEvents::new(16)));
        let engine = Arc::new(
            SeekEngine::new(publisher, SeekSettings::default())
                .with_source(StrategyKind::DomValue, Scripted::new(vec![], no_value()))
                .with_source(StrategyKind::TextExists, Scripted::new(vec![], no_value())),
        );
        let task = TaskId::from("pair");
        let dom = engine.start(&task, &dom_spec(1.0, ">", true)).unwrap();
        let text = engine
            .start(
                &task,
                &MonitorSpec {
                    strategy: StrategySpec::TextExists {
                        query: "Sold out".into(),
                    },
                    continuous: true,
                    interval_ms: Some(1_000),
                    notify: None,
                    screenshot: None,
                },
            )
            .unwrap();

        assert!(engine.stop_strategy(&task, StrategyKind::DomValue));
        assert!(!engine.stop_strategy(&task, StrategyKind::DomValue));
        assert!(!engine.stop_strategy(&task, StrategyKind::StockChart));
        dom.finished().await;
        assert_eq!(
            engine.active_monitors(),
            vec![MonitorKey {
                task_id: task.clone(),
                strategy: StrategyKind::TextExists
            }]
        );

        assert_eq!(engine.stop_all(), 1);
        text.finished().await;
        assert!(engine.active_monitors().is_empty());
    }

    #[test]
    fn validation_catches_structural_problems() {
        let task = TaskId::from("v");
        let interval = Duration::from_secs(2);
        let element = MonitorSpec {
            strategy: StrategySpec::ElementExists {
                selector: Some("#a".into()),
                description: Some("the a".into()),
            },
            continuous: false,
            interval_ms: None,
            notify: None,
            screenshot: None,
        };
        assert_eq!(
            element.validate(&task, interval).unwrap_err(),
            ConfigError::AmbiguousElementTarget
        );

        let mut dom = dom_spec(f64::INFINITY, ">", true);
        assert_eq!(dom.validate(&task, interval).unwrap_err(), ConfigError::InvalidThreshold);
        dom = dom_spec(1.0, ">", true);
        dom.interval_ms = Some(0);
        assert_eq!(dom.validate(&task, interval).unwrap_err(), ConfigError::InvalidInterval);
        dom.interval_ms = None;
        assert_eq!(dom.validate(&task, interval).unwrap().interval, interval);
    }

    #[test]
    fn monitor_spec_parses_from_json() {
        let spec: MonitorSpec = serde_json::from_str(
            r#"{"strategy":"dom_value","selector":"._change span","threshold":-5.0,"operator":"<","continuous":true}"#,
        )
        .unwrap();
        let config = spec
            .validate(&TaskId::from("j"), Duration::from_secs(2))
            .unwrap();
        assert_eq!(
            config.probe,
            Probe::DomValue {
                selector: "._change span".into(),
                threshold: -5.0,
                operator: Operator::Lt
            }
        );
        assert!(config.continuous);
    }

    #[test]
    fn infers_strategy_from_query() {
        assert!(matches!(
            StrategySpec::infer("RSI below 30", false),
            StrategySpec::StockChart { .. }
        ));
        assert!(matches!(
            StrategySpec::infer("#login", false),
            StrategySpec::ElementExists { .. }
        ));
        assert!(matches!(
            StrategySpec::infer("big blue subscribe button", true),
            StrategySpec::VisionLocate { .. }
        ));
        assert!(matches!(
            StrategySpec::infer("big blue subscribe button", false),
            StrategySpec::TextExists { .. }
        ));
    }
}
