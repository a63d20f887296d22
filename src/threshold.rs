//! Edge-triggered threshold detection.
//!
//! The only state kept per monitored quantity is the last value and whether
//! the condition held on the previous sample. A crossing is reported on the
//! transition from not-met to met, so a condition that stays true does not
//! re-fire on every poll.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::LazyLock;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::TaskId;

/// Tolerance for `==` and `!=` on floating point samples.
pub const EQUALITY_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }

    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Ge => value >= threshold,
            Operator::Le => value <= threshold,
            Operator::Eq => (value - threshold).abs() < EQUALITY_EPSILON,
            Operator::Ne => (value - threshold).abs() >= EQUALITY_EPSILON,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Operator::Gt),
            "<" => Ok(Operator::Lt),
            ">=" => Ok(Operator::Ge),
            "<=" => Ok(Operator::Le),
            "==" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            other => Err(ConfigError::InvalidOperator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Crossing {
    pub condition_met: bool,
    pub is_new_crossing: bool,
}

/// Stored state of one monitored quantity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TrackedState {
    pub last_value: Option<f64>,
    pub crossed: bool,
}

/// Per-key crossing state. Keys default to task ids; the seek engine keys by
/// task and strategy. Each key is updated under its own map entry lock, so a
/// stop request racing a sample never observes a torn update.
#[derive(Debug)]
pub struct ThresholdTracker<K = TaskId>
where
    K: Eq + Hash,
{
    states: DashMap<K, TrackedState>,
}

impl<K> Default for ThresholdTracker<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ThresholdTracker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Evaluate one sample. A missing or non-finite value is not evidence of
    /// anything: it reports no crossing and leaves the stored state alone.
    pub fn check(
        &self,
        key: &K,
        value: Option<f64>,
        threshold: f64,
        operator: Operator,
    ) -> Crossing {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return Crossing::default();
        };

        let condition_met = operator.evaluate(value, threshold);
        let mut state = self.states.entry(key.clone()).or_default();
        let is_new_crossing = condition_met && !state.crossed;
        state.crossed = condition_met;
        state.last_value = Some(value);

        Crossing {
            condition_met,
            is_new_crossing,
        }
    }

    /// Edge detection for conditions decided elsewhere (chart signals).
    pub fn observe(&self, key: &K, condition_met: bool) -> Crossing {
        let mut state = self.states.entry(key.clone()).or_default();
        let is_new_crossing = condition_met && !state.crossed;
        state.crossed = condition_met;
        Crossing {
            condition_met,
            is_new_crossing,
        }
    }

    pub fn state(&self, key: &K) -> Option<TrackedState> {
        self.states.get(key).map(|s| *s)
    }

    pub fn forget(&self, key: &K) -> bool {
        self.states.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number pattern"));
static NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[%$,€£¥\s]").expect("valid noise pattern"));

/// First number in a rendered value such as `-2.45%` or `$1,234.50`.
pub fn extract_numeric(text: &str) -> Option<f64> {
    let cleaned = NOISE.replace_all(text, "");
    NUMBER
        .find(&cleaned)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::from(s)
    }

    #[test]
    fn fires_once_per_run_and_rearms_after_clearing() {
        let tracker = ThresholdTracker::new();
        let task = id("drop-watch");
        let samples = [-1.0, -4.0, -5.0, -2.0, -6.0];

        let fired: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, v)| {
                tracker
                    .check(&task, Some(**v), -3.0, Operator::Lt)
                    .is_new_crossing
            })
            .map(|(i, _)| i)
            .collect();

        assert_eq!(fired, vec![1, 4]);
        assert_eq!(
            tracker.state(&task),
            Some(TrackedState {
                last_value: Some(-6.0),
                crossed: true
            })
        );
    }

    #[test]
    fn greater_than_runs_fire_exactly_once_each() {
        let tracker = ThresholdTracker::new();
        let task = id("gt");
        let samples = [1.0, 6.0, 7.0, 8.0, 2.0, 3.0, 9.0, 9.5, 1.0, 10.0];
        let mut crossings = 0;
        let mut runs = 0;
        let mut previous = false;
        for value in samples {
            let result = tracker.check(&task, Some(value), 5.0, Operator::Gt);
            if result.condition_met && !previous {
                runs += 1;
                assert!(result.is_new_crossing);
            } else {
                assert!(!result.is_new_crossing);
            }
            if result.is_new_crossing {
                crossings += 1;
            }
            previous = result.condition_met;
        }
        assert_eq!(runs, 3);
        assert_eq!(crossings, runs);
    }

    #[test]
    fn missing_sample_does_not_touch_state() {
        let tracker = ThresholdTracker::new();
        let task = id("gap");
        tracker.check(&task, Some(10.0), 5.0, Operator::Gt);

        let gap = tracker.check(&task, None, 5.0, Operator::Gt);
        assert_eq!(gap, Crossing::default());
        let nan = tracker.check(&task, Some(f64::NAN), 5.0, Operator::Gt);
        assert_eq!(nan, Crossing::default());

        let state = tracker.state(&task).unwrap();
        assert!(state.crossed);
        assert_eq!(state.last_value, Some(10.0));
        // Still inside the same run, so no re-fire.
        assert!(!tracker.check(&task, Some(11.0), 5.0, Operator::Gt).is_new_crossing);
    }

    #[test]
    fn missing_first_sample_creates_no_state() {
        let tracker: ThresholdTracker = ThresholdTracker::new();
        tracker.check(&id("empty"), None, 1.0, Operator::Eq);
        assert!(tracker.is_empty());
    }

    #[test]
    fn equality_uses_epsilon() {
        assert!(Operator::Eq.evaluate(5.0004, 5.0));
        assert!(!Operator::Eq.evaluate(5.002, 5.0));
        assert!(Operator::Ne.evaluate(5.002, 5.0));
        assert!(!Operator::Ne.evaluate(5.0, 5.0));
        assert!(Operator::Ge.evaluate(5.0, 5.0));
        assert!(Operator::Le.evaluate(4.0, 5.0));
    }

    #[test]
    fn parses_operators() {
        assert_eq!(">=".parse::<Operator>(), Ok(Operator::Ge));
        assert_eq!(" != ".parse::<Operator>(), Ok(Operator::Ne));
        assert_eq!(
            "=>".parse::<Operator>(),
            Err(ConfigError::InvalidOperator("=>".into()))
        );
    }

    #[test]
    fn keys_are_independent() {
        let tracker = ThresholdTracker::new();
        assert!(tracker.check(&id("a"), Some(10.0), 5.0, Operator::Gt).is_new_crossing);
        assert!(tracker.check(&id("b"), Some(10.0), 5.0, Operator::Gt).is_new_crossing);
        assert!(tracker.forget(&id("a")));
        assert!(tracker.check(&id("a"), Some(10.0), 5.0, Operator::Gt).is_new_crossing);
        assert!(!tracker.check(&id("b"), Some(10.0), 5.0, Operator::Gt).is_new_crossing);
    }

    #[test]
    fn observe_edges_boolean_signals() {
        let tracker = ThresholdTracker::new();
        let key = id("chart");
        let edges: Vec<bool> = [false, true, true, false, true]
            .into_iter()
            .map(|signal| tracker.observe(&key, signal).is_new_crossing)
            .collect();
        assert_eq!(edges, vec![false, true, false, false, true]);
    }

    #[test]
    fn extracts_numbers_from_rendered_values() {
        assert_eq!(extract_numeric("-2.45%"), Some(-2.45));
        assert_eq!(extract_numeric("$1,234.50"), Some(1234.5));
        assert_eq!(extract_numeric("Change: +3 %"), Some(3.0));
        assert_eq!(extract_numeric("n/a"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_keys_keep_their_own_state() {
        use std::sync::Arc;

        let tracker = Arc::new(ThresholdTracker::<TaskId>::new());
        let mut handles = Vec::new();
        for n in 0..16u32 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let key = TaskId::new(format!("task-{n}"));
                let threshold = n as f64;
                let mut fired = 0;
                // Alternate below/above this task's own threshold.
                for i in 0..50 {
                    let value = if i % 2 == 0 { threshold - 1.0 } else { threshold + 1.0 };
                    if tracker
                        .check(&key, Some(value), threshold, Operator::Gt)
                        .is_new_crossing
                    {
                        fired += 1;
                    }
                    tokio::task::yield_now().await;
                }
                (key, threshold, fired)
            }));
        }

        for handle in handles {
            let (key, threshold, fired) = handle.await.unwrap();
            assert_eq!(fired, 25);
            let state = tracker.state(&key).unwrap();
            assert_eq!(state.last_value, Some(threshold + 1.0));
            assert!(state.crossed);
        }
    }
}
