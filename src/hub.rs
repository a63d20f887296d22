//! Per-task fan-out of [`AgentEvent`]s to live subscribers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::events::{AgentEvent, EventKind};
use crate::types::TaskId;

/// The sink has gone away; the hub drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Anything that can accept events for a transport. Delivery must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &AgentEvent) -> Result<(), SinkClosed>;
}

impl EventSink for mpsc::UnboundedSender<AgentEvent> {
    fn deliver(&self, event: &AgentEvent) -> Result<(), SinkClosed> {
        self.send(event.clone()).map_err(|_| SinkClosed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    task_id: TaskId,
    id: u64,
}

impl SubscriptionHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

/// A channel-backed subscription. Dropping the receiver is enough to
/// unsubscribe: the next publish to the task removes the closed sink.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub receiver: mpsc::UnboundedReceiver<AgentEvent>,
}

struct Registered {
    id: u64,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: DashMap<TaskId, Vec<Registered>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, task_id: &TaskId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.attach(task_id, Arc::new(tx));
        Subscription {
            handle,
            receiver: rx,
        }
    }

    /// Register an arbitrary sink for a task.
    pub fn attach(&self, task_id: &TaskId, sink: Arc<dyn EventSink>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(task_id.clone())
            .or_default()
            .push(Registered { id, sink });
        tracing::debug!(task_id = %task_id, subscriber = id, "subscriber attached");
        SubscriptionHandle {
            task_id: task_id.clone(),
            id,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.subscribers.get_mut(&handle.task_id) {
            let before = entry.len();
            entry.retain(|r| r.id != handle.id);
            removed = entry.len() != before;
        }
        self.subscribers
            .remove_if(&handle.task_id, |_, subs| subs.is_empty());
        removed
    }

    /// Deliver to every subscriber of the event's task. Sinks that fail are
    /// removed without affecting delivery to the others. With no subscribers
    /// this does nothing. The entry lock is held for the whole delivery, so
    /// each subscriber sees one task's events in publish order.
    pub fn publish(&self, event: &AgentEvent) {
        let Some(mut entry) = self.subscribers.get_mut(&event.task_id) else {
            return;
        };
        entry.retain(|r| match r.sink.deliver(event) {
            Ok(()) => true,
            Err(SinkClosed) => {
                tracing::debug!(
                    task_id = %event.task_id,
                    subscriber = r.id,
                    "dropping closed subscriber"
                );
                false
            }
        });
        let emptied = entry.is_empty();
        drop(entry);
        if emptied {
            self.subscribers
                .remove_if(&event.task_id, |_, subs| subs.is_empty());
        }
    }

    /// Deliver one event to every subscriber of every task.
    pub fn broadcast(&self, event: &AgentEvent) {
        let mut emptied = Vec::new();
        for mut entry in self.subscribers.iter_mut() {
            entry.retain(|r| r.sink.deliver(event).is_ok());
            if entry.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for task_id in emptied {
            self.subscribers.remove_if(&task_id, |_, subs| subs.is_empty());
        }
    }

    pub fn subscriber_count(&self, task_id: &TaskId) -> usize {
        self.subscribers.get(task_id).map_or(0, |s| s.len())
    }
}

/// Bounded per-task buffer of the latest events, read by status queries.
pub struct RecentEvents {
    events: DashMap<TaskId, VecDeque<AgentEvent>>,
    capacity: usize,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, event: &AgentEvent) {
        let mut buffer = self.events.entry(event.task_id.clone()).or_default();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());
    }

    pub fn latest(&self, task_id: &TaskId) -> Vec<AgentEvent> {
        self.events
            .get(task_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, task_id: &TaskId) -> bool {
        self.events.remove(task_id).is_some()
    }
}

/// What producers hold: stamps events, keeps the recent buffer and fans out.
#[derive(Clone)]
pub struct Publisher {
    hub: Arc<EventHub>,
    recent: Arc<RecentEvents>,
}

impl Publisher {
    pub fn new(hub: Arc<EventHub>, recent: Arc<RecentEvents>) -> Self {
        Self { hub, recent }
    }

    pub fn emit(&self, task_id: &TaskId, kind: impl Into<EventKind>) -> AgentEvent {
        let event = AgentEvent::new(task_id.clone(), kind);
        self.recent.record(&event);
        self.hub.publish(&event);
        event
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn recent(&self) -> &Arc<RecentEvents> {
        &self.recent
    }
}
