use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentRole, TaskId};

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentStarted,
    Iteration,
    FileWritten,
    FileRead,
    CommandRun,
    TaskCompleted,
    TaskFailed,
    VerificationPassed,
    VerificationFailed,
    BranchCreated,
    Merged,
    MergeConflicted,
    AgentAborted,
    PlanProduced,
}

/// One entry in an agent's ordered event stream. Persistence of the stream
/// is an external concern; the core only guarantees order per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: Uuid,
    pub project_id: Uuid,
    pub agent_id: Uuid,
    pub role: AgentRole,
    pub task_id: Option<TaskId>,
    pub iteration: u32,
    pub kind: EventKind,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(
        project_id: Uuid,
        agent_id: Uuid,
        role: AgentRole,
        task_id: Option<TaskId>,
        iteration: u32,
        kind: EventKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_id,
            role,
            task_id,
            iteration,
            kind,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-style event bus over flume channels.
///
/// Each [`subscribe`] call creates a receiver that sees every event
/// published after the subscription. Cloning the bus is cheap; publishing
/// never blocks on slow consumers (channels are unbounded and dead
/// subscribers are pruned).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<RunEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<RunEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers, pruning any whose
    /// receiver has been dropped.
    pub fn publish(&self, event: RunEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
