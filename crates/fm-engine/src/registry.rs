use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use fm_core::events::{EventBus, EventKind, RunEvent};
use fm_core::types::{Branch, LogLevel, LogRecord, Project, ProjectStatus, Task};

/// One project's dashboard row: the project record plus the task and
/// branch state the scheduler last pushed.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSnapshot {
    pub project: Project,
    pub tasks: Vec<Task>,
    pub branches: Vec<Branch>,
}

/// Explicitly owned registry of runs, passed to the scheduler rather than
/// living in process globals. Holds project records, scheduler-pushed
/// task/branch snapshots, and one append-only log per agent instance fed
/// from the event bus.
///
/// Reads are cloned snapshots; a consumer polling progress never blocks
/// the scheduler.
#[derive(Default)]
pub struct ProjectRegistry {
    projects: DashMap<Uuid, Project>,
    tasks: DashMap<Uuid, Vec<Task>>,
    branches: DashMap<Uuid, Vec<Branch>>,
    /// Agents seen per project, in first-logged order. Lets `remove` drop
    /// the logs along with the project.
    agents: DashMap<Uuid, Vec<Uuid>>,
    logs: DashMap<Uuid, Vec<LogRecord>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: Project) {
        self.projects.insert(project.id, project);
    }

    pub fn set_status(&self, id: Uuid, status: ProjectStatus) {
        if let Some(mut project) = self.projects.get_mut(&id) {
            if project.status != status && !project.status.can_transition_to(&status) {
                warn!(project_id = %id, from = %project.status, to = %status, "illegal project transition ignored");
                return;
            }
            debug!(project_id = %id, %status, "project status");
            project.status = status;
            if status.is_terminal() {
                project.finished_at = Some(Utc::now());
            }
        }
    }

    pub fn set_prd_version(&self, id: Uuid, version: u32) {
        if let Some(mut project) = self.projects.get_mut(&id) {
            project.prd_version = Some(version);
        }
    }

    /// Replace a project's task rows. The scheduler pushes these at
    /// transition points; the graph itself is never shared.
    pub fn update_tasks(&self, id: Uuid, tasks: Vec<Task>) {
        self.tasks.insert(id, tasks);
    }

    pub fn update_branches(&self, id: Uuid, branches: Vec<Branch>) {
        self.branches.insert(id, branches);
    }

    pub fn project(&self, id: Uuid) -> Option<Project> {
        self.projects.get(&id).map(|p| p.clone())
    }

    pub fn projects(&self) -> Vec<Project> {
        self.projects.iter().map(|p| p.clone()).collect()
    }

    pub fn tasks(&self, id: Uuid) -> Vec<Task> {
        self.tasks.get(&id).map(|t| t.clone()).unwrap_or_default()
    }

    pub fn branches(&self, id: Uuid) -> Vec<Branch> {
        self.branches
            .get(&id)
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Everything a dashboard needs for one project, or `None` if it was
    /// never registered or has been removed.
    pub fn snapshot(&self, id: Uuid) -> Option<ProjectSnapshot> {
        let project = self.project(id)?;
        Some(ProjectSnapshot {
            project,
            tasks: self.tasks(id),
            branches: self.branches(id),
        })
    }

    /// Ordered log for one agent instance. Scheduler-level events (dispatch,
    /// verification, merges) are filed under the nil uuid.
    pub fn agent_log(&self, agent_id: Uuid) -> Vec<LogRecord> {
        self.logs
            .get(&agent_id)
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// All logs for one project, grouped per agent in first-seen order.
    pub fn project_logs(&self, id: Uuid) -> Vec<(Uuid, Vec<LogRecord>)> {
        let agents = self.agents.get(&id).map(|a| a.clone()).unwrap_or_default();
        agents
            .into_iter()
            .map(|agent| (agent, self.agent_log(agent)))
            .collect()
    }

    /// Drop a project and everything filed under it, including its agents'
    /// logs. Returns the final project record.
    pub fn remove(&self, id: Uuid) -> Option<Project> {
        self.tasks.remove(&id);
        self.branches.remove(&id);
        if let Some((_, agents)) = self.agents.remove(&id) {
            for agent in agents {
                self.logs.remove(&agent);
            }
        }
        self.projects.remove(&id).map(|(_, p)| p)
    }

    /// Pump run events into per-agent logs until the bus closes or the
    /// returned task is aborted.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let rx = bus.subscribe();
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                registry.record(&event);
            }
        })
    }

    fn record(&self, event: &RunEvent) {
        let level = match event.kind {
            EventKind::AgentAborted
            | EventKind::TaskFailed
            | EventKind::VerificationFailed
            | EventKind::MergeConflicted => LogLevel::Warning,
            _ => LogLevel::Info,
        };
        let task = event
            .task_id
            .as_ref()
            .map(|id| format!(" task={id}"))
            .unwrap_or_default();
        let message = format!(
            "[{}]{task} iter={} {}",
            kind_label(&event.kind),
            event.iteration,
            event.detail
        );
        {
            let mut agents = self.agents.entry(event.project_id).or_default();
            if !agents.contains(&event.agent_id) {
                agents.push(event.agent_id);
            }
        }
        self.logs
            .entry(event.agent_id)
            .or_default()
            .push(LogRecord::new(level, message));
    }
}

fn kind_label(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::AgentStarted => "agent_started",
        EventKind::Iteration => "iteration",
        EventKind::FileWritten => "file_written",
        EventKind::FileRead => "file_read",
        EventKind::CommandRun => "command_run",
        EventKind::TaskCompleted => "task_completed",
        EventKind::TaskFailed => "task_failed",
        EventKind::VerificationPassed => "verification_passed",
        EventKind::VerificationFailed => "verification_failed",
        EventKind::BranchCreated => "branch_created",
        EventKind::Merged => "merged",
        EventKind::MergeConflicted => "merge_conflicted",
        EventKind::AgentAborted => "agent_aborted",
        EventKind::PlanProduced => "plan_produced",
    }
}
