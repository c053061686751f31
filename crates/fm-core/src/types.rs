use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Document-scoped task identifier. PRD tasks reference each other by this
/// slug, and branch/worktree names are derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased, `[a-z0-9-]` form used for branch and worktree names.
    pub fn slug(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c.to_ascii_lowercase());
            } else {
                out.push('-');
            }
        }
        out
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Verifying,
    Done,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Transitions are monotonic except Failed -> Ready (bounded retry) and
    /// the -> Blocked edges used when a dependency can no longer complete.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Ready)
                | (TaskStatus::Pending, TaskStatus::Blocked)
                | (TaskStatus::Ready, TaskStatus::InProgress)
                | (TaskStatus::Ready, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Verifying)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::Verifying, TaskStatus::Done)
                | (TaskStatus::Verifying, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Ready)
        )
    }

    /// Done, Failed, and Blocked admit no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Blocked
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Criterion
// ---------------------------------------------------------------------------

/// One verifiable success predicate. Declaration order is significant: the
/// verification engine evaluates criteria in order and reports failure
/// reasons in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
    FileExists { path: String },
    CommandSucceeds { command: String },
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::FileExists { path } => write!(f, "file exists: {path}"),
            Criterion::CommandSucceeds { command } => write!(f, "command succeeds: {command}"),
        }
    }
}

// ---------------------------------------------------------------------------
// PRD
// ---------------------------------------------------------------------------

/// Task declaration as it appears in the PRD document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<TaskSpec>,
}

/// The structured plan produced by the PM during Planning. Immutable once a
/// run starts; re-planning produces a new document with `version + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    #[serde(default = "default_prd_version")]
    pub version: u32,
    pub phases: Vec<Phase>,
}

fn default_prd_version() -> u32 {
    1
}

impl Prd {
    /// All task specs in declaration order: phases in order, tasks in order
    /// within each phase. This ordering is the FIFO tie-break for dispatch.
    pub fn task_specs(&self) -> impl Iterator<Item = &TaskSpec> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Runtime record for one atomic task. Owned by the task graph; mutated only
/// by the scheduler and the verification path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub depends_on: Vec<TaskId>,
    pub criteria: Vec<Criterion>,
    pub status: TaskStatus,
    pub branch: Option<String>,
    pub agent_id: Option<Uuid>,
    pub retry_count: u32,
    /// Ordered failure reasons from the most recent failed attempt, fed
    /// verbatim into the next attempt's context.
    pub feedback: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id.clone(),
            description: spec.description.clone(),
            depends_on: spec.depends_on.clone(),
            criteria: spec.criteria.clone(),
            status: TaskStatus::Pending,
            branch: None,
            agent_id: None,
            retry_count: 0,
            feedback: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Unmerged,
    Merged,
    Conflicted,
}

/// One task branch with its own working copy. Owned by the workspace
/// manager and never addressed by raw name from outside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub task_id: TaskId,
    pub base_commit: String,
    pub head_commit: Option<String>,
    pub merge_status: MergeStatus,
    pub workdir: PathBuf,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Pm,
    Swe,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Pm => f.write_str("pm"),
            AgentRole::Swe => f.write_str("swe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Completed,
    Aborted,
}

/// One bound agent instance. SWE instances carry the task they work on;
/// the PM instance has no task binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: Uuid,
    pub role: AgentRole,
    pub task_id: Option<TaskId>,
    pub iterations: u32,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    pub fn new(role: AgentRole, task_id: Option<TaskId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            task_id,
            iterations: 0,
            status: AgentStatus::Active,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One entry in an agent's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
    Running,
    Completed,
    /// The run finished but some tasks never landed (Failed or Blocked).
    CompletedPartial,
    Failed,
}

impl ProjectStatus {
    pub fn can_transition_to(&self, target: &ProjectStatus) -> bool {
        matches!(
            (self, target),
            (ProjectStatus::Planning, ProjectStatus::Running)
                | (ProjectStatus::Planning, ProjectStatus::Failed)
                | (ProjectStatus::Running, ProjectStatus::Completed)
                | (ProjectStatus::Running, ProjectStatus::CompletedPartial)
                | (ProjectStatus::Running, ProjectStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::CompletedPartial | ProjectStatus::Failed
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProjectStatus::Planning => "planning",
            ProjectStatus::Running => "running",
            ProjectStatus::Completed => "completed",
            ProjectStatus::CompletedPartial => "completed_partial",
            ProjectStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One orchestration run over one target repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub workspace_root: PathBuf,
    pub status: ProjectStatus,
    pub prd_version: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: sanitize_project_name(&name.into()),
            description: description.into(),
            workspace_root: workspace_root.into(),
            status: ProjectStatus::Planning,
            prd_version: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Keep project names filesystem-safe: anything outside `[A-Za-z0-9_-]`
/// becomes `_`.
pub fn sanitize_project_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
