use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use fm_core::types::{Prd, Task, TaskId, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("plan contains no tasks")]
    Empty,
    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),
    #[error("tasks '{task}' and '{other}' derive the same branch name")]
    DuplicateBranch { task: TaskId, other: TaskId },
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("dependency cycle involving task '{0}'")]
    Cycle(TaskId),
    #[error("unknown task '{0}'")]
    UnknownTask(TaskId),
    #[error("invalid transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// What `record_failure` decided for the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Another attempt remains; the task is Ready again. `attempt` counts
    /// failures so far.
    Retry { attempt: u32 },
    /// Retry budget spent; the task is permanently Failed and these
    /// dependents cascaded to Blocked, in declaration order.
    Exhausted { blocked: Vec<TaskId> },
}

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

/// The decomposed project as a DAG of atomic tasks. Construction validates
/// structure (ids, dependencies, acyclicity); afterwards the graph is the
/// single owner of task state and every status change passes through it.
#[derive(Debug)]
pub struct TaskGraph {
    version: u32,
    tasks: HashMap<TaskId, Task>,
    /// Declaration order from the PRD; the FIFO tie-break for dispatch.
    order: Vec<TaskId>,
    /// Reverse dependency edges, for cascade blocking.
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    pub fn build(prd: &Prd) -> Result<Self> {
        if prd.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut tasks: HashMap<TaskId, Task> = HashMap::new();
        let mut order = Vec::new();
        // Branch names derive from the slug, so distinct ids that slug
        // identically would collide in the repository mid-run.
        let mut branch_slugs: HashMap<String, TaskId> = HashMap::new();
        for spec in prd.task_specs() {
            if tasks.contains_key(&spec.id) {
                return Err(GraphError::DuplicateTask(spec.id.clone()));
            }
            if let Some(other) = branch_slugs.insert(spec.id.slug(), spec.id.clone()) {
                return Err(GraphError::DuplicateBranch {
                    task: spec.id.clone(),
                    other,
                });
            }
            order.push(spec.id.clone());
            tasks.insert(spec.id.clone(), Task::from_spec(spec));
        }

        for (pos, id) in order.iter().enumerate() {
            for dep in &tasks[id].depends_on {
                if !tasks.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                // Phases order tasks but add no edges; depending on a task
                // declared later is legal, just worth surfacing.
                if order.iter().position(|o| o == dep).unwrap_or(0) > pos {
                    warn!(task_id = %id, dependency = %dep, "dependency declared after its dependent");
                }
            }
        }

        // DFS with visiting/visited coloring; hitting a grey node is a cycle.
        fn visit(
            id: &TaskId,
            tasks: &HashMap<TaskId, Task>,
            color: &mut HashMap<TaskId, u8>,
        ) -> Result<()> {
            color.insert(id.clone(), 1);
            for dep in &tasks[id].depends_on {
                match color.get(dep).copied().unwrap_or(0) {
                    1 => return Err(GraphError::Cycle(dep.clone())),
                    0 => visit(dep, tasks, color)?,
                    _ => {}
                }
            }
            color.insert(id.clone(), 2);
            Ok(())
        }

        let mut color: HashMap<TaskId, u8> = HashMap::new();
        for id in &order {
            if color.get(id).copied().unwrap_or(0) == 0 {
                visit(id, &tasks, &mut color)?;
            }
        }

        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for id in &order {
            for dep in &tasks[id].depends_on {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        debug!(version = prd.version, tasks = order.len(), "task graph built");
        Ok(Self {
            version: prd.version,
            tasks,
            order,
            dependents,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))
    }

    /// Tasks in PRD declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().map(|id| &self.tasks[id])
    }

    /// Ids whose current status matches, in declaration order.
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.tasks[*id].status == status)
            .cloned()
            .collect()
    }

    /// Every dispatchable task: not yet started, with all dependencies
    /// Done. Declaration order is the FIFO tie-break.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| {
                let task = &self.tasks[*id];
                matches!(task.status, TaskStatus::Pending | TaskStatus::Ready)
                    && task
                        .depends_on
                        .iter()
                        .all(|dep| self.tasks[dep].status == TaskStatus::Done)
            })
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Apply one status transition, enforcing the task state machine.
    pub fn mark(&mut self, id: &TaskId, status: TaskStatus) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
        if !task.status.can_transition_to(&status) {
            return Err(GraphError::InvalidTransition {
                task: id.clone(),
                from: task.status,
                to: status,
            });
        }
        debug!(task_id = %id, from = %task.status, to = %status, "task transition");
        task.status = status;
        task.touch();
        Ok(())
    }

    /// Move a dispatchable task into InProgress (Pending passes through
    /// Ready).
    pub fn mark_dispatched(&mut self, id: &TaskId) -> Result<()> {
        if self.task(id)?.status == TaskStatus::Pending {
            self.mark(id, TaskStatus::Ready)?;
        }
        self.mark(id, TaskStatus::InProgress)
    }

    pub fn set_branch(&mut self, id: &TaskId, branch: impl Into<String>) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
        task.branch = Some(branch.into());
        task.touch();
        Ok(())
    }

    pub fn set_agent(&mut self, id: &TaskId, agent: Option<Uuid>) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
        task.agent_id = agent;
        task.touch();
        Ok(())
    }

    /// Record one failed attempt. Replaces the task's feedback with the new
    /// reasons, retries while failures stay under `max_retries`, and on
    /// exhaustion cascades Blocked to every transitive dependent.
    pub fn record_failure(
        &mut self,
        id: &TaskId,
        reasons: Vec<String>,
        max_retries: u32,
    ) -> Result<FailureOutcome> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
        if !task.status.can_transition_to(&TaskStatus::Failed) {
            return Err(GraphError::InvalidTransition {
                task: id.clone(),
                from: task.status,
                to: TaskStatus::Failed,
            });
        }
        task.status = TaskStatus::Failed;
        task.retry_count += 1;
        task.feedback = reasons;
        task.touch();
        let failures = task.retry_count;

        if failures < max_retries {
            self.mark(id, TaskStatus::Ready)?;
            Ok(FailureOutcome::Retry { attempt: failures })
        } else {
            warn!(task_id = %id, failures, "task permanently failed");
            let blocked = self.cascade_block(id);
            Ok(FailureOutcome::Exhausted { blocked })
        }
    }

    /// Block every transitive dependent of `failed`; their precondition can
    /// no longer be satisfied. Returns the newly blocked ids in declaration
    /// order.
    fn cascade_block(&mut self, failed: &TaskId) -> Vec<TaskId> {
        let mut blocked = Vec::new();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut stack = vec![failed.clone()];
        while let Some(id) = stack.pop() {
            let Some(next) = self.dependents.get(&id) else {
                continue;
            };
            for dependent in next.clone() {
                if !seen.insert(dependent.clone()) {
                    continue;
                }
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    // Dependents of a failing task were never dispatched
                    // (their dependency never reached Done), so they sit in
                    // Pending unless another cascade got here first.
                    if !task.status.is_terminal() {
                        task.status = TaskStatus::Blocked;
                        task.touch();
                        blocked.push(dependent.clone());
                    }
                }
                stack.push(dependent);
            }
        }
        blocked.sort_by_key(|id| {
            self.order
                .iter()
                .position(|o| o == id)
                .unwrap_or(usize::MAX)
        });
        blocked
    }
}
