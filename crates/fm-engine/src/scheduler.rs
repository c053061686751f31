use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use fm_agents::runtime::{AgentRuntime, PlanningError, ReplanContext, TaskTermination};
use fm_agents::verify::{VerificationEngine, VerificationResult, VerifyError};
use fm_core::config::Config;
use fm_core::events::{EventBus, EventKind, RunEvent};
use fm_core::types::{AgentRole, ProjectStatus, TaskId, TaskStatus};
use fm_core::workspace::{MergeOutcome, WorkspaceError, WorkspaceManager};

use crate::graph::{FailureOutcome, GraphError, TaskGraph};
use crate::registry::ProjectRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that end the whole run. Task-level failures are not errors here;
/// they land in the report as Failed/Blocked tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),
    #[error("plan rejected: {0}")]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("agent task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Final account of one run, returned to the caller and serializable for
/// external consumers.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project_id: Uuid,
    pub status: ProjectStatus,
    /// Version of the last PRD driven to completion.
    pub prd_version: u32,
    pub replans: u32,
    /// Tasks merged into the integration branch, across all plan versions.
    pub merged: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The orchestration engine proper: runs Planning, then the dispatch loop
/// over a bounded SWE pool, then verification and serialized integration,
/// with bounded re-planning when configured.
pub struct Scheduler {
    cfg: Config,
    runtime: AgentRuntime,
    workspace: WorkspaceManager,
    registry: Arc<ProjectRegistry>,
    bus: EventBus,
}

impl Scheduler {
    pub fn new(
        cfg: Config,
        runtime: AgentRuntime,
        workspace: WorkspaceManager,
        registry: Arc<ProjectRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            cfg,
            runtime,
            workspace,
            registry,
            bus,
        }
    }

    /// Drive one project from description to terminal status.
    ///
    /// Only planning-phase errors and infrastructure failures surface as
    /// `Err`; task failures are reported through the returned [`RunReport`].
    pub async fn run(&self, project_id: Uuid, description: &str) -> Result<RunReport> {
        let started_at = Utc::now();
        self.registry.set_status(project_id, ProjectStatus::Planning);

        // Planning happens before the repository is touched, so a fatal
        // planning error leaves the target directory exactly as found.
        let prd = match self
            .runtime
            .run_planning(project_id, description, self.workspace.root())
            .await
        {
            Ok(prd) => prd,
            Err(e) => {
                self.registry.set_status(project_id, ProjectStatus::Failed);
                return Err(e.into());
            }
        };
        let mut graph = match TaskGraph::build(&prd) {
            Ok(graph) => graph,
            Err(e) => {
                self.registry.set_status(project_id, ProjectStatus::Failed);
                return Err(e.into());
            }
        };
        self.registry.set_prd_version(project_id, graph.version());
        info!(project_id = %project_id, tasks = graph.len(), "plan accepted");
        self.sync_registry(project_id, &graph);

        self.registry.set_status(project_id, ProjectStatus::Running);
        self.workspace.ensure_repo()?;

        let mut merged: Vec<TaskId> = Vec::new();
        let mut replans = 0u32;
        loop {
            self.dispatch_until_settled(project_id, &mut graph).await?;
            for id in graph.ids_with_status(TaskStatus::Done) {
                if !merged.contains(&id) {
                    merged.push(id);
                }
            }

            let failed = graph.ids_with_status(TaskStatus::Failed);
            let blocked = graph.ids_with_status(TaskStatus::Blocked);
            if (failed.is_empty() && blocked.is_empty())
                || replans >= self.cfg.scheduler.max_replans
            {
                break;
            }

            // Re-plan the unfinished work: a fresh graph version, never a
            // mutation of the old one.
            replans += 1;
            info!(replans, failed = failed.len(), blocked = blocked.len(), "re-planning");
            let context = ReplanContext {
                completed: merged.clone(),
                failed: failed
                    .iter()
                    .map(|id| {
                        let feedback = graph
                            .task(id)
                            .map(|t| t.feedback.clone())
                            .unwrap_or_default();
                        (id.clone(), feedback)
                    })
                    .collect(),
                blocked: blocked.clone(),
            };
            let next = match self
                .runtime
                .run_replan(
                    project_id,
                    description,
                    self.workspace.root(),
                    graph.version(),
                    &context,
                )
                .await
            {
                Ok(prd) => prd,
                Err(e) => {
                    warn!(error = %e, "re-planning failed; keeping previous outcome");
                    break;
                }
            };
            match TaskGraph::build(&next) {
                Ok(next_graph) => {
                    self.registry.set_prd_version(project_id, next_graph.version());
                    graph = next_graph;
                    self.sync_registry(project_id, &graph);
                }
                Err(e) => {
                    warn!(error = %e, "re-planned graph rejected; keeping previous outcome");
                    break;
                }
            }
        }

        let failed = graph.ids_with_status(TaskStatus::Failed);
        let blocked = graph.ids_with_status(TaskStatus::Blocked);
        let status = if failed.is_empty() && blocked.is_empty() {
            ProjectStatus::Completed
        } else {
            ProjectStatus::CompletedPartial
        };
        self.registry.set_status(project_id, status);
        info!(project_id = %project_id, %status, merged = merged.len(), "run finished");

        Ok(RunReport {
            project_id,
            status,
            prd_version: graph.version(),
            replans,
            merged,
            failed,
            blocked,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// The dispatch loop: fill the bounded pool with ready tasks in FIFO
    /// order, then settle agents as they terminate, until every task in
    /// this graph version is terminal.
    async fn dispatch_until_settled(
        &self,
        project_id: Uuid,
        graph: &mut TaskGraph,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(
            self.cfg.scheduler.concurrency_limit as usize,
        ));
        let mut agents: JoinSet<(TaskId, OwnedSemaphorePermit, TaskTermination)> = JoinSet::new();

        loop {
            for id in graph.ready_tasks() {
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    break;
                };
                self.dispatch_one(project_id, graph, &id, permit, &mut agents)?;
            }
            self.sync_registry(project_id, graph);

            if agents.is_empty() {
                if graph.is_complete() {
                    break;
                }
                // Nothing in flight and nothing dispatchable. Unreachable
                // for an acyclic graph unless state was corrupted; block
                // the strays so the run still terminates.
                let strays: Vec<TaskId> = graph
                    .tasks()
                    .filter(|t| !t.status.is_terminal())
                    .map(|t| t.id.clone())
                    .collect();
                warn!(?strays, "incomplete graph with no dispatchable work");
                for id in strays {
                    let _ = graph.mark(&id, TaskStatus::Blocked);
                }
                self.sync_registry(project_id, graph);
                break;
            }

            let Some(joined) = agents.join_next().await else {
                continue;
            };
            let (task_id, permit, termination) = joined?;
            // Pool capacity frees as soon as the agent is done; verification
            // and the serialized merge do not hold a worker slot.
            drop(permit);
            self.settle(project_id, graph, &task_id, termination).await?;
        }
        Ok(())
    }

    fn dispatch_one(
        &self,
        project_id: Uuid,
        graph: &mut TaskGraph,
        id: &TaskId,
        permit: OwnedSemaphorePermit,
        agents: &mut JoinSet<(TaskId, OwnedSemaphorePermit, TaskTermination)>,
    ) -> Result<()> {
        // A retry (or a re-planned task reusing an id) starts over from the
        // current integration head; a first attempt gets a fresh branch.
        let branch = if self.workspace.branch_for(id).is_some() {
            self.workspace.recreate_branch(id)?
        } else {
            self.workspace.create_branch(id)?
        };
        graph.set_branch(id, branch.name.clone())?;
        self.publish(project_id, graph, id, EventKind::BranchCreated, branch.name);

        let handle = self.workspace.checkout(id)?;
        graph.mark_dispatched(id)?;

        let task = graph.task(id)?.clone();
        let feedback = task.feedback.clone();
        let runtime = self.runtime.clone();
        let task_id = id.clone();
        info!(task_id = %id, attempt = task.retry_count + 1, "dispatching");
        agents.spawn(async move {
            let termination = runtime.run_task(project_id, task, handle, feedback).await;
            (task_id, permit, termination)
        });
        Ok(())
    }

    /// Take one terminated agent through verification, integration, and
    /// graph bookkeeping.
    async fn settle(
        &self,
        project_id: Uuid,
        graph: &mut TaskGraph,
        task_id: &TaskId,
        termination: TaskTermination,
    ) -> Result<()> {
        match termination {
            TaskTermination::Completed {
                agent,
                handle,
                commit,
            } => {
                graph.set_agent(task_id, Some(agent.id))?;
                graph.mark(task_id, TaskStatus::Verifying)?;
                let task = graph.task(task_id)?.clone();
                let result = VerificationEngine::verify(&task, &handle).await?;
                // The lease must release before merge or branch recreation.
                drop(handle);

                match result {
                    VerificationResult::Pass => {
                        self.publish(
                            project_id,
                            graph,
                            task_id,
                            EventKind::VerificationPassed,
                            commit.unwrap_or_default(),
                        );
                        match self.workspace.merge(task_id).await? {
                            MergeOutcome::Merged { commit } => {
                                self.publish(project_id, graph, task_id, EventKind::Merged, commit);
                                graph.mark(task_id, TaskStatus::Done)?;
                            }
                            MergeOutcome::NothingToMerge => {
                                self.publish(
                                    project_id,
                                    graph,
                                    task_id,
                                    EventKind::Merged,
                                    "nothing to merge",
                                );
                                graph.mark(task_id, TaskStatus::Done)?;
                            }
                            MergeOutcome::Conflicted { paths } => {
                                let reason = format!("merge conflict: {}", paths.join(", "));
                                self.publish(
                                    project_id,
                                    graph,
                                    task_id,
                                    EventKind::MergeConflicted,
                                    reason.clone(),
                                );
                                self.fail_task(project_id, graph, task_id, vec![reason])?;
                            }
                        }
                    }
                    VerificationResult::Fail(reasons) => {
                        self.publish(
                            project_id,
                            graph,
                            task_id,
                            EventKind::VerificationFailed,
                            reasons.join("; "),
                        );
                        self.fail_task(project_id, graph, task_id, reasons)?;
                    }
                }
            }
            TaskTermination::Failed {
                agent,
                handle,
                error,
            } => {
                graph.set_agent(task_id, Some(agent.id))?;
                drop(handle);
                self.fail_task(project_id, graph, task_id, vec![error.to_string()])?;
            }
        }
        Ok(())
    }

    fn fail_task(
        &self,
        project_id: Uuid,
        graph: &mut TaskGraph,
        task_id: &TaskId,
        reasons: Vec<String>,
    ) -> Result<()> {
        let max = self.cfg.scheduler.max_task_retries;
        match graph.record_failure(task_id, reasons.clone(), max)? {
            FailureOutcome::Retry { attempt } => {
                info!(task_id = %task_id, attempt, "task failed; will retry");
                self.publish(
                    project_id,
                    graph,
                    task_id,
                    EventKind::TaskFailed,
                    format!("attempt {attempt} failed: {}", reasons.join("; ")),
                );
            }
            FailureOutcome::Exhausted { blocked } => {
                warn!(task_id = %task_id, blocked = blocked.len(), "task permanently failed");
                let mut detail = format!("permanently failed: {}", reasons.join("; "));
                if !blocked.is_empty() {
                    let ids: Vec<String> = blocked.iter().map(|b| b.to_string()).collect();
                    detail.push_str(&format!(" (blocked: {})", ids.join(", ")));
                }
                self.publish(project_id, graph, task_id, EventKind::TaskFailed, detail);
            }
        }
        Ok(())
    }

    /// Push current task and branch state to the registry so consumers can
    /// poll progress without touching the graph.
    fn sync_registry(&self, project_id: Uuid, graph: &TaskGraph) {
        self.registry
            .update_tasks(project_id, graph.tasks().cloned().collect());
        self.registry
            .update_branches(project_id, self.workspace.branches());
    }

    /// Dispatch and integration events are the orchestrator's own; they are
    /// reported under the PM role, with the task's bound agent id once one
    /// exists.
    fn publish(
        &self,
        project_id: Uuid,
        graph: &TaskGraph,
        task_id: &TaskId,
        kind: EventKind,
        detail: impl Into<String>,
    ) {
        let agent_id = graph
            .task(task_id)
            .ok()
            .and_then(|t| t.agent_id)
            .unwrap_or_else(Uuid::nil);
        self.bus.publish(RunEvent::new(
            project_id,
            agent_id,
            AgentRole::Pm,
            Some(task_id.clone()),
            0,
            kind,
            detail,
        ));
    }
}
