use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fm_core::config::AgentsConfig;
use fm_core::events::{EventBus, EventKind, RunEvent};
use fm_core::types::{AgentInstance, AgentRole, AgentStatus, Prd, Task, TaskId};
use fm_core::workspace::{CheckoutHandle, WorkspaceError};
use fm_harness::provider::Message;
use fm_harness::retry::{ModelClient, RetryError};

use crate::directive::{self, Directive, DirectiveError};
use crate::history::Conversation;
use crate::roles::{PmRole, RoleProfile, SweRole};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] RetryError),
    #[error("stalled after {0} consecutive unproductive iterations")]
    Stalled(u32),
    #[error("iteration budget of {0} exhausted without completion")]
    BudgetExhausted(u32),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Model(#[from] RetryError),
    #[error("planning iteration timed out after {0}s")]
    Timeout(u64),
    #[error("no usable plan after {iterations} iterations: {last}")]
    NoPlan { iterations: u32, last: String },
}

// ---------------------------------------------------------------------------
// Terminations
// ---------------------------------------------------------------------------

/// How one SWE agent run ended. The checkout handle rides along so the
/// caller controls teardown order: verification still needs the working
/// copy, and the lease must drop before the branch can merge or be
/// recreated.
pub enum TaskTermination {
    Completed {
        agent: AgentInstance,
        handle: CheckoutHandle,
        /// Commit produced by the final stage-and-commit, `None` when the
        /// working tree had no changes.
        commit: Option<String>,
    },
    Failed {
        agent: AgentInstance,
        handle: CheckoutHandle,
        error: AgentError,
    },
}

/// What the previous plan left unfinished, briefed to the PM on re-plan.
#[derive(Debug, Clone)]
pub struct ReplanContext {
    pub completed: Vec<TaskId>,
    pub failed: Vec<(TaskId, Vec<String>)>,
    pub blocked: Vec<TaskId>,
}

// ---------------------------------------------------------------------------
// AgentRuntime
// ---------------------------------------------------------------------------

/// Drives one role's interaction loop with the model: assemble context,
/// complete, parse directives, apply effects, repeat until a terminal
/// condition. The scheduler owns dispatch; this type owns a single agent's
/// life.
#[derive(Clone)]
pub struct AgentRuntime {
    client: ModelClient,
    bus: EventBus,
    cfg: AgentsConfig,
}

impl AgentRuntime {
    pub fn new(client: ModelClient, bus: EventBus, cfg: AgentsConfig) -> Self {
        Self { client, bus, cfg }
    }

    // -- SWE mode -----------------------------------------------------------

    /// Run one SWE agent against its checked-out working copy until it
    /// signals completion or fails. `feedback` carries the previous
    /// attempt's verification reasons, verbatim.
    pub async fn run_task(
        &self,
        project_id: Uuid,
        task: Task,
        handle: CheckoutHandle,
        feedback: Vec<String>,
    ) -> TaskTermination {
        let profile = SweRole;
        let mut agent = AgentInstance::new(AgentRole::Swe, Some(task.id.clone()));
        self.publish(
            project_id,
            &agent,
            EventKind::AgentStarted,
            task.description.clone(),
        );
        info!(task_id = %task.id, agent_id = %agent.id, "swe agent started");

        let mut conversation = Conversation::new(
            vec![
                Message::system(profile.system_prompt()),
                Message::user(task_briefing(&task, &feedback)),
            ],
            self.cfg.history_max_turns,
        );
        let mut stalled = 0u32;

        for iteration in 1..=self.cfg.max_iterations {
            agent.iterations = iteration;
            self.publish(
                project_id,
                &agent,
                EventKind::Iteration,
                format!("iteration {iteration}"),
            );

            let reply = match tokio::time::timeout(
                self.cfg.iteration_timeout(),
                self.client.complete(conversation.messages()),
            )
            .await
            {
                Ok(Ok(completion)) => completion.text,
                Ok(Err(e)) => {
                    return self.abort(project_id, agent, handle, AgentError::Model(e));
                }
                Err(_) => {
                    return self.abort(
                        project_id,
                        agent,
                        handle,
                        AgentError::Timeout(self.cfg.iteration_timeout_secs),
                    );
                }
            };
            conversation.push_assistant(reply.clone());

            let parsed = match directive::parse_reply(&reply) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Grammar violations go back verbatim; the model must
                    // correct its own output.
                    debug!(task_id = %task.id, error = %e, "unparseable reply");
                    conversation.push_user(format!(
                        "Your reply could not be parsed: {e}\nEmit a ```bash block, a <file> block, or TASK_COMPLETE."
                    ));
                    stalled += 1;
                    if stalled >= self.cfg.stall_threshold {
                        return self.abort(project_id, agent, handle, AgentError::Stalled(stalled));
                    }
                    continue;
                }
            };

            let mut results = Vec::new();
            let mut applied = 0usize;
            for d in &parsed.directives {
                if !profile.allows(d) {
                    results.push(
                        "READ_FILE is not available to the engineer role; inspect files with \
                         shell commands instead."
                            .to_string(),
                    );
                    continue;
                }
                match d {
                    Directive::WriteFile { path, content } => {
                        if let Err(e) = handle.write_file(path, content) {
                            match e {
                                WorkspaceError::PathEscape(_) => {
                                    results.push(format!("rejected write: {e}"));
                                    continue;
                                }
                                other => {
                                    return self.abort(
                                        project_id,
                                        agent,
                                        handle,
                                        AgentError::Workspace(other),
                                    );
                                }
                            }
                        }
                        self.publish(project_id, &agent, EventKind::FileWritten, path.clone());
                        results.push(format!("wrote {path} ({} bytes)", content.len()));
                        applied += 1;
                    }
                    Directive::RunCommand { command } => {
                        let output = match handle.run_command(command).await {
                            Ok(output) => output,
                            Err(WorkspaceError::CommandTimeout(secs)) => {
                                return self.abort(
                                    project_id,
                                    agent,
                                    handle,
                                    AgentError::Timeout(secs),
                                );
                            }
                            Err(e) => {
                                return self.abort(
                                    project_id,
                                    agent,
                                    handle,
                                    AgentError::Workspace(e),
                                );
                            }
                        };
                        self.publish(
                            project_id,
                            &agent,
                            EventKind::CommandRun,
                            format!("{command} (exit {})", output.exit_code),
                        );
                        results.push(output.transcript(command));
                        applied += 1;
                    }
                    Directive::ReadFile { .. } => unreachable!("gated by allows()"),
                }
            }

            if parsed.completed {
                let commit = match handle.commit(&format!("task {}: {}", task.id, task.description))
                {
                    Ok(commit) => commit,
                    Err(e) => {
                        return self.abort(project_id, agent, handle, AgentError::Workspace(e));
                    }
                };
                agent.status = AgentStatus::Completed;
                self.publish(
                    project_id,
                    &agent,
                    EventKind::TaskCompleted,
                    commit.clone().unwrap_or_else(|| "no changes".into()),
                );
                info!(task_id = %task.id, iterations = iteration, "swe agent completed");
                return TaskTermination::Completed {
                    agent,
                    handle,
                    commit,
                };
            }

            if applied > 0 {
                stalled = 0;
            } else {
                stalled += 1;
                if stalled >= self.cfg.stall_threshold {
                    return self.abort(project_id, agent, handle, AgentError::Stalled(stalled));
                }
                if results.is_empty() {
                    results.push(
                        "No directives recognized. Emit a ```bash block, a <file> block, or \
                         TASK_COMPLETE when the criteria pass."
                            .to_string(),
                    );
                }
            }
            conversation.push_user(results.join("\n"));
        }

        let budget = self.cfg.max_iterations;
        self.abort(project_id, agent, handle, AgentError::BudgetExhausted(budget))
    }

    fn abort(
        &self,
        project_id: Uuid,
        mut agent: AgentInstance,
        handle: CheckoutHandle,
        error: AgentError,
    ) -> TaskTermination {
        agent.status = AgentStatus::Aborted;
        self.publish(project_id, &agent, EventKind::AgentAborted, error.to_string());
        warn!(task_id = ?agent.task_id, error = %error, "agent aborted");
        TaskTermination::Failed {
            agent,
            handle,
            error,
        }
    }

    // -- PM mode ------------------------------------------------------------

    /// Run the PM once to decompose `description` into a PRD. Read-only:
    /// the PM may inspect repository files but never mutates the workspace.
    pub async fn run_planning(
        &self,
        project_id: Uuid,
        description: &str,
        repo_root: &Path,
    ) -> Result<Prd, PlanningError> {
        let seed = vec![
            Message::system(PmRole.system_prompt()),
            Message::user(planning_briefing(description)),
        ];
        self.planning_loop(project_id, repo_root, seed).await
    }

    /// Re-plan after a run left tasks unfinished. The returned PRD always
    /// carries `prior_version + 1` regardless of what the model wrote.
    pub async fn run_replan(
        &self,
        project_id: Uuid,
        description: &str,
        repo_root: &Path,
        prior_version: u32,
        context: &ReplanContext,
    ) -> Result<Prd, PlanningError> {
        let seed = vec![
            Message::system(PmRole.system_prompt()),
            Message::user(replan_briefing(description, prior_version, context)),
        ];
        let mut prd = self.planning_loop(project_id, repo_root, seed).await?;
        prd.version = prior_version + 1;
        Ok(prd)
    }

    async fn planning_loop(
        &self,
        project_id: Uuid,
        repo_root: &Path,
        seed: Vec<Message>,
    ) -> Result<Prd, PlanningError> {
        let profile = PmRole;
        let mut agent = AgentInstance::new(AgentRole::Pm, None);
        self.publish(project_id, &agent, EventKind::AgentStarted, "planning");
        info!(agent_id = %agent.id, "pm agent started");

        let mut conversation = Conversation::new(seed, self.cfg.history_max_turns);
        let mut last_problem = String::from("no json plan block in any reply");

        for iteration in 1..=self.cfg.planning_max_iterations {
            agent.iterations = iteration;
            self.publish(
                project_id,
                &agent,
                EventKind::Iteration,
                format!("iteration {iteration}"),
            );

            let reply = match tokio::time::timeout(
                self.cfg.iteration_timeout(),
                self.client.complete(conversation.messages()),
            )
            .await
            {
                Ok(Ok(completion)) => completion.text,
                Ok(Err(e)) => return Err(PlanningError::Model(e)),
                Err(_) => return Err(PlanningError::Timeout(self.cfg.iteration_timeout_secs)),
            };
            conversation.push_assistant(reply.clone());

            match directive::parse_prd_reply(&reply) {
                Ok(prd) => {
                    agent.status = AgentStatus::Completed;
                    self.publish(
                        project_id,
                        &agent,
                        EventKind::PlanProduced,
                        format!("version {} with {} tasks", prd.version, prd.task_count()),
                    );
                    info!(tasks = prd.task_count(), "plan produced");
                    return Ok(prd);
                }
                Err(DirectiveError::MissingPlan) => {}
                Err(e) => {
                    last_problem = e.to_string();
                    conversation.push_user(format!(
                        "Your plan could not be used: {e}\nOutput the complete corrected ```json plan."
                    ));
                    continue;
                }
            }

            // No plan yet; serve read requests so the next iteration has
            // the repository context it asked for.
            let mut results = Vec::new();
            match directive::parse_reply(&reply) {
                Ok(parsed) => {
                    for d in &parsed.directives {
                        if !profile.allows(d) {
                            results.push(
                                "The planner may only use READ_FILE and the final json plan; \
                                 file writes and shell commands are not available."
                                    .to_string(),
                            );
                            continue;
                        }
                        if let Directive::ReadFile { path } = d {
                            results.push(read_repo_file(repo_root, path));
                            self.publish(project_id, &agent, EventKind::FileRead, path.clone());
                        }
                    }
                }
                Err(e) => {
                    last_problem = e.to_string();
                    results.push(format!("Your reply could not be parsed: {e}"));
                }
            }
            if results.is_empty() {
                last_problem =
                    "reply contained neither a json plan nor a READ_FILE request".to_string();
                results.push(
                    "Reply with READ_FILE(path=\"...\") requests or the final ```json plan."
                        .to_string(),
                );
            }
            conversation.push_user(results.join("\n\n"));
        }

        agent.status = AgentStatus::Aborted;
        self.publish(
            project_id,
            &agent,
            EventKind::AgentAborted,
            last_problem.clone(),
        );
        Err(PlanningError::NoPlan {
            iterations: self.cfg.planning_max_iterations,
            last: last_problem,
        })
    }

    fn publish(
        &self,
        project_id: Uuid,
        agent: &AgentInstance,
        kind: EventKind,
        detail: impl Into<String>,
    ) {
        self.bus.publish(RunEvent::new(
            project_id,
            agent.id,
            agent.role,
            agent.task_id.clone(),
            agent.iterations,
            kind,
            detail,
        ));
    }
}

// ---------------------------------------------------------------------------
// Briefings
// ---------------------------------------------------------------------------

fn task_briefing(task: &Task, feedback: &[String]) -> String {
    let mut b = format!("Task: {}\n", task.description);
    if task.criteria.is_empty() {
        b.push_str("\nNo machine-checked criteria; satisfy the description, then signal completion.\n");
    } else {
        b.push_str("\nAcceptance criteria:\n");
        for c in &task.criteria {
            b.push_str(&format!("- {c}\n"));
        }
    }
    if !feedback.is_empty() {
        b.push_str("\nYour previous attempt failed verification:\n");
        for reason in feedback {
            b.push_str(&format!("- {reason}\n"));
        }
        b.push_str(
            "\nThe working copy was reset to the latest integration state; address the \
             failures above.\n",
        );
    }
    b
}

fn planning_briefing(description: &str) -> String {
    format!(
        "Project description:\n\n{description}\n\nInspect the repository if useful, then \
         produce the json plan."
    )
}

fn replan_briefing(description: &str, prior_version: u32, ctx: &ReplanContext) -> String {
    let mut b = format!(
        "Project description:\n\n{description}\n\nPlan version {prior_version} finished \
         partially. Produce plan version {} covering only the remaining work.\n",
        prior_version + 1
    );
    if !ctx.completed.is_empty() {
        b.push_str("\nCompleted tasks (already merged; do not re-plan them):\n");
        for id in &ctx.completed {
            b.push_str(&format!("- {id}\n"));
        }
    }
    if !ctx.failed.is_empty() {
        b.push_str("\nFailed tasks and their last verification feedback:\n");
        for (id, reasons) in &ctx.failed {
            b.push_str(&format!("- {id}: {}\n", reasons.join("; ")));
        }
    }
    if !ctx.blocked.is_empty() {
        b.push_str("\nBlocked tasks (their dependencies never landed):\n");
        for id in &ctx.blocked {
            b.push_str(&format!("- {id}\n"));
        }
    }
    b
}

fn read_repo_file(root: &Path, path: &str) -> String {
    // Paths were validated at parse time; symlinked escapes are out of
    // scope for a local-tool threat model.
    let full: PathBuf = root.join(path);
    match std::fs::read_to_string(&full) {
        Ok(content) => format!("Contents of {path}:\n\n{content}"),
        Err(e) => format!("Could not read {path}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::{Criterion, TaskSpec};

    fn task_with(criteria: Vec<Criterion>) -> Task {
        Task::from_spec(&TaskSpec {
            id: TaskId::new("auth-api"),
            description: "implement the auth api".into(),
            depends_on: vec![],
            criteria,
        })
    }

    #[test]
    fn briefing_lists_criteria_in_order() {
        let t = task_with(vec![
            Criterion::FileExists {
                path: "src/auth.rs".into(),
            },
            Criterion::CommandSucceeds {
                command: "make test".into(),
            },
        ]);
        let b = task_briefing(&t, &[]);
        let file_at = b.find("file exists: src/auth.rs").unwrap();
        let cmd_at = b.find("command succeeds: make test").unwrap();
        assert!(file_at < cmd_at);
        assert!(!b.contains("previous attempt"));
    }

    #[test]
    fn briefing_injects_feedback_verbatim() {
        let t = task_with(vec![]);
        let b = task_briefing(
            &t,
            &[
                "missing file out.txt".to_string(),
                "command failed: exit 1".to_string(),
            ],
        );
        assert!(b.contains("- missing file out.txt\n"));
        assert!(b.contains("- command failed: exit 1\n"));
    }

    #[test]
    fn replan_briefing_covers_all_buckets() {
        let ctx = ReplanContext {
            completed: vec![TaskId::new("schema")],
            failed: vec![(
                TaskId::new("api"),
                vec!["command failed: exit 2".to_string()],
            )],
            blocked: vec![TaskId::new("docs")],
        };
        let b = replan_briefing("a web app", 1, &ctx);
        assert!(b.contains("plan version 2"));
        assert!(b.contains("- schema\n"));
        assert!(b.contains("- api: command failed: exit 2\n"));
        assert!(b.contains("- docs\n"));
    }

    #[test]
    fn missing_repo_file_reads_as_error_text() {
        let out = read_repo_file(Path::new("/nonexistent-root"), "README.md");
        assert!(out.starts_with("Could not read README.md:"));
    }
}
