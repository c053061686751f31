use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{Branch, MergeStatus, TaskId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git command failed: {0}")]
    Git(String),
    #[error("branch already exists for task: {0}")]
    BranchExists(TaskId),
    #[error("no branch for task: {0}")]
    UnknownTask(TaskId),
    #[error("checkout already active for branch: {0}")]
    CheckoutActive(String),
    #[error("command timed out after {0}s")]
    CommandTimeout(u64),
    #[error("path escapes the working copy: {0}")]
    PathEscape(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// MergeOutcome
// ---------------------------------------------------------------------------

/// Outcome of merging a task branch into the integration branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge landed; the integration branch gained this commit.
    Merged { commit: String },
    /// Merge has conflicts in the listed paths. The merge was aborted and
    /// the integration branch is untouched.
    Conflicted { paths: Vec<String> },
    /// The branch has no changes relative to the integration branch.
    NothingToMerge,
}

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

/// Captured result of a shell command run inside a checkout. A non-zero
/// exit is not an error at this layer; callers surface it to the agent.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Transcript form appended to agent context:
    /// `$ <cmd>` then merged output then `Exit code: <n>`.
    pub fn transcript(&self, command: &str) -> String {
        let mut out = format!("$ {command}\n");
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str(&self.stderr);
            if !self.stderr.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str(&format!("Exit code: {}\n", self.exit_code));
        out
    }
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Owns the on-disk repository: branch-per-task working copies, scoped
/// checkouts, commits, and serialized merges into the integration branch.
///
/// All repository mutation in the system passes through this type. Branch
/// records are keyed by task id; nothing outside this module addresses a
/// branch by raw name.
pub struct WorkspaceManager {
    root: PathBuf,
    integration_branch: String,
    workdir_name: String,
    command_timeout: Duration,
    git: Arc<dyn GitRunner>,
    branches: Arc<Mutex<HashMap<TaskId, Branch>>>,
    /// Branch names with a live checkout handle.
    active_checkouts: Arc<Mutex<HashSet<String>>>,
    /// Serializes ref-namespace operations (branch create/delete).
    ref_lock: Mutex<()>,
    /// Serializes merges so integration history stays linear.
    merge_lock: tokio::sync::Mutex<()>,
}

impl WorkspaceManager {
    /// Open a manager over `root` with the real git runner.
    pub fn new(
        root: impl Into<PathBuf>,
        integration_branch: impl Into<String>,
        workdir_name: impl Into<String>,
        command_timeout: Duration,
    ) -> Self {
        Self::with_git_runner(
            root,
            integration_branch,
            workdir_name,
            command_timeout,
            Arc::new(RealGitRunner),
        )
    }

    /// Open a manager with a custom git runner (for testing).
    pub fn with_git_runner(
        root: impl Into<PathBuf>,
        integration_branch: impl Into<String>,
        workdir_name: impl Into<String>,
        command_timeout: Duration,
        git: Arc<dyn GitRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            integration_branch: integration_branch.into(),
            workdir_name: workdir_name.into(),
            command_timeout,
            git,
            branches: Arc::new(Mutex::new(HashMap::new())),
            active_checkouts: Arc::new(Mutex::new(HashSet::new())),
            ref_lock: Mutex::new(()),
            merge_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make sure `root` is a git repository with at least one commit on the
    /// integration branch, initialising it when needed. A freshly
    /// initialised repo gets a `.gitkeep` so the first commit is non-empty.
    pub fn ensure_repo(&self) -> Result<()> {
        let root = self.root_str();
        std::fs::create_dir_all(&self.root)?;

        let inside = self
            .git
            .run_git(root, &["rev-parse", "--git-dir"])
            .map_err(WorkspaceError::Git)?;
        if !inside.success {
            info!(root = %self.root.display(), "initialising repository");
            self.git_ok(root, &["init", "-b", &self.integration_branch])?;
            // Fresh repos need a committer identity before the first commit.
            self.git_ok(root, &["config", "user.name", "foreman"])?;
            self.git_ok(root, &["config", "user.email", "foreman@localhost"])?;
        }

        let head = self
            .git
            .run_git(root, &["rev-parse", "HEAD"])
            .map_err(WorkspaceError::Git)?;
        if !head.success {
            write_gitkeep(&self.root)?;
            self.git_ok(root, &["add", "-A"])?;
            self.git_ok(root, &["commit", "-m", "initial commit"])?;
        }
        Ok(())
    }

    /// Create the branch and working copy for a task.
    ///
    /// The working copy lives at `{root}/{workdir_name}/{slug}` on branch
    /// `task/{slug}`, based off the current integration head. Creation is
    /// serialized per repository.
    pub fn create_branch(&self, task_id: &TaskId) -> Result<Branch> {
        let _guard = self.ref_lock.lock().expect("ref lock poisoned");

        {
            let branches = self.branches.lock().expect("branches lock poisoned");
            if branches.contains_key(task_id) {
                return Err(WorkspaceError::BranchExists(task_id.clone()));
            }
        }
        self.create_branch_locked(task_id)
    }

    /// Tear down a task's branch and recreate it from the current
    /// integration head. Used when a failed task is retried so the next
    /// attempt starts from the latest merged state.
    pub fn recreate_branch(&self, task_id: &TaskId) -> Result<Branch> {
        let _guard = self.ref_lock.lock().expect("ref lock poisoned");

        let old = {
            let branches = self.branches.lock().expect("branches lock poisoned");
            branches
                .get(task_id)
                .cloned()
                .ok_or_else(|| WorkspaceError::UnknownTask(task_id.clone()))?
        };
        {
            let active = self
                .active_checkouts
                .lock()
                .expect("active checkouts lock poisoned");
            if active.contains(&old.name) {
                return Err(WorkspaceError::CheckoutActive(old.name));
            }
        }

        let root = self.root_str();
        let workdir = old.workdir.display().to_string();
        // Best-effort teardown; the branch may be partially gone already.
        let _ = self
            .git
            .run_git(root, &["worktree", "remove", "--force", &workdir]);
        let _ = self.git.run_git(root, &["branch", "-D", &old.name]);
        if old.workdir.exists() {
            std::fs::remove_dir_all(&old.workdir)?;
        }
        self.branches
            .lock()
            .expect("branches lock poisoned")
            .remove(task_id);

        self.create_branch_locked(task_id)
    }

    fn create_branch_locked(&self, task_id: &TaskId) -> Result<Branch> {
        let slug = task_id.slug();
        let branch_name = format!("task/{slug}");
        let workdir = self.root.join(&self.workdir_name).join(&slug);

        if workdir.exists() {
            return Err(WorkspaceError::BranchExists(task_id.clone()));
        }
        if let Some(parent) = workdir.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let root = self.root_str();
        let base = self.git_ok(root, &["rev-parse", &self.integration_branch])?;
        let base_commit = base.stdout.trim().to_string();

        let workdir_str = workdir.display().to_string();
        info!(task_id = %task_id, branch = %branch_name, workdir = %workdir_str, "creating branch");
        self.git_ok(
            root,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                &workdir_str,
                &self.integration_branch,
            ],
        )?;
        // Real git creates the directory; mocks do not.
        std::fs::create_dir_all(&workdir)?;

        let branch = Branch {
            name: branch_name,
            task_id: task_id.clone(),
            base_commit,
            head_commit: None,
            merge_status: MergeStatus::Unmerged,
            workdir,
            created_at: Utc::now(),
        };
        self.branches
            .lock()
            .expect("branches lock poisoned")
            .insert(task_id.clone(), branch.clone());
        Ok(branch)
    }

    /// Take the scoped checkout handle for a task's working copy.
    ///
    /// At most one handle per branch is live at a time; the lease is
    /// released when the handle drops, on every exit path.
    pub fn checkout(&self, task_id: &TaskId) -> Result<CheckoutHandle> {
        let branch = {
            let branches = self.branches.lock().expect("branches lock poisoned");
            branches
                .get(task_id)
                .cloned()
                .ok_or_else(|| WorkspaceError::UnknownTask(task_id.clone()))?
        };

        {
            let mut active = self
                .active_checkouts
                .lock()
                .expect("active checkouts lock poisoned");
            if !active.insert(branch.name.clone()) {
                return Err(WorkspaceError::CheckoutActive(branch.name));
            }
        }
        debug!(task_id = %task_id, branch = %branch.name, "checkout acquired");

        Ok(CheckoutHandle {
            task_id: task_id.clone(),
            branch_name: branch.name,
            workdir: branch.workdir,
            command_timeout: self.command_timeout,
            git: Arc::clone(&self.git),
            branches: Arc::clone(&self.branches),
            active: Arc::clone(&self.active_checkouts),
        })
    }

    /// Merge a task branch into the integration branch.
    ///
    /// Merges are serialized: one completes (success or conflict) before
    /// the next begins, so integration history stays linear. Conflicts are
    /// never auto-resolved; the merge is aborted and the conflicting paths
    /// returned.
    pub async fn merge(&self, task_id: &TaskId) -> Result<MergeOutcome> {
        let _guard = self.merge_lock.lock().await;

        let branch = {
            let branches = self.branches.lock().expect("branches lock poisoned");
            branches
                .get(task_id)
                .cloned()
                .ok_or_else(|| WorkspaceError::UnknownTask(task_id.clone()))?
        };
        {
            let active = self
                .active_checkouts
                .lock()
                .expect("active checkouts lock poisoned");
            if active.contains(&branch.name) {
                return Err(WorkspaceError::CheckoutActive(branch.name));
            }
        }

        let root = self.root_str();
        info!(task_id = %task_id, branch = %branch.name, "attempting merge");

        let diff = self.git_ok(
            root,
            &["diff", "--stat", &self.integration_branch, &branch.name],
        )?;
        if diff.stdout.trim().is_empty() {
            info!(branch = %branch.name, "nothing to merge");
            self.set_merge_status(task_id, MergeStatus::Merged, None);
            self.cleanup_branch(&branch);
            return Ok(MergeOutcome::NothingToMerge);
        }

        let merge = self
            .git
            .run_git(root, &["merge", "--no-ff", "--no-commit", &branch.name])
            .map_err(WorkspaceError::Git)?;

        if merge.success {
            let msg = format!("merge {} into {}", branch.name, self.integration_branch);
            self.git_ok(root, &["commit", "-m", &msg])?;
            let head = self.git_ok(root, &["rev-parse", "HEAD"])?;
            let commit = head.stdout.trim().to_string();

            self.cleanup_branch(&branch);
            self.set_merge_status(task_id, MergeStatus::Merged, Some(commit.clone()));
            info!(branch = %branch.name, commit = %commit, "merge successful");
            Ok(MergeOutcome::Merged { commit })
        } else {
            let conflict = self
                .git
                .run_git(root, &["diff", "--name-only", "--diff-filter=U"]);
            let _ = self.git.run_git(root, &["merge", "--abort"]);

            let paths: Vec<String> = match conflict {
                Ok(co) if co.success => co
                    .stdout
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(|l| l.to_string())
                    .collect(),
                _ => merge
                    .stderr
                    .lines()
                    .chain(merge.stdout.lines())
                    .filter(|l| l.contains("CONFLICT"))
                    .map(|l| l.to_string())
                    .collect(),
            };

            self.set_merge_status(task_id, MergeStatus::Conflicted, None);
            warn!(branch = %branch.name, conflicts = ?paths, "merge conflicts detected");
            Ok(MergeOutcome::Conflicted { paths })
        }
    }

    /// Snapshot of all branch records.
    pub fn branches(&self) -> Vec<Branch> {
        let branches = self.branches.lock().expect("branches lock poisoned");
        branches.values().cloned().collect()
    }

    pub fn branch_for(&self, task_id: &TaskId) -> Option<Branch> {
        let branches = self.branches.lock().expect("branches lock poisoned");
        branches.get(task_id).cloned()
    }

    fn cleanup_branch(&self, branch: &Branch) {
        let root_owned = self.root.display().to_string();
        let workdir = branch.workdir.display().to_string();
        let _ = self
            .git
            .run_git(&root_owned, &["worktree", "remove", "--force", &workdir]);
        let _ = self.git.run_git(&root_owned, &["branch", "-d", &branch.name]);
    }

    fn set_merge_status(&self, task_id: &TaskId, status: MergeStatus, head: Option<String>) {
        let mut branches = self.branches.lock().expect("branches lock poisoned");
        if let Some(b) = branches.get_mut(task_id) {
            b.merge_status = status;
            if head.is_some() {
                b.head_commit = head;
            }
        }
    }

    fn git_ok(&self, dir: &str, args: &[&str]) -> Result<GitOutput> {
        let out = self.git.run_git(dir, args).map_err(WorkspaceError::Git)?;
        if out.success {
            Ok(out)
        } else {
            let detail = if out.stderr.trim().is_empty() {
                out.stdout
            } else {
                out.stderr
            };
            Err(WorkspaceError::Git(format!(
                "git {}: {}",
                args.join(" "),
                detail.trim()
            )))
        }
    }

    fn root_str(&self) -> &str {
        self.root.to_str().unwrap_or(".")
    }
}

// ---------------------------------------------------------------------------
// CheckoutHandle
// ---------------------------------------------------------------------------

/// Scoped access to one task's working copy. Holding the handle is the
/// lease: file writes, command runs, and commits go through it, and the
/// branch cannot be checked out again or merged until it drops.
pub struct CheckoutHandle {
    task_id: TaskId,
    branch_name: String,
    workdir: PathBuf,
    command_timeout: Duration,
    git: Arc<dyn GitRunner>,
    branches: Arc<Mutex<HashMap<TaskId, Branch>>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl CheckoutHandle {
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Write a repo-relative file, creating parent directories.
    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, content)?;
        debug!(task_id = %self.task_id, path, bytes = content.len(), "file written");
        Ok(())
    }

    /// Read a repo-relative file.
    pub fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        Ok(std::fs::read_to_string(full)?)
    }

    pub fn file_exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => full.exists(),
            Err(_) => false,
        }
    }

    /// Create `dir` and drop a `.gitkeep` placeholder when it is empty, so
    /// the directory survives version control.
    pub fn ensure_trackable(&self, dir: &str) -> Result<()> {
        let full = self.resolve(dir)?;
        std::fs::create_dir_all(&full)?;
        let empty = full.read_dir()?.next().is_none();
        if empty {
            std::fs::write(full.join(".gitkeep"), "")?;
        }
        Ok(())
    }

    /// Run a shell command in the working copy under the configured
    /// timeout. A non-zero exit is reported in the output, not as an error.
    pub async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        let fut = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .output();

        let output = match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(res) => res?,
            Err(_) => {
                warn!(task_id = %self.task_id, command, "command timed out");
                return Err(WorkspaceError::CommandTimeout(
                    self.command_timeout.as_secs(),
                ));
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Stage everything and commit. Returns the new commit id, or `None`
    /// when there was nothing to commit.
    ///
    /// Empty directories are marked trackable first, so a bare `mkdir`
    /// from an agent command survives the commit.
    pub fn commit(&self, message: &str) -> Result<Option<String>> {
        let marked = self.preserve_empty_dirs()?;
        if !marked.is_empty() {
            debug!(task_id = %self.task_id, dirs = ?marked, "marked empty directories trackable");
        }

        let dir = self.workdir.display().to_string();
        let add = self
            .git
            .run_git(&dir, &["add", "-A"])
            .map_err(WorkspaceError::Git)?;
        if !add.success {
            return Err(WorkspaceError::Git(format!("git add: {}", add.stderr.trim())));
        }

        let commit = self
            .git
            .run_git(&dir, &["commit", "-m", message])
            .map_err(WorkspaceError::Git)?;
        if !commit.success {
            let text = format!("{}{}", commit.stdout, commit.stderr);
            if text.contains("nothing to commit") || text.contains("nothing added to commit") {
                return Ok(None);
            }
            return Err(WorkspaceError::Git(format!(
                "git commit: {}",
                text.trim()
            )));
        }

        let head = self
            .git
            .run_git(&dir, &["rev-parse", "HEAD"])
            .map_err(WorkspaceError::Git)?;
        let id = head.stdout.trim().to_string();

        let mut branches = self.branches.lock().expect("branches lock poisoned");
        if let Some(b) = branches.get_mut(&self.task_id) {
            b.head_commit = Some(id.clone());
        }
        debug!(task_id = %self.task_id, commit = %id, "committed");
        Ok(Some(id))
    }

    /// Walk the working copy and [`ensure_trackable`](Self::ensure_trackable)
    /// every empty directory. Returns the repo-relative paths that were
    /// marked.
    fn preserve_empty_dirs(&self) -> Result<Vec<String>> {
        let mut marked = Vec::new();
        let mut stack = vec![self.workdir.clone()];
        while let Some(dir) = stack.pop() {
            let mut children = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_name() == ".git" {
                    continue;
                }
                children.push(entry.path());
            }
            if children.is_empty() && dir != self.workdir {
                let rel = dir
                    .strip_prefix(&self.workdir)
                    .unwrap_or(&dir)
                    .to_string_lossy()
                    .into_owned();
                self.ensure_trackable(&rel)?;
                marked.push(rel);
            } else {
                stack.extend(children.into_iter().filter(|c| c.is_dir()));
            }
        }
        marked.sort();
        Ok(marked)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.is_absolute() {
            return Err(WorkspaceError::PathEscape(path.to_string()));
        }
        for comp in rel.components() {
            if matches!(comp, Component::ParentDir) {
                return Err(WorkspaceError::PathEscape(path.to_string()));
            }
        }
        Ok(self.workdir.join(rel))
    }
}

impl Drop for CheckoutHandle {
    fn drop(&mut self) {
        let mut active = self.active.lock().expect("active checkouts lock poisoned");
        active.remove(&self.branch_name);
        debug!(task_id = %self.task_id, branch = %self.branch_name, "checkout released");
    }
}

fn write_gitkeep(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(".gitkeep"), "")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// A mock git runner that records commands and returns canned responses.
    pub(crate) struct MockGitRunner {
        responses: Mutex<Vec<GitOutput>>,
        commands: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockGitRunner {
        pub(crate) fn new(responses: Vec<GitOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<(String, Vec<String>)> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl GitRunner for MockGitRunner {
        fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.commands.lock().unwrap().push((
                dir.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));

            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(ok())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn ok() -> GitOutput {
        GitOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn ok_stdout(s: &str) -> GitOutput {
        GitOutput {
            success: true,
            stdout: s.to_string(),
            stderr: String::new(),
        }
    }

    fn manager_with(
        tmp: &Path,
        responses: Vec<GitOutput>,
    ) -> (WorkspaceManager, Arc<MockGitRunner>) {
        let git = Arc::new(MockGitRunner::new(responses));
        let mgr = WorkspaceManager::with_git_runner(
            tmp,
            "main",
            ".workdirs",
            Duration::from_secs(5),
            git.clone() as Arc<dyn GitRunner>,
        );
        (mgr, git)
    }

    fn temp_root(name: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        tmp
    }

    #[test]
    fn create_branch_derives_name_and_base() {
        let tmp = temp_root("fm-ws-create");
        let (mgr, git) = manager_with(&tmp, vec![ok_stdout("abc123\n"), ok()]);

        let branch = mgr.create_branch(&TaskId::new("Phase1 Setup")).unwrap();
        assert_eq!(branch.name, "task/phase1-setup");
        assert_eq!(branch.base_commit, "abc123");
        assert_eq!(branch.merge_status, MergeStatus::Unmerged);
        assert!(branch.workdir.ends_with(".workdirs/phase1-setup"));

        let cmds = git.commands();
        assert_eq!(cmds[0].1, vec!["rev-parse", "main"]);
        assert_eq!(cmds[1].1[..4], ["worktree", "add", "-b", "task/phase1-setup"]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn create_branch_rejects_duplicate_task() {
        let tmp = temp_root("fm-ws-dup");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("abc\n"), ok()]);

        mgr.create_branch(&TaskId::new("setup")).unwrap();
        let err = mgr.create_branch(&TaskId::new("setup")).unwrap_err();
        assert!(matches!(err, WorkspaceError::BranchExists(_)));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn recreate_branch_rebases_on_current_integration_head() {
        let tmp = temp_root("fm-ws-recreate");
        let (mgr, git) = manager_with(
            &tmp,
            vec![
                ok_stdout("base1\n"), // rev-parse main (first create)
                ok(),                 // worktree add
                ok(),                 // worktree remove
                ok(),                 // branch -D
                ok_stdout("base2\n"), // rev-parse main (recreate)
                ok(),                 // worktree add
            ],
        );
        let id = TaskId::new("retry-me");
        let first = mgr.create_branch(&id).unwrap();
        assert_eq!(first.base_commit, "base1");

        let second = mgr.recreate_branch(&id).unwrap();
        assert_eq!(second.base_commit, "base2");
        assert_eq!(second.name, "task/retry-me");
        assert_eq!(second.merge_status, MergeStatus::Unmerged);

        let deleted = git
            .commands()
            .iter()
            .any(|(_, args)| args == &vec!["branch".to_string(), "-D".to_string(), "task/retry-me".to_string()]);
        assert!(deleted, "old branch should be force-deleted");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn recreate_refuses_while_checkout_active() {
        let tmp = temp_root("fm-ws-recreate-active");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("base\n"), ok()]);
        let id = TaskId::new("held");
        mgr.create_branch(&id).unwrap();

        let _handle = mgr.checkout(&id).unwrap();
        let err = mgr.recreate_branch(&id).unwrap_err();
        assert!(matches!(err, WorkspaceError::CheckoutActive(_)));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn checkout_lease_is_exclusive_and_released_on_drop() {
        let tmp = temp_root("fm-ws-lease");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("abc\n"), ok()]);
        let id = TaskId::new("setup");
        mgr.create_branch(&id).unwrap();

        let handle = mgr.checkout(&id).unwrap();
        let second = mgr.checkout(&id);
        assert!(matches!(second, Err(WorkspaceError::CheckoutActive(_))));

        drop(handle);
        assert!(mgr.checkout(&id).is_ok());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn checkout_unknown_task_fails() {
        let tmp = temp_root("fm-ws-unknown");
        let (mgr, _git) = manager_with(&tmp, vec![]);
        let result = mgr.checkout(&TaskId::new("ghost"));
        assert!(matches!(result, Err(WorkspaceError::UnknownTask(_))));
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn merge_success_reports_commit_and_cleans_up() {
        let tmp = temp_root("fm-ws-merge-ok");
        let (mgr, git) = manager_with(
            &tmp,
            vec![
                ok_stdout("base1\n"),                 // rev-parse main
                ok(),                                 // worktree add
                ok_stdout("file.rs | 5 ++---\n"),     // diff --stat
                ok(),                                 // merge --no-ff --no-commit
                ok(),                                 // commit
                ok_stdout("deadbeef\n"),              // rev-parse HEAD
                ok(),                                 // worktree remove
                ok(),                                 // branch -d
            ],
        );
        let id = TaskId::new("setup");
        mgr.create_branch(&id).unwrap();

        let outcome = mgr.merge(&id).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                commit: "deadbeef".into()
            }
        );
        assert_eq!(
            mgr.branch_for(&id).unwrap().merge_status,
            MergeStatus::Merged
        );

        let cmds = git.commands();
        let merge_idx = cmds
            .iter()
            .position(|(_, args)| args.first().map(String::as_str) == Some("merge"))
            .unwrap();
        assert_eq!(cmds[merge_idx].1, vec!["merge", "--no-ff", "--no-commit", "task/setup"]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn merge_conflict_lists_paths_and_aborts() {
        let tmp = temp_root("fm-ws-merge-conflict");
        let (mgr, git) = manager_with(
            &tmp,
            vec![
                ok_stdout("base1\n"),             // rev-parse main
                ok(),                             // worktree add
                ok_stdout("file.rs | 5 ++---\n"), // diff --stat
                GitOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "CONFLICT (content): Merge conflict in src/lib.rs\n".into(),
                }, // merge fails
                ok_stdout("src/lib.rs\nsrc/main.rs\n"), // diff --name-only --diff-filter=U
                ok(),                                   // merge --abort
            ],
        );
        let id = TaskId::new("core");
        mgr.create_branch(&id).unwrap();

        let outcome = mgr.merge(&id).await.unwrap();
        match outcome {
            MergeOutcome::Conflicted { paths } => {
                assert_eq!(paths, vec!["src/lib.rs", "src/main.rs"]);
            }
            other => panic!("expected Conflicted, got {other:?}"),
        }
        assert_eq!(
            mgr.branch_for(&id).unwrap().merge_status,
            MergeStatus::Conflicted
        );

        let aborted = git
            .commands()
            .iter()
            .any(|(_, args)| args == &vec!["merge".to_string(), "--abort".to_string()]);
        assert!(aborted, "merge --abort should have run");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn merge_nothing_to_merge() {
        let tmp = temp_root("fm-ws-merge-empty");
        let (mgr, _git) = manager_with(
            &tmp,
            vec![
                ok_stdout("base1\n"), // rev-parse main
                ok(),                 // worktree add
                ok_stdout(""),        // diff --stat: empty
            ],
        );
        let id = TaskId::new("noop");
        mgr.create_branch(&id).unwrap();

        let outcome = mgr.merge(&id).await.unwrap();
        assert_eq!(outcome, MergeOutcome::NothingToMerge);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn merge_refuses_while_checkout_active() {
        let tmp = temp_root("fm-ws-merge-active");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("base\n"), ok()]);
        let id = TaskId::new("busy");
        mgr.create_branch(&id).unwrap();

        let _handle = mgr.checkout(&id).unwrap();
        let err = mgr.merge(&id).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CheckoutActive(_)));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn write_and_read_files_inside_checkout() {
        let tmp = temp_root("fm-ws-files");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("base\n"), ok()]);
        let id = TaskId::new("files");
        mgr.create_branch(&id).unwrap();

        let handle = mgr.checkout(&id).unwrap();
        handle.write_file("src/lib.rs", "pub fn f() {}\n").unwrap();
        assert!(handle.file_exists("src/lib.rs"));
        assert_eq!(handle.read_file("src/lib.rs").unwrap(), "pub fn f() {}\n");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn path_escapes_are_rejected() {
        let tmp = temp_root("fm-ws-escape");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("base\n"), ok()]);
        let id = TaskId::new("escape");
        mgr.create_branch(&id).unwrap();
        let handle = mgr.checkout(&id).unwrap();

        assert!(matches!(
            handle.write_file("../outside.txt", "x"),
            Err(WorkspaceError::PathEscape(_))
        ));
        assert!(matches!(
            handle.read_file("/etc/passwd"),
            Err(WorkspaceError::PathEscape(_))
        ));
        assert!(!handle.file_exists("../outside.txt"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_trackable_writes_gitkeep_in_empty_dir() {
        let tmp = temp_root("fm-ws-gitkeep");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("base\n"), ok()]);
        let id = TaskId::new("keep");
        mgr.create_branch(&id).unwrap();
        let handle = mgr.checkout(&id).unwrap();

        handle.ensure_trackable("assets/icons").unwrap();
        assert!(handle.file_exists("assets/icons/.gitkeep"));

        // Non-empty dirs are left alone.
        handle.write_file("src/lib.rs", "x").unwrap();
        handle.ensure_trackable("src").unwrap();
        assert!(!handle.file_exists("src/.gitkeep"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn commit_preserves_empty_directories() {
        let tmp = temp_root("fm-ws-commit-keep");
        let (mgr, _git) = manager_with(
            &tmp,
            vec![
                ok_stdout("base\n"), // rev-parse main
                ok(),                // worktree add
                ok(),                // add -A
                ok(),                // commit
                ok_stdout("c1\n"),   // rev-parse HEAD
            ],
        );
        let id = TaskId::new("keep-dirs");
        mgr.create_branch(&id).unwrap();
        let handle = mgr.checkout(&id).unwrap();

        handle.write_file("src/lib.rs", "x").unwrap();
        std::fs::create_dir_all(handle.workdir().join("logs")).unwrap();

        assert_eq!(handle.commit("snapshot").unwrap().as_deref(), Some("c1"));
        assert!(handle.file_exists("logs/.gitkeep"));
        assert!(!handle.file_exists("src/.gitkeep"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn run_command_captures_output_and_exit_code() {
        let tmp = temp_root("fm-ws-cmd");
        let (mgr, _git) = manager_with(&tmp, vec![ok_stdout("base\n"), ok()]);
        let id = TaskId::new("cmd");
        mgr.create_branch(&id).unwrap();
        let handle = mgr.checkout(&id).unwrap();

        let out = handle.run_command("echo hello").await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");

        let fail = handle.run_command("exit 3").await.unwrap();
        assert_eq!(fail.exit_code, 3);
        assert!(!fail.success());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let tmp = temp_root("fm-ws-cmd-timeout");
        let git = Arc::new(MockGitRunner::new(vec![ok_stdout("base\n"), ok()]));
        let mgr = WorkspaceManager::with_git_runner(
            &tmp,
            "main",
            ".workdirs",
            Duration::from_millis(100),
            git as Arc<dyn GitRunner>,
        );
        let id = TaskId::new("slow");
        mgr.create_branch(&id).unwrap();
        let handle = mgr.checkout(&id).unwrap();

        let err = handle.run_command("sleep 5").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CommandTimeout(_)));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn transcript_shape_matches_agent_context_format() {
        let out = CommandOutput {
            stdout: "ok\n".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(out.transcript("echo ok"), "$ echo ok\nok\nExit code: 0\n");

        let fail = CommandOutput {
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 1,
        };
        assert_eq!(fail.transcript("make"), "$ make\nboom\nExit code: 1\n");
    }
}
