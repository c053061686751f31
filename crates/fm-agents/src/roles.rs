use fm_core::types::AgentRole;

use crate::directive::Directive;

// ---------------------------------------------------------------------------
// RoleProfile — defines the execution profile for each agent role
// ---------------------------------------------------------------------------

/// Role-specific configuration for the iteration loop. Each role carries
/// its own system prompt and a whitelist of directives it may emit; the
/// runtime rejects anything outside the whitelist with corrective feedback
/// instead of silently executing it.
pub trait RoleProfile: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Detailed system prompt for this role, including the directive
    /// grammar the reply parser accepts.
    fn system_prompt(&self) -> &str;

    /// Whether this role is allowed to emit the given directive.
    fn allows(&self, directive: &Directive) -> bool;
}

// ===========================================================================
// PmRole — decomposes the project into a phased task plan
// ===========================================================================

const PM_SYSTEM_PROMPT: &str = "\
You are the project manager for a team of autonomous software engineers. \
Your job is to decompose a project description into a phased plan of small, \
atomic tasks that engineers can implement independently.

You may inspect existing repository files before planning:
- READ_FILE(path=\"relative/path\") requests a file; its contents come back \
in the next message.

When you are ready, output the complete plan as a single ```json code block \
with this shape:

{
  \"version\": 1,
  \"phases\": [
    {
      \"name\": \"phase name\",
      \"tasks\": [
        {
          \"id\": \"kebab-case-id\",
          \"description\": \"what to implement, self-contained\",
          \"depends_on\": [\"earlier-task-id\"],
          \"criteria\": [
            {\"kind\": \"file_exists\", \"path\": \"relative/path\"},
            {\"kind\": \"command_succeeds\", \"command\": \"shell command\"}
          ]
        }
      ]
    }
  ]
}

Rules:
- Every task id must be unique and in kebab-case.
- depends_on may only reference tasks declared earlier in the plan.
- Every task needs at least one machine-checkable acceptance criterion.
- Each task description must be self-contained: the engineer sees only the \
description and criteria, never the rest of the plan.
- Keep tasks small enough to finish in one sitting.

Do not write code yourself. Output only READ_FILE requests and, finally, \
the json plan.";

pub struct PmRole;

impl RoleProfile for PmRole {
    fn role(&self) -> AgentRole {
        AgentRole::Pm
    }

    fn system_prompt(&self) -> &str {
        PM_SYSTEM_PROMPT
    }

    fn allows(&self, directive: &Directive) -> bool {
        matches!(directive, Directive::ReadFile { .. })
    }
}

// ===========================================================================
// SweRole — implements one task in an isolated working copy
// ===========================================================================

const SWE_SYSTEM_PROMPT: &str = "\
You are a software engineer implementing one task in a dedicated git working \
copy. Work only inside it; every path you mention is relative to its root.

You act by emitting directives in your reply:
- A ```bash code block runs shell commands. Each non-blank line that does \
not start with # is one command; end a line with \\ to continue it on the \
next line. Command output and exit codes come back in the next message.
- <file path=\"relative/path\"> followed by a fenced code block and </file> \
writes that file. Always emit the complete file contents, never a diff.

Your task briefing lists acceptance criteria. Verify your work against them \
yourself (run the commands, check the files). When every criterion is \
satisfied, output TASK_COMPLETE alone on its own line. Do not output \
TASK_COMPLETE before the criteria actually pass; verification runs after \
you finish and failures come back to you as feedback.";

pub struct SweRole;

impl RoleProfile for SweRole {
    fn role(&self) -> AgentRole {
        AgentRole::Swe
    }

    fn system_prompt(&self) -> &str {
        SWE_SYSTEM_PROMPT
    }

    fn allows(&self, directive: &Directive) -> bool {
        matches!(
            directive,
            Directive::RunCommand { .. } | Directive::WriteFile { .. }
        )
    }
}
