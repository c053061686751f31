use serde::{Deserialize, Serialize};
use thiserror::Error;

use fm_core::types::Prd;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error("malformed directive: {0}")]
    MalformedTag(String),
    #[error("code fence opened at byte {0} is never closed")]
    UnclosedFence(usize),
    #[error("file block '{0}' is missing its fenced content")]
    MissingFileContent(String),
    #[error("file block '{0}' is not closed with </file>")]
    UnclosedFile(String),
    #[error("path '{0}' must stay inside the working copy")]
    IllegalPath(String),
    #[error("reply contains no ```json plan block")]
    MissingPlan,
    #[error("plan json is invalid: {0}")]
    InvalidPlan(String),
    #[error("plan contains no tasks")]
    EmptyPlan,
}

pub type Result<T> = std::result::Result<T, DirectiveError>;

// ---------------------------------------------------------------------------
// Directive
// ---------------------------------------------------------------------------

/// One action requested by a model reply. Directives are applied in the
/// order they appear in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Directive {
    /// Run a shell command in the working copy.
    RunCommand { command: String },
    /// Write a file, relative to the working copy root.
    WriteFile { path: String, content: String },
    /// Read a repository file back into the conversation. Only the PM role
    /// may use this; the runtime enforces the gate.
    ReadFile { path: String },
}

/// A fully parsed model reply: the directives it contained plus whether the
/// completion marker was present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub directives: Vec<Directive>,
    pub completed: bool,
}

impl ParsedReply {
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty() && !self.completed
    }
}

// ---------------------------------------------------------------------------
// Grammar markers
// ---------------------------------------------------------------------------

const FENCE: &str = "```";
const FILE_OPEN: &str = "<file ";
const FILE_CLOSE: &str = "</file>";
const READ_OPEN: &str = "READ_FILE";
const COMPLETE_MARKER: &str = "TASK_COMPLETE";

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Parse a model reply into directives.
///
/// The grammar is strict on purpose: structurally broken forms are errors
/// (fed back to the model verbatim), while a reply with no recognizable
/// directive at all parses to an empty [`ParsedReply`] and counts against
/// the stall threshold upstream.
///
/// Recognized forms:
/// - ```` ```bash ```` fences: each non-blank, non-`#` line is one command;
///   a trailing `\` joins the next line
/// - `<file path="...">` followed by a fenced block and `</file>`
/// - `READ_FILE(path="...")`, whitespace tolerated around `(` and the
///   argument; the bare token with no call is prose
/// - `TASK_COMPLETE` alone on a line, outside any fence; the marker ends
///   the reply and anything after it is ignored
pub fn parse_reply(text: &str) -> Result<ParsedReply> {
    let mut directives = Vec::new();
    let mut completed = false;
    let mut pos = 0;

    loop {
        let rest = &text[pos..];
        let next_file = rest.find(FILE_OPEN);
        let next_fence = rest.find(FENCE);
        let next_read = find_read_directive(rest);

        let candidates = [next_file, next_fence, next_read];
        let Some(min_off) = candidates.iter().flatten().copied().min() else {
            completed |= has_complete_marker(rest);
            break;
        };

        // Only prose between directives can carry the completion marker;
        // the same token inside a fence or file body is agent payload.
        completed |= has_complete_marker(&rest[..min_off]);
        if completed {
            // The marker ends the reply; later directives are not applied.
            break;
        }
        let abs = pos + min_off;

        if next_file == Some(min_off) {
            let (directive, end) = parse_file_block(text, abs)?;
            directives.push(directive);
            pos = end;
        } else if next_read == Some(min_off) {
            let (directive, end) = parse_read_file(text, abs)?;
            directives.push(directive);
            pos = end;
        } else {
            let (commands, end) = parse_fence(text, abs)?;
            directives.extend(commands);
            pos = end;
        }
    }

    Ok(ParsedReply {
        directives,
        completed,
    })
}

/// Parse the PRD out of a planning reply.
///
/// The plan travels as a ```` ```json ```` fence containing the phased task
/// breakdown. Structural graph validation (duplicate ids, unknown
/// dependencies, cycles) happens when the task graph is built; this step
/// only guarantees well-formed, non-empty JSON.
pub fn parse_prd_reply(text: &str) -> Result<Prd> {
    let mut pos = 0;
    while let Some(off) = text[pos..].find(FENCE) {
        let abs = pos + off;
        let info_start = abs + FENCE.len();
        let Some(nl) = text[info_start..].find('\n') else {
            return Err(DirectiveError::UnclosedFence(abs));
        };
        let lang = text[info_start..info_start + nl].trim();
        let body_start = info_start + nl + 1;
        let Some(close) = text[body_start..].find(FENCE) else {
            return Err(DirectiveError::UnclosedFence(abs));
        };
        let body = &text[body_start..body_start + close];
        pos = body_start + close + FENCE.len();

        if lang != "json" {
            continue;
        }
        let prd: Prd =
            serde_json::from_str(body).map_err(|e| DirectiveError::InvalidPlan(e.to_string()))?;
        if prd.is_empty() {
            return Err(DirectiveError::EmptyPlan);
        }
        return Ok(prd);
    }
    Err(DirectiveError::MissingPlan)
}

// ---------------------------------------------------------------------------
// Block parsers
// ---------------------------------------------------------------------------

/// Parse `<file path="...">` + fenced content + `</file>` starting at
/// `start`. Returns the directive and the offset just past `</file>`.
fn parse_file_block(text: &str, start: usize) -> Result<(Directive, usize)> {
    let Some(tag_close) = text[start..].find('>') else {
        return Err(DirectiveError::MalformedTag(snippet(&text[start..])));
    };
    let tag = &text[start..start + tag_close + 1];
    let path = extract_quoted(tag, "path=\"")
        .ok_or_else(|| DirectiveError::MalformedTag(snippet(tag)))?;
    validate_path(&path)?;

    let after_tag = start + tag_close + 1;
    let fence_start = skip_whitespace(text, after_tag);
    if !text[fence_start..].starts_with(FENCE) {
        return Err(DirectiveError::MissingFileContent(path));
    }

    let info_start = fence_start + FENCE.len();
    let Some(nl) = text[info_start..].find('\n') else {
        return Err(DirectiveError::UnclosedFence(fence_start));
    };
    let body_start = info_start + nl + 1;
    let Some(close) = text[body_start..].find(FENCE) else {
        return Err(DirectiveError::UnclosedFence(fence_start));
    };
    let content = text[body_start..body_start + close].to_string();

    let after_fence = skip_whitespace(text, body_start + close + FENCE.len());
    if !text[after_fence..].starts_with(FILE_CLOSE) {
        return Err(DirectiveError::UnclosedFile(path));
    }

    Ok((
        Directive::WriteFile { path, content },
        after_fence + FILE_CLOSE.len(),
    ))
}

/// Parse `READ_FILE(path="...")` starting at `start`. Whitespace is
/// tolerated before the `(` and around the argument.
fn parse_read_file(text: &str, start: usize) -> Result<(Directive, usize)> {
    // The scanner only lands here when a `(` follows the token.
    let paren = skip_whitespace(text, start + READ_OPEN.len());
    let args_start = paren + 1;
    let Some(close) = text[args_start..].find(')') else {
        return Err(DirectiveError::MalformedTag(snippet(&text[start..])));
    };
    let args = &text[args_start..args_start + close];
    let path = extract_path_arg(args)
        .ok_or_else(|| DirectiveError::MalformedTag(snippet(&text[start..])))?;
    validate_path(&path)?;

    Ok((Directive::ReadFile { path }, args_start + close + 1))
}

/// Parse a fenced block starting at `start`. Bash fences yield commands;
/// any other language is skipped as prose payload.
fn parse_fence(text: &str, start: usize) -> Result<(Vec<Directive>, usize)> {
    let info_start = start + FENCE.len();
    let Some(nl) = text[info_start..].find('\n') else {
        return Err(DirectiveError::UnclosedFence(start));
    };
    let lang = text[info_start..info_start + nl].trim();
    let body_start = info_start + nl + 1;
    let Some(close) = text[body_start..].find(FENCE) else {
        return Err(DirectiveError::UnclosedFence(start));
    };
    let body = &text[body_start..body_start + close];
    let end = body_start + close + FENCE.len();

    if !matches!(lang, "bash" | "sh" | "shell") {
        return Ok((Vec::new(), end));
    }

    let mut commands = Vec::new();
    let mut pending = String::new();
    for raw in body.lines() {
        if pending.is_empty() {
            let t = raw.trim();
            if t.is_empty() || t.starts_with('#') {
                continue;
            }
        }
        let joined = if pending.is_empty() {
            raw.to_string()
        } else {
            format!("{pending}{}", raw.trim_start())
        };
        if let Some(stripped) = joined.strip_suffix('\\') {
            pending = format!("{} ", stripped.trim_end());
            continue;
        }
        pending.clear();
        let command = joined.trim().to_string();
        if !command.is_empty() {
            commands.push(Directive::RunCommand { command });
        }
    }
    // A trailing backslash with nothing after it still names a command.
    if !pending.is_empty() {
        let command = pending.trim().to_string();
        if !command.is_empty() {
            commands.push(Directive::RunCommand { command });
        }
    }

    Ok((commands, end))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn has_complete_marker(segment: &str) -> bool {
    segment.lines().any(|line| line.trim() == COMPLETE_MARKER)
}

/// Offset of the next `READ_FILE` that actually opens a call: the token
/// followed by optional whitespace and `(`. A bare mention in prose is not
/// a directive.
fn find_read_directive(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(off) = text[from..].find(READ_OPEN) {
        let abs = from + off;
        let after = skip_whitespace(text, abs + READ_OPEN.len());
        if text[after..].starts_with('(') {
            return Some(abs);
        }
        from = abs + READ_OPEN.len();
    }
    None
}

fn extract_quoted(haystack: &str, prefix: &str) -> Option<String> {
    let start = haystack.find(prefix)? + prefix.len();
    let end = haystack[start..].find('"')?;
    Some(haystack[start..start + end].to_string())
}

/// `path = "value"`, whitespace optional everywhere outside the quotes.
fn extract_path_arg(args: &str) -> Option<String> {
    let rest = args.trim_start().strip_prefix("path")?;
    let rest = rest.trim_start().strip_prefix('=')?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(DirectiveError::IllegalPath(path.to_string()));
    }
    if std::path::Path::new(path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(DirectiveError::IllegalPath(path.to_string()));
    }
    Ok(())
}

fn skip_whitespace(text: &str, mut pos: usize) -> usize {
    let bytes = text.as_bytes();
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

fn snippet(s: &str) -> String {
    let end = s
        .char_indices()
        .take(48)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    s[..end].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(reply: &ParsedReply) -> Vec<&str> {
        reply
            .directives
            .iter()
            .filter_map(|d| match d {
                Directive::RunCommand { command } => Some(command.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn bash_fence_yields_one_command_per_line() {
        let reply = parse_reply("Setting up:\n```bash\nmkdir -p src\ncargo init\n```\n").unwrap();
        assert_eq!(commands(&reply), vec!["mkdir -p src", "cargo init"]);
        assert!(!reply.completed);
    }

    #[test]
    fn bash_fence_skips_blank_and_comment_lines() {
        let text = "```bash\n# prepare the tree\n\nmkdir out\n   # and populate\necho hi > out/a.txt\n```";
        let reply = parse_reply(text).unwrap();
        assert_eq!(commands(&reply), vec!["mkdir out", "echo hi > out/a.txt"]);
    }

    #[test]
    fn trailing_backslash_joins_continuation_lines() {
        let text = "```bash\ncc -o main \\\n  main.c \\\n  util.c\n```";
        let reply = parse_reply(text).unwrap();
        assert_eq!(commands(&reply), vec!["cc -o main main.c util.c"]);
    }

    #[test]
    fn sh_and_shell_fences_also_carry_commands() {
        let reply = parse_reply("```sh\nls\n```\n```shell\npwd\n```").unwrap();
        assert_eq!(commands(&reply), vec!["ls", "pwd"]);
    }

    #[test]
    fn non_bash_fences_are_skipped() {
        let text = "Here is the code:\n```rust\nfn main() {}\n```\nDone.";
        let reply = parse_reply(text).unwrap();
        assert!(reply.directives.is_empty());
    }

    #[test]
    fn file_block_parses_path_and_verbatim_content() {
        let text = "<file path=\"src/lib.rs\">\n```rust\npub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n```\n</file>";
        let reply = parse_reply(text).unwrap();
        assert_eq!(
            reply.directives,
            vec![Directive::WriteFile {
                path: "src/lib.rs".into(),
                content: "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n".into(),
            }]
        );
    }

    #[test]
    fn file_block_language_tag_is_optional() {
        let text = "<file path=\"notes.txt\">\n```\nplain text\n```\n</file>";
        let reply = parse_reply(text).unwrap();
        assert_eq!(
            reply.directives,
            vec![Directive::WriteFile {
                path: "notes.txt".into(),
                content: "plain text\n".into(),
            }]
        );
    }

    #[test]
    fn file_block_without_fence_is_an_error() {
        let text = "<file path=\"a.txt\">\nraw content\n</file>";
        let err = parse_reply(text).unwrap_err();
        assert!(matches!(err, DirectiveError::MissingFileContent(p) if p == "a.txt"));
    }

    #[test]
    fn file_block_without_close_tag_is_an_error() {
        let text = "<file path=\"a.txt\">\n```\ncontent\n```\nand then prose";
        let err = parse_reply(text).unwrap_err();
        assert!(matches!(err, DirectiveError::UnclosedFile(p) if p == "a.txt"));
    }

    #[test]
    fn file_tag_without_path_is_malformed() {
        let err = parse_reply("<file name=\"a.txt\">\n```\nx\n```\n</file>").unwrap_err();
        assert!(matches!(err, DirectiveError::MalformedTag(_)));
    }

    #[test]
    fn absolute_and_parent_paths_are_rejected() {
        let abs = "<file path=\"/etc/passwd\">\n```\nx\n```\n</file>";
        assert!(matches!(
            parse_reply(abs).unwrap_err(),
            DirectiveError::IllegalPath(_)
        ));

        let parent = "<file path=\"../outside.txt\">\n```\nx\n```\n</file>";
        assert!(matches!(
            parse_reply(parent).unwrap_err(),
            DirectiveError::IllegalPath(_)
        ));

        assert!(matches!(
            parse_reply("READ_FILE(path=\"../secrets\")").unwrap_err(),
            DirectiveError::IllegalPath(_)
        ));
    }

    #[test]
    fn unclosed_fence_is_an_error() {
        let err = parse_reply("```bash\necho never closed\n").unwrap_err();
        assert!(matches!(err, DirectiveError::UnclosedFence(0)));
    }

    #[test]
    fn read_file_directive_parses() {
        let reply = parse_reply("Let me inspect READ_FILE(path=\"Cargo.toml\") first.").unwrap();
        assert_eq!(
            reply.directives,
            vec![Directive::ReadFile {
                path: "Cargo.toml".into()
            }]
        );
    }

    #[test]
    fn read_file_tolerates_whitespace_in_args() {
        let reply = parse_reply("READ_FILE( path = \"docs/plan.md\" )").unwrap();
        assert_eq!(
            reply.directives,
            vec![Directive::ReadFile {
                path: "docs/plan.md".into()
            }]
        );
    }

    #[test]
    fn read_file_allows_space_before_the_parenthesis() {
        let reply = parse_reply("Let me look. READ_FILE (path=\"README.md\")").unwrap();
        assert_eq!(
            reply.directives,
            vec![Directive::ReadFile {
                path: "README.md".into()
            }]
        );
    }

    #[test]
    fn bare_read_file_mention_is_prose_not_a_directive() {
        let reply = parse_reply("No need to READ_FILE anything further.\nTASK_COMPLETE\n").unwrap();
        assert!(reply.directives.is_empty());
        assert!(reply.completed);
    }

    #[test]
    fn read_file_without_path_is_malformed() {
        let err = parse_reply("READ_FILE(file=\"x\")").unwrap_err();
        assert!(matches!(err, DirectiveError::MalformedTag(_)));
    }

    #[test]
    fn completion_marker_alone_on_a_line() {
        let reply = parse_reply("All criteria satisfied.\nTASK_COMPLETE\n").unwrap();
        assert!(reply.completed);
        assert!(reply.directives.is_empty());
    }

    #[test]
    fn completion_marker_needs_its_own_line() {
        let reply = parse_reply("I will emit TASK_COMPLETE once done.\n").unwrap();
        assert!(!reply.completed);
    }

    #[test]
    fn completion_marker_inside_fence_is_payload_not_signal() {
        let text = "```bash\necho TASK_COMPLETE\n```\n";
        let reply = parse_reply(text).unwrap();
        assert!(!reply.completed);
        assert_eq!(commands(&reply), vec!["echo TASK_COMPLETE"]);

        let text = "<file path=\"marker.txt\">\n```\nTASK_COMPLETE\n```\n</file>";
        let reply = parse_reply(text).unwrap();
        assert!(!reply.completed);
    }

    #[test]
    fn mixed_reply_preserves_directive_order() {
        let text = concat!(
            "First create the module:\n",
            "<file path=\"src/util.rs\">\n```rust\npub const X: u8 = 1;\n```\n</file>\n",
            "then check it compiles:\n",
            "```bash\ncargo check\n```\n",
            "TASK_COMPLETE\n",
        );
        let reply = parse_reply(text).unwrap();
        assert_eq!(reply.directives.len(), 2);
        assert!(matches!(reply.directives[0], Directive::WriteFile { .. }));
        assert!(matches!(reply.directives[1], Directive::RunCommand { .. }));
        assert!(reply.completed);
    }

    #[test]
    fn directives_after_the_completion_marker_are_ignored() {
        let text = "```bash\nmake\n```\nTASK_COMPLETE\n```bash\nmake clean\n```\n";
        let reply = parse_reply(text).unwrap();
        assert!(reply.completed);
        assert_eq!(commands(&reply), vec!["make"]);
    }

    #[test]
    fn prose_only_reply_is_empty_not_an_error() {
        let reply = parse_reply("I am thinking about the approach.").unwrap();
        assert!(reply.is_empty());
    }

    // -- PRD parsing --

    #[test]
    fn prd_reply_parses_phased_plan() {
        let text = concat!(
            "Here is the plan:\n",
            "```json\n",
            "{\"version\":1,\"phases\":[{\"name\":\"core\",\"tasks\":[",
            "{\"id\":\"setup\",\"description\":\"init repo\",\"depends_on\":[],",
            "\"criteria\":[{\"kind\":\"file_exists\",\"path\":\"Cargo.toml\"}]}]}]}\n",
            "```\n",
        );
        let prd = parse_prd_reply(text).unwrap();
        assert_eq!(prd.task_count(), 1);
        assert_eq!(prd.task_specs().next().unwrap().id.as_str(), "setup");
    }

    #[test]
    fn prd_reply_skips_non_json_fences() {
        let text = "```bash\necho hi\n```\n```json\n{\"phases\":[{\"tasks\":[{\"id\":\"a\",\"description\":\"d\"}]}]}\n```";
        let prd = parse_prd_reply(text).unwrap();
        assert_eq!(prd.task_count(), 1);
    }

    #[test]
    fn prd_reply_without_json_block_is_missing() {
        assert!(matches!(
            parse_prd_reply("no plan here"),
            Err(DirectiveError::MissingPlan)
        ));
    }

    #[test]
    fn prd_reply_with_bad_json_reports_parse_error() {
        let err = parse_prd_reply("```json\n{\"phases\": nonsense}\n```").unwrap_err();
        assert!(matches!(err, DirectiveError::InvalidPlan(_)));
    }

    #[test]
    fn prd_reply_with_no_tasks_is_empty() {
        let err = parse_prd_reply("```json\n{\"phases\":[]}\n```").unwrap_err();
        assert!(matches!(err, DirectiveError::EmptyPlan));
    }
}
