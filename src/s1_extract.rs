use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Priority tag carried on every tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPriority {
    /// Mutates the workspace: writes, edits, shell commands.
    High,
    /// Reaches outside the workspace: sub-agents, web, MCP servers.
    Medium,
    /// Read-only inspection.
    Low,
}

/// Coarse tool family, shared by priority tagging, activity weights and
/// description synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    FileRead,
    FileWrite,
    FileEdit,
    Command,
    Search,
    Task,
    Web,
    Mcp,
    Other,
}

pub fn classify_tool(name: &str) -> ToolKind {
    match name {
        "Bash" | "BashOutput" | "KillShell" => ToolKind::Command,
        "Read" | "LS" | "NotebookRead" => ToolKind::FileRead,
        "Write" => ToolKind::FileWrite,
        "Edit" | "MultiEdit" | "NotebookEdit" => ToolKind::FileEdit,
        "Grep" | "Glob" => ToolKind::Search,
        "Task" => ToolKind::Task,
        "WebFetch" | "WebSearch" => ToolKind::Web,
        _ if name.starts_with("mcp__") || name.contains("__") => ToolKind::Mcp,
        _ => ToolKind::Other,
    }
}

pub fn tool_priority(name: &str) -> ToolPriority {
    match classify_tool(name) {
        ToolKind::FileWrite | ToolKind::FileEdit | ToolKind::Command => ToolPriority::High,
        ToolKind::Task | ToolKind::Web | ToolKind::Mcp => ToolPriority::Medium,
        ToolKind::FileRead | ToolKind::Search | ToolKind::Other => ToolPriority::Low,
    }
}

/// True if the shell command runs a test suite.
pub fn is_test_command(command: &str) -> bool {
    const RUNNERS: &[&str] = &[
        "cargo test",
        "cargo nextest",
        "pytest",
        "python -m pytest",
        "npm test",
        "npm run test",
        "yarn test",
        "pnpm test",
        "go test",
        "jest",
        "vitest",
        "mvn test",
        "gradle test",
        "rspec",
        "make test",
    ];
    command
        .split("&&")
        .flat_map(|s| s.split(';'))
        .map(str::trim)
        .any(|seg| RUNNERS.iter().any(|r| seg.starts_with(r)))
}

/// File path a write/edit-style tool touched, if any.
pub fn touched_file(name: &str, args: &Value) -> Option<String> {
    match classify_tool(name) {
        ToolKind::FileWrite | ToolKind::FileEdit => args
            .get("file_path")
            .or_else(|| args.get("notebook_path"))
            .or_else(|| args.get("path"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(Into::into),
        _ => None,
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

fn preview(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= max && !s.trim().contains('\n') {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(max).collect();
    format!("{cut}…")
}

/// One-line description of a tool call in place of its literal payload.
pub fn describe_call(name: &str, args: &Value) -> String {
    match name {
        "Bash" => format!("Bash: {}", preview(str_arg(args, "command"), 120)),
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" | "NotebookRead" => {
            let path = args
                .get("file_path")
                .or_else(|| args.get("notebook_path"))
                .and_then(Value::as_str)
                .unwrap_or("?");
            match name {
                "MultiEdit" => {
                    let n = args.get("edits").and_then(Value::as_array).map_or(0, Vec::len);
                    format!("MultiEdit {path} ({n} edits)")
                }
                _ => format!("{name} {path}"),
            }
        }
        "Grep" => {
            let pattern = str_arg(args, "pattern");
            let path = str_arg(args, "path");
            if path.is_empty() {
                format!("Grep '{}'", preview(pattern, 80))
            } else {
                format!("Grep '{}' in {path}", preview(pattern, 80))
            }
        }
        "Glob" => format!("Glob {}", str_arg(args, "pattern")),
        "LS" => format!("LS {}", str_arg(args, "path")),
        "Task" => {
            let desc = args
                .get("description")
                .or_else(|| args.get("prompt"))
                .and_then(Value::as_str)
                .unwrap_or("");
            format!("Task: {}", preview(desc, 100))
        }
        "WebFetch" => format!("WebFetch {}", str_arg(args, "url")),
        "WebSearch" => format!("WebSearch '{}'", preview(str_arg(args, "query"), 100)),
        "TodoWrite" => {
            let n = args.get("todos").and_then(Value::as_array).map_or(0, Vec::len);
            format!("TodoWrite ({n} items)")
        }
        _ => {
            let keys: Vec<&str> = args
                .as_object()
                .map(|o| o.keys().map(String::as_str).take(4).collect())
                .unwrap_or_default();
            if keys.is_empty() {
                name.to_string()
            } else {
                format!("{name}({})", keys.join(", "))
            }
        }
    }
}

/// One-line description of a tool result: outcome plus size, never the payload.
pub fn describe_result(name: &str, result: &str, is_error: bool) -> String {
    let label = if name.is_empty() { "tool" } else { name };
    if is_error {
        return format!("{label} failed: {}", preview(result, 120));
    }
    let lines = result.lines().count();
    match classify_tool(name) {
        ToolKind::FileRead => format!("{label} returned {lines} lines"),
        ToolKind::Search => {
            let hits = result.lines().filter(|l| !l.trim().is_empty()).count();
            format!("{label} matched {hits} entries")
        }
        ToolKind::Command => {
            if lines == 0 {
                format!("{label} ok (no output)")
            } else {
                format!("{label} ok, {lines} lines: {}", preview(result, 80))
            }
        }
        ToolKind::FileWrite | ToolKind::FileEdit => format!("{label} applied"),
        _ => format!("{label} returned {} chars", result.chars().count()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_and_priority() {
        assert_eq!(classify_tool("Edit"), ToolKind::FileEdit);
        assert_eq!(classify_tool("mcp__github__create_issue"), ToolKind::Mcp);
        assert_eq!(tool_priority("Bash"), ToolPriority::High);
        assert_eq!(tool_priority("WebFetch"), ToolPriority::Medium);
        assert_eq!(tool_priority("Grep"), ToolPriority::Low);
        assert_eq!(tool_priority("SomethingNew"), ToolPriority::Low);
    }

    #[test]
    fn touched_files_only_for_mutations() {
        let args = json!({"file_path": "/src/auth.rs"});
        assert_eq!(touched_file("Edit", &args).as_deref(), Some("/src/auth.rs"));
        assert_eq!(touched_file("Write", &args).as_deref(), Some("/src/auth.rs"));
        assert_eq!(touched_file("Read", &args), None);
        let nb = json!({"notebook_path": "/nb.ipynb"});
        assert_eq!(touched_file("NotebookEdit", &nb).as_deref(), Some("/nb.ipynb"));
        assert_eq!(touched_file("Edit", &json!({})), None);
    }

    #[test]
    fn test_runner_detection() {
        assert!(is_test_command("cargo test -p gmem"));
        assert!(is_test_command("cd web && npm test"));
        assert!(is_test_command("pytest -x tests/"));
        assert!(!is_test_command("cargo build"));
        assert!(!is_test_command("echo pytest"));
    }

    #[test]
    fn call_descriptions_are_one_line() {
        assert_eq!(describe_call("Edit", &json!({"file_path": "src/a.rs", "old_string": "x\ny"})), "Edit src/a.rs");
        assert_eq!(describe_call("Bash", &json!({"command": "cargo test"})), "Bash: cargo test");
        let long = describe_call("Bash", &json!({"command": "echo one\necho two"}));
        assert_eq!(long, "Bash: echo one…");
        assert_eq!(describe_call("Grep", &json!({"pattern": "fn main", "path": "src"})), "Grep 'fn main' in src");
        assert_eq!(
            describe_call("MultiEdit", &json!({"file_path": "a.rs", "edits": [{}, {}]})),
            "MultiEdit a.rs (2 edits)"
        );
        assert_eq!(describe_call("mcp__x__y", &json!({"q": 1})), "mcp__x__y(q)");
        assert_eq!(describe_call("Task", &json!({"prompt": "a\nb\nc"})), "Task: a…");
    }

    #[test]
    fn result_descriptions_hide_payload() {
        let body = "line\n".repeat(300);
        let d = describe_result("Read", &body, false);
        assert_eq!(d, "Read returned 300 lines");
        assert!(describe_result("Bash", "boom\ntrace", true).starts_with("Bash failed: boom"));
        assert_eq!(describe_result("Bash", "", false), "Bash ok (no output)");
        assert_eq!(describe_result("", "abc", false), "tool returned 3 chars");
    }
}
