use regex::Regex;
use serde_json::Value as JsonValue;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Outcome of a path-access check. Denials carry a message for the model
/// and never interrupt the session; the model is free to retry differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny { message: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// File tools and the name of their path argument.
const FILE_TOOL_PATH_PARAMS: &[(&str, &str)] = &[
    ("Read", "file_path"),
    ("Write", "file_path"),
    ("Edit", "file_path"),
    ("Glob", "path"),
    ("Grep", "path"),
];

/// Regexes that pull candidate file paths out of a bash command string.
fn bash_path_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Bare absolute-path arguments like /etc/passwd
            r"\s(/[^\s]+)",
            // Read commands
            r"(?:cat|head|tail|less|more|nano|vi|vim|emacs)\s+([^\s|>&]+)",
            // Write redirects
            r"(?:echo|printf|tee)\s+.*?>\s*([^\s|>&]+)",
            // File manipulation
            r"(?:cp|mv|rm|mkdir|rmdir|touch)\s+.*?([^\s|>&]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("invalid bash path pattern"))
        .collect()
    })
}

/// Lexically normalize a path (resolve `.` and `..` components without
/// touching the filesystem).
fn normalize(path: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path gate bound at option-build time to the turn's allowed directories:
/// the working directory plus caller-supplied extras and runtime additions.
#[derive(Debug, Clone)]
pub struct ContentAccessPolicy {
    allowed_dirs: Vec<PathBuf>,
}

impl ContentAccessPolicy {
    pub fn new(allowed_dirs: &[String]) -> Self {
        Self {
            allowed_dirs: allowed_dirs
                .iter()
                .map(|d| normalize(d.trim_end_matches('/')))
                .collect(),
        }
    }

    fn path_allowed(&self, path: &Path) -> bool {
        self.allowed_dirs
            .iter()
            .any(|dir| path == dir || path.starts_with(dir))
    }

    fn allowed_list(&self) -> String {
        self.allowed_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Gate a tool invocation. File tools are checked on their path
    /// argument; Bash commands are scanned for escaping absolute paths;
    /// everything else is allowed.
    pub fn check(&self, tool_name: &str, input: &JsonValue) -> AccessDecision {
        if let Some((_, path_param)) = FILE_TOOL_PATH_PARAMS
            .iter()
            .find(|(tool, _)| *tool == tool_name)
        {
            return self.check_file_tool(tool_name, input, path_param);
        }
        if tool_name == "Bash" {
            return self.check_bash(input);
        }
        AccessDecision::Allow
    }

    fn check_file_tool(&self, tool_name: &str, input: &JsonValue, path_param: &str) -> AccessDecision {
        let file_path = input.get(path_param).and_then(|v| v.as_str()).unwrap_or("");
        // No path argument: allow, the tool reports its own error.
        if file_path.is_empty() {
            return AccessDecision::Allow;
        }
        // Relative paths resolve under the cwd, which is allowed by construction.
        if !file_path.starts_with('/') {
            return AccessDecision::Allow;
        }

        let normalized = normalize(file_path);
        if self.path_allowed(&normalized) {
            debug!("[FILE ACCESS ALLOWED] tool: {}, path: {}", tool_name, file_path);
            AccessDecision::Allow
        } else {
            warn!(
                "[FILE ACCESS DENIED] tool: {}, path: {}, allowed: {}",
                tool_name,
                file_path,
                self.allowed_list()
            );
            AccessDecision::Deny {
                message: format!(
                    "File access denied: {file_path} is outside allowed directories"
                ),
            }
        }
    }

    fn check_bash(&self, input: &JsonValue) -> AccessDecision {
        let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
        if command.is_empty() {
            return AccessDecision::Allow;
        }

        let mut candidates: Vec<String> = Vec::new();
        for pattern in bash_path_patterns() {
            for caps in pattern.captures_iter(command) {
                if let Some(m) = caps.get(1) {
                    candidates.push(m.as_str().to_string());
                }
            }
        }

        for candidate in candidates {
            // Relative paths stay under the cwd.
            if !candidate.starts_with('/') {
                continue;
            }
            let normalized = normalize(&candidate);
            if !self.path_allowed(&normalized) {
                warn!(
                    "[BASH FILE ACCESS DENIED] command: {}, path: {}, allowed: {}",
                    crate::util::preview(command, 100),
                    candidate,
                    self.allowed_list()
                );
                return AccessDecision::Deny {
                    message: format!(
                        "Bash file access denied: command attempts to access {candidate} which is outside allowed directories ({})",
                        self.allowed_list()
                    ),
                };
            }
        }
        debug!("[BASH ALLOWED] command: {}", crate::util::preview(command, 100));
        AccessDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> ContentAccessPolicy {
        ContentAccessPolicy::new(&["/work/agent-1".to_string(), "/data/shared".to_string()])
    }

    #[test]
    fn test_file_tool_inside_allowed() {
        let decision = policy().check("Read", &json!({"file_path": "/work/agent-1/notes.md"}));
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_file_tool_exact_dir_allowed() {
        assert!(policy().check("Glob", &json!({"path": "/work/agent-1"})).is_allowed());
    }

    #[test]
    fn test_file_tool_outside_denied() {
        let decision = policy().check("Write", &json!({"file_path": "/etc/passwd"}));
        match decision {
            AccessDecision::Deny { message } => assert!(message.contains("/etc/passwd")),
            AccessDecision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn test_prefix_trickery_denied() {
        // /work/agent-10 shares a string prefix with /work/agent-1 but is
        // not beneath it.
        let decision = policy().check("Read", &json!({"file_path": "/work/agent-10/secret"}));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_dotdot_escape_denied() {
        let decision = policy().check("Read", &json!({"file_path": "/work/agent-1/../agent-2/x"}));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_relative_path_allowed() {
        assert!(policy().check("Read", &json!({"file_path": "src/main.rs"})).is_allowed());
        assert!(policy().check("Grep", &json!({})).is_allowed());
    }

    #[test]
    fn test_bash_absolute_escape_denied() {
        let decision = policy().check("Bash", &json!({"command": "cat /etc/shadow"}));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_bash_redirect_escape_denied() {
        let decision = policy().check("Bash", &json!({"command": "echo pwned > /etc/hosts"}));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_bash_inside_allowed() {
        assert!(policy()
            .check("Bash", &json!({"command": "cat /work/agent-1/notes.md"}))
            .is_allowed());
        assert!(policy()
            .check("Bash", &json!({"command": "ls -la && grep foo notes.md"}))
            .is_allowed());
    }

    #[test]
    fn test_other_tools_pass() {
        assert!(policy().check("WebSearch", &json!({"query": "/etc/passwd"})).is_allowed());
        assert!(policy().check("Skill", &json!({"skill": "pdf"})).is_allowed());
    }
}
