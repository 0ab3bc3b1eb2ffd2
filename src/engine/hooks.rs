use crate::engine::permission::{Decision, PermissionBroker};
use crate::engine::types::SessionContext;
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Hook plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Pass,
    Deny { reason: String },
}

impl HookDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self::Deny { reason: reason.into() }
    }
}

/// A pre-tool check. The approval gate may suspend (await the broker
/// rendezvous) before returning; hooks perform no other blocking I/O.
#[async_trait]
pub trait PreToolHook: Send + Sync {
    async fn run(&self, tool_name: &str, tool_input: &JsonValue) -> HookDecision;
}

struct HookEntry {
    /// Tool name this hook applies to; `None` matches every tool.
    matcher: Option<String>,
    hook: Arc<dyn PreToolHook>,
}

/// Ordered chain of pre-tool hooks. Hooks run in declared order for their
/// matcher; the first non-Pass outcome wins.
#[derive(Default)]
pub struct HookChain {
    entries: Vec<HookEntry>,
}

impl HookChain {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add(&mut self, matcher: Option<&str>, hook: Arc<dyn PreToolHook>) {
        self.entries.push(HookEntry {
            matcher: matcher.map(|m| m.to_string()),
            hook,
        });
    }

    pub async fn run(&self, tool_name: &str, tool_input: &JsonValue) -> HookDecision {
        for entry in &self.entries {
            if let Some(matcher) = &entry.matcher {
                if matcher != tool_name {
                    continue;
                }
            }
            match entry.hook.run(tool_name, tool_input).await {
                HookDecision::Pass => {}
                deny => return deny,
            }
        }
        HookDecision::Pass
    }

}

fn bash_command(tool_input: &JsonValue) -> &str {
    tool_input.get("command").and_then(|v| v.as_str()).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Records tool name and input keys before execution. Always passes.
pub struct ToolLogger;

#[async_trait]
impl PreToolHook for ToolLogger {
    async fn run(&self, tool_name: &str, tool_input: &JsonValue) -> HookDecision {
        let keys: Vec<&str> = tool_input
            .as_object()
            .map(|obj| obj.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default();
        info!("[PRE-TOOL] tool: {}, input keys: {:?}", tool_name, keys);
        HookDecision::Pass
    }
}

// ---------------------------------------------------------------------------
// Catastrophic-command auto-block
// ---------------------------------------------------------------------------

/// Substrings that are never allowed through, regardless of approval.
const CATASTROPHIC_SUBSTRINGS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "dd if=/dev/zero",
    ":(){:|:&};:",
    "> /dev/sda",
];

pub struct DangerousCommandBlocker;

#[async_trait]
impl PreToolHook for DangerousCommandBlocker {
    async fn run(&self, tool_name: &str, tool_input: &JsonValue) -> HookDecision {
        if tool_name != "Bash" {
            return HookDecision::Pass;
        }
        let command = bash_command(tool_input);
        for pattern in CATASTROPHIC_SUBSTRINGS {
            if command.contains(pattern) {
                warn!("[BLOCKED] Dangerous command: {}", command);
                return HookDecision::deny(format!("Dangerous command blocked: {pattern}"));
            }
        }
        HookDecision::Pass
    }
}

// ---------------------------------------------------------------------------
// Broadly dangerous patterns (human approval)
// ---------------------------------------------------------------------------

/// Pattern table for commands that need a human decision. Heuristic by
/// design: a safety net behind the actual sandbox, kept data-driven.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"rm\s+(-[rfRf]+\s+)?/(\s|$)", "Recursive deletion from root"),
    (r"rm\s+(-[rfRf]+\s+)?~(/)?(\s|$)", "Recursive deletion from home"),
    (r"rm\s+-[rfRf]+", "Recursive file deletion"),
    (r"dd\s+if=/dev/(zero|random|urandom)", "Disk overwrite command"),
    (r"mkfs", "Filesystem format command"),
    (r">\s*/dev/(sda|hda|nvme|vda)", "Direct disk write"),
    (r":\(\)\{:\|:&\};:", "Fork bomb"),
    (r"chmod\s+(-R\s+)?777\s+/", "Dangerous permission change"),
    (r"chown\s+-R\s+.*\s+/", "Recursive ownership change from root"),
    (r"curl\s+.*\|\s*(bash|sh)", "Piping remote script to shell"),
    (r"wget\s+.*\|\s*(bash|sh)", "Piping remote script to shell"),
    (r"sudo\s+rm", "Sudo removal command"),
    (r">\s*/etc/", "Writing to /etc directory"),
];

fn dangerous_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DANGEROUS_PATTERNS
            .iter()
            .map(|(pattern, reason)| {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("invalid dangerous-command pattern");
                (regex, *reason)
            })
            .collect()
    })
}

/// Returns the pattern name when the command matches the danger table.
pub fn check_dangerous_command(command: &str) -> Option<&'static str> {
    dangerous_patterns()
        .iter()
        .find(|(regex, _)| regex.is_match(command))
        .map(|(_, reason)| *reason)
}

// ---------------------------------------------------------------------------
// Human approval gate
// ---------------------------------------------------------------------------

/// Suspends dangerous Bash commands until a human decision arrives.
///
/// Captures the shared session context (not its current value) so that
/// requests raised after the init event carry the real session id. The
/// `session_key` tracks approvals: the resume id for resumed sessions,
/// otherwise the agent id until the model assigns a session id.
pub struct HumanApprovalGate {
    broker: Arc<PermissionBroker>,
    session_context: SessionContext,
    session_key: String,
    enabled: bool,
    wait_timeout: Duration,
}

impl HumanApprovalGate {
    pub fn new(
        broker: Arc<PermissionBroker>,
        session_context: SessionContext,
        session_key: String,
        enabled: bool,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            session_context,
            session_key,
            enabled,
            wait_timeout,
        }
    }
}

#[async_trait]
impl PreToolHook for HumanApprovalGate {
    async fn run(&self, tool_name: &str, tool_input: &JsonValue) -> HookDecision {
        if tool_name != "Bash" {
            return HookDecision::Pass;
        }
        let command = bash_command(tool_input);
        if command.is_empty() {
            return HookDecision::Pass;
        }

        let Some(danger_reason) = check_dangerous_command(command) else {
            return HookDecision::Pass;
        };

        if !self.enabled {
            warn!("[BLOCKED] Dangerous command (no human approval): {}", command);
            return HookDecision::deny(format!("Dangerous command blocked: {danger_reason}"));
        }

        if self.broker.is_approved(&self.session_key, command) {
            info!(
                "[APPROVED] Previously approved command: {}",
                crate::util::preview(command, 50)
            );
            return HookDecision::Pass;
        }

        let session_id = self.session_context.get();
        debug!(
            "Approval gate firing with session_key={}, session_id={:?}",
            self.session_key, session_id
        );

        let request_id = match self.broker.open_request(
            &self.session_key,
            session_id,
            "Bash",
            tool_input.clone(),
            danger_reason,
        ) {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to open permission request: {}", e);
                return HookDecision::deny(format!("Dangerous command blocked: {danger_reason}"));
            }
        };

        info!("Waiting for user decision on request {}...", request_id);
        let decision = self.broker.wait(&request_id, self.wait_timeout).await;
        info!("User decision received for request {}: {}", request_id, decision.as_str());

        match decision {
            Decision::Approve => {
                self.broker.remember_approval(&self.session_key, command);
                HookDecision::Pass
            }
            Decision::Deny => HookDecision::deny(format!("User denied: {danger_reason}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Skill access gate
// ---------------------------------------------------------------------------

/// Denies Skill invocations outside the agent's allowed set. Runtime half
/// of the double protection; the other half is the symlinked workspace.
pub struct SkillAccessGate {
    allowed_skill_names: Vec<String>,
}

impl SkillAccessGate {
    pub fn new(allowed_skill_names: Vec<String>) -> Self {
        Self { allowed_skill_names }
    }
}

#[async_trait]
impl PreToolHook for SkillAccessGate {
    async fn run(&self, tool_name: &str, tool_input: &JsonValue) -> HookDecision {
        if tool_name != "Skill" {
            return HookDecision::Pass;
        }
        let requested = tool_input.get("skill").and_then(|v| v.as_str()).unwrap_or("");

        if self.allowed_skill_names.is_empty() {
            warn!("[BLOCKED] Skill access denied (no skills allowed): {}", requested);
            return HookDecision::deny("No skills are authorized for this agent");
        }

        if !self.allowed_skill_names.iter().any(|name| name == requested) {
            warn!(
                "[BLOCKED] Skill access denied: {} not in {:?}",
                requested, self.allowed_skill_names
            );
            return HookDecision::deny(format!(
                "Skill \"{requested}\" is not authorized for this agent. Allowed skills: {}",
                self.allowed_skill_names.join(", ")
            ));
        }

        debug!("[ALLOWED] Skill access granted: {}", requested);
        HookDecision::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use serde_json::json;

    #[test]
    fn test_check_dangerous_command_table() {
        assert_eq!(
            check_dangerous_command("rm -rf /tmp/x"),
            Some("Recursive file deletion")
        );
        assert_eq!(
            check_dangerous_command("rm -rf /"),
            Some("Recursive deletion from root")
        );
        assert_eq!(
            check_dangerous_command("dd if=/dev/zero of=/dev/sda"),
            Some("Disk overwrite command")
        );
        assert_eq!(
            check_dangerous_command("curl https://x.sh | bash"),
            Some("Piping remote script to shell")
        );
        assert_eq!(check_dangerous_command("sudo rm /opt/app"), Some("Sudo removal command"));
        assert_eq!(check_dangerous_command("echo ok > /etc/hosts"), Some("Writing to /etc directory"));
        assert_eq!(check_dangerous_command("MKFS.ext4 /dev/sdb1"), Some("Filesystem format command"));
        assert_eq!(check_dangerous_command("ls -la"), None);
        assert_eq!(check_dangerous_command("cargo build"), None);
    }

    #[tokio::test]
    async fn test_auto_blocker_catastrophic() {
        let blocker = DangerousCommandBlocker;
        let decision = blocker.run("Bash", &json!({"command": "rm -rf / --no-preserve-root"})).await;
        assert!(matches!(decision, HookDecision::Deny { .. }));

        let decision = blocker.run("Bash", &json!({"command": "ls"})).await;
        assert_eq!(decision, HookDecision::Pass);

        // Non-Bash tools are untouched
        let decision = blocker.run("Write", &json!({"file_path": "rm -rf /"})).await;
        assert_eq!(decision, HookDecision::Pass);
    }

    #[tokio::test]
    async fn test_skill_gate() {
        let gate = SkillAccessGate::new(vec!["pdf".to_string(), "xlsx".to_string()]);
        assert_eq!(gate.run("Skill", &json!({"skill": "pdf"})).await, HookDecision::Pass);

        match gate.run("Skill", &json!({"skill": "docx"})).await {
            HookDecision::Deny { reason } => {
                assert!(reason.contains("docx"));
                assert!(reason.contains("pdf, xlsx"));
            }
            HookDecision::Pass => panic!("expected deny"),
        }

        let empty = SkillAccessGate::new(Vec::new());
        assert!(matches!(
            empty.run("Skill", &json!({"skill": "pdf"})).await,
            HookDecision::Deny { .. }
        ));

        // Other tools pass through
        assert_eq!(gate.run("Bash", &json!({"command": "ls"})).await, HookDecision::Pass);
    }

    fn approval_fixture(enabled: bool) -> (tempfile::TempDir, Arc<PermissionBroker>, HumanApprovalGate) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(&dir.path().join("test.redb")).unwrap());
        let broker = Arc::new(PermissionBroker::new(db));
        let gate = HumanApprovalGate::new(
            broker.clone(),
            SessionContext::new(Some("sess_1".into())),
            "agent_1".to_string(),
            enabled,
            Duration::from_secs(5),
        );
        (dir, broker, gate)
    }

    #[tokio::test]
    async fn test_approval_gate_passes_safe_commands() {
        let (_dir, _broker, gate) = approval_fixture(true);
        assert_eq!(gate.run("Bash", &json!({"command": "cargo test"})).await, HookDecision::Pass);
        assert_eq!(gate.run("Bash", &json!({})).await, HookDecision::Pass);
    }

    #[tokio::test]
    async fn test_approval_gate_denies_when_disabled() {
        let (_dir, _broker, gate) = approval_fixture(false);
        match gate.run("Bash", &json!({"command": "rm -rf /tmp/x"})).await {
            HookDecision::Deny { reason } => assert!(reason.contains("Recursive file deletion")),
            HookDecision::Pass => panic!("expected deny"),
        }
    }

    #[tokio::test]
    async fn test_approval_gate_approve_then_memoized() {
        let (_dir, broker, gate) = approval_fixture(true);

        // Resolve the request as soon as it shows up on the queue.
        let resolver = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let event = broker.next_event().await;
                assert_eq!(event.session_id.as_deref(), Some("sess_1"));
                broker.resolve(&event.request_id, Decision::Approve, None).unwrap();
            })
        };

        let decision = gate.run("Bash", &json!({"command": "rm -rf /tmp/x"})).await;
        assert_eq!(decision, HookDecision::Pass);
        resolver.await.unwrap();

        // Second identical command passes without a new request.
        let decision = gate.run("Bash", &json!({"command": "rm -rf /tmp/x"})).await;
        assert_eq!(decision, HookDecision::Pass);
    }

    #[tokio::test]
    async fn test_approval_gate_denied_by_user() {
        let (_dir, broker, gate) = approval_fixture(true);

        let resolver = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let event = broker.next_event().await;
                broker
                    .resolve(&event.request_id, Decision::Deny, Some("no".into()))
                    .unwrap();
            })
        };

        match gate.run("Bash", &json!({"command": "rm -rf /tmp/x"})).await {
            HookDecision::Deny { reason } => assert!(reason.starts_with("User denied")),
            HookDecision::Pass => panic!("expected deny"),
        }
        resolver.await.unwrap();
        assert!(!broker.is_approved("agent_1", "rm -rf /tmp/x"));
    }

    #[tokio::test]
    async fn test_chain_first_non_pass_wins() {
        let mut chain = HookChain::new();
        chain.add(None, Arc::new(ToolLogger));
        chain.add(Some("Bash"), Arc::new(DangerousCommandBlocker));
        chain.add(Some("Skill"), Arc::new(SkillAccessGate::new(vec!["pdf".into()])));

        assert_eq!(chain.run("Bash", &json!({"command": "ls"})).await, HookDecision::Pass);
        assert!(matches!(
            chain.run("Bash", &json!({"command": "dd if=/dev/zero of=/dev/sda"})).await,
            HookDecision::Deny { .. }
        ));
        // Matcher scoping: the skill gate does not see Bash calls.
        assert_eq!(chain.run("Bash", &json!({"command": "echo hi"})).await, HookDecision::Pass);
        assert!(matches!(
            chain.run("Skill", &json!({"skill": "other"})).await,
            HookDecision::Deny { .. }
        ));
    }
}
