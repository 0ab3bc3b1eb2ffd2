use crate::config::SandboxDefaults;
use crate::db::{SandboxConfig, SandboxNetworkConfig};
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Transcript content blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
    Document {
        media_type: String,
        data: String,
        #[serde(default)]
        name: Option<String>,
    },
}

/// User input for a turn: plain text or a multimodal block list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserInput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserInput {
    /// Text used for session titles and log previews. Block-only input
    /// falls back to a placeholder.
    pub fn display_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .find_map(|b| match b {
                    ContentBlock::Text { text } if !text.is_empty() => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "[Attachment message]".to_string()),
        }
    }

    /// Content blocks persisted as the user message.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) => vec![ContentBlock::Text { text }],
            Self::Blocks(blocks) => blocks,
        }
    }
}

// ---------------------------------------------------------------------------
// Events from the model agent (the narrow inbound interface)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First event of a session; carries the id every later lookup keys on.
    Init {
        session_id: String,
    },
    Assistant {
        content: Vec<ContentBlock>,
        #[serde(default)]
        model: Option<String>,
    },
    /// The agent wants to run a tool and waits for an allow/deny reply.
    ToolRequest {
        request_id: String,
        tool_name: String,
        tool_input: JsonValue,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        /// Output of slash commands (/help, /compact, ...), when any.
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default = "default_num_turns")]
        num_turns: u32,
    },
    Error {
        message: String,
        #[serde(default)]
        detail: Option<String>,
    },
}

fn default_num_turns() -> u32 {
    1
}

/// Reply to a `ToolRequest` after the hook chain ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum ToolDecision {
    Allow,
    Deny { message: String },
}

// ---------------------------------------------------------------------------
// Events to the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    SessionStart {
        session_id: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        content: Vec<ContentBlock>,
        model: String,
    },
    AskUserQuestion {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        tool_use_id: String,
        questions: JsonValue,
    },
    PermissionRequest {
        session_id: String,
        request_id: String,
        tool_name: String,
        tool_input: JsonValue,
        reason: String,
        options: Vec<String>,
    },
    PermissionAcknowledged {
        request_id: String,
        decision: String,
    },
    Result {
        session_id: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        num_turns: u32,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggested_action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Options handed to the model agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpServerDef {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Sse {
        url: String,
    },
    Http {
        url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PluginSource {
    Local { path: String },
}

/// Wire form of the sandbox settings object, camelCased for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSettings {
    pub enabled: bool,
    pub auto_allow_bash_if_sandboxed: bool,
    pub excluded_commands: Vec<String>,
    pub allow_unsandboxed_commands: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<SandboxNetwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxNetwork {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_local_binding: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allow_unix_sockets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_all_unix_sockets: Option<bool>,
}

impl SandboxSettings {
    /// Resolve an agent's sandbox config against process defaults.
    /// Returns `None` when the sandbox is disabled for the turn.
    pub fn resolve(config: &SandboxConfig, defaults: &SandboxDefaults) -> Option<Self> {
        let enabled = config.enabled.unwrap_or(defaults.enabled);
        if !enabled {
            return None;
        }
        let excluded = if config.excluded_commands.is_empty() {
            defaults.excluded_commands.clone()
        } else {
            config.excluded_commands.clone()
        };
        Some(Self {
            enabled: true,
            auto_allow_bash_if_sandboxed: config
                .auto_allow_bash_if_sandboxed
                .unwrap_or(defaults.auto_allow_bash),
            excluded_commands: excluded,
            allow_unsandboxed_commands: config
                .allow_unsandboxed_commands
                .unwrap_or(defaults.allow_unsandboxed),
            network: network_settings(&config.network),
        })
    }
}

fn network_settings(network: &SandboxNetworkConfig) -> Option<SandboxNetwork> {
    if !network.allow_local_binding
        && network.allow_unix_sockets.is_empty()
        && !network.allow_all_unix_sockets
    {
        return None;
    }
    Some(SandboxNetwork {
        allow_local_binding: network.allow_local_binding.then_some(true),
        allow_unix_sockets: network.allow_unix_sockets.clone(),
        allow_all_unix_sockets: network.allow_all_unix_sockets.then_some(true),
    })
}

/// Options object handed to the model agent when a session starts.
/// Hooks and the file-access policy are enforced supervisor-side and are
/// not part of the wire options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOptions {
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub mcp_servers: BTreeMap<String, McpServerDef>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub plugins: Vec<PluginSource>,
    pub permission_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting_sources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSettings>,
    pub max_buffer_size: usize,
}

// ---------------------------------------------------------------------------
// Shared session context
// ---------------------------------------------------------------------------

/// Mutable cell holding the session id assigned by the model agent.
///
/// Created before the hooks so they capture the cell, not a snapshot:
/// a permission request raised after the init event must carry the real
/// session id even though the hook was built before it was known.
#[derive(Clone, Default)]
pub struct SessionContext {
    inner: Arc<Mutex<Option<String>>>,
}

impl SessionContext {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.inner.lock().expect("session context poisoned").clone()
    }

    pub fn set(&self, session_id: String) {
        *self.inner.lock().expect("session context poisoned") = Some(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_text_from_blocks() {
        let input = UserInput::Blocks(vec![
            ContentBlock::Image {
                media_type: "image/png".into(),
                data: "...".into(),
            },
            ContentBlock::Text { text: "describe this".into() },
        ]);
        assert_eq!(input.display_text(), "describe this");

        let attachment_only = UserInput::Blocks(vec![ContentBlock::Image {
            media_type: "image/png".into(),
            data: "...".into(),
        }]);
        assert_eq!(attachment_only.display_text(), "[Attachment message]");
    }

    #[test]
    fn test_content_block_wire_format() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "Bash".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "Bash");
    }

    #[test]
    fn test_sandbox_resolution_defaults() {
        let defaults = SandboxDefaults::default();
        let config = SandboxConfig::default();
        let settings = SandboxSettings::resolve(&config, &defaults).unwrap();
        assert!(settings.enabled);
        assert!(settings.auto_allow_bash_if_sandboxed);
        assert!(settings.network.is_none());

        let disabled = SandboxConfig {
            enabled: Some(false),
            ..SandboxConfig::default()
        };
        assert!(SandboxSettings::resolve(&disabled, &defaults).is_none());
    }

    #[test]
    fn test_sandbox_wire_is_camel_case() {
        let settings = SandboxSettings {
            enabled: true,
            auto_allow_bash_if_sandboxed: true,
            excluded_commands: vec!["git".into()],
            allow_unsandboxed_commands: false,
            network: Some(SandboxNetwork {
                allow_local_binding: Some(true),
                allow_unix_sockets: Vec::new(),
                allow_all_unix_sockets: None,
            }),
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["autoAllowBashIfSandboxed"], true);
        assert_eq!(json["excludedCommands"][0], "git");
        assert_eq!(json["network"]["allowLocalBinding"], true);
    }

    #[test]
    fn test_session_context_updates_visible_to_clones() {
        let ctx = SessionContext::new(None);
        let clone = ctx.clone();
        assert!(clone.get().is_none());
        ctx.set("sess_1".into());
        assert_eq!(clone.get().as_deref(), Some("sess_1"));
    }
}
