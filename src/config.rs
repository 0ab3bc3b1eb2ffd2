use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Anthropic API model ID -> AWS Bedrock model ID.
/// Consulted when the Bedrock backend is selected for a turn.
const ANTHROPIC_TO_BEDROCK: &[(&str, &str)] = &[
    (
        "claude-haiku-4-5-20251001",
        "global.anthropic.claude-haiku-4-5-20251001-v1:0",
    ),
    (
        "claude-sonnet-4-5-20250929",
        "global.anthropic.claude-sonnet-4-5-20250929-v1:0",
    ),
    (
        "claude-opus-4-5-20251101",
        "global.anthropic.claude-opus-4-5-20251101-v1:0",
    ),
];

/// Convert an Anthropic model ID to its Bedrock equivalent.
/// Unknown IDs pass through unchanged.
pub fn bedrock_model_id(anthropic_model_id: &str) -> String {
    ANTHROPIC_TO_BEDROCK
        .iter()
        .find(|(api_id, _)| *api_id == anthropic_model_id)
        .map(|(_, bedrock_id)| bedrock_id.to_string())
        .unwrap_or_else(|| anthropic_model_id.to_string())
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub agent: AgentRuntimeConfig,
    #[serde(default)]
    pub sandbox: SandboxDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Filesystem roots the managers operate on.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Main workspace; user skills live under `{dir}/.claude/skills/`.
    pub dir: PathBuf,
    /// Isolated per-agent workspaces root. Kept OUTSIDE the project tree so
    /// the model agent's skill discovery cannot walk into unauthorized
    /// sibling directories.
    pub agents_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: crate::paths::maestro_home().join("workspace"),
            agents_dir: std::env::temp_dir().join("maestro-agent-workspaces"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentRuntimeConfig {
    /// Command used to launch the model-agent subprocess.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Default model when an agent profile does not pin one.
    pub default_model: String,
    /// Seconds a suspended approval hook waits before expiring the request.
    pub permission_wait_secs: u64,
    /// Max buffered bytes for a single JSON event from the agent.
    pub max_buffer_size: usize,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            command: "claude-agent".to_string(),
            args: Vec::new(),
            default_model: "claude-sonnet-4-5-20250929".to_string(),
            permission_wait_secs: 300,
            max_buffer_size: 10 * 1024 * 1024,
        }
    }
}

/// Defaults applied when an agent profile leaves sandbox fields unset.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SandboxDefaults {
    pub enabled: bool,
    pub auto_allow_bash: bool,
    #[serde(default)]
    pub excluded_commands: Vec<String>,
    pub allow_unsandboxed: bool,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_allow_bash: true,
            excluded_commands: Vec::new(),
            allow_unsandboxed: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

impl Config {
    /// Load from `~/.maestro/config.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&crate::paths::maestro_home().join("config.toml"))
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// `{workspace}/.claude/skills/`: user-created and promoted skills.
    pub fn main_skills_dir(&self) -> PathBuf {
        self.workspace.dir.join(".claude").join("skills")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            agent: AgentRuntimeConfig::default(),
            sandbox: SandboxDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bedrock_model_id_mapping() {
        assert_eq!(
            bedrock_model_id("claude-sonnet-4-5-20250929"),
            "global.anthropic.claude-sonnet-4-5-20250929-v1:0"
        );
        // Unknown IDs pass through
        assert_eq!(bedrock_model_id("claude-3-opus"), "claude-3-opus");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/maestro.toml")).unwrap();
        assert_eq!(config.agent.permission_wait_secs, 300);
        assert!(config.sandbox.enabled);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\ncommand = \"echo\"\ndefault_model = \"m\"\npermission_wait_secs = 5\nmax_buffer_size = 1024\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.agent.command, "echo");
        assert_eq!(config.agent.permission_wait_secs, 5);
        // Untouched sections keep defaults
        assert!(config.sandbox.auto_allow_bash);
    }
}
