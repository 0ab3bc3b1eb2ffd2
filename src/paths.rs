use std::path::PathBuf;
use std::sync::OnceLock;

static MAESTRO_HOME: OnceLock<PathBuf> = OnceLock::new();
static CLAUDE_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the Maestro home directory (`~/.maestro/`).
/// Supports `$MAESTRO_HOME` env override. Cached via `OnceLock`.
pub fn maestro_home() -> &'static PathBuf {
    MAESTRO_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("MAESTRO_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".maestro")
    })
}

/// Returns the shared model-agent content root (`~/.claude/`), where
/// plugin-installed skills, commands, agents and hooks live.
/// Supports `$MAESTRO_CLAUDE_HOME` override (used by tests).
pub fn claude_home() -> &'static PathBuf {
    CLAUDE_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("MAESTRO_CLAUDE_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
    })
}

/// `~/.maestro/data/`
pub fn data_dir() -> PathBuf {
    maestro_home().join("data")
}

/// `~/.maestro/logs/`
pub fn logs_dir() -> PathBuf {
    maestro_home().join("logs")
}

/// `~/.maestro/staging/skills/`: draft and versioned skill snapshots.
pub fn skill_staging_dir() -> PathBuf {
    maestro_home().join("staging").join("skills")
}

/// `~/.claude/skills/`: plugin-installed skills.
pub fn plugin_skills_dir() -> PathBuf {
    claude_home().join("skills")
}

/// `~/.claude/commands/`
pub fn plugin_commands_dir() -> PathBuf {
    claude_home().join("commands")
}

/// `~/.claude/agents/`
pub fn plugin_agents_dir() -> PathBuf {
    claude_home().join("agents")
}

/// `~/.claude/hooks/`
pub fn plugin_hooks_dir() -> PathBuf {
    claude_home().join("hooks")
}

/// `~/.claude/plugins/cache/`: marketplace clones, nested `{owner}/{repo}`.
pub fn plugin_cache_dir() -> PathBuf {
    claude_home().join("plugins").join("cache")
}
