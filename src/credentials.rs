use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Persisted format: ~/.maestro/credentials.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BedrockAuth {
    #[default]
    Credentials,
    BearerToken,
}

/// API settings staged into the environment before each turn.
/// Persisted alongside the config so the settings UI can edit them.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ApiSettings {
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_base_url: Option<String>,
    #[serde(default)]
    pub use_bedrock: bool,
    #[serde(default)]
    pub bedrock_auth: BedrockAuth,
    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub aws_session_token: Option<String>,
    #[serde(default)]
    pub aws_bearer_token: Option<String>,
    #[serde(default)]
    pub disable_experimental_betas: bool,
}

impl ApiSettings {
    /// Load from `~/.maestro/credentials.json`. Returns defaults if missing or invalid.
    pub fn load(file: &Path) -> Self {
        if !file.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(file) {
            Ok(content) => match serde_json::from_str::<ApiSettings>(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Failed to parse credentials.json: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read credentials.json: {}", e);
                Self::default()
            }
        }
    }

    /// Save to disk. Creates parent directories if needed.
    pub fn save(&self, file: &Path) -> anyhow::Result<()> {
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(file, json)?;
        Ok(())
    }

    /// Return a copy with all secrets redacted (for API responses).
    pub fn redacted(&self) -> Self {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***".to_string());
        Self {
            anthropic_api_key: redact(&self.anthropic_api_key),
            anthropic_base_url: self.anthropic_base_url.clone(),
            use_bedrock: self.use_bedrock,
            bedrock_auth: self.bedrock_auth,
            aws_region: self.aws_region.clone(),
            aws_access_key_id: redact(&self.aws_access_key_id),
            aws_secret_access_key: redact(&self.aws_secret_access_key),
            aws_session_token: redact(&self.aws_session_token),
            aws_bearer_token: redact(&self.aws_bearer_token),
            disable_experimental_betas: self.disable_experimental_betas,
        }
    }

}

// ---------------------------------------------------------------------------
// Per-turn environment staging
// ---------------------------------------------------------------------------

fn set_or_clear(key: &str, value: Option<&str>) {
    // SAFETY: env staging is the only place this process mutates its
    // environment, and it runs before the agent subprocess is spawned.
    match value {
        Some(v) if !v.is_empty() => unsafe { std::env::set_var(key, v) },
        _ => unsafe { std::env::remove_var(key) },
    }
}

fn set(key: &str, value: &str) {
    // SAFETY: see set_or_clear.
    unsafe { std::env::set_var(key, value) };
}

fn clear(key: &str) {
    // SAFETY: see set_or_clear.
    unsafe { std::env::remove_var(key) };
}

/// Stage environment variables for the model-agent subprocess.
///
/// Called before every turn: values not configured are cleared, and the
/// orthogonal credential family is cleared when the selected one changes
/// (bearer token XOR static credentials).
pub fn stage_environment(api: &ApiSettings) {
    set_or_clear("ANTHROPIC_API_KEY", api.anthropic_api_key.as_deref());
    set_or_clear("ANTHROPIC_BASE_URL", api.anthropic_base_url.as_deref());

    if api.use_bedrock {
        set("CLAUDE_CODE_USE_BEDROCK", "true");

        let region = api.aws_region.as_deref().unwrap_or("us-east-1");
        set("AWS_REGION", region);
        set("AWS_DEFAULT_REGION", region);

        match api.bedrock_auth {
            BedrockAuth::BearerToken => {
                set_or_clear("AWS_BEARER_TOKEN_BEDROCK", api.aws_bearer_token.as_deref());
                clear("AWS_ACCESS_KEY_ID");
                clear("AWS_SECRET_ACCESS_KEY");
                clear("AWS_SESSION_TOKEN");
            }
            BedrockAuth::Credentials => {
                set_or_clear("AWS_ACCESS_KEY_ID", api.aws_access_key_id.as_deref());
                set_or_clear("AWS_SECRET_ACCESS_KEY", api.aws_secret_access_key.as_deref());
                set_or_clear("AWS_SESSION_TOKEN", api.aws_session_token.as_deref());
                clear("AWS_BEARER_TOKEN_BEDROCK");
            }
        }
    } else {
        clear("CLAUDE_CODE_USE_BEDROCK");
        clear("AWS_BEARER_TOKEN_BEDROCK");
    }

    if api.disable_experimental_betas {
        set("CLAUDE_CODE_DISABLE_EXPERIMENTAL_BETAS", "true");
    } else {
        clear("CLAUDE_CODE_DISABLE_EXPERIMENTAL_BETAS");
    }

    info!(
        "Agent environment staged - bedrock: {}, auth: {:?}, base_url: {}",
        api.use_bedrock,
        api.bedrock_auth,
        api.anthropic_base_url.as_deref().unwrap_or("default")
    );
}
