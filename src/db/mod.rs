use crate::engine::types::ContentBlock;
use crate::error::{ServiceError, ServiceResult};
use crate::util::{now_ts_nanos, now_ts_secs};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

// Table definitions
const AGENTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("agents");
const SKILLS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("skills");
const SKILL_VERSIONS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("skill_versions");
const SESSIONS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("sessions");
const MESSAGES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("messages");
const PERMISSION_REQUESTS_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("permission_requests");
const PLUGINS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("plugins");
const MARKETPLACES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("marketplaces");
const MCP_SERVERS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("mcp_servers");

/// Message TTL: transcripts expire 7 days after the last write.
pub const MESSAGE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    /// Wire name forwarded verbatim to the model agent.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SandboxNetworkConfig {
    #[serde(default)]
    pub allow_local_binding: bool,
    #[serde(default)]
    pub allow_unix_sockets: Vec<String>,
    #[serde(default)]
    pub allow_all_unix_sockets: bool,
}

/// Built-in sandbox configuration for bash command isolation,
/// forwarded to the model agent as a single settings object.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub auto_allow_bash_if_sandboxed: Option<bool>,
    #[serde(default)]
    pub excluded_commands: Vec<String>,
    #[serde(default)]
    pub allow_unsandboxed_commands: Option<bool>,
    #[serde(default)]
    pub network: SandboxNetworkConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentRecord {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// System prompt text; synthesized from name + description when absent.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub plugin_ids: Vec<String>,
    #[serde(default)]
    pub skill_ids: Vec<String>,
    #[serde(default)]
    pub allow_all_skills: bool,
    #[serde(default)]
    pub mcp_ids: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default = "default_true")]
    pub enable_bash_tool: bool,
    #[serde(default = "default_true")]
    pub enable_file_tools: bool,
    #[serde(default)]
    pub enable_web_tools: bool,
    #[serde(default = "default_true")]
    pub enable_tool_logging: bool,
    #[serde(default = "default_true")]
    pub enable_safety_checks: bool,
    #[serde(default = "default_true")]
    pub enable_file_access_control: bool,
    #[serde(default)]
    pub allowed_directories: Vec<String>,
    #[serde(default)]
    pub global_user_mode: bool,
    #[serde(default = "default_true")]
    pub enable_human_approval: bool,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl AgentRecord {
    /// Global-user mode implies full skill access; per-skill selection is
    /// meaningless there and is cleared on every write.
    fn normalize(&mut self) {
        if self.global_user_mode {
            self.allow_all_skills = true;
            self.skill_ids.clear();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SkillSourceType {
    #[default]
    User,
    Plugin,
    Local,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SkillRecord {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Folder name under the skills roots; unique across skills.
    pub folder_name: String,
    #[serde(default)]
    pub source_type: SkillSourceType,
    #[serde(default)]
    pub source_plugin_id: Option<String>,
    #[serde(default)]
    pub source_marketplace_id: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    /// Display version string from SKILL.md metadata.
    #[serde(default)]
    pub version: Option<String>,
    /// Published version counter; 0 means never published.
    #[serde(default)]
    pub current_version: u32,
    #[serde(default)]
    pub has_draft: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SkillVersionRecord {
    #[serde(default)]
    pub id: String,
    pub skill_id: String,
    pub version: u32,
    #[serde(default)]
    pub change_summary: Option<String>,
    /// Location of the immutable staged snapshot for this version.
    #[serde(default)]
    pub content_path: Option<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionRecord {
    /// Identifier assigned by the model agent on init; never fabricated here.
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub last_accessed: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageRecord {
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: Option<String>,
    /// Unix seconds after which the TTL sweep removes this record.
    #[serde(default)]
    pub expires_at: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    #[default]
    Pending,
    Approved,
    Denied,
    Expired,
}

impl PermissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PermissionRecord {
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: JsonValue,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub status: PermissionStatus,
    #[serde(default)]
    pub decided_at: Option<u64>,
    #[serde(default)]
    pub user_feedback: Option<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    #[default]
    Installed,
    Disabled,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PluginRecord {
    #[serde(default)]
    pub id: String,
    pub marketplace_id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub installed_skills: Vec<String>,
    #[serde(default)]
    pub installed_commands: Vec<String>,
    #[serde(default)]
    pub installed_agents: Vec<String>,
    #[serde(default)]
    pub installed_hooks: Vec<String>,
    #[serde(default)]
    pub installed_mcp_servers: Vec<String>,
    #[serde(default)]
    pub install_path: Option<String>,
    #[serde(default)]
    pub status: PluginStatus,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketplaceKind {
    #[default]
    Git,
    Http,
    Local,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MarketplaceRecord {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: MarketplaceKind,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub cached_plugins: Vec<String>,
    #[serde(default)]
    pub last_synced_at: Option<u64>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpConnection {
    #[default]
    Stdio,
    Sse,
    Http,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServerRecord {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub connection: McpConnection,
    /// Launch descriptor: `command`/`args` for stdio, `url` for sse/http.
    #[serde(default)]
    pub config: JsonValue,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Embedded repository over redb. One table per entity, JSON values.
/// No cross-entity transactions; last-writer-wins per record.
pub struct Db {
    db: Arc<Database>,
}

impl Db {
    pub fn open_default() -> ServiceResult<Self> {
        let data_dir = crate::paths::data_dir();
        std::fs::create_dir_all(&data_dir)?;
        Self::open(&data_dir.join("maestro.redb"))
    }

    pub fn open(path: &Path) -> ServiceResult<Self> {
        let db = Database::create(path).map_err(|e| ServiceError::backend(e.to_string()))?;

        // Initialize tables up front so first reads don't fail.
        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _ = write_txn.open_table(AGENTS_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(SKILLS_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(SKILL_VERSIONS_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(SESSIONS_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(MESSAGES_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(PERMISSION_REQUESTS_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(PLUGINS_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(MARKETPLACES_TABLE).map_err(backend)?;
            let _ = write_txn.open_table(MCP_SERVERS_TABLE).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(Self { db: Arc::new(db) })
    }

    // -- generic helpers ----------------------------------------------------

    fn insert_json<T: Serialize>(
        &self,
        table: TableDefinition<&str, &str>,
        key: &str,
        value: &T,
    ) -> ServiceResult<()> {
        let json = serde_json::to_string(value)?;
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut t = write_txn.open_table(table).map_err(backend)?;
            t.insert(key, json.as_str()).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &str>,
        key: &str,
    ) -> ServiceResult<Option<T>> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let t = read_txn.open_table(table).map_err(backend)?;
        match t.get(key).map_err(backend)? {
            Some(val) => Ok(Some(serde_json::from_str(val.value())?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &str>,
    ) -> ServiceResult<Vec<T>> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let t = read_txn.open_table(table).map_err(backend)?;
        let mut out = Vec::new();
        for res in t.iter().map_err(backend)? {
            let (_key, val) = res.map_err(backend)?;
            out.push(serde_json::from_str(val.value())?);
        }
        Ok(out)
    }

    fn remove_key(&self, table: TableDefinition<&str, &str>, key: &str) -> ServiceResult<bool> {
        let write_txn = self.db.begin_write().map_err(backend)?;
        let removed = {
            let mut t = write_txn.open_table(table).map_err(backend)?;
            let existed = t.remove(key).map_err(backend)?.is_some();
            existed
        };
        write_txn.commit().map_err(backend)?;
        Ok(removed)
    }

    fn remove_keys(&self, table: TableDefinition<&str, &str>, keys: &[String]) -> ServiceResult<usize> {
        let write_txn = self.db.begin_write().map_err(backend)?;
        let mut removed = 0usize;
        {
            let mut t = write_txn.open_table(table).map_err(backend)?;
            for key in keys {
                if t.remove(key.as_str()).map_err(backend)?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit().map_err(backend)?;
        Ok(removed)
    }

    fn stamp(id: &mut String, created_at: &mut u64, updated_at: &mut u64, existing_created: Option<u64>) {
        if id.is_empty() {
            *id = Uuid::new_v4().to_string();
        }
        let now = now_ts_nanos();
        *created_at = match existing_created {
            Some(prev) if prev > 0 => prev,
            _ if *created_at > 0 => *created_at,
            _ => now,
        };
        *updated_at = now;
    }

    // -- agents -------------------------------------------------------------

    pub fn put_agent(&self, mut agent: AgentRecord) -> ServiceResult<AgentRecord> {
        agent.normalize();
        let existing = if agent.id.is_empty() {
            None
        } else {
            self.get_agent_opt(&agent.id)?
        };
        Self::stamp(
            &mut agent.id,
            &mut agent.created_at,
            &mut agent.updated_at,
            existing.map(|a| a.created_at),
        );
        self.insert_json(AGENTS_TABLE, &agent.id.clone(), &agent)?;
        Ok(agent)
    }

    pub fn get_agent_opt(&self, id: &str) -> ServiceResult<Option<AgentRecord>> {
        self.get_json(AGENTS_TABLE, id)
    }

    pub fn get_agent(&self, id: &str) -> ServiceResult<AgentRecord> {
        self.get_agent_opt(id)?.ok_or_else(|| {
            ServiceError::not_found(format!("Agent '{id}' does not exist"))
                .with_action("Check the agent id and try again")
        })
    }

    pub fn list_agents(&self) -> ServiceResult<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> = self.scan_json(AGENTS_TABLE)?;
        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(agents)
    }

    pub fn update_agent(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut AgentRecord),
    ) -> ServiceResult<AgentRecord> {
        let mut agent = self.get_agent(id)?;
        mutate(&mut agent);
        agent.id = id.to_string();
        agent.normalize();
        agent.updated_at = now_ts_nanos();
        self.insert_json(AGENTS_TABLE, id, &agent)?;
        Ok(agent)
    }

    pub fn delete_agent(&self, id: &str) -> ServiceResult<bool> {
        self.remove_key(AGENTS_TABLE, id)
    }

    // -- skills -------------------------------------------------------------

    pub fn put_skill(&self, mut skill: SkillRecord) -> ServiceResult<SkillRecord> {
        // folder_name is the lookup key the workspace manager relies on.
        let clash = self
            .list_skills()?
            .into_iter()
            .find(|s| s.folder_name == skill.folder_name && s.id != skill.id);
        if clash.is_some() {
            return Err(ServiceError::conflict(format!(
                "A skill with folder name '{}' already exists",
                skill.folder_name
            )));
        }
        let existing = if skill.id.is_empty() {
            None
        } else {
            self.get_skill_opt(&skill.id)?
        };
        Self::stamp(
            &mut skill.id,
            &mut skill.created_at,
            &mut skill.updated_at,
            existing.map(|s| s.created_at),
        );
        self.insert_json(SKILLS_TABLE, &skill.id.clone(), &skill)?;
        Ok(skill)
    }

    pub fn get_skill_opt(&self, id: &str) -> ServiceResult<Option<SkillRecord>> {
        self.get_json(SKILLS_TABLE, id)
    }

    pub fn get_skill(&self, id: &str) -> ServiceResult<SkillRecord> {
        self.get_skill_opt(id)?.ok_or_else(|| {
            ServiceError::not_found(format!("Skill '{id}' does not exist"))
                .with_action("Check the skill id and try again")
        })
    }

    pub fn find_skill_by_folder(&self, folder_name: &str) -> ServiceResult<Option<SkillRecord>> {
        Ok(self
            .list_skills()?
            .into_iter()
            .find(|s| s.folder_name == folder_name))
    }

    pub fn list_skills(&self) -> ServiceResult<Vec<SkillRecord>> {
        let mut skills: Vec<SkillRecord> = self.scan_json(SKILLS_TABLE)?;
        skills.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(skills)
    }

    pub fn update_skill(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut SkillRecord),
    ) -> ServiceResult<SkillRecord> {
        let mut skill = self.get_skill(id)?;
        mutate(&mut skill);
        skill.id = id.to_string();
        skill.updated_at = now_ts_nanos();
        self.insert_json(SKILLS_TABLE, id, &skill)?;
        Ok(skill)
    }

    pub fn delete_skill(&self, id: &str) -> ServiceResult<bool> {
        self.remove_key(SKILLS_TABLE, id)
    }

    // -- skill versions -----------------------------------------------------

    pub fn put_skill_version(&self, mut version: SkillVersionRecord) -> ServiceResult<SkillVersionRecord> {
        Self::stamp(
            &mut version.id,
            &mut version.created_at,
            &mut version.updated_at,
            None,
        );
        self.insert_json(SKILL_VERSIONS_TABLE, &version.id.clone(), &version)?;
        Ok(version)
    }

    /// All versions of a skill, newest-first by version number.
    pub fn list_skill_versions(&self, skill_id: &str) -> ServiceResult<Vec<SkillVersionRecord>> {
        let mut versions: Vec<SkillVersionRecord> = self
            .scan_json(SKILL_VERSIONS_TABLE)?
            .into_iter()
            .filter(|v: &SkillVersionRecord| v.skill_id == skill_id)
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    pub fn get_skill_version(
        &self,
        skill_id: &str,
        version: u32,
    ) -> ServiceResult<Option<SkillVersionRecord>> {
        Ok(self
            .list_skill_versions(skill_id)?
            .into_iter()
            .find(|v| v.version == version))
    }

    pub fn delete_skill_versions(&self, skill_id: &str) -> ServiceResult<usize> {
        let keys: Vec<String> = self
            .list_skill_versions(skill_id)?
            .into_iter()
            .map(|v| v.id)
            .collect();
        self.remove_keys(SKILL_VERSIONS_TABLE, &keys)
    }

    // -- sessions -----------------------------------------------------------

    pub fn put_session(&self, mut session: SessionRecord) -> ServiceResult<SessionRecord> {
        if session.id.is_empty() {
            return Err(ServiceError::validation(
                "Session id must come from the model agent's init event",
            ));
        }
        let existing: Option<SessionRecord> = self.get_json(SESSIONS_TABLE, &session.id)?;
        let now = now_ts_nanos();
        session.created_at = existing.as_ref().map(|s| s.created_at).unwrap_or(now);
        session.updated_at = now;
        session.last_accessed = now;
        self.insert_json(SESSIONS_TABLE, &session.id.clone(), &session)?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> ServiceResult<Option<SessionRecord>> {
        self.get_json(SESSIONS_TABLE, id)
    }

    pub fn list_sessions(&self) -> ServiceResult<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self.scan_json(SESSIONS_TABLE)?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    pub fn delete_session(&self, id: &str) -> ServiceResult<bool> {
        self.remove_key(SESSIONS_TABLE, id)
    }

    // -- messages -----------------------------------------------------------

    pub fn put_message(&self, mut message: MessageRecord) -> ServiceResult<MessageRecord> {
        Self::stamp(
            &mut message.id,
            &mut message.created_at,
            &mut message.updated_at,
            None,
        );
        message.expires_at = now_ts_secs() + MESSAGE_TTL_SECS;
        self.insert_json(MESSAGES_TABLE, &message.id.clone(), &message)?;
        Ok(message)
    }

    /// Transcript of a session, oldest-first by creation time.
    pub fn list_messages(&self, session_id: &str) -> ServiceResult<Vec<MessageRecord>> {
        let mut messages: Vec<MessageRecord> = self
            .scan_json(MESSAGES_TABLE)?
            .into_iter()
            .filter(|m: &MessageRecord| m.session_id == session_id)
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    pub fn delete_messages_by_session(&self, session_id: &str) -> ServiceResult<usize> {
        let keys: Vec<String> = self
            .list_messages(session_id)?
            .into_iter()
            .map(|m| m.id)
            .collect();
        self.remove_keys(MESSAGES_TABLE, &keys)
    }

    /// TTL sweep: remove messages whose `expires_at` has passed.
    pub fn cleanup_expired_messages(&self) -> ServiceResult<usize> {
        let now = now_ts_secs();
        let keys: Vec<String> = self
            .scan_json::<MessageRecord>(MESSAGES_TABLE)?
            .into_iter()
            .filter(|m| m.expires_at > 0 && m.expires_at < now)
            .map(|m| m.id)
            .collect();
        self.remove_keys(MESSAGES_TABLE, &keys)
    }

    // -- permission requests -------------------------------------------------

    pub fn put_permission(&self, mut request: PermissionRecord) -> ServiceResult<PermissionRecord> {
        Self::stamp(
            &mut request.id,
            &mut request.created_at,
            &mut request.updated_at,
            None,
        );
        self.insert_json(PERMISSION_REQUESTS_TABLE, &request.id.clone(), &request)?;
        Ok(request)
    }

    pub fn get_permission(&self, id: &str) -> ServiceResult<Option<PermissionRecord>> {
        self.get_json(PERMISSION_REQUESTS_TABLE, id)
    }

    pub fn list_permissions(&self) -> ServiceResult<Vec<PermissionRecord>> {
        let mut requests: Vec<PermissionRecord> = self.scan_json(PERMISSION_REQUESTS_TABLE)?;
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    /// Transition a request to a terminal status. A request already in a
    /// terminal state is left untouched (monotonic transitions only).
    pub fn decide_permission(
        &self,
        id: &str,
        status: PermissionStatus,
        feedback: Option<String>,
    ) -> ServiceResult<PermissionRecord> {
        let mut request = self.get_permission(id)?.ok_or_else(|| {
            ServiceError::not_found(format!("Permission request '{id}' does not exist"))
        })?;
        if request.status.is_terminal() {
            return Ok(request);
        }
        request.status = status;
        request.decided_at = Some(now_ts_nanos());
        request.user_feedback = feedback;
        request.updated_at = now_ts_nanos();
        self.insert_json(PERMISSION_REQUESTS_TABLE, id, &request)?;
        Ok(request)
    }

    // -- plugins ------------------------------------------------------------

    pub fn put_plugin(&self, mut plugin: PluginRecord) -> ServiceResult<PluginRecord> {
        let existing = if plugin.id.is_empty() {
            None
        } else {
            self.get_plugin(&plugin.id)?
        };
        Self::stamp(
            &mut plugin.id,
            &mut plugin.created_at,
            &mut plugin.updated_at,
            existing.map(|p| p.created_at),
        );
        self.insert_json(PLUGINS_TABLE, &plugin.id.clone(), &plugin)?;
        Ok(plugin)
    }

    pub fn get_plugin(&self, id: &str) -> ServiceResult<Option<PluginRecord>> {
        self.get_json(PLUGINS_TABLE, id)
    }

    pub fn find_plugin_by_name(
        &self,
        marketplace_id: &str,
        name: &str,
    ) -> ServiceResult<Option<PluginRecord>> {
        Ok(self
            .list_plugins()?
            .into_iter()
            .find(|p| p.marketplace_id == marketplace_id && p.name == name))
    }

    pub fn list_plugins(&self) -> ServiceResult<Vec<PluginRecord>> {
        let mut plugins: Vec<PluginRecord> = self.scan_json(PLUGINS_TABLE)?;
        plugins.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(plugins)
    }

    pub fn list_plugins_by_marketplace(&self, marketplace_id: &str) -> ServiceResult<Vec<PluginRecord>> {
        Ok(self
            .list_plugins()?
            .into_iter()
            .filter(|p| p.marketplace_id == marketplace_id)
            .collect())
    }

    pub fn update_plugin(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut PluginRecord),
    ) -> ServiceResult<PluginRecord> {
        let mut plugin = self
            .get_plugin(id)?
            .ok_or_else(|| ServiceError::not_found(format!("Plugin '{id}' does not exist")))?;
        mutate(&mut plugin);
        plugin.id = id.to_string();
        plugin.updated_at = now_ts_nanos();
        self.insert_json(PLUGINS_TABLE, id, &plugin)?;
        Ok(plugin)
    }

    pub fn delete_plugin(&self, id: &str) -> ServiceResult<bool> {
        self.remove_key(PLUGINS_TABLE, id)
    }

    // -- marketplaces -------------------------------------------------------

    pub fn put_marketplace(&self, mut marketplace: MarketplaceRecord) -> ServiceResult<MarketplaceRecord> {
        let existing = if marketplace.id.is_empty() {
            None
        } else {
            self.get_marketplace(&marketplace.id)?
        };
        Self::stamp(
            &mut marketplace.id,
            &mut marketplace.created_at,
            &mut marketplace.updated_at,
            existing.map(|m| m.created_at),
        );
        self.insert_json(MARKETPLACES_TABLE, &marketplace.id.clone(), &marketplace)?;
        Ok(marketplace)
    }

    pub fn get_marketplace(&self, id: &str) -> ServiceResult<Option<MarketplaceRecord>> {
        self.get_json(MARKETPLACES_TABLE, id)
    }

    pub fn list_marketplaces(&self) -> ServiceResult<Vec<MarketplaceRecord>> {
        let mut marketplaces: Vec<MarketplaceRecord> = self.scan_json(MARKETPLACES_TABLE)?;
        marketplaces.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(marketplaces)
    }

    pub fn update_marketplace(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut MarketplaceRecord),
    ) -> ServiceResult<MarketplaceRecord> {
        let mut marketplace = self
            .get_marketplace(id)?
            .ok_or_else(|| ServiceError::not_found(format!("Marketplace '{id}' does not exist")))?;
        mutate(&mut marketplace);
        marketplace.id = id.to_string();
        marketplace.updated_at = now_ts_nanos();
        self.insert_json(MARKETPLACES_TABLE, id, &marketplace)?;
        Ok(marketplace)
    }

    pub fn delete_marketplace(&self, id: &str) -> ServiceResult<bool> {
        self.remove_key(MARKETPLACES_TABLE, id)
    }

    // -- mcp servers --------------------------------------------------------

    pub fn put_mcp_server(&self, mut server: McpServerRecord) -> ServiceResult<McpServerRecord> {
        let existing = if server.id.is_empty() {
            None
        } else {
            self.get_mcp_server(&server.id)?
        };
        Self::stamp(
            &mut server.id,
            &mut server.created_at,
            &mut server.updated_at,
            existing.map(|s| s.created_at),
        );
        self.insert_json(MCP_SERVERS_TABLE, &server.id.clone(), &server)?;
        Ok(server)
    }

    pub fn get_mcp_server(&self, id: &str) -> ServiceResult<Option<McpServerRecord>> {
        self.get_json(MCP_SERVERS_TABLE, id)
    }

    pub fn list_mcp_servers(&self) -> ServiceResult<Vec<McpServerRecord>> {
        let mut servers: Vec<McpServerRecord> = self.scan_json(MCP_SERVERS_TABLE)?;
        servers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(servers)
    }

    pub fn delete_mcp_server(&self, id: &str) -> ServiceResult<bool> {
        self.remove_key(MCP_SERVERS_TABLE, id)
    }
}

fn backend(err: impl std::fmt::Display) -> ServiceError {
    ServiceError::backend(err.to_string())
}
