mod config;
mod credentials;
mod db;
mod engine;
mod error;
mod logging;
mod paths;
mod skills;
mod util;
mod workspace;

use crate::config::Config;
use crate::credentials::ApiSettings;
use crate::db::{Db, MarketplaceKind, MarketplaceRecord, McpConnection, McpServerRecord};
use crate::engine::client::ProcessConnector;
use crate::engine::permission::{Decision, PermissionBroker};
use crate::engine::types::UserInput;
use crate::engine::{ConversationRequest, ConversationSupervisor};
use crate::skills::marketplace::PluginManager;
use crate::skills::SkillManager;
use crate::workspace::WorkspaceManager;
use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Parser, Debug)]
#[command(name = "maestro", version)]
#[command(about = "Maestro — conversation supervisor for model-driven agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a conversation turn and print the event stream as JSON lines
    Chat {
        /// Agent id
        agent: String,
        /// User message
        message: String,
        /// Resume an existing session
        #[arg(long)]
        session: Option<String>,
        /// Extra directories the agent may work in
        #[arg(long)]
        add_dir: Vec<String>,
    },
    /// Resolve a pending permission request
    Permission {
        session: String,
        request: String,
        /// "approve" or "deny"
        decision: String,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Answer a pending ask_user_question and continue the session
    Answer {
        agent: String,
        session: String,
        tool_use_id: String,
        /// Repeated "question=answer" pairs
        #[arg(long = "answer")]
        answers: Vec<String>,
    },
    /// Interrupt a running session
    Interrupt { session: String },
    /// Manage skills
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
    /// Manage plugin marketplaces
    Plugins {
        #[command(subcommand)]
        action: PluginsAction,
    },
    /// Manage agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Inspect stored sessions and transcripts
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Manage MCP server definitions
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
    /// Inspect or update API settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Remove expired transcript messages
    Cleanup,
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    /// List stored sessions
    List,
    /// Print a session transcript
    Show { session: String },
    /// Delete a session and its messages
    Delete { session: String },
}

#[derive(Subcommand, Debug)]
enum McpAction {
    /// Register an MCP server (stdio command or sse/http URL)
    Add {
        name: String,
        #[arg(long, default_value = "stdio")]
        connection: String,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
    /// List MCP server definitions
    List,
    /// Delete an MCP server definition
    Delete { server: String },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print API settings with secrets redacted
    Show,
    /// Set the Anthropic API key
    SetKey { key: String },
}

#[derive(Subcommand, Debug)]
enum SkillsAction {
    /// List skill records
    List,
    /// Upload a skill package (ZIP) as a draft
    Upload {
        /// Path to the ZIP file
        file: std::path::PathBuf,
        /// Skill folder name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Publish the draft as a new version
    Publish {
        skill: String,
        #[arg(long)]
        summary: Option<String>,
    },
    /// Discard the unpublished draft
    Discard { skill: String },
    /// Stage a draft from a folder already in the workspace skills tree
    Finalize {
        folder: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// List published versions of a skill
    Versions { skill: String },
    /// Make an earlier version current
    Rollback { skill: String, version: u32 },
    /// Delete a skill and everything derived from it
    Delete { skill: String },
    /// Reconcile the skills directory with the database
    Refresh,
}

#[derive(Subcommand, Debug)]
enum PluginsAction {
    /// Register a marketplace
    Add {
        name: String,
        url: String,
        #[arg(long, default_value = "git")]
        kind: String,
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// Clone/update a marketplace and list its plugins
    Sync { marketplace: String },
    /// List plugins from the cache without network I/O
    Cached { marketplace: String },
    /// Install a plugin from a synced marketplace
    Install { marketplace: String, plugin: String },
    /// Uninstall a plugin and its artifacts
    Uninstall { plugin: String },
    /// List installed plugins
    List,
}

#[derive(Subcommand, Debug)]
enum AgentsAction {
    /// List agent profiles
    List,
    /// Rebuild an agent's isolated skill workspace
    Rebuild { agent: String },
    /// Delete an agent and its workspace
    Delete { agent: String },
}

struct App {
    db: Arc<Db>,
    config: Arc<Config>,
    workspace: Arc<WorkspaceManager>,
    skills: SkillManager,
    plugins: Arc<PluginManager>,
    supervisor: Arc<ConversationSupervisor>,
}

fn build_app() -> Result<App> {
    let config = Arc::new(Config::load()?);
    let db = Arc::new(Db::open_default()?);

    let workspace = Arc::new(WorkspaceManager::new(
        config.main_skills_dir(),
        config.workspace.agents_dir.clone(),
        paths::plugin_skills_dir(),
        db.clone(),
    ));
    let skills = SkillManager::new(db.clone(), config.main_skills_dir(), paths::skill_staging_dir());
    let plugins = Arc::new(PluginManager::with_default_roots(db.clone()));
    let broker = Arc::new(PermissionBroker::new(db.clone()));
    let connector = Arc::new(ProcessConnector::new(
        config.agent.command.clone(),
        config.agent.args.clone(),
        config.agent.max_buffer_size,
    ));
    let supervisor = Arc::new(ConversationSupervisor::new(
        db.clone(),
        workspace.clone(),
        plugins.clone(),
        broker,
        connector,
        config.clone(),
        paths::maestro_home().join("credentials.json"),
    ));

    Ok(App {
        db,
        config,
        workspace,
        skills,
        plugins,
        supervisor,
    })
}

fn find_marketplace(db: &Db, id_or_name: &str) -> Result<MarketplaceRecord> {
    if let Some(marketplace) = db.get_marketplace(id_or_name)? {
        return Ok(marketplace);
    }
    db.list_marketplaces()?
        .into_iter()
        .find(|m| m.name == id_or_name)
        .ok_or_else(|| anyhow::anyhow!("Marketplace '{}' not found", id_or_name))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    logging::setup_tracing_with_settings(logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
    })?;

    let app = build_app()?;

    match cli.cmd {
        Command::Chat {
            agent,
            message,
            session,
            add_dir,
        } => {
            let rx = app.supervisor.run_conversation(ConversationRequest {
                agent_id: agent,
                input: UserInput::Text(message),
                session_id: session,
                add_dirs: add_dir,
            });
            let mut events = ReceiverStream::new(rx);
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            app.supervisor.disconnect_all().await;
        }
        Command::Permission {
            session,
            request,
            decision,
            feedback,
        } => {
            let decision = Decision::parse(&decision)
                .ok_or_else(|| anyhow::anyhow!("Decision must be 'approve' or 'deny'"))?;
            let ack = app
                .supervisor
                .continue_with_permission(&session, &request, decision, feedback)?;
            println!("{}", serde_json::to_string(&ack)?);
        }
        Command::Answer {
            agent,
            session,
            tool_use_id,
            answers,
        } => {
            let mut parsed = std::collections::BTreeMap::new();
            for pair in answers {
                let (question, answer) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("Answers must be 'question=answer' pairs"))?;
                parsed.insert(question.to_string(), answer.to_string());
            }
            let rx = app
                .supervisor
                .continue_with_answer(agent, session, tool_use_id, parsed);
            let mut events = ReceiverStream::new(rx);
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            app.supervisor.disconnect_all().await;
        }
        Command::Interrupt { session } => {
            if app.supervisor.interrupt_session(&session).await? {
                println!("Session {session} interrupted");
            } else {
                println!("No active session with id {session}");
            }
        }
        Command::Skills { action } => match action {
            SkillsAction::List => {
                for skill in app.db.list_skills()? {
                    println!(
                        "{}  {}  v{}  draft={}  [{:?}]",
                        skill.id, skill.folder_name, skill.current_version, skill.has_draft,
                        skill.source_type
                    );
                }
            }
            SkillsAction::Upload { file, name } => {
                let bytes = std::fs::read(&file)?;
                let file_name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "skill.zip".to_string());
                let record = app
                    .skills
                    .upload_package(&bytes, name.as_deref(), &file_name)
                    .await?;
                println!("Uploaded draft for '{}' ({})", record.folder_name, record.id);
            }
            SkillsAction::Publish { skill, summary } => {
                let (record, version) = app.skills.publish_draft(&skill, summary).await?;
                println!("Published '{}' as v{}", record.folder_name, version.version);
            }
            SkillsAction::Discard { skill } => {
                let record = app.skills.discard_draft(&skill).await?;
                println!("Discarded draft for '{}'", record.folder_name);
            }
            SkillsAction::Finalize {
                folder,
                display_name,
            } => {
                let record = app
                    .skills
                    .finalize_from_local(&folder, display_name.as_deref())
                    .await?;
                println!("Staged draft for '{}' ({})", record.folder_name, record.id);
            }
            SkillsAction::Versions { skill } => {
                for version in app.skills.list_versions(&skill)? {
                    let published = chrono::DateTime::from_timestamp_millis(
                        (version.created_at / 1_000_000) as i64,
                    )
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                    println!(
                        "v{}  {}  {}",
                        version.version,
                        published,
                        version.change_summary.as_deref().unwrap_or("-")
                    );
                }
            }
            SkillsAction::Rollback { skill, version } => {
                let record = app.skills.rollback(&skill, version).await?;
                println!("'{}' is now at v{}", record.folder_name, record.current_version);
            }
            SkillsAction::Delete { skill } => {
                app.skills.delete(&skill).await?;
                println!("Deleted skill {skill}");
            }
            SkillsAction::Refresh => {
                let result = app.skills.refresh().await?;
                println!(
                    "added={:?} updated={:?} orphaned={:?} errors={}",
                    result.added,
                    result.updated,
                    result.removed,
                    result.errors.len()
                );
            }
        },
        Command::Plugins { action } => match action {
            PluginsAction::Add {
                name,
                url,
                kind,
                branch,
            } => {
                let kind = match kind.as_str() {
                    "git" => MarketplaceKind::Git,
                    "http" => MarketplaceKind::Http,
                    "local" => MarketplaceKind::Local,
                    other => anyhow::bail!("Unknown marketplace kind '{other}'"),
                };
                let record = app.db.put_marketplace(MarketplaceRecord {
                    id: String::new(),
                    name,
                    kind,
                    url,
                    branch,
                    cached_plugins: Vec::new(),
                    last_synced_at: None,
                    created_at: 0,
                    updated_at: 0,
                })?;
                println!("Added marketplace '{}' ({})", record.name, record.id);
            }
            PluginsAction::Sync { marketplace } => {
                let record = find_marketplace(&app.db, &marketplace)?;
                let result = app.plugins.sync(&record).await?;
                for plugin in result.plugins {
                    println!("{}  {}  {}", plugin.name, plugin.version, plugin.description);
                }
            }
            PluginsAction::Cached { marketplace } => {
                let record = find_marketplace(&app.db, &marketplace)?;
                for plugin in app.plugins.list_cached(&record) {
                    println!("{}  {}  {}", plugin.name, plugin.version, plugin.description);
                }
            }
            PluginsAction::Install {
                marketplace,
                plugin,
            } => {
                let record = find_marketplace(&app.db, &marketplace)?;
                let installed = app.plugins.install(&plugin, &record).await?;
                println!(
                    "Installed '{}' v{} ({} skills)",
                    installed.name,
                    installed.version,
                    installed.installed_skills.len()
                );
            }
            PluginsAction::Uninstall { plugin } => {
                let removed = app.plugins.uninstall(&plugin).await?;
                println!(
                    "Removed {} skills, {} commands, {} agents, {} hooks",
                    removed.skills.len(),
                    removed.commands.len(),
                    removed.agents.len(),
                    removed.hooks.len()
                );
            }
            PluginsAction::List => {
                for plugin in app.db.list_plugins()? {
                    println!(
                        "{}  {}  v{}  skills={:?}",
                        plugin.id, plugin.name, plugin.version, plugin.installed_skills
                    );
                }
            }
        },
        Command::Agents { action } => match action {
            AgentsAction::List => {
                for agent in app.db.list_agents()? {
                    println!(
                        "{}  {}  model={}  skills={}  global={}",
                        agent.id,
                        agent.name,
                        agent.model.as_deref().unwrap_or(&app.config.agent.default_model),
                        if agent.allow_all_skills {
                            "all".to_string()
                        } else {
                            agent.skill_ids.len().to_string()
                        },
                        agent.global_user_mode
                    );
                }
            }
            AgentsAction::Rebuild { agent } => {
                let record = app.db.get_agent(&agent)?;
                let path = app.workspace.rebuild_agent_workspace(
                    &record.id,
                    &record.skill_ids,
                    record.allow_all_skills,
                )?;
                println!("Workspace rebuilt at {}", path.display());
            }
            AgentsAction::Delete { agent } => {
                let record = app.db.get_agent(&agent)?;
                app.workspace.delete_agent_workspace(&record.id)?;
                app.db.delete_agent(&record.id)?;
                println!("Deleted agent {}", record.id);
            }
        },
        Command::Sessions { action } => match action {
            SessionsAction::List => {
                for session in app.db.list_sessions()? {
                    println!("{}  agent={}  {}", session.id, session.agent_id, session.title);
                }
            }
            SessionsAction::Show { session } => {
                if let Some(record) = app.db.get_session(&session)? {
                    println!("# {}  agent={}", record.title, record.agent_id);
                }
                for message in app.db.list_messages(&session)? {
                    println!("{}", serde_json::to_string(&message)?);
                }
            }
            SessionsAction::Delete { session } => {
                let removed = app.db.delete_messages_by_session(&session)?;
                app.db.delete_session(&session)?;
                println!("Deleted session {session} ({removed} messages)");
            }
        },
        Command::Mcp { action } => match action {
            McpAction::Add {
                name,
                connection,
                command,
                url,
            } => {
                let (connection, config) = match connection.as_str() {
                    "stdio" => {
                        let command = command
                            .ok_or_else(|| anyhow::anyhow!("stdio servers need --command"))?;
                        (McpConnection::Stdio, serde_json::json!({"command": command, "args": []}))
                    }
                    "sse" | "http" => {
                        let url = url.ok_or_else(|| anyhow::anyhow!("sse/http servers need --url"))?;
                        let kind = if connection == "sse" {
                            McpConnection::Sse
                        } else {
                            McpConnection::Http
                        };
                        (kind, serde_json::json!({"url": url}))
                    }
                    other => anyhow::bail!("Unknown connection type '{other}'"),
                };
                let record = app.db.put_mcp_server(McpServerRecord {
                    id: String::new(),
                    name,
                    connection,
                    config,
                    is_active: true,
                    created_at: 0,
                    updated_at: 0,
                })?;
                println!("Added MCP server '{}' ({})", record.name, record.id);
            }
            McpAction::List => {
                for server in app.db.list_mcp_servers()? {
                    println!(
                        "{}  {}  {:?}  active={}",
                        server.id, server.name, server.connection, server.is_active
                    );
                }
            }
            McpAction::Delete { server } => {
                app.db.delete_mcp_server(&server)?;
                println!("Deleted MCP server {server}");
            }
        },
        Command::Settings { action } => {
            let credentials_file = paths::maestro_home().join("credentials.json");
            match action {
                SettingsAction::Show => {
                    let settings = ApiSettings::load(&credentials_file).redacted();
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                SettingsAction::SetKey { key } => {
                    let mut settings = ApiSettings::load(&credentials_file);
                    settings.anthropic_api_key = Some(key);
                    settings.save(&credentials_file)?;
                    println!("API key updated");
                }
            }
        }
        Command::Cleanup => {
            let removed = app.db.cleanup_expired_messages()?;
            println!("Removed {removed} expired messages");
        }
    }

    Ok(())
}
