pub mod access;
pub mod client;
pub mod hooks;
pub mod permission;
pub mod types;

use crate::config::{bedrock_model_id, Config};
use crate::credentials::{stage_environment, ApiSettings};
use crate::db::{AgentRecord, Db, McpConnection, MessageRecord, MessageRole, SessionRecord};
use crate::error::{ErrorKind, ServiceError, ServiceResult};
use crate::skills::marketplace::PluginManager;
use crate::workspace::WorkspaceManager;
use access::{AccessDecision, ContentAccessPolicy};
use client::{AgentConnector, AgentControl, AgentSession, ControlMessage};
use hooks::{
    DangerousCommandBlocker, HookChain, HookDecision, HumanApprovalGate, SkillAccessGate,
    ToolLogger,
};
use permission::{Decision, PermissionBroker, PermissionEvent};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::{
    AgentEvent, AgentOptions, ContentBlock, McpServerDef, PluginSource, SandboxSettings,
    SessionContext, StreamEvent, ToolDecision, UserInput,
};

const SESSION_TITLE_CHARS: usize = 50;

/// One conversation turn request from the caller.
#[derive(Debug, Clone)]
pub struct ConversationRequest {
    pub agent_id: String,
    pub input: UserInput,
    /// Present when resuming a session the model agent assigned earlier.
    pub session_id: Option<String>,
    /// Runtime "work in this folder" additions.
    pub add_dirs: Vec<String>,
}

/// Everything a turn needs beyond the wire options: the hook chain, the
/// path gate, and the shared session-id cell the hooks captured.
struct TurnSetup {
    options: AgentOptions,
    hook_chain: Arc<HookChain>,
    access: Option<Arc<ContentAccessPolicy>>,
    session_context: SessionContext,
}

enum MergedItem {
    Agent(AgentEvent),
    AgentDone,
    Permission(PermissionEvent),
}

/// Top-level driver for live agent sessions.
///
/// Owns the live-session handle map, builds per-turn options and hooks,
/// fuses the model event stream with permission events into one ordered
/// caller stream, and records the transcript.
pub struct ConversationSupervisor {
    db: Arc<Db>,
    workspace: Arc<WorkspaceManager>,
    plugins: Arc<PluginManager>,
    broker: Arc<PermissionBroker>,
    connector: Arc<dyn AgentConnector>,
    config: Arc<Config>,
    credentials_file: PathBuf,
    live: StdMutex<HashMap<String, Arc<dyn AgentControl>>>,
}

impl ConversationSupervisor {
    pub fn new(
        db: Arc<Db>,
        workspace: Arc<WorkspaceManager>,
        plugins: Arc<PluginManager>,
        broker: Arc<PermissionBroker>,
        connector: Arc<dyn AgentConnector>,
        config: Arc<Config>,
        credentials_file: PathBuf,
    ) -> Self {
        Self {
            db,
            workspace,
            plugins,
            broker,
            connector,
            config,
            credentials_file,
            live: StdMutex::new(HashMap::new()),
        }
    }

    // -- option building ----------------------------------------------------

    fn build_turn(
        &self,
        agent: &AgentRecord,
        resume: Option<&str>,
        session_context: &SessionContext,
        add_dirs: &[String],
    ) -> ServiceResult<TurnSetup> {
        // Explicit tool list wins; otherwise derive from the family switches.
        let mut allowed_tools = agent.allowed_tools.clone();
        if allowed_tools.is_empty() {
            if agent.enable_bash_tool {
                allowed_tools.push("Bash".to_string());
            }
            if agent.enable_file_tools {
                for tool in ["Read", "Write", "Edit", "Glob", "Grep"] {
                    allowed_tools.push(tool.to_string());
                }
            }
            if agent.enable_web_tools {
                for tool in ["WebFetch", "WebSearch"] {
                    allowed_tools.push(tool.to_string());
                }
            }
        }

        let mut plugins = Vec::new();
        for plugin_id in &agent.plugin_ids {
            match self.db.get_plugin(plugin_id)? {
                Some(plugin) => match self.plugins.effective_install_path(&plugin)? {
                    Some(path) => {
                        info!("Added plugin: {} ({}) from {}", plugin_id, plugin.name, path);
                        plugins.push(PluginSource::Local { path });
                    }
                    None => warn!(
                        "Plugin {} ({}) has no install_path and no installed skills",
                        plugin_id, plugin.name
                    ),
                },
                None => warn!("Plugin {} not found", plugin_id),
            }
        }

        let mut mcp_servers = BTreeMap::new();
        for mcp_id in &agent.mcp_ids {
            let Some(server) = self.db.get_mcp_server(mcp_id)? else {
                warn!("MCP server {} not found", mcp_id);
                continue;
            };
            if !server.is_active {
                continue;
            }
            let def = match server.connection {
                McpConnection::Stdio => McpServerDef::Stdio {
                    command: server
                        .config
                        .get("command")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    args: server
                        .config
                        .get("args")
                        .and_then(|v| v.as_array())
                        .map(|args| {
                            args.iter()
                                .filter_map(|a| a.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                },
                McpConnection::Sse => McpServerDef::Sse {
                    url: server
                        .config
                        .get("url")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
                McpConnection::Http => McpServerDef::Http {
                    url: server
                        .config
                        .get("url")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
            };
            mcp_servers.insert(mcp_id.clone(), def);
        }

        let system_prompt = agent.instructions.clone().unwrap_or_else(|| {
            format!(
                "You are {}. {}",
                agent.name,
                agent.description.as_deref().unwrap_or("")
            )
        });

        // Workspace mode decides cwd and where the agent loads settings from.
        let uses_skill_isolation = agent.allow_all_skills || !agent.skill_ids.is_empty();
        let (mut working_directory, setting_sources) = if agent.global_user_mode {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            info!("Agent {} running in GLOBAL USER MODE (cwd: {})", agent.id, home.display());
            (
                home.display().to_string(),
                Some(vec!["project".to_string(), "user".to_string()]),
            )
        } else if uses_skill_isolation {
            let workspace = self.workspace.agent_workspace(&agent.id);
            info!("Using per-agent workspace: {}", workspace.display());
            (workspace.display().to_string(), Some(vec!["project".to_string()]))
        } else {
            let dir = agent
                .working_directory
                .clone()
                .unwrap_or_else(|| self.config.workspace.dir.display().to_string());
            (dir, None)
        };
        // An explicit caller-provided folder takes over as the cwd.
        if let Some(first) = add_dirs.first() {
            working_directory = first.clone();
        }

        let allowed_skill_names = self
            .workspace
            .get_allowed_skill_names(&agent.skill_ids, agent.allow_all_skills)?;
        debug!(
            "Agent skill access: allow_all={}, allowed_names={:?}",
            agent.allow_all_skills, allowed_skill_names
        );

        let session_key = resume.map(String::from).unwrap_or_else(|| agent.id.clone());
        let mut hook_chain = HookChain::new();
        if agent.enable_tool_logging {
            hook_chain.add(None, Arc::new(ToolLogger));
        }
        if agent.enable_safety_checks {
            hook_chain.add(Some("Bash"), Arc::new(DangerousCommandBlocker));
        }
        hook_chain.add(
            Some("Bash"),
            Arc::new(HumanApprovalGate::new(
                self.broker.clone(),
                session_context.clone(),
                session_key,
                agent.enable_human_approval,
                Duration::from_secs(self.config.agent.permission_wait_secs),
            )),
        );
        // No gate needed when every skill is allowed.
        if !agent.allow_all_skills {
            hook_chain.add(Some("Skill"), Arc::new(SkillAccessGate::new(allowed_skill_names)));
        }

        // File access control is meaningless in global-user mode.
        let access = if agent.global_user_mode || !agent.enable_file_access_control {
            None
        } else {
            let mut allowed_dirs = vec![working_directory.clone()];
            allowed_dirs.extend(agent.allowed_directories.iter().cloned());
            allowed_dirs.extend(add_dirs.iter().cloned());
            info!("File access control enabled, allowed directories: {:?}", allowed_dirs);
            Some(Arc::new(ContentAccessPolicy::new(&allowed_dirs)))
        };

        let mut model = agent
            .model
            .clone()
            .or_else(|| Some(self.config.agent.default_model.clone()));
        let use_bedrock = std::env::var("CLAUDE_CODE_USE_BEDROCK")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if use_bedrock {
            if let Some(m) = model.take() {
                let mapped = bedrock_model_id(&m);
                info!("Using Bedrock model: {}", mapped);
                model = Some(mapped);
            }
        }

        let options = AgentOptions {
            system_prompt,
            allowed_tools: if allowed_tools.is_empty() { None } else { Some(allowed_tools) },
            mcp_servers,
            plugins,
            permission_mode: agent.permission_mode.as_str().to_string(),
            model,
            cwd: working_directory,
            setting_sources,
            resume: resume.map(String::from),
            sandbox: SandboxSettings::resolve(&agent.sandbox, &self.config.sandbox),
            max_buffer_size: self.config.agent.max_buffer_size,
        };

        Ok(TurnSetup {
            options,
            hook_chain: Arc::new(hook_chain),
            access,
            session_context: session_context.clone(),
        })
    }

    // -- turn entry points --------------------------------------------------

    /// Run a conversation turn. Events stream out on the returned channel,
    /// ending with `result` or `error`.
    pub fn run_conversation(self: &Arc<Self>, request: ConversationRequest) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.conversation_turn(request, &tx).await {
                let _ = tx.send(error_event(e)).await;
            }
        });
        rx
    }

    async fn conversation_turn(
        &self,
        request: ConversationRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> ServiceResult<()> {
        let agent = self.db.get_agent(&request.agent_id)?;
        stage_environment(&ApiSettings::load(&self.credentials_file));

        let is_resuming = request.session_id.is_some();
        let display_text = request.input.display_text();
        let title = crate::util::preview(&display_text, SESSION_TITLE_CHARS);
        let is_slash_command = display_text.trim().starts_with('/');
        info!(
            "Running conversation with agent {}, session {:?}, is_resuming={}",
            agent.id, request.session_id, is_resuming
        );

        // The context cell must exist before the hooks are built so they
        // capture it, not its current value.
        let session_context = SessionContext::new(request.session_id.clone());
        let setup = self.build_turn(
            &agent,
            request.session_id.as_deref(),
            &session_context,
            &request.add_dirs,
        )?;

        let user_blocks = request.input.clone().into_blocks();
        let mut pending_user_blocks = Some(user_blocks);
        if let Some(session_id) = &request.session_id {
            // Resumed sessions announce and persist up front.
            let _ = tx
                .send(StreamEvent::SessionStart {
                    session_id: session_id.clone(),
                })
                .await;
            self.store_session(session_id, &agent.id, &title, &setup.options.cwd)?;
            if let Some(blocks) = pending_user_blocks.take() {
                self.save_message(session_id, MessageRole::User, blocks, None)?;
            }
        }

        let mut session = self
            .connector
            .connect(setup.options.clone())
            .await
            .map_err(|e| ServiceError::backend(format!("Failed to start model agent: {e}")))?;

        if let Some(session_id) = &request.session_id {
            self.live
                .lock()
                .expect("live map poisoned")
                .insert(session_id.clone(), session.control.clone());
        }

        session
            .control
            .send(ControlMessage::Query {
                input: request.input.clone(),
            })
            .await
            .map_err(|e| ServiceError::backend(format!("Failed to send query: {e}")))?;

        let announce_on_init = !is_resuming;
        self.run_merged_loop(
            &agent,
            &setup,
            &mut session,
            tx,
            announce_on_init,
            pending_user_blocks,
            &title,
            is_slash_command,
            &display_text,
        )
        .await;
        Ok(())
    }

    /// Continue a session by answering an `ask_user_question`.
    pub fn continue_with_answer(
        self: &Arc<Self>,
        agent_id: String,
        session_id: String,
        tool_use_id: String,
        answers: BTreeMap<String, String>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this
                .answer_turn(agent_id, session_id, tool_use_id, answers, &tx)
                .await
            {
                let _ = tx.send(error_event(e)).await;
            }
        });
        rx
    }

    async fn answer_turn(
        &self,
        agent_id: String,
        session_id: String,
        tool_use_id: String,
        answers: BTreeMap<String, String>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> ServiceResult<()> {
        let agent = self.db.get_agent(&agent_id)?;
        stage_environment(&ApiSettings::load(&self.credentials_file));
        info!(
            "Continuing session {} with answers to {} ({} answers)",
            session_id,
            tool_use_id,
            answers.len()
        );

        let session_context = SessionContext::new(Some(session_id.clone()));
        let setup = self.build_turn(&agent, Some(&session_id), &session_context, &[])?;

        let answer_json = serde_json::to_string_pretty(&serde_json::json!({ "answers": answers }))?;
        let answer_message = format!("User answers:\n{answer_json}");
        self.save_message(
            &session_id,
            MessageRole::User,
            vec![ContentBlock::Text {
                text: answer_message.clone(),
            }],
            None,
        )?;

        let mut session = self
            .connector
            .connect(setup.options.clone())
            .await
            .map_err(|e| ServiceError::backend(format!("Failed to start model agent: {e}")))?;
        self.live
            .lock()
            .expect("live map poisoned")
            .insert(session_id.clone(), session.control.clone());
        session
            .control
            .send(ControlMessage::Query {
                input: UserInput::Text(answer_message),
            })
            .await
            .map_err(|e| ServiceError::backend(format!("Failed to send answer: {e}")))?;

        self.run_merged_loop(&agent, &setup, &mut session, tx, false, None, "", false, "")
            .await;
        Ok(())
    }

    /// Record a permission decision, wake the suspended hook, and return
    /// the acknowledgement. The still-running turn on the original channel
    /// continues from the hook.
    pub fn continue_with_permission(
        &self,
        session_id: &str,
        request_id: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> ServiceResult<StreamEvent> {
        let request = self.db.get_permission(request_id)?.ok_or_else(|| {
            ServiceError::not_found(format!("Permission request '{request_id}' does not exist"))
        })?;
        let command = request
            .tool_input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown command")
            .to_string();

        self.broker.resolve(request_id, decision, feedback.clone())?;
        info!("Permission decision for request {}: {}", request_id, decision.as_str());

        let decision_message = match decision {
            Decision::Approve => {
                format!("User APPROVED the command. Please proceed with executing: {command}")
            }
            Decision::Deny => {
                let reason = feedback.unwrap_or_else(|| "User denied the command".to_string());
                format!(
                    "User DENIED the command '{command}'. Reason: {reason}. \
                     Please acknowledge this and continue without executing that command."
                )
            }
        };
        self.save_message(
            session_id,
            MessageRole::User,
            vec![ContentBlock::Text {
                text: decision_message,
            }],
            None,
        )?;

        Ok(StreamEvent::PermissionAcknowledged {
            request_id: request_id.to_string(),
            decision: decision.as_str().to_string(),
        })
    }

    /// Ask the active model agent to cancel. Outstanding permission
    /// requests for the session expire and their hooks wake with a denial.
    pub async fn interrupt_session(&self, session_id: &str) -> ServiceResult<bool> {
        self.broker.expire_session(session_id)?;

        let control = self
            .live
            .lock()
            .expect("live map poisoned")
            .get(session_id)
            .cloned();
        match control {
            Some(control) => {
                info!("Interrupting session {}", session_id);
                control
                    .send(ControlMessage::Interrupt)
                    .await
                    .map_err(|e| ServiceError::backend(format!("Failed to interrupt: {e}")))?;
                Ok(true)
            }
            None => {
                warn!("No active client found for session {}", session_id);
                Ok(false)
            }
        }
    }

    /// Interrupt every live session (shutdown path).
    pub async fn disconnect_all(&self) {
        let handles: Vec<(String, Arc<dyn AgentControl>)> = {
            let mut live = self.live.lock().expect("live map poisoned");
            live.drain().collect()
        };
        for (session_id, control) in handles {
            info!("Disconnecting client for session {}", session_id);
            if let Err(e) = control.send(ControlMessage::Interrupt).await {
                warn!("Error disconnecting client {}: {}", session_id, e);
            }
        }
    }

    // -- the merged event loop ----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_merged_loop(
        &self,
        agent: &AgentRecord,
        setup: &TurnSetup,
        session: &mut AgentSession,
        tx: &mpsc::Sender<StreamEvent>,
        mut announce_on_init: bool,
        mut pending_user_blocks: Option<Vec<ContentBlock>>,
        title: &str,
        is_slash_command: bool,
        display_text: &str,
    ) {
        let (merged_tx, mut merged_rx) = mpsc::channel::<MergedItem>(64);
        let control = session.control.clone();

        // Reader task: copy model events, then the done sentinel. The
        // sentinel guarantees this loop terminates even if a permission
        // item is still outstanding when the stream ends.
        let reader = {
            let merged = merged_tx.clone();
            let mut events = std::mem::replace(&mut session.events, mpsc::channel(1).1);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if merged.send(MergedItem::Agent(event)).await.is_err() {
                        return;
                    }
                }
                let _ = merged.send(MergedItem::AgentDone).await;
            })
        };

        // Forwarder task: deliver permission events for this session,
        // putting back items that belong to other sessions.
        let forwarder = {
            let merged = merged_tx.clone();
            let broker = self.broker.clone();
            let context = setup.session_context.clone();
            tokio::spawn(async move {
                loop {
                    let event = broker.next_event().await;
                    if event.session_id == context.get() {
                        debug!("Forwarding permission request {} to merged queue", event.request_id);
                        if merged.send(MergedItem::Permission(event)).await.is_err() {
                            return;
                        }
                    } else {
                        broker.put_back(event);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            })
        };
        drop(merged_tx);

        let default_model = agent
            .model
            .clone()
            .unwrap_or_else(|| self.config.agent.default_model.clone());
        let mut assistant_content: Vec<ContentBlock> = Vec::new();
        let mut assistant_model: Option<String> = None;
        let mut hook_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        let mut caller_disconnected = false;

        while let Some(item) = merged_rx.recv().await {
            match item {
                MergedItem::AgentDone => {
                    info!("Agent stream finished, exiting message loop");
                    break;
                }
                MergedItem::Permission(event) => {
                    let sent = tx
                        .send(StreamEvent::PermissionRequest {
                            session_id: event.session_id.unwrap_or_default(),
                            request_id: event.request_id,
                            tool_name: event.tool_name,
                            tool_input: event.tool_input,
                            reason: event.reason,
                            options: event.options,
                        })
                        .await;
                    if sent.is_err() {
                        caller_disconnected = true;
                        break;
                    }
                }
                MergedItem::Agent(AgentEvent::Init { session_id }) => {
                    setup.session_context.set(session_id.clone());
                    info!("Captured session id from init: {}", session_id);
                    self.live
                        .lock()
                        .expect("live map poisoned")
                        .insert(session_id.clone(), control.clone());

                    if announce_on_init {
                        announce_on_init = false;
                        let _ = tx
                            .send(StreamEvent::SessionStart {
                                session_id: session_id.clone(),
                            })
                            .await;
                        if let Err(e) =
                            self.store_session(&session_id, &agent.id, title, &setup.options.cwd)
                        {
                            warn!("Failed to store session {}: {}", session_id, e);
                        }
                        if let Some(blocks) = pending_user_blocks.take() {
                            if let Err(e) =
                                self.save_message(&session_id, MessageRole::User, blocks, None)
                            {
                                warn!("Failed to save user message: {}", e);
                            }
                        }
                    }
                }
                MergedItem::Agent(AgentEvent::ToolRequest {
                    request_id,
                    tool_name,
                    tool_input,
                }) => {
                    // Child task per request: an approval-suspended hook
                    // must not stall the merged loop.
                    let chain = setup.hook_chain.clone();
                    let access = setup.access.clone();
                    let control = control.clone();
                    hook_tasks.push(tokio::spawn(async move {
                        let decision =
                            evaluate_tool_request(&chain, access.as_deref(), &tool_name, &tool_input)
                                .await;
                        if let Err(e) = control
                            .send(ControlMessage::ToolDecision {
                                request_id,
                                decision,
                            })
                            .await
                        {
                            warn!("Failed to reply to tool request: {}", e);
                        }
                    }));
                }
                MergedItem::Agent(AgentEvent::Assistant { content, model }) => {
                    if let Some((tool_use_id, questions)) = find_ask_user_question(&content) {
                        // Persist what we have and hand the question to the
                        // caller; the turn ends here awaiting the answer.
                        let session_id = setup.session_context.get();
                        if let Some(session_id) = &session_id {
                            if !assistant_content.is_empty() {
                                let _ = self.save_message(
                                    session_id,
                                    MessageRole::Assistant,
                                    std::mem::take(&mut assistant_content),
                                    assistant_model.clone(),
                                );
                            }
                        }
                        info!("AskUserQuestion detected, stopping to wait for user input");
                        let _ = tx
                            .send(StreamEvent::AskUserQuestion {
                                session_id,
                                tool_use_id,
                                questions,
                            })
                            .await;
                        break;
                    }

                    let model = model.unwrap_or_else(|| default_model.clone());
                    assistant_model = Some(model.clone());
                    assistant_content.extend(content.clone());
                    let sent = tx
                        .send(StreamEvent::Assistant {
                            session_id: setup.session_context.get(),
                            content,
                            model,
                        })
                        .await;
                    if sent.is_err() {
                        caller_disconnected = true;
                        break;
                    }
                }
                MergedItem::Agent(AgentEvent::Result {
                    result,
                    duration_ms,
                    total_cost_usd,
                    num_turns,
                    ..
                }) => {
                    // Slash commands report through the result payload.
                    if let Some(text) = result.filter(|t| !t.is_empty()) {
                        let block = ContentBlock::Text { text };
                        assistant_content.push(block.clone());
                        let _ = tx
                            .send(StreamEvent::Assistant {
                                session_id: setup.session_context.get(),
                                content: vec![block],
                                model: default_model.clone(),
                            })
                            .await;
                    } else if is_slash_command && assistant_content.is_empty() {
                        let command_name = display_text
                            .trim()
                            .split_whitespace()
                            .next()
                            .unwrap_or("/unknown");
                        let block = ContentBlock::Text {
                            text: format!("Command `{command_name}` executed."),
                        };
                        assistant_content.push(block.clone());
                        let _ = tx
                            .send(StreamEvent::Assistant {
                                session_id: setup.session_context.get(),
                                content: vec![block],
                                model: default_model.clone(),
                            })
                            .await;
                    }

                    let session_id = setup.session_context.get().unwrap_or_default();
                    if !assistant_content.is_empty() && !session_id.is_empty() {
                        if let Err(e) = self.save_message(
                            &session_id,
                            MessageRole::Assistant,
                            std::mem::take(&mut assistant_content),
                            assistant_model.clone(),
                        ) {
                            warn!("Failed to save assistant message: {}", e);
                        }
                    }
                    let _ = tx
                        .send(StreamEvent::Result {
                            session_id,
                            duration_ms,
                            total_cost_usd,
                            num_turns,
                        })
                        .await;
                    break;
                }
                MergedItem::Agent(AgentEvent::Error { message, detail }) => {
                    warn!("Error from agent stream: {}", message);
                    let _ = tx
                        .send(StreamEvent::Error {
                            kind: ErrorKind::Internal,
                            message,
                            suggested_action: None,
                            detail,
                        })
                        .await;
                    break;
                }
            }
        }

        // Cleanup on every exit path: background tasks die with the turn
        // and the session leaves the live map.
        reader.abort();
        forwarder.abort();
        let _ = reader.await;
        let _ = forwarder.await;
        for task in hook_tasks {
            task.abort();
        }
        if let Some(session_id) = setup.session_context.get() {
            // A dropped caller channel is a cancellation: any hook still
            // suspended on an approval wakes with a denial.
            if caller_disconnected {
                warn!("Caller disconnected from session {}", session_id);
                if let Err(e) = self.broker.expire_session(&session_id) {
                    warn!("Failed to expire pending requests: {}", e);
                }
            }
            self.live
                .lock()
                .expect("live map poisoned")
                .remove(&session_id);
        }
    }

    // -- persistence helpers ------------------------------------------------

    fn store_session(
        &self,
        session_id: &str,
        agent_id: &str,
        title: &str,
        work_dir: &str,
    ) -> ServiceResult<()> {
        self.db.put_session(SessionRecord {
            id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            title: title.to_string(),
            work_dir: Some(work_dir.to_string()),
            last_accessed: 0,
            created_at: 0,
            updated_at: 0,
        })?;
        Ok(())
    }

    fn save_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: Vec<ContentBlock>,
        model: Option<String>,
    ) -> ServiceResult<MessageRecord> {
        self.db.put_message(MessageRecord {
            id: String::new(),
            session_id: session_id.to_string(),
            role,
            content,
            model,
            expires_at: 0,
            created_at: 0,
            updated_at: 0,
        })
    }
}

/// Run the hook chain, then the path gate. First denial wins; the reply
/// reaches the model agent as a tool error, never as a caller failure.
async fn evaluate_tool_request(
    chain: &HookChain,
    access: Option<&ContentAccessPolicy>,
    tool_name: &str,
    tool_input: &JsonValue,
) -> ToolDecision {
    match chain.run(tool_name, tool_input).await {
        HookDecision::Deny { reason } => return ToolDecision::Deny { message: reason },
        HookDecision::Pass => {}
    }
    if let Some(policy) = access {
        if let AccessDecision::Deny { message } = policy.check(tool_name, tool_input) {
            return ToolDecision::Deny { message };
        }
    }
    ToolDecision::Allow
}

fn find_ask_user_question(content: &[ContentBlock]) -> Option<(String, JsonValue)> {
    content.iter().find_map(|block| match block {
        ContentBlock::ToolUse { id, name, input } if name == "AskUserQuestion" => Some((
            id.clone(),
            input.get("questions").cloned().unwrap_or_else(|| serde_json::json!([])),
        )),
        _ => None,
    })
}

fn error_event(err: ServiceError) -> StreamEvent {
    StreamEvent::Error {
        kind: err.kind,
        message: err.message,
        suggested_action: err.suggested_action,
        detail: err.detail,
    }
}
