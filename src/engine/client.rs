use crate::engine::types::{AgentEvent, AgentOptions, ToolDecision, UserInput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// The narrow model-agent interface
// ---------------------------------------------------------------------------

/// Messages the supervisor sends to a running model agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Options for the session; always the first message.
    Options { options: AgentOptions },
    /// User input starting or continuing the turn.
    Query { input: UserInput },
    /// Reply to an `AgentEvent::ToolRequest` after the hooks ran.
    ToolDecision {
        request_id: String,
        #[serde(flatten)]
        decision: ToolDecision,
    },
    /// Ask the agent to cancel the in-flight turn.
    Interrupt,
}

/// Send half of a live agent session. Cloneable across tasks.
#[async_trait]
pub trait AgentControl: Send + Sync {
    async fn send(&self, message: ControlMessage) -> Result<()>;
}

/// A connected model-agent session: an ordered event stream plus the
/// control channel used to answer tool requests and interrupt.
pub struct AgentSession {
    pub events: mpsc::Receiver<AgentEvent>,
    pub control: Arc<dyn AgentControl>,
}

/// Launches model-agent sessions. The default implementation spawns a
/// configured subprocess; tests substitute a scripted connector.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, options: AgentOptions) -> Result<AgentSession>;
}

// ---------------------------------------------------------------------------
// Subprocess transport (newline-delimited JSON)
// ---------------------------------------------------------------------------

/// Spawns the model agent as a child process speaking ndjson: control
/// messages on stdin, events on stdout, diagnostics on stderr.
pub struct ProcessConnector {
    command: String,
    args: Vec<String>,
    max_buffer_size: usize,
}

impl ProcessConnector {
    pub fn new(command: String, args: Vec<String>, max_buffer_size: usize) -> Self {
        Self {
            command,
            args,
            max_buffer_size,
        }
    }
}

struct ProcessControl {
    stdin: Mutex<ChildStdin>,
}

#[async_trait]
impl AgentControl for ProcessControl {
    async fn send(&self, message: ControlMessage) -> Result<()> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AgentConnector for ProcessConnector {
    async fn connect(&self, options: AgentOptions) -> Result<AgentSession> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch model agent '{}'", self.command))?;

        let stdin = child.stdin.take().context("model agent stdin unavailable")?;
        let stdout = child.stdout.take().context("model agent stdout unavailable")?;
        let stderr = child.stderr.take().context("model agent stderr unavailable")?;

        let control = Arc::new(ProcessControl {
            stdin: Mutex::new(stdin),
        });
        control
            .send(ControlMessage::Options { options })
            .await
            .context("Failed to hand options to the model agent")?;

        // Forward agent diagnostics into our logs.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                error!("[agent stderr] {}", line);
            }
        });

        let (events_tx, events_rx) = mpsc::channel(64);
        let max_buffer_size = self.max_buffer_size;
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = String::new();
            loop {
                buf.clear();
                match reader.read_line(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) if n > max_buffer_size => {
                        warn!("Agent event exceeds max buffer size ({} bytes), dropping", n);
                        continue;
                    }
                    Ok(_) => {
                        let line = buf.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<AgentEvent>(line) {
                            Ok(event) => {
                                if events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("Skipping unparseable agent event: {} ({})", crate::util::preview(line, 120), e);
                            }
                        }
                    }
                    Err(e) => {
                        let _ = events_tx
                            .send(AgentEvent::Error {
                                message: format!("Agent stream read failed: {e}"),
                                detail: None,
                            })
                            .await;
                        break;
                    }
                }
            }
            // Child reaped here; kill_on_drop covers abnormal exits.
            let _ = child.wait().await;
        });

        Ok(AgentSession {
            events: events_rx,
            control,
        })
    }
}
