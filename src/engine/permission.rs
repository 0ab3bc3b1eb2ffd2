use crate::db::{Db, PermissionRecord, PermissionStatus};
use crate::error::ServiceResult;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(Self::Approve),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// A freshly opened permission request, queued for event fusion.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionEvent {
    pub session_id: Option<String>,
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: JsonValue,
    pub reason: String,
    pub options: Vec<String>,
}

/// Tracking a command approval: 16-hex-prefix of SHA-256.
fn hash_command(command: &str) -> String {
    let digest = Sha256::digest(command.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Process-wide registry of outstanding approval waiters.
///
/// Owns three pieces of shared state: the global queue of fresh permission
/// events (consumed by each turn's forwarder with a put-back discipline),
/// the waiter rendezvous map used by suspended hooks, and the per-session
/// approval memoization sets.
pub struct PermissionBroker {
    db: Arc<Db>,
    queue: Mutex<VecDeque<PermissionEvent>>,
    queue_notify: Notify,
    waiters: Mutex<HashMap<String, oneshot::Sender<Decision>>>,
    approvals: Mutex<HashMap<String, HashSet<String>>>,
    /// request_id -> the approval key the opening hook tracks approvals
    /// under. The resolve path memoizes with the SAME key so a later
    /// identical command is recognized by the suspended session's hook.
    request_keys: Mutex<HashMap<String, String>>,
}

impl PermissionBroker {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            waiters: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
            request_keys: Mutex::new(HashMap::new()),
        }
    }

    // -- request lifecycle --------------------------------------------------

    /// Persist a pending request and enqueue its event. Returns the id.
    ///
    /// `session_key` is the key the opening hook uses for approval
    /// memoization (resume id, or agent id before the first init);
    /// `session_id` is the model-assigned id used for event routing.
    pub fn open_request(
        &self,
        session_key: &str,
        session_id: Option<String>,
        tool_name: &str,
        tool_input: JsonValue,
        reason: &str,
    ) -> ServiceResult<String> {
        let request_id = format!("perm_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        self.request_keys
            .lock()
            .expect("request key map poisoned")
            .insert(request_id.clone(), session_key.to_string());
        self.db.put_permission(PermissionRecord {
            id: request_id.clone(),
            session_id: session_id.clone().unwrap_or_default(),
            tool_name: tool_name.to_string(),
            tool_input: tool_input.clone(),
            reason: reason.to_string(),
            status: PermissionStatus::Pending,
            decided_at: None,
            user_feedback: None,
            created_at: 0,
            updated_at: 0,
        })?;

        self.push_event(PermissionEvent {
            session_id,
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            tool_input,
            reason: reason.to_string(),
            options: vec!["approve".to_string(), "deny".to_string()],
        });

        warn!(
            "[PERMISSION_REQUEST] {} requires approval: {} (request_id: {})",
            tool_name, reason, request_id
        );
        Ok(request_id)
    }

    /// Block until the request is resolved, up to `timeout`.
    /// A timeout marks the record expired and reads as a denial.
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Decision {
        // A decision may already have landed between open and wait.
        if let Ok(Some(record)) = self.db.get_permission(request_id) {
            if record.status.is_terminal() {
                return match record.status {
                    PermissionStatus::Approved => Decision::Approve,
                    _ => Decision::Deny,
                };
            }
        }

        let rx = {
            let (tx, rx) = oneshot::channel();
            self.waiters
                .lock()
                .expect("waiter registry poisoned")
                .insert(request_id.to_string(), tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                // Sender dropped without a decision: treat as denial.
                debug!("Waiter for {} dropped without decision", request_id);
                Decision::Deny
            }
            Err(_) => {
                self.waiters
                    .lock()
                    .expect("waiter registry poisoned")
                    .remove(request_id);
                if let Err(e) =
                    self.db
                        .decide_permission(request_id, PermissionStatus::Expired, None)
                {
                    warn!("Failed to expire permission request {}: {}", request_id, e);
                }
                info!("Permission request {} timed out, denying", request_id);
                Decision::Deny
            }
        }
    }

    /// Persist the terminal state and wake the suspended hook.
    /// Idempotent: a second resolve is a no-op for the waiter and leaves the
    /// first terminal status in place.
    pub fn resolve(
        &self,
        request_id: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> ServiceResult<PermissionRecord> {
        let status = match decision {
            Decision::Approve => PermissionStatus::Approved,
            Decision::Deny => PermissionStatus::Denied,
        };
        let record = self.db.decide_permission(request_id, status, feedback)?;

        // Memoize approvals under the key the hook sees, before waking it.
        let session_key = self
            .request_keys
            .lock()
            .expect("request key map poisoned")
            .remove(request_id)
            .unwrap_or_else(|| record.session_id.clone());
        if decision == Decision::Approve {
            if let Some(command) = record.tool_input.get("command").and_then(|v| v.as_str()) {
                self.remember_approval(&session_key, command);
            }
        }

        let waiter = self
            .waiters
            .lock()
            .expect("waiter registry poisoned")
            .remove(request_id);
        if let Some(tx) = waiter {
            let _ = tx.send(decision);
            info!("Permission decision sent to waiting hook: {} -> {}", request_id, decision.as_str());
        }
        Ok(record)
    }

    /// Interrupt policy: expire every outstanding request for a session and
    /// wake its hooks with a denial.
    pub fn expire_session(&self, session_id: &str) -> ServiceResult<usize> {
        let pending: Vec<PermissionRecord> = self
            .db
            .list_permissions()?
            .into_iter()
            .filter(|r| r.session_id == session_id && r.status == PermissionStatus::Pending)
            .collect();

        let mut expired = 0usize;
        for request in pending {
            self.db
                .decide_permission(&request.id, PermissionStatus::Expired, None)?;
            self.request_keys
                .lock()
                .expect("request key map poisoned")
                .remove(&request.id);
            let waiter = self
                .waiters
                .lock()
                .expect("waiter registry poisoned")
                .remove(&request.id);
            if let Some(tx) = waiter {
                let _ = tx.send(Decision::Deny);
            }
            expired += 1;
        }
        if expired > 0 {
            info!("Expired {} pending permission request(s) for session {}", expired, session_id);
        }
        Ok(expired)
    }

    // -- approval memoization -----------------------------------------------

    /// Remember a command approval for a session key.
    pub fn remember_approval(&self, session_key: &str, command: &str) {
        let hash = hash_command(command);
        self.approvals
            .lock()
            .expect("approval set poisoned")
            .entry(session_key.to_string())
            .or_default()
            .insert(hash.clone());
        info!(
            "Command approved for session {}: {} (hash: {})",
            session_key,
            crate::util::preview(command, 50),
            hash
        );
    }

    pub fn is_approved(&self, session_key: &str, command: &str) -> bool {
        let approvals = self.approvals.lock().expect("approval set poisoned");
        approvals
            .get(session_key)
            .map(|set| set.contains(&hash_command(command)))
            .unwrap_or(false)
    }

    #[allow(dead_code)]
    pub fn clear_session_approvals(&self, session_key: &str) {
        self.approvals
            .lock()
            .expect("approval set poisoned")
            .remove(session_key);
    }

    // -- global event queue -------------------------------------------------

    fn push_event(&self, event: PermissionEvent) {
        self.queue
            .lock()
            .expect("permission queue poisoned")
            .push_back(event);
        self.queue_notify.notify_waiters();
    }

    /// Take the next queued event, waiting if the queue is empty.
    pub async fn next_event(&self) -> PermissionEvent {
        loop {
            let notified = self.queue_notify.notified();
            if let Some(event) = self
                .queue
                .lock()
                .expect("permission queue poisoned")
                .pop_front()
            {
                return event;
            }
            notified.await;
        }
    }

    /// Return an event that belongs to another session's forwarder.
    pub fn put_back(&self, event: PermissionEvent) {
        self.push_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> (tempfile::TempDir, Arc<PermissionBroker>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(&dir.path().join("test.redb")).unwrap());
        (dir, Arc::new(PermissionBroker::new(db)))
    }

    #[test]
    fn test_hash_command_prefix() {
        let hash = hash_command("rm -rf /tmp/x");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_command("rm -rf /tmp/x"));
        assert_ne!(hash, hash_command("rm -rf /tmp/y"));
    }

    #[test]
    fn test_remember_and_check_approval() {
        let (_dir, broker) = broker();
        assert!(!broker.is_approved("sess", "ls"));
        broker.remember_approval("sess", "ls");
        assert!(broker.is_approved("sess", "ls"));
        assert!(!broker.is_approved("other", "ls"));
        broker.clear_session_approvals("sess");
        assert!(!broker.is_approved("sess", "ls"));
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let (_dir, broker) = broker();
        let id = broker
            .open_request(
                "agent_1",
                Some("sess_1".into()),
                "Bash",
                serde_json::json!({"command": "rm -rf /tmp/x"}),
                "Recursive file deletion",
            )
            .unwrap();

        let waiter = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.wait(&id, Duration::from_secs(5)).await })
        };
        // Give the waiter a moment to register.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = broker.resolve(&id, Decision::Approve, None).unwrap();
        assert_eq!(record.status, PermissionStatus::Approved);
        assert_eq!(waiter.await.unwrap(), Decision::Approve);

        // The resolve path memoized the approval under the hook's key.
        assert!(broker.is_approved("agent_1", "rm -rf /tmp/x"));
        assert!(!broker.is_approved("sess_1", "rm -rf /tmp/x"));

        // Second resolve is a no-op on the terminal state.
        let again = broker.resolve(&id, Decision::Deny, Some("late".into())).unwrap();
        assert_eq!(again.status, PermissionStatus::Approved);
    }

    #[tokio::test]
    async fn test_wait_timeout_expires_request() {
        let (_dir, broker) = broker();
        let id = broker
            .open_request(
                "agent_1",
                None,
                "Bash",
                serde_json::json!({"command": "mkfs /dev/sda"}),
                "Filesystem format command",
            )
            .unwrap();

        let decision = broker.wait(&id, Duration::from_millis(30)).await;
        assert_eq!(decision, Decision::Deny);

        let record = broker.db.get_permission(&id).unwrap().unwrap();
        assert_eq!(record.status, PermissionStatus::Expired);
    }

    #[tokio::test]
    async fn test_queue_put_back_round_trip() {
        let (_dir, broker) = broker();
        broker
            .open_request("a", Some("a".into()), "Bash", serde_json::json!({}), "r")
            .unwrap();

        let event = broker.next_event().await;
        assert_eq!(event.session_id.as_deref(), Some("a"));
        broker.put_back(event);
        let event = broker.next_event().await;
        assert_eq!(event.session_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expire_session_wakes_hooks_with_deny() {
        let (_dir, broker) = broker();
        let id = broker
            .open_request(
                "sess_9",
                Some("sess_9".into()),
                "Bash",
                serde_json::json!({"command": "sudo rm -rf /opt"}),
                "Sudo removal command",
            )
            .unwrap();

        let waiter = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.wait(&id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(broker.expire_session("sess_9").unwrap(), 1);
        assert_eq!(waiter.await.unwrap(), Decision::Deny);
        let record = broker.db.get_permission(&id).unwrap().unwrap();
        assert_eq!(record.status, PermissionStatus::Expired);
    }
}
