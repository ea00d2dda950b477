//! Wire types for control-server communication.
//!
//! Defines the message payloads exchanged with the server: polled work
//! items, heartbeat bodies, and notification requests.

use serde::{Deserialize, Serialize};

/// Deterministic identifier for an agent, derived from its work item.
///
/// `owner-repo-<issue>` for issue-based items, `owner-repo-<branch>` (with
/// `/` replaced by `-`) for branch-based ones. Unique across live agents on
/// a hub; reusable once the prior agent ends.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Key for an issue-based work item.
    #[must_use]
    pub fn for_issue(repo: &str, issue_number: u32) -> Self {
        Self(format!("{}-{}", repo.replace('/', "-"), issue_number))
    }

    /// Key for a branch-based work item.
    #[must_use]
    pub fn for_branch(repo: &str, branch: &str) -> Self {
        Self(format!(
            "{}-{}",
            repo.replace('/', "-"),
            branch.replace('/', "-")
        ))
    }

    /// Wrap an already-derived key (wire input).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event kinds the hub understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Spawn a new agent for an issue or branch.
    SpawnAgent,
    /// Close a running agent (issue/PR closed server-side).
    CloseAgent,
    /// WebRTC SDP offer from a browser, relayed for signaling.
    BrowserOffer,
    /// Ping an existing agent with a new mention.
    NotificationHint,
}

impl EventKind {
    /// Parse the server's `event_type` string. Unknown kinds return `None`
    /// and the message is acked without action.
    #[must_use]
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "spawn_agent" => Some(Self::SpawnAgent),
            "close_agent" | "agent_cleanup" => Some(Self::CloseAgent),
            "browser_offer" => Some(Self::BrowserOffer),
            "notification_hint" => Some(Self::NotificationHint),
            _ => None,
        }
    }
}

/// Raw message envelope from `GET /hubs/{id}/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageData {
    /// Server-unique message identifier.
    pub id: u64,
    /// Event type string.
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

/// Poll response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    /// Pending messages, oldest first.
    pub messages: Vec<MessageData>,
    /// Server-side count (may exceed `messages.len()` when truncated).
    #[serde(default)]
    pub count: usize,
}

/// A parsed instruction from the control server.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Server-unique message id, echoed back in the ack.
    pub message_id: u64,
    /// What the hub should do.
    pub event_kind: EventKind,
    /// Repository in `owner/name` form.
    pub repo: String,
    /// Issue number, when the item is issue-based.
    pub issue_number: Option<u32>,
    /// Branch to check out; defaults to `issue-<n>` for issue items.
    pub branch_name: String,
    /// Text handed to the agent.
    pub prompt: String,
    /// Originating URL for UI linkback.
    pub invocation_url: Option<String>,
    /// GitHub App installation, when known.
    pub installation_id: Option<u64>,
    /// Raw payload, kept for event kinds with extra fields (SDP offers).
    pub payload: serde_json::Value,
}

impl WorkItem {
    /// Parse a raw message. Returns `None` for unknown event kinds or
    /// payloads missing a repo - those are acked without action.
    #[must_use]
    pub fn from_message(data: &MessageData) -> Option<Self> {
        let event_kind = EventKind::parse(&data.event_type)?;
        let payload = &data.payload;

        let repo = payload
            .get("repo")
            .and_then(|r| r.as_str())
            .or_else(|| {
                payload
                    .get("repository")
                    .and_then(|r| r.get("full_name"))
                    .and_then(|n| n.as_str())
            })?
            .to_string();

        let issue_number = payload
            .get("issue_number")
            .and_then(serde_json::Value::as_u64)
            .or_else(|| {
                payload
                    .get("issue")
                    .and_then(|i| i.get("number"))
                    .and_then(serde_json::Value::as_u64)
            })
            .map(|n| n as u32);

        let branch_name = payload
            .get("branch_name")
            .and_then(|b| b.as_str())
            .map(String::from)
            .filter(|b| !b.is_empty())
            .or_else(|| issue_number.map(|n| format!("issue-{n}")))
            .unwrap_or_else(|| "main".to_string());

        let prompt = payload
            .get("prompt")
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string();

        let invocation_url = payload
            .get("invocation_url")
            .or_else(|| payload.get("issue_url"))
            .and_then(|u| u.as_str())
            .map(String::from);

        let installation_id = payload
            .get("installation_id")
            .and_then(serde_json::Value::as_u64);

        Some(Self {
            message_id: data.id,
            event_kind,
            repo,
            issue_number,
            branch_name,
            prompt,
            invocation_url,
            installation_id,
            payload: data.payload.clone(),
        })
    }

    /// Deterministic session key for this item: issue number wins over
    /// branch when both are present.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        match self.issue_number {
            Some(n) => SessionKey::for_issue(&self.repo, n),
            None => SessionKey::for_branch(&self.repo, &self.branch_name),
        }
    }
}

/// Agent entry included in register/heartbeat payloads.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHeartbeatInfo {
    /// Session key of the live agent.
    pub session_key: SessionKey,
    /// Last invocation URL, for the server's UI linkback.
    pub last_invocation_url: Option<String>,
}

/// Body for `PUT /api/hubs` and `PATCH /hubs/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    /// Hub identifier (upsert key).
    pub identifier: String,
    /// Repository this hub serves.
    pub repo: String,
    /// Live agents.
    pub agents: Vec<AgentHeartbeatInfo>,
    /// Device identity for E2E pairing.
    pub device_id: String,
}

/// Response to hub registration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    /// Whether the upsert succeeded.
    #[serde(default)]
    pub success: bool,
    /// Whether the server expects end-to-end encrypted relay.
    #[serde(default)]
    pub e2e_enabled: bool,
}

/// User-visible notification kinds posted to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Generic attention bell.
    Bell,
    /// The agent asked a question and is waiting.
    QuestionAsked,
    /// Raw OSC 9 message passthrough.
    Osc9(String),
    /// Raw OSC 777 passthrough.
    Osc777 {
        /// Notification title.
        title: String,
        /// Notification body.
        body: String,
    },
}

impl NotificationKind {
    /// Wire encoding of the kind (closed set plus `osc9:*`/`osc777:*`
    /// escape hatch).
    #[must_use]
    pub fn as_wire(&self) -> String {
        match self {
            Self::Bell => "bell".to_string(),
            Self::QuestionAsked => "question_asked".to_string(),
            Self::Osc9(msg) => format!("osc9:{msg}"),
            Self::Osc777 { title, body } => format!("osc777:{title}:{body}"),
        }
    }
}

/// Body for `POST /api/agent_notifications`.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    /// Repository in `owner/name` form.
    pub repo: String,
    /// Issue number, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u32>,
    /// Invocation URL, the preferred identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_url: Option<String>,
    /// Encoded notification kind.
    pub notification_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64, event_type: &str, payload: serde_json::Value) -> MessageData {
        MessageData {
            id,
            event_type: event_type.to_string(),
            payload,
        }
    }

    #[test]
    fn test_session_key_for_issue() {
        let key = SessionKey::for_issue("acme/demo", 42);
        assert_eq!(key.as_str(), "acme-demo-42");
    }

    #[test]
    fn test_session_key_sanitizes_branch_slashes() {
        let key = SessionKey::for_branch("acme/demo", "feat/login-fix");
        assert_eq!(key.as_str(), "acme-demo-feat-login-fix");
    }

    #[test]
    fn test_work_item_parses_spawn() {
        let data = message(
            100,
            "spawn_agent",
            serde_json::json!({
                "repo": "acme/demo",
                "issue_number": 42,
                "branch_name": "issue-42",
                "prompt": "Fix the login bug",
                "invocation_url": "https://github.com/acme/demo/issues/42"
            }),
        );

        let item = WorkItem::from_message(&data).unwrap();
        assert_eq!(item.message_id, 100);
        assert_eq!(item.event_kind, EventKind::SpawnAgent);
        assert_eq!(item.issue_number, Some(42));
        assert_eq!(item.branch_name, "issue-42");
        assert_eq!(item.prompt, "Fix the login bug");
        assert_eq!(item.session_key().as_str(), "acme-demo-42");
    }

    #[test]
    fn test_work_item_branch_defaults_from_issue() {
        let data = message(
            1,
            "spawn_agent",
            serde_json::json!({ "repo": "acme/demo", "issue_number": 7 }),
        );
        let item = WorkItem::from_message(&data).unwrap();
        assert_eq!(item.branch_name, "issue-7");
    }

    #[test]
    fn test_work_item_branch_based_key() {
        let data = message(
            2,
            "spawn_agent",
            serde_json::json!({ "repo": "acme/demo", "branch_name": "hotfix/x" }),
        );
        let item = WorkItem::from_message(&data).unwrap();
        assert_eq!(item.issue_number, None);
        assert_eq!(item.session_key().as_str(), "acme-demo-hotfix-x");
    }

    #[test]
    fn test_work_item_nested_repository_shape() {
        let data = message(
            3,
            "close_agent",
            serde_json::json!({
                "repository": { "full_name": "acme/demo" },
                "issue": { "number": 9 }
            }),
        );
        let item = WorkItem::from_message(&data).unwrap();
        assert_eq!(item.repo, "acme/demo");
        assert_eq!(item.issue_number, Some(9));
        assert_eq!(item.event_kind, EventKind::CloseAgent);
    }

    #[test]
    fn test_unknown_event_kind_is_skipped() {
        let data = message(4, "totally_new_event", serde_json::json!({"repo": "a/b"}));
        assert!(WorkItem::from_message(&data).is_none());
    }

    #[test]
    fn test_missing_repo_is_skipped() {
        let data = message(5, "spawn_agent", serde_json::json!({"issue_number": 1}));
        assert!(WorkItem::from_message(&data).is_none());
    }

    #[test]
    fn test_notification_kind_wire_encoding() {
        assert_eq!(NotificationKind::Bell.as_wire(), "bell");
        assert_eq!(NotificationKind::QuestionAsked.as_wire(), "question_asked");
        assert_eq!(
            NotificationKind::Osc9("done".into()).as_wire(),
            "osc9:done"
        );
        assert_eq!(
            NotificationKind::Osc777 {
                title: "Q".into(),
                body: "B".into()
            }
            .as_wire(),
            "osc777:Q:B"
        );
    }

    #[test]
    fn test_heartbeat_payload_serialization() {
        let payload = HeartbeatPayload {
            identifier: "hub-1".into(),
            repo: "acme/demo".into(),
            agents: vec![AgentHeartbeatInfo {
                session_key: SessionKey::for_issue("acme/demo", 42),
                last_invocation_url: None,
            }],
            device_id: "dev-1".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"identifier\":\"hub-1\""));
        assert!(json.contains("\"session_key\":\"acme-demo-42\""));
    }
}
