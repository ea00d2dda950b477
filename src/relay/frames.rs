//! Plaintext wire frames exchanged with browsers.
//!
//! These JSON frames are what the Double Ratchet encrypts. Terminal output
//! frames carry a per-browser monotonic `seq`; everything else is
//! unsequenced. The envelope version is carried alongside the tagged frame
//! body.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Current plaintext protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Which PTY of an agent a frame refers to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    /// The agent's main PTY.
    #[default]
    Main,
    /// The optional dev-server PTY.
    Server,
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            View::Main => f.write_str("main"),
            View::Server => f.write_str("server"),
        }
    }
}

/// Agent entry in an `agent_list` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    /// Session key identifying the agent.
    pub session_key: String,
    /// Repository in `owner/name` form.
    pub repo: String,
    /// Issue number, if issue-based.
    pub issue_number: Option<u32>,
    /// Checked-out branch.
    pub branch_name: String,
    /// Lifecycle status string.
    pub status: String,
    /// Whether a dev-server PTY exists.
    pub has_server: bool,
}

/// Plaintext frame body, tagged by `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireFrame {
    /// Terminal bytes for a subscribed (agent, view), sequence-numbered.
    TerminalOutput {
        /// Per-browser monotonic sequence number, starting at 1.
        seq: u64,
        /// Agent session key.
        agent: String,
        /// Which PTY.
        view: View,
        /// Base64 raw bytes.
        bytes_b64: String,
    },
    /// Keyboard input from the browser to an agent PTY.
    TerminalInput {
        /// Agent session key.
        agent: String,
        /// Which PTY.
        view: View,
        /// Base64 raw bytes.
        bytes_b64: String,
    },
    /// Browser viewport resize.
    Resize {
        /// Rows.
        rows: u16,
        /// Columns.
        cols: u16,
    },
    /// Current agent table pushed to the browser.
    AgentListUpdate {
        /// Live agents in display order.
        agents: Vec<AgentSummary>,
    },
    /// Browser subscribes to an agent, optionally resuming a prior session.
    SelectAgent {
        /// Agent session key.
        agent: String,
        /// Which PTY.
        #[serde(default)]
        view: View,
        /// Highest seq the browser has already applied.
        #[serde(default)]
        last_ack_seq: u64,
        /// Raw-byte fidelity mode (disables screen-hash suppression).
        #[serde(default)]
        raw_mode: bool,
    },
    /// Browser acknowledges frames up to `seq`, pruning the replay buffer.
    Ack {
        /// Highest contiguous seq applied by the browser.
        seq: u64,
    },
    /// The replay buffer could not cover the browser's gap; a full screen
    /// snapshot follows.
    ResyncFull {
        /// Agent session key.
        agent: String,
        /// Which PTY.
        view: View,
    },
    /// Reverse-tunnel HTTP request forwarded by the server.
    HttpRequest {
        /// Correlates with the response.
        request_id: String,
        /// HTTP method.
        method: String,
        /// Path including query string.
        path: String,
        /// Request headers (`Host`/`Connection` already stripped).
        headers: HashMap<String, String>,
        /// Base64 body, absent when empty.
        body_b64: Option<String>,
    },
    /// Reverse-tunnel HTTP response.
    HttpResponse {
        /// Echoed request id.
        request_id: String,
        /// Status code.
        status: u16,
        /// Status text.
        status_text: String,
        /// Response headers, hop-by-hop stripped.
        headers: HashMap<String, String>,
        /// Base64 body, absent when empty.
        body_b64: Option<String>,
    },
    /// Keepalive probe.
    Ping,
    /// Keepalive reply.
    Pong,
}

/// Versioned envelope around a frame: the serialized form browsers see
/// inside the encryption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    /// Plaintext protocol version.
    pub v: u8,
    /// The frame body, flattened into the same JSON object.
    #[serde(flatten)]
    pub frame: WireFrame,
}

impl FrameEnvelope {
    /// Wrap a frame at the current version.
    #[must_use]
    pub fn new(frame: WireFrame) -> Self {
        Self {
            v: WIRE_VERSION,
            frame,
        }
    }

    /// Serialize to the JSON bytes handed to the ratchet.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse decrypted plaintext back into a frame.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_output_wire_shape() {
        let envelope = FrameEnvelope::new(WireFrame::TerminalOutput {
            seq: 12345,
            agent: "acme-demo-42".into(),
            view: View::Main,
            bytes_b64: "aGk=".into(),
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["kind"], "terminal_output");
        assert_eq!(json["seq"], 12345);
        assert_eq!(json["agent"], "acme-demo-42");
        assert_eq!(json["view"], "main");
        assert_eq!(json["bytes_b64"], "aGk=");
    }

    #[test]
    fn test_http_frames_roundtrip() {
        let envelope = FrameEnvelope::new(WireFrame::HttpRequest {
            request_id: "req_abc".into(),
            method: "GET".into(),
            path: "/users?p=1".into(),
            headers: HashMap::from([("accept".to_string(), "text/html".to_string())]),
            body_b64: None,
        });
        let bytes = envelope.to_bytes().unwrap();
        let parsed = FrameEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, envelope);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "http_request");
        assert_eq!(json["body_b64"], serde_json::Value::Null);
    }

    #[test]
    fn test_select_agent_defaults() {
        let parsed = FrameEnvelope::from_bytes(
            br#"{"v":1,"kind":"select_agent","agent":"acme-demo-42"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.frame,
            WireFrame::SelectAgent {
                agent: "acme-demo-42".into(),
                view: View::Main,
                last_ack_seq: 0,
                raw_mode: false,
            }
        );
    }

    #[test]
    fn test_view_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&View::Server).unwrap(), "\"server\"");
        assert_eq!(View::default(), View::Main);
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let result = FrameEnvelope::from_bytes(br#"{"v":1,"kind":"no_such_frame"}"#);
        assert!(result.is_err());
    }
}
