//! Relay WebSocket pump.
//!
//! Maintains the persistent Action-Cable connection to the control server:
//! subscribes to the hub's `TerminalRelayChannel`, forwards inbound
//! ciphertext envelopes (and plain tunnel HTTP requests) to the
//! orchestrator's event channel, and drains an outbound queue of messages
//! to send. Reconnects with exponential backoff; the orchestrator never
//! sees transport errors.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
};

use super::ratchet::RatchetEnvelope;
use crate::server::Backoff;

/// Inbound events handed to the orchestrator.
#[derive(Debug)]
pub enum RelayEvent {
    /// Subscription confirmed; the relay is live.
    Connected,
    /// Socket dropped; a reconnect is underway.
    Disconnected,
    /// Encrypted envelope from a browser.
    Envelope {
        /// Opaque browser identity.
        browser_id: String,
        /// The ciphertext envelope.
        envelope: RatchetEnvelope,
    },
    /// Reverse-tunnel HTTP request pushed by the server (plaintext).
    HttpRequest {
        /// Correlates with the response.
        request_id: String,
        /// Target agent.
        session_key: String,
        /// HTTP method.
        method: String,
        /// Path including query string.
        path: String,
        /// Request headers.
        headers: HashMap<String, String>,
        /// Base64 body, absent when empty.
        body_b64: Option<String>,
    },
}

/// Outbound messages queued by the orchestrator.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Encrypted envelope for one browser.
    Relay {
        /// Destination browser.
        browser_id: String,
        /// The ciphertext envelope.
        envelope: RatchetEnvelope,
    },
    /// Tunnel HTTP response (plaintext).
    HttpResponse {
        /// Echoed request id.
        request_id: String,
        /// Status code.
        status: u16,
        /// Status text.
        status_text: String,
        /// Response headers.
        headers: HashMap<String, String>,
        /// Base64 body, absent when empty.
        body_b64: Option<String>,
    },
}

/// Inbound cable payload inside `{"message": ...}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Relay {
        browser_id: String,
        envelope: RatchetEnvelope,
    },
    HttpRequest {
        request_id: String,
        session_key: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body_b64: Option<String>,
    },
}

/// Run the relay connection until the outbound sender is dropped.
///
/// Spawned once onto the hub's runtime. Internal reconnect loop with
/// jittered exponential backoff.
pub async fn run(
    cable_url: String,
    origin: String,
    token: String,
    hub_identifier: String,
    event_tx: std::sync::mpsc::Sender<RelayEvent>,
    mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<OutboundMessage>,
) {
    let mut backoff = Backoff::new();

    loop {
        match connect_once(
            &cable_url,
            &origin,
            &token,
            &hub_identifier,
            &event_tx,
            &mut outbound_rx,
        )
        .await
        {
            Ok(SessionEnd::SenderDropped) => {
                log::info!("[relay] outbound channel closed, stopping");
                return;
            }
            Ok(SessionEnd::Disconnected) => {
                let _ = event_tx.send(RelayEvent::Disconnected);
                backoff.reset();
            }
            Err(e) => {
                let _ = event_tx.send(RelayEvent::Disconnected);
                log::warn!("[relay] connection failed: {}", e);
            }
        }

        let delay = backoff.next_delay();
        log::info!("[relay] reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

enum SessionEnd {
    /// The hub dropped the outbound sender: shut down for good.
    SenderDropped,
    /// The server closed the socket: reconnect.
    Disconnected,
}

async fn connect_once(
    cable_url: &str,
    origin: &str,
    token: &str,
    hub_identifier: &str,
    event_tx: &std::sync::mpsc::Sender<RelayEvent>,
    outbound_rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutboundMessage>,
) -> anyhow::Result<SessionEnd> {
    let mut request = cable_url.into_client_request()?;
    // Action Cable rejects upgrades without an Origin; some proxies strip
    // Authorization on upgrade, hence the token query fallback in the URL.
    request.headers_mut().insert("Origin", origin.parse()?);
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {token}").parse()?);

    log::info!("[relay] connecting to {}", cable_url.split('?').next().unwrap_or(cable_url));
    let (ws_stream, _) = connect_async(request).await?;
    let (mut write, mut read) = ws_stream.split();

    let identifier = serde_json::json!({
        "channel": "TerminalRelayChannel",
        "hub_identifier": hub_identifier,
    })
    .to_string();

    let subscribe = serde_json::json!({
        "command": "subscribe",
        "identifier": identifier,
    });
    write.send(Message::Text(subscribe.to_string())).await?;

    loop {
        tokio::select! {
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, event_tx);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("[relay] closed by server: {:?}", frame);
                        return Ok(SessionEnd::Disconnected);
                    }
                    Some(Err(e)) => {
                        log::warn!("[relay] socket error: {}", e);
                        return Ok(SessionEnd::Disconnected);
                    }
                    None => return Ok(SessionEnd::Disconnected),
                    Some(Ok(_)) => {}
                }
            }
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else {
                    return Ok(SessionEnd::SenderDropped);
                };
                let cable_frame = serde_json::json!({
                    "command": "message",
                    "identifier": identifier,
                    "data": serde_json::to_string(&message)?,
                });
                write.send(Message::Text(cable_frame.to_string())).await?;
            }
        }
    }
}

/// Parse one cable text frame and forward anything meaningful.
fn handle_text(text: &str, event_tx: &std::sync::mpsc::Sender<RelayEvent>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        log::debug!("[relay] unparseable frame");
        return;
    };

    // Action Cable protocol frames.
    if let Some(frame_type) = value.get("type").and_then(|t| t.as_str()) {
        match frame_type {
            "welcome" => log::info!("[relay] cable welcome"),
            "confirm_subscription" => {
                log::info!("[relay] subscription confirmed");
                let _ = event_tx.send(RelayEvent::Connected);
            }
            "reject_subscription" => {
                // Hub not registered yet; the next heartbeat creates it and
                // the reconnect loop resubscribes.
                log::warn!("[relay] subscription rejected");
            }
            "ping" | "disconnect" => {}
            other => log::debug!("[relay] cable frame: {}", other),
        }
        return;
    }

    let Some(message) = value.get("message") else {
        return;
    };
    match serde_json::from_value::<InboundMessage>(message.clone()) {
        Ok(InboundMessage::Relay {
            browser_id,
            envelope,
        }) => {
            let _ = event_tx.send(RelayEvent::Envelope {
                browser_id,
                envelope,
            });
        }
        Ok(InboundMessage::HttpRequest {
            request_id,
            session_key,
            method,
            path,
            headers,
            body_b64,
        }) => {
            let _ = event_tx.send(RelayEvent::HttpRequest {
                request_id,
                session_key,
                method,
                path,
                headers,
                body_b64,
            });
        }
        Err(e) => log::debug!("[relay] unrecognized message: {}", e),
    }
}
