//! API client for the control server.
//!
//! Blocking HTTP adapter used by the hub's server pump. Every request
//! carries `Authorization: Bearer <token>` and the shared 30 s deadline.

use anyhow::{Context, Result};
use reqwest::blocking::Client;

use super::types::{
    HeartbeatPayload, MessagesResponse, NotificationKind, NotificationPayload,
    RegisterResponse, WorkItem,
};
use crate::constants::{self, HTTP_REQUEST_TIMEOUT};

/// HTTP client for the control server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    server_url: String,
    token: String,
}

impl ApiClient {
    /// Creates a client for `server_url` authenticated with `token`.
    pub fn new(server_url: String, token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .user_agent(constants::user_agent())
            .build()?;
        Ok(Self {
            client,
            server_url,
            token,
        })
    }

    /// The configured server URL.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Polls pending work items: `GET /hubs/{id}/messages`.
    ///
    /// Unknown event kinds and malformed payloads are dropped here; callers
    /// still ack them so the server stops re-delivering.
    pub fn poll(&self, hub_identifier: &str) -> Result<(Vec<WorkItem>, Vec<u64>)> {
        let url = format!("{}/hubs/{}/messages", self.server_url, hub_identifier);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .context("poll request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("poll returned {}", response.status());
        }

        let body: MessagesResponse = response.json().context("invalid poll response")?;

        let mut items = Vec::new();
        let mut unparseable = Vec::new();
        for message in &body.messages {
            match WorkItem::from_message(message) {
                Some(item) => items.push(item),
                None => {
                    log::warn!(
                        "dropping message {} with event_type '{}'",
                        message.id,
                        message.event_type
                    );
                    unparseable.push(message.id);
                }
            }
        }
        Ok((items, unparseable))
    }

    /// Acknowledges a processed message: `PATCH /hubs/{id}/messages/{mid}`.
    pub fn ack(&self, hub_identifier: &str, message_id: u64) -> Result<()> {
        let url = format!(
            "{}/hubs/{}/messages/{}",
            self.server_url, hub_identifier, message_id
        );
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .send()?;

        if response.status().is_success() {
            log::debug!("acked message {}", message_id);
            Ok(())
        } else {
            anyhow::bail!("ack of message {} returned {}", message_id, response.status())
        }
    }

    /// Registers (upserts) the hub: `PUT /api/hubs`.
    pub fn register(&self, payload: &HeartbeatPayload) -> Result<RegisterResponse> {
        let url = format!("{}/api/hubs", self.server_url);
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .context("register request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("register returned {}", response.status());
        }
        response.json().context("invalid register response")
    }

    /// Heartbeat with the minimal payload: `PATCH /hubs/{id}/heartbeat`.
    ///
    /// Returns `Ok(false)` on server-side failure so the caller can back
    /// off without treating it as fatal.
    pub fn heartbeat(&self, hub_identifier: &str, payload: &HeartbeatPayload) -> Result<bool> {
        let url = format!("{}/hubs/{}/heartbeat", self.server_url, hub_identifier);
        match self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
        {
            Ok(response) if response.status().is_success() => {
                log::debug!("heartbeat ok ({} agents)", payload.agents.len());
                Ok(true)
            }
            Ok(response) => {
                log::warn!("heartbeat failed: {}", response.status());
                Ok(false)
            }
            Err(e) => {
                log::warn!("heartbeat send failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Graceful shutdown: `DELETE /api/hubs/{id}`. Idempotent server-side.
    pub fn deregister(&self, hub_identifier: &str) -> Result<()> {
        let url = format!("{}/api/hubs/{}", self.server_url, hub_identifier);
        let response = self.client.delete(&url).bearer_auth(&self.token).send()?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            anyhow::bail!("deregister returned {}", response.status())
        }
    }

    /// Asks the server to post a user-visible comment:
    /// `POST /api/agent_notifications`.
    pub fn notify(
        &self,
        repo: &str,
        issue_number: Option<u32>,
        invocation_url: Option<&str>,
        kind: &NotificationKind,
    ) -> Result<()> {
        let url = format!("{}/api/agent_notifications", self.server_url);
        let payload = NotificationPayload {
            repo: repo.to_string(),
            issue_number,
            invocation_url: invocation_url.map(String::from),
            notification_type: kind.as_wire(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()?;

        if response.status().is_success() {
            log::info!(
                "sent notification: repo={}, issue={:?}, type={}",
                repo,
                issue_number,
                payload.notification_type
            );
            Ok(())
        } else {
            anyhow::bail!("notification returned {}", response.status())
        }
    }

    /// Publishes the hub's PreKey bundle for browsers to fetch:
    /// `POST /hubs/{id}/prekey_bundle`.
    pub fn publish_prekey_bundle(
        &self,
        hub_identifier: &str,
        bundle: &serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}/hubs/{}/prekey_bundle", self.server_url, hub_identifier);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(bundle)
            .send()?;

        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!("prekey bundle publish returned {}", response.status())
        }
    }

    /// Fetches a browser's published identity bundle:
    /// `GET /hubs/{id}/browsers/{browser_id}/prekey_bundle`.
    pub fn fetch_prekey_bundle(
        &self,
        hub_identifier: &str,
        browser_id: &str,
    ) -> Result<serde_json::Value> {
        let url = format!(
            "{}/hubs/{}/browsers/{}/prekey_bundle",
            self.server_url, hub_identifier, browser_id
        );
        let response = self.client.get(&url).bearer_auth(&self.token).send()?;
        if !response.status().is_success() {
            anyhow::bail!("prekey bundle fetch returned {}", response.status());
        }
        response.json().context("invalid prekey bundle response")
    }

    /// WebSocket URL for the relay channel (`/cable`), with the token as a
    /// query fallback for proxies that strip Authorization on upgrade.
    #[must_use]
    pub fn cable_url(&self) -> String {
        format!(
            "{}/cable?token={}",
            self.server_url
                .replace("https://", "wss://")
                .replace("http://", "ws://"),
            self.token
        )
    }

    /// Bearer token, needed by the relay connection's upgrade request.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}
