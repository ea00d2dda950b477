//! Hub - central orchestrator for agent management.
//!
//! The Hub owns all state and runs the event loop. Worker tasks (PTY
//! readers, the relay socket pump, the server pump, tunnel forwards)
//! communicate with it over channels; the orchestrator task is the sole
//! writer to [`HubState`], so no per-field locking is needed.
//!
//! ```text
//!            ┌──────────────────────┐
//!            │        Hub           │
//!            │  - owns all state    │
//!            │  - runs event loop   │
//!            └──────────┬───────────┘
//!                       │
//!        ┌──────────────┼──────────────┐
//!        ▼              ▼              ▼
//!      TUI         Server pump      Relay
//!   (renders)      (HTTP API)    (browser WS)
//! ```

pub mod actions;
pub mod server_comms;
pub mod state;

pub use actions::{dispatch, HubAction};
pub use state::{ConfirmAction, HubState, TuiMode};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::agent::{classify_notification, Agent, AgentStatus, SpawnConfig, StopReason};
use crate::config::Config;
use crate::constants::HEARTBEAT_INTERVAL;
use crate::device::Device;
use crate::lua::{HubRequest, LuaRuntime};
use crate::relay::connection::{OutboundMessage, RelayEvent};
use crate::relay::{self, BrowserRelay, View, WireFrame};
use crate::server::{
    AgentHeartbeatInfo, ApiClient, EventKind, HeartbeatPayload, NotificationKind, SessionKey,
    WorkItem,
};
use crate::tunnel::{TunnelMultiplexer, TunnelRequest, TunnelResponse};
use crate::worktree::{detect_current_repo, WorktreeManager};

use server_comms::PumpCommand;

/// Central orchestrator for the botster hub.
pub struct Hub {
    /// Agent table plus TUI surface state; single-writer (this task).
    pub state: HubState,
    /// Application configuration.
    pub config: Config,
    /// Stable identifier for this hub.
    pub hub_identifier: String,
    /// Device identity for pairing.
    pub device: Device,
    /// Browser relay (ratchets, replay buffers).
    pub relay: BrowserRelay,
    /// Reverse HTTP tunnel registry.
    pub tunnel: TunnelMultiplexer,
    /// Lua extension runtime.
    pub lua: LuaRuntime,
    /// Set when the event loop should exit.
    pub quit: bool,

    worktrees: WorktreeManager,
    repo_path: PathBuf,
    repo_name: String,

    runtime: tokio::runtime::Runtime,

    command_tx: Sender<PumpCommand>,
    command_rx_for_setup: Option<Receiver<PumpCommand>>,
    work_rx: Receiver<Vec<WorkItem>>,
    work_tx_for_setup: Option<Sender<Vec<WorkItem>>>,

    relay_event_tx: Sender<RelayEvent>,
    relay_rx: Receiver<RelayEvent>,
    outbound_tx: tokio::sync::mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx_for_setup: Option<tokio::sync::mpsc::UnboundedReceiver<OutboundMessage>>,

    tunnel_done_tx: Sender<(Option<String>, TunnelResponse)>,
    tunnel_done_rx: Receiver<(Option<String>, TunnelResponse)>,

    pump_handle: Option<std::thread::JoinHandle<()>>,
    last_heartbeat: Instant,
    relay_connected: bool,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("hub_identifier", &self.hub_identifier)
            .field("repo", &self.repo_name)
            .field("agents", &self.state.agent_count())
            .field("quit", &self.quit)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Build the hub: detect the repo, load identities, wire the channels.
    /// No network traffic until [`setup`](Self::setup).
    pub fn new(config: Config) -> Result<Self> {
        let (repo_path, repo_name) = detect_current_repo().map_err(|e| {
            anyhow::Error::new(crate::config::ConfigError::NotARepository).context(e.to_string())
        })?;

        let hub_identifier = Config::hub_identifier()?;
        let device = Device::load_or_create()?;
        let config_dir = Config::config_dir()?;
        let relay = BrowserRelay::new(&config_dir)?;
        let lua = LuaRuntime::new()?;
        let worktrees = WorktreeManager::new(config.worktree_base.clone());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;

        let (command_tx, command_rx) = mpsc::channel();
        let (work_tx, work_rx) = mpsc::channel();
        let (relay_event_tx, relay_rx) = mpsc::channel();
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let (tunnel_done_tx, tunnel_done_rx) = mpsc::channel();

        Ok(Self {
            state: HubState::new(24, 80),
            config,
            hub_identifier,
            device,
            relay,
            tunnel: TunnelMultiplexer::new(),
            lua,
            quit: false,
            worktrees,
            repo_path,
            repo_name,
            runtime,
            command_tx,
            command_rx_for_setup: Some(command_rx),
            work_rx,
            work_tx_for_setup: Some(work_tx),
            relay_event_tx,
            relay_rx,
            outbound_tx,
            outbound_rx_for_setup: Some(outbound_rx),
            tunnel_done_tx,
            tunnel_done_rx,
            pump_handle: None,
            last_heartbeat: Instant::now(),
            relay_connected: false,
        })
    }

    /// Repository this hub serves, `owner/name`.
    #[must_use]
    pub fn repo_name(&self) -> &str {
        &self.repo_name
    }

    /// Start the workers: server pump, relay socket, Lua tree. Registers
    /// the hub and publishes the PreKey bundle.
    pub fn setup(&mut self) {
        // Server pump thread.
        if let (Some(command_rx), Some(work_tx)) = (
            self.command_rx_for_setup.take(),
            self.work_tx_for_setup.take(),
        ) {
            match ApiClient::new(self.config.server_url.clone(), self.config.token.clone()) {
                Ok(client) => {
                    let cable_url = client.cable_url();
                    let token = client.token().to_string();

                    self.pump_handle = Some(server_comms::spawn_pump(
                        client,
                        self.hub_identifier.clone(),
                        self.config.poll_interval,
                        command_rx,
                        work_tx,
                    ));

                    // Relay socket task.
                    if let Some(outbound_rx) = self.outbound_rx_for_setup.take() {
                        let event_tx = self.relay_event_tx.clone();
                        let origin = self.config.server_url.clone();
                        let hub_identifier = self.hub_identifier.clone();
                        self.runtime.spawn(relay::connection::run(
                            cable_url,
                            origin,
                            token,
                            hub_identifier,
                            event_tx,
                            outbound_rx,
                        ));
                    }
                }
                Err(e) => {
                    log::error!("failed to build API client: {e}");
                    self.state.last_error = Some(format!("server client: {e}"));
                }
            }
        }

        self.pump(PumpCommand::Register(self.heartbeat_payload()));
        self.pump(PumpCommand::PublishBundle(self.relay.bundle()));
        self.write_connection_url();

        // Lua extension tree.
        if let Err(e) = self.lua.load_tree() {
            log::warn!("Lua tree failed to load: {e}");
        }
        if let Err(e) = self.lua.start_file_watching() {
            log::debug!("Lua file watching unavailable: {e}");
        }
        self.lua
            .emit_event("hub_started", &serde_json::json!({ "repo": self.repo_name }));
    }

    /// Persist the browser pairing URL for `get-connection-url`.
    pub fn write_connection_url(&self) {
        let url = relay::connection_url(
            &self.config.server_url,
            &self.hub_identifier,
            &self.relay.bundle_id(),
        );
        match Config::config_dir() {
            Ok(dir) => {
                if let Err(e) = relay::write_connection_url(&dir, &url) {
                    log::warn!("failed to persist connection URL: {e}");
                }
            }
            Err(e) => log::warn!("no config dir for connection URL: {e}"),
        }
    }

    /// The current pairing URL.
    #[must_use]
    pub fn connection_url(&self) -> String {
        relay::connection_url(
            &self.config.server_url,
            &self.hub_identifier,
            &self.relay.bundle_id(),
        )
    }

    /// One orchestrator tick: drain every input category, drive agent
    /// lifecycles, fan out terminal output, run periodic work.
    pub fn tick(&mut self) {
        self.process_work_items();
        self.process_relay_events();
        self.process_tunnel_responses();
        self.tick_agents();
        self.broadcast_terminal_output();
        self.tick_lua();

        if self.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            self.heartbeat_now();
        }

        if self.relay.needs_republish() {
            match self.relay.refill_bundle() {
                Ok(bundle) => self.pump(PumpCommand::PublishBundle(bundle)),
                Err(e) => log::warn!("prekey refill failed: {e}"),
            }
        }
    }

    /// Graceful shutdown: stop agents, deregister, stop workers.
    pub fn shutdown(&mut self) {
        log::info!("hub shutting down");
        let keys = self.state.keys();
        for key in keys {
            if let Some(mut agent) = self.state.remove_agent(&key) {
                self.tunnel.unregister(&key);
                agent.stop(&self.worktrees, &self.repo_path, StopReason::Killed);
            }
        }

        self.pump(PumpCommand::Shutdown);
        if let Some(handle) = self.pump_handle.take() {
            let _ = handle.join();
        }
        self.lua
            .emit_event("hub_stopped", &serde_json::json!({ "repo": self.repo_name }));
    }

    // =====================================================================
    // Work items
    // =====================================================================

    fn process_work_items(&mut self) {
        let batches: Vec<Vec<WorkItem>> = std::iter::from_fn(|| self.work_rx.try_recv().ok()).collect();
        for item in batches.into_iter().flatten() {
            self.route_work_item(item);
        }
    }

    fn route_work_item(&mut self, item: WorkItem) {
        let message_id = item.message_id;
        match item.event_kind {
            EventKind::SpawnAgent => {
                dispatch(self, HubAction::SpawnAgent(Box::new(item)));
            }
            EventKind::CloseAgent => {
                let key = item.session_key();
                dispatch(self, HubAction::CloseAgent { session_key: key });
            }
            EventKind::BrowserOffer => {
                // SDP offers ride the encrypted relay back to the browser;
                // the payload is opaque to the hub.
                log::info!("browser offer received (message {message_id})");
                self.lua.emit_event("browser_offer", &item.payload);
            }
            EventKind::NotificationHint => {
                let key = item.session_key();
                if let Some(agent) = self.state.agent_mut(&key) {
                    let text = format!("\n=== NEW MENTION ===\n{}\n===================\n", item.prompt);
                    let _ = agent.write_input(View::Main, text.as_bytes());
                } else {
                    log::info!("notification hint for unknown agent {key}");
                }
            }
        }
        // Every routed message is acked: spawns are idempotent by session
        // key, so server-side re-delivery is harmless.
        self.pump(PumpCommand::Ack(message_id));
    }

    /// Spawn an agent for a work item. No-op when the session key is
    /// already live; surfaces `MaxSessionsReached` past the limit.
    pub(crate) fn spawn_from_item(&mut self, item: &WorkItem) {
        let key = item.session_key();

        if self.state.has_agent(&key) {
            log::info!("agent {key} already live, ignoring duplicate spawn");
            return;
        }

        if self.state.agent_count() >= self.config.max_sessions {
            log::warn!(
                "max sessions ({}) reached, refusing spawn for {key}",
                self.config.max_sessions
            );
            self.pump(PumpCommand::Notify {
                repo: item.repo.clone(),
                issue_number: item.issue_number,
                invocation_url: item.invocation_url.clone(),
                kind: NotificationKind::Osc9("max_sessions_reached".to_string()),
            });
            return;
        }

        let mut agent = Agent::new(
            key.clone(),
            item.repo.clone(),
            item.issue_number,
            item.branch_name.clone(),
        );

        let spawn_cfg = SpawnConfig {
            repo: item.repo.clone(),
            repo_path: self.repo_path.clone(),
            issue_number: item.issue_number,
            branch_name: item.branch_name.clone(),
            prompt: item.prompt.clone(),
            invocation_url: item.invocation_url.clone(),
            init_command: self.config.agent_command.clone(),
            server_command: self.config.server_command.clone(),
            rows: self.state.rows,
            cols: self.state.cols,
        };

        if let Err(e) = agent.start(&self.worktrees, &spawn_cfg) {
            log::error!("spawn of {key} failed: {e}");
            self.state.last_error = Some(format!("spawn {key}: {e}"));
            // A worktree created before the failure must not leak.
            agent.stop(
                &self.worktrees,
                &self.repo_path,
                StopReason::Failed(e.to_string()),
            );
            self.pump(PumpCommand::Notify {
                repo: item.repo.clone(),
                issue_number: item.issue_number,
                invocation_url: item.invocation_url.clone(),
                kind: NotificationKind::Osc9(format!("spawn_failed: {e}")),
            });
            return;
        }

        if let Some(server_command) = spawn_cfg.server_command.as_deref() {
            match self.tunnel.allocate_port() {
                Some(port) => {
                    if let Err(e) =
                        agent.start_server(server_command, port, self.state.rows, self.state.cols)
                    {
                        log::warn!("server PTY for {key} failed: {e}");
                    } else {
                        self.tunnel.register(key.clone(), port);
                    }
                }
                None => log::warn!("no free tunnel port for {key}"),
            }
        }

        log::info!("agent {key} spawned at {}", agent.worktree_path.display());
        self.lua.emit_event(
            "agent_started",
            &serde_json::json!({
                "session_key": key.to_string(),
                "repo": item.repo,
                "issue_number": item.issue_number,
                "branch_name": item.branch_name,
            }),
        );

        self.state.insert_agent(agent);
        self.heartbeat_now();
        self.broadcast_agent_list();
    }

    /// Manual spawn from the worktree picker: a branch-based work item for
    /// the hub's own repo, no server message behind it.
    pub(crate) fn spawn_on_branch(&mut self, branch: &str) {
        let item = WorkItem {
            message_id: 0,
            event_kind: EventKind::SpawnAgent,
            repo: self.repo_name.clone(),
            issue_number: None,
            branch_name: branch.to_string(),
            prompt: String::new(),
            invocation_url: None,
            installation_id: None,
            payload: serde_json::Value::Null,
        };
        self.spawn_from_item(&item);
    }

    /// Stop and remove an agent (close action).
    pub(crate) fn close_agent(&mut self, key: &SessionKey) {
        let Some(mut agent) = self.state.remove_agent(key) else {
            log::info!("close for unknown agent {key}");
            return;
        };
        self.tunnel.unregister(key);
        agent.stop(&self.worktrees, &self.repo_path, StopReason::Killed);

        self.lua.emit_event(
            "agent_closed",
            &serde_json::json!({ "session_key": key.to_string() }),
        );
        self.heartbeat_now();
        self.broadcast_agent_list();
    }

    /// Fail and remove an agent, notifying the user.
    pub(crate) fn fail_agent(&mut self, key: &SessionKey, reason: &str) {
        let Some(mut agent) = self.state.remove_agent(key) else {
            return;
        };
        self.tunnel.unregister(key);
        let repo = agent.repo.clone();
        let issue_number = agent.issue_number;
        let invocation_url = agent.last_invocation_url.clone();
        agent.stop(
            &self.worktrees,
            &self.repo_path,
            StopReason::Failed(reason.to_string()),
        );

        self.state.last_error = Some(format!("{key}: {reason}"));
        self.pump(PumpCommand::Notify {
            repo,
            issue_number,
            invocation_url,
            kind: NotificationKind::Osc9(format!("agent_failed: {reason}")),
        });
        self.heartbeat_now();
        self.broadcast_agent_list();
    }

    // =====================================================================
    // Agent lifecycle ticks
    // =====================================================================

    fn tick_agents(&mut self) {
        let mut ended: Vec<(SessionKey, AgentStatus)> = Vec::new();
        let mut became_running = false;

        for agent in self.state.agents_mut() {
            if let Some(status) = agent.tick_status() {
                match &status {
                    AgentStatus::Running => became_running = true,
                    status if status.is_terminal() => {
                        ended.push((agent.session_key.clone(), status.clone()));
                    }
                    _ => {}
                }
            }
        }

        self.forward_notifications();

        // Terminal agents leave the table in the same tick.
        for (key, status) in ended {
            log::info!("agent {key} ended: {status}");
            match status {
                AgentStatus::Failed(reason) => self.fail_agent(&key, &reason),
                _ => {
                    if let Some(mut agent) = self.state.remove_agent(&key) {
                        self.tunnel.unregister(&key);
                        let reason = match status {
                            AgentStatus::Killed => StopReason::Killed,
                            _ => StopReason::Completed,
                        };
                        agent.stop(&self.worktrees, &self.repo_path, reason);
                    }
                    self.lua.emit_event(
                        "agent_closed",
                        &serde_json::json!({ "session_key": key.to_string() }),
                    );
                    self.heartbeat_now();
                    self.broadcast_agent_list();
                }
            }
        }

        if became_running {
            self.heartbeat_now();
        }
    }

    /// Drain detected OSC notifications, classify, run the Lua hook, and
    /// post survivors to the server.
    fn forward_notifications(&mut self) {
        let mut outgoing = Vec::new();

        for agent in self.state.agents() {
            for notification in agent.poll_notifications() {
                let kind = classify_notification(&notification, &self.config.question_patterns);
                outgoing.push((
                    agent.repo.clone(),
                    agent.issue_number,
                    agent.last_invocation_url.clone(),
                    agent.session_key.clone(),
                    kind,
                ));
            }
        }

        for (repo, issue_number, invocation_url, session_key, kind) in outgoing {
            let payload = serde_json::json!({
                "session_key": session_key.to_string(),
                "repo": repo,
                "notification_type": kind.as_wire(),
            });
            // Hook chain may transform or drop the notification.
            let Some(passed) = self.lua.run_hook("notification", &payload) else {
                log::debug!("notification for {session_key} dropped by hook");
                continue;
            };
            let kind = passed
                .get("notification_type")
                .and_then(|t| t.as_str())
                .map(parse_notification_kind)
                .unwrap_or(kind);

            self.pump(PumpCommand::Notify {
                repo,
                issue_number,
                invocation_url,
                kind,
            });
        }
    }

    // =====================================================================
    // Relay events
    // =====================================================================

    fn process_relay_events(&mut self) {
        let events: Vec<RelayEvent> = std::iter::from_fn(|| self.relay_rx.try_recv().ok()).collect();
        for event in events {
            match event {
                RelayEvent::Connected => {
                    self.relay_connected = true;
                    self.broadcast_agent_list();
                }
                RelayEvent::Disconnected => {
                    self.relay_connected = false;
                }
                RelayEvent::Envelope {
                    browser_id,
                    envelope,
                } => match self.relay.handle_envelope(&browser_id, &envelope) {
                    Ok(frame) => self.handle_browser_frame(&browser_id, frame),
                    Err(e) => log::warn!("envelope from {browser_id} failed: {e}"),
                },
                RelayEvent::HttpRequest {
                    request_id,
                    session_key,
                    method,
                    path,
                    headers,
                    body_b64,
                } => {
                    let request = TunnelRequest {
                        request_id,
                        session_key: SessionKey::from_raw(session_key),
                        method,
                        path,
                        headers,
                        body_b64,
                    };
                    self.spawn_tunnel_task(request, None);
                }
            }
        }
    }

    fn handle_browser_frame(&mut self, browser_id: &str, frame: WireFrame) {
        match frame {
            WireFrame::TerminalInput {
                agent,
                view,
                bytes_b64,
            } => match BASE64.decode(&bytes_b64) {
                Ok(bytes) => dispatch(
                    self,
                    HubAction::BrowserInput {
                        session_key: SessionKey::from_raw(agent),
                        view,
                        bytes,
                    },
                ),
                Err(e) => log::warn!("bad input encoding from {browser_id}: {e}"),
            },

            WireFrame::Resize { rows, cols } => {
                let subscription = self
                    .relay
                    .session_mut(browser_id)
                    .and_then(|s| s.subscribed_agent.clone());
                if let Some(key) = subscription {
                    if let Some(agent) = self.state.agent(&key) {
                        agent.resize(rows, cols);
                    }
                }
            }

            WireFrame::SelectAgent {
                agent,
                view,
                last_ack_seq,
                raw_mode,
            } => {
                let key = SessionKey::from_raw(agent);
                match self
                    .relay
                    .handle_subscribe(browser_id, key.clone(), view, last_ack_seq, raw_mode)
                {
                    Ok(outcome) => {
                        for envelope in outcome.replay {
                            self.send_to_browser(browser_id, envelope);
                        }
                        if outcome.needs_snapshot {
                            self.send_full_resync(browser_id, &key, view);
                        }
                    }
                    Err(e) => log::warn!("subscribe from {browser_id} failed: {e}"),
                }
            }

            WireFrame::Ack { seq } => self.relay.handle_ack(browser_id, seq),

            WireFrame::Ping => {
                if let Ok(envelope) = self.relay.encrypt_frame(browser_id, &WireFrame::Pong) {
                    self.send_to_browser(browser_id, envelope);
                }
            }

            WireFrame::HttpRequest {
                request_id,
                method,
                path,
                headers,
                body_b64,
            } => {
                let subscription = self
                    .relay
                    .session_mut(browser_id)
                    .and_then(|s| s.subscribed_agent.clone());
                let Some(session_key) = subscription else {
                    log::warn!("http request from {browser_id} without subscription");
                    return;
                };
                let request = TunnelRequest {
                    request_id,
                    session_key,
                    method,
                    path,
                    headers,
                    body_b64,
                };
                self.spawn_tunnel_task(request, Some(browser_id.to_string()));
            }

            // Hub-originated kinds arriving inbound are protocol noise.
            other => log::debug!("ignoring frame from {browser_id}: {other:?}"),
        }
    }

    /// Replay gap exceeded the buffer: send the directive plus a fresh
    /// screen snapshot.
    fn send_full_resync(&mut self, browser_id: &str, key: &SessionKey, view: View) {
        let directive = WireFrame::ResyncFull {
            agent: key.to_string(),
            view,
        };
        if let Ok(envelope) = self.relay.encrypt_frame(browser_id, &directive) {
            self.send_to_browser(browser_id, envelope);
        }

        let Some(agent) = self.state.agent(key) else {
            return;
        };
        let snapshot = agent.snapshot_ansi(view);
        let hash = agent.screen_hash(view);
        match self
            .relay
            .make_terminal_output(browser_id, key, view, hash, snapshot.as_bytes())
        {
            Ok(Some(envelope)) => self.send_to_browser(browser_id, envelope),
            Ok(None) => {}
            Err(e) => log::warn!("snapshot for {browser_id} failed: {e}"),
        }
    }

    fn send_to_browser(&self, browser_id: &str, envelope: crate::relay::RatchetEnvelope) {
        let _ = self.outbound_tx.send(OutboundMessage::Relay {
            browser_id: browser_id.to_string(),
            envelope,
        });
    }

    /// Push the current agent table to every connected browser.
    fn broadcast_agent_list(&mut self) {
        if !self.relay_connected {
            return;
        }
        let frame = WireFrame::AgentListUpdate {
            agents: self.state.summaries(),
        };
        for browser_id in self.relay.browser_ids() {
            match self.relay.encrypt_frame(&browser_id, &frame) {
                Ok(envelope) => self.send_to_browser(&browser_id, envelope),
                Err(e) => log::debug!("agent list to {browser_id} failed: {e}"),
            }
        }
    }

    /// Stream changed output to subscribed browsers, one drain per
    /// (agent, view) fanned out to all subscribers.
    fn broadcast_terminal_output(&mut self) {
        if !self.relay_connected {
            return;
        }
        let mut chunks: HashMap<(SessionKey, View), (u64, Vec<u8>)> = HashMap::new();

        let subscriptions: Vec<(String, SessionKey, View)> = {
            let mut subs = Vec::new();
            for browser_id in self.relay.browser_ids() {
                if let Some(session) = self.relay.session_mut(&browser_id) {
                    if let Some(key) = session.subscribed_agent.clone() {
                        subs.push((browser_id, key, session.subscribed_view));
                    }
                }
            }
            subs
        };

        for (browser_id, key, view) in subscriptions {
            let entry = chunks.entry((key.clone(), view)).or_insert_with(|| {
                match self.state.agent(&key) {
                    Some(agent) => (agent.screen_hash(view), agent.drain_raw(view)),
                    None => (0, Vec::new()),
                }
            });
            let (hash, bytes) = entry.clone();
            if bytes.is_empty() {
                continue;
            }
            match self
                .relay
                .make_terminal_output(&browser_id, &key, view, hash, &bytes)
            {
                Ok(Some(envelope)) => self.send_to_browser(&browser_id, envelope),
                Ok(None) => {}
                Err(e) => log::debug!("output to {browser_id} failed: {e}"),
            }
        }
    }

    // =====================================================================
    // Tunnel
    // =====================================================================

    fn spawn_tunnel_task(&self, request: TunnelRequest, reply_browser: Option<String>) {
        let tunnel = self.tunnel.clone();
        let done_tx = self.tunnel_done_tx.clone();
        let outbound_tx = self.outbound_tx.clone();

        self.runtime.spawn(async move {
            let response = tunnel.handle_request(request).await;
            match reply_browser {
                // Encrypted responses go back through the orchestrator so
                // the ratchet stays single-writer.
                Some(browser_id) => {
                    let _ = done_tx.send((Some(browser_id), response));
                }
                None => {
                    let _ = outbound_tx.send(OutboundMessage::HttpResponse {
                        request_id: response.request_id,
                        status: response.status,
                        status_text: response.status_text,
                        headers: response.headers,
                        body_b64: response.body_b64,
                    });
                }
            }
        });
    }

    fn process_tunnel_responses(&mut self) {
        let done: Vec<(Option<String>, TunnelResponse)> =
            std::iter::from_fn(|| self.tunnel_done_rx.try_recv().ok()).collect();
        for (browser_id, response) in done {
            let Some(browser_id) = browser_id else {
                continue;
            };
            let frame = WireFrame::HttpResponse {
                request_id: response.request_id,
                status: response.status,
                status_text: response.status_text,
                headers: response.headers,
                body_b64: response.body_b64,
            };
            match self.relay.encrypt_frame(&browser_id, &frame) {
                Ok(envelope) => self.send_to_browser(&browser_id, envelope),
                Err(e) => log::warn!("http response to {browser_id} failed: {e}"),
            }
        }
    }

    // =====================================================================
    // Lua
    // =====================================================================

    fn tick_lua(&mut self) {
        self.lua.pump();
        self.lua
            .update_hub_snapshot(serde_json::to_value(self.state.summaries()).unwrap_or_default());

        for request in self.lua.drain_hub_requests() {
            match request {
                HubRequest::CloseAgent { session_key } => dispatch(
                    self,
                    HubAction::CloseAgent {
                        session_key: SessionKey::from_raw(session_key),
                    },
                ),
                HubRequest::Notify {
                    repo,
                    issue_number,
                    notification_type,
                } => self.pump(PumpCommand::Notify {
                    repo,
                    issue_number,
                    invocation_url: None,
                    kind: parse_notification_kind(&notification_type),
                }),
            }
        }
    }

    // =====================================================================
    // Server pump helpers
    // =====================================================================

    fn pump(&self, command: PumpCommand) {
        if self.command_tx.send(command).is_err() {
            log::debug!("server pump gone, command dropped");
        }
    }

    pub(crate) fn set_polling(&self, enabled: bool) {
        self.pump(PumpCommand::SetPolling(enabled));
    }

    /// Send an immediate heartbeat with the current agent set.
    pub fn heartbeat_now(&mut self) {
        self.pump(PumpCommand::Heartbeat(self.heartbeat_payload()));
        self.last_heartbeat = Instant::now();
    }

    fn heartbeat_payload(&self) -> HeartbeatPayload {
        HeartbeatPayload {
            identifier: self.hub_identifier.clone(),
            repo: self.repo_name.clone(),
            agents: self
                .state
                .agents()
                .map(|agent| AgentHeartbeatInfo {
                    session_key: agent.session_key.clone(),
                    last_invocation_url: agent.last_invocation_url.clone(),
                })
                .collect(),
            device_id: self.device.device_id.clone(),
        }
    }

    /// Refresh the worktree picker's entries.
    pub(crate) fn refresh_available_worktrees(&mut self) {
        match self.worktrees.list(&self.repo_path) {
            Ok(list) => {
                let live: Vec<PathBuf> = self
                    .state
                    .agents()
                    .map(|a| a.worktree_path.clone())
                    .collect();
                self.state.available_worktrees = list
                    .into_iter()
                    .filter(|(path, _)| !live.contains(path))
                    .collect();
                self.state.picker_cursor = 0;
            }
            Err(e) => {
                log::warn!("worktree listing failed: {e}");
                self.state.available_worktrees.clear();
            }
        }
    }
}

/// Map a wire `notification_type` string back to a kind.
fn parse_notification_kind(raw: &str) -> NotificationKind {
    match raw {
        "bell" => NotificationKind::Bell,
        "question_asked" => NotificationKind::QuestionAsked,
        _ => {
            if let Some(rest) = raw.strip_prefix("osc777:") {
                let mut parts = rest.splitn(2, ':');
                NotificationKind::Osc777 {
                    title: parts.next().unwrap_or("").to_string(),
                    body: parts.next().unwrap_or("").to_string(),
                }
            } else {
                NotificationKind::Osc9(
                    raw.strip_prefix("osc9:").unwrap_or(raw).to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notification_kind() {
        assert_eq!(parse_notification_kind("bell"), NotificationKind::Bell);
        assert_eq!(
            parse_notification_kind("question_asked"),
            NotificationKind::QuestionAsked
        );
        assert_eq!(
            parse_notification_kind("osc9:done"),
            NotificationKind::Osc9("done".into())
        );
        assert_eq!(
            parse_notification_kind("osc777:T:B"),
            NotificationKind::Osc777 {
                title: "T".into(),
                body: "B".into()
            }
        );
        // Freeform strings fall back to the osc9 escape hatch.
        assert_eq!(
            parse_notification_kind("custom"),
            NotificationKind::Osc9("custom".into())
        );
    }
}
