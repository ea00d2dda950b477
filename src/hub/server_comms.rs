//! Server communication pump.
//!
//! A dedicated worker thread owns the blocking [`ApiClient`] so the
//! orchestrator tick never waits on the network. The pump polls for work
//! items on its own cadence and executes queued commands (acks,
//! heartbeats, notifications) with retry; poll and heartbeat failures are
//! logged and retried with backoff, never surfaced.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use crate::server::{ApiClient, Backoff, HeartbeatPayload, NotificationKind, WorkItem};

/// Commands the orchestrator queues for the pump.
#[derive(Debug)]
pub enum PumpCommand {
    /// Ack a processed message (retried until it lands).
    Ack(u64),
    /// Register/upsert the hub (PUT).
    Register(HeartbeatPayload),
    /// Heartbeat with the current agent set (PATCH).
    Heartbeat(HeartbeatPayload),
    /// Post a user-visible notification.
    Notify {
        /// Repository in `owner/name` form.
        repo: String,
        /// Issue number, when known.
        issue_number: Option<u32>,
        /// Invocation URL, when known.
        invocation_url: Option<String>,
        /// Notification kind.
        kind: NotificationKind,
    },
    /// Publish (or republish) the PreKey bundle.
    PublishBundle(serde_json::Value),
    /// Enable or disable message polling.
    SetPolling(bool),
    /// Deregister and stop the pump.
    Shutdown,
}

/// Spawn the pump thread.
///
/// Polled work items arrive on the returned receiver; unparseable messages
/// are acked inside the pump so the server stops re-delivering them.
pub fn spawn_pump(
    client: ApiClient,
    hub_identifier: String,
    poll_interval: Duration,
    command_rx: Receiver<PumpCommand>,
    work_tx: Sender<Vec<WorkItem>>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("server-pump".to_string())
        .spawn(move || pump_loop(client, hub_identifier, poll_interval, command_rx, work_tx))
        .expect("spawn server pump thread")
}

fn pump_loop(
    client: ApiClient,
    hub_identifier: String,
    poll_interval: Duration,
    command_rx: Receiver<PumpCommand>,
    work_tx: Sender<Vec<WorkItem>>,
) {
    let mut polling = true;
    let mut poll_backoff = Backoff::new();
    let mut next_poll = Instant::now();
    let mut pending_acks: Vec<u64> = Vec::new();

    loop {
        // Execute queued commands first so acks and heartbeats are not
        // delayed behind a poll.
        loop {
            match command_rx.try_recv() {
                Ok(PumpCommand::Ack(message_id)) => pending_acks.push(message_id),
                Ok(PumpCommand::Register(payload)) => {
                    match client.register(&payload) {
                        Ok(response) => log::info!(
                            "hub registered (e2e_enabled={})",
                            response.e2e_enabled
                        ),
                        Err(e) => log::warn!("hub registration failed: {e}"),
                    }
                }
                Ok(PumpCommand::Heartbeat(payload)) => {
                    let _ = client.heartbeat(&hub_identifier, &payload);
                }
                Ok(PumpCommand::Notify {
                    repo,
                    issue_number,
                    invocation_url,
                    kind,
                }) => {
                    if let Err(e) =
                        client.notify(&repo, issue_number, invocation_url.as_deref(), &kind)
                    {
                        log::warn!("notification failed: {e}");
                    }
                }
                Ok(PumpCommand::PublishBundle(bundle)) => {
                    if let Err(e) = client.publish_prekey_bundle(&hub_identifier, &bundle) {
                        log::warn!("prekey bundle publish failed: {e}");
                    }
                }
                Ok(PumpCommand::SetPolling(enabled)) => {
                    polling = enabled;
                    log::info!("message polling {}", if enabled { "enabled" } else { "paused" });
                }
                Ok(PumpCommand::Shutdown) => {
                    if let Err(e) = client.deregister(&hub_identifier) {
                        log::warn!("deregister failed: {e}");
                    }
                    log::info!("server pump stopped");
                    return;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::info!("server pump channel closed");
                    return;
                }
            }
        }

        // Retry pending acks; unacked messages re-deliver server-side, and
        // spawn idempotency makes that harmless.
        pending_acks.retain(|message_id| match client.ack(&hub_identifier, *message_id) {
            Ok(()) => false,
            Err(e) => {
                log::warn!("ack of {message_id} failed, will retry: {e}");
                true
            }
        });

        if polling && Instant::now() >= next_poll {
            match client.poll(&hub_identifier) {
                Ok((items, unparseable)) => {
                    poll_backoff.reset();
                    next_poll = Instant::now() + poll_interval;
                    pending_acks.extend(unparseable);
                    if !items.is_empty() {
                        log::info!("polled {} work item(s)", items.len());
                        if work_tx.send(items).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let delay = poll_backoff.next_delay();
                    log::warn!("poll failed ({e}), backing off {delay:?}");
                    next_poll = Instant::now() + delay;
                }
            }
        }

        thread::sleep(Duration::from_millis(50));
    }
}
