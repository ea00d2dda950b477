//! `hub.*` - hub-facing accessors and action requests for Lua.
//!
//! Reads go through a snapshot the orchestrator refreshes each tick;
//! writes are queued as [`HubRequest`]s the orchestrator drains and
//! converts to actions. Lua never holds a reference into live hub state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use mlua::{Lua, LuaSerdeExt};

/// Actions Lua may request from the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubRequest {
    /// Close an agent (and delete its worktree).
    CloseAgent {
        /// Session key of the agent.
        session_key: String,
    },
    /// Post a user-visible notification through the server.
    Notify {
        /// Repository in `owner/name` form.
        repo: String,
        /// Issue number, when known.
        issue_number: Option<u32>,
        /// Freeform notification type string.
        notification_type: String,
    },
}

/// Queued hub requests, drained by the orchestrator each tick.
pub type HubRequestQueue = Arc<Mutex<VecDeque<HubRequest>>>;

/// Fresh shared request queue.
#[must_use]
pub fn new_hub_queue() -> HubRequestQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Snapshot of hub state shared with Lua, refreshed by the orchestrator.
pub type SharedHubSnapshot = Arc<Mutex<serde_json::Value>>;

/// Register the `hub` table: `agents()`, `close_agent(key)`,
/// `notify(repo, issue, type)`.
pub fn register_hub(
    lua: &Lua,
    queue: HubRequestQueue,
    snapshot: SharedHubSnapshot,
) -> Result<()> {
    let table = lua.create_table()?;

    let agents_snapshot = Arc::clone(&snapshot);
    table.set(
        "agents",
        lua.create_function(move |lua, ()| {
            let snapshot = agents_snapshot.lock().unwrap();
            lua.to_value(&*snapshot)
        })?,
    )?;

    let close_queue = Arc::clone(&queue);
    table.set(
        "close_agent",
        lua.create_function(move |_, session_key: String| {
            close_queue
                .lock()
                .unwrap()
                .push_back(HubRequest::CloseAgent { session_key });
            Ok(())
        })?,
    )?;

    let notify_queue = Arc::clone(&queue);
    table.set(
        "notify",
        lua.create_function(
            move |_, (repo, issue_number, notification_type): (String, Option<u32>, String)| {
                notify_queue.lock().unwrap().push_back(HubRequest::Notify {
                    repo,
                    issue_number,
                    notification_type,
                });
                Ok(())
            },
        )?,
    )?;

    lua.globals().set("hub", table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_are_queued_in_order() {
        let lua = Lua::new();
        let queue = new_hub_queue();
        let snapshot: SharedHubSnapshot =
            Arc::new(Mutex::new(serde_json::json!([])));
        register_hub(&lua, Arc::clone(&queue), snapshot).unwrap();

        lua.load(
            r#"
            hub.notify("acme/demo", 42, "question_asked")
            hub.close_agent("acme-demo-42")
            "#,
        )
        .exec()
        .unwrap();

        let mut queued = queue.lock().unwrap();
        assert_eq!(
            queued.pop_front(),
            Some(HubRequest::Notify {
                repo: "acme/demo".into(),
                issue_number: Some(42),
                notification_type: "question_asked".into(),
            })
        );
        assert_eq!(
            queued.pop_front(),
            Some(HubRequest::CloseAgent {
                session_key: "acme-demo-42".into()
            })
        );
    }

    #[test]
    fn test_agents_reads_snapshot() {
        let lua = Lua::new();
        let queue = new_hub_queue();
        let snapshot: SharedHubSnapshot = Arc::new(Mutex::new(serde_json::json!([
            { "session_key": "acme-demo-42", "status": "running" }
        ])));
        register_hub(&lua, queue, snapshot).unwrap();

        let key: String = lua
            .load("return hub.agents()[1].session_key")
            .eval()
            .unwrap();
        assert_eq!(key, "acme-demo-42");
    }
}
