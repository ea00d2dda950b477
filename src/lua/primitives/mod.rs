//! Curated host API exposed to Lua.
//!
//! The sandbox is narrow: logging, one-shot timers, directory watches,
//! filesystem predicates, JSON, event subscription, and a small set of
//! hub-facing accessors and request queues. Lua cannot spawn processes or
//! open sockets - those globals are removed at startup.

pub mod events;
pub mod fs;
pub mod hub;
pub mod json;
pub mod log;
pub mod timer;
pub mod watch;

pub use events::{emit as emit_event, new_event_callbacks, register_events, SharedEventCallbacks};
pub use hub::{new_hub_queue, register_hub, HubRequest, HubRequestQueue, SharedHubSnapshot};
pub use timer::{new_timer_queue, poll_due as poll_due_timers, register_timer, SharedTimerQueue};
pub use watch::{new_watch_queue, register_watch, WatchRequestQueue};

use anyhow::{Context, Result};
use mlua::Lua;

/// Register the always-available primitives: `log`, `fs`, `json`.
pub fn register_base(lua: &Lua) -> Result<()> {
    log::register(lua).context("register log primitives")?;
    fs::register(lua).context("register fs primitives")?;
    json::register(lua).context("register json primitives")?;
    Ok(())
}

/// Strip the escape hatches from the standard library.
///
/// The host API is the only way scripts touch processes or the network.
pub fn apply_sandbox(lua: &Lua) -> Result<()> {
    lua.load(
        r#"
        os.execute = nil
        os.exit = nil
        io.popen = nil
        package.loadlib = nil
        "#,
    )
    .exec()
    .context("apply sandbox")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_removes_process_escapes() {
        let lua = Lua::new();
        apply_sandbox(&lua).unwrap();

        let check: bool = lua
            .load("return os.execute == nil and io.popen == nil and package.loadlib == nil")
            .eval()
            .unwrap();
        assert!(check);
    }

    #[test]
    fn test_base_primitives_register() {
        let lua = Lua::new();
        register_base(&lua).unwrap();
        let check: bool = lua
            .load("return type(log.info) == 'function' and type(fs.exists) == 'function' and type(json.encode) == 'function'")
            .eval()
            .unwrap();
        assert!(check);
    }
}
