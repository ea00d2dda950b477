//! `events.*` - hub event subscription for Lua.
//!
//! Scripts subscribe with `events.on(name, fn)`; the host emits events
//! (agent lifecycle, notifications, relay state) as JSON-converted tables.
//! Every callback for an event runs; errors are logged and skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use mlua::{Function, Lua, LuaSerdeExt, RegistryKey};

/// Registered callbacks per event name.
#[derive(Default)]
pub struct EventCallbacks {
    callbacks: HashMap<String, Vec<RegistryKey>>,
}

impl EventCallbacks {
    /// Total registered callbacks (diagnostics).
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.values().map(Vec::len).sum()
    }
}

/// Handle shared with the registered Lua functions.
pub type SharedEventCallbacks = Arc<Mutex<EventCallbacks>>;

/// Fresh shared callback store.
#[must_use]
pub fn new_event_callbacks() -> SharedEventCallbacks {
    Arc::new(Mutex::new(EventCallbacks::default()))
}

/// Register the `events` table: `on(name, fn)`.
pub fn register_events(lua: &Lua, callbacks: SharedEventCallbacks) -> Result<()> {
    let table = lua.create_table()?;

    let on_callbacks = Arc::clone(&callbacks);
    table.set(
        "on",
        lua.create_function(move |lua, (name, callback): (String, Function)| {
            let key = lua.create_registry_value(callback)?;
            on_callbacks
                .lock()
                .unwrap()
                .callbacks
                .entry(name)
                .or_default()
                .push(key);
            Ok(())
        })?,
    )?;

    lua.globals().set("events", table)?;
    Ok(())
}

/// Emit an event into Lua: every subscriber receives the JSON payload as a
/// table. Callback errors are logged and do not stop the fan-out.
pub fn emit(
    lua: &Lua,
    callbacks: &SharedEventCallbacks,
    name: &str,
    payload: &serde_json::Value,
) {
    let keys: Vec<RegistryKey> = {
        let mut store = callbacks.lock().unwrap();
        let Some(list) = store.callbacks.remove(name) else {
            return;
        };
        list
    };

    let value = match lua.to_value(payload) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("event {} payload conversion failed: {}", name, e);
            // Put the callbacks back before bailing.
            callbacks
                .lock()
                .unwrap()
                .callbacks
                .insert(name.to_string(), keys);
            return;
        }
    };

    for key in &keys {
        match lua.registry_value::<Function>(key) {
            Ok(callback) => {
                if let Err(e) = callback.call::<()>(value.clone()) {
                    log::warn!("event {} callback errored: {}", name, e);
                }
            }
            Err(e) => log::warn!("event {} lost a callback: {}", name, e),
        }
    }

    // Callbacks persist across emissions; subscribers added by a callback
    // during this emission are appended behind the existing ones.
    let mut store = callbacks.lock().unwrap();
    let entry = store.callbacks.entry(name.to_string()).or_default();
    let added_during_emit = std::mem::take(entry);
    *entry = keys;
    entry.extend(added_during_emit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let lua = Lua::new();
        let callbacks = new_event_callbacks();
        register_events(&lua, Arc::clone(&callbacks)).unwrap();

        lua.load(
            r#"
            seen = {}
            events.on("agent_started", function(e) seen[#seen+1] = e.session_key end)
            events.on("agent_started", function(e) seen[#seen+1] = "second" end)
            "#,
        )
        .exec()
        .unwrap();

        emit(
            &lua,
            &callbacks,
            "agent_started",
            &serde_json::json!({ "session_key": "acme-demo-42" }),
        );

        let seen: Vec<String> = lua
            .load("return seen")
            .eval::<mlua::Table>()
            .unwrap()
            .sequence_values()
            .collect::<mlua::Result<_>>()
            .unwrap();
        assert_eq!(seen, vec!["acme-demo-42", "second"]);
    }

    #[test]
    fn test_emit_survives_callback_error() {
        let lua = Lua::new();
        let callbacks = new_event_callbacks();
        register_events(&lua, Arc::clone(&callbacks)).unwrap();

        lua.load(
            r#"
            ok = false
            events.on("tick", function() error("broken subscriber") end)
            events.on("tick", function() ok = true end)
            "#,
        )
        .exec()
        .unwrap();

        emit(&lua, &callbacks, "tick", &serde_json::json!({}));
        let ok: bool = lua.globals().get("ok").unwrap();
        assert!(ok);

        // Subscribers survive for the next emission.
        emit(&lua, &callbacks, "tick", &serde_json::json!({}));
        assert_eq!(callbacks.lock().unwrap().callback_count(), 2);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let lua = Lua::new();
        let callbacks = new_event_callbacks();
        emit(&lua, &callbacks, "nobody", &serde_json::json!({}));
    }
}
