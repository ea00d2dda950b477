//! Named hook chains for Lua extensions.
//!
//! Scripts register callbacks on named events with a priority and an
//! enabled flag. Running a chain threads a single value through every
//! enabled hook in priority order (descending): each hook may transform
//! the value, error (logged, previous value preserved), or return nil to
//! drop - which stops the chain and yields nil to the caller.

use std::collections::HashMap;

use anyhow::Result;
use mlua::{Function, Lua, RegistryKey, Value};

/// One registered hook.
struct HookEntry {
    name: String,
    priority: i64,
    enabled: bool,
    callback: RegistryKey,
}

impl std::fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEntry")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Hook chains keyed by event name.
#[derive(Default, Debug)]
pub struct HookRegistry {
    chains: HashMap<String, Vec<HookEntry>>,
}

impl HookRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a hook on `event`.
    pub fn add(
        &mut self,
        lua: &Lua,
        event: &str,
        name: &str,
        callback: Function,
        priority: i64,
        enabled: bool,
    ) -> Result<()> {
        let key = lua.create_registry_value(callback)?;
        let chain = self.chains.entry(event.to_string()).or_default();

        // Re-registering under the same name replaces the old hook.
        chain.retain(|h| h.name != name);
        chain.push(HookEntry {
            name: name.to_string(),
            priority,
            enabled,
            callback: key,
        });
        chain.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    /// Remove a hook by name. Returns whether it existed.
    pub fn remove(&mut self, event: &str, name: &str) -> bool {
        let Some(chain) = self.chains.get_mut(event) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|h| h.name != name);
        chain.len() != before
    }

    /// Enable or disable a hook without removing it.
    pub fn set_enabled(&mut self, event: &str, name: &str, enabled: bool) -> bool {
        let Some(chain) = self.chains.get_mut(event) else {
            return false;
        };
        match chain.iter_mut().find(|h| h.name == name) {
            Some(hook) => {
                hook.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Number of hooks registered on `event`.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.chains.get(event).map_or(0, Vec::len)
    }

    /// Run the chain for `event`, threading `initial` through it.
    ///
    /// Returns `None` when a hook dropped the value (returned nil);
    /// otherwise the final transformed value.
    pub fn run_chain(&self, lua: &Lua, event: &str, initial: Value) -> Option<Value> {
        let Some(chain) = self.chains.get(event) else {
            return Some(initial);
        };

        let mut value = initial;
        for hook in chain.iter().filter(|h| h.enabled) {
            let callback: Function = match lua.registry_value(&hook.callback) {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("hook {}:{} lost its callback: {}", event, hook.name, e);
                    continue;
                }
            };

            match callback.call::<Value>(value.clone()) {
                Ok(Value::Nil) => {
                    log::debug!("hook {}:{} dropped the event", event, hook.name);
                    return None;
                }
                Ok(next) => value = next,
                Err(e) => {
                    // Errors preserve the previous value and the chain
                    // continues.
                    log::warn!("hook {}:{} errored: {}", event, hook.name, e);
                }
            }
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_fn(lua: &Lua, src: &str) -> Function {
        lua.load(src).eval().unwrap()
    }

    #[test]
    fn test_chain_threads_value_in_priority_order() {
        let lua = Lua::new();
        let mut hooks = HookRegistry::new();

        hooks
            .add(
                &lua,
                "message",
                "suffix",
                lua_fn(&lua, "return function(v) return v .. '-low' end"),
                1,
                true,
            )
            .unwrap();
        hooks
            .add(
                &lua,
                "message",
                "prefix",
                lua_fn(&lua, "return function(v) return 'high-' .. v end"),
                10,
                true,
            )
            .unwrap();

        let result = hooks
            .run_chain(&lua, "message", Value::String(lua.create_string("x").unwrap()))
            .unwrap();
        // Priority 10 runs before priority 1.
        assert_eq!(result.as_str().as_deref(), Some("high-x-low"));
    }

    #[test]
    fn test_nil_return_drops_and_stops_chain() {
        let lua = Lua::new();
        let mut hooks = HookRegistry::new();

        hooks
            .add(&lua, "e", "dropper", lua_fn(&lua, "return function(v) return nil end"), 5, true)
            .unwrap();
        hooks
            .add(
                &lua,
                "e",
                "never-runs",
                lua_fn(&lua, "return function(v) error('should not run') end"),
                1,
                true,
            )
            .unwrap();

        let result = hooks.run_chain(&lua, "e", Value::Integer(1));
        assert!(result.is_none());
    }

    #[test]
    fn test_error_preserves_previous_value() {
        let lua = Lua::new();
        let mut hooks = HookRegistry::new();

        hooks
            .add(
                &lua,
                "e",
                "boom",
                lua_fn(&lua, "return function(v) error('kaput') end"),
                10,
                true,
            )
            .unwrap();
        hooks
            .add(
                &lua,
                "e",
                "double",
                lua_fn(&lua, "return function(v) return v * 2 end"),
                1,
                true,
            )
            .unwrap();

        let result = hooks.run_chain(&lua, "e", Value::Integer(21)).unwrap();
        assert_eq!(result.as_i64(), Some(42));
    }

    #[test]
    fn test_disabled_hooks_are_skipped() {
        let lua = Lua::new();
        let mut hooks = HookRegistry::new();

        hooks
            .add(
                &lua,
                "e",
                "off",
                lua_fn(&lua, "return function(v) return v + 100 end"),
                5,
                false,
            )
            .unwrap();

        let result = hooks.run_chain(&lua, "e", Value::Integer(1)).unwrap();
        assert_eq!(result.as_i64(), Some(1));

        assert!(hooks.set_enabled("e", "off", true));
        let result = hooks.run_chain(&lua, "e", Value::Integer(1)).unwrap();
        assert_eq!(result.as_i64(), Some(101));
    }

    #[test]
    fn test_reregistration_replaces() {
        let lua = Lua::new();
        let mut hooks = HookRegistry::new();

        hooks
            .add(&lua, "e", "h", lua_fn(&lua, "return function(v) return 'old' end"), 1, true)
            .unwrap();
        hooks
            .add(&lua, "e", "h", lua_fn(&lua, "return function(v) return 'new' end"), 1, true)
            .unwrap();

        assert_eq!(hooks.count("e"), 1);
        let result = hooks.run_chain(&lua, "e", Value::Nil).unwrap();
        assert_eq!(result.as_str().as_deref(), Some("new"));
    }

    #[test]
    fn test_remove() {
        let lua = Lua::new();
        let mut hooks = HookRegistry::new();
        hooks
            .add(&lua, "e", "h", lua_fn(&lua, "return function(v) return v end"), 1, true)
            .unwrap();
        assert!(hooks.remove("e", "h"));
        assert!(!hooks.remove("e", "h"));
        assert_eq!(hooks.count("e"), 0);
    }

    #[test]
    fn test_chain_for_unknown_event_passes_value_through() {
        let lua = Lua::new();
        let hooks = HookRegistry::new();
        let result = hooks.run_chain(&lua, "nobody", Value::Integer(7)).unwrap();
        assert_eq!(result.as_i64(), Some(7));
    }
}
