//! Lua runtime management.
//!
//! Owns the interpreter, the hook registry, the process-lifetime state
//! registry, and the hot-reload machinery. Module classes follow the
//! layout convention: `core.*` is protected (loaded once, never reloaded),
//! `lib.*` and `handlers.*` hot-reload on change, and `plugins.<name>.*`
//! load and unload with their directories.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use mlua::{Function, Lua, LuaSerdeExt, Table, Value};

use super::hooks::HookRegistry;
use super::primitives::{
    self, HubRequest, HubRequestQueue, SharedEventCallbacks, SharedHubSnapshot,
    SharedTimerQueue, WatchRequestQueue,
};
use super::watcher::{LuaFileWatcher, WatchEvent};

/// Module whose reload requires the watcher to reinstall its own watches.
const WATCHER_MODULE: &str = "lib.watcher";

/// Lua scripting runtime for the hub.
///
/// # Environment
///
/// - `BOTSTER_LUA_PATH` - override the script tree (default `~/.botster/lua`)
/// - `BOTSTER_LUA_STRICT` - if `1`, script errors propagate instead of
///   being logged
pub struct LuaRuntime {
    lua: Lua,
    base_path: PathBuf,
    strict: bool,
    watcher: Option<LuaFileWatcher>,
    hooks: Arc<Mutex<HookRegistry>>,
    timers: SharedTimerQueue,
    events: SharedEventCallbacks,
    hub_requests: HubRequestQueue,
    hub_snapshot: SharedHubSnapshot,
    watch_requests: WatchRequestQueue,
    loaded_plugins: HashSet<String>,
}

impl std::fmt::Debug for LuaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaRuntime")
            .field("base_path", &self.base_path)
            .field("strict", &self.strict)
            .field("watching", &self.watcher.is_some())
            .field("plugins", &self.loaded_plugins)
            .finish_non_exhaustive()
    }
}

impl LuaRuntime {
    /// Create a runtime with every primitive registered and the sandbox
    /// applied.
    pub fn new() -> Result<Self> {
        let lua = Lua::new();

        let base_path = Self::resolve_base_path();
        let strict = std::env::var("BOTSTER_LUA_STRICT")
            .map(|v| v == "1")
            .unwrap_or(false);

        let timers = primitives::new_timer_queue();
        let events = primitives::new_event_callbacks();
        let hub_requests = primitives::new_hub_queue();
        let watch_requests = primitives::new_watch_queue();
        let hub_snapshot: SharedHubSnapshot =
            Arc::new(Mutex::new(serde_json::Value::Array(Vec::new())));

        primitives::register_base(&lua)?;
        primitives::register_timer(&lua, Arc::clone(&timers))?;
        primitives::register_events(&lua, Arc::clone(&events))?;
        primitives::register_watch(&lua, Arc::clone(&watch_requests))?;
        primitives::register_hub(&lua, Arc::clone(&hub_requests), Arc::clone(&hub_snapshot))?;
        primitives::apply_sandbox(&lua)?;

        let hooks = Arc::new(Mutex::new(HookRegistry::new()));
        Self::register_hooks_table(&lua, Arc::clone(&hooks))?;
        Self::register_state_registry(&lua)?;
        Self::setup_package_path(&lua, &base_path)?;

        log::debug!(
            "Lua runtime created (base_path={}, strict={})",
            base_path.display(),
            strict
        );

        Ok(Self {
            lua,
            base_path,
            strict,
            watcher: None,
            hooks,
            timers,
            events,
            hub_requests,
            hub_snapshot,
            watch_requests,
            loaded_plugins: HashSet::new(),
        })
    }

    /// `hooks` global: `add(event, name, fn, {priority, enabled})`,
    /// `remove`, `set_enabled`, `run(event, value)`.
    fn register_hooks_table(lua: &Lua, hooks: Arc<Mutex<HookRegistry>>) -> Result<()> {
        let table = lua.create_table()?;

        let add_hooks = Arc::clone(&hooks);
        table.set(
            "add",
            lua.create_function(
                move |lua,
                      (event, name, callback, opts): (
                    String,
                    String,
                    Function,
                    Option<Table>,
                )| {
                    let (priority, enabled) = match opts {
                        Some(opts) => (
                            opts.get::<Option<i64>>("priority")?.unwrap_or(0),
                            opts.get::<Option<bool>>("enabled")?.unwrap_or(true),
                        ),
                        None => (0, true),
                    };
                    add_hooks
                        .lock()
                        .unwrap()
                        .add(lua, &event, &name, callback, priority, enabled)
                        .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                    Ok(())
                },
            )?,
        )?;

        let remove_hooks = Arc::clone(&hooks);
        table.set(
            "remove",
            lua.create_function(move |_, (event, name): (String, String)| {
                Ok(remove_hooks.lock().unwrap().remove(&event, &name))
            })?,
        )?;

        let enable_hooks = Arc::clone(&hooks);
        table.set(
            "set_enabled",
            lua.create_function(
                move |_, (event, name, enabled): (String, String, bool)| {
                    Ok(enable_hooks.lock().unwrap().set_enabled(&event, &name, enabled))
                },
            )?,
        )?;

        let run_hooks = Arc::clone(&hooks);
        table.set(
            "run",
            lua.create_function(move |lua, (event, value): (String, Value)| {
                Ok(run_hooks
                    .lock()
                    .unwrap()
                    .run_chain(lua, &event, value)
                    .unwrap_or(Value::Nil))
            })?,
        )?;

        lua.globals().set("hooks", table)?;
        Ok(())
    }

    /// `state` global backed by a process-lifetime registry table.
    ///
    /// `state.get(key)` returns the same table across reloads;
    /// `state.class(key, methods)` preserves table identity while
    /// replacing its contents, so held references survive a reload with
    /// fresh methods.
    fn register_state_registry(lua: &Lua) -> Result<()> {
        lua.load(
            r#"
            local registry = {}
            state = {}
            function state.get(key)
                local t = registry[key]
                if t == nil then
                    t = {}
                    registry[key] = t
                end
                return t
            end
            function state.class(key, methods)
                local t = state.get(key)
                if methods ~= nil then
                    for k in pairs(t) do t[k] = nil end
                    for k, v in pairs(methods) do t[k] = v end
                end
                return t
            end
            "#,
        )
        .exec()
        .context("register state registry")?;
        Ok(())
    }

    /// Add the module layout to `package.path` so `require("lib.x")`
    /// resolves under the base tree.
    fn setup_package_path(lua: &Lua, base_path: &Path) -> Result<()> {
        let package: Table = lua
            .globals()
            .get("package")
            .map_err(|e| anyhow!("failed to get package table: {e}"))?;
        let current: String = package
            .get("path")
            .map_err(|e| anyhow!("failed to get package.path: {e}"))?;

        let new_path = format!(
            "{path}/?.lua;{path}/?/init.lua;{current}",
            path = base_path.display(),
            current = current
        );
        package
            .set("path", new_path)
            .map_err(|e| anyhow!("failed to set package.path: {e}"))?;
        Ok(())
    }

    fn resolve_base_path() -> PathBuf {
        if let Ok(path) = std::env::var("BOTSTER_LUA_PATH") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .map(|home| home.join(".botster").join("lua"))
            .unwrap_or_else(|| PathBuf::from(".botster/lua"))
    }

    /// The script tree root.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Override the script tree root (tests, alternate layouts).
    pub fn set_base_path(&mut self, path: PathBuf) -> Result<()> {
        Self::setup_package_path(&self.lua, &path)?;
        self.base_path = path;
        Ok(())
    }

    /// Load the tree's entry point (`init.lua`) if present, then discover
    /// plugins.
    pub fn load_tree(&mut self) -> Result<()> {
        let init = self.base_path.join("init.lua");
        if init.exists() {
            self.load_file_absolute(&init)?;
        }
        self.discover_plugins();
        Ok(())
    }

    /// Load and execute a file relative to the base path.
    pub fn load_file(&self, relative_path: &Path) -> Result<()> {
        self.load_file_absolute(&self.base_path.join(relative_path))
    }

    /// Load and execute a file by absolute path, honoring strict mode.
    pub fn load_file_absolute(&self, path: &Path) -> Result<()> {
        let result = (|| -> Result<()> {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            self.lua
                .load(&source)
                .set_name(path.to_string_lossy())
                .exec()
                .map_err(|e| anyhow!("failed to execute {}: {e}", path.display()))?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                log::debug!("loaded Lua file: {}", path.display());
                Ok(())
            }
            Err(e) if self.strict => Err(e),
            Err(e) => {
                log::warn!("Lua file error: {e}");
                Ok(())
            }
        }
    }

    /// Execute a source string, honoring strict mode.
    pub fn load_string(&self, name: &str, source: &str) -> Result<()> {
        let result = self
            .lua
            .load(source)
            .set_name(name)
            .exec()
            .map_err(|e| anyhow!("failed to execute {name}: {e}"));
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.strict => Err(e),
            Err(e) => {
                log::warn!("Lua error: {e}");
                Ok(())
            }
        }
    }

    /// Reload a module by dotted name.
    ///
    /// `core.*` modules are protected and never reloaded. The module's
    /// `_before_reload` / `_after_reload` functions are invoked around the
    /// re-require; on error the prior module object is restored.
    pub fn reload_module(&mut self, name: &str) -> Result<()> {
        if name == "core" || name.starts_with("core.") {
            log::debug!("skipping reload of protected module {name}");
            return Ok(());
        }

        if name == WATCHER_MODULE {
            // The watcher reload drops its own watch registrations first
            // and reinstalls them afterwards.
            if let Some(watcher) = self.watcher.as_mut() {
                watcher.unwatch_all();
            }
            let result = self.reload_module_inner(name);
            if let Some(watcher) = self.watcher.as_mut() {
                if let Err(e) = watcher.rewatch() {
                    log::warn!("failed to reinstall watches after reload: {e}");
                }
            }
            return result;
        }

        self.reload_module_inner(name)
    }

    fn reload_module_inner(&self, name: &str) -> Result<()> {
        let package: Table = self.lua.globals().get("package")?;
        let loaded: Table = package.get("loaded")?;
        let old: Value = loaded.get(name)?;

        if old.is_nil() {
            // Never required; nothing to swap.
            log::debug!("module {name} not loaded, skipping reload");
            return Ok(());
        }

        if let Value::Table(ref module) = old {
            if let Ok(before) = module.get::<Function>("_before_reload") {
                if let Err(e) = before.call::<()>(()) {
                    log::warn!("{name}._before_reload errored: {e}");
                }
            }
        }

        loaded.set(name, Value::Nil)?;
        let require: Function = self.lua.globals().get("require")?;

        match require.call::<Value>(name) {
            Ok(new_module) => {
                if let Value::Table(ref module) = new_module {
                    if let Ok(after) = module.get::<Function>("_after_reload") {
                        if let Err(e) = after.call::<()>(()) {
                            log::warn!("{name}._after_reload errored: {e}");
                        }
                    }
                }
                log::info!("reloaded Lua module {name}");
                Ok(())
            }
            Err(e) => {
                // Failed reload keeps the prior module alive.
                loaded.set(name, old)?;
                log::warn!("reload of {name} failed, keeping prior module: {e}");
                if self.strict {
                    Err(anyhow!("reload of {name} failed: {e}"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Load plugins already present under `{base}/plugins/`.
    fn discover_plugins(&mut self) {
        let root = self.base_path.join("plugins");
        let Ok(entries) = std::fs::read_dir(&root) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                self.load_plugin(&name);
            }
        }
    }

    /// Require `plugins.<name>`, recording it for unload.
    pub fn load_plugin(&mut self, name: &str) {
        let module = format!("plugins.{name}");
        let require: Function = match self.lua.globals().get("require") {
            Ok(f) => f,
            Err(e) => {
                log::warn!("require unavailable: {e}");
                return;
            }
        };
        match require.call::<Value>(module.as_str()) {
            Ok(_) => {
                log::info!("loaded plugin {name}");
                self.loaded_plugins.insert(name.to_string());
            }
            Err(e) => log::warn!("plugin {name} failed to load: {e}"),
        }
    }

    /// Drop a plugin's modules from `package.loaded`.
    pub fn unload_plugin(&mut self, name: &str) {
        let prefix = format!("plugins.{name}");
        let cleared = (|| -> mlua::Result<()> {
            let package: Table = self.lua.globals().get("package")?;
            let loaded: Table = package.get("loaded")?;
            let mut to_clear = Vec::new();
            loaded.for_each(|key: String, _: Value| {
                if key == prefix || key.starts_with(&format!("{prefix}.")) {
                    to_clear.push(key);
                }
                Ok(())
            })?;
            for key in to_clear {
                loaded.set(key, Value::Nil)?;
            }
            Ok(())
        })();
        if let Err(e) = cleared {
            log::warn!("plugin {name} unload failed: {e}");
        } else {
            log::info!("unloaded plugin {name}");
            self.loaded_plugins.remove(name);
        }
    }

    /// Start watching the script tree (and plugin root) for hot-reload.
    pub fn start_file_watching(&mut self) -> Result<()> {
        let mut watcher = LuaFileWatcher::new(self.base_path.clone())?;
        watcher.start_watching()?;

        let plugin_root = self.base_path.join("plugins");
        if plugin_root.is_dir() {
            watcher.add_plugin_root(plugin_root)?;
        }

        self.watcher = Some(watcher);
        Ok(())
    }

    /// One tick of runtime upkeep: fire due timers, install requested
    /// watches, apply pending reloads and plugin changes.
    pub fn pump(&mut self) {
        primitives::poll_due_timers(&self.lua, &self.timers);

        // Directory watches requested by scripts.
        let requested: Vec<PathBuf> = self.watch_requests.lock().unwrap().drain(..).collect();
        if let Some(watcher) = self.watcher.as_mut() {
            for path in requested {
                if let Err(e) = watcher.add_plugin_root(path.clone()) {
                    log::warn!("watch of {} failed: {e}", path.display());
                }
            }
        }

        let changes = match self.watcher.as_mut() {
            Some(watcher) => watcher.poll_changes(),
            None => Vec::new(),
        };
        for change in changes {
            match change {
                WatchEvent::ModuleChanged(module) => {
                    if let Err(e) = self.reload_module(&module) {
                        log::warn!("reload of {module} failed: {e}");
                    }
                }
                WatchEvent::PluginAdded(name) => self.load_plugin(&name),
                WatchEvent::PluginRemoved(name) => self.unload_plugin(&name),
            }
        }
    }

    /// Emit a host event to Lua subscribers.
    pub fn emit_event(&self, name: &str, payload: &serde_json::Value) {
        primitives::emit_event(&self.lua, &self.events, name, payload);
    }

    /// Run a hook chain with a JSON payload; `None` means a hook dropped
    /// the event.
    pub fn run_hook(
        &self,
        event: &str,
        payload: &serde_json::Value,
    ) -> Option<serde_json::Value> {
        let value = match self.lua.to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("hook payload conversion failed: {e}");
                return Some(payload.clone());
            }
        };
        let result = self.hooks.lock().unwrap().run_chain(&self.lua, event, value)?;
        match self.lua.from_value(result) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("hook result conversion failed: {e}");
                None
            }
        }
    }

    /// Drain pending hub requests queued by scripts.
    #[must_use]
    pub fn drain_hub_requests(&self) -> Vec<HubRequest> {
        self.hub_requests.lock().unwrap().drain(..).collect()
    }

    /// Refresh the read-only agent snapshot scripts see via `hub.agents()`.
    pub fn update_hub_snapshot(&self, snapshot: serde_json::Value) {
        *self.hub_snapshot.lock().unwrap() = snapshot;
    }

    /// Direct interpreter access (tests and embedding).
    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runtime_with_tree(dir: &TempDir) -> LuaRuntime {
        let mut runtime = LuaRuntime::new().unwrap();
        runtime.set_base_path(dir.path().to_path_buf()).unwrap();
        runtime
    }

    #[test]
    fn test_state_registry_survives_reload() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(
            dir.path().join("lib/counter.lua"),
            r#"
            local s = state.get("counter")
            s.count = (s.count or 0) + 1
            return { count = function() return s.count end }
            "#,
        )
        .unwrap();

        let mut runtime = runtime_with_tree(&dir);
        runtime
            .load_string("boot", "counter = require('lib.counter')")
            .unwrap();

        let count: i64 = runtime
            .lua()
            .load("return state.get('counter').count")
            .eval()
            .unwrap();
        assert_eq!(count, 1);

        runtime.reload_module("lib.counter").unwrap();
        let count: i64 = runtime
            .lua()
            .load("return state.get('counter').count")
            .eval()
            .unwrap();
        // The registry persisted; the reloaded module incremented it.
        assert_eq!(count, 2);
    }

    #[test]
    fn test_class_helper_preserves_identity() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_with_tree(&dir);

        let same: bool = runtime
            .lua()
            .load(
                r#"
                local first = state.class("Widget", { hello = function() return "v1" end })
                local second = state.class("Widget", { hello = function() return "v2" end })
                return first == second and second.hello() == "v2" and first.hello() == "v2"
                "#,
            )
            .eval()
            .unwrap();
        assert!(same);
    }

    #[test]
    fn test_core_modules_are_protected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("core")).unwrap();
        std::fs::write(
            dir.path().join("core/config.lua"),
            "loads = (loads or 0) + 1; return { loads = loads }",
        )
        .unwrap();

        let mut runtime = runtime_with_tree(&dir);
        runtime
            .load_string("boot", "cfg = require('core.config')")
            .unwrap();
        runtime.reload_module("core.config").unwrap();

        let loads: i64 = runtime.lua().load("return loads").eval().unwrap();
        assert_eq!(loads, 1, "core modules must never reload");
    }

    #[test]
    fn test_reload_error_keeps_prior_module() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        let module_path = dir.path().join("lib/fragile.lua");
        std::fs::write(&module_path, "return { version = 1 }").unwrap();

        let mut runtime = runtime_with_tree(&dir);
        runtime
            .load_string("boot", "fragile = require('lib.fragile')")
            .unwrap();

        // Break the module on disk, then reload.
        std::fs::write(&module_path, "syntax error here (").unwrap();
        runtime.reload_module("lib.fragile").unwrap();

        let version: i64 = runtime
            .lua()
            .load("return require('lib.fragile').version")
            .eval()
            .unwrap();
        assert_eq!(version, 1, "prior module must remain after failed reload");
    }

    #[test]
    fn test_before_and_after_reload_callbacks() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("handlers")).unwrap();
        std::fs::write(
            dir.path().join("handlers/agents.lua"),
            r#"
            local s = state.get("agents-handler")
            return {
                _before_reload = function() s.before = (s.before or 0) + 1 end,
                _after_reload = function() s.after = (s.after or 0) + 1 end,
            }
            "#,
        )
        .unwrap();

        let mut runtime = runtime_with_tree(&dir);
        runtime
            .load_string("boot", "require('handlers.agents')")
            .unwrap();
        runtime.reload_module("handlers.agents").unwrap();

        let (before, after): (i64, i64) = runtime
            .lua()
            .load("local s = state.get('agents-handler'); return s.before or 0, s.after or 0")
            .eval()
            .unwrap();
        assert_eq!(before, 1);
        assert_eq!(after, 1);
    }

    #[test]
    fn test_hooks_registered_from_lua_run_from_host() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_with_tree(&dir);

        runtime
            .load_string(
                "boot",
                r#"
                hooks.add("terminal_output", "redact", function(e)
                    e.text = string.gsub(e.text, "secret", "[redacted]")
                    return e
                end, { priority = 10 })
                hooks.add("terminal_output", "drop-empty", function(e)
                    if e.text == "" then return nil end
                    return e
                end, { priority = 5 })
                "#,
            )
            .unwrap();

        let out = runtime
            .run_hook(
                "terminal_output",
                &serde_json::json!({ "text": "the secret plan" }),
            )
            .unwrap();
        assert_eq!(out["text"], "the [redacted] plan");

        let dropped = runtime.run_hook("terminal_output", &serde_json::json!({ "text": "" }));
        assert!(dropped.is_none());
    }

    #[test]
    fn test_plugin_load_and_unload() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("plugins/greeter")).unwrap();
        std::fs::write(
            dir.path().join("plugins/greeter/init.lua"),
            "greeted = true; return { name = 'greeter' }",
        )
        .unwrap();

        let mut runtime = runtime_with_tree(&dir);
        runtime.load_plugin("greeter");

        let greeted: bool = runtime.lua().load("return greeted").eval().unwrap();
        assert!(greeted);

        runtime.unload_plugin("greeter");
        let still_loaded: bool = runtime
            .lua()
            .load("return package.loaded['plugins.greeter'] ~= nil")
            .eval()
            .unwrap();
        assert!(!still_loaded);
    }

    #[test]
    fn test_hub_requests_drain_in_order() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime_with_tree(&dir);

        runtime
            .load_string("boot", "hub.close_agent('a'); hub.close_agent('b')")
            .unwrap();

        let requests = runtime.drain_hub_requests();
        assert_eq!(
            requests,
            vec![
                HubRequest::CloseAgent {
                    session_key: "a".into()
                },
                HubRequest::CloseAgent {
                    session_key: "b".into()
                },
            ]
        );
        assert!(runtime.drain_hub_requests().is_empty());
    }
}
