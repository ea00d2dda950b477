//! Filesystem watcher for Lua hot-reload.
//!
//! One unified poll-based watcher (polling survives editors, containers,
//! and network mounts that break inotify semantics) covers the core Lua
//! tree and every plugin root. Module file changes are debounced before
//! being reported; creating or deleting a directory at the plugin-root
//! level reports a plugin load/unload instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};

use crate::constants::LUA_RELOAD_DEBOUNCE;

/// Poll interval for the underlying watcher.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A change the runtime should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A `.lua` module changed; reload it.
    ModuleChanged(String),
    /// A new plugin directory appeared under a plugin root.
    PluginAdded(String),
    /// A plugin directory disappeared.
    PluginRemoved(String),
}

/// Watches the Lua source tree and plugin roots for hot-reload.
pub struct LuaFileWatcher {
    watcher: PollWatcher,
    rx: mpsc::Receiver<Result<Event, notify::Error>>,
    /// The Lua tree whose files map to module names.
    base_path: PathBuf,
    /// Directories whose immediate children are plugins.
    plugin_roots: Vec<PathBuf>,
    /// Pending module changes being debounced: module -> last event time.
    pending: HashMap<String, Instant>,
}

impl std::fmt::Debug for LuaFileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaFileWatcher")
            .field("base_path", &self.base_path)
            .field("plugin_roots", &self.plugin_roots)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl LuaFileWatcher {
    /// Create a watcher for `base_path`. Watches start on
    /// [`start_watching`](Self::start_watching).
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let watcher = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )
        .context("failed to create poll watcher")?;

        Ok(Self {
            watcher,
            rx,
            base_path,
            plugin_roots: Vec::new(),
            pending: HashMap::new(),
        })
    }

    /// Begin watching the base tree.
    pub fn start_watching(&mut self) -> Result<()> {
        self.watcher
            .watch(&self.base_path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", self.base_path.display()))?;
        log::info!("watching Lua tree: {}", self.base_path.display());
        Ok(())
    }

    /// Also watch a plugin root (immediate children are plugins).
    pub fn add_plugin_root(&mut self, root: PathBuf) -> Result<()> {
        self.watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch plugin root {}", root.display()))?;
        log::info!("watching plugin root: {}", root.display());
        self.plugin_roots.push(root);
        Ok(())
    }

    /// Tear down every watch. Called before the watcher itself is
    /// reloaded; [`rewatch`](Self::rewatch) reinstalls afterwards.
    pub fn unwatch_all(&mut self) {
        let _ = self.watcher.unwatch(&self.base_path);
        for root in &self.plugin_roots {
            let _ = self.watcher.unwatch(root);
        }
    }

    /// Reinstall all watches after a reload of the watcher itself.
    pub fn rewatch(&mut self) -> Result<()> {
        self.watcher
            .watch(&self.base_path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to rewatch {}", self.base_path.display()))?;
        for root in &self.plugin_roots {
            self.watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("failed to rewatch {}", root.display()))?;
        }
        Ok(())
    }

    /// Drain fs events and return the changes that are ready to act on.
    ///
    /// Module changes are held back until [`LUA_RELOAD_DEBOUNCE`] has
    /// passed without further writes to the same module; plugin add/remove
    /// events are immediate.
    pub fn poll_changes(&mut self) -> Vec<WatchEvent> {
        let mut ready = Vec::new();

        while let Ok(result) = self.rx.try_recv() {
            let Ok(event) = result else { continue };
            match event.kind {
                EventKind::Modify(_) | EventKind::Create(_) => {
                    for path in &event.paths {
                        if let Some(plugin) = self.plugin_dir_event(path) {
                            if matches!(event.kind, EventKind::Create(_)) && path.is_dir() {
                                ready.push(WatchEvent::PluginAdded(plugin));
                                continue;
                            }
                        }
                        if path.extension().is_some_and(|ext| ext == "lua") {
                            if let Some(module) = self.path_to_module(path) {
                                self.pending.insert(module, Instant::now());
                            }
                        }
                    }
                }
                EventKind::Remove(_) => {
                    for path in &event.paths {
                        if let Some(plugin) = self.plugin_dir_event(path) {
                            ready.push(WatchEvent::PluginRemoved(plugin));
                        }
                    }
                }
                _ => {}
            }
        }

        // Release debounced modules whose quiet period elapsed.
        let now = Instant::now();
        let released: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= LUA_RELOAD_DEBOUNCE)
            .map(|(module, _)| module.clone())
            .collect();
        for module in released {
            self.pending.remove(&module);
            ready.push(WatchEvent::ModuleChanged(module));
        }

        ready
    }

    /// If `path` is an immediate child of a plugin root, return the plugin
    /// name.
    fn plugin_dir_event(&self, path: &Path) -> Option<String> {
        for root in &self.plugin_roots {
            if path.parent() == Some(root.as_path()) {
                return path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string());
            }
        }
        None
    }

    /// Convert a file path under the base tree to a dotted module name:
    /// `{base}/handlers/agents.lua` → `handlers.agents`.
    fn path_to_module(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let without_ext = relative.with_extension("");
        Some(
            without_ext
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("."),
        )
    }

    /// Base path being watched.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watcher_at(base: &Path) -> LuaFileWatcher {
        LuaFileWatcher::new(base.to_path_buf()).unwrap()
    }

    #[test]
    fn test_path_to_module() {
        let dir = TempDir::new().unwrap();
        let w = watcher_at(dir.path());

        assert_eq!(
            w.path_to_module(&dir.path().join("core/init.lua")),
            Some("core.init".to_string())
        );
        assert_eq!(
            w.path_to_module(&dir.path().join("handlers/agents.lua")),
            Some("handlers.agents".to_string())
        );
        assert_eq!(
            w.path_to_module(&dir.path().join("init.lua")),
            Some("init".to_string())
        );
        assert_eq!(w.path_to_module(Path::new("/elsewhere/x.lua")), None);
    }

    #[test]
    fn test_module_change_is_debounced_then_released() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        let mut w = watcher_at(dir.path());
        w.start_watching().unwrap();

        std::fs::write(dir.path().join("lib/util.lua"), "return {}").unwrap();

        // Wait for the poll watcher to notice, then for the debounce to
        // elapse.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            events.extend(w.poll_changes());
            if events
                .iter()
                .any(|e| *e == WatchEvent::ModuleChanged("lib.util".to_string()))
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("module change never reported; saw {events:?}");
    }

    #[test]
    fn test_plugin_root_add_detection() {
        let dir = TempDir::new().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();

        let base = dir.path().join("lua");
        std::fs::create_dir_all(&base).unwrap();
        let mut w = watcher_at(&base);
        w.start_watching().unwrap();
        w.add_plugin_root(plugins.clone()).unwrap();

        std::fs::create_dir(plugins.join("my-plugin")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let events = w.poll_changes();
            if events
                .iter()
                .any(|e| *e == WatchEvent::PluginAdded("my-plugin".to_string()))
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("plugin add never reported");
    }

    #[test]
    fn test_unwatch_and_rewatch() {
        let dir = TempDir::new().unwrap();
        let mut w = watcher_at(dir.path());
        w.start_watching().unwrap();
        w.unwatch_all();
        w.rewatch().unwrap();
    }
}
