//! Embedded Lua scripting with hot-reload.
//!
//! Extensibility layer for the hub: scripts subscribe to hub events,
//! transform values through hook chains, and queue actions back to the
//! orchestrator through a narrow primitive surface.
//!
//! # Submodules
//!
//! - [`runtime`]: interpreter ownership, module loading and reload
//! - [`hooks`]: named hook chains with priorities
//! - [`watcher`]: poll-based fs watcher driving hot-reload
//! - [`primitives`]: the curated host API (`log`, `timer`, `fs`, `json`,
//!   `events`, `watch`, `hub`)

pub mod hooks;
pub mod primitives;
pub mod runtime;
pub mod watcher;

pub use hooks::HookRegistry;
pub use primitives::HubRequest;
pub use runtime::LuaRuntime;
pub use watcher::{LuaFileWatcher, WatchEvent};
