//! Botster Hub - PTY-based daemon for GitHub mention → local agent
//! automation.
//!
//! The hub polls a control server for work items, spawns one autonomous
//! agent per issue or branch inside an isolated git worktree and PTY,
//! relays terminal I/O to browsers over an end-to-end encrypted channel,
//! and forwards HTTP into agent dev servers through a reverse tunnel.

pub mod agent;
pub mod auth;
pub mod config;
pub mod constants;
pub mod device;
pub mod env;
pub mod hub;
pub mod keyring;
pub mod lua;
pub mod pty;
pub mod relay;
pub mod ring_buffer;
pub mod server;
pub mod terminal;
pub mod tui;
pub mod tunnel;
pub mod worktree;

// Re-export commonly used types.
pub use agent::{Agent, AgentStatus, SpawnConfig, StopReason};
pub use config::Config;
pub use device::Device;
pub use hub::{dispatch, Hub, HubAction, HubState, TuiMode};
pub use lua::LuaRuntime;
pub use pty::{PtyError, PtySession};
pub use relay::{BrowserRelay, RatchetSession, View, WireFrame};
pub use ring_buffer::RingBuffer;
pub use server::{ApiClient, NotificationKind, SessionKey, WorkItem};
pub use terminal::{detect_notifications, Notification, ScrollOp, TerminalParser};
pub use tunnel::TunnelMultiplexer;
pub use worktree::WorktreeManager;
