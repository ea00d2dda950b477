//! Application-wide constants for botster-hub.
//!
//! Centralizes magic numbers so timing and capacity decisions are
//! discoverable in one place. Grouped by domain.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Crate version reported to the server and shown in the TUI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent header sent with all API requests.
pub fn user_agent() -> String {
    format!("botster-hub/{}", VERSION)
}

// ============================================================================
// Event loop
// ============================================================================

/// Orchestrator tick. All channel receives use this as their poll timeout,
/// so no single input source can stall the loop longer than one tick.
pub const TICK: Duration = Duration::from_millis(50);

/// Default interval between server message polls (overridable via config).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between heartbeats. An immediate heartbeat is also sent
/// on every agent lifecycle change.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Timeouts
// ============================================================================

/// Deadline for every HTTP call to the control server.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a forwarded tunnel request; exceeding yields 504.
pub const TUNNEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL when stopping a PTY child.
pub const PTY_KILL_GRACE: Duration = Duration::from_secs(2);

/// Hard cap for a single worktree teardown command.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a freshly spawned agent may stay silent before it is considered
/// Running anyway.
pub const SPAWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Retry policy
// ============================================================================

/// Base delay for exponential backoff on server calls.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Backoff ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

// ============================================================================
// Capacities
// ============================================================================

/// Scrollback lines kept per PTY terminal.
pub const SCROLLBACK_LINES: usize = 10_000;

/// Raw-byte ring buffer per PTY, for byte-fidelity streaming (~1000 chunks
/// at a typical 1 KiB read).
pub const PTY_RAW_RING_BYTES: usize = 1024 * 1024;

/// Replay buffer per browser session, oldest frames dropped beyond this.
pub const REPLAY_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Skipped message keys buffered per ratchet session before oldest are
/// discarded.
pub const RATCHET_SKIPPED_KEYS_CAP: usize = 1000;

/// Default maximum concurrent agents.
pub const DEFAULT_MAX_SESSIONS: usize = 20;

/// In-flight tunnel requests per agent; excess queue FIFO.
pub const TUNNEL_MAX_IN_FLIGHT: usize = 16;

/// Port range scanned for agent dev-server tunnels.
pub const TUNNEL_PORT_RANGE: std::ops::Range<u16> = 4001..5000;

/// One-time prekeys published per bundle; republished when stock drops
/// below [`PREKEY_REFILL_THRESHOLD`].
pub const PREKEY_BATCH: usize = 20;
pub const PREKEY_REFILL_THRESHOLD: usize = 5;

/// Debounce window for Lua file-watcher reloads.
pub const LUA_RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(HTTP_REQUEST_TIMEOUT >= Duration::from_secs(5));
        assert!(HTTP_REQUEST_TIMEOUT <= Duration::from_secs(60));
        assert!(HEARTBEAT_INTERVAL >= Duration::from_secs(10));
        assert!(TICK < DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_backoff_bounds() {
        assert!(BACKOFF_BASE < BACKOFF_CAP);
    }

    #[test]
    fn test_tunnel_port_range() {
        assert_eq!(TUNNEL_PORT_RANGE.start, 4001);
        assert_eq!(TUNNEL_PORT_RANGE.end, 5000);
    }
}
