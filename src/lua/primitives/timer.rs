//! `timer.*` - one-shot timers for Lua.
//!
//! `timer.after(seconds, fn)` returns a cancellation id; callbacks fire on
//! the hub tick that first observes the deadline. Callbacks are one-shot
//! and errors are logged, never propagated.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use mlua::{Function, Lua, RegistryKey};

/// One pending timer.
struct Timer {
    id: u64,
    deadline: Instant,
    callback: RegistryKey,
}

/// Shared timer state between the Lua closures and the runtime pump.
#[derive(Default)]
pub struct TimerQueue {
    next_id: u64,
    timers: Vec<Timer>,
}

/// Handle shared with the registered Lua functions.
pub type SharedTimerQueue = Arc<Mutex<TimerQueue>>;

/// Fresh shared timer queue.
#[must_use]
pub fn new_timer_queue() -> SharedTimerQueue {
    Arc::new(Mutex::new(TimerQueue::default()))
}

/// Register the `timer` table: `after(seconds, fn) -> id`, `cancel(id)`.
pub fn register_timer(lua: &Lua, queue: SharedTimerQueue) -> Result<()> {
    let table = lua.create_table()?;

    let after_queue = Arc::clone(&queue);
    table.set(
        "after",
        lua.create_function(move |lua, (seconds, callback): (f64, Function)| {
            let key = lua.create_registry_value(callback)?;
            let mut queue = after_queue.lock().unwrap();
            queue.next_id += 1;
            let id = queue.next_id;
            queue.timers.push(Timer {
                id,
                deadline: Instant::now() + Duration::from_secs_f64(seconds.max(0.0)),
                callback: key,
            });
            Ok(id)
        })?,
    )?;

    let cancel_queue = Arc::clone(&queue);
    table.set(
        "cancel",
        lua.create_function(move |_, id: u64| {
            let mut queue = cancel_queue.lock().unwrap();
            let before = queue.timers.len();
            queue.timers.retain(|t| t.id != id);
            Ok(queue.timers.len() != before)
        })?,
    )?;

    lua.globals().set("timer", table)?;
    Ok(())
}

/// Fire every timer whose deadline has passed. Called once per hub tick.
pub fn poll_due(lua: &Lua, queue: &SharedTimerQueue) {
    let due: Vec<Timer> = {
        let mut queue = queue.lock().unwrap();
        let now = Instant::now();
        let (ready, pending): (Vec<_>, Vec<_>) =
            queue.timers.drain(..).partition(|t| t.deadline <= now);
        queue.timers = pending;
        ready
    };

    for timer in due {
        match lua.registry_value::<Function>(&timer.callback) {
            Ok(callback) => {
                if let Err(e) = callback.call::<()>(()) {
                    log::warn!("timer {} callback errored: {}", timer.id, e);
                }
            }
            Err(e) => log::warn!("timer {} lost its callback: {}", timer.id, e),
        }
        let _ = lua.remove_registry_value(timer.callback);
    }
}
