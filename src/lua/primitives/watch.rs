//! `watch.*` - directory watch requests from Lua.
//!
//! Scripts cannot install fs watchers directly; `watch.directory(path)`
//! queues a request the runtime drains into the unified poll watcher.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use mlua::Lua;

/// Queued watch requests, drained by the runtime each tick.
pub type WatchRequestQueue = Arc<Mutex<Vec<PathBuf>>>;

/// Fresh shared watch queue.
#[must_use]
pub fn new_watch_queue() -> WatchRequestQueue {
    Arc::new(Mutex::new(Vec::new()))
}

/// Register the `watch` table: `directory(path)`.
pub fn register_watch(lua: &Lua, queue: WatchRequestQueue) -> Result<()> {
    let table = lua.create_table()?;

    table.set(
        "directory",
        lua.create_function(move |_, path: String| {
            queue.lock().unwrap().push(PathBuf::from(path));
            Ok(())
        })?,
    )?;

    lua.globals().set("watch", table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_request_is_queued() {
        let lua = Lua::new();
        let queue = new_watch_queue();
        register_watch(&lua, Arc::clone(&queue)).unwrap();

        lua.load("watch.directory('/tmp/plugins')").exec().unwrap();

        let queued = queue.lock().unwrap();
        assert_eq!(queued.as_slice(), &[PathBuf::from("/tmp/plugins")]);
    }
}
