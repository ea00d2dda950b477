//! `log.*` - structured logging from Lua.
//!
//! Messages land in the hub's log file tagged `[lua]` so script output is
//! distinguishable from host output.

use anyhow::Result;
use mlua::Lua;

/// Register the `log` table: `debug`, `info`, `warn`, `error`.
pub fn register(lua: &Lua) -> Result<()> {
    let table = lua.create_table()?;

    table.set(
        "debug",
        lua.create_function(|_, message: String| {
            log::debug!("[lua] {}", message);
            Ok(())
        })?,
    )?;
    table.set(
        "info",
        lua.create_function(|_, message: String| {
            log::info!("[lua] {}", message);
            Ok(())
        })?,
    )?;
    table.set(
        "warn",
        lua.create_function(|_, message: String| {
            log::warn!("[lua] {}", message);
            Ok(())
        })?,
    )?;
    table.set(
        "error",
        lua.create_function(|_, message: String| {
            log::error!("[lua] {}", message);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_callable() {
        let lua = Lua::new();
        register(&lua).unwrap();
        lua.load("log.debug('d'); log.info('i'); log.warn('w'); log.error('e')")
            .exec()
            .unwrap();
    }
}
