//! `json.*` - JSON encode/decode for Lua tables.
//!
//! Bridges `serde_json` values through mlua's serialize support, so hook
//! payloads and host events round-trip without bespoke conversion code.

use anyhow::Result;
use mlua::{Lua, LuaSerdeExt, Value};

/// Register the `json` table: `encode`, `decode`.
pub fn register(lua: &Lua) -> Result<()> {
    let table = lua.create_table()?;

    table.set(
        "encode",
        lua.create_function(|_, value: Value| {
            serde_json::to_string(&value)
                .map_err(|e| mlua::Error::RuntimeError(format!("json.encode: {e}")))
        })?,
    )?;
    table.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| mlua::Error::RuntimeError(format!("json.decode: {e}")))?;
            lua.to_value(&parsed)
        })?,
    )?;

    lua.globals().set("json", table)?;
    Ok(())
}
