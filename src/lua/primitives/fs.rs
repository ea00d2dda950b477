//! `fs.*` - read-only filesystem predicates for Lua.

use anyhow::Result;
use mlua::Lua;

/// Register the `fs` table: `exists`, `is_dir`.
pub fn register(lua: &Lua) -> Result<()> {
    let table = lua.create_table()?;

    table.set(
        "exists",
        lua.create_function(|_, path: String| Ok(std::path::Path::new(&path).exists()))?,
    )?;
    table.set(
        "is_dir",
        lua.create_function(|_, path: String| Ok(std::path::Path::new(&path).is_dir()))?,
    )?;

    lua.globals().set("fs", table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exists_and_is_dir() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("x.txt");
        std::fs::write(&file, "hi").unwrap();

        let lua = Lua::new();
        register(&lua).unwrap();

        let script = format!(
            "return fs.exists('{file}'), fs.is_dir('{dir}'), fs.is_dir('{file}'), fs.exists('{missing}')",
            file = file.display(),
            dir = dir.path().display(),
            missing = dir.path().join("nope").display(),
        );
        let (a, b, c, d): (bool, bool, bool, bool) = lua.load(&script).eval().unwrap();
        assert!(a);
        assert!(b);
        assert!(!c);
        assert!(!d);
    }
}
