//! Device identity.
//!
//! A stable per-machine identity sent with registration and heartbeats so
//! the server can attribute hubs to devices. Created on first run and
//! persisted under the config dir.

use std::fs;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Persistent device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable device id.
    pub device_id: String,
    /// Human-readable device name (hostname).
    pub name: String,
}

impl Device {
    /// Load the persisted identity, creating one on first run.
    pub fn load_or_create() -> Result<Self> {
        let path = Config::config_dir()?.join("device.json");

        if path.exists() {
            if let Ok(device) =
                serde_json::from_str::<Self>(&fs::read_to_string(&path)?)
            {
                return Ok(device);
            }
            log::warn!("device identity unreadable, regenerating");
        }

        let device = Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "botster-hub".to_string()),
        };
        fs::write(&path, serde_json::to_string_pretty(&device)?)?;
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable_across_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("BOTSTER_CONFIG_DIR", dir.path());

        let first = Device::load_or_create().unwrap();
        let second = Device::load_or_create().unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert!(!first.name.is_empty());

        std::env::remove_var("BOTSTER_CONFIG_DIR");
    }
}
