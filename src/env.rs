//! Environment detection helpers.
//!
//! Centralizes every `BOTSTER_ENV` check so test-mode behavior (plain-file
//! credentials, project-local config dirs) stays consistent across modules.

/// Application name used for platform config directories and keyring entries.
pub const APP_NAME: &str = "botster";

/// Default control-server URL when neither config nor env override it.
pub const DEFAULT_SERVER_URL: &str = "https://botster.dev";

/// Returns the raw `BOTSTER_ENV` value, if set.
pub fn botster_env() -> Option<String> {
    std::env::var("BOTSTER_ENV").ok()
}

/// True when running under `BOTSTER_ENV=test`.
///
/// Test mode disables OS-keyring usage and authentication checks so
/// integration tests can run headless against a mock server.
pub fn is_test_mode() -> bool {
    botster_env().as_deref() == Some("test")
}

/// True in any test-like environment (`test` or `system_test`).
pub fn is_any_test() -> bool {
    matches!(botster_env().as_deref(), Some("test") | Some("system_test"))
}

/// True when the OS keyring should be bypassed in favor of a plain file.
pub fn should_skip_keyring() -> bool {
    is_any_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_name_is_stable() {
        // Keyring entries and config dirs are derived from this; changing it
        // silently orphans stored credentials.
        assert_eq!(APP_NAME, "botster");
    }

    #[test]
    fn test_default_server_url_is_https() {
        assert!(DEFAULT_SERVER_URL.starts_with("https://"));
    }
}
