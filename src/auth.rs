//! Device authorization flow.
//!
//! RFC 8628-style grant against the control server: request a code, show
//! the verification URL, poll until the user approves. The resulting
//! bearer token lands in the keyring.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Response from `POST /hubs/codes`.
#[derive(Debug, Deserialize)]
pub struct DeviceCodeResponse {
    /// Opaque code for polling.
    pub device_code: String,
    /// Human-readable code the user enters.
    pub user_code: String,
    /// URL where the user enters the code.
    pub verification_uri: String,
    /// Seconds until the code expires.
    pub expires_in: u64,
    /// Minimum polling interval in seconds.
    pub interval: u64,
}

/// Success body from `GET /hubs/codes/{device_code}`.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Bearer token for API authentication.
    pub access_token: String,
    /// Token type (always "bearer").
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Run the device-authorization flow and return the access token.
pub fn device_flow(server_url: &str) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let device_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Botster Hub".to_string());

    let url = format!("{server_url}/hubs/codes");
    let response = client
        .post(&url)
        .json(&serde_json::json!({ "device_name": device_name }))
        .send()
        .context("failed to request device code")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        anyhow::bail!("server returned {status}: {body}");
    }
    let code: DeviceCodeResponse = response.json().context("invalid device code response")?;

    println!();
    println!("  To authenticate, visit:");
    println!();
    println!("    {}", code.verification_uri);
    println!();
    println!("  And enter this code:");
    println!();
    println!("    {}", code.user_code);
    println!();

    let interactive = atty::is(atty::Stream::Stdin)
        && std::env::var("BOTSTER_NO_BROWSER").is_err()
        && std::env::var("CI").is_err();
    if interactive {
        let _ = open_browser(&code.verification_uri);
    }

    print!("  Waiting for authorization");
    io::stdout().flush()?;

    let poll_url = format!("{server_url}/hubs/codes/{}", code.device_code);
    let poll_interval = Duration::from_secs(code.interval.max(5));
    let max_attempts = code.expires_in / code.interval.max(5);

    for _ in 0..max_attempts {
        thread::sleep(poll_interval);

        let response = client
            .get(&poll_url)
            .send()
            .context("failed to poll for authorization")?;

        match response.status().as_u16() {
            200 => {
                let token: TokenResponse =
                    response.json().context("invalid token response")?;
                println!();
                println!();
                println!("  Authorized successfully!");
                return Ok(token.access_token);
            }
            202 => {
                print!(".");
                io::stdout().flush()?;
            }
            400 | 401 | 403 => {
                let error: ErrorResponse = response.json().unwrap_or(ErrorResponse {
                    error: "unknown".to_string(),
                });
                println!();
                match error.error.as_str() {
                    "authorization_pending" => continue,
                    "expired_token" => {
                        anyhow::bail!("authorization code expired, please try again")
                    }
                    "access_denied" => anyhow::bail!("authorization was denied"),
                    other => anyhow::bail!("authorization failed: {other}"),
                }
            }
            status => {
                log::warn!("unexpected status {status} while polling, retrying");
                print!(".");
                io::stdout().flush()?;
            }
        }
    }

    println!();
    anyhow::bail!("authorization timed out, please try again")
}

/// Validate a token with an authenticated request.
#[must_use]
pub fn validate_token(server_url: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }

    let Ok(client) = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    else {
        return false;
    };

    let url = format!("{server_url}/api/hubs");
    match client.get(&url).bearer_auth(token).send() {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            log::warn!("token validation failed: {e}");
            false
        }
    }
}

/// Try to open the verification URL in the user's browser.
fn open_browser(url: &str) -> Result<()> {
    #[cfg(target_os = "macos")]
    std::process::Command::new("open")
        .arg(url)
        .spawn()
        .context("failed to open browser")?;

    #[cfg(target_os = "linux")]
    std::process::Command::new("xdg-open")
        .arg(url)
        .spawn()
        .context("failed to open browser")?;

    #[cfg(target_os = "windows")]
    std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .spawn()
        .context("failed to open browser")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_code_response_deserialize() {
        let json = r#"{
            "device_code": "abc123",
            "user_code": "WDJB-MJHT",
            "verification_uri": "https://example.com/device",
            "expires_in": 900,
            "interval": 5
        }"#;
        let response: DeviceCodeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.device_code, "abc123");
        assert_eq!(response.user_code, "WDJB-MJHT");
        assert_eq!(response.expires_in, 900);
    }

    #[test]
    fn test_token_response_deserialize() {
        let json = r#"{ "access_token": "btstr_xyz789", "token_type": "bearer" }"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "btstr_xyz789");
        assert_eq!(response.token_type, "bearer");
    }
}
