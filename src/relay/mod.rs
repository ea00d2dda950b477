//! Browser relay: end-to-end encrypted duplex channel to each browser.
//!
//! The control server transports ciphertext only. Key agreement is X3DH
//! against the hub's published PreKey bundle ([`prekey`]); steady state is
//! a per-browser Double Ratchet ([`ratchet`]). Plaintext frames
//! ([`frames`]) carry terminal I/O, subscriptions, and tunnel HTTP;
//! ordered delivery and replay live in [`session`]; the Action-Cable
//! socket pump is in [`connection`].

pub mod connection;
pub mod frames;
pub mod prekey;
pub mod ratchet;
pub mod session;

pub use frames::{AgentSummary, FrameEnvelope, View, WireFrame, WIRE_VERSION};
pub use prekey::PreKeyStore;
pub use ratchet::{RatchetEnvelope, RatchetError, RatchetSession};
pub use session::{BrowserSession, ResumePlan};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

use crate::server::SessionKey;

/// Consecutive decrypt failures tolerated before a browser session is torn
/// down and forced to rekey.
const DECRYPT_FAILURE_LIMIT: u32 = 3;

/// Relay-level failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No session and the envelope carries no PreKey fields.
    #[error("no session for browser {0} and envelope is not a PreKey message")]
    NeedsPreKey(String),
    /// Cryptographic failure on one message.
    #[error(transparent)]
    Crypto(#[from] RatchetError),
    /// The session accumulated too many failures and was torn down.
    #[error("session for browser {0} torn down, rekey required")]
    SessionTornDown(String),
    /// Decrypted payload was not a valid frame.
    #[error("invalid frame: {0}")]
    BadFrame(#[from] serde_json::Error),
}

/// What the hub should do after a browser (re)subscribes.
#[derive(Debug)]
pub struct SubscribeOutcome {
    /// Replay envelopes to send, already encrypted and in order.
    pub replay: Vec<RatchetEnvelope>,
    /// True when the gap exceeded the buffer: the hub must send a
    /// `resync_full` directive plus a screen snapshot.
    pub needs_snapshot: bool,
}

/// Owns every browser session plus the hub's prekey material.
pub struct BrowserRelay {
    sessions: HashMap<String, BrowserSession>,
    prekeys: PreKeyStore,
    state_dir: PathBuf,
}

impl std::fmt::Debug for BrowserRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserRelay")
            .field("sessions", &self.sessions.len())
            .field("prekey_stock", &self.prekeys.stock())
            .finish_non_exhaustive()
    }
}

impl BrowserRelay {
    /// Load (or create) relay state under `{config_dir}/signal_state/`.
    pub fn new(config_dir: &Path) -> Result<Self> {
        let state_dir = config_dir.join("signal_state");
        fs::create_dir_all(&state_dir)?;

        let prekeys = PreKeyStore::load_or_generate(&state_dir.join("prekeys.json"))?;

        let mut relay = Self {
            sessions: HashMap::new(),
            prekeys,
            state_dir,
        };
        relay.load_persisted_sessions();
        Ok(relay)
    }

    /// Restore ratchet sessions persisted by a prior run. Sequence numbers
    /// restart at 1; browsers resync via `last_ack_seq` on reconnect.
    fn load_persisted_sessions(&mut self) {
        let Ok(entries) = fs::read_dir(&self.state_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name == "prekeys" || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<RatchetSession>(&c).ok())
            {
                Some(ratchet) => {
                    log::info!("restored ratchet session for browser {}", name);
                    self.sessions
                        .insert(name.to_string(), BrowserSession::new(name.to_string(), ratchet));
                }
                None => log::warn!("unreadable ratchet state at {}", path.display()),
            }
        }
    }

    fn session_path(&self, browser_id: &str) -> PathBuf {
        self.state_dir.join(format!("{browser_id}.json"))
    }

    fn persist_session(&self, browser_id: &str) {
        let Some(session) = self.sessions.get(browser_id) else {
            return;
        };
        match serde_json::to_string(&session.ratchet) {
            Ok(json) => {
                if let Err(e) = fs::write(self.session_path(browser_id), json) {
                    log::warn!("failed to persist session {}: {}", browser_id, e);
                }
            }
            Err(e) => log::warn!("failed to serialize session {}: {}", browser_id, e),
        }
    }

    /// The publishable PreKey bundle.
    #[must_use]
    pub fn bundle(&self) -> serde_json::Value {
        self.prekeys.bundle()
    }

    /// Bundle identifier for the connection-URL fragment.
    #[must_use]
    pub fn bundle_id(&self) -> String {
        self.prekeys.bundle_id()
    }

    /// True when one-time prekey stock is low and the bundle should be
    /// refilled and republished.
    #[must_use]
    pub fn needs_republish(&self) -> bool {
        self.prekeys.needs_refill()
    }

    /// Refill one-time prekeys, persist, and return the fresh bundle.
    pub fn refill_bundle(&mut self) -> Result<serde_json::Value> {
        self.prekeys.refill();
        self.prekeys
            .save(&self.state_dir.join("prekeys.json"))
            .context("persist prekeys")?;
        Ok(self.prekeys.bundle())
    }

    /// Connected browser ids.
    #[must_use]
    pub fn browser_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Mutable access to one session.
    pub fn session_mut(&mut self, browser_id: &str) -> Option<&mut BrowserSession> {
        self.sessions.get_mut(browser_id)
    }

    /// Decrypt an inbound envelope, establishing the session first when it
    /// is a PreKey message. Returns the plaintext frame.
    pub fn handle_envelope(
        &mut self,
        browser_id: &str,
        envelope: &RatchetEnvelope,
    ) -> Result<WireFrame, RelayError> {
        if !self.sessions.contains_key(browser_id) {
            let (Some(ik), otk_id) = (&envelope.ik, envelope.otk_id) else {
                return Err(RelayError::NeedsPreKey(browser_id.to_string()));
            };
            let shared = self.prekeys.establish(ik, &envelope.dh, otk_id)?;
            let _ = self.prekeys.save(&self.state_dir.join("prekeys.json"));
            let ratchet = RatchetSession::new(&shared, false)?;
            log::info!("established ratchet session for browser {}", browser_id);
            self.sessions.insert(
                browser_id.to_string(),
                BrowserSession::new(browser_id.to_string(), ratchet),
            );
        }

        let session = self
            .sessions
            .get_mut(browser_id)
            .expect("session inserted above");

        match session.ratchet.decrypt(envelope) {
            Ok(plaintext) => {
                session.decrypt_failures = 0;
                self.persist_session(browser_id);
                let frame = FrameEnvelope::from_bytes(&plaintext)?;
                Ok(frame.frame)
            }
            Err(e) => {
                session.decrypt_failures += 1;
                let failures = session.decrypt_failures;
                if failures >= DECRYPT_FAILURE_LIMIT {
                    log::warn!(
                        "browser {} hit {} decrypt failures, tearing session down",
                        browser_id,
                        failures
                    );
                    self.remove_session(browser_id);
                    return Err(RelayError::SessionTornDown(browser_id.to_string()));
                }
                Err(RelayError::Crypto(e))
            }
        }
    }

    /// Encrypt an arbitrary frame for one browser.
    pub fn encrypt_frame(
        &mut self,
        browser_id: &str,
        frame: &WireFrame,
    ) -> Result<RatchetEnvelope, RelayError> {
        let session = self
            .sessions
            .get_mut(browser_id)
            .ok_or_else(|| RelayError::NeedsPreKey(browser_id.to_string()))?;
        let plaintext = FrameEnvelope::new(frame.clone()).to_bytes()?;
        let envelope = session.ratchet.encrypt(&plaintext)?;
        self.persist_session(browser_id);
        Ok(envelope)
    }

    /// Build, sequence, buffer, and encrypt a terminal-output frame.
    ///
    /// Returns `None` when suppression applies (unchanged screen hash and
    /// the browser is not in raw mode).
    pub fn make_terminal_output(
        &mut self,
        browser_id: &str,
        agent: &SessionKey,
        view: View,
        screen_hash: u64,
        bytes: &[u8],
    ) -> Result<Option<RatchetEnvelope>, RelayError> {
        let session = self
            .sessions
            .get_mut(browser_id)
            .ok_or_else(|| RelayError::NeedsPreKey(browser_id.to_string()))?;

        if !session.should_emit(agent, view, screen_hash) {
            return Ok(None);
        }

        let seq = session.next_seq();
        let frame = WireFrame::TerminalOutput {
            seq,
            agent: agent.to_string(),
            view,
            bytes_b64: BASE64.encode(bytes),
        };
        let plaintext = FrameEnvelope::new(frame).to_bytes()?;
        session.record_outbound(seq, plaintext.clone());

        let envelope = session.ratchet.encrypt(&plaintext)?;
        self.persist_session(browser_id);
        Ok(Some(envelope))
    }

    /// Handle a browser (re)subscription: record the subscription, then
    /// either replay the missed frames or demand a snapshot.
    pub fn handle_subscribe(
        &mut self,
        browser_id: &str,
        agent: SessionKey,
        view: View,
        last_ack_seq: u64,
        raw_mode: bool,
    ) -> Result<SubscribeOutcome, RelayError> {
        let session = self
            .sessions
            .get_mut(browser_id)
            .ok_or_else(|| RelayError::NeedsPreKey(browser_id.to_string()))?;

        session.subscribe(agent, view, raw_mode);
        session.apply_ack(last_ack_seq);

        match session.plan_resume(last_ack_seq) {
            ResumePlan::Replay(frames) => {
                let mut replay = Vec::with_capacity(frames.len());
                for plaintext in frames {
                    replay.push(session.ratchet.encrypt(&plaintext)?);
                }
                self.persist_session(browser_id);
                Ok(SubscribeOutcome {
                    replay,
                    needs_snapshot: false,
                })
            }
            ResumePlan::ResyncFull => Ok(SubscribeOutcome {
                replay: Vec::new(),
                needs_snapshot: true,
            }),
        }
    }

    /// Apply a browser ack to its replay buffer.
    pub fn handle_ack(&mut self, browser_id: &str, seq: u64) {
        if let Some(session) = self.sessions.get_mut(browser_id) {
            session.apply_ack(seq);
        }
    }

    /// Tear a session down (crypto failure or browser disconnect).
    pub fn remove_session(&mut self, browser_id: &str) {
        self.sessions.remove(browser_id);
        let _ = fs::remove_file(self.session_path(browser_id));
    }

    /// Browsers currently subscribed to `agent`.
    #[must_use]
    pub fn subscribers_of(&self, agent: &SessionKey) -> Vec<(String, View)> {
        self.sessions
            .values()
            .filter_map(|s| {
                s.subscribed_agent
                    .as_ref()
                    .filter(|a| *a == agent)
                    .map(|_| (s.browser_id.clone(), s.subscribed_view))
            })
            .collect()
    }
}

/// Compose the pairing URL a browser opens: the bundle id rides in the
/// fragment, which never reaches the server.
#[must_use]
pub fn connection_url(server_url: &str, hub_identifier: &str, bundle_id: &str) -> String {
    format!("{server_url}/connect/{hub_identifier}#bundle={bundle_id}")
}

/// Persist the current connection URL for `get-connection-url`.
pub fn write_connection_url(config_dir: &Path, url: &str) -> Result<()> {
    fs::write(config_dir.join("connection.url"), url).context("write connection.url")
}

/// Read the persisted connection URL, if the hub has generated one.
pub fn read_connection_url(config_dir: &Path) -> Result<Option<String>> {
    let path = config_dir.join("connection.url");
    if !path.exists() {
        return Ok(None);
    }
    let url = fs::read_to_string(&path).context("read connection.url")?;
    let url = url.trim().to_string();
    Ok(if url.is_empty() { None } else { Some(url) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Browser-side helper: run X3DH as the initiator against a bundle.
    /// The X3DH ephemeral seeds the ratchet's DH keypair so the first
    /// header key matches the key agreement, like a real browser.
    fn browser_connect(bundle: &serde_json::Value) -> (RatchetSession, String, u32) {
        use hkdf::Hkdf;
        use rand::RngCore;
        use sha2::Sha256;

        let mut ik_priv = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ik_priv);
        let ik_pub =
            x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(ik_priv)).to_bytes();

        let mut ek_priv = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ek_priv);

        let hub_identity =
            ratchet::decode_key(bundle["identity_key"].as_str().unwrap()).unwrap();
        let hub_spk = ratchet::decode_key(bundle["signed_prekey"].as_str().unwrap()).unwrap();
        let otk = &bundle["one_time_prekeys"][0];
        let otk_id = otk["id"].as_u64().unwrap() as u32;
        let otk_pub = ratchet::decode_key(otk["key"].as_str().unwrap()).unwrap();

        let mut ikm = Vec::new();
        ikm.extend_from_slice(&[0xFFu8; 32]);
        ikm.extend_from_slice(&ratchet::diffie_hellman(&ik_priv, &hub_spk));
        ikm.extend_from_slice(&ratchet::diffie_hellman(&ek_priv, &hub_identity));
        ikm.extend_from_slice(&ratchet::diffie_hellman(&ek_priv, &hub_spk));
        ikm.extend_from_slice(&ratchet::diffie_hellman(&ek_priv, &otk_pub));
        let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
        let mut shared = [0u8; 32];
        hk.expand(b"x3dh", &mut shared).unwrap();

        let ratchet = RatchetSession::new_initiator_with_keypair(&shared, ek_priv).unwrap();
        (ratchet, BASE64.encode(ik_pub), otk_id)
    }

    fn first_prekey_envelope(
        browser: &mut RatchetSession,
        ik_b64: &str,
        otk_id: u32,
        frame: &WireFrame,
    ) -> RatchetEnvelope {
        let plaintext = FrameEnvelope::new(frame.clone()).to_bytes().unwrap();
        let mut envelope = browser.encrypt(&plaintext).unwrap();
        envelope.ik = Some(ik_b64.to_string());
        envelope.otk_id = Some(otk_id);
        envelope
    }

    #[test]
    fn test_prekey_message_establishes_session() {
        let dir = TempDir::new().unwrap();
        let mut relay = BrowserRelay::new(dir.path()).unwrap();
        let bundle = relay.bundle();

        let (mut browser, ik, otk_id) = browser_connect(&bundle);

        let envelope = first_prekey_envelope(&mut browser, &ik, otk_id, &WireFrame::Ping);
        let frame = relay.handle_envelope("browser-a", &envelope).unwrap();
        assert_eq!(frame, WireFrame::Ping);

        // Steady state both ways.
        let out = relay.encrypt_frame("browser-a", &WireFrame::Pong).unwrap();
        let plaintext = browser.decrypt(&out).unwrap();
        let parsed = FrameEnvelope::from_bytes(&plaintext).unwrap();
        assert_eq!(parsed.frame, WireFrame::Pong);
    }

    #[test]
    fn test_terminal_output_seq_and_suppression_through_relay() {
        let dir = TempDir::new().unwrap();
        let mut relay = BrowserRelay::new(dir.path()).unwrap();
        let bundle = relay.bundle();
        let (mut browser, ik, otk_id) = browser_connect(&bundle);

        let hello = first_prekey_envelope(&mut browser, &ik, otk_id, &WireFrame::Ping);
        relay.handle_envelope("b1", &hello).unwrap();

        let agent = SessionKey::from_raw("acme-demo-42");
        let first = relay
            .make_terminal_output("b1", &agent, View::Main, 100, b"one")
            .unwrap();
        assert!(first.is_some());

        // Unchanged hash is suppressed.
        let suppressed = relay
            .make_terminal_output("b1", &agent, View::Main, 100, b"one")
            .unwrap();
        assert!(suppressed.is_none());

        // Changed hash goes out with the next consecutive seq.
        let second = relay
            .make_terminal_output("b1", &agent, View::Main, 101, b"two")
            .unwrap()
            .unwrap();
        let plaintext = browser.decrypt(&second).unwrap();
        let parsed = FrameEnvelope::from_bytes(&plaintext).unwrap();
        match parsed.frame {
            WireFrame::TerminalOutput { seq, .. } => assert_eq!(seq, 2),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_envelope_without_prekey_fields_rejected_for_new_browser() {
        let dir = TempDir::new().unwrap();
        let mut relay = BrowserRelay::new(dir.path()).unwrap();

        let mut other = RatchetSession::new(&[1u8; 32], true).unwrap();
        let envelope = other
            .encrypt(&FrameEnvelope::new(WireFrame::Ping).to_bytes().unwrap())
            .unwrap();
        let err = relay.handle_envelope("stranger", &envelope).unwrap_err();
        assert!(matches!(err, RelayError::NeedsPreKey(_)));
    }

    #[test]
    fn test_connection_url_keeps_bundle_in_fragment() {
        let url = connection_url("https://botster.dev", "hub123", "bundleXYZ");
        assert_eq!(url, "https://botster.dev/connect/hub123#bundle=bundleXYZ");
        let (server_side, fragment) = url.split_once('#').unwrap();
        assert!(!server_side.contains("bundleXYZ"));
        assert_eq!(fragment, "bundle=bundleXYZ");
    }

    #[test]
    fn test_connection_url_persistence() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_connection_url(dir.path()).unwrap(), None);
        write_connection_url(dir.path(), "https://x/connect/h#bundle=b").unwrap();
        assert_eq!(
            read_connection_url(dir.path()).unwrap().as_deref(),
            Some("https://x/connect/h#bundle=b")
        );
    }
}
