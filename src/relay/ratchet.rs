//! Double Ratchet session for browser E2E encryption.
//!
//! Signal-style construction: HKDF-SHA256 key derivation, X25519 for the DH
//! ratchet, AES-256-CBC + truncated HMAC-SHA256 for authenticated
//! encryption. Every message key is derived from an advancing chain and
//! used exactly once; a DH step occurs whenever a new peer public key shows
//! up in a header. Out-of-order messages within a chain are served from a
//! bounded skipped-key buffer.
//!
//! Reference: https://signal.org/docs/specifications/doubleratchet/

use std::collections::VecDeque;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::RATCHET_SKIPPED_KEYS_CAP;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Encryption/decryption failures. Per-message failures drop that message;
/// the session continues.
#[derive(Debug, Error)]
pub enum RatchetError {
    /// Base64 or length problem in the envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// MAC mismatch - message tampered or wrong key.
    #[error("MAC verification failed")]
    BadMac,
    /// Chain not yet established for this direction.
    #[error("ratchet chain not initialized")]
    NoChain,
    /// AES padding/decrypt failure.
    #[error("decryption failed: {0}")]
    Decrypt(String),
    /// Key derivation failure.
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

/// Encrypted envelope (protocol v2).
///
/// `dh` is the sender's current ratchet public key, `pn` the previous chain
/// length, `n` the message number in the current chain. PreKey messages
/// additionally carry `otk_id` and `ik` to establish the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetEnvelope {
    /// Protocol version (2 for Double Ratchet).
    pub v: u8,
    /// Sender's current DH public key, base64 (32 bytes).
    pub dh: String,
    /// Number of messages in the previous sending chain.
    pub pn: u32,
    /// Message number in the current sending chain.
    pub n: u32,
    /// Base64 ciphertext.
    pub ct: String,
    /// Base64 truncated MAC (8 bytes).
    pub mac: String,
    /// One-time prekey id consumed by this PreKey message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otk_id: Option<u32>,
    /// Sender's identity key, base64 (PreKey messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ik: Option<String>,
}

/// A message key saved for an out-of-order message.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct SkippedKey {
    /// Chain identifier: the peer DH public key that opened the chain.
    dh: [u8; 32],
    /// Message number within that chain.
    n: u32,
    /// Derived message key.
    key: [u8; 32],
}

/// Double Ratchet session state for one browser.
///
/// Single-writer: owned by the relay, never shared across browsers.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetSession {
    /// Root key for deriving chain keys.
    root_key: [u8; 32],
    /// Current sending chain key.
    send_chain_key: Option<[u8; 32]>,
    /// Current receiving chain key.
    recv_chain_key: Option<[u8; 32]>,
    /// Our DH private key.
    dh_private_key: [u8; 32],
    /// Our DH public key.
    #[zeroize(skip)]
    dh_public_key: [u8; 32],
    /// Peer's DH public key, once seen.
    #[zeroize(skip)]
    peer_public_key: Option<[u8; 32]>,
    /// Send message counter within the current chain.
    #[zeroize(skip)]
    send_count: u32,
    /// Receive message counter within the current chain.
    #[zeroize(skip)]
    recv_count: u32,
    /// Length of the previous sending chain (for headers).
    #[zeroize(skip)]
    prev_chain_length: u32,
    /// Whether this party initiated the session. The hub is the responder:
    /// browsers initiate with a PreKey message.
    #[zeroize(skip)]
    is_initiator: bool,
    /// Skipped message keys, oldest dropped beyond the cap. Entries
    /// zeroize individually on removal.
    #[zeroize(skip)]
    skipped: VecDeque<SkippedKey>,
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("skipped", &self.skipped.len())
            .field("is_initiator", &self.is_initiator)
            .finish_non_exhaustive()
    }
}

impl RatchetSession {
    /// Create a session from the X3DH shared secret.
    ///
    /// `is_initiator` is true for the party that sent the PreKey message
    /// (the browser); the hub constructs its side with `false`.
    pub fn new(shared_secret: &[u8; 32], is_initiator: bool) -> Result<Self, RatchetError> {
        let initial = kdf(shared_secret, &[0u8; 32], b"ratchet-init", 64)?;

        let mut dh_private_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut dh_private_key);
        let dh_public_key =
            x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(dh_private_key))
                .to_bytes();

        let mut root_key = [0u8; 32];
        root_key.copy_from_slice(&initial[..32]);

        let mut session = Self {
            root_key,
            send_chain_key: None,
            recv_chain_key: None,
            dh_private_key,
            dh_public_key,
            peer_public_key: None,
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            is_initiator,
            skipped: VecDeque::new(),
        };

        // Both parties derive the same first chain key; the initiator sends
        // with it, the responder receives with it.
        let chain_init = kdf(&session.root_key, &[0u8; 32], b"chain-init", 64)?;
        session.root_key.copy_from_slice(&chain_init[..32]);

        let mut chain_key = [0u8; 32];
        chain_key.copy_from_slice(&chain_init[32..64]);

        if is_initiator {
            session.send_chain_key = Some(chain_key);
        } else {
            session.recv_chain_key = Some(chain_key);
        }

        Ok(session)
    }

    /// Initiator constructor seeded with an explicit DH keypair.
    ///
    /// The initiator's first header key must be the X3DH ephemeral - the
    /// responder reads it from the PreKey envelope for both the key
    /// agreement and the ratchet. Browsers use this shape; the hub's tests
    /// use it to model the browser side.
    pub fn new_initiator_with_keypair(
        shared_secret: &[u8; 32],
        dh_private_key: [u8; 32],
    ) -> Result<Self, RatchetError> {
        let mut session = Self::new(shared_secret, true)?;
        session.dh_private_key = dh_private_key;
        session.dh_public_key =
            x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(dh_private_key))
                .to_bytes();
        Ok(session)
    }

    /// Our current DH public key.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.dh_public_key
    }

    /// Encrypt a plaintext payload, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetEnvelope, RatchetError> {
        let message_key = self.advance_send_chain()?;
        let (enc_key, mac_key, iv) = derive_message_material(&message_key)?;

        let cipher = Aes256CbcEnc::new(&enc_key.into(), &iv.into());
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mac = compute_mac(&mac_key, &self.dh_public_key, &ciphertext);

        Ok(RatchetEnvelope {
            v: 2,
            dh: BASE64.encode(self.dh_public_key),
            pn: self.prev_chain_length,
            n: self.send_count - 1,
            ct: BASE64.encode(&ciphertext),
            mac: BASE64.encode(&mac[..8]),
            otk_id: None,
            ik: None,
        })
    }

    /// Decrypt an envelope, performing DH ratchet steps and out-of-order
    /// buffering as needed.
    pub fn decrypt(&mut self, envelope: &RatchetEnvelope) -> Result<Vec<u8>, RatchetError> {
        let peer_dh = decode_key(&envelope.dh)?;
        let ciphertext = BASE64
            .decode(&envelope.ct)
            .map_err(|e| RatchetError::Malformed(format!("ciphertext: {e}")))?;
        let mac_bytes = BASE64
            .decode(&envelope.mac)
            .map_err(|e| RatchetError::Malformed(format!("mac: {e}")))?;

        // A saved skipped key serves this message without touching chains.
        if let Some(key) = self.take_skipped(&peer_dh, envelope.n) {
            return open_message(&key, &peer_dh, &ciphertext, &mac_bytes);
        }

        let needs_ratchet = self.peer_public_key.map(|pk| pk != peer_dh).unwrap_or(true);

        if needs_ratchet {
            // Save keys for messages still in flight on the old chain.
            if self.recv_chain_key.is_some() {
                if let Some(old_dh) = self.peer_public_key {
                    self.skip_recv_keys(&old_dh, envelope.pn)?;
                }
            }

            if !self.is_initiator
                && self.peer_public_key.is_none()
                && self.recv_chain_key.is_some()
            {
                // First message from the initiator: the receiving chain came
                // from session init, only the sending side needs a DH step.
                self.peer_public_key = Some(peer_dh);

                rand::thread_rng().fill_bytes(&mut self.dh_private_key);
                self.dh_public_key = x25519_dalek::PublicKey::from(
                    &x25519_dalek::StaticSecret::from(self.dh_private_key),
                )
                .to_bytes();

                let dh = diffie_hellman(&self.dh_private_key, &peer_dh);
                let output = kdf(&dh, &self.root_key, b"ratchet", 64)?;
                self.root_key.copy_from_slice(&output[..32]);
                let mut send_chain = [0u8; 32];
                send_chain.copy_from_slice(&output[32..64]);
                self.send_chain_key = Some(send_chain);
                self.send_count = 0;
            } else {
                self.dh_ratchet(&peer_dh)?;
            }
        }

        // Skip ahead to the message number, banking intermediate keys.
        self.skip_recv_keys(&peer_dh, envelope.n)?;

        let message_key = self.advance_recv_chain()?;
        open_message(&message_key, &peer_dh, &ciphertext, &mac_bytes)
    }

    /// Advance the sending chain and return the next message key.
    fn advance_send_chain(&mut self) -> Result<[u8; 32], RatchetError> {
        let chain_key = self.send_chain_key.as_ref().ok_or(RatchetError::NoChain)?;
        let output = kdf(chain_key, &[0u8; 32], b"chain", 64)?;

        let mut new_chain = [0u8; 32];
        new_chain.copy_from_slice(&output[..32]);
        self.send_chain_key = Some(new_chain);

        let mut message_key = [0u8; 32];
        message_key.copy_from_slice(&output[32..64]);

        self.send_count += 1;
        Ok(message_key)
    }

    /// Advance the receiving chain and return the next message key.
    fn advance_recv_chain(&mut self) -> Result<[u8; 32], RatchetError> {
        let chain_key = self.recv_chain_key.as_ref().ok_or(RatchetError::NoChain)?;
        let output = kdf(chain_key, &[0u8; 32], b"chain", 64)?;

        let mut new_chain = [0u8; 32];
        new_chain.copy_from_slice(&output[..32]);
        self.recv_chain_key = Some(new_chain);

        let mut message_key = [0u8; 32];
        message_key.copy_from_slice(&output[32..64]);

        self.recv_count += 1;
        Ok(message_key)
    }

    /// DH ratchet step on observing a new peer public key.
    fn dh_ratchet(&mut self, peer_public_key: &[u8; 32]) -> Result<(), RatchetError> {
        self.peer_public_key = Some(*peer_public_key);

        // DH with current private key → new receiving chain.
        let dh1 = diffie_hellman(&self.dh_private_key, peer_public_key);
        let output1 = kdf(&dh1, &self.root_key, b"ratchet", 64)?;
        self.root_key.copy_from_slice(&output1[..32]);
        let mut recv_chain = [0u8; 32];
        recv_chain.copy_from_slice(&output1[32..64]);
        self.recv_chain_key = Some(recv_chain);
        self.recv_count = 0;

        self.prev_chain_length = self.send_count;

        // Fresh keypair, DH again → new sending chain.
        rand::thread_rng().fill_bytes(&mut self.dh_private_key);
        self.dh_public_key =
            x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(self.dh_private_key))
                .to_bytes();

        let dh2 = diffie_hellman(&self.dh_private_key, peer_public_key);
        let output2 = kdf(&dh2, &self.root_key, b"ratchet", 64)?;
        self.root_key.copy_from_slice(&output2[..32]);
        let mut send_chain = [0u8; 32];
        send_chain.copy_from_slice(&output2[32..64]);
        self.send_chain_key = Some(send_chain);
        self.send_count = 0;

        Ok(())
    }

    /// Derive and bank receiving keys until `recv_count` reaches `until`.
    ///
    /// The buffer is capped; the oldest banked keys are dropped beyond it,
    /// which makes messages older than the cap undecryptable by design.
    fn skip_recv_keys(&mut self, chain_dh: &[u8; 32], until: u32) -> Result<(), RatchetError> {
        if self.recv_chain_key.is_none() {
            return Ok(());
        }
        while self.recv_count < until {
            let n = self.recv_count;
            let key = self.advance_recv_chain()?;
            self.skipped.push_back(SkippedKey {
                dh: *chain_dh,
                n,
                key,
            });
            if self.skipped.len() > RATCHET_SKIPPED_KEYS_CAP {
                self.skipped.pop_front();
            }
        }
        Ok(())
    }

    /// Remove and return a banked key for (chain, n) if present.
    fn take_skipped(&mut self, chain_dh: &[u8; 32], n: u32) -> Option<[u8; 32]> {
        let idx = self
            .skipped
            .iter()
            .position(|s| s.dh == *chain_dh && s.n == n)?;
        self.skipped.remove(idx).map(|s| s.key)
    }

    /// Number of banked skipped keys (diagnostics).
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }
}

/// HKDF-SHA256 derivation.
fn kdf(input_key: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>, RatchetError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input_key);
    let mut output = vec![0u8; length];
    hk.expand(info, &mut output)
        .map_err(|e| RatchetError::Kdf(e.to_string()))?;
    Ok(output)
}

/// Derive (encryption key, MAC key, IV) from a message key.
fn derive_message_material(
    message_key: &[u8; 32],
) -> Result<([u8; 32], [u8; 32], [u8; 16]), RatchetError> {
    let derived = kdf(message_key, &[0u8; 32], b"message", 80)?;
    let enc_key: [u8; 32] = derived[..32].try_into().expect("32 bytes");
    let mac_key: [u8; 32] = derived[32..64].try_into().expect("32 bytes");
    let iv: [u8; 16] = derived[64..80].try_into().expect("16 bytes");
    Ok((enc_key, mac_key, iv))
}

/// HMAC-SHA256 over `sender_dh_pub || ciphertext`.
fn compute_mac(mac_key: &[u8; 32], dh_pub: &[u8; 32], ciphertext: &[u8]) -> Vec<u8> {
    let mut hmac = HmacSha256::new_from_slice(mac_key).expect("HMAC accepts any key size");
    hmac.update(dh_pub);
    hmac.update(ciphertext);
    hmac.finalize().into_bytes().to_vec()
}

/// Verify the truncated MAC and decrypt.
fn open_message(
    message_key: &[u8; 32],
    peer_dh: &[u8; 32],
    ciphertext: &[u8],
    mac_bytes: &[u8],
) -> Result<Vec<u8>, RatchetError> {
    let (enc_key, mac_key, iv) = derive_message_material(message_key)?;

    let expected = compute_mac(&mac_key, peer_dh, ciphertext);
    if mac_bytes.len() != 8 || !constant_time_eq(&expected[..8], mac_bytes) {
        return Err(RatchetError::BadMac);
    }

    let cipher = Aes256CbcDec::new(&enc_key.into(), &iv.into());
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| RatchetError::Decrypt(e.to_string()))
}

/// X25519 shared secret between a raw private and public key.
pub fn diffie_hellman(private: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    let secret = x25519_dalek::StaticSecret::from(*private);
    let peer = x25519_dalek::PublicKey::from(*public);
    secret.diffie_hellman(&peer).to_bytes()
}

/// Decode a base64 32-byte key.
pub fn decode_key(encoded: &str) -> Result<[u8; 32], RatchetError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| RatchetError::Malformed(format!("key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| RatchetError::Malformed("key length".to_string()))
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
