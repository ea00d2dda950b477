//! X3DH prekey bundles for session establishment.
//!
//! The hub publishes a bundle (identity key, signed prekey, one-time
//! prekeys) to the control server. A browser fetches it, performs the X3DH
//! exchange, and sends its first envelope as a PreKey message carrying its
//! identity key and the consumed one-time prekey id; the envelope's ratchet
//! key doubles as the X3DH ephemeral. Each one-time prekey is consumed at
//! most once, and the bundle is republished when stock runs low.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use super::ratchet::{decode_key, diffie_hellman, RatchetError};
use crate::constants::{PREKEY_BATCH, PREKEY_REFILL_THRESHOLD};

/// Long-lived and one-time keys backing the hub's published bundle.
///
/// Persisted under `signal_state/prekeys.json` so browser sessions survive
/// hub restarts.
#[derive(Serialize, Deserialize)]
pub struct PreKeyStore {
    /// X25519 identity private key.
    identity_private: [u8; 32],
    /// X25519 identity public key.
    identity_public: [u8; 32],
    /// Ed25519 seed used to sign the signed prekey.
    signing_seed: [u8; 32],
    /// Signed prekey private half.
    spk_private: [u8; 32],
    /// Signed prekey public half.
    spk_public: [u8; 32],
    /// One-time prekey private halves by id.
    one_time: HashMap<u32, [u8; 32]>,
    /// Next id to assign.
    next_otk_id: u32,
}

impl std::fmt::Debug for PreKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyStore")
            .field("one_time_stock", &self.one_time.len())
            .field("next_otk_id", &self.next_otk_id)
            .finish_non_exhaustive()
    }
}

impl Drop for PreKeyStore {
    fn drop(&mut self) {
        self.identity_private.zeroize();
        self.signing_seed.zeroize();
        self.spk_private.zeroize();
        for key in self.one_time.values_mut() {
            key.zeroize();
        }
    }
}

fn random_keypair() -> ([u8; 32], [u8; 32]) {
    let mut private = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private);
    let public =
        x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(private)).to_bytes();
    (private, public)
}

impl PreKeyStore {
    /// Generate a fresh store with a full batch of one-time prekeys.
    #[must_use]
    pub fn generate() -> Self {
        let (identity_private, identity_public) = random_keypair();
        let (spk_private, spk_public) = random_keypair();

        let mut signing_seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut signing_seed);

        let mut store = Self {
            identity_private,
            identity_public,
            signing_seed,
            spk_private,
            spk_public,
            one_time: HashMap::new(),
            next_otk_id: 1,
        };
        store.refill();
        store
    }

    /// Load from `path`, generating (and saving) a fresh store if absent or
    /// unreadable.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("read prekey store")?;
            if let Ok(store) = serde_json::from_str::<Self>(&content) {
                return Ok(store);
            }
            log::warn!("prekey store at {} unreadable, regenerating", path.display());
        }
        let store = Self::generate();
        store.save(path)?;
        Ok(store)
    }

    /// Persist to `path` (0600 on unix).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Short identifier for this bundle, embedded in the connection URL
    /// fragment so the browser can verify it fetched the matching bundle.
    #[must_use]
    pub fn bundle_id(&self) -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let digest = <Sha256 as sha2::Digest>::digest(self.identity_public);
        URL_SAFE_NO_PAD.encode(&digest[..12])
    }

    /// The publishable bundle: identity key, signed prekey + signature, and
    /// the public halves of all unconsumed one-time prekeys.
    #[must_use]
    pub fn bundle(&self) -> serde_json::Value {
        let signing_key = SigningKey::from_bytes(&self.signing_seed);
        let signature = signing_key.sign(&self.spk_public);

        let mut one_time: Vec<serde_json::Value> = self
            .one_time
            .iter()
            .map(|(id, private)| {
                let public = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(
                    *private,
                ))
                .to_bytes();
                serde_json::json!({ "id": id, "key": BASE64.encode(public) })
            })
            .collect();
        one_time.sort_by_key(|v| v["id"].as_u64());

        serde_json::json!({
            "bundle_id": self.bundle_id(),
            "identity_key": BASE64.encode(self.identity_public),
            "signing_key": BASE64.encode(signing_key.verifying_key().to_bytes()),
            "signed_prekey": BASE64.encode(self.spk_public),
            "signed_prekey_signature": BASE64.encode(signature.to_bytes()),
            "one_time_prekeys": one_time,
        })
    }

    /// Unconsumed one-time prekeys remaining.
    #[must_use]
    pub fn stock(&self) -> usize {
        self.one_time.len()
    }

    /// True when the bundle should be republished with fresh keys.
    #[must_use]
    pub fn needs_refill(&self) -> bool {
        self.stock() < PREKEY_REFILL_THRESHOLD
    }

    /// Top the one-time stock back up to a full batch.
    pub fn refill(&mut self) {
        while self.one_time.len() < PREKEY_BATCH {
            let (private, _) = random_keypair();
            self.one_time.insert(self.next_otk_id, private);
            self.next_otk_id += 1;
        }
    }

    /// Run the responder side of X3DH for an incoming PreKey message.
    ///
    /// `ik` is the browser's identity key, `ek` the ephemeral (the
    /// envelope's ratchet key), `otk_id` the consumed one-time prekey.
    /// Returns the 32-byte shared secret seeding the Double Ratchet.
    pub fn establish(
        &mut self,
        ik: &str,
        ek: &str,
        otk_id: Option<u32>,
    ) -> Result<[u8; 32], RatchetError> {
        let browser_identity = decode_key(ik)?;
        let ephemeral = decode_key(ek)?;

        let dh1 = diffie_hellman(&self.spk_private, &browser_identity);
        let dh2 = diffie_hellman(&self.identity_private, &ephemeral);
        let dh3 = diffie_hellman(&self.spk_private, &ephemeral);

        // 0xFF padding prefix per the X3DH spec, then the concatenated DH
        // outputs.
        let mut ikm = Vec::with_capacity(32 * 5);
        ikm.extend_from_slice(&[0xFFu8; 32]);
        ikm.extend_from_slice(&dh1);
        ikm.extend_from_slice(&dh2);
        ikm.extend_from_slice(&dh3);

        if let Some(id) = otk_id {
            let otk_private = self
                .one_time
                .remove(&id)
                .ok_or_else(|| RatchetError::Malformed(format!("unknown one-time prekey {id}")))?;
            let dh4 = diffie_hellman(&otk_private, &ephemeral);
            ikm.extend_from_slice(&dh4);
        }

        let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
        let mut shared = [0u8; 32];
        hk.expand(b"x3dh", &mut shared)
            .map_err(|e| RatchetError::Kdf(e.to_string()))?;
        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_has_full_stock() {
        let store = PreKeyStore::generate();
        assert_eq!(store.stock(), PREKEY_BATCH);
        assert!(!store.needs_refill());
    }

    #[test]
    fn test_bundle_shape() {
        let store = PreKeyStore::generate();
        let bundle = store.bundle();
        assert!(bundle["identity_key"].as_str().is_some());
        assert!(bundle["signed_prekey"].as_str().is_some());
        assert!(bundle["signed_prekey_signature"].as_str().is_some());
        assert_eq!(
            bundle["one_time_prekeys"].as_array().unwrap().len(),
            PREKEY_BATCH
        );
        assert_eq!(bundle["bundle_id"].as_str().unwrap(), store.bundle_id());
    }

    #[test]
    fn test_signed_prekey_signature_verifies() {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let store = PreKeyStore::generate();
        let bundle = store.bundle();

        let verifying_bytes: [u8; 32] = BASE64
            .decode(bundle["signing_key"].as_str().unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        let verifying = VerifyingKey::from_bytes(&verifying_bytes).unwrap();

        let spk = BASE64
            .decode(bundle["signed_prekey"].as_str().unwrap())
            .unwrap();
        let sig_bytes: [u8; 64] = BASE64
            .decode(bundle["signed_prekey_signature"].as_str().unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        let signature = Signature::from_bytes(&sig_bytes);

        assert!(verifying.verify(&spk, &signature).is_ok());
    }

    #[test]
    fn test_establish_consumes_one_time_prekey() {
        let mut store = PreKeyStore::generate();
        let bundle = store.bundle();
        let otk = &bundle["one_time_prekeys"][0];
        let otk_id = otk["id"].as_u64().unwrap() as u32;

        let (_, browser_ik_pub) = random_keypair();
        let (_, browser_ek_pub) = random_keypair();

        let before = store.stock();
        let shared = store
            .establish(
                &BASE64.encode(browser_ik_pub),
                &BASE64.encode(browser_ek_pub),
                Some(otk_id),
            )
            .unwrap();
        assert_eq!(shared.len(), 32);
        assert_eq!(store.stock(), before - 1);

        // Re-using the same id fails.
        let reused = store.establish(
            &BASE64.encode(browser_ik_pub),
            &BASE64.encode(browser_ek_pub),
            Some(otk_id),
        );
        assert!(reused.is_err());
    }

    #[test]
    fn test_x3dh_agrees_with_initiator_side() {
        // Browser-side computation of the same X3DH, checking both parties
        // derive one secret.
        let mut hub = PreKeyStore::generate();
        let bundle = hub.bundle();

        let (browser_ik_priv, browser_ik_pub) = random_keypair();
        let (browser_ek_priv, browser_ek_pub) = random_keypair();

        let hub_identity = decode_key(bundle["identity_key"].as_str().unwrap()).unwrap();
        let hub_spk = decode_key(bundle["signed_prekey"].as_str().unwrap()).unwrap();
        let otk = &bundle["one_time_prekeys"][0];
        let otk_id = otk["id"].as_u64().unwrap() as u32;
        let otk_pub = decode_key(otk["key"].as_str().unwrap()).unwrap();

        // Initiator: DH1=DH(IKb, SPKh), DH2=DH(EKb, IKh), DH3=DH(EKb, SPKh),
        // DH4=DH(EKb, OTKh).
        let mut ikm = Vec::new();
        ikm.extend_from_slice(&[0xFFu8; 32]);
        ikm.extend_from_slice(&diffie_hellman(&browser_ik_priv, &hub_spk));
        ikm.extend_from_slice(&diffie_hellman(&browser_ek_priv, &hub_identity));
        ikm.extend_from_slice(&diffie_hellman(&browser_ek_priv, &hub_spk));
        ikm.extend_from_slice(&diffie_hellman(&browser_ek_priv, &otk_pub));
        let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
        let mut browser_secret = [0u8; 32];
        hk.expand(b"x3dh", &mut browser_secret).unwrap();

        let hub_secret = hub
            .establish(
                &BASE64.encode(browser_ik_pub),
                &BASE64.encode(browser_ek_pub),
                Some(otk_id),
            )
            .unwrap();

        assert_eq!(browser_secret, hub_secret);
    }

    #[test]
    fn test_refill_after_consumption() {
        let mut store = PreKeyStore::generate();
        let ids: Vec<u32> = store.one_time.keys().copied().collect();
        for id in ids.iter().take(PREKEY_BATCH - PREKEY_REFILL_THRESHOLD + 1) {
            let (_, ik) = random_keypair();
            let (_, ek) = random_keypair();
            store
                .establish(&BASE64.encode(ik), &BASE64.encode(ek), Some(*id))
                .unwrap();
        }
        assert!(store.needs_refill());
        store.refill();
        assert_eq!(store.stock(), PREKEY_BATCH);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signal_state/prekeys.json");

        let store = PreKeyStore::load_or_generate(&path).unwrap();
        let bundle_id = store.bundle_id();
        drop(store);

        let restored = PreKeyStore::load_or_generate(&path).unwrap();
        assert_eq!(restored.bundle_id(), bundle_id);
    }
}
