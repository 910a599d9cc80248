//! Device identity and the long-lived key store.
//!
//! A device is known on the mesh by a random ten-digit [`PeerId`]. Its key
//! store holds an X25519 static secret used for session key agreement and an
//! Ed25519 signing key used to authenticate handshake offers. Both keys are
//! created once, on first use, and optionally persisted to a key file.

use crate::messaging::PeerId;
use crate::utils::{CryptoError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Length of an X25519 public key
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Number of digest bytes shown in a fingerprint
const FINGERPRINT_BYTES: usize = 8;

/// Human-comparable fingerprint of a public key: the first 8 bytes of its
/// SHA-256 digest as uppercase hex.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode_upper(&digest[..FINGERPRINT_BYTES])
}

/// Stable identity of this device on the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Numeric peer id, immutable for the lifetime of the device
    pub peer_id: PeerId,
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DeviceIdentity {
    /// Pick a fresh random ten-digit id with a non-zero leading digit
    pub fn generate() -> Self {
        let peer_id = PeerId(OsRng.gen_range(1_000_000_000..=9_999_999_999));
        Self {
            peer_id,
            created_at: chrono::Utc::now(),
        }
    }

    /// Load the identity stored at `path`, creating and saving one if absent
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let json = std::fs::read_to_string(path)?;
            return serde_json::from_str(&json).map_err(Into::into);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&identity)?)?;
        log::info!("Created device identity {}", identity.peer_id);
        Ok(identity)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id)
    }
}

struct KeyMaterial {
    agreement: StaticSecret,
    agreement_public: PublicKey,
    signing: SigningKey,
}

impl KeyMaterial {
    fn generate() -> Self {
        Self::from_parts(
            StaticSecret::random_from_rng(OsRng),
            SigningKey::generate(&mut OsRng),
        )
    }

    fn from_parts(agreement: StaticSecret, signing: SigningKey) -> Self {
        let agreement_public = PublicKey::from(&agreement);
        Self {
            agreement,
            agreement_public,
            signing,
        }
    }
}

/// On-disk form of the key store
#[derive(Serialize, Deserialize)]
struct StoredKeys {
    agreement_secret: String,
    signing_secret: String,
}

impl Drop for StoredKeys {
    fn drop(&mut self) {
        self.agreement_secret.zeroize();
        self.signing_secret.zeroize();
    }
}

/// Long-lived asymmetric keys of this device
pub struct IdentityKeyStore {
    path: Option<PathBuf>,
    keys: Mutex<Option<Arc<KeyMaterial>>>,
}

impl fmt::Debug for IdentityKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyStore")
            .field("path", &self.path)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

impl IdentityKeyStore {
    /// Key store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            path: None,
            keys: Mutex::new(None),
        }
    }

    /// Key store persisted at `path`. Nothing is read or written until the
    /// keys are first needed.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
            keys: Mutex::new(None),
        }
    }

    fn material(&self) -> Result<Arc<KeyMaterial>> {
        let mut slot = self.keys.lock();
        if let Some(keys) = slot.as_ref() {
            return Ok(keys.clone());
        }

        let keys = Arc::new(match &self.path {
            Some(path) if path.exists() => Self::load(path)?,
            Some(path) => {
                let keys = KeyMaterial::generate();
                Self::store(path, &keys)?;
                log::info!("Generated identity keys at {}", path.display());
                keys
            }
            None => KeyMaterial::generate(),
        });

        *slot = Some(keys.clone());
        Ok(keys)
    }

    fn decode_secret(field: &str, encoded: &str) -> Result<Zeroizing<[u8; 32]>> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(encoded, &mut bytes[..]).map_err(|e| CryptoError::KeyStore {
            reason: format!("{field}: {e}"),
        })?;
        Ok(bytes)
    }

    fn load(path: &Path) -> Result<KeyMaterial> {
        let json = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            CryptoError::KeyStore {
                reason: format!("{}: {e}", path.display()),
            }
        })?);
        let stored: StoredKeys = serde_json::from_str(&json).map_err(|e| CryptoError::KeyStore {
            reason: e.to_string(),
        })?;

        let agreement = Self::decode_secret("agreement_secret", &stored.agreement_secret)?;
        let signing = Self::decode_secret("signing_secret", &stored.signing_secret)?;

        Ok(KeyMaterial::from_parts(
            StaticSecret::from(*agreement),
            SigningKey::from_bytes(&signing),
        ))
    }

    fn store(path: &Path, keys: &KeyMaterial) -> Result<()> {
        let stored = StoredKeys {
            agreement_secret: hex::encode(keys.agreement.to_bytes()),
            signing_secret: hex::encode(keys.signing.to_bytes()),
        };
        let json = Zeroizing::new(serde_json::to_string_pretty(&stored)?);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json.as_bytes()).map_err(|e| {
            CryptoError::KeyStore {
                reason: format!("{}: {e}", path.display()),
            }
            .into()
        })
    }

    /// X25519 public key offered in handshakes
    pub fn agreement_public_key(&self) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        Ok(self.material()?.agreement_public.to_bytes())
    }

    /// Ed25519 key that verifies this device's signatures
    pub fn verifying_key(&self) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        Ok(self.material()?.signing.verifying_key().to_bytes())
    }

    /// Fingerprint of this device's agreement key
    pub fn own_fingerprint(&self) -> Result<String> {
        Ok(fingerprint(&self.agreement_public_key()?))
    }

    /// Raw X25519 agreement with a peer's public key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyAgreement` for low-order peer keys that would
    /// yield a non-contributory secret.
    pub fn diffie_hellman(
        &self,
        peer_public: &[u8; PUBLIC_KEY_LENGTH],
    ) -> Result<Zeroizing<[u8; 32]>> {
        let keys = self.material()?;
        let shared = keys
            .agreement
            .diffie_hellman(&PublicKey::from(*peer_public));

        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement {
                reason: "peer key is of low order".to_string(),
            }
            .into());
        }

        Ok(Zeroizing::new(shared.to_bytes()))
    }

    /// Sign `data` with the device signing key
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LENGTH]> {
        Ok(self.material()?.signing.sign(data).to_bytes())
    }

    /// Verify `signature` over `data` against a raw Ed25519 verifying key
    pub fn verify_signature(data: &[u8], signature: &[u8], verifying_key: &[u8]) -> Result<()> {
        let key_bytes: [u8; PUBLIC_KEY_LENGTH] =
            verifying_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!(
                        "verifying key must be {PUBLIC_KEY_LENGTH} bytes, got {}",
                        verifying_key.len()
                    ),
                })?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey {
            reason: "malformed verifying key".to_string(),
        })?;

        let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureVerification)?;

        key.verify(data, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| CryptoError::SignatureVerification.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_peer_id_has_ten_digits() {
        for _ in 0..100 {
            let id = DeviceIdentity::generate().peer_id.0;
            assert_eq!(id.to_string().len(), 10);
            assert!(!id.to_string().starts_with('0'));
        }
    }

    #[test]
    fn test_identity_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        let second = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_keys_created_once() {
        let store = IdentityKeyStore::in_memory();
        let a = store.agreement_public_key().unwrap();
        let b = store.agreement_public_key().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_keys_reload_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("device.keys");

        let public = IdentityKeyStore::open(&path).agreement_public_key().unwrap();
        assert!(path.exists());

        let reopened = IdentityKeyStore::open(&path);
        assert_eq!(reopened.agreement_public_key().unwrap(), public);
    }

    #[test]
    fn test_corrupt_key_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.keys");
        std::fs::write(&path, "{\"agreement_secret\":\"zz\",\"signing_secret\":\"00\"}").unwrap();

        let store = IdentityKeyStore::open(&path);
        assert!(store.agreement_public_key().is_err());
    }

    #[test]
    fn test_diffie_hellman_agrees() {
        let alice = IdentityKeyStore::in_memory();
        let bob = IdentityKeyStore::in_memory();

        let ab = alice
            .diffie_hellman(&bob.agreement_public_key().unwrap())
            .unwrap();
        let ba = bob
            .diffie_hellman(&alice.agreement_public_key().unwrap())
            .unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_low_order_key_rejected() {
        let store = IdentityKeyStore::in_memory();
        assert!(store.diffie_hellman(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        let store = IdentityKeyStore::in_memory();
        let data = b"handshake offer";
        let signature = store.sign(data).unwrap();
        let key = store.verifying_key().unwrap();

        assert!(IdentityKeyStore::verify_signature(data, &signature, &key).is_ok());
        assert!(IdentityKeyStore::verify_signature(b"tampered", &signature, &key).is_err());
        assert!(IdentityKeyStore::verify_signature(data, &signature[..10], &key).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(&[7u8; 32]);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(fp, fingerprint(&[7u8; 32]));
        assert_ne!(fp, fingerprint(&[8u8; 32]));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let store = IdentityKeyStore::in_memory();
        store.agreement_public_key().unwrap();
        assert!(format!("{store:?}").contains("REDACTED"));
    }
}
