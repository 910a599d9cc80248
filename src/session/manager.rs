//! Per-peer end-to-end encryption sessions.
//!
//! A session is created by accepting a peer's handshake offer: the raw
//! X25519 agreement between our identity key and the peer's public key is
//! hashed with SHA-256 into a 32-byte ChaCha20-Poly1305 key. Ciphertexts are
//! laid out as `nonce || ciphertext || tag` with a fresh random 12-byte nonce
//! per message.
//!
//! Session lifecycle: `NoSession -> Active -> Expired | Removed`. Rotation
//! keeps a session `Active` and re-derives its key from the stored peer key.
//! Every mutation of the session table happens behind a single lock.
//! Handshakes derive their key before taking it; rotation derives while
//! holding it, so the stored key always matches the stored peer key.
//!
//! Encrypt and decrypt never fall back to plaintext and never surface an
//! error: any failure is reported as `None`.

use crate::crypto::{fingerprint, IdentityKeyStore, PUBLIC_KEY_LENGTH};
use crate::messaging::PeerId;
use crate::utils::{Clock, CryptoError, Result, SessionError};
use base64::{engine::general_purpose, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Size of the AEAD nonce prefixed to every ciphertext
pub const NONCE_SIZE: usize = 12;

/// Size of the derived session key
const KEY_SIZE: usize = 32;

/// A signed offer of this device's agreement key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    /// Device making the offer
    pub sender_id: PeerId,
    /// X25519 public key
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    /// Creation time in milliseconds
    pub timestamp: u64,
    /// Ed25519 key that verifies `signature`
    #[serde(with = "serde_bytes")]
    pub signing_key: Vec<u8>,
    /// Signature over sender, public key and timestamp
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Set when this offer answers an offer from the receiver
    pub is_response: bool,
}

impl HandshakeOffer {
    fn signed_bytes(sender_id: PeerId, public_key: &[u8], timestamp: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + public_key.len());
        bytes.extend_from_slice(&sender_id.0.to_be_bytes());
        bytes.extend_from_slice(public_key);
        bytes.extend_from_slice(&timestamp.to_be_bytes());
        bytes
    }

    /// Check the offer's signature against its embedded signing key
    pub fn verify(&self) -> Result<()> {
        let data = Self::signed_bytes(self.sender_id, &self.public_key, self.timestamp);
        IdentityKeyStore::verify_signature(&data, &self.signature, &self.signing_key)
    }

    /// Fingerprint of the offered agreement key
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// An established session with one peer
#[derive(Clone)]
pub struct PeerSession {
    peer_id: PeerId,
    peer_public_key: [u8; PUBLIC_KEY_LENGTH],
    key: Zeroizing<[u8; KEY_SIZE]>,
    created_at: u64,
    last_used_at: u64,
    verified: bool,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("peer_fingerprint", &fingerprint(&self.peer_public_key))
            .field("key", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("verified", &self.verified)
            .finish()
    }
}

impl PeerSession {
    fn is_expired(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_used_at) > timeout_ms
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }
}

/// Public view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Peer of the session
    pub peer_id: PeerId,
    /// Fingerprint of the peer's agreement key
    pub peer_fingerprint: String,
    /// When the key was derived
    pub created_at: u64,
    /// Last successful encrypt or decrypt
    pub last_used_at: u64,
    /// Whether the fingerprint was confirmed out of band
    pub verified: bool,
    /// Whether the session has been idle past the timeout
    pub expired: bool,
}

/// Session table counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionStats {
    /// Sessions not yet expired
    pub active: usize,
    /// Live sessions marked verified
    pub verified: usize,
    /// Sessions idle past the timeout but not yet swept
    pub expired: usize,
}

/// Owner of every per-peer session of this device
pub struct SessionEngine {
    keys: Arc<IdentityKeyStore>,
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
}

impl fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEngine")
            .field("timeout_ms", &self.timeout_ms)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Create an engine with an empty session table
    pub fn new(keys: Arc<IdentityKeyStore>, clock: Arc<dyn Clock>, timeout_ms: u64) -> Self {
        Self {
            keys,
            clock,
            timeout_ms,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Build a signed offer of this device's agreement key. The identity keys
    /// are created on the first call.
    pub fn create_handshake_offer(&self, self_id: PeerId, is_response: bool) -> Result<HandshakeOffer> {
        let public_key = self.keys.agreement_public_key()?.to_vec();
        let timestamp = self.clock.now_millis();
        let signature = self
            .keys
            .sign(&HandshakeOffer::signed_bytes(self_id, &public_key, timestamp))?;

        Ok(HandshakeOffer {
            sender_id: self_id,
            public_key,
            timestamp,
            signing_key: self.keys.verifying_key()?.to_vec(),
            signature: signature.to_vec(),
            is_response,
        })
    }

    fn derive_key(&self, peer_public: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let raw = self.keys.diffie_hellman(peer_public)?;
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&Sha256::digest(&raw[..]));
        Ok(key)
    }

    /// Establish a session from a peer's public key, replacing any previous
    /// session with that peer.
    ///
    /// # Errors
    ///
    /// Fails on malformed or low-order key material. A failure leaves any
    /// existing session untouched.
    pub fn accept_handshake(&self, peer_id: PeerId, peer_public_key: &[u8]) -> Result<()> {
        let peer_public: [u8; PUBLIC_KEY_LENGTH] =
            peer_public_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!(
                        "peer key must be {PUBLIC_KEY_LENGTH} bytes, got {}",
                        peer_public_key.len()
                    ),
                })?;

        let key = self.derive_key(&peer_public).map_err(|e| SessionError::KeyDerivation {
            reason: e.to_string(),
        })?;
        let now = self.clock.now_millis();

        let session = PeerSession {
            peer_id,
            peer_public_key: peer_public,
            key,
            created_at: now,
            last_used_at: now,
            verified: false,
        };

        let replaced = self.sessions.lock().insert(peer_id, session).is_some();
        log::info!(
            "{} session with peer {} ({})",
            if replaced { "Replaced" } else { "Established" },
            peer_id,
            fingerprint(&peer_public)
        );
        Ok(())
    }

    /// Encrypt for `peer_id`. Returns `None` without a live session.
    pub fn encrypt(&self, peer_id: PeerId, plaintext: &[u8]) -> Option<Vec<u8>> {
        let now = self.clock.now_millis();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&peer_id) else {
            log::debug!("No session with peer {}, not encrypting", peer_id);
            return None;
        };
        if session.is_expired(now, self.timeout_ms) {
            log::debug!("Session with peer {} expired, not encrypting", peer_id);
            return None;
        }

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        match session.cipher().encrypt(&nonce, plaintext) {
            Ok(ciphertext) => {
                session.last_used_at = now;
                let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                blob.extend_from_slice(&nonce);
                blob.extend_from_slice(&ciphertext);
                Some(blob)
            }
            Err(_) => {
                log::warn!("Encryption for peer {} failed", peer_id);
                None
            }
        }
    }

    /// Decrypt a blob from `peer_id`. Returns `None` without a live session,
    /// for a truncated blob, or when authentication fails.
    pub fn decrypt(&self, peer_id: PeerId, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < NONCE_SIZE {
            log::debug!("Ciphertext from peer {} too short ({} bytes)", peer_id, blob.len());
            return None;
        }

        let now = self.clock.now_millis();
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&peer_id)?;
        if session.is_expired(now, self.timeout_ms) {
            log::debug!("Session with peer {} expired, not decrypting", peer_id);
            return None;
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        match session.cipher().decrypt(Nonce::from_slice(nonce), ciphertext) {
            Ok(plaintext) => {
                session.last_used_at = now;
                Some(plaintext)
            }
            Err(_) => {
                log::warn!("Authentication failed for ciphertext from peer {}", peer_id);
                None
            }
        }
    }

    /// Encrypt text into base64
    pub fn encrypt_text(&self, peer_id: PeerId, text: &str) -> Option<String> {
        self.encrypt(peer_id, text.as_bytes())
            .map(|blob| general_purpose::STANDARD.encode(blob))
    }

    /// Decrypt base64 produced by [`Self::encrypt_text`]
    pub fn decrypt_text(&self, peer_id: PeerId, encoded: &str) -> Option<String> {
        let blob = general_purpose::STANDARD.decode(encoded).ok()?;
        String::from_utf8(self.decrypt(peer_id, &blob)?).ok()
    }

    /// Whether a session exists and has not been idle past the timeout
    pub fn is_session_live(&self, peer_id: PeerId) -> bool {
        let now = self.clock.now_millis();
        self.sessions
            .lock()
            .get(&peer_id)
            .is_some_and(|s| !s.is_expired(now, self.timeout_ms))
    }

    /// Remove sessions idle past the timeout as of `now`
    pub fn expire_sweep(&self, now: u64) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|peer_id, session| {
            let keep = !session.is_expired(now, self.timeout_ms);
            if !keep {
                log::info!("Session with peer {} expired", peer_id);
            }
            keep
        });
        before - sessions.len()
    }

    /// Re-derive the key of an existing session from the stored peer key
    /// and reset its timestamps.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` without a session.
    pub fn rotate(&self, peer_id: PeerId) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&peer_id).ok_or_else(|| SessionError::NotFound {
            peer_id: peer_id.to_string(),
        })?;

        let key = self.derive_key(&session.peer_public_key)?;
        let now = self.clock.now_millis();
        session.key = key;
        session.created_at = now;
        session.last_used_at = now;
        log::info!("Rotated session key for peer {}", peer_id);
        Ok(())
    }

    /// Mark a session verified after out-of-band fingerprint comparison
    pub fn mark_verified(&self, peer_id: PeerId) -> bool {
        match self.sessions.lock().get_mut(&peer_id) {
            Some(session) => {
                session.verified = true;
                true
            }
            None => false,
        }
    }

    /// Drop the session with a peer
    pub fn remove(&self, peer_id: PeerId) -> bool {
        self.sessions.lock().remove(&peer_id).is_some()
    }

    /// Drop every session
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock();
        let count = sessions.len();
        sessions.clear();
        log::info!("Cleared {} sessions", count);
    }

    /// Peers with a live session
    pub fn active_sessions(&self) -> Vec<PeerId> {
        let now = self.clock.now_millis();
        let mut peers: Vec<PeerId> = self
            .sessions
            .lock()
            .values()
            .filter(|s| !s.is_expired(now, self.timeout_ms))
            .map(|s| s.peer_id)
            .collect();
        peers.sort_unstable();
        peers
    }

    /// Public details of a session
    pub fn session_info(&self, peer_id: PeerId) -> Option<SessionInfo> {
        let now = self.clock.now_millis();
        self.sessions.lock().get(&peer_id).map(|s| SessionInfo {
            peer_id: s.peer_id,
            peer_fingerprint: fingerprint(&s.peer_public_key),
            created_at: s.created_at,
            last_used_at: s.last_used_at,
            verified: s.verified,
            expired: s.is_expired(now, self.timeout_ms),
        })
    }

    /// Counters over the session table
    pub fn stats(&self) -> EncryptionStats {
        let now = self.clock.now_millis();
        let sessions = self.sessions.lock();
        let mut stats = EncryptionStats::default();
        for session in sessions.values() {
            if session.is_expired(now, self.timeout_ms) {
                stats.expired += 1;
            } else {
                stats.active += 1;
                if session.verified {
                    stats.verified += 1;
                }
            }
        }
        stats
    }

    /// Fingerprint of this device's agreement key
    pub fn own_fingerprint(&self) -> Result<String> {
        self.keys.own_fingerprint()
    }
}
