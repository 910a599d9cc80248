//! Sealed envelopes carrying end-to-end encrypted payloads.

use crate::messaging::PeerId;
use crate::session::SessionEngine;
use crate::utils::{Clock, Result};
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What an envelope's ciphertext decodes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    /// UTF-8 text
    Text,
    /// Binary file content
    File,
    /// Binary voice content
    Voice,
    /// UTF-8 control payload
    System,
}

impl PayloadKind {
    /// Whether the plaintext is UTF-8 text
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::System)
    }
}

/// An encrypted payload addressed to one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Sealing device
    pub sender_id: PeerId,
    /// Device holding the matching session
    pub receiver_id: PeerId,
    /// How to interpret the plaintext
    pub kind: PayloadKind,
    /// Base64 of `nonce || ciphertext || tag`
    pub payload: String,
    /// Sealing time in milliseconds
    pub timestamp: u64,
}

impl EncryptedEnvelope {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

/// Decrypted content of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedMessage {
    /// Text or system payload
    Text {
        /// Sealing device
        sender_id: PeerId,
        /// Declared kind
        kind: PayloadKind,
        /// Decrypted text
        text: String,
        /// Sealing time
        timestamp: u64,
    },
    /// File or voice payload
    Binary {
        /// Sealing device
        sender_id: PeerId,
        /// Declared kind
        kind: PayloadKind,
        /// Decrypted bytes
        bytes: Vec<u8>,
        /// Sealing time
        timestamp: u64,
    },
}

impl ReceivedMessage {
    /// Sealing device
    pub fn sender_id(&self) -> PeerId {
        match self {
            Self::Text { sender_id, .. } | Self::Binary { sender_id, .. } => *sender_id,
        }
    }
}

/// Seals and opens envelopes through the session engine
#[derive(Debug, Clone)]
pub struct EnvelopeHandler {
    sessions: Arc<SessionEngine>,
    clock: Arc<dyn Clock>,
}

impl EnvelopeHandler {
    /// Create a handler over `sessions`
    pub fn new(sessions: Arc<SessionEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { sessions, clock }
    }

    /// Seal text for `receiver_id`. Returns `None` without a live session.
    pub fn seal_text(
        &self,
        sender_id: PeerId,
        receiver_id: PeerId,
        kind: PayloadKind,
        text: &str,
    ) -> Option<EncryptedEnvelope> {
        self.seal(sender_id, receiver_id, kind, text.as_bytes())
    }

    /// Seal bytes for `receiver_id`. Returns `None` without a live session.
    pub fn seal_binary(
        &self,
        sender_id: PeerId,
        receiver_id: PeerId,
        kind: PayloadKind,
        bytes: &[u8],
    ) -> Option<EncryptedEnvelope> {
        self.seal(sender_id, receiver_id, kind, bytes)
    }

    fn seal(
        &self,
        sender_id: PeerId,
        receiver_id: PeerId,
        kind: PayloadKind,
        plaintext: &[u8],
    ) -> Option<EncryptedEnvelope> {
        let blob = self.sessions.encrypt(receiver_id, plaintext)?;
        Some(EncryptedEnvelope {
            sender_id,
            receiver_id,
            kind,
            payload: general_purpose::STANDARD.encode(blob),
            timestamp: self.clock.now_millis(),
        })
    }

    /// Decrypt an envelope according to its kind. Any decoding, decryption
    /// or UTF-8 failure yields `None` and affects only this envelope.
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Option<ReceivedMessage> {
        let blob = match general_purpose::STANDARD.decode(&envelope.payload) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("Envelope from {} is not valid base64: {}", envelope.sender_id, e);
                return None;
            }
        };
        let plaintext = self.sessions.decrypt(envelope.sender_id, &blob)?;

        if envelope.kind.is_textual() {
            match String::from_utf8(plaintext) {
                Ok(text) => Some(ReceivedMessage::Text {
                    sender_id: envelope.sender_id,
                    kind: envelope.kind,
                    text,
                    timestamp: envelope.timestamp,
                }),
                Err(_) => {
                    log::warn!(
                        "{:?} envelope from {} is not UTF-8",
                        envelope.kind,
                        envelope.sender_id
                    );
                    None
                }
            }
        } else {
            Some(ReceivedMessage::Binary {
                sender_id: envelope.sender_id,
                kind: envelope.kind,
                bytes: plaintext,
                timestamp: envelope.timestamp,
            })
        }
    }
}
