//! Wire protocol for mesh packets.
//!
//! Every packet kind travels in a versioned [`Frame`] serialized with
//! bincode. One frame fits in one datagram.

use crate::messaging::{AccountRecord, CallEnd, CallRequest, CallResponse, MessageId, PeerId};
use crate::session::{EncryptedEnvelope, HandshakeOffer};
use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size; fits a single UDP datagram
pub const MAX_FRAME_SIZE: usize = 65_000;

/// A device as announced in keepalives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Network address, if known
    pub address: Option<String>,
    /// Sender-side keepalive time in milliseconds
    pub keepalive: u64,
    /// Account and profile version of the device
    pub account: AccountRecord,
}

/// A text message on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    /// Author's local message id
    pub message_id: MessageId,
    /// Author
    pub sender_id: PeerId,
    /// Recipient
    pub receiver_id: PeerId,
    /// Author's creation time
    pub timestamp: u64,
    /// Body
    pub text: String,
}

/// A file or voice note on the wire
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Author's local message id
    pub message_id: MessageId,
    /// Author
    pub sender_id: PeerId,
    /// Recipient
    pub receiver_id: PeerId,
    /// Author's creation time
    pub timestamp: u64,
    /// Original file name
    pub file_name: String,
    /// File content
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl fmt::Debug for MediaPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPayload")
            .field("message_id", &self.message_id)
            .field("sender_id", &self.sender_id)
            .field("receiver_id", &self.receiver_id)
            .field("timestamp", &self.timestamp)
            .field("file_name", &self.file_name)
            .field("data", &format_args!("{} bytes", self.data.len()))
            .finish()
    }
}

/// Delivery or read acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the acknowledged message in the author's store
    pub message_id: MessageId,
    /// Acknowledging device
    pub sender_id: PeerId,
    /// Author of the acknowledged message
    pub receiver_id: PeerId,
}

/// A profile on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePayload {
    /// Profile owner
    pub peer_id: PeerId,
    /// Profile version
    pub updated_at: u64,
    /// Display name
    pub username: String,
    /// Avatar bytes
    #[serde(with = "serde_bytes")]
    pub image: Option<Vec<u8>>,
}

/// Every packet exchanged between devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Presence broadcast with the sender's view of the mesh
    Keepalive {
        /// Announcing device
        sender_id: PeerId,
        /// Known live devices followed by the sender itself
        devices: Vec<DeviceInfo>,
    },
    /// Ask a device for its profile
    ProfileRequest {
        /// Asking device
        sender_id: PeerId,
        /// Profile owner
        receiver_id: PeerId,
    },
    /// Profile answer
    ProfileResponse {
        /// Profile owner
        sender_id: PeerId,
        /// Asking device
        receiver_id: PeerId,
        /// The profile
        profile: ProfilePayload,
    },
    /// Text message
    Text(TextPayload),
    /// File message
    File(MediaPayload),
    /// Voice note
    Audio(MediaPayload),
    /// Message stored by the recipient
    ReceivedAck(AckPayload),
    /// Messages displayed by the recipient
    ReadAck(AckPayload),
    /// Call invitation
    CallRequest(CallRequest),
    /// Call answer
    CallResponse(CallResponse),
    /// Hang-up
    CallEnd(CallEnd),
    /// Raw call audio
    CallFragment {
        /// Audio bytes
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    /// Key agreement offer
    Handshake {
        /// Device the offer is for
        receiver_id: PeerId,
        /// The offer
        offer: HandshakeOffer,
    },
    /// End-to-end encrypted packet
    Envelope(EncryptedEnvelope),
}

/// Discriminant of a [`Packet`], one inbound queue per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PacketKind {
    /// Keepalive
    Keepalive,
    /// Profile request
    ProfileRequest,
    /// Profile response
    ProfileResponse,
    /// Text message
    Text,
    /// File message
    File,
    /// Voice note
    Audio,
    /// Delivery acknowledgement
    ReceivedAck,
    /// Read acknowledgement
    ReadAck,
    /// Call invitation
    CallRequest,
    /// Call answer
    CallResponse,
    /// Hang-up
    CallEnd,
    /// Call audio
    CallFragment,
    /// Key agreement offer
    Handshake,
    /// Sealed packet
    Envelope,
}

impl PacketKind {
    /// Every kind, in listen-loop order
    pub const ALL: [Self; 14] = [
        Self::Keepalive,
        Self::ProfileRequest,
        Self::ProfileResponse,
        Self::Text,
        Self::File,
        Self::Audio,
        Self::ReceivedAck,
        Self::ReadAck,
        Self::CallRequest,
        Self::CallResponse,
        Self::CallEnd,
        Self::CallFragment,
        Self::Handshake,
        Self::Envelope,
    ];

    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Self::Keepalive => "keepalive",
            Self::ProfileRequest => "profile-request",
            Self::ProfileResponse => "profile-response",
            Self::Text => "text-message",
            Self::File => "file-message",
            Self::Audio => "audio-message",
            Self::ReceivedAck => "received-ack",
            Self::ReadAck => "read-ack",
            Self::CallRequest => "call-request",
            Self::CallResponse => "call-response",
            Self::CallEnd => "call-end",
            Self::CallFragment => "call-fragment",
            Self::Handshake => "handshake",
            Self::Envelope => "envelope",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Packet {
    /// Kind of this packet
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Keepalive { .. } => PacketKind::Keepalive,
            Self::ProfileRequest { .. } => PacketKind::ProfileRequest,
            Self::ProfileResponse { .. } => PacketKind::ProfileResponse,
            Self::Text(_) => PacketKind::Text,
            Self::File(_) => PacketKind::File,
            Self::Audio(_) => PacketKind::Audio,
            Self::ReceivedAck(_) => PacketKind::ReceivedAck,
            Self::ReadAck(_) => PacketKind::ReadAck,
            Self::CallRequest(_) => PacketKind::CallRequest,
            Self::CallResponse(_) => PacketKind::CallResponse,
            Self::CallEnd(_) => PacketKind::CallEnd,
            Self::CallFragment { .. } => PacketKind::CallFragment,
            Self::Handshake { .. } => PacketKind::Handshake,
            Self::Envelope(_) => PacketKind::Envelope,
        }
    }

    /// Device the packet is addressed to. Keepalives and call audio are
    /// not addressed.
    pub fn receiver_id(&self) -> Option<PeerId> {
        match self {
            Self::Keepalive { .. } | Self::CallFragment { .. } => None,
            Self::ProfileRequest { receiver_id, .. }
            | Self::ProfileResponse { receiver_id, .. }
            | Self::Handshake { receiver_id, .. } => Some(*receiver_id),
            Self::Text(p) => Some(p.receiver_id),
            Self::File(p) | Self::Audio(p) => Some(p.receiver_id),
            Self::ReceivedAck(p) | Self::ReadAck(p) => Some(p.receiver_id),
            Self::CallRequest(p) => Some(p.receiver_id),
            Self::CallResponse(p) => Some(p.receiver_id),
            Self::CallEnd(p) => Some(p.receiver_id),
            Self::Envelope(e) => Some(e.receiver_id),
        }
    }

    /// Device that produced the packet, when the packet names it
    pub fn sender_id(&self) -> Option<PeerId> {
        match self {
            Self::CallFragment { .. } => None,
            Self::Keepalive { sender_id, .. }
            | Self::ProfileRequest { sender_id, .. }
            | Self::ProfileResponse { sender_id, .. } => Some(*sender_id),
            Self::Text(p) => Some(p.sender_id),
            Self::File(p) | Self::Audio(p) => Some(p.sender_id),
            Self::ReceivedAck(p) | Self::ReadAck(p) => Some(p.sender_id),
            Self::CallRequest(p) => Some(p.sender_id),
            Self::CallResponse(p) => Some(p.sender_id),
            Self::CallEnd(p) => Some(p.sender_id),
            Self::Handshake { offer, .. } => Some(offer.sender_id),
            Self::Envelope(e) => Some(e.sender_id),
        }
    }
}

/// Versioned wire frame around a packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version
    pub version: u32,
    /// Payload
    pub packet: Packet,
    /// Address the frame arrived from, filled in by the receiving transport
    #[serde(skip)]
    pub source: Option<String>,
}

impl Frame {
    /// Wrap a packet for sending
    pub fn new(packet: Packet) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet,
            source: None,
        }
    }

    /// Record the address the frame arrived from
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)?;

        if serialized.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: serialized.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        Ok(serialized)
    }

    /// Deserialize frame from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let frame: Self = bincode::deserialize(bytes)?;

        if frame.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: frame.version.to_string(),
            }
            .into());
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PayloadKind;
    use crate::utils::MeshError;

    fn keepalive() -> Packet {
        Packet::Keepalive {
            sender_id: PeerId(42),
            devices: vec![DeviceInfo {
                address: Some("10.0.0.5".to_string()),
                keepalive: 1_700_000_000_000,
                account: AccountRecord {
                    peer_id: PeerId(42),
                    profile_updated_at: 9,
                },
            }],
        }
    }

    #[test]
    fn test_frame_round_trip_keeps_fields() {
        let packet = Packet::File(MediaPayload {
            message_id: MessageId(12),
            sender_id: PeerId(1),
            receiver_id: PeerId(2),
            timestamp: 99,
            file_name: "photo.jpg".to_string(),
            data: vec![0, 1, 2, 255],
        });
        let bytes = Frame::new(packet.clone()).to_bytes().unwrap();
        let decoded = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.packet, packet);
        assert_eq!(decoded.source, None);

        let sealed = Packet::Envelope(EncryptedEnvelope {
            sender_id: PeerId(1),
            receiver_id: PeerId(2),
            kind: PayloadKind::Text,
            payload: "AAAA".to_string(),
            timestamp: 5,
        });
        let bytes = Frame::new(sealed.clone()).to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap().packet, sealed);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut frame = Frame::new(keepalive());
        frame.version = PROTOCOL_VERSION + 1;
        let bytes = bincode::serialize(&frame).unwrap();
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(MeshError::Protocol(ProtocolError::UnsupportedVersion { .. }))
        ));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let packet = Packet::CallFragment {
            bytes: vec![0u8; MAX_FRAME_SIZE],
        };
        assert!(matches!(
            Frame::new(packet).to_bytes(),
            Err(MeshError::Protocol(ProtocolError::MessageTooLarge { .. }))
        ));
        assert!(Frame::from_bytes(&vec![0u8; MAX_FRAME_SIZE + 1]).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Frame::from_bytes(&[0xde, 0xad]).is_err());
    }

    #[test]
    fn test_addressing() {
        assert_eq!(keepalive().receiver_id(), None);
        assert_eq!(keepalive().sender_id(), Some(PeerId(42)));
        assert_eq!(keepalive().kind(), PacketKind::Keepalive);

        let ack = Packet::ReadAck(AckPayload {
            message_id: MessageId(3),
            sender_id: PeerId(2),
            receiver_id: PeerId(1),
        });
        assert_eq!(ack.receiver_id(), Some(PeerId(1)));
        assert_eq!(ack.kind().name(), "read-ack");
    }

    #[test]
    fn test_kinds_are_distinct() {
        let mut kinds = PacketKind::ALL.to_vec();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), PacketKind::ALL.len());
    }

    #[test]
    fn test_packet_json_round_trip() {
        let packet = Packet::Audio(MediaPayload {
            message_id: MessageId(1),
            sender_id: PeerId(1),
            receiver_id: PeerId(2),
            timestamp: 3,
            file_name: "note.ogg".to_string(),
            data: vec![9, 8, 7],
        });
        let json = serde_json::to_string(&packet).unwrap();
        assert_eq!(serde_json::from_str::<Packet>(&json).unwrap(), packet);
    }
}
