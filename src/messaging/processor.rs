//! Message delivery state machine.
//!
//! [`Messenger`] turns application actions into packets and inbound packets
//! into state changes. Outbound messages are persisted as `Sent` before they
//! reach the transport; inbound messages are persisted as `Received` and
//! acknowledged; acknowledgements advance the author's copy. Every state
//! change goes through [`DeliveryState::advance`], so reordering between
//! packet kinds can never move a message backwards.

use crate::messaging::{
    AccountRecord, CallEnd, CallRequest, CallResponse, CallSignals, DeliveryState, Message,
    MessageContent, MessageId, PeerId, Profile,
};
use crate::network::{PeerDirectory, PeerRecord, RefreshOutcome};
use crate::session::{
    EncryptedEnvelope, EnvelopeHandler, HandshakeOffer, PayloadKind, ReceivedMessage,
    SessionEngine,
};
use crate::storage::{sanitize_file_name, MediaStore, Persistence};
use crate::transport::{
    AckPayload, DeviceInfo, Frame, MediaPayload, Packet, ProfilePayload, TextPayload, Transport,
};
use crate::utils::{Clock, EncryptionPolicy, MeshConfig, MeshError, ProtocolError, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Behaviour switches taken from the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerOptions {
    /// When payloads are sealed
    pub encryption: EncryptionPolicy,
    /// Start a handshake with peers seen for the first time
    pub auto_handshake: bool,
    /// Address every keepalive is sent to
    pub group_owner_address: String,
    /// Whether this device is the group owner
    pub is_group_owner: bool,
}

impl Default for MessengerOptions {
    fn default() -> Self {
        Self::from_config(&MeshConfig::default())
    }
}

impl MessengerOptions {
    /// Extract the messenger options from a full configuration
    pub fn from_config(config: &MeshConfig) -> Self {
        Self {
            encryption: config.crypto.encryption,
            auto_handshake: config.crypto.auto_handshake,
            group_owner_address: config.network.group_owner_address.clone(),
            is_group_owner: config.network.is_group_owner,
        }
    }
}

/// Shared services the messenger drives
#[derive(Clone)]
pub struct MessengerServices {
    /// Packet transport
    pub transport: Arc<dyn Transport>,
    /// Message, account and profile store
    pub store: Arc<dyn Persistence>,
    /// Attachment store
    pub media: Arc<dyn MediaStore>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for MessengerServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessengerServices")
            .field("transport", &self.transport.local_address())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// How an outbound payload leaves the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Plain,
    Sealed,
}

/// The envelope kind a packet is sealed under, if it may be sealed at all
fn envelope_kind(packet: &Packet) -> Option<PayloadKind> {
    match packet {
        Packet::Text(_) => Some(PayloadKind::Text),
        Packet::File(_) => Some(PayloadKind::File),
        Packet::Audio(_) => Some(PayloadKind::Voice),
        Packet::ProfileResponse { .. } => Some(PayloadKind::System),
        _ => None,
    }
}

/// Log a dropped inbound packet, louder when the error points at tampering
fn log_rejected(peer_id: PeerId, error: &MeshError) {
    if error.is_security_violation() {
        log::warn!("Rejected packet from {}: {}", peer_id, error);
    } else {
        log::debug!("Dropped packet from {}: {}", peer_id, error);
    }
}

/// Per-device messaging engine
pub struct Messenger {
    own_id: PeerId,
    options: MessengerOptions,
    directory: Arc<PeerDirectory>,
    sessions: Arc<SessionEngine>,
    envelopes: EnvelopeHandler,
    signals: Arc<CallSignals>,
    services: MessengerServices,
    own_profile: RwLock<Profile>,
    media_seq: AtomicU64,
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("own_id", &self.own_id)
            .field("options", &self.options)
            .field("online", &self.directory.len())
            .finish_non_exhaustive()
    }
}

impl Messenger {
    /// Create a messenger for `own_profile.peer_id`
    pub fn new(
        own_profile: Profile,
        options: MessengerOptions,
        directory: Arc<PeerDirectory>,
        sessions: Arc<SessionEngine>,
        signals: Arc<CallSignals>,
        services: MessengerServices,
    ) -> Self {
        let envelopes = EnvelopeHandler::new(sessions.clone(), services.clock.clone());
        Self {
            own_id: own_profile.peer_id,
            options,
            directory,
            sessions,
            envelopes,
            signals,
            services,
            own_profile: RwLock::new(own_profile),
            media_seq: AtomicU64::new(0),
        }
    }

    /// This device's id
    pub fn own_id(&self) -> PeerId {
        self.own_id
    }

    /// Current own profile
    pub fn own_profile(&self) -> Profile {
        self.own_profile.read().clone()
    }

    /// Live-peer table
    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Session table
    pub fn sessions(&self) -> &Arc<SessionEngine> {
        &self.sessions
    }

    /// Call signal slots
    pub fn call_signals(&self) -> &Arc<CallSignals> {
        &self.signals
    }

    /// Message store
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.services.store
    }

    fn now(&self) -> u64 {
        self.services.clock.now_millis()
    }

    // ---------------------------------------------------------------------
    // Presence
    // ---------------------------------------------------------------------

    /// Keepalive listing every live peer followed by this device
    pub fn keepalive_packet(&self) -> Packet {
        let mut devices: Vec<DeviceInfo> = self
            .directory
            .snapshot()
            .into_iter()
            .map(|record| DeviceInfo {
                address: record.address,
                keepalive: record.last_keepalive,
                account: AccountRecord {
                    peer_id: record.peer_id,
                    profile_updated_at: record.profile_updated_at,
                },
            })
            .collect();

        devices.push(DeviceInfo {
            address: self.services.transport.local_address(),
            keepalive: self.now(),
            account: self.own_profile.read().account(),
        });

        Packet::Keepalive {
            sender_id: self.own_id,
            devices,
        }
    }

    /// Send a keepalive to the group owner and to every known peer address.
    /// Returns the number of addresses reached.
    pub async fn broadcast_keepalive(&self) -> usize {
        let packet = self.keepalive_packet();

        let mut targets = Vec::new();
        if !self.options.is_group_owner {
            targets.push(self.options.group_owner_address.clone());
        }
        for address in self.directory.addresses() {
            if !targets.contains(&address) {
                targets.push(address);
            }
        }

        let mut reached = 0;
        for address in targets {
            match self.services.transport.send(&address, &packet).await {
                Ok(()) => reached += 1,
                Err(e) => log::debug!("Keepalive to {} failed: {}", address, e),
            }
        }
        reached
    }

    /// Probe the network for devices not yet in the directory
    pub async fn discover(&self) -> Result<()> {
        self.services
            .transport
            .discover_peers(&self.keepalive_packet())
            .await
    }

    /// Replace the own profile, bumping its version so peers refetch it
    pub async fn update_own_profile(
        &self,
        username: &str,
        image: Option<(&str, &[u8])>,
    ) -> Result<Profile> {
        let image_ref = match image {
            Some((name, bytes)) => {
                let name = format!("profile-{}-{}", self.own_id, name);
                Some(self.services.media.save(&name, bytes).await?)
            }
            None => None,
        };

        let mut profile = self.own_profile.write();
        profile.updated_at = self.now().max(profile.updated_at + 1);
        profile.username = username.to_string();
        if image_ref.is_some() {
            profile.image_ref = image_ref;
        }
        log::info!("Own profile updated (version {})", profile.updated_at);
        Ok(profile.clone())
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    fn route(&self, peer_id: PeerId) -> Option<Route> {
        let live = self.sessions.is_session_live(peer_id);
        match self.options.encryption {
            EncryptionPolicy::Disabled => Some(Route::Plain),
            EncryptionPolicy::Opportunistic if live => Some(Route::Sealed),
            EncryptionPolicy::Opportunistic => Some(Route::Plain),
            EncryptionPolicy::Required if live => Some(Route::Sealed),
            EncryptionPolicy::Required => {
                log::debug!("No live session with {}, dropping send", peer_id);
                None
            }
        }
    }

    fn seal(&self, peer_id: PeerId, packet: &Packet) -> Result<Option<EncryptedEnvelope>> {
        let Some(kind) = envelope_kind(packet) else {
            return Ok(None);
        };

        let envelope = if kind.is_textual() {
            let json = serde_json::to_string(packet)?;
            self.envelopes.seal_text(self.own_id, peer_id, kind, &json)
        } else {
            let bytes = bincode::serialize(packet)?;
            self.envelopes.seal_binary(self.own_id, peer_id, kind, &bytes)
        };
        Ok(envelope)
    }

    /// Send `packet` along `route`. A failed seal drops the packet.
    async fn deliver(
        &self,
        address: &str,
        peer_id: PeerId,
        packet: Packet,
        route: Route,
    ) -> Result<bool> {
        let packet = match route {
            Route::Plain => packet,
            Route::Sealed => match self.seal(peer_id, &packet)? {
                Some(envelope) => Packet::Envelope(envelope),
                None => {
                    log::warn!("Sealing {} for {} failed, dropping", packet.kind(), peer_id);
                    return Ok(false);
                }
            },
        };

        self.services.transport.send(address, &packet).await?;
        Ok(true)
    }

    /// Send an unsealed control packet. Returns `false` when the peer is not
    /// in the directory.
    async fn send_control(&self, peer_id: PeerId, packet: Packet) -> Result<bool> {
        let Some(address) = self.directory.resolve(peer_id) else {
            log::debug!("{} to unknown peer {} dropped", packet.kind(), peer_id);
            return Ok(false);
        };
        self.services.transport.send(&address, &packet).await?;
        Ok(true)
    }

    /// Persist `message` as `Sent`, then deliver the packet built from its
    /// id. A packet dropped at sealing takes its stored row with it; a
    /// transport failure leaves the row as `Sent`.
    async fn send_message(
        &self,
        address: &str,
        route: Route,
        message: Message,
        packet: impl FnOnce(MessageId) -> Packet,
    ) -> Result<Option<Message>> {
        let mut message = message;
        message.id = self.services.store.insert_message(message.clone()).await?;

        let peer_id = message.receiver_id;
        match self.deliver(address, peer_id, packet(message.id), route).await {
            Ok(true) => log::debug!(
                "Sent {} message {} to {}",
                message.content.kind_name(),
                message.id,
                peer_id
            ),
            Ok(false) => {
                self.services.store.delete_message(message.id).await?;
                return Ok(None);
            }
            Err(e) => log::warn!("Transport failed for message {}: {}", message.id, e),
        }
        Ok(Some(message))
    }

    /// Send a text message. Returns the stored message, or `None` when the
    /// peer is unreachable or the encryption policy forbids sending.
    pub async fn send_text(&self, peer_id: PeerId, text: &str) -> Result<Option<Message>> {
        let Some(address) = self.directory.resolve(peer_id) else {
            log::debug!("Text to unknown peer {} dropped", peer_id);
            return Ok(None);
        };
        let Some(route) = self.route(peer_id) else {
            return Ok(None);
        };

        let timestamp = self.now();
        let message = Message::new(
            self.own_id,
            peer_id,
            timestamp,
            DeliveryState::Sent,
            MessageContent::Text {
                text: text.to_string(),
            },
        );

        let own_id = self.own_id;
        self.send_message(&address, route, message, |message_id| {
            Packet::Text(TextPayload {
                message_id,
                sender_id: own_id,
                receiver_id: peer_id,
                timestamp,
                text: text.to_string(),
            })
        })
        .await
    }

    /// Send a file. The bytes are kept in the media store first; a failed
    /// save drops the send.
    pub async fn send_file(
        &self,
        peer_id: PeerId,
        file_name: &str,
        data: &[u8],
    ) -> Result<Option<Message>> {
        self.send_media(peer_id, file_name, data, false).await
    }

    /// Send a voice note. Same rules as [`Self::send_file`].
    pub async fn send_audio(
        &self,
        peer_id: PeerId,
        file_name: &str,
        data: &[u8],
    ) -> Result<Option<Message>> {
        self.send_media(peer_id, file_name, data, true).await
    }

    async fn send_media(
        &self,
        peer_id: PeerId,
        file_name: &str,
        data: &[u8],
        audio: bool,
    ) -> Result<Option<Message>> {
        let Some(address) = self.directory.resolve(peer_id) else {
            log::debug!("Media to unknown peer {} dropped", peer_id);
            return Ok(None);
        };
        let Some(route) = self.route(peer_id) else {
            return Ok(None);
        };

        let timestamp = self.now();
        let base = sanitize_file_name(file_name).unwrap_or_else(|| "attachment".into());
        let seq = self.media_seq.fetch_add(1, Ordering::Relaxed);
        let local_name = format!("{}-{}-{}-{}", self.own_id, timestamp, seq, base);

        let file_ref = match self.services.media.save(&local_name, data).await {
            Ok(file_ref) => file_ref,
            Err(e) => {
                log::warn!("Could not keep {} before sending: {}", file_name, e);
                return Ok(None);
            }
        };

        let content = if audio {
            MessageContent::Audio { file_ref }
        } else {
            MessageContent::File { file_ref }
        };
        let message = Message::new(
            self.own_id,
            peer_id,
            timestamp,
            DeliveryState::Sent,
            content,
        );

        let own_id = self.own_id;
        self.send_message(&address, route, message, |message_id| {
            let payload = MediaPayload {
                message_id,
                sender_id: own_id,
                receiver_id: peer_id,
                timestamp,
                file_name: base,
                data: data.to_vec(),
            };
            if audio {
                Packet::Audio(payload)
            } else {
                Packet::File(payload)
            }
        })
        .await
    }

    /// Tell `peer_id` its message `message_id` was stored here
    pub async fn send_received_ack(&self, peer_id: PeerId, message_id: MessageId) -> Result<bool> {
        self.send_control(
            peer_id,
            Packet::ReceivedAck(AckPayload {
                message_id,
                sender_id: self.own_id,
                receiver_id: peer_id,
            }),
        )
        .await
    }

    /// Tell `peer_id` its messages up to `message_id` were displayed
    pub async fn send_read_ack(&self, peer_id: PeerId, message_id: MessageId) -> Result<bool> {
        self.send_control(
            peer_id,
            Packet::ReadAck(AckPayload {
                message_id,
                sender_id: self.own_id,
                receiver_id: peer_id,
            }),
        )
        .await
    }

    /// Mark a displayed batch as read.
    ///
    /// Messages authored by `peer_id` and not yet read are advanced to
    /// `Read`, then a single read-ack naming the last of them is sent.
    /// Returns the acknowledged id, or `None` when nothing was unread.
    pub async fn mark_conversation_read(
        &self,
        peer_id: PeerId,
        displayed: &[Message],
    ) -> Result<Option<MessageId>> {
        let unread: Vec<&Message> = displayed
            .iter()
            .filter(|m| {
                m.sender_id == peer_id
                    && m.sender_id != self.own_id
                    && m.state < DeliveryState::Read
            })
            .collect();

        let Some(last) = unread.last() else {
            return Ok(None);
        };

        for message in &unread {
            self.services
                .store
                .update_message_state(message.id, DeliveryState::Read)
                .await?;
        }

        self.send_read_ack(peer_id, last.id).await?;
        Ok(Some(last.id))
    }

    /// Invite `peer_id` to a call
    pub async fn send_call_request(&self, peer_id: PeerId) -> Result<bool> {
        self.send_control(
            peer_id,
            Packet::CallRequest(CallRequest {
                sender_id: self.own_id,
                receiver_id: peer_id,
            }),
        )
        .await
    }

    /// Answer a call invitation from `peer_id`
    pub async fn send_call_response(&self, peer_id: PeerId, accepted: bool) -> Result<bool> {
        self.send_control(
            peer_id,
            Packet::CallResponse(CallResponse {
                sender_id: self.own_id,
                receiver_id: peer_id,
                accepted,
            }),
        )
        .await
    }

    /// Hang up on `peer_id`
    pub async fn send_call_end(&self, peer_id: PeerId) -> Result<bool> {
        self.send_control(
            peer_id,
            Packet::CallEnd(CallEnd {
                sender_id: self.own_id,
                receiver_id: peer_id,
            }),
        )
        .await
    }

    /// Relay one chunk of call audio to `peer_id`
    pub async fn send_call_fragment(&self, peer_id: PeerId, bytes: Vec<u8>) -> Result<bool> {
        self.send_control(peer_id, Packet::CallFragment { bytes }).await
    }

    /// Ask `peer_id` for its profile
    pub async fn send_profile_request(&self, peer_id: PeerId) -> Result<bool> {
        self.send_control(
            peer_id,
            Packet::ProfileRequest {
                sender_id: self.own_id,
                receiver_id: peer_id,
            },
        )
        .await
    }

    /// Send the own profile to `peer_id`
    pub async fn send_profile_response(&self, peer_id: PeerId) -> Result<bool> {
        let Some(address) = self.directory.resolve(peer_id) else {
            log::debug!("Profile for unknown peer {} dropped", peer_id);
            return Ok(false);
        };
        let Some(route) = self.route(peer_id) else {
            return Ok(false);
        };

        let profile = self.own_profile();
        let image = match &profile.image_ref {
            Some(file_ref) => match self.services.media.load(file_ref).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::warn!("Profile image {} unavailable: {}", file_ref, e);
                    None
                }
            },
            None => None,
        };

        let packet = Packet::ProfileResponse {
            sender_id: self.own_id,
            receiver_id: peer_id,
            profile: ProfilePayload {
                peer_id: profile.peer_id,
                updated_at: profile.updated_at,
                username: profile.username,
                image,
            },
        };
        self.deliver(&address, peer_id, packet, route).await
    }

    /// Offer a session to `peer_id`
    pub async fn initiate_handshake(&self, peer_id: PeerId) -> Result<bool> {
        let offer = self.sessions.create_handshake_offer(self.own_id, false)?;
        log::info!("Offering session to {}", peer_id);
        self.send_control(
            peer_id,
            Packet::Handshake {
                receiver_id: peer_id,
                offer,
            },
        )
        .await
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Apply one inbound frame. Packets addressed to another device are
    /// ignored.
    pub async fn handle_frame(&self, frame: Frame) -> Result<()> {
        let Frame { packet, source, .. } = frame;

        if let Some(receiver) = packet.receiver_id() {
            if receiver != self.own_id {
                log::debug!("Ignoring {} addressed to {}", packet.kind(), receiver);
                return Ok(());
            }
        }

        if self.options.encryption == EncryptionPolicy::Required && envelope_kind(&packet).is_some()
        {
            log::warn!(
                "Rejecting plaintext {} from {:?}: encryption required",
                packet.kind(),
                packet.sender_id()
            );
            return Ok(());
        }

        match packet {
            Packet::Keepalive { sender_id, devices } => {
                self.on_keepalive(sender_id, devices, source).await
            }
            Packet::ProfileRequest { sender_id, .. } => {
                self.send_profile_response(sender_id).await.map(drop)
            }
            Packet::ProfileResponse {
                sender_id, profile, ..
            } => self.on_profile_response(sender_id, profile).await,
            Packet::Text(payload) => self.on_text(payload).await,
            Packet::File(payload) => self.on_media(payload, false).await,
            Packet::Audio(payload) => self.on_media(payload, true).await,
            Packet::ReceivedAck(ack) => self.on_received_ack(ack).await,
            Packet::ReadAck(ack) => self.on_read_ack(ack).await,
            Packet::CallRequest(request) => {
                self.signals.on_request(request);
                Ok(())
            }
            Packet::CallResponse(response) => {
                self.signals.on_response(response);
                Ok(())
            }
            Packet::CallEnd(end) => {
                self.signals.on_end(end);
                Ok(())
            }
            Packet::CallFragment { bytes } => {
                self.signals.on_fragment(bytes);
                Ok(())
            }
            Packet::Handshake { offer, .. } => self.on_handshake(offer, source).await,
            Packet::Envelope(envelope) => self.on_envelope(envelope).await,
        }
    }

    async fn on_keepalive(
        &self,
        sender_id: PeerId,
        devices: Vec<DeviceInfo>,
        source: Option<String>,
    ) -> Result<()> {
        for device in devices {
            let peer_id = device.account.peer_id;
            if peer_id == self.own_id {
                continue;
            }

            let address = match device.address {
                Some(address) => Some(address),
                None if peer_id == sender_id => source.clone(),
                None => None,
            };

            let outcome = self.directory.refresh(PeerRecord {
                peer_id,
                address,
                last_keepalive: device.keepalive,
                profile_updated_at: device.account.profile_updated_at,
            });

            if outcome == RefreshOutcome::Inserted {
                self.maybe_handshake(peer_id).await;
            }

            if let Err(e) = self.sync_profile(device.account).await {
                log::warn!("Profile sync for {} failed: {}", peer_id, e);
            }
        }
        Ok(())
    }

    /// Record the advertised account and ask for the profile when none is
    /// cached or the advertised version is newer than the last one seen.
    async fn sync_profile(&self, account: AccountRecord) -> Result<()> {
        let store = &self.services.store;
        let last = store.get_account(account.peer_id).await?;
        store.upsert_account(account).await?;

        let cached = store.get_profile(account.peer_id).await?;
        let stale = last.is_some_and(|last| last.profile_updated_at < account.profile_updated_at);

        if cached.is_none() || stale {
            log::debug!("Requesting profile of {}", account.peer_id);
            if let Err(e) = self.send_profile_request(account.peer_id).await {
                log::debug!("Profile request to {} failed: {}", account.peer_id, e);
            }
        }
        Ok(())
    }

    /// Open a session with a newly seen peer. Only the lower id of a pair
    /// initiates.
    async fn maybe_handshake(&self, peer_id: PeerId) {
        if !self.options.auto_handshake
            || self.options.encryption == EncryptionPolicy::Disabled
            || self.own_id > peer_id
            || self.sessions.is_session_live(peer_id)
        {
            return;
        }

        if let Err(e) = self.initiate_handshake(peer_id).await {
            log::warn!("Handshake with {} failed: {}", peer_id, e);
        }
    }

    async fn on_profile_response(&self, sender_id: PeerId, profile: ProfilePayload) -> Result<()> {
        if profile.peer_id != sender_id {
            log::warn!(
                "Profile of {} sent by {}, ignoring",
                profile.peer_id,
                sender_id
            );
            return Ok(());
        }

        let image_ref = match &profile.image {
            Some(bytes) => {
                let name = format!("profile-{}", profile.peer_id);
                match self.services.media.save(&name, bytes).await {
                    Ok(file_ref) => Some(file_ref),
                    Err(e) => {
                        log::warn!("Dropping profile image of {}: {}", profile.peer_id, e);
                        None
                    }
                }
            }
            None => None,
        };

        log::info!("Profile of {} is now '{}'", profile.peer_id, profile.username);
        self.services
            .store
            .upsert_profile(Profile {
                peer_id: profile.peer_id,
                updated_at: profile.updated_at,
                username: profile.username,
                image_ref,
            })
            .await
    }

    async fn on_text(&self, payload: TextPayload) -> Result<()> {
        let message = Message::new(
            payload.sender_id,
            payload.receiver_id,
            payload.timestamp,
            DeliveryState::Received,
            MessageContent::Text { text: payload.text },
        );
        self.store_inbound(message, payload.message_id).await
    }

    async fn on_media(&self, payload: MediaPayload, audio: bool) -> Result<()> {
        let base = sanitize_file_name(&payload.file_name).unwrap_or_else(|| "attachment".into());
        let name = format!("{}-{}-{}", payload.sender_id, payload.message_id, base);

        let file_ref = match self.services.media.save(&name, &payload.data).await {
            Ok(file_ref) => file_ref,
            Err(e) => {
                log::warn!(
                    "Could not save {} from {}, not acknowledging: {}",
                    name,
                    payload.sender_id,
                    e
                );
                return Ok(());
            }
        };

        let content = if audio {
            MessageContent::Audio { file_ref }
        } else {
            MessageContent::File { file_ref }
        };
        let message = Message::new(
            payload.sender_id,
            payload.receiver_id,
            payload.timestamp,
            DeliveryState::Received,
            content,
        );
        self.store_inbound(message, payload.message_id).await
    }

    /// Persist an inbound message and acknowledge it. A storage failure
    /// suppresses the acknowledgement.
    async fn store_inbound(&self, message: Message, remote_id: MessageId) -> Result<()> {
        let author = message.sender_id;
        let kind = message.content.kind_name();

        match self.services.store.insert_message(message).await {
            Ok(id) => {
                log::debug!("Stored {} message {} from {}", kind, id, author);
                self.send_received_ack(author, remote_id).await.map(drop)
            }
            Err(e) => {
                log::warn!(
                    "Could not store {} message from {}, not acknowledging: {}",
                    kind,
                    author,
                    e
                );
                Ok(())
            }
        }
    }

    async fn on_received_ack(&self, ack: AckPayload) -> Result<()> {
        let store = &self.services.store;
        let Some(message) = store.get_message_by_id(ack.message_id).await? else {
            log::debug!("Received-ack for unknown message {}", ack.message_id);
            return Ok(());
        };

        if message.receiver_id != ack.sender_id {
            log::debug!(
                "Received-ack for message {} from {} who is not its recipient",
                ack.message_id,
                ack.sender_id
            );
            return Ok(());
        }

        if message.state < DeliveryState::Received {
            store
                .update_message_state(message.id, DeliveryState::Received)
                .await?;
        }
        Ok(())
    }

    async fn on_read_ack(&self, ack: AckPayload) -> Result<()> {
        let store = &self.services.store;
        let mut advanced = 0;
        for message in store.get_messages_addressed_to(ack.sender_id).await? {
            if message.state < DeliveryState::Read {
                store
                    .update_message_state(message.id, DeliveryState::Read)
                    .await?;
                advanced += 1;
            }
        }
        log::debug!("{} read {} message(s)", ack.sender_id, advanced);
        Ok(())
    }

    /// Accept a verified offer. Offers that are not themselves responses are
    /// answered, at the frame's source when the sender is not yet known.
    async fn on_handshake(&self, offer: HandshakeOffer, source: Option<String>) -> Result<()> {
        if let Err(e) = offer.verify() {
            log_rejected(offer.sender_id, &e);
            return Ok(());
        }

        if let Err(e) = self
            .sessions
            .accept_handshake(offer.sender_id, &offer.public_key)
        {
            log::warn!("Handshake with {} failed: {}", offer.sender_id, e);
            return Ok(());
        }
        log::info!(
            "Session with {} established (fingerprint {})",
            offer.sender_id,
            offer.fingerprint()
        );

        if offer.is_response {
            return Ok(());
        }

        let Some(address) = self.directory.resolve(offer.sender_id).or(source) else {
            log::debug!("No address to answer the handshake of {}", offer.sender_id);
            return Ok(());
        };

        let reply = self.sessions.create_handshake_offer(self.own_id, true)?;
        self.services
            .transport
            .send(
                &address,
                &Packet::Handshake {
                    receiver_id: offer.sender_id,
                    offer: reply,
                },
            )
            .await
    }

    async fn on_envelope(&self, envelope: EncryptedEnvelope) -> Result<()> {
        let Some(received) = self.envelopes.open(&envelope) else {
            log::debug!(
                "Could not open {:?} envelope from {}",
                envelope.kind,
                envelope.sender_id
            );
            return Ok(());
        };

        let inner: Packet = match &received {
            ReceivedMessage::Text { text, .. } => match serde_json::from_str(text) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Undecodable envelope from {}: {}", envelope.sender_id, e);
                    return Ok(());
                }
            },
            ReceivedMessage::Binary { bytes, .. } => match bincode::deserialize(bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Undecodable envelope from {}: {}", envelope.sender_id, e);
                    return Ok(());
                }
            },
        };

        if inner.sender_id() != Some(received.sender_id()) {
            log_rejected(
                envelope.sender_id,
                &ProtocolError::SenderMismatch {
                    envelope: received.sender_id().to_string(),
                    payload: inner
                        .sender_id()
                        .map_or_else(|| "none".to_string(), |id| id.to_string()),
                }
                .into(),
            );
            return Ok(());
        }
        if inner.receiver_id() != Some(self.own_id) || envelope_kind(&inner) != Some(envelope.kind)
        {
            log::warn!(
                "Envelope from {} carries a mismatched {} packet",
                envelope.sender_id,
                inner.kind()
            );
            return Ok(());
        }

        match inner {
            Packet::Text(payload) => self.on_text(payload).await,
            Packet::File(payload) => self.on_media(payload, false).await,
            Packet::Audio(payload) => self.on_media(payload, true).await,
            Packet::ProfileResponse {
                sender_id, profile, ..
            } => self.on_profile_response(sender_id, profile).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyStore;
    use crate::defaults::SESSION_TIMEOUT_MS;
    use crate::storage::{MemoryMediaStore, MemoryStore};
    use crate::transport::{MemoryNetwork, MemoryTransport, PacketKind};
    use crate::utils::{ManualClock, StorageError};

    const ME: PeerId = PeerId(1_000_000_001);
    const BOB: PeerId = PeerId(1_000_000_002);

    struct Harness {
        messenger: Messenger,
        store: Arc<MemoryStore>,
        media: Arc<MemoryMediaStore>,
        bob: MemoryTransport,
    }

    fn harness(encryption: EncryptionPolicy) -> Harness {
        harness_with(encryption, Arc::new(ManualClock::new(1_000)), None, None)
    }

    fn harness_with(
        encryption: EncryptionPolicy,
        clock: Arc<ManualClock>,
        persistence: Option<Arc<dyn Persistence>>,
        media_store: Option<Arc<dyn MediaStore>>,
    ) -> Harness {
        let network = MemoryNetwork::new();
        let transport = Arc::new(network.endpoint("10.0.0.1", 32));
        let bob = network.endpoint("10.0.0.2", 32);

        let clock: Arc<dyn Clock> = clock;
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(MemoryMediaStore::new());
        let persistence: Arc<dyn Persistence> = match persistence {
            Some(persistence) => persistence,
            None => store.clone(),
        };
        let media_store: Arc<dyn MediaStore> = match media_store {
            Some(media_store) => media_store,
            None => media.clone(),
        };
        let directory = Arc::new(PeerDirectory::new(clock.clone(), 3_000));
        directory.refresh(PeerRecord {
            peer_id: BOB,
            address: Some("10.0.0.2".to_string()),
            last_keepalive: 1_000,
            profile_updated_at: 0,
        });

        let sessions = Arc::new(SessionEngine::new(
            Arc::new(IdentityKeyStore::in_memory()),
            clock.clone(),
            SESSION_TIMEOUT_MS,
        ));

        let options = MessengerOptions {
            encryption,
            auto_handshake: false,
            ..MessengerOptions::default()
        };
        let messenger = Messenger::new(
            Profile {
                peer_id: ME,
                updated_at: 1,
                username: "me".to_string(),
                image_ref: None,
            },
            options,
            directory,
            sessions,
            Arc::new(CallSignals::new()),
            MessengerServices {
                transport,
                store: persistence,
                media: media_store,
                clock,
            },
        );

        Harness {
            messenger,
            store,
            media,
            bob,
        }
    }

    /// Memory store that refuses account writes for one peer
    struct RejectAccountOf {
        inner: Arc<MemoryStore>,
        peer_id: PeerId,
    }

    #[async_trait::async_trait]
    impl Persistence for RejectAccountOf {
        async fn insert_message(&self, message: Message) -> Result<MessageId> {
            self.inner.insert_message(message).await
        }

        async fn update_message_state(&self, id: MessageId, state: DeliveryState) -> Result<()> {
            self.inner.update_message_state(id, state).await
        }

        async fn delete_message(&self, id: MessageId) -> Result<()> {
            self.inner.delete_message(id).await
        }

        async fn get_message_by_id(&self, id: MessageId) -> Result<Option<Message>> {
            self.inner.get_message_by_id(id).await
        }

        async fn get_messages_addressed_to(&self, receiver_id: PeerId) -> Result<Vec<Message>> {
            self.inner.get_messages_addressed_to(receiver_id).await
        }

        async fn get_account(&self, peer_id: PeerId) -> Result<Option<AccountRecord>> {
            self.inner.get_account(peer_id).await
        }

        async fn upsert_account(&self, account: AccountRecord) -> Result<()> {
            if account.peer_id == self.peer_id {
                return Err(StorageError::WriteFailed {
                    reason: format!("account {} is locked", account.peer_id),
                }
                .into());
            }
            self.inner.upsert_account(account).await
        }

        async fn get_profile(&self, peer_id: PeerId) -> Result<Option<Profile>> {
            self.inner.get_profile(peer_id).await
        }

        async fn upsert_profile(&self, profile: Profile) -> Result<()> {
            self.inner.upsert_profile(profile).await
        }
    }

    /// Media store whose saves take longer than a session may idle
    #[derive(Debug)]
    struct SlowMedia {
        clock: Arc<ManualClock>,
    }

    #[async_trait::async_trait]
    impl MediaStore for SlowMedia {
        async fn save(&self, name: &str, _bytes: &[u8]) -> Result<String> {
            self.clock.advance(SESSION_TIMEOUT_MS + 1);
            Ok(name.to_string())
        }

        async fn load(&self, file_ref: &str) -> Result<Vec<u8>> {
            Err(StorageError::NotFound {
                key: file_ref.to_string(),
            }
            .into())
        }
    }

    fn inbound_text(message_id: u64, timestamp: u64) -> Frame {
        Frame::new(Packet::Text(TextPayload {
            message_id: MessageId(message_id),
            sender_id: BOB,
            receiver_id: ME,
            timestamp,
            text: format!("hello {message_id}"),
        }))
    }

    #[tokio::test]
    async fn test_send_text_persists_then_sends() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let sent = h.messenger.send_text(BOB, "hi").await.unwrap().unwrap();

        assert!(sent.id.is_assigned());
        assert_eq!(sent.state, DeliveryState::Sent);
        assert_eq!(h.store.message_count(), 1);

        let frames = h.bob.drain(PacketKind::Text).await;
        assert_eq!(frames.len(), 1);
        match &frames[0].packet {
            Packet::Text(payload) => {
                assert_eq!(payload.message_id, sent.id);
                assert_eq!(payload.text, "hi");
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_dropped() {
        let h = harness(EncryptionPolicy::Opportunistic);
        assert!(h.messenger.send_text(PeerId(7), "hi").await.unwrap().is_none());
        assert_eq!(h.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_required_policy_without_session_drops() {
        let h = harness(EncryptionPolicy::Required);
        assert!(h.messenger.send_text(BOB, "hi").await.unwrap().is_none());
        assert_eq!(h.store.message_count(), 0);
        assert!(h.bob.drain(PacketKind::Text).await.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_text_is_stored_and_acknowledged() {
        let h = harness(EncryptionPolicy::Opportunistic);
        h.messenger.handle_frame(inbound_text(77, 5)).await.unwrap();

        let stored = h.store.conversation(BOB);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, DeliveryState::Received);

        let acks = h.bob.drain(PacketKind::ReceivedAck).await;
        assert_eq!(acks.len(), 1);
        assert!(matches!(
            acks[0].packet,
            Packet::ReceivedAck(AckPayload { message_id: MessageId(77), .. })
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_suppresses_ack() {
        let h = harness(EncryptionPolicy::Opportunistic);
        h.store.set_fail_writes(true);
        h.messenger.handle_frame(inbound_text(1, 5)).await.unwrap();
        assert!(h.bob.drain(PacketKind::ReceivedAck).await.is_empty());

        h.media.set_fail_writes(true);
        let file = Frame::new(Packet::File(MediaPayload {
            message_id: MessageId(2),
            sender_id: BOB,
            receiver_id: ME,
            timestamp: 6,
            file_name: "a.bin".to_string(),
            data: vec![1],
        }));
        h.messenger.handle_frame(file).await.unwrap();
        assert!(h.bob.drain(PacketKind::ReceivedAck).await.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_file_name_is_scoped() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let file = Frame::new(Packet::Audio(MediaPayload {
            message_id: MessageId(9),
            sender_id: BOB,
            receiver_id: ME,
            timestamp: 6,
            file_name: "../voice.ogg".to_string(),
            data: vec![1, 2],
        }));
        h.messenger.handle_frame(file).await.unwrap();

        let stored = h.store.conversation(BOB);
        assert_eq!(
            stored[0].content,
            MessageContent::Audio {
                file_ref: format!("{BOB}-9-voice.ogg"),
            }
        );
    }

    #[tokio::test]
    async fn test_acks_advance_monotonically() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let sent = h.messenger.send_text(BOB, "one").await.unwrap().unwrap();

        let read = Frame::new(Packet::ReadAck(AckPayload {
            message_id: sent.id,
            sender_id: BOB,
            receiver_id: ME,
        }));
        let received = Frame::new(Packet::ReceivedAck(AckPayload {
            message_id: sent.id,
            sender_id: BOB,
            receiver_id: ME,
        }));
        h.messenger.handle_frame(read).await.unwrap();
        h.messenger.handle_frame(received).await.unwrap();

        let stored = h.store.get_message_by_id(sent.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Read);
    }

    #[tokio::test]
    async fn test_unknown_ack_is_ignored() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let ack = Frame::new(Packet::ReceivedAck(AckPayload {
            message_id: MessageId(404),
            sender_id: BOB,
            receiver_id: ME,
        }));
        assert!(h.messenger.handle_frame(ack).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_batch_sends_one_ack() {
        let h = harness(EncryptionPolicy::Opportunistic);
        for id in 1..=3 {
            h.messenger.handle_frame(inbound_text(id, id)).await.unwrap();
        }
        h.messenger.send_text(BOB, "mine").await.unwrap();
        h.bob.drain(PacketKind::ReceivedAck).await;

        let displayed = h.store.conversation(BOB);
        let last_unread = displayed
            .iter()
            .filter(|m| m.sender_id == BOB)
            .map(|m| m.id)
            .max()
            .unwrap();

        let acked = h
            .messenger
            .mark_conversation_read(BOB, &displayed)
            .await
            .unwrap();
        assert_eq!(acked, Some(last_unread));

        let acks = h.bob.drain(PacketKind::ReadAck).await;
        assert_eq!(acks.len(), 1);
        assert!(h
            .store
            .conversation(BOB)
            .iter()
            .filter(|m| m.sender_id == BOB)
            .all(|m| m.state == DeliveryState::Read));

        let again = h.store.conversation(BOB);
        assert_eq!(
            h.messenger.mark_conversation_read(BOB, &again).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_foreign_packets_are_ignored() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let frame = Frame::new(Packet::CallRequest(CallRequest {
            sender_id: BOB,
            receiver_id: PeerId(3),
        }));
        h.messenger.handle_frame(frame).await.unwrap();
        assert!(h.messenger.call_signals().request().is_none());
    }

    #[tokio::test]
    async fn test_keepalive_refreshes_and_requests_profile() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let carol = PeerId(1_000_000_003);
        let frame = Frame::new(Packet::Keepalive {
            sender_id: carol,
            devices: vec![
                DeviceInfo {
                    address: None,
                    keepalive: 1_000,
                    account: AccountRecord {
                        peer_id: carol,
                        profile_updated_at: 4,
                    },
                },
                DeviceInfo {
                    address: Some("10.0.0.1".to_string()),
                    keepalive: 1_000,
                    account: AccountRecord {
                        peer_id: ME,
                        profile_updated_at: 1,
                    },
                },
            ],
        })
        .with_source("10.0.0.2");
        h.messenger.handle_frame(frame).await.unwrap();

        assert_eq!(
            h.messenger.directory().resolve(carol).as_deref(),
            Some("10.0.0.2")
        );
        assert!(h.messenger.directory().get(ME).is_none());
        assert_eq!(h.bob.drain(PacketKind::ProfileRequest).await.len(), 1);
    }

    #[tokio::test]
    async fn test_keepalive_lists_self_last() {
        let h = harness(EncryptionPolicy::Opportunistic);
        match h.messenger.keepalive_packet() {
            Packet::Keepalive { sender_id, devices } => {
                assert_eq!(sender_id, ME);
                assert_eq!(devices.len(), 2);
                assert_eq!(devices[0].account.peer_id, BOB);
                assert_eq!(devices[1].account.peer_id, ME);
                assert_eq!(devices[1].address.as_deref(), Some("10.0.0.1"));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_own_profile_bumps_version() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let before = h.messenger.own_profile().updated_at;
        let profile = h
            .messenger
            .update_own_profile("renamed", Some(("avatar.png", b"png")))
            .await
            .unwrap();
        assert!(profile.updated_at > before);
        assert_eq!(profile.username, "renamed");
        assert_eq!(h.media.len(), 1);
    }

    #[tokio::test]
    async fn test_account_failure_spares_other_devices() {
        let inner = Arc::new(MemoryStore::new());
        let h = harness_with(
            EncryptionPolicy::Opportunistic,
            Arc::new(ManualClock::new(1_000)),
            Some(Arc::new(RejectAccountOf {
                inner: inner.clone(),
                peer_id: PeerId(5),
            })),
            None,
        );

        let device = |id: u64| DeviceInfo {
            address: Some(format!("10.0.0.{id}")),
            keepalive: 1_000,
            account: AccountRecord {
                peer_id: PeerId(id),
                profile_updated_at: 1,
            },
        };
        let frame = Frame::new(Packet::Keepalive {
            sender_id: PeerId(9),
            devices: vec![device(5), device(6), device(9)],
        });
        h.messenger.handle_frame(frame).await.unwrap();

        let directory = h.messenger.directory();
        for id in [5, 6, 9] {
            assert_eq!(
                directory.resolve(PeerId(id)),
                Some(format!("10.0.0.{id}"))
            );
        }
        assert!(inner.get_account(PeerId(5)).await.unwrap().is_none());
        assert!(inner.get_account(PeerId(6)).await.unwrap().is_some());
        assert!(inner.get_account(PeerId(9)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_outbound_media_names_do_not_collide() {
        let h = harness(EncryptionPolicy::Opportunistic);
        let first = h
            .messenger
            .send_file(BOB, "photo.jpg", b"FIRST")
            .await
            .unwrap()
            .unwrap();
        let second = h
            .messenger
            .send_file(BOB, "photo.jpg", b"SECOND")
            .await
            .unwrap()
            .unwrap();

        let file_ref = |message: &Message| match &message.content {
            MessageContent::File { file_ref } => file_ref.clone(),
            other => panic!("unexpected content {other:?}"),
        };
        assert_ne!(file_ref(&first), file_ref(&second));
        assert_eq!(h.media.load(&file_ref(&first)).await.unwrap(), b"FIRST");
        assert_eq!(h.media.load(&file_ref(&second)).await.unwrap(), b"SECOND");

        for frame in h.bob.drain(PacketKind::File).await {
            match frame.packet {
                Packet::File(payload) => assert_eq!(payload.file_name, "photo.jpg"),
                other => panic!("unexpected packet {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_dropped_at_sealing_leaves_no_row() {
        let clock = Arc::new(ManualClock::new(1_000));
        let h = harness_with(
            EncryptionPolicy::Opportunistic,
            clock.clone(),
            None,
            Some(Arc::new(SlowMedia {
                clock: clock.clone(),
            })),
        );

        let bob_sessions = SessionEngine::new(
            Arc::new(IdentityKeyStore::in_memory()),
            clock.clone(),
            SESSION_TIMEOUT_MS,
        );
        let offer = bob_sessions.create_handshake_offer(BOB, false).unwrap();
        h.messenger
            .sessions()
            .accept_handshake(BOB, &offer.public_key)
            .unwrap();

        let sent = h.messenger.send_file(BOB, "late.bin", b"bytes").await.unwrap();
        assert!(sent.is_none());
        assert_eq!(h.store.message_count(), 0);
        assert!(h.bob.drain(PacketKind::Envelope).await.is_empty());
        assert!(h.bob.drain(PacketKind::File).await.is_empty());
    }
}
