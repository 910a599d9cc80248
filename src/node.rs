//! A complete mesh device.
//!
//! [`MeshNode`] owns the directory, session table and call slots of one
//! device, wires them to a transport and stores, and runs the background
//! work: keepalive broadcast, discovery probes, directory and session sweeps,
//! and one listen loop per packet kind.

use crate::crypto::{DeviceIdentity, IdentityKeyStore};
use crate::messaging::{
    CallSignals, Message, MessageId, Messenger, MessengerOptions, MessengerServices, PeerId,
    Profile,
};
use crate::network::{PeerDirectory, PeerRecord};
use crate::session::SessionEngine;
use crate::storage::{MediaStore, Persistence};
use crate::transport::{PacketKind, Transport};
use crate::utils::{spawn_named, spawn_periodic, Clock, MeshConfig, Result, TaskSet};
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// First pause after a failed listen
const LISTEN_BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Longest pause between failed listens
const LISTEN_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// One device on the mesh
pub struct MeshNode {
    config: MeshConfig,
    identity: DeviceIdentity,
    messenger: Arc<Messenger>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    tasks: Mutex<TaskSet>,
}

impl fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshNode")
            .field("identity", &self.identity)
            .field("address", &self.transport.local_address())
            .field("tasks", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl MeshNode {
    /// Assemble a node. Nothing runs until [`Self::start`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MeshConfig,
        identity: DeviceIdentity,
        keys: Arc<IdentityKeyStore>,
        mut profile: Profile,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
        media: Arc<dyn MediaStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        profile.peer_id = identity.peer_id;

        let directory = Arc::new(PeerDirectory::new(
            clock.clone(),
            config.network.liveness_timeout_ms,
        ));
        let sessions = Arc::new(SessionEngine::new(
            keys,
            clock.clone(),
            config.crypto.session_timeout_ms,
        ));
        let messenger = Arc::new(Messenger::new(
            profile,
            MessengerOptions::from_config(&config),
            directory,
            sessions,
            Arc::new(CallSignals::new()),
            MessengerServices {
                transport: transport.clone(),
                store,
                media,
                clock: clock.clone(),
            },
        ));

        Self {
            config,
            identity,
            messenger,
            transport,
            clock,
            tasks: Mutex::new(TaskSet::new()),
        }
    }

    /// Spawn the periodic tasks and listen loops. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            log::warn!("Node {} already running", self.identity.peer_id);
            return;
        }

        let network = &self.config.network;

        let messenger = self.messenger.clone();
        tasks.push(spawn_periodic(
            "keepalive",
            Duration::from_millis(network.keepalive_interval_ms),
            move || {
                let messenger = messenger.clone();
                async move {
                    messenger.broadcast_keepalive().await;
                }
                .boxed()
            },
        ));

        let messenger = self.messenger.clone();
        tasks.push(spawn_periodic(
            "discovery",
            Duration::from_millis(network.discovery_interval_ms),
            move || {
                let messenger = messenger.clone();
                async move {
                    if let Err(e) = messenger.discover().await {
                        log::debug!("Discovery probe failed: {}", e);
                    }
                }
                .boxed()
            },
        ));

        let directory = self.messenger.directory().clone();
        let clock = self.clock.clone();
        tasks.push(spawn_periodic(
            "directory-sweep",
            Duration::from_millis(network.sweep_interval_ms),
            move || {
                directory.sweep_expired(clock.now_millis());
                futures::future::ready(()).boxed()
            },
        ));

        let sessions = self.messenger.sessions().clone();
        let clock = self.clock.clone();
        tasks.push(spawn_periodic(
            "session-sweep",
            Duration::from_secs(self.config.crypto.session_sweep_interval_secs),
            move || {
                let expired = sessions.expire_sweep(clock.now_millis());
                if expired > 0 {
                    log::info!("Expired {} idle session(s)", expired);
                }
                futures::future::ready(()).boxed()
            },
        ));

        for kind in PacketKind::ALL {
            tasks.push(spawn_named(
                kind.name(),
                listen_loop(self.transport.clone(), self.messenger.clone(), kind),
            ));
        }

        log::info!(
            "Node {} started with {} background tasks",
            self.identity.peer_id,
            tasks.len()
        );
    }

    /// Stop every background task and drop all sessions
    pub fn shutdown(&self) {
        self.tasks.lock().shutdown();
        self.messenger.sessions().clear();
        log::info!("Node {} stopped", self.identity.peer_id);
    }

    /// Whether background tasks are running
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// This device's identity
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// This device's id
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    /// Active configuration
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// The messaging engine
    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Live-peer table
    pub fn directory(&self) -> &Arc<PeerDirectory> {
        self.messenger.directory()
    }

    /// Session table
    pub fn sessions(&self) -> &Arc<SessionEngine> {
        self.messenger.sessions()
    }

    /// Call signal slots
    pub fn call_signals(&self) -> &Arc<CallSignals> {
        self.messenger.call_signals()
    }

    /// Peers currently considered live
    pub fn online_peers(&self) -> Vec<PeerRecord> {
        self.directory().snapshot()
    }

    /// Watch membership changes
    pub fn subscribe_online(&self) -> watch::Receiver<Vec<PeerId>> {
        self.directory().subscribe()
    }

    /// See [`Messenger::send_text`]
    pub async fn send_text(&self, peer_id: PeerId, text: &str) -> Result<Option<Message>> {
        self.messenger.send_text(peer_id, text).await
    }

    /// See [`Messenger::send_file`]
    pub async fn send_file(
        &self,
        peer_id: PeerId,
        file_name: &str,
        data: &[u8],
    ) -> Result<Option<Message>> {
        self.messenger.send_file(peer_id, file_name, data).await
    }

    /// See [`Messenger::send_audio`]
    pub async fn send_audio(
        &self,
        peer_id: PeerId,
        file_name: &str,
        data: &[u8],
    ) -> Result<Option<Message>> {
        self.messenger.send_audio(peer_id, file_name, data).await
    }

    /// Invite a peer to a call
    pub async fn send_call_request(&self, peer_id: PeerId) -> Result<bool> {
        self.messenger.send_call_request(peer_id).await
    }

    /// Answer a call invitation
    pub async fn send_call_response(&self, peer_id: PeerId, accepted: bool) -> Result<bool> {
        self.messenger.send_call_response(peer_id, accepted).await
    }

    /// Hang up
    pub async fn send_call_end(&self, peer_id: PeerId) -> Result<bool> {
        self.messenger.send_call_end(peer_id).await
    }

    /// Relay call audio
    pub async fn send_call_fragment(&self, peer_id: PeerId, bytes: Vec<u8>) -> Result<bool> {
        self.messenger.send_call_fragment(peer_id, bytes).await
    }

    /// Clear the call request, response and end slots
    pub fn reset_call_signals(&self) {
        self.call_signals().reset();
    }

    /// See [`Messenger::mark_conversation_read`]
    pub async fn mark_conversation_read(
        &self,
        peer_id: PeerId,
        displayed: &[Message],
    ) -> Result<Option<MessageId>> {
        self.messenger.mark_conversation_read(peer_id, displayed).await
    }

    /// Offer a session to a peer
    pub async fn initiate_handshake(&self, peer_id: PeerId) -> Result<bool> {
        self.messenger.initiate_handshake(peer_id).await
    }

    /// See [`Messenger::update_own_profile`]
    pub async fn update_own_profile(
        &self,
        username: &str,
        image: Option<(&str, &[u8])>,
    ) -> Result<Profile> {
        self.messenger.update_own_profile(username, image).await
    }

    /// Fingerprint of this device's agreement key
    pub fn own_fingerprint(&self) -> Result<String> {
        self.sessions().own_fingerprint()
    }
}

async fn listen_loop(transport: Arc<dyn Transport>, messenger: Arc<Messenger>, kind: PacketKind) {
    let mut backoff = LISTEN_BACKOFF_MIN;
    loop {
        match transport.listen(kind).await {
            Ok(frame) => {
                backoff = LISTEN_BACKOFF_MIN;
                if let Err(e) = messenger.handle_frame(frame).await {
                    log::warn!("Handling {} failed: {}", kind, e);
                }
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("Listening for {} failed: {}", kind, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(LISTEN_BACKOFF_MAX);
            }
            Err(e) => {
                log::error!("Stopped listening for {}: {}", kind, e);
                return;
            }
        }
    }
}
