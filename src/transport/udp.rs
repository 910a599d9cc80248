//! UDP datagram transport for the local wireless network.
//!
//! Every device binds one socket on the shared mesh port. Each frame is a
//! single datagram; a reader task decodes inbound datagrams and routes them
//! into the per-kind queues. Discovery probes go to the broadcast address.

use crate::transport::{Frame, Packet, PacketKind, Transport, MAX_FRAME_SIZE};
use crate::utils::{spawn_named, NetworkConfig, NetworkError, Result, TaskHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// UDP transport bound to the mesh port
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
    advertised_address: Option<String>,
    inbound: HashMap<PacketKind, Mutex<mpsc::Receiver<Frame>>>,
    _reader: TaskHandle,
}

impl UdpTransport {
    /// Bind the socket described by `config` and start the reader task
    pub async fn bind(config: &NetworkConfig) -> Result<Self> {
        let bind_address = format!("{}:{}", config.bind_address, config.listen_port);
        let socket = UdpSocket::bind(&bind_address)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: bind_address.clone(),
                reason: e.to_string(),
            })?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let port = socket.local_addr()?.port();

        let mut senders = HashMap::new();
        let mut inbound = HashMap::new();
        for kind in PacketKind::ALL {
            let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
            senders.insert(kind, tx);
            inbound.insert(kind, Mutex::new(rx));
        }

        let reader = spawn_named("udp-reader", Self::read_loop(socket.clone(), senders));
        log::info!("UDP transport listening on {}", bind_address);

        Ok(Self {
            socket,
            port,
            advertised_address: config.advertised_address.clone(),
            inbound,
            _reader: reader,
        })
    }

    async fn read_loop(socket: Arc<UdpSocket>, senders: HashMap<PacketKind, mpsc::Sender<Frame>>) {
        let mut buf = vec![0u8; MAX_FRAME_SIZE + 1];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("UDP receive failed: {}", e);
                    continue;
                }
            };

            let frame = match Frame::from_bytes(&buf[..len]) {
                Ok(frame) => frame.with_source(from.ip().to_string()),
                Err(e) => {
                    log::debug!("Discarding datagram from {}: {}", from, e);
                    continue;
                }
            };

            let kind = frame.packet.kind();
            if let Some(tx) = senders.get(&kind) {
                if tx.try_send(frame).is_err() {
                    log::warn!("Dropping {} frame from {}: queue full", kind, from);
                }
            }
        }
    }

    /// Port the socket is bound to
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn resolve(&self, address: &str) -> Result<SocketAddr> {
        if let Ok(socket_addr) = address.parse::<SocketAddr>() {
            return Ok(socket_addr);
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        tokio::net::lookup_host((address, self.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                NetworkError::InvalidAddress {
                    address: address.to_string(),
                }
                .into()
            })
    }

    async fn send_frame(&self, target: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, target).await.map_err(|e| {
            NetworkError::Transport {
                reason: format!("send to {target} failed: {e}"),
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, address: &str, packet: &Packet) -> Result<()> {
        let bytes = Frame::new(packet.clone()).to_bytes()?;
        let target = self.resolve(address).await?;
        self.send_frame(target, &bytes).await
    }

    async fn listen(&self, kind: PacketKind) -> Result<Frame> {
        let rx = self.inbound.get(&kind).ok_or_else(|| NetworkError::ChannelClosed {
            kind: kind.to_string(),
        })?;
        rx.lock().await.recv().await.ok_or_else(|| {
            NetworkError::ChannelClosed {
                kind: kind.to_string(),
            }
            .into()
        })
    }

    async fn discover_peers(&self, probe: &Packet) -> Result<()> {
        let bytes = Frame::new(probe.clone()).to_bytes()?;
        let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.port);
        self.send_frame(broadcast, &bytes).await.map_err(|e| {
            NetworkError::DiscoveryFailed {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn local_address(&self) -> Option<String> {
        self.advertised_address.clone()
    }
}
