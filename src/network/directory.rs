//! Live-peer table fed by keepalive signals.
//!
//! Entries are replaced whole on every refresh (last writer wins) and evicted
//! once their keepalive is older than the liveness timeout. The set of online
//! peers is also published on a watch channel so observers always see the
//! latest membership without polling.

use crate::messaging::PeerId;
use crate::utils::Clock;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// A peer seen on the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Device id
    pub peer_id: PeerId,
    /// Network address, when the peer's address is known
    pub address: Option<String>,
    /// Sender-side time of the latest keepalive, in milliseconds
    pub last_keepalive: u64,
    /// Profile version advertised with the keepalive
    pub profile_updated_at: u64,
}

/// Result of [`PeerDirectory::refresh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The peer was not in the table
    Inserted,
    /// An existing entry was replaced
    Replaced,
}

/// The live-peer table
#[derive(Debug)]
pub struct PeerDirectory {
    clock: Arc<dyn Clock>,
    liveness_timeout_ms: u64,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    online: watch::Sender<Vec<PeerId>>,
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new(clock: Arc<dyn Clock>, liveness_timeout_ms: u64) -> Self {
        let (online, _) = watch::channel(Vec::new());
        Self {
            clock,
            liveness_timeout_ms,
            peers: RwLock::new(HashMap::new()),
            online,
        }
    }

    fn is_stale(&self, record: &PeerRecord, now: u64) -> bool {
        now.saturating_sub(record.last_keepalive) > self.liveness_timeout_ms
    }

    fn publish(&self, peers: &HashMap<PeerId, PeerRecord>) {
        let mut online: Vec<PeerId> = peers.keys().copied().collect();
        online.sort_unstable();
        self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Insert or replace the entry for `record.peer_id`
    pub fn refresh(&self, record: PeerRecord) -> RefreshOutcome {
        let mut peers = self.peers.write();
        let peer_id = record.peer_id;
        let outcome = match peers.insert(peer_id, record) {
            Some(_) => RefreshOutcome::Replaced,
            None => RefreshOutcome::Inserted,
        };

        if outcome == RefreshOutcome::Inserted {
            log::info!("Peer {} joined", peer_id);
            self.publish(&peers);
        }
        outcome
    }

    /// Evict every entry whose keepalive is older than the liveness timeout
    /// as of `now`. Returns the evicted peers.
    pub fn sweep_expired(&self, now: u64) -> Vec<PeerId> {
        let mut peers = self.peers.write();
        let mut evicted = Vec::new();
        peers.retain(|peer_id, record| {
            let stale = now.saturating_sub(record.last_keepalive) > self.liveness_timeout_ms;
            if stale {
                evicted.push(*peer_id);
            }
            !stale
        });

        if !evicted.is_empty() {
            evicted.sort_unstable();
            log::info!("Peers left: {:?}", evicted);
            self.publish(&peers);
        }
        evicted
    }

    /// Address of a live peer
    pub fn resolve(&self, peer_id: PeerId) -> Option<String> {
        let now = self.clock.now_millis();
        self.peers
            .read()
            .get(&peer_id)
            .filter(|record| !self.is_stale(record, now))
            .and_then(|record| record.address.clone())
    }

    /// Entry for a live peer
    pub fn get(&self, peer_id: PeerId) -> Option<PeerRecord> {
        let now = self.clock.now_millis();
        self.peers
            .read()
            .get(&peer_id)
            .filter(|record| !self.is_stale(record, now))
            .cloned()
    }

    /// Every live entry, ordered by peer id
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let now = self.clock.now_millis();
        let mut records: Vec<PeerRecord> = self
            .peers
            .read()
            .values()
            .filter(|record| !self.is_stale(record, now))
            .cloned()
            .collect();
        records.sort_unstable_by_key(|record| record.peer_id);
        records
    }

    /// Addresses of every live peer that has one
    pub fn addresses(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|record| record.address)
            .collect()
    }

    /// Number of entries, including ones awaiting the next sweep
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Watch the set of peers currently in the table
    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerId>> {
        self.online.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::LIVENESS_TIMEOUT_MS;
    use crate::utils::ManualClock;

    fn record(peer: u64, address: &str, keepalive: u64) -> PeerRecord {
        PeerRecord {
            peer_id: PeerId(peer),
            address: Some(address.to_string()),
            last_keepalive: keepalive,
            profile_updated_at: 0,
        }
    }

    fn directory() -> (PeerDirectory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (PeerDirectory::new(clock.clone(), LIVENESS_TIMEOUT_MS), clock)
    }

    #[test]
    fn test_resolve_then_expire() {
        let (directory, clock) = directory();
        directory.refresh(record(42, "10.0.0.5", 0));
        assert_eq!(directory.resolve(PeerId(42)).as_deref(), Some("10.0.0.5"));

        clock.set(3_100);
        assert_eq!(directory.sweep_expired(3_100), vec![PeerId(42)]);
        assert_eq!(directory.resolve(PeerId(42)), None);
    }

    #[test]
    fn test_liveness_boundary() {
        let (directory, _clock) = directory();
        directory.refresh(record(7, "10.0.0.7", 1_000));

        assert!(directory.sweep_expired(4_000).is_empty());
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.sweep_expired(4_001), vec![PeerId(7)]);
        assert!(directory.is_empty());
    }

    #[test]
    fn test_stale_entry_not_resolved_before_sweep() {
        let (directory, clock) = directory();
        directory.refresh(record(9, "10.0.0.9", 0));
        clock.set(3_001);
        assert_eq!(directory.resolve(PeerId(9)), None);
        assert!(directory.snapshot().is_empty());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_refresh_replaces_whole_record() {
        let (directory, _clock) = directory();
        assert_eq!(
            directory.refresh(record(1, "10.0.0.1", 0)),
            RefreshOutcome::Inserted
        );
        let update = PeerRecord {
            address: None,
            ..record(1, "", 10)
        };
        assert_eq!(directory.refresh(update.clone()), RefreshOutcome::Replaced);
        assert_eq!(directory.get(PeerId(1)), Some(update));
        assert_eq!(directory.resolve(PeerId(1)), None);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let (directory, _clock) = directory();
        directory.refresh(record(3, "10.0.0.3", 5));
        directory.refresh(record(3, "10.0.0.3", 5));
        assert_eq!(directory.snapshot(), vec![record(3, "10.0.0.3", 5)]);
    }

    #[test]
    fn test_unknown_peer() {
        let (directory, _clock) = directory();
        assert_eq!(directory.resolve(PeerId(404)), None);
    }

    #[test]
    fn test_online_watch() {
        let (directory, _clock) = directory();
        let rx = directory.subscribe();

        directory.refresh(record(2, "10.0.0.2", 0));
        directory.refresh(record(1, "10.0.0.1", 0));
        assert_eq!(*rx.borrow(), vec![PeerId(1), PeerId(2)]);

        directory.sweep_expired(10_000);
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn test_addresses_skip_unknown() {
        let (directory, _clock) = directory();
        directory.refresh(record(1, "10.0.0.1", 0));
        directory.refresh(PeerRecord {
            address: None,
            ..record(2, "", 0)
        });
        assert_eq!(directory.addresses(), vec!["10.0.0.1".to_string()]);
    }
}
