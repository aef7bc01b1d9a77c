use super::{PeerId, PeerInfo};
use crate::error::{Result, SwarmError};
use crate::piece::{FileId, PieceSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A registered peer and when it was last heard from
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub info: PeerInfo,
    pub last_seen: Instant,
}

/// One swarm: which peer holds which pieces of a file
#[derive(Debug, Clone, Default)]
pub struct FileEntry {
    pub piece_count: u32,
    pub holders: BTreeMap<PeerId, PieceSet>,
}

impl FileEntry {
    fn is_seeder(&self, pieces: &PieceSet) -> bool {
        (0..self.piece_count).all(|index| pieces.contains(&index))
    }
}

/// A swarm member as returned by peer discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmMember {
    pub addr: SocketAddr,
    pub pieces_held: PieceSet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub leechers: u32,
}

/// Tracker directory of peers and file ownership.
///
/// Callers share it as `Arc<Mutex<Registry>>`; every method is a pure
/// in-memory transition so the lock is never held across I/O.
#[derive(Debug)]
pub struct Registry {
    peer_timeout: Duration,
    peers: HashMap<PeerId, PeerRecord>,
    files: HashMap<FileId, FileEntry>,
}

impl Registry {
    pub fn new(peer_timeout: Duration) -> Self {
        Self {
            peer_timeout,
            peers: HashMap::new(),
            files: HashMap::new(),
        }
    }

    /// Upsert a peer and its holdings for `file_id`
    pub fn register(
        &mut self,
        info: PeerInfo,
        file_id: FileId,
        pieces_held: PieceSet,
        piece_count: u32,
    ) {
        self.register_at(info, file_id, pieces_held, piece_count, Instant::now());
    }

    pub fn register_at(
        &mut self,
        info: PeerInfo,
        file_id: FileId,
        pieces_held: PieceSet,
        piece_count: u32,
        now: Instant,
    ) {
        let peer_id = info.peer_id.clone();
        debug!(
            "Register {} at {} for {} ({} pieces)",
            peer_id,
            info.addr,
            file_id,
            pieces_held.len()
        );

        self.peers.insert(
            peer_id.clone(),
            PeerRecord {
                info,
                last_seen: now,
            },
        );

        let entry = self.files.entry(file_id).or_default();
        if piece_count > 0 {
            entry.piece_count = piece_count;
        }
        let known_count = entry.piece_count;
        let pieces_held = pieces_held
            .into_iter()
            .filter(|&index| known_count == 0 || index < known_count)
            .collect();
        entry.holders.insert(peer_id, pieces_held);
    }

    /// Remove a peer entirely. Returns false if it was not registered.
    pub fn unregister(&mut self, peer_id: &PeerId, file_id: &FileId) -> bool {
        let known = self.peers.contains_key(peer_id);
        self.purge(peer_id);
        if known {
            info!("Peer {} unregistered from {}", peer_id, file_id);
        }
        known
    }

    pub fn heartbeat(&mut self, peer_id: &PeerId) -> Result<()> {
        self.heartbeat_at(peer_id, Instant::now())
    }

    pub fn heartbeat_at(&mut self, peer_id: &PeerId, now: Instant) -> Result<()> {
        let record = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SwarmError::NotFound(format!("Peer {} not registered", peer_id)))?;
        record.last_seen = now;
        Ok(())
    }

    /// Members of a swarm; empty when nobody holds the file
    pub fn get_peers(&self, file_id: &FileId) -> BTreeMap<PeerId, SwarmMember> {
        let Some(entry) = self.files.get(file_id) else {
            return BTreeMap::new();
        };

        entry
            .holders
            .iter()
            .filter_map(|(peer_id, pieces)| {
                let record = self.peers.get(peer_id)?;
                Some((
                    peer_id.clone(),
                    SwarmMember {
                        addr: record.info.addr,
                        pieces_held: pieces.clone(),
                    },
                ))
            })
            .collect()
    }

    /// Seeder/leecher counts per known file. Unknown ids are left out.
    pub fn scrape(&self, file_ids: &[FileId]) -> BTreeMap<FileId, ScrapeStats> {
        file_ids
            .iter()
            .filter_map(|file_id| {
                let entry = self.files.get(file_id)?;
                let mut stats = ScrapeStats::default();
                for pieces in entry.holders.values() {
                    if entry.is_seeder(pieces) {
                        stats.seeders += 1;
                    } else {
                        stats.leechers += 1;
                    }
                }
                Some((file_id.clone(), stats))
            })
            .collect()
    }

    /// Expire every peer silent for longer than the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, record)| {
                now.saturating_duration_since(record.last_seen) > self.peer_timeout
            })
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        for peer_id in &expired {
            info!("Removing inactive peer: {}", peer_id);
            self.purge(peer_id);
        }
        expired
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn purge(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
        for entry in self.files.values_mut() {
            entry.holders.remove(peer_id);
        }
        self.files.retain(|_, entry| !entry.holders.is_empty());
    }
}
