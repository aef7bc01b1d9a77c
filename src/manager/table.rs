use crate::peer::{PeerMessage, PeerState};
use crate::piece::PieceSet;
use crate::tracker::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Stable handle to a slot. A slot reused for a later connection gets a new
/// generation, so stale handles never reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

/// Everything the manager knows about one connected peer
#[derive(Debug)]
pub struct PeerSlot {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub conn: ConnState,
    pub state: PeerState,
    pub pieces: PieceSet,
    pub sender: UnboundedSender<PeerMessage>,
}

impl PeerSlot {
    pub fn new(
        peer_id: PeerId,
        addr: SocketAddr,
        conn: ConnState,
        sender: UnboundedSender<PeerMessage>,
    ) -> Self {
        Self {
            peer_id,
            addr,
            conn,
            state: PeerState::default(),
            pieces: PieceSet::new(),
            sender,
        }
    }

    pub fn is_active(&self) -> bool {
        self.conn == ConnState::Active
    }

    /// Queue a message for the connection's writer. False once the writer is gone.
    pub fn send(&mut self, message: PeerMessage) -> bool {
        self.state.on_sent(&message);
        self.sender.send(message).is_ok()
    }
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    slot: Option<PeerSlot>,
}

/// Arena of peer slots. Removal tombstones a slot in place; live slots never move.
#[derive(Debug, Default)]
pub struct PeerTable {
    entries: Vec<Entry>,
    by_peer: HashMap<PeerId, SlotId>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of occupied slots, in any state
    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.by_peer.contains_key(peer_id)
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<SlotId> {
        self.by_peer.get(peer_id).copied()
    }

    /// Occupy a tombstoned slot or append one. None if the peer already has a slot.
    pub fn insert(&mut self, slot: PeerSlot) -> Option<SlotId> {
        if self.by_peer.contains_key(&slot.peer_id) {
            return None;
        }

        let peer_id = slot.peer_id.clone();
        let id = match self.entries.iter().position(|entry| entry.slot.is_none()) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.generation += 1;
                entry.slot = Some(slot);
                SlotId {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    slot: Some(slot),
                });
                SlotId {
                    index: self.entries.len() - 1,
                    generation: 0,
                }
            }
        };

        self.by_peer.insert(peer_id, id);
        Some(id)
    }

    pub fn get(&self, id: SlotId) -> Option<&PeerSlot> {
        self.entries
            .get(id.index)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.slot.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut PeerSlot> {
        self.entries
            .get_mut(id.index)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.slot.as_mut())
    }

    /// Tombstone the slot if `id` is still current
    pub fn remove(&mut self, id: SlotId) -> Option<PeerSlot> {
        let entry = self.entries.get_mut(id.index)?;
        if entry.generation != id.generation {
            return None;
        }

        let mut slot = entry.slot.take()?;
        slot.conn = ConnState::Closed;
        self.by_peer.remove(&slot.peer_id);
        Some(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &PeerSlot)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.slot.as_ref().map(|slot| {
                (
                    SlotId {
                        index,
                        generation: entry.generation,
                    },
                    slot,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerSlot> {
        self.entries.iter_mut().filter_map(|entry| entry.slot.as_mut())
    }

    pub fn active(&self) -> impl Iterator<Item = &PeerSlot> {
        self.iter().map(|(_, slot)| slot).filter(|slot| slot.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Queue `message` on every active connection
    pub fn broadcast(&mut self, message: &PeerMessage) -> usize {
        self.iter_mut()
            .filter(|slot| slot.is_active())
            .map(|slot| slot.send(message.clone()))
            .filter(|sent| *sent)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn slot(name: &str) -> (PeerSlot, mpsc::UnboundedReceiver<PeerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = "127.0.0.1:7000".parse().unwrap();
        (PeerSlot::new(PeerId::from(name), addr, ConnState::Connecting, tx), rx)
    }

    #[test]
    fn test_insert_rejects_duplicate_peer() {
        let mut table = PeerTable::new();
        let (a, _rx_a) = slot("a");
        let (a2, _rx_a2) = slot("a");

        assert!(table.insert(a).is_some());
        assert!(table.insert(a2).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_handle_cannot_touch_reused_slot() {
        let mut table = PeerTable::new();
        let (a, _rx_a) = slot("a");
        let (b, _rx_b) = slot("b");

        let old = table.insert(a).unwrap();
        assert_eq!(table.remove(old).unwrap().conn, ConnState::Closed);

        let new = table.insert(b).unwrap();
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.remove(old).is_none());
        assert_eq!(table.get(new).unwrap().peer_id, PeerId::from("b"));
    }

    #[test]
    fn test_removal_keeps_other_slots_in_place() {
        let mut table = PeerTable::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let (s, rx) = slot(name);
            receivers.push(rx);
            ids.push(table.insert(s).unwrap());
        }

        table.remove(ids[1]);

        assert_eq!(table.get(ids[0]).unwrap().peer_id, PeerId::from("a"));
        assert_eq!(table.get(ids[2]).unwrap().peer_id, PeerId::from("c"));
        assert_eq!(table.lookup(&PeerId::from("c")), Some(ids[2]));
        assert!(!table.contains(&PeerId::from("b")));
    }

    #[test]
    fn test_broadcast_reaches_active_only() {
        let mut table = PeerTable::new();
        let (a, mut rx_a) = slot("a");
        let (b, mut rx_b) = slot("b");
        let id_a = table.insert(a).unwrap();
        table.insert(b).unwrap();
        table.get_mut(id_a).unwrap().conn = ConnState::Active;

        assert_eq!(table.broadcast(&PeerMessage::Have { piece_index: 2 }), 1);
        assert_eq!(rx_a.try_recv().unwrap(), PeerMessage::Have { piece_index: 2 });
        assert!(rx_b.try_recv().is_err());
        assert_eq!(table.active_count(), 1);
    }
}
