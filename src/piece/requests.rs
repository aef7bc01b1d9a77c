use crate::tracker::PeerId;
use std::collections::HashMap;

/// `(piece_index, block_offset)`
pub type BlockKey = (u32, u32);

/// Every block currently in flight and the single peer it was asked from.
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: HashMap<BlockKey, PeerId>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute `key` to `peer`. Fails if any peer already owns it.
    pub fn claim(&mut self, key: BlockKey, peer: &PeerId) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, peer.clone());
        true
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn owner(&self, key: &BlockKey) -> Option<&PeerId> {
        self.entries.get(key)
    }

    pub fn release(&mut self, key: &BlockKey) -> Option<PeerId> {
        self.entries.remove(key)
    }

    pub fn release_if_owned(&mut self, key: &BlockKey, peer: &PeerId) -> bool {
        if self.entries.get(key) == Some(peer) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Drop every entry attributed to `peer`, returning the freed keys in order
    pub fn release_peer(&mut self, peer: &PeerId) -> Vec<BlockKey> {
        let mut released: Vec<BlockKey> = self
            .entries
            .iter()
            .filter(|(_, owner)| *owner == peer)
            .map(|(key, _)| *key)
            .collect();
        released.sort_unstable();

        for key in &released {
            self.entries.remove(key);
        }
        released
    }

    pub fn outstanding_for(&self, peer: &PeerId) -> usize {
        self.entries.values().filter(|owner| *owner == peer).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_owner_per_block() {
        let mut table = RequestTable::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        assert!(table.claim((0, 0), &a));
        assert!(!table.claim((0, 0), &b));
        assert!(!table.claim((0, 0), &a));
        assert_eq!(table.owner(&(0, 0)), Some(&a));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_peer_removes_exactly_its_entries() {
        let mut table = RequestTable::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        table.claim((1, 512), &a);
        table.claim((0, 0), &a);
        table.claim((0, 512), &b);

        assert_eq!(table.release_peer(&a), vec![(0, 0), (1, 512)]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.outstanding_for(&a), 0);
        assert_eq!(table.owner(&(0, 512)), Some(&b));
        assert!(table.release_peer(&a).is_empty());
    }

    #[test]
    fn test_release_if_owned() {
        let mut table = RequestTable::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        table.claim((2, 0), &a);
        assert!(!table.release_if_owned(&(2, 0), &b));
        assert!(table.release_if_owned(&(2, 0), &a));
        assert!(table.is_empty());
    }
}
