use super::{BlockInfo, BlockWrite, PieceStore, RequestTable};
use crate::error::Result;
use crate::tracker::PeerId;
use tracing::debug;

/// Result of feeding a delivered block into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Stored {
        piece_complete: bool,
        file_complete: bool,
    },
    Duplicate,
}

/// Piece store and request table guarded together, so a block's state and
/// its table entry never disagree.
#[derive(Debug)]
pub struct DownloadState {
    store: PieceStore,
    requests: RequestTable,
}

impl DownloadState {
    pub fn new(store: PieceStore) -> Self {
        Self {
            store,
            requests: RequestTable::new(),
        }
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    /// Record `block` as requested from `peer`. False if already in flight or no longer needed.
    pub fn claim(&mut self, block: BlockInfo, peer: &PeerId) -> bool {
        let key = block.key();
        if self.requests.contains(&key) {
            return false;
        }

        match self.store.mark_requested(block.piece_index, block.offset, peer) {
            Ok(true) => self.requests.claim(key, peer),
            _ => false,
        }
    }

    pub fn deliver(&mut self, piece_index: u32, offset: u32, data: &[u8]) -> Result<Delivery> {
        let write = self.store.write_block(piece_index, offset, data)?;
        self.requests.release(&(piece_index, offset));

        match write {
            BlockWrite::Duplicate => Ok(Delivery::Duplicate),
            BlockWrite::Stored => Ok(Delivery::Stored {
                piece_complete: self.store.is_piece_complete(piece_index),
                file_complete: self.store.is_file_complete(),
            }),
        }
    }

    /// Give back a single claim held by `peer`
    pub fn release_block(&mut self, piece_index: u32, offset: u32, peer: &PeerId) -> bool {
        if self.requests.release_if_owned(&(piece_index, offset), peer) {
            self.store.release_block(piece_index, offset, Some(peer));
            true
        } else {
            false
        }
    }

    /// Revert every block in flight to `peer` back to needed
    pub fn release_peer(&mut self, peer: &PeerId) -> usize {
        let released = self.requests.release_peer(peer);
        for (piece_index, offset) in &released {
            self.store.release_block(*piece_index, *offset, Some(peer));
        }

        if !released.is_empty() {
            debug!("Released {} requests held by {}", released.len(), peer);
        }
        released.len()
    }
}
