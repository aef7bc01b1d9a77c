use super::{piece_count, BlockInfo, BlockState, FileId, PieceSet, PieceState};
use crate::config::DEFAULT_BLOCK_SIZE;
use crate::error::{Result, SwarmError};
use crate::tracker::PeerId;
use tracing::{debug, info};

/// Outcome of a block write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    Stored,
    /// The block was already received; nothing changed
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub offset: u32,
    pub length: u32,
    pub state: BlockState,
}

impl Block {
    pub fn requested_from(&self) -> Option<&PeerId> {
        match &self.state {
            BlockState::Requested(peer) => Some(peer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    blocks: Vec<Block>,
    /// Allocated on the first write
    data: Vec<u8>,
}

impl Piece {
    fn new(index: u32, length: u32, block_size: u32) -> Self {
        let blocks = (0..length)
            .step_by(block_size as usize)
            .map(|offset| Block {
                offset,
                length: std::cmp::min(block_size, length - offset),
                state: BlockState::Needed,
            })
            .collect();

        Self {
            index,
            length,
            blocks,
            data: Vec::new(),
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn state(&self) -> PieceState {
        if self.is_complete() {
            PieceState::Complete
        } else if self.blocks.iter().all(|b| b.state == BlockState::Needed) {
            PieceState::Missing
        } else {
            PieceState::InProgress
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Received)
    }

    fn block_mut(&mut self, offset: u32) -> Option<&mut Block> {
        // Blocks are sorted by offset and never overlap.
        let idx = self
            .blocks
            .binary_search_by_key(&offset, |b| b.offset)
            .ok()?;
        self.blocks.get_mut(idx)
    }
}

/// Block-level bookkeeping and buffering for one file.
///
/// Completeness is pure block accounting: a block of the right length at the
/// right offset is accepted as-is, there is no content hash to check it against.
#[derive(Debug, Clone)]
pub struct PieceStore {
    file_id: FileId,
    total_size: u64,
    piece_size: u32,
    block_size: u32,
    pieces: Vec<Piece>,
}

impl PieceStore {
    pub fn new(file_id: FileId, total_size: u64, piece_size: u32) -> Result<Self> {
        Self::with_block_size(file_id, total_size, piece_size, DEFAULT_BLOCK_SIZE)
    }

    /// Fails with `OutOfRange` when the layout exceeds the file size or piece count limits
    pub fn with_block_size(
        file_id: FileId,
        total_size: u64,
        piece_size: u32,
        block_size: u32,
    ) -> Result<Self> {
        let piece_size = piece_size.max(1);
        let block_size = block_size.max(1);
        let num_pieces = piece_count(total_size, piece_size)?;

        let pieces = (0..num_pieces)
            .map(|index| {
                let length = if index == num_pieces - 1 {
                    // Last piece might be smaller
                    (total_size - index as u64 * piece_size as u64) as u32
                } else {
                    piece_size
                };
                Piece::new(index, length, block_size)
            })
            .collect();

        Ok(Self {
            file_id,
            total_size,
            piece_size,
            block_size,
            pieces,
        })
    }

    /// Build a store that already holds every piece of `data`
    pub fn from_complete(
        file_id: FileId,
        data: &[u8],
        piece_size: u32,
        block_size: u32,
    ) -> Result<Self> {
        let mut store =
            Self::with_block_size(file_id, data.len() as u64, piece_size, block_size)?;
        let piece_size = store.piece_size as usize;

        for piece in &mut store.pieces {
            let start = piece.index as usize * piece_size;
            piece.data = data[start..start + piece.length as usize].to_vec();
            for block in &mut piece.blocks {
                block.state = BlockState::Received;
            }
        }

        info!(
            "Loaded {} ({} bytes, {} pieces)",
            store.file_id,
            store.total_size,
            store.pieces.len()
        );
        Ok(store)
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn piece(&self, piece_index: u32) -> Option<&Piece> {
        self.pieces.get(piece_index as usize)
    }

    pub fn piece_state(&self, piece_index: u32) -> Option<PieceState> {
        self.piece(piece_index).map(Piece::state)
    }

    /// Blocks still `Needed`, in ascending offset order
    pub fn missing_blocks(&self, piece_index: u32) -> Result<Vec<BlockInfo>> {
        let piece = self.piece_or_err(piece_index)?;

        Ok(piece
            .blocks
            .iter()
            .filter(|b| b.state == BlockState::Needed)
            .map(|b| BlockInfo::new(piece_index, b.offset, b.length))
            .collect())
    }

    /// Move a `Needed` block to `Requested`. Returns false if it was not needed.
    pub fn mark_requested(&mut self, piece_index: u32, offset: u32, peer: &PeerId) -> Result<bool> {
        let block = self.block_or_err(piece_index, offset)?;

        if block.state != BlockState::Needed {
            return Ok(false);
        }
        block.state = BlockState::Requested(peer.clone());
        Ok(true)
    }

    /// Revert a `Requested` block to `Needed`. With `peer` set, only if it is the requester.
    pub fn release_block(&mut self, piece_index: u32, offset: u32, peer: Option<&PeerId>) -> bool {
        let block = match self
            .pieces
            .get_mut(piece_index as usize)
            .and_then(|p| p.block_mut(offset))
        {
            Some(block) => block,
            None => return false,
        };

        let releasable = match &block.state {
            BlockState::Requested(owner) => peer.map_or(true, |p| p == owner),
            _ => false,
        };
        if releasable {
            block.state = BlockState::Needed;
        }
        releasable
    }

    /// Store a block's bytes and mark it received.
    ///
    /// `offset` must be a block boundary and `data` exactly that block's length.
    /// Writing an already received block is accepted and ignored.
    pub fn write_block(
        &mut self,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockWrite> {
        let piece = self
            .pieces
            .get_mut(piece_index as usize)
            .ok_or_else(|| SwarmError::OutOfRange(format!("Invalid piece index {}", piece_index)))?;

        let end = offset as u64 + data.len() as u64;
        if end > piece.length as u64 {
            return Err(SwarmError::OutOfRange(format!(
                "Block {}+{} exceeds piece {} of {} bytes",
                offset,
                data.len(),
                piece_index,
                piece.length
            )));
        }

        let piece_length = piece.length as usize;
        let block = piece.block_mut(offset).ok_or_else(|| {
            SwarmError::OutOfRange(format!("Offset {} is not a block boundary", offset))
        })?;

        if data.len() != block.length as usize {
            return Err(SwarmError::OutOfRange(format!(
                "Block at {} is {} bytes, got {}",
                offset,
                block.length,
                data.len()
            )));
        }

        if block.state == BlockState::Received {
            debug!("Duplicate block for piece {} at offset {}", piece_index, offset);
            return Ok(BlockWrite::Duplicate);
        }
        block.state = BlockState::Received;

        if piece.data.is_empty() {
            piece.data = vec![0u8; piece_length];
        }
        let offset = offset as usize;
        piece.data[offset..offset + data.len()].copy_from_slice(data);

        debug!(
            "Added block to piece {} at offset {} ({} bytes)",
            piece_index,
            offset,
            data.len()
        );

        if piece.is_complete() {
            info!("Piece {} complete", piece_index);
        }

        Ok(BlockWrite::Stored)
    }

    pub fn is_piece_complete(&self, piece_index: u32) -> bool {
        self.piece(piece_index).map_or(false, Piece::is_complete)
    }

    pub fn is_file_complete(&self) -> bool {
        self.pieces.iter().all(Piece::is_complete)
    }

    pub fn incomplete_pieces(&self) -> Vec<u32> {
        self.pieces
            .iter()
            .filter(|p| !p.is_complete())
            .map(|p| p.index)
            .collect()
    }

    pub fn completed_pieces(&self) -> PieceSet {
        self.pieces
            .iter()
            .filter(|p| p.is_complete())
            .map(|p| p.index)
            .collect()
    }

    pub fn complete_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_complete()).count()
    }

    pub fn progress(&self) -> f64 {
        if self.pieces.is_empty() {
            return 100.0;
        }
        (self.complete_count() as f64 / self.pieces.len() as f64) * 100.0
    }

    /// Bytes of a complete piece, for serving to other peers
    pub fn read_block(&self, piece_index: u32, offset: u32, length: u32) -> Result<&[u8]> {
        let piece = self.piece_or_err(piece_index)?;

        let end = offset as u64 + length as u64;
        if end > piece.length as u64 {
            return Err(SwarmError::OutOfRange(format!(
                "Range {}+{} exceeds piece {} of {} bytes",
                offset, length, piece_index, piece.length
            )));
        }
        if !piece.is_complete() {
            return Err(SwarmError::Unavailable(format!(
                "Piece {} not held",
                piece_index
            )));
        }

        Ok(&piece.data[offset as usize..end as usize])
    }

    /// Concatenate all pieces in index order
    pub fn assemble(&self) -> Result<Vec<u8>> {
        if !self.is_file_complete() {
            return Err(SwarmError::Incomplete(format!(
                "{}/{} pieces complete",
                self.complete_count(),
                self.pieces.len()
            )));
        }

        let mut file = Vec::with_capacity(self.total_size as usize);
        for piece in &self.pieces {
            file.extend_from_slice(&piece.data);
        }
        Ok(file)
    }

    fn piece_or_err(&self, piece_index: u32) -> Result<&Piece> {
        self.piece(piece_index)
            .ok_or_else(|| SwarmError::OutOfRange(format!("Invalid piece index {}", piece_index)))
    }

    fn block_or_err(&mut self, piece_index: u32, offset: u32) -> Result<&mut Block> {
        self.pieces
            .get_mut(piece_index as usize)
            .and_then(|p| p.block_mut(offset))
            .ok_or_else(|| {
                SwarmError::OutOfRange(format!(
                    "No block at piece {} offset {}",
                    piece_index, offset
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn feed(store: &mut PieceStore, data: &[u8], block: BlockInfo) -> BlockWrite {
        let start = (block.piece_index * store.piece_size() + block.offset) as usize;
        store
            .write_block(
                block.piece_index,
                block.offset,
                &data[start..start + block.length as usize],
            )
            .unwrap()
    }

    fn all_blocks(store: &PieceStore) -> Vec<BlockInfo> {
        (0..store.piece_count())
            .flat_map(|i| store.missing_blocks(i).unwrap())
            .collect()
    }

    #[test]
    fn test_piece_layout() {
        let store = PieceStore::new(FileId::from("f"), 2500, 1024).unwrap();

        assert_eq!(store.piece_count(), 3);
        let lengths: Vec<u32> = (0..3).map(|i| store.piece(i).unwrap().length).collect();
        assert_eq!(lengths, vec![1024, 1024, 452]);
        assert_eq!(store.piece_state(0), Some(PieceState::Missing));
    }

    #[test]
    fn test_missing_blocks_ascending() {
        let store = PieceStore::with_block_size(FileId::from("f"), 2500, 1024, 300).unwrap();

        let offsets: Vec<u32> = store.missing_blocks(0).unwrap().iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 300, 600, 900]);
        let last = store.missing_blocks(2).unwrap();
        assert_eq!(last.iter().map(|b| b.length).collect::<Vec<_>>(), vec![300, 152]);
        assert!(matches!(store.missing_blocks(3), Err(SwarmError::OutOfRange(_))));
    }

    #[test]
    fn test_empty_file() {
        let store = PieceStore::new(FileId::from("empty"), 0, 1024).unwrap();

        assert_eq!(store.piece_count(), 0);
        assert!(store.is_file_complete());
        assert!(store.assemble().unwrap().is_empty());
    }

    #[test]
    fn test_oversized_layout_is_rejected() {
        let wrapped = PieceStore::new(FileId::from("big"), (1 << 32) * 1024, 1024);
        assert!(matches!(wrapped, Err(SwarmError::OutOfRange(_))));

        let huge = PieceStore::new(FileId::from("big"), u64::MAX, 1024);
        assert!(matches!(huge, Err(SwarmError::OutOfRange(_))));

        let tiny_pieces = PieceStore::with_block_size(FileId::from("big"), 1 << 30, 1, 1);
        assert!(matches!(tiny_pieces, Err(SwarmError::OutOfRange(_))));
    }

    #[test]
    fn test_zero_piece_size_is_clamped() {
        let store = PieceStore::with_block_size(FileId::from("f"), 3, 0, 0).unwrap();
        assert_eq!(store.piece_count(), 3);
        assert_eq!(store.piece_size(), 1);
    }

    #[test]
    fn test_duplicate_write_is_silent() {
        let data = sample(2500);
        let mut store = PieceStore::with_block_size(FileId::from("f"), 2500, 1024, 512).unwrap();

        for block in store.missing_blocks(2).unwrap() {
            assert_eq!(feed(&mut store, &data, block), BlockWrite::Stored);
        }
        assert!(store.is_piece_complete(2));

        let again = store.write_block(2, 0, &data[2048..2048 + 452]).unwrap();
        assert_eq!(again, BlockWrite::Duplicate);
        assert!(store.is_piece_complete(2));
        assert!(!store.is_piece_complete(0));
    }

    #[test]
    fn test_write_out_of_range() {
        let mut store = PieceStore::with_block_size(FileId::from("f"), 2500, 1024, 512).unwrap();

        assert!(matches!(store.write_block(5, 0, &[0; 512]), Err(SwarmError::OutOfRange(_))));
        assert!(matches!(store.write_block(2, 0, &[0; 500]), Err(SwarmError::OutOfRange(_))));
        assert!(matches!(store.write_block(0, 100, &[0; 512]), Err(SwarmError::OutOfRange(_))));
        assert!(matches!(store.write_block(0, 0, &[0; 100]), Err(SwarmError::OutOfRange(_))));
        assert_eq!(store.piece_state(0), Some(PieceState::Missing));
    }

    #[test]
    fn test_assemble_incomplete() {
        let store = PieceStore::new(FileId::from("f"), 10, 4).unwrap();
        assert!(matches!(store.assemble(), Err(SwarmError::Incomplete(_))));
    }

    #[test]
    fn test_any_permutation_reassembles() {
        let data = sample(2500);

        for seed in 0..8 {
            let mut store =
                PieceStore::with_block_size(FileId::from("f"), 2500, 1024, 256).unwrap();
            let mut blocks = all_blocks(&store);
            blocks.shuffle(&mut StdRng::seed_from_u64(seed));

            for block in blocks {
                assert!(!store.is_file_complete());
                feed(&mut store, &data, block);
            }

            assert!(store.is_file_complete());
            assert_eq!(store.assemble().unwrap(), data);
        }
    }

    #[test]
    fn test_requested_and_release() {
        let mut store = PieceStore::with_block_size(FileId::from("f"), 2048, 1024, 512).unwrap();
        let a = PeerId::from("peer-a");
        let b = PeerId::from("peer-b");

        assert!(store.mark_requested(0, 512, &a).unwrap());
        assert!(!store.mark_requested(0, 512, &b).unwrap());
        assert_eq!(store.piece_state(0), Some(PieceState::InProgress));
        assert_eq!(store.missing_blocks(0).unwrap().len(), 1);

        assert!(!store.release_block(0, 512, Some(&b)));
        assert!(store.release_block(0, 512, Some(&a)));
        assert_eq!(store.piece_state(0), Some(PieceState::Missing));
    }

    #[test]
    fn test_read_block_only_from_complete_pieces() {
        let data = sample(2048);
        let store = PieceStore::from_complete(FileId::from("f"), &data, 1024, 256).unwrap();

        assert_eq!(store.read_block(1, 256, 256).unwrap(), &data[1280..1536]);
        assert!(matches!(store.read_block(1, 1000, 256), Err(SwarmError::OutOfRange(_))));

        let empty = PieceStore::new(FileId::from("f"), 2048, 1024).unwrap();
        assert!(matches!(empty.read_block(0, 0, 16), Err(SwarmError::Unavailable(_))));
    }
}
