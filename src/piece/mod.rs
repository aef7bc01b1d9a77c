mod download;
mod requests;
mod store;

pub use download::{Delivery, DownloadState};
pub use requests::{BlockKey, RequestTable};
pub use store::{Block, BlockWrite, Piece, PieceStore};

use crate::config::{MAX_FILE_SIZE, MAX_PIECE_COUNT};
use crate::error::{Result, SwarmError};
use crate::tracker::PeerId;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::fmt;

/// Piece indices held by a peer
pub type PieceSet = BTreeSet<u32>;

/// Content identifier of a shared file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Hex SHA-1 of the whole file. Used as a name only, pieces are never checked against it.
    pub fn from_content(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// State of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Nothing requested or received yet
    Missing,
    /// Some blocks requested or received
    InProgress,
    /// Every block received
    Complete,
}

/// State of a block within a piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Needed,
    /// In flight to exactly one peer
    Requested(PeerId),
    Received,
}

/// Position of a block within the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockInfo {
    /// Piece index
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    pub fn key(&self) -> BlockKey {
        (self.piece_index, self.offset)
    }
}

/// Number of pieces of `piece_size` bytes needed for `total_size` bytes.
/// Files above `MAX_FILE_SIZE` or `MAX_PIECE_COUNT` pieces are `OutOfRange`.
pub fn piece_count(total_size: u64, piece_size: u32) -> Result<u32> {
    if piece_size == 0 {
        return Err(SwarmError::OutOfRange("piece size must be positive".to_string()));
    }
    if total_size > MAX_FILE_SIZE {
        return Err(SwarmError::OutOfRange(format!(
            "file of {} bytes exceeds the {} byte limit",
            total_size, MAX_FILE_SIZE
        )));
    }

    u32::try_from(total_size.div_ceil(piece_size as u64))
        .ok()
        .filter(|&count| count <= MAX_PIECE_COUNT)
        .ok_or_else(|| {
            SwarmError::OutOfRange(format!(
                "{} bytes in pieces of {} exceeds {} pieces",
                total_size, piece_size, MAX_PIECE_COUNT
            ))
        })
}

/// Pack a piece set into an MSB-first bitfield of `piece_count` bits
pub fn to_bitfield(pieces: &PieceSet, piece_count: u32) -> Vec<u8> {
    let mut bitfield = vec![0u8; (piece_count as usize + 7) / 8];
    for &index in pieces.iter().filter(|&&i| i < piece_count) {
        bitfield[index as usize / 8] |= 1 << (7 - (index % 8));
    }
    bitfield
}

/// Unpack an MSB-first bitfield, ignoring bits past `piece_count`
pub fn from_bitfield(bitfield: &[u8], piece_count: u32) -> PieceSet {
    (0..piece_count)
        .filter(|&index| has_piece_in_bitfield(bitfield, index))
        .collect()
}

fn has_piece_in_bitfield(bitfield: &[u8], piece_index: u32) -> bool {
    let byte_index = piece_index as usize / 8;
    let bit_index = 7 - (piece_index % 8);

    if byte_index < bitfield.len() {
        (bitfield[byte_index] >> bit_index) & 1 == 1
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitfield_roundtrip() {
        let pieces: PieceSet = [0, 3, 8, 10].into_iter().collect();
        let bitfield = to_bitfield(&pieces, 11);

        assert_eq!(bitfield, vec![0b1001_0000, 0b1010_0000]);
        assert_eq!(from_bitfield(&bitfield, 11), pieces);
    }

    #[test]
    fn test_bitfield_ignores_trailing_bits() {
        assert_eq!(from_bitfield(&[0xff], 3), [0, 1, 2].into_iter().collect());
        assert!(from_bitfield(&[], 4).is_empty());
    }

    #[test]
    fn test_piece_count() {
        assert_eq!(piece_count(2500, 1024).unwrap(), 3);
        assert_eq!(piece_count(2048, 1024).unwrap(), 2);
        assert_eq!(piece_count(0, 1024).unwrap(), 0);
        assert_eq!(piece_count(MAX_FILE_SIZE, u32::MAX).unwrap(), 2);
    }

    #[test]
    fn test_piece_count_rejects_oversized_layouts() {
        assert!(matches!(piece_count(10, 0), Err(SwarmError::OutOfRange(_))));
        assert!(matches!(piece_count(u64::MAX, 1024), Err(SwarmError::OutOfRange(_))));
        assert!(matches!(
            piece_count((1 << 32) * 1024, 1024),
            Err(SwarmError::OutOfRange(_))
        ));
        // Within the size limit, but far too many pieces
        assert!(matches!(piece_count(MAX_FILE_SIZE, 1), Err(SwarmError::OutOfRange(_))));
    }

    #[test]
    fn test_file_id_from_content() {
        let id = FileId::from_content(b"abc");
        assert_eq!(id.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
