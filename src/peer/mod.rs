mod connection;
mod message;
mod protocol;

pub use connection::PeerConnection;
pub use message::PeerMessage;
pub use protocol::{accept_handshake, initiate_handshake, recv_message, send_message};

use crate::error::{Result, SwarmError};
use crate::piece::{piece_count, FileId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeState {
    Choked,
    Unchoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestState {
    Interested,
    NotInterested,
}

// Peer connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: ChokeState,
    /// Whether we are interested in the peer
    pub am_interested: InterestState,
    /// Whether the peer is choking us
    pub peer_choking: ChokeState,
    /// Whether the peer is interested in us
    pub peer_interested: InterestState,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: ChokeState::Choked,
            am_interested: InterestState::NotInterested,
            peer_choking: ChokeState::Choked,
            peer_interested: InterestState::NotInterested,
        }
    }
}

impl PeerState {
    /// True once the remote side is willing to serve us
    pub fn can_download(&self) -> bool {
        self.peer_choking == ChokeState::Unchoked
    }

    /// Track what we sent
    pub fn on_sent(&mut self, message: &PeerMessage) {
        match message {
            PeerMessage::Choke => self.am_choking = ChokeState::Choked,
            PeerMessage::Unchoke => self.am_choking = ChokeState::Unchoked,
            PeerMessage::Interested => self.am_interested = InterestState::Interested,
            PeerMessage::NotInterested => self.am_interested = InterestState::NotInterested,
            _ => {}
        }
    }

    /// Track what the peer sent
    pub fn on_received(&mut self, message: &PeerMessage) {
        match message {
            PeerMessage::Choke => self.peer_choking = ChokeState::Choked,
            PeerMessage::Unchoke => self.peer_choking = ChokeState::Unchoked,
            PeerMessage::Interested => self.peer_interested = InterestState::Interested,
            PeerMessage::NotInterested => self.peer_interested = InterestState::NotInterested,
            _ => {}
        }
    }
}

/// Size and layout of a shared file, as answered to `RequestFile`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    pub file_id: FileId,
    pub total_size: u64,
    pub piece_size: u32,
}

impl FileLayout {
    /// Pieces in this layout. A remote peer's answer is rejected when the
    /// piece size is zero or the file exceeds the size limits.
    pub fn piece_count(&self) -> Result<u32> {
        if self.piece_size == 0 {
            return Err(SwarmError::ProtocolError(format!(
                "{} announced with a zero piece size",
                self.file_id
            )));
        }
        piece_count(self.total_size, self.piece_size)
    }
}
