use super::{PeerId, PeerInfo, ScrapeStats, SwarmMember};
use crate::error::{ErrorCode, Result, SwarmError};
use crate::frame::Frame;
use crate::piece::{FileId, PieceSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TRACKER_REQUEST_TAG: u8 = 0x20;
pub const TRACKER_RESPONSE_TAG: u8 = 0x21;

/// One action sent to the tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrackerRequest {
    Register {
        peer_info: PeerInfo,
        file_id: FileId,
        pieces_held: PieceSet,
        piece_count: u32,
    },
    Unregister {
        peer_info: PeerInfo,
        file_id: FileId,
    },
    Heartbeat {
        peer_info: PeerInfo,
    },
    GetPeers {
        file_id: FileId,
    },
    Scrape {
        file_ids: Vec<FileId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrackerResponse {
    Ok {
        message: String,
    },
    Peers {
        peers: BTreeMap<PeerId, SwarmMember>,
    },
    Scrape {
        files: BTreeMap<FileId, ScrapeStats>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl TrackerRequest {
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(TRACKER_REQUEST_TAG, serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        expect_tag(frame, TRACKER_REQUEST_TAG)?;
        serde_json::from_slice(&frame.payload)
            .map_err(|e| SwarmError::ProtocolError(format!("Invalid action: {}", e)))
    }
}

impl TrackerResponse {
    pub fn error(err: &SwarmError) -> Self {
        TrackerResponse::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(TRACKER_RESPONSE_TAG, serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        expect_tag(frame, TRACKER_RESPONSE_TAG)?;
        Ok(serde_json::from_slice(&frame.payload)?)
    }

    /// Turn an `Error` response back into a `SwarmError`
    pub fn into_result(self) -> Result<Self> {
        match self {
            TrackerResponse::Error { code, message } => Err(code.into_error(message)),
            other => Ok(other),
        }
    }
}

fn expect_tag(frame: &Frame, tag: u8) -> Result<()> {
    if frame.tag != tag {
        return Err(SwarmError::ProtocolError(format!(
            "Expected frame tag {:#04x}, got {:#04x}",
            tag, frame.tag
        )));
    }
    Ok(())
}
