use crate::error::{ErrorCode, Result, SwarmError};
use crate::frame::Frame;
use crate::piece::{BlockInfo, FileId};
use crate::tracker::PeerId;
use bytes::{Buf, BufMut, BytesMut};

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    /// Opening ping: who we are and which file we want to talk about
    Handshake { peer_id: PeerId, file_id: FileId },
    /// Pong to a handshake
    HandshakeAck { peer_id: PeerId },
    /// Choke the peer
    Choke,
    /// Unchoke the peer
    Unchoke,
    /// Indicate interest
    Interested,
    /// Indicate lack of interest
    NotInterested,
    /// Indicate possession of a piece
    Have { piece_index: u32 },
    /// Bitfield of available pieces
    Bitfield { piece_count: u32, bitfield: Vec<u8> },
    /// Ask for a file's size and layout
    RequestFile { file_id: FileId },
    /// Answer to `RequestFile`
    FileInfo {
        file_id: FileId,
        total_size: u64,
        piece_size: u32,
    },
    /// Request a block
    Request { block: BlockInfo },
    /// Send a block
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    /// Failure reply; `block` names the request it answers, if any
    Error {
        code: ErrorCode,
        block: Option<BlockInfo>,
        message: String,
    },
    /// Well-formed frame with a tag we do not know
    Unknown { tag: u8 },
}

impl PeerMessage {
    /// Message type tags
    const KEEP_ALIVE: u8 = 0x00;
    const HANDSHAKE: u8 = 0x01;
    const HANDSHAKE_ACK: u8 = 0x02;
    const CHOKE: u8 = 0x03;
    const UNCHOKE: u8 = 0x04;
    const INTERESTED: u8 = 0x05;
    const NOT_INTERESTED: u8 = 0x06;
    const HAVE: u8 = 0x07;
    const BITFIELD: u8 = 0x08;
    const REQUEST_FILE: u8 = 0x09;
    const FILE_INFO: u8 = 0x0a;
    const REQUEST: u8 = 0x0b;
    const PIECE: u8 = 0x0c;
    const ERROR: u8 = 0x0d;

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        PeerMessage::Error {
            code,
            block: None,
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Handshake { .. } => "handshake",
            PeerMessage::HandshakeAck { .. } => "handshake-ack",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::RequestFile { .. } => "request-file",
            PeerMessage::FileInfo { .. } => "file-info",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Error { .. } => "error",
            PeerMessage::Unknown { .. } => "unknown",
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();

        let tag = match self {
            PeerMessage::KeepAlive => Self::KEEP_ALIVE,
            PeerMessage::Handshake { peer_id, file_id } => {
                put_str(&mut buf, peer_id.as_str());
                put_str(&mut buf, file_id.as_str());
                Self::HANDSHAKE
            }
            PeerMessage::HandshakeAck { peer_id } => {
                put_str(&mut buf, peer_id.as_str());
                Self::HANDSHAKE_ACK
            }
            PeerMessage::Choke => Self::CHOKE,
            PeerMessage::Unchoke => Self::UNCHOKE,
            PeerMessage::Interested => Self::INTERESTED,
            PeerMessage::NotInterested => Self::NOT_INTERESTED,
            PeerMessage::Have { piece_index } => {
                buf.put_u32(*piece_index);
                Self::HAVE
            }
            PeerMessage::Bitfield {
                piece_count,
                bitfield,
            } => {
                buf.put_u32(*piece_count);
                buf.put_slice(bitfield);
                Self::BITFIELD
            }
            PeerMessage::RequestFile { file_id } => {
                put_str(&mut buf, file_id.as_str());
                Self::REQUEST_FILE
            }
            PeerMessage::FileInfo {
                file_id,
                total_size,
                piece_size,
            } => {
                put_str(&mut buf, file_id.as_str());
                buf.put_u64(*total_size);
                buf.put_u32(*piece_size);
                Self::FILE_INFO
            }
            PeerMessage::Request { block } => {
                put_block(&mut buf, block);
                Self::REQUEST
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
                Self::PIECE
            }
            PeerMessage::Error {
                code,
                block,
                message,
            } => {
                buf.put_u8(code.as_u8());
                match block {
                    Some(block) => {
                        buf.put_u8(1);
                        put_block(&mut buf, block);
                    }
                    None => buf.put_u8(0),
                }
                buf.put_slice(message.as_bytes());
                Self::ERROR
            }
            PeerMessage::Unknown { tag } => *tag,
        };

        Frame::new(tag, buf.freeze())
    }

    /// Decode a frame. Unknown tags decode to `Unknown`; malformed payloads are errors.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut data = &frame.payload[..];

        match frame.tag {
            Self::KEEP_ALIVE => Ok(PeerMessage::KeepAlive),
            Self::HANDSHAKE => {
                let peer_id = PeerId::new(get_str(&mut data, "Handshake")?);
                let file_id = FileId::new(get_str(&mut data, "Handshake")?);
                Ok(PeerMessage::Handshake { peer_id, file_id })
            }
            Self::HANDSHAKE_ACK => Ok(PeerMessage::HandshakeAck {
                peer_id: PeerId::new(get_str(&mut data, "HandshakeAck")?),
            }),
            Self::CHOKE => Ok(PeerMessage::Choke),
            Self::UNCHOKE => Ok(PeerMessage::Unchoke),
            Self::INTERESTED => Ok(PeerMessage::Interested),
            Self::NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            Self::HAVE => {
                ensure_len(data, 4, "Have")?;
                Ok(PeerMessage::Have {
                    piece_index: data.get_u32(),
                })
            }
            Self::BITFIELD => {
                ensure_len(data, 4, "Bitfield")?;
                let piece_count = data.get_u32();
                if data.len() < (piece_count as usize + 7) / 8 {
                    return Err(SwarmError::ProtocolError(
                        "Bitfield shorter than piece count".to_string(),
                    ));
                }
                Ok(PeerMessage::Bitfield {
                    piece_count,
                    bitfield: data.to_vec(),
                })
            }
            Self::REQUEST_FILE => Ok(PeerMessage::RequestFile {
                file_id: FileId::new(get_str(&mut data, "RequestFile")?),
            }),
            Self::FILE_INFO => {
                let file_id = FileId::new(get_str(&mut data, "FileInfo")?);
                ensure_len(data, 12, "FileInfo")?;
                Ok(PeerMessage::FileInfo {
                    file_id,
                    total_size: data.get_u64(),
                    piece_size: data.get_u32(),
                })
            }
            Self::REQUEST => Ok(PeerMessage::Request {
                block: get_block(&mut data, "Request")?,
            }),
            Self::PIECE => {
                ensure_len(data, 8, "Piece")?;
                let piece_index = data.get_u32();
                let offset = data.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: data.to_vec(),
                })
            }
            Self::ERROR => {
                ensure_len(data, 2, "Error")?;
                let code = ErrorCode::from_u8(data.get_u8()).unwrap_or(ErrorCode::ProtocolError);
                let block = match data.get_u8() {
                    0 => None,
                    _ => Some(get_block(&mut data, "Error")?),
                };
                Ok(PeerMessage::Error {
                    code,
                    block,
                    message: String::from_utf8_lossy(data).into_owned(),
                })
            }
            tag => Ok(PeerMessage::Unknown { tag }),
        }
    }
}

fn ensure_len(data: &[u8], needed: usize, what: &str) -> Result<()> {
    if data.len() < needed {
        return Err(SwarmError::ProtocolError(format!("Invalid {} message", what)));
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str) {
    // Identifiers are short; anything longer is cut at the u16 limit.
    let bytes = &value.as_bytes()[..value.len().min(u16::MAX as usize)];
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_str(data: &mut &[u8], what: &str) -> Result<String> {
    ensure_len(data, 2, what)?;
    let len = data.get_u16() as usize;
    ensure_len(data, len, what)?;

    let value = String::from_utf8(data[..len].to_vec())
        .map_err(|_| SwarmError::ProtocolError(format!("Invalid UTF-8 in {} message", what)))?;
    data.advance(len);
    Ok(value)
}

fn put_block(buf: &mut BytesMut, block: &BlockInfo) {
    buf.put_u32(block.piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.length);
}

fn get_block(data: &mut &[u8], what: &str) -> Result<BlockInfo> {
    ensure_len(data, 12, what)?;
    Ok(BlockInfo::new(data.get_u32(), data.get_u32(), data.get_u32()))
}
