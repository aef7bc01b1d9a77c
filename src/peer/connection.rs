use super::{accept_handshake, initiate_handshake, recv_message, send_message};
use super::{FileLayout, PeerMessage, PeerState};
use crate::error::{Result, SwarmError};
use crate::piece::FileId;
use crate::tracker::PeerId;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// A handshaken connection to a peer
pub struct PeerConnection {
    addr: SocketAddr,
    stream: TcpStream,
    state: PeerState,
    remote_id: PeerId,
}

impl PeerConnection {
    /// Connect to a peer and perform the handshake, bounded by `limit`
    pub async fn connect(
        addr: SocketAddr,
        local_id: &PeerId,
        file_id: &FileId,
        limit: Duration,
    ) -> Result<Self> {
        info!("Connecting to peer: {}", addr);

        let attempt = async {
            let mut stream = TcpStream::connect(addr).await?;
            let remote_id = initiate_handshake(&mut stream, local_id, file_id).await?;
            Ok::<_, SwarmError>((stream, remote_id))
        };
        let (stream, remote_id) = timeout(limit, attempt).await??;

        info!("Successfully connected to peer {} at {}", remote_id, addr);

        Ok(Self {
            addr,
            stream,
            state: PeerState::default(),
            remote_id,
        })
    }

    /// Run the listening side of the handshake on an accepted stream
    pub async fn accept(
        mut stream: TcpStream,
        addr: SocketAddr,
        local_id: &PeerId,
        serving: &FileId,
        limit: Duration,
    ) -> Result<Self> {
        let remote_id = timeout(limit, accept_handshake(&mut stream, local_id, serving)).await??;
        debug!("Accepted handshake from {} at {}", remote_id, addr);

        Ok(Self {
            addr,
            stream,
            state: PeerState::default(),
            remote_id,
        })
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<()> {
        send_message(&mut self.stream, message).await?;
        self.state.on_sent(message);
        debug!("Sent {} to {}", message.name(), self.addr);
        Ok(())
    }

    /// Receive a message from the peer. `None` once the peer has closed.
    pub async fn receive_message(&mut self) -> Result<Option<PeerMessage>> {
        let message = recv_message(&mut self.stream).await?;
        if let Some(message) = &message {
            self.state.on_received(message);
            debug!("Received {} from {}", message.name(), self.addr);
        }
        Ok(message)
    }

    /// Ask for the size and piece layout of `file_id`
    pub async fn request_file_info(
        &mut self,
        file_id: &FileId,
        limit: Duration,
    ) -> Result<FileLayout> {
        self.send_message(&PeerMessage::RequestFile {
            file_id: file_id.clone(),
        })
        .await?;

        loop {
            let message = timeout(limit, self.receive_message()).await??;
            match message {
                Some(PeerMessage::FileInfo {
                    file_id: answered,
                    total_size,
                    piece_size,
                }) if &answered == file_id => {
                    return Ok(FileLayout {
                        file_id: answered,
                        total_size,
                        piece_size,
                    })
                }
                Some(PeerMessage::Error { code, message, .. }) => {
                    return Err(code.into_error(message))
                }
                // Bitfield, Have and the like may arrive first
                Some(_) => continue,
                None => {
                    return Err(SwarmError::Unavailable(format!(
                        "{} closed before answering",
                        self.addr
                    )))
                }
            }
        }
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
