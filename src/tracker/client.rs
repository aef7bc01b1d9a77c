use super::{PeerId, PeerInfo, ScrapeStats, SwarmMember, TrackerRequest, TrackerResponse};
use crate::error::{Result, SwarmError};
use crate::frame::{read_frame, write_frame};
use crate::piece::{FileId, PieceSet};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a single tracker. Keeps one connection open and reconnects
/// lazily after any transport failure.
pub struct TrackerClient {
    addr: SocketAddr,
    stream: Option<TcpStream>,
}

impl TrackerClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, stream: None }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn register(
        &mut self,
        peer_info: &PeerInfo,
        file_id: &FileId,
        pieces_held: &PieceSet,
        piece_count: u32,
    ) -> Result<()> {
        info!(
            "Registering with tracker {} for {} ({}/{} pieces)",
            self.addr,
            file_id,
            pieces_held.len(),
            piece_count
        );

        self.call(TrackerRequest::Register {
            peer_info: peer_info.clone(),
            file_id: file_id.clone(),
            pieces_held: pieces_held.clone(),
            piece_count,
        })
        .await?;
        Ok(())
    }

    pub async fn unregister(&mut self, peer_info: &PeerInfo, file_id: &FileId) -> Result<()> {
        self.call(TrackerRequest::Unregister {
            peer_info: peer_info.clone(),
            file_id: file_id.clone(),
        })
        .await?;
        Ok(())
    }

    /// Fails with `NotFound` once the tracker has expired us
    pub async fn heartbeat(&mut self, peer_info: &PeerInfo) -> Result<()> {
        self.call(TrackerRequest::Heartbeat {
            peer_info: peer_info.clone(),
        })
        .await?;
        Ok(())
    }

    pub async fn get_peers(&mut self, file_id: &FileId) -> Result<BTreeMap<PeerId, SwarmMember>> {
        match self
            .call(TrackerRequest::GetPeers {
                file_id: file_id.clone(),
            })
            .await?
        {
            TrackerResponse::Peers { peers } => {
                debug!("Tracker lists {} peers for {}", peers.len(), file_id);
                Ok(peers)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn scrape(&mut self, file_ids: &[FileId]) -> Result<BTreeMap<FileId, ScrapeStats>> {
        match self
            .call(TrackerRequest::Scrape {
                file_ids: file_ids.to_vec(),
            })
            .await?
        {
            TrackerResponse::Scrape { files } => Ok(files),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&mut self, request: TrackerRequest) -> Result<TrackerResponse> {
        let response = match timeout(TRACKER_TIMEOUT, self.exchange(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e);
            }
            Err(elapsed) => {
                self.stream = None;
                return Err(elapsed.into());
            }
        };

        response.into_result()
    }

    async fn exchange(&mut self, request: &TrackerRequest) -> Result<TrackerResponse> {
        if self.stream.is_none() {
            debug!("Connecting to tracker {}", self.addr);
            self.stream = Some(TcpStream::connect(self.addr).await?);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SwarmError::ProtocolError("tracker stream missing".to_string()))?;

        write_frame(stream, &request.to_frame()?).await?;
        let frame = read_frame(stream).await?.ok_or_else(|| {
            SwarmError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "tracker closed the connection",
            ))
        })?;

        TrackerResponse::from_frame(&frame)
    }
}

fn unexpected(response: TrackerResponse) -> SwarmError {
    SwarmError::ProtocolError(format!("Unexpected tracker response: {:?}", response))
}
