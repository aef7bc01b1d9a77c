use super::{Registry, TrackerRequest, TrackerResponse};
use crate::config::TrackerConfig;
use crate::error::{Result, SwarmError};
use crate::frame::{read_frame, write_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Tracker service: registry plus its network front and liveness sweeper
pub struct TrackerServer {
    config: TrackerConfig,
    registry: Arc<Mutex<Registry>>,
}

impl TrackerServer {
    pub fn new(config: TrackerConfig) -> Self {
        let registry = Registry::new(config.peer_timeout());
        Self {
            config,
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn registry(&self) -> Arc<Mutex<Registry>> {
        Arc::clone(&self.registry)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.listen_addr).await.map_err(|e| {
            error!("Cannot bind tracker on {}: {}", self.config.listen_addr, e);
            SwarmError::IoError(e)
        })?;
        info!("Tracker running on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve until the task is dropped. The sweeper lives as long as this future.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let _sweeper = AbortOnDrop(spawn_sweeper(self.registry(), self.config.sweep_interval()));

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("Tracker connection from {}", remote);
                    let registry = self.registry();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(registry, stream, remote).await {
                            warn!("Tracker connection {} ended: {}", remote, e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Periodically expire silent peers
pub fn spawn_sweeper(registry: Arc<Mutex<Registry>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let expired = registry.lock().await.sweep(Instant::now());
            if !expired.is_empty() {
                info!("Liveness sweep removed {} peers", expired.len());
            }
        }
    })
}

async fn handle_connection(
    registry: Arc<Mutex<Registry>>,
    mut stream: TcpStream,
    remote: SocketAddr,
) -> Result<()> {
    while let Some(frame) = read_frame(&mut stream).await? {
        let response = match TrackerRequest::from_frame(&frame) {
            Ok(request) => {
                let mut registry = registry.lock().await;
                handle_request(&mut registry, request, remote)
            }
            Err(e) => {
                warn!("Bad tracker request from {}: {}", remote, e);
                TrackerResponse::error(&e)
            }
        };

        write_frame(&mut stream, &response.to_frame()?).await?;
    }

    debug!("Tracker connection {} closed", remote);
    Ok(())
}

/// Apply one request to the registry
pub fn handle_request(
    registry: &mut Registry,
    request: TrackerRequest,
    remote: SocketAddr,
) -> TrackerResponse {
    match request {
        TrackerRequest::Register {
            peer_info,
            file_id,
            pieces_held,
            piece_count,
        } => {
            registry.register(
                peer_info.with_observed_ip(remote),
                file_id,
                pieces_held,
                piece_count,
            );
            TrackerResponse::Ok {
                message: "Peer registered successfully.".to_string(),
            }
        }
        TrackerRequest::Unregister { peer_info, file_id } => {
            registry.unregister(&peer_info.peer_id, &file_id);
            TrackerResponse::Ok {
                message: "Peer unregistered successfully.".to_string(),
            }
        }
        TrackerRequest::Heartbeat { peer_info } => match registry.heartbeat(&peer_info.peer_id) {
            Ok(()) => TrackerResponse::Ok {
                message: "Heartbeat received.".to_string(),
            },
            Err(e) => TrackerResponse::error(&e),
        },
        TrackerRequest::GetPeers { file_id } => TrackerResponse::Peers {
            peers: registry.get_peers(&file_id),
        },
        TrackerRequest::Scrape { file_ids } => TrackerResponse::Scrape {
            files: registry.scrape(&file_ids),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::piece::{FileId, PieceSet};
    use crate::tracker::{PeerId, PeerInfo};

    fn remote() -> SocketAddr {
        "10.1.1.1:40000".parse().unwrap()
    }

    #[test]
    fn test_register_substitutes_observed_ip() {
        let mut registry = Registry::new(Duration::from_secs(30));
        let info = PeerInfo::new(PeerId::from("p"), "0.0.0.0:7000".parse().unwrap());

        let response = handle_request(
            &mut registry,
            TrackerRequest::Register {
                peer_info: info,
                file_id: FileId::from("f"),
                pieces_held: PieceSet::new(),
                piece_count: 2,
            },
            remote(),
        );
        assert!(matches!(response, TrackerResponse::Ok { .. }));

        let peers = registry.get_peers(&FileId::from("f"));
        assert_eq!(peers[&PeerId::from("p")].addr, "10.1.1.1:7000".parse().unwrap());
    }

    #[test]
    fn test_heartbeat_for_unknown_peer_is_not_found() {
        let mut registry = Registry::new(Duration::from_secs(30));
        let info = PeerInfo::new(PeerId::from("p"), "127.0.0.1:7000".parse().unwrap());

        let heartbeat = TrackerRequest::Heartbeat { peer_info: info };
        let response = handle_request(&mut registry, heartbeat, remote());
        assert!(matches!(
            response,
            TrackerResponse::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_after_one_cycle() {
        let registry = Arc::new(Mutex::new(Registry::new(Duration::from_secs(30))));
        let file = FileId::from("f");
        let info = PeerInfo::new(PeerId::from("p"), "127.0.0.1:7000".parse().unwrap());
        registry
            .lock()
            .await
            .register(info, file.clone(), PieceSet::new(), 1);

        let sweeper = spawn_sweeper(Arc::clone(&registry), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(registry.lock().await.get_peers(&file).len(), 1);

        // Age is exactly the timeout at t=30, past it at the t=40 sweep.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(registry.lock().await.get_peers(&file).is_empty());

        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_keeps_heartbeating_peer() {
        let registry = Arc::new(Mutex::new(Registry::new(Duration::from_secs(30))));
        let file = FileId::from("f");
        let peer = PeerId::from("p");
        let info = PeerInfo::new(peer.clone(), "127.0.0.1:7000".parse().unwrap());
        registry
            .lock()
            .await
            .register(info, file.clone(), PieceSet::new(), 1);

        let sweeper = spawn_sweeper(Arc::clone(&registry), Duration::from_secs(10));

        for _ in 0..12 {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let mut guard = registry.lock().await;
            guard.heartbeat(&peer).unwrap();
            assert!(guard.get_peers(&file).contains_key(&peer));
        }

        sweeper.abort();
    }
}
