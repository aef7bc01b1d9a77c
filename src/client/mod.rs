use crate::config::PeerConfig;
use crate::error::{Result, SwarmError};
use crate::manager::ConnectionManager;
use crate::peer::{FileLayout, PeerConnection};
use crate::piece::{FileId, PieceSet, PieceStore};
use crate::storage::Repository;
use crate::tracker::{generate_peer_id, PeerId, PeerInfo, SwarmMember, TrackerClient};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{error, info, warn};

/// A participant in one or more swarms: serves what it holds, downloads what it asks for
pub struct PeerNode {
    config: PeerConfig,
    peer_id: PeerId,
    repository: Repository,
}

/// A running swarm membership for one file. Dropping it stops the
/// connections and the tracker heartbeat, so the tracker expires us;
/// `stop` also unregisters right away.
pub struct SwarmHandle {
    manager: ConnectionManager,
    local: PeerInfo,
    tracker_addr: SocketAddr,
    maintenance: JoinHandle<()>,
}

impl std::fmt::Debug for SwarmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmHandle")
            .field("local", &self.local)
            .field("tracker_addr", &self.tracker_addr)
            .finish_non_exhaustive()
    }
}

impl PeerNode {
    pub async fn new(config: PeerConfig) -> Result<Self> {
        config.validate()?;
        let repository = Repository::open(&config.repository_dir).await?;
        let peer_id = generate_peer_id();
        info!("Peer initialized with peer_id: {}", peer_id);

        Ok(Self {
            config,
            peer_id,
            repository,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Share a file from the repository. The file id is the SHA-1 of its content.
    pub async fn seed(&self, name: &str) -> Result<SwarmHandle> {
        let data = self.repository.read(name).await?;
        let file_id = FileId::from_content(&data);
        info!("Seeding {} as {}", name, file_id);

        let store = PieceStore::from_complete(
            file_id,
            &data,
            self.config.piece_size,
            self.config.block_size,
        )?;
        self.join(store).await
    }

    /// Fetch `file_id` from the swarm into `output`. The returned handle keeps
    /// serving the file until stopped. On failure the swarm is left again.
    pub async fn download(&self, file_id: &FileId, output: &str) -> Result<SwarmHandle> {
        info!("Starting download for: {}", file_id);
        // A bad destination fails before we announce anything
        self.repository.path(output)?;

        let mut tracker = TrackerClient::new(self.config.tracker_addr);
        let peers = candidates(tracker.get_peers(file_id).await?, &self.peer_id);
        if peers.is_empty() {
            return Err(SwarmError::NotFound(format!("No peers have {}", file_id)));
        }
        info!("Received {} peers from tracker", peers.len());

        let layout = self.fetch_layout(file_id, &peers).await?;
        info!(
            "File {}: {} bytes in pieces of {} bytes",
            file_id, layout.total_size, layout.piece_size
        );

        let store = PieceStore::with_block_size(
            file_id.clone(),
            layout.total_size,
            layout.piece_size,
            self.config.block_size,
        )?;
        let swarm = self.join(store).await?;

        if let Err(e) = self.fetch_into(&swarm, peers, output).await {
            warn!("Download of {} failed: {}", file_id, e);
            if let Err(left) = swarm.stop().await {
                warn!("Could not leave swarm for {}: {}", file_id, left);
            }
            return Err(e);
        }

        // Announce the full piece set right away rather than at the next tick
        let manager = swarm.manager();
        let held = manager.completed_pieces().await;
        if let Err(e) = tracker
            .register(&swarm.local, file_id, &held, manager.piece_count())
            .await
        {
            warn!("Could not announce completed download: {}", e);
        }

        Ok(swarm)
    }

    async fn fetch_into(
        &self,
        swarm: &SwarmHandle,
        peers: Vec<PeerInfo>,
        output: &str,
    ) -> Result<()> {
        let manager = swarm.manager();
        manager.add_peers(peers).await;
        manager.start();
        manager.wait_complete().await?;

        let data = manager.assemble().await?;
        self.repository.write(output, &data).await?;
        info!(
            "Download of {} complete: {} bytes written to {}",
            manager.file_id(),
            data.len(),
            output
        );
        Ok(())
    }

    /// Ask each candidate in turn for the file's layout
    async fn fetch_layout(&self, file_id: &FileId, peers: &[PeerInfo]) -> Result<FileLayout> {
        let limit = self.config.handshake_timeout();
        // A throwaway id, so this connection never collides with our real one
        let asker_id = generate_peer_id();

        for peer in peers {
            let attempt = async {
                let mut conn =
                    PeerConnection::connect(peer.addr, &asker_id, file_id, limit).await?;
                let layout = conn.request_file_info(file_id, limit).await?;
                layout.piece_count()?;
                Ok::<_, SwarmError>(layout)
            };
            match attempt.await {
                Ok(layout) => return Ok(layout),
                Err(e) => warn!("{} could not describe {}: {}", peer.peer_id, file_id, e),
            }
        }

        Err(SwarmError::Unavailable(format!("No reachable peer describes {}", file_id)))
    }

    /// Listen, register with the tracker and start the maintenance loop
    async fn join(&self, store: PieceStore) -> Result<SwarmHandle> {
        let file_id = store.file_id().clone();
        let manager = ConnectionManager::new(self.peer_id.clone(), store, self.config.clone());

        let listener = TcpListener::bind(self.config.listen_addr).await.map_err(|e| {
            error!("Cannot listen on {}: {}", self.config.listen_addr, e);
            SwarmError::IoError(e)
        })?;
        let local = PeerInfo::new(self.peer_id.clone(), listener.local_addr()?);
        manager.listen(listener);

        let mut tracker = TrackerClient::new(self.config.tracker_addr);
        let held = manager.completed_pieces().await;
        if let Err(e) = tracker
            .register(&local, &file_id, &held, manager.piece_count())
            .await
        {
            manager.shutdown();
            return Err(e);
        }

        let maintenance = tokio::spawn(maintain(
            tracker,
            manager.clone(),
            local.clone(),
            held,
            self.config.clone(),
        ));

        Ok(SwarmHandle {
            manager,
            local,
            tracker_addr: self.config.tracker_addr,
            maintenance,
        })
    }
}

impl SwarmHandle {
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn file_id(&self) -> &FileId {
        self.manager.file_id()
    }

    /// Address other peers reach us on
    pub fn addr(&self) -> SocketAddr {
        self.local.addr
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.local
    }

    /// Leave the swarm: stop maintenance and connections, then unregister
    pub async fn stop(self) -> Result<()> {
        self.maintenance.abort();
        self.manager.shutdown();

        let mut tracker = TrackerClient::new(self.tracker_addr);
        tracker.unregister(&self.local, self.manager.file_id()).await?;
        info!("Left swarm for {}", self.manager.file_id());
        Ok(())
    }
}

impl Drop for SwarmHandle {
    fn drop(&mut self) {
        self.maintenance.abort();
        self.manager.shutdown();
    }
}

fn candidates(members: BTreeMap<PeerId, SwarmMember>, local_id: &PeerId) -> Vec<PeerInfo> {
    members
        .into_iter()
        .filter(|(peer_id, _)| peer_id != local_id)
        .map(|(peer_id, member)| PeerInfo::new(peer_id, member.addr))
        .collect()
}

/// Keep our tracker entry alive and, while downloading, keep discovering peers.
/// Re-registers when the tracker forgot us or our piece set grew.
async fn maintain(
    mut tracker: TrackerClient,
    manager: ConnectionManager,
    local: PeerInfo,
    mut announced: PieceSet,
    config: PeerConfig,
) {
    let period = config.heartbeat_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    let file_id = manager.file_id().clone();

    loop {
        ticker.tick().await;

        let held = manager.completed_pieces().await;
        let must_register = if held != announced {
            true
        } else {
            match tracker.heartbeat(&local).await {
                Ok(()) => false,
                Err(SwarmError::NotFound(_)) => {
                    info!("Tracker expired us, registering again");
                    true
                }
                Err(e) => {
                    warn!("Heartbeat failed: {}", e);
                    false
                }
            }
        };

        if must_register {
            match tracker.register(&local, &file_id, &held, manager.piece_count()).await {
                Ok(()) => announced = held,
                Err(e) => warn!("Registration failed: {}", e),
            }
        }

        if !manager.is_complete() {
            let (done, total, percent) = manager.progress().await;
            info!("Progress: {}/{} pieces ({:.1}%)", done, total, percent);

            match tracker.get_peers(&file_id).await {
                Ok(members) => {
                    let added = manager.add_peers(candidates(members, &local.peer_id)).await;
                    if added > 0 {
                        info!("Connecting to {} newly listed peers", added);
                    }
                }
                Err(e) => warn!("Peer refresh failed: {}", e),
            }
        }
    }
}
