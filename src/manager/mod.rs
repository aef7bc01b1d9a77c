//! Live peer connections for one file: admission, per-connection tasks,
//! message dispatch and the request scheduler.
//!
//! Lock order is always `peers` then `download`. Neither lock is held across
//! a socket read or write; outgoing messages are queued on the connection's
//! channel and written by its writer task.

mod scheduler;
mod table;

pub use scheduler::{plan_requests, Candidate};
pub use table::{ConnState, PeerSlot, PeerTable, SlotId};

use crate::config::PeerConfig;
use crate::error::{ErrorCode, Result, SwarmError};
use crate::peer::{
    initiate_handshake, recv_message, send_message, ChokeState, FileLayout, PeerConnection,
    PeerMessage,
};
use crate::piece::{
    from_bitfield, to_bitfield, Delivery, DownloadState, FileId, PieceSet, PieceStore,
};
use crate::tracker::{PeerId, PeerInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Connection manager for a single file. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    local_id: PeerId,
    layout: FileLayout,
    piece_count: u32,
    config: PeerConfig,
    peers: Mutex<PeerTable>,
    download: Mutex<DownloadState>,
    complete: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    wake: Notify,
}

enum Pass {
    Complete,
    Idle,
    Scheduled(usize),
}

impl ConnectionManager {
    pub fn new(local_id: PeerId, store: PieceStore, config: PeerConfig) -> Self {
        let layout = FileLayout {
            file_id: store.file_id().clone(),
            total_size: store.total_size(),
            piece_size: store.piece_size(),
        };
        let piece_count = store.piece_count();
        let (complete, _) = watch::channel(store.is_file_complete());
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                local_id,
                layout,
                piece_count,
                config,
                peers: Mutex::new(PeerTable::new()),
                download: Mutex::new(DownloadState::new(store)),
                complete,
                shutdown,
                wake: Notify::new(),
            }),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    pub fn file_id(&self) -> &FileId {
        &self.shared.layout.file_id
    }

    pub fn layout(&self) -> &FileLayout {
        &self.shared.layout
    }

    pub fn piece_count(&self) -> u32 {
        self.shared.piece_count
    }

    pub fn is_complete(&self) -> bool {
        *self.shared.complete.borrow()
    }

    pub async fn completed_pieces(&self) -> PieceSet {
        self.shared.download.lock().await.store().completed_pieces()
    }

    /// `(complete pieces, total pieces, percent)`
    pub async fn progress(&self) -> (usize, u32, f64) {
        let download = self.shared.download.lock().await;
        let store = download.store();
        (store.complete_count(), store.piece_count(), store.progress())
    }

    pub async fn assemble(&self) -> Result<Vec<u8>> {
        self.shared.download.lock().await.store().assemble()
    }

    pub async fn active_peers(&self) -> Vec<PeerId> {
        self.shared
            .peers
            .lock()
            .await
            .active()
            .map(|slot| slot.peer_id.clone())
            .collect()
    }

    pub async fn outstanding_requests(&self) -> usize {
        self.shared.download.lock().await.requests().len()
    }

    /// Dial new candidates, skipping ourselves and peers already known, up to the cap.
    /// Returns how many dials were started.
    pub async fn add_peers(&self, candidates: Vec<PeerInfo>) -> usize {
        let shared = &self.shared;
        let mut peers = shared.peers.lock().await;
        let mut started = 0;

        for info in candidates {
            if info.peer_id == shared.local_id || peers.contains(&info.peer_id) {
                continue;
            }
            if peers.len() >= shared.config.max_peers {
                debug!("Peer limit of {} reached", shared.config.max_peers);
                break;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let slot = PeerSlot::new(info.peer_id.clone(), info.addr, ConnState::Connecting, tx);
            if let Some(id) = peers.insert(slot) {
                tokio::spawn(Arc::clone(shared).dial(id, info, rx));
                started += 1;
            }
        }

        started
    }

    /// Accept inbound peers on `listener` until shutdown
    pub fn listen(&self, listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.shared).accept_loop(listener))
    }

    /// Start the scheduling loop. It ends when the file is complete or on shutdown.
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.shared).schedule_loop())
    }

    pub async fn wait_complete(&self) -> Result<()> {
        let mut complete = self.shared.complete.subscribe();
        complete
            .wait_for(|done| *done)
            .await
            .map_err(|_| SwarmError::Incomplete("download abandoned".to_string()))?;
        Ok(())
    }

    /// Stop every task owned by this manager. Connections tear down on their own.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Drop a peer and give its in-flight blocks back
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let mut peers = self.shared.peers.lock().await;
        match peers.lookup(peer_id) {
            Some(id) => self.shared.teardown_locked(&mut peers, id, peer_id).await,
            None => false,
        }
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Listening for peers on {}", addr);
        }
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(Arc::clone(&self).inbound(stream, addr));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }
    }

    async fn inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut conn = match PeerConnection::accept(
            stream,
            addr,
            &self.local_id,
            &self.layout.file_id,
            self.config.handshake_timeout(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Handshake from {} failed: {}", addr, e);
                return;
            }
        };

        let peer_id = conn.remote_id().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let admitted = {
            let mut peers = self.peers.lock().await;
            self.admit(&mut peers, &peer_id, addr, tx)
        };

        match admitted {
            Some(id) => {
                info!("Peer {} connected from {}", peer_id, addr);
                let (reader, writer) = conn.into_split();
                self.run(id, peer_id, reader, writer, rx).await;
            }
            None => {
                debug!("Turning away {} at {}", peer_id, addr);
                let busy = PeerMessage::error(ErrorCode::Unavailable, "Too many peers");
                let _ = conn.send_message(&busy).await;
            }
        }
    }

    /// Slot for an inbound peer that finished its handshake. When both sides
    /// dial each other at once, the connection opened by the smaller id wins.
    fn admit(
        &self,
        peers: &mut PeerTable,
        peer_id: &PeerId,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<PeerMessage>,
    ) -> Option<SlotId> {
        if peer_id == &self.local_id {
            return None;
        }

        if let Some(existing) = peers.lookup(peer_id) {
            let superseded = peers
                .get(existing)
                .map_or(false, |slot| !slot.is_active() && peer_id < &self.local_id);
            if !superseded {
                return None;
            }
            peers.remove(existing);
        }

        if peers.len() >= self.config.max_peers {
            return None;
        }

        peers.insert(PeerSlot::new(peer_id.clone(), addr, ConnState::Active, sender))
    }

    async fn dial(self: Arc<Self>, id: SlotId, info: PeerInfo, rx: UnboundedReceiver<PeerMessage>) {
        match self.connect(id, &info).await {
            Ok(Some((reader, writer))) => {
                info!("Peer {} connected at {}", info.peer_id, info.addr);
                self.run(id, info.peer_id, reader, writer, rx).await;
            }
            Ok(None) => debug!("Dial to {} superseded by its own connection", info.peer_id),
            Err(e) => {
                warn!("Could not connect to {} at {}: {}", info.peer_id, info.addr, e);
                self.teardown(id, &info.peer_id).await;
            }
        }
    }

    /// `connecting -> handshaking -> active`. `Ok(None)` when the slot was replaced meanwhile.
    async fn connect(
        &self,
        id: SlotId,
        info: &PeerInfo,
    ) -> Result<Option<(OwnedReadHalf, OwnedWriteHalf)>> {
        let limit = self.config.handshake_timeout();
        let mut stream = timeout(limit, TcpStream::connect(info.addr)).await??;

        if !self.set_conn_state(id, ConnState::Handshaking).await {
            return Ok(None);
        }

        let handshake = initiate_handshake(&mut stream, &self.local_id, &self.layout.file_id);
        let remote = timeout(limit, handshake).await??;
        if remote != info.peer_id {
            return Err(SwarmError::ProtocolError(format!(
                "expected peer {}, handshake came from {}",
                info.peer_id, remote
            )));
        }

        if !self.set_conn_state(id, ConnState::Active).await {
            return Ok(None);
        }
        Ok(Some(stream.into_split()))
    }

    async fn set_conn_state(&self, id: SlotId, state: ConnState) -> bool {
        match self.peers.lock().await.get_mut(id) {
            Some(slot) => {
                slot.conn = state;
                true
            }
            None => false,
        }
    }

    async fn run(
        self: Arc<Self>,
        id: SlotId,
        peer_id: PeerId,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        rx: UnboundedReceiver<PeerMessage>,
    ) {
        self.greet(id).await;

        let mut writer_task = tokio::spawn(write_loop(writer, rx, self.config.keepalive()));
        let mut shutdown = self.shutdown.subscribe();

        let outcome = tokio::select! {
            result = self.read_loop(id, &peer_id, reader) => result,
            joined = &mut writer_task => match joined {
                Ok(result) => result,
                Err(e) => Err(SwarmError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                ))),
            },
            _ = shutdown.wait_for(|stop| *stop) => Ok(()),
        };
        writer_task.abort();

        match outcome {
            Ok(()) => info!("Peer {} disconnected", peer_id),
            Err(e) => warn!("Connection to {} ended: {}", peer_id, e),
        }
        self.teardown(id, &peer_id).await;
    }

    /// First messages on a fresh connection: our pieces, and interest if we still need any
    async fn greet(&self, id: SlotId) {
        let (held, complete) = {
            let download = self.download.lock().await;
            (download.store().completed_pieces(), download.store().is_file_complete())
        };

        let mut peers = self.peers.lock().await;
        if let Some(slot) = peers.get_mut(id) {
            if !held.is_empty() {
                slot.send(PeerMessage::Bitfield {
                    piece_count: self.piece_count,
                    bitfield: to_bitfield(&held, self.piece_count),
                });
            }
            if !complete {
                slot.send(PeerMessage::Interested);
            }
        }
    }

    async fn read_loop(
        &self,
        id: SlotId,
        peer_id: &PeerId,
        mut reader: OwnedReadHalf,
    ) -> Result<()> {
        loop {
            let next = timeout(self.config.read_timeout(), recv_message(&mut reader));
            let message = match next.await?? {
                Some(message) => message,
                None => return Ok(()),
            };
            debug!("Received {} from {}", message.name(), peer_id);
            self.dispatch(id, peer_id, message).await?;
        }
    }

    async fn dispatch(&self, id: SlotId, peer_id: &PeerId, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::KeepAlive
            | PeerMessage::HandshakeAck { .. }
            | PeerMessage::FileInfo { .. } => {}
            PeerMessage::Handshake { .. } => {
                self.reply(
                    id,
                    PeerMessage::HandshakeAck {
                        peer_id: self.local_id.clone(),
                    },
                )
                .await;
            }
            signal @ (PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested) => {
                let mut peers = self.peers.lock().await;
                if let Some(slot) = peers.get_mut(id) {
                    slot.state.on_received(&signal);
                    if signal == PeerMessage::Interested {
                        slot.send(PeerMessage::Unchoke);
                    }
                }
                if signal == PeerMessage::Unchoke {
                    self.wake.notify_one();
                }
            }
            PeerMessage::Have { piece_index } => {
                if piece_index < self.piece_count {
                    if let Some(slot) = self.peers.lock().await.get_mut(id) {
                        slot.pieces.insert(piece_index);
                    }
                    self.wake.notify_one();
                }
            }
            PeerMessage::Bitfield { bitfield, .. } => {
                let pieces = from_bitfield(&bitfield, self.piece_count);
                if let Some(slot) = self.peers.lock().await.get_mut(id) {
                    slot.pieces.extend(pieces);
                }
                self.wake.notify_one();
            }
            PeerMessage::RequestFile { file_id } => {
                let answer = if file_id == self.layout.file_id {
                    PeerMessage::FileInfo {
                        file_id,
                        total_size: self.layout.total_size,
                        piece_size: self.layout.piece_size,
                    }
                } else {
                    PeerMessage::error(ErrorCode::NotFound, "File not found")
                };
                self.reply(id, answer).await;
            }
            PeerMessage::Request { block } => {
                let mut peers = self.peers.lock().await;
                let slot = match peers.get_mut(id) {
                    Some(slot) => slot,
                    None => return Ok(()),
                };

                let answer = if slot.state.am_choking == ChokeState::Choked {
                    PeerMessage::Error {
                        code: ErrorCode::Unavailable,
                        block: Some(block),
                        message: "Choked".to_string(),
                    }
                } else {
                    let download = self.download.lock().await;
                    let store = download.store();
                    match store.read_block(block.piece_index, block.offset, block.length) {
                        Ok(data) => PeerMessage::Piece {
                            piece_index: block.piece_index,
                            offset: block.offset,
                            data: data.to_vec(),
                        },
                        Err(e) => PeerMessage::Error {
                            code: e.code(),
                            block: Some(block),
                            message: e.to_string(),
                        },
                    }
                };
                slot.send(answer);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.on_block(peer_id, piece_index, offset, &data).await,
            PeerMessage::Error {
                code: ErrorCode::Unavailable,
                block: Some(block),
                message,
            } => {
                debug!("{} cannot serve {:?}: {}", peer_id, block, message);
                let mut peers = self.peers.lock().await;
                if let Some(slot) = peers.get_mut(id) {
                    slot.pieces.remove(&block.piece_index);
                }
                self.download
                    .lock()
                    .await
                    .release_block(block.piece_index, block.offset, peer_id);
                drop(peers);
                self.wake.notify_one();
            }
            PeerMessage::Error { code, message, .. } => {
                warn!("{} reported {:?}: {}", peer_id, code, message);
            }
            PeerMessage::Unknown { tag } => {
                self.reply(
                    id,
                    PeerMessage::error(
                        ErrorCode::ProtocolError,
                        format!("Unknown message type {:#04x}", tag),
                    ),
                )
                .await;
            }
        }

        Ok(())
    }

    async fn reply(&self, id: SlotId, message: PeerMessage) {
        if let Some(slot) = self.peers.lock().await.get_mut(id) {
            slot.send(message);
        }
    }

    async fn on_block(&self, peer_id: &PeerId, piece_index: u32, offset: u32, data: &[u8]) {
        let delivery = self.download.lock().await.deliver(piece_index, offset, data);

        match delivery {
            Ok(Delivery::Duplicate) => {
                debug!("Duplicate block {}+{} from {}", piece_index, offset, peer_id);
            }
            Ok(Delivery::Stored {
                piece_complete,
                file_complete,
            }) => {
                if piece_complete {
                    let (done, total) = {
                        let download = self.download.lock().await;
                        (download.store().complete_count(), download.store().piece_count())
                    };
                    info!("Piece {} complete ({}/{})", piece_index, done, total);
                    self.peers.lock().await.broadcast(&PeerMessage::Have { piece_index });
                }
                if file_complete {
                    info!("File {} complete", self.layout.file_id);
                    self.peers.lock().await.broadcast(&PeerMessage::NotInterested);
                    self.complete.send_replace(true);
                }
            }
            Err(e) => warn!("Discarding block {}+{} from {}: {}", piece_index, offset, peer_id, e),
        }
    }

    async fn teardown(&self, id: SlotId, peer_id: &PeerId) -> bool {
        let mut peers = self.peers.lock().await;
        self.teardown_locked(&mut peers, id, peer_id).await
    }

    async fn teardown_locked(&self, peers: &mut PeerTable, id: SlotId, peer_id: &PeerId) -> bool {
        if peers.remove(id).is_none() {
            return false;
        }

        let released = self.download.lock().await.release_peer(peer_id);
        if released > 0 {
            info!("Released {} blocks requested from {}", released, peer_id);
            self.wake.notify_one();
        }
        true
    }

    async fn schedule_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let pause = match self.schedule_pass().await {
                Pass::Complete => break,
                Pass::Idle => self.config.idle_backoff(),
                Pass::Scheduled(count) => {
                    if count > 0 {
                        debug!("Requested {} blocks", count);
                    }
                    self.config.schedule_interval()
                }
            };

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = self.wake.notified() => {}
                _ = sleep(pause) => {}
            }
        }

        debug!("Scheduler for {} stopped", self.layout.file_id);
    }

    async fn schedule_pass(&self) -> Pass {
        let mut peers = self.peers.lock().await;
        let mut download = self.download.lock().await;
        if download.store().is_file_complete() {
            return Pass::Complete;
        }

        let candidates: Vec<Candidate<'_>> = peers
            .active()
            .filter(|slot| slot.state.can_download())
            .map(|slot| Candidate {
                peer_id: &slot.peer_id,
                pieces: &slot.pieces,
            })
            .collect();
        if candidates.is_empty() {
            debug!("No peer has unchoked us, idling");
            return Pass::Idle;
        }

        let plan = {
            let mut rng = rand::thread_rng();
            plan_requests(&mut download, &candidates, &mut rng)
        };
        drop(download);

        let mut sent = 0;
        for (peer_id, block) in plan {
            let slot = peers.lookup(&peer_id).and_then(|id| peers.get_mut(id));
            if let Some(slot) = slot {
                if slot.send(PeerMessage::Request { block }) {
                    sent += 1;
                }
            }
        }
        Pass::Scheduled(sent)
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: UnboundedReceiver<PeerMessage>,
    keepalive: Duration,
) -> Result<()> {
    loop {
        let message = match timeout(keepalive, outbox.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(_) => PeerMessage::KeepAlive,
        };
        send_message(&mut writer, &message).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BlockInfo;

    fn config() -> PeerConfig {
        PeerConfig {
            schedule_interval_ms: 10,
            idle_backoff_ms: 50,
            handshake_timeout_ms: 1000,
            ..PeerConfig::default()
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    async fn seeder(name: &str, data: &[u8]) -> (ConnectionManager, PeerInfo) {
        let store = PieceStore::from_complete(FileId::from_content(data), data, 1024, 256).unwrap();
        let manager = ConnectionManager::new(PeerId::from(name), store, config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = PeerInfo::new(PeerId::from(name), listener.local_addr().unwrap());
        manager.listen(listener);
        (manager, info)
    }

    /// Handshake as a bare client and skip the greeting bitfield
    async fn raw_client(seed: &PeerInfo, file_id: &FileId) -> TcpStream {
        let mut stream = TcpStream::connect(seed.addr).await.unwrap();
        initiate_handshake(&mut stream, &PeerId::from("raw"), file_id)
            .await
            .unwrap();
        stream
    }

    /// A downloader for a 2500-byte file, listening on loopback. Not started.
    async fn leech(file_id: &FileId, config: PeerConfig) -> (ConnectionManager, PeerInfo) {
        let store = PieceStore::with_block_size(file_id.clone(), 2500, 1024, 256).unwrap();
        let manager = ConnectionManager::new(PeerId::from("leech"), store, config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = PeerInfo::new(PeerId::from("leech"), listener.local_addr().unwrap());
        manager.listen(listener);
        (manager, info)
    }

    async fn wait_for_table<F>(manager: &ConnectionManager, check: F)
    where
        F: Fn(&PeerTable) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            while !check(&*manager.shared.peers.lock().await) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn slot<'a>(peers: &'a PeerTable, name: &str) -> Option<&'a PeerSlot> {
        peers.lookup(&PeerId::from(name)).and_then(|id| peers.get(id))
    }

    async fn next_reply(stream: &mut TcpStream) -> PeerMessage {
        loop {
            match recv_message(stream).await.unwrap().unwrap() {
                PeerMessage::Bitfield { .. } | PeerMessage::KeepAlive => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_download_from_two_seeders() {
        let data = content(2500);
        let file_id = FileId::from_content(&data);
        let (seed_a, info_a) = seeder("seed-a", &data).await;
        let (seed_b, info_b) = seeder("seed-b", &data).await;

        let store = PieceStore::with_block_size(file_id, 2500, 1024, 256).unwrap();
        let downloader = ConnectionManager::new(PeerId::from("leech"), store, config());
        assert_eq!(downloader.add_peers(vec![info_a, info_b]).await, 2);
        downloader.start();

        timeout(Duration::from_secs(10), downloader.wait_complete())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(downloader.assemble().await.unwrap(), data);
        assert_eq!(downloader.outstanding_requests().await, 0);

        downloader.shutdown();
        seed_a.shutdown();
        seed_b.shutdown();
    }

    #[tokio::test]
    async fn test_add_peers_skips_self_and_known() {
        let data = content(100);
        let (seed, info) = seeder("seed", &data).await;
        let store = PieceStore::new(FileId::from_content(&data), 100, 1024).unwrap();
        let manager = ConnectionManager::new(PeerId::from("leech"), store, config());

        let me = PeerInfo::new(PeerId::from("leech"), info.addr);
        assert_eq!(manager.add_peers(vec![me, info.clone()]).await, 1);
        assert_eq!(manager.add_peers(vec![info]).await, 0);

        manager.shutdown();
        seed.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_message_gets_error_and_connection_survives() {
        let data = content(3000);
        let file_id = FileId::from_content(&data);
        let (seed, info) = seeder("seed", &data).await;
        let mut stream = raw_client(&info, &file_id).await;

        crate::frame::write_frame(&mut stream, &crate::frame::Frame::empty(0x7f))
            .await
            .unwrap();
        match next_reply(&mut stream).await {
            PeerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::ProtocolError),
            other => panic!("unexpected reply {:?}", other),
        }

        send_message(&mut stream, &PeerMessage::Interested).await.unwrap();
        assert_eq!(next_reply(&mut stream).await, PeerMessage::Unchoke);

        seed.shutdown();
    }

    #[tokio::test]
    async fn test_request_is_served_after_unchoke() {
        let data = content(3000);
        let file_id = FileId::from_content(&data);
        let (seed, info) = seeder("seed", &data).await;
        let mut stream = raw_client(&info, &file_id).await;

        let block = BlockInfo::new(1, 256, 256);
        send_message(&mut stream, &PeerMessage::Request { block }).await.unwrap();
        match next_reply(&mut stream).await {
            PeerMessage::Error { code, block: Some(b), .. } => {
                assert_eq!(code, ErrorCode::Unavailable);
                assert_eq!(b, block);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        send_message(&mut stream, &PeerMessage::Interested).await.unwrap();
        assert_eq!(next_reply(&mut stream).await, PeerMessage::Unchoke);

        send_message(&mut stream, &PeerMessage::Request { block }).await.unwrap();
        assert_eq!(
            next_reply(&mut stream).await,
            PeerMessage::Piece {
                piece_index: 1,
                offset: 256,
                data: data[1280..1536].to_vec(),
            }
        );

        seed.shutdown();
    }

    #[tokio::test]
    async fn test_missing_piece_answers_unavailable() {
        let file_id = FileId::from("partial");
        let store = PieceStore::new(file_id.clone(), 4096, 1024).unwrap();
        let manager = ConnectionManager::new(PeerId::from("leech"), store, config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = PeerInfo::new(PeerId::from("leech"), listener.local_addr().unwrap());
        manager.listen(listener);

        let mut stream = raw_client(&info, &file_id).await;
        // The leech greets with Interested, since it still needs pieces
        assert_eq!(next_reply(&mut stream).await, PeerMessage::Interested);

        send_message(&mut stream, &PeerMessage::Interested).await.unwrap();
        assert_eq!(next_reply(&mut stream).await, PeerMessage::Unchoke);

        let block = BlockInfo::new(0, 0, 512);
        send_message(&mut stream, &PeerMessage::Request { block }).await.unwrap();
        match next_reply(&mut stream).await {
            PeerMessage::Error { code, block: Some(b), .. } => {
                assert_eq!(code, ErrorCode::Unavailable);
                assert_eq!(b, block);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_request_file_answers_layout() {
        let data = content(5000);
        let file_id = FileId::from_content(&data);
        let (seed, info) = seeder("seed", &data).await;

        let limit = Duration::from_secs(1);
        let mut conn = PeerConnection::connect(info.addr, &PeerId::from("asker"), &file_id, limit)
            .await
            .unwrap();
        let layout = conn.request_file_info(&file_id, limit).await.unwrap();

        assert_eq!(layout.total_size, 5000);
        assert_eq!(layout.piece_size, 1024);
        seed.shutdown();
    }

    #[tokio::test]
    async fn test_remove_peer_releases_claims() {
        let data = content(2500);
        let file_id = FileId::from_content(&data);
        let manager = ConnectionManager::new(
            PeerId::from("leech"),
            PieceStore::with_block_size(file_id.clone(), 2500, 1024, 256).unwrap(),
            config(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = PeerInfo::new(PeerId::from("leech"), listener.local_addr().unwrap());
        manager.listen(listener);
        manager.start();

        // Pose as a seeder holding everything
        let mut stream = raw_client(&info, &file_id).await;
        let all: PieceSet = (0..3).collect();
        send_message(
            &mut stream,
            &PeerMessage::Bitfield {
                piece_count: 3,
                bitfield: to_bitfield(&all, 3),
            },
        )
        .await
        .unwrap();
        send_message(&mut stream, &PeerMessage::Unchoke).await.unwrap();

        loop {
            if let PeerMessage::Request { .. } = next_reply(&mut stream).await {
                break;
            }
        }
        timeout(Duration::from_secs(5), async {
            while manager.outstanding_requests().await < 10 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(manager.remove_peer(&PeerId::from("raw")).await);
        assert_eq!(manager.outstanding_requests().await, 0);
        assert!(manager.active_peers().await.is_empty());

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_choked_holder_gets_no_requests() {
        let file_id = FileId::from("gated");
        let (manager, info) = leech(&file_id, config()).await;
        let mut stream = raw_client(&info, &file_id).await;
        assert_eq!(next_reply(&mut stream).await, PeerMessage::Interested);

        let all: PieceSet = (0..3).collect();
        let bitfield = PeerMessage::Bitfield {
            piece_count: 3,
            bitfield: to_bitfield(&all, 3),
        };
        send_message(&mut stream, &bitfield).await.unwrap();
        wait_for_table(&manager, |peers| {
            slot(peers, "raw").map_or(false, |s| s.pieces.len() == 3)
        })
        .await;

        // Holds every piece but still chokes us
        assert!(matches!(manager.shared.schedule_pass().await, Pass::Idle));
        assert_eq!(manager.outstanding_requests().await, 0);

        manager.start();
        let silence = timeout(Duration::from_millis(300), next_reply(&mut stream)).await;
        assert!(silence.is_err(), "request sent while choked: {:?}", silence);
        assert_eq!(manager.outstanding_requests().await, 0);

        send_message(&mut stream, &PeerMessage::Unchoke).await.unwrap();
        assert!(matches!(next_reply(&mut stream).await, PeerMessage::Request { .. }));

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_silent_handshake_times_out_and_frees_slot() {
        let (manager, _) = leech(
            &FileId::from("f"),
            PeerConfig {
                handshake_timeout_ms: 500,
                ..config()
            },
        )
        .await;
        manager.start();

        // Accepts the connection but never acknowledges the handshake
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = PeerInfo::new(PeerId::from("silent"), silent.local_addr().unwrap());
        assert_eq!(manager.add_peers(vec![info]).await, 1);

        let (mut stream, _) = silent.accept().await.unwrap();
        let hello = recv_message(&mut stream).await.unwrap();
        assert!(matches!(hello, Some(PeerMessage::Handshake { .. })));

        let id = {
            let peers = manager.shared.peers.lock().await;
            assert_eq!(slot(&peers, "silent").unwrap().conn, ConnState::Handshaking);
            peers.lookup(&PeerId::from("silent")).unwrap()
        };
        assert!(manager.active_peers().await.is_empty());

        wait_for_table(&manager, |peers| !peers.contains(&PeerId::from("silent"))).await;
        assert!(manager.shared.peers.lock().await.get(id).is_none());
        assert!(matches!(manager.shared.schedule_pass().await, Pass::Idle));
        assert_eq!(manager.outstanding_requests().await, 0);

        manager.shutdown();
    }
}
