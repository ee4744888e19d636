#![forbid(unsafe_code)]

// Room module - room/peer state and the process-wide room registry

use crate::media::peer_media::PeerMedia;
use crate::media::types::{
    ConsumerInfo, SessionError, SessionResult, TransportDirection, TransportInfo,
};
use crate::media::{MediaConfig, WorkerPool};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{PeerRole, PeerSummary, ProducerSummary, ServerMessage};
use anyhow::Result;
use mediasoup::prelude::*;
use mediasoup::producer::ProducerId;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::OwnedMutexGuard;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, error, info, warn};

/// Peer admitted to a room
pub struct Peer {
    pub id: String,
    pub name: String,
    pub role: PeerRole,
    pub sender: mpsc::Sender<Arc<String>>,
    /// Announced producers, for discovery by later joiners
    producers: HashMap<String, MediaKind>,
    media: Arc<TokioMutex<PeerMedia>>,
}

impl Peer {
    fn new(id: String, name: String, role: PeerRole, sender: mpsc::Sender<Arc<String>>) -> Self {
        let media = Arc::new(TokioMutex::new(PeerMedia::new(id.clone())));
        Self {
            id,
            name,
            role,
            sender,
            producers: HashMap::new(),
            media,
        }
    }

    pub fn media(&self) -> Arc<TokioMutex<PeerMedia>> {
        self.media.clone()
    }

    /// Tears down the peer's whole media tree. Called outside any room lock;
    /// waits for in-flight engine calls guarded by the media mutex.
    async fn close_media(&self) {
        self.media.lock().await.close_all();
    }

    fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            display_name: self.name.clone(),
            role: self.role,
            producers: self
                .producers
                .iter()
                .map(|(id, kind)| ProducerSummary {
                    id: id.clone(),
                    kind: *kind,
                })
                .collect(),
        }
    }
}

/// Room state: the owning router, its worker's WebRTC server, and the peers.
/// The router lives exactly as long as the room; dropping the last handle
/// closes it in the engine.
pub struct Room {
    pub id: String,
    router: Router,
    webrtc_server: WebRtcServer,
    worker_id: WorkerId,
    peers: HashMap<String, Peer>,
    closing: bool,
}

impl Room {
    fn new(id: String, router: Router, webrtc_server: WebRtcServer, worker_id: WorkerId) -> Self {
        Self {
            id,
            router,
            webrtc_server,
            worker_id,
            peers: HashMap::new(),
            closing: false,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn peer_summaries_except(&self, peer_id: &str) -> Vec<PeerSummary> {
        self.peers
            .values()
            .filter(|p| p.id != peer_id)
            .map(Peer::summary)
            .collect()
    }

    /// Which peer announced this producer, and what kind it carries.
    fn find_producer(&self, producer_id: &str) -> Option<(&Peer, MediaKind)> {
        self.peers.values().find_map(|peer| {
            peer.producers
                .get(producer_id)
                .map(|kind| (peer, *kind))
        })
    }

    fn deliver(&self, peer: &Peer, json: Arc<String>) {
        match peer.sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel full for peer {} in room {}, dropping message",
                    peer.id, self.id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "Channel closed for peer {} in room {} (disconnected)",
                    peer.id, self.id
                );
            }
        }
    }

    /// Broadcast a message to all peers except the sender
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for peer in self.peers.values() {
            if peer.id != sender_id {
                self.deliver(peer, json.clone());
            }
        }
    }

    /// Broadcast a message to all peers
    fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for peer in self.peers.values() {
            self.deliver(peer, json.clone());
        }
    }
}

/// Process-wide registry of rooms and the entry point for every session
/// operation.
///
/// Locking discipline: the outer map is a std RwLock held only for brief
/// lookups, never across await points. Each room has its own tokio RwLock,
/// held for state mutation only. Engine round-trips (transport creation,
/// connect, produce, consume) run outside the room lock, serialized solely by
/// the owning peer's media mutex, so unrelated peers never block each other.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    /// Per-roomId creation gates: racing joins for the same previously-unseen
    /// id serialize here so exactly one router is ever created per room.
    create_gates: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    workers: Arc<WorkerPool>,
    config: MediaConfig,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    /// Creates the registry and starts the worker pool.
    ///
    /// # Errors
    /// Returns an error if worker startup fails.
    pub async fn new(config: MediaConfig, metrics: ServerMetrics) -> Result<Self> {
        let workers = Arc::new(WorkerPool::new(&config).await?);
        Ok(Self {
            rooms: StdRwLock::new(HashMap::new()),
            create_gates: StdMutex::new(HashMap::new()),
            workers,
            config,
            metrics,
        })
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Gets a room lock by id (brief outer read lock, no await)
    fn get_room(&self, room_id: &str) -> SessionResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))
    }

    /// Locks the creation gate for a room id. Gates are retired together with
    /// their room, so after acquiring we verify the gate is still current and
    /// retry with the fresh one if not.
    async fn lock_create_gate(&self, room_id: &str) -> OwnedMutexGuard<()> {
        loop {
            let gate = {
                let mut gates = self.create_gates.lock().unwrap_or_else(|e| e.into_inner());
                gates
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(TokioMutex::new(())))
                    .clone()
            };
            let guard = gate.clone().lock_owned().await;
            let current = {
                let gates = self.create_gates.lock().unwrap_or_else(|e| e.into_inner());
                gates
                    .get(room_id)
                    .map(|g| Arc::ptr_eq(g, &gate))
                    .unwrap_or(false)
            };
            if current {
                return guard;
            }
        }
    }

    /// Gets or creates a room, creating its router on a pool worker if needed.
    async fn get_or_create_room(&self, room_id: &str) -> SessionResult<Arc<TokioRwLock<Room>>> {
        // Fast path: room exists (brief outer read lock)
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        let _gate = self.lock_create_gate(room_id).await;

        // Re-check under the gate: a racing creator may have finished first
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        info!("Creating room {}", room_id);
        let lease = self.workers.acquire()?;
        let router = match lease
            .worker
            .create_router(self.config.router.to_router_options())
            .await
        {
            Ok(router) => router,
            Err(e) => {
                self.workers.note_router_closed(lease.worker_id);
                // Worker trouble reaches the process through the fatal watch
                // channel; the requesting client just sees a retryable error.
                error!("Router creation failed for room {}: {}", room_id, e);
                return Err(SessionError::ServerBusy);
            }
        };
        self.metrics.inc_rooms_created();

        let room = Room::new(
            room_id.to_string(),
            router,
            lease.webrtc_server,
            lease.worker_id,
        );
        let room_arc = Arc::new(TokioRwLock::new(room));
        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.insert(room_id.to_string(), room_arc.clone());
        }
        Ok(room_arc)
    }

    /// Admits a peer, creating the room if needed. Joining with a peer id
    /// already present replaces the old session: its media tree is closed and
    /// the new peer starts clean.
    ///
    /// Returns the other peers already in the room with their producer
    /// metadata, so the joiner can start consuming immediately.
    pub async fn join_room(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: String,
        role: PeerRole,
        sender: mpsc::Sender<Arc<String>>,
    ) -> SessionResult<Vec<PeerSummary>> {
        // A room can begin teardown between lookup and write lock; the empty
        // room sweep removes it from the map promptly, so retry once.
        for _ in 0..2 {
            let room_lock = self.get_or_create_room(room_id).await?;
            let (replaced, others) = {
                let mut room = room_lock.write().await;
                if room.closing {
                    continue;
                }
                let replaced = room.peers.remove(peer_id);
                if let Some(old) = &replaced {
                    info!(
                        "Peer {} rejoined room {}, replacing previous session",
                        peer_id, room_id
                    );
                    // The engine cascade kills consumers of the old session's
                    // producers; tell the room before the new session appears.
                    for producer_id in old.producers.keys() {
                        room.broadcast_all(&ServerMessage::ProducerClosed {
                            producer_id: producer_id.clone(),
                        });
                    }
                }
                let peer = Peer::new(
                    peer_id.to_string(),
                    display_name.clone(),
                    role,
                    sender.clone(),
                );
                room.peers.insert(peer_id.to_string(), peer);
                room.broadcast_except(
                    peer_id,
                    &ServerMessage::PeerJoined {
                        peer_id: peer_id.to_string(),
                        display_name: display_name.clone(),
                        role,
                    },
                );
                (replaced, room.peer_summaries_except(peer_id))
            };
            if let Some(old) = replaced {
                old.close_media().await;
            }
            self.metrics.inc_joins();
            info!("Peer {} ({:?}) joined room {}", peer_id, role, room_id);
            return Ok(others);
        }
        Err(SessionError::RoomClosing(room_id.to_string()))
    }

    /// Removes a peer and tears down its media tree, closing the room if it
    /// becomes empty. Idempotent: removing an unknown peer, or from an
    /// unknown room, is a no-op.
    pub async fn remove_peer(&self, room_id: &str, peer_id: &str) {
        self.remove_peer_inner(room_id, peer_id, None).await;
    }

    /// Disconnect-path removal: only removes the peer if it still belongs to
    /// this connection. A peer replaced by a newer session is left alone.
    pub async fn remove_peer_if_attached(
        &self,
        room_id: &str,
        peer_id: &str,
        sender: &mpsc::Sender<Arc<String>>,
    ) {
        self.remove_peer_inner(room_id, peer_id, Some(sender)).await;
    }

    async fn remove_peer_inner(
        &self,
        room_id: &str,
        peer_id: &str,
        sender: Option<&mpsc::Sender<Arc<String>>>,
    ) {
        let room_lock = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room_id) {
                Some(room) => room.clone(),
                None => return,
            }
        };

        let (removed, empty) = {
            let mut room = room_lock.write().await;
            let attached = match (sender, room.peers.get(peer_id)) {
                (Some(sender), Some(peer)) => sender.same_channel(&peer.sender),
                (None, Some(_)) => true,
                (_, None) => false,
            };
            if !attached {
                return;
            }
            let peer = room.peers.remove(peer_id);
            if let Some(peer) = &peer {
                for producer_id in peer.producers.keys() {
                    room.broadcast_all(&ServerMessage::ProducerClosed {
                        producer_id: producer_id.clone(),
                    });
                }
                room.broadcast_all(&ServerMessage::PeerLeft {
                    peer_id: peer_id.to_string(),
                });
            }
            (peer, room.peers.is_empty())
        };

        let Some(peer) = removed else { return };
        peer.close_media().await;
        self.metrics.inc_leaves();
        info!("Peer {} left room {}", peer_id, room_id);

        if empty {
            self.remove_room_if_empty(room_id).await;
        }
    }

    /// Disposes of a room if it has no peers. Takes the creation gate so a
    /// concurrent join for the same id either sees the room before removal or
    /// creates a fresh one after.
    async fn remove_room_if_empty(&self, room_id: &str) {
        let _gate = self.lock_create_gate(room_id).await;

        let room_lock = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room_id) {
                Some(room) => room.clone(),
                None => return,
            }
        };
        let worker_id = {
            let mut room = room_lock.write().await;
            if !room.peers.is_empty() {
                return;
            }
            room.closing = true;
            room.worker_id
        };
        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(room_id);
        }
        {
            let mut gates = self.create_gates.lock().unwrap_or_else(|e| e.into_inner());
            gates.remove(room_id);
        }
        self.workers.note_router_closed(worker_id);
        info!("Room {} is empty, closed", room_id);
        // Dropping the last Arc closes the router in the engine.
    }

    /// Router RTP capabilities the joining client needs before any transport
    /// work.
    pub async fn router_rtp_capabilities(
        &self,
        room_id: &str,
    ) -> SessionResult<RtpCapabilitiesFinalized> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Ok(room.router().rtp_capabilities().clone())
    }

    /// Resolves a peer's media handle under a brief room read lock.
    async fn peer_media(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> SessionResult<Arc<TokioMutex<PeerMedia>>> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        if room.closing {
            return Err(SessionError::RoomClosing(room_id.to_string()));
        }
        let peer = room
            .peer(peer_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
        Ok(peer.media())
    }

    /// Creates a WebRTC transport for the peer in the given direction.
    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SessionResult<TransportInfo> {
        let (router, webrtc_server, media) = {
            let room_lock = self.get_room(room_id)?;
            let room = room_lock.read().await;
            if room.closing {
                return Err(SessionError::RoomClosing(room_id.to_string()));
            }
            let peer = room
                .peer(peer_id)
                .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
            (
                room.router().clone(),
                room.webrtc_server.clone(),
                peer.media(),
            )
        };

        // Engine round-trip outside all room locks
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::new_with_server(webrtc_server))
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("transport creation failed: {e}")))?;

        let info = TransportInfo::new(&transport, direction);
        media.lock().await.insert_transport(transport, direction)?;
        debug!(
            "Created {:?} transport {} for peer {} in room {}",
            direction, info.id, peer_id, room_id
        );
        Ok(info)
    }

    /// Applies the client's DTLS parameters to one of the peer's transports.
    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> SessionResult<()> {
        let media = self.peer_media(room_id, peer_id).await?;
        media.lock().await.connect(transport_id, dtls_parameters).await?;
        debug!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Creates a producer and announces it to the rest of the room.
    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> SessionResult<String> {
        let media = self.peer_media(room_id, peer_id).await?;
        let producer_id = media
            .lock()
            .await
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        // Announce for discovery. The peer may have been removed while the
        // engine call was in flight; its media tree is already closed then.
        let room_lock = self.get_room(room_id)?;
        {
            let mut room = room_lock.write().await;
            match room.peers.get_mut(peer_id) {
                Some(peer) => {
                    peer.producers.insert(producer_id.clone(), kind);
                }
                None => return Err(SessionError::PeerNotFound(peer_id.to_string())),
            }
            room.broadcast_except(
                peer_id,
                &ServerMessage::NewProducer {
                    peer_id: peer_id.to_string(),
                    producer_id: producer_id.clone(),
                    kind,
                },
            );
        }

        self.metrics.inc_producers_created();
        info!(
            "Peer {} producing {:?} ({}) in room {}",
            peer_id, kind, producer_id, room_id
        );
        Ok(producer_id)
    }

    /// Creates a consumer (always paused) for another peer's producer.
    pub async fn consume(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> SessionResult<ConsumerInfo> {
        let (media, source_peer_id) = {
            let room_lock = self.get_room(room_id)?;
            let room = room_lock.read().await;
            if room.closing {
                return Err(SessionError::RoomClosing(room_id.to_string()));
            }
            let peer = room
                .peer(peer_id)
                .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
            let (source, _kind) = room.find_producer(producer_id).ok_or_else(|| {
                SessionError::ResourceNotFound("producer", producer_id.to_string())
            })?;
            (peer.media(), source.id.clone())
        };

        let typed_producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| SessionError::ResourceNotFound("producer", producer_id.to_string()))?;

        let consumer = media
            .lock()
            .await
            .consume(transport_id, typed_producer_id, rtp_capabilities)
            .await?;
        let info = ConsumerInfo::from_consumer(&consumer);

        self.metrics.inc_consumers_created();
        debug!(
            "Peer {} consuming producer {} (from {}) in room {}",
            peer_id, producer_id, source_peer_id, room_id
        );
        Ok(info)
    }

    /// Resumes a paused consumer; media starts flowing after this.
    pub async fn resume_consumer(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_id: &str,
    ) -> SessionResult<()> {
        let media = self.peer_media(room_id, peer_id).await?;
        media.lock().await.resume_consumer(consumer_id).await?;
        debug!("Resumed consumer {} for peer {}", consumer_id, peer_id);
        Ok(())
    }

    /// Fire-and-forget keyframe request: asks the engine for a keyframe on
    /// each of the requesting peer's consumers fed by the producer. Unknown
    /// ids are logged, never errors.
    pub async fn request_keyframe(&self, room_id: &str, peer_id: &str, producer_id: &str) {
        let media = match self.peer_media(room_id, peer_id).await {
            Ok(media) => media,
            Err(e) => {
                debug!("Keyframe request dropped: {}", e);
                return;
            }
        };
        let typed_producer_id: ProducerId = match producer_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("Keyframe request with malformed producer id {}", producer_id);
                return;
            }
        };
        let consumers = media.lock().await.consumers_of(typed_producer_id);
        if consumers.is_empty() {
            debug!(
                "Keyframe request for producer {} with no matching consumers",
                producer_id
            );
            return;
        }
        for consumer in consumers {
            if let Err(e) = consumer.request_key_frame().await {
                warn!("Keyframe request failed for consumer {}: {}", consumer.id(), e);
            }
        }
    }

    /// Closes one producer without the peer leaving; consumers of it are
    /// closed by the engine cascade and the room is notified.
    pub async fn close_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &str,
    ) -> SessionResult<()> {
        let media = self.peer_media(room_id, peer_id).await?;
        media.lock().await.close_producer(producer_id)?;

        let room_lock = self.get_room(room_id)?;
        {
            let mut room = room_lock.write().await;
            if let Some(peer) = room.peers.get_mut(peer_id) {
                peer.producers.remove(producer_id);
            }
            room.broadcast_except(
                peer_id,
                &ServerMessage::ProducerClosed {
                    producer_id: producer_id.to_string(),
                },
            );
        }

        info!(
            "Closed producer {} for peer {} in room {}",
            producer_id, peer_id, room_id
        );
        Ok(())
    }

    /// Tears down every room: peers' media first, then the rooms themselves.
    /// Dropping each room closes its router; the worker pool follows when the
    /// process exits.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_lock) in &all_rooms {
            let peers: Vec<Peer> = {
                let mut room = room_lock.write().await;
                room.closing = true;
                room.peers.drain().map(|(_, peer)| peer).collect()
            };
            for peer in &peers {
                peer.close_media().await;
            }
            info!("Shut down room {} ({} peers)", room_id, peers.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Current room count (brief read lock, no await)
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total peer count across all rooms
    pub async fn total_peer_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            total += room_lock.read().await.peer_count();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::test_fixtures::{
        audio_rtp_parameters, client_dtls_parameters, media_config, video_rtp_parameters,
        viewer_rtp_capabilities, wait_until,
    };
    use crate::media::types::ErrorKind;

    async fn test_registry(port_base: u16) -> Arc<RoomRegistry> {
        let registry = RoomRegistry::new(media_config(port_base), ServerMetrics::new())
            .await
            .unwrap();
        Arc::new(registry)
    }

    fn test_sender() -> mpsc::Sender<Arc<String>> {
        mpsc::channel(64).0
    }

    async fn join(
        registry: &RoomRegistry,
        room: &str,
        peer: &str,
        role: PeerRole,
    ) -> Vec<PeerSummary> {
        registry
            .join_room(room, peer, format!("{peer}-name"), role, test_sender())
            .await
            .unwrap()
    }

    async fn connected_transport(
        registry: &RoomRegistry,
        room: &str,
        peer: &str,
        direction: TransportDirection,
    ) -> TransportInfo {
        let info = registry
            .create_transport(room, peer, direction)
            .await
            .unwrap();
        registry
            .connect_transport(room, peer, &info.id, client_dtls_parameters())
            .await
            .unwrap();
        info
    }

    async fn peer_media_of(
        registry: &RoomRegistry,
        room: &str,
        peer: &str,
    ) -> Arc<TokioMutex<PeerMedia>> {
        registry.peer_media(room, peer).await.unwrap()
    }

    #[tokio::test]
    async fn concurrent_joins_create_exactly_one_room() {
        let registry = test_registry(45110).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let room = registry.get_or_create_room("nursery").await.unwrap();
                registry
                    .join_room(
                        "nursery",
                        &format!("peer-{i}"),
                        format!("peer-{i}"),
                        PeerRole::Viewer,
                        test_sender(),
                    )
                    .await
                    .unwrap();
                room
            }));
        }

        let rooms: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        for room in &rooms[1..] {
            assert!(Arc::ptr_eq(&rooms[0], room));
        }
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.worker_pool().total_router_count(), 1);
        assert_eq!(registry.total_peer_count().await, 8);
    }

    #[tokio::test]
    async fn room_survives_until_last_peer_leaves() {
        let registry = test_registry(45120).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        join(&registry, "nursery", "viewer", PeerRole::Viewer).await;

        registry.remove_peer("nursery", "camera").await;
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.total_peer_count().await, 1);

        registry.remove_peer("nursery", "viewer").await;
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.worker_pool().total_router_count(), 0);
    }

    #[tokio::test]
    async fn remove_peer_is_idempotent() {
        let registry = test_registry(45130).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;

        registry.remove_peer("nursery", "camera").await;
        // Second removal and removal from a vanished room are both no-ops
        registry.remove_peer("nursery", "camera").await;
        registry.remove_peer("no-such-room", "camera").await;
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn closing_transport_closes_everything_it_carries() {
        let registry = test_registry(45140).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        let transport =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        let producer_id = registry
            .produce(
                "nursery",
                "camera",
                &transport.id,
                MediaKind::Audio,
                audio_rtp_parameters(),
            )
            .await
            .unwrap();

        let media = peer_media_of(&registry, "nursery", "camera").await;
        let producer = {
            let mut guard = media.lock().await;
            let producer = guard.producer(&producer_id).unwrap();
            guard.close_transport(&transport.id).unwrap();
            producer
        };

        assert!(wait_until(|| producer.closed()).await);
        assert_eq!(media.lock().await.transport_count(), 0);
    }

    #[tokio::test]
    async fn consumer_is_created_paused_until_resumed() {
        let registry = test_registry(45150).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        join(&registry, "nursery", "viewer", PeerRole::Viewer).await;

        let send =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        let producer_id = registry
            .produce(
                "nursery",
                "camera",
                &send.id,
                MediaKind::Video,
                video_rtp_parameters(),
            )
            .await
            .unwrap();

        let recv =
            connected_transport(&registry, "nursery", "viewer", TransportDirection::Recv).await;
        let info = registry
            .consume(
                "nursery",
                "viewer",
                &recv.id,
                &producer_id,
                viewer_rtp_capabilities(),
            )
            .await
            .unwrap();
        assert!(info.paused);

        let media = peer_media_of(&registry, "nursery", "viewer").await;
        let consumer = media.lock().await.consumer(&info.id).unwrap();
        assert!(consumer.paused());

        registry
            .resume_consumer("nursery", "viewer", &info.id)
            .await
            .unwrap();
        assert!(!consumer.paused());
    }

    #[tokio::test]
    async fn join_discovers_existing_producers() {
        let registry = test_registry(45160).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        let send =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        let producer_id = registry
            .produce(
                "nursery",
                "camera",
                &send.id,
                MediaKind::Audio,
                audio_rtp_parameters(),
            )
            .await
            .unwrap();

        let others = join(&registry, "nursery", "viewer", PeerRole::Viewer).await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, "camera");
        assert_eq!(others[0].role, PeerRole::Camera);
        assert_eq!(others[0].producers.len(), 1);
        assert_eq!(others[0].producers[0].id, producer_id);
        assert_eq!(others[0].producers[0].kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn consuming_unknown_producer_is_not_found() {
        let registry = test_registry(45170).await;
        join(&registry, "nursery", "viewer", PeerRole::Viewer).await;
        let recv =
            connected_transport(&registry, "nursery", "viewer", TransportDirection::Recv).await;

        let bogus = uuid::Uuid::new_v4().to_string();
        let err = registry
            .consume("nursery", "viewer", &recv.id, &bogus, viewer_rtp_capabilities())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // No half-created consumer may linger
        let media = peer_media_of(&registry, "nursery", "viewer").await;
        assert_eq!(media.lock().await.consumer_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_cascades_to_other_peers_consumers() {
        let registry = test_registry(45180).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        join(&registry, "nursery", "viewer", PeerRole::Viewer).await;

        let send =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        let producer_id = registry
            .produce(
                "nursery",
                "camera",
                &send.id,
                MediaKind::Video,
                video_rtp_parameters(),
            )
            .await
            .unwrap();

        let recv =
            connected_transport(&registry, "nursery", "viewer", TransportDirection::Recv).await;
        let info = registry
            .consume(
                "nursery",
                "viewer",
                &recv.id,
                &producer_id,
                viewer_rtp_capabilities(),
            )
            .await
            .unwrap();

        let camera_media = peer_media_of(&registry, "nursery", "camera").await;
        let producer = camera_media.lock().await.producer(&producer_id).unwrap();
        let viewer_media = peer_media_of(&registry, "nursery", "viewer").await;
        let consumer = viewer_media.lock().await.consumer(&info.id).unwrap();

        registry.remove_peer("nursery", "camera").await;

        assert!(wait_until(|| producer.closed()).await);
        assert!(wait_until(|| consumer.closed()).await);
        assert!(camera_media.lock().await.is_closed());
    }

    #[tokio::test]
    async fn producing_before_connect_is_invalid_state() {
        let registry = test_registry(45190).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        let transport = registry
            .create_transport("nursery", "camera", TransportDirection::Send)
            .await
            .unwrap();

        let err = registry
            .produce(
                "nursery",
                "camera",
                &transport.id,
                MediaKind::Audio,
                audio_rtp_parameters(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn producing_on_recv_transport_is_invalid_state() {
        let registry = test_registry(45200).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        let recv =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Recv).await;

        let err = registry
            .produce(
                "nursery",
                "camera",
                &recv.id,
                MediaKind::Audio,
                audio_rtp_parameters(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn rejoining_replaces_previous_session() {
        let registry = test_registry(45210).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        let send =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        registry
            .produce(
                "nursery",
                "camera",
                &send.id,
                MediaKind::Audio,
                audio_rtp_parameters(),
            )
            .await
            .unwrap();
        let old_media = peer_media_of(&registry, "nursery", "camera").await;

        let others = join(&registry, "nursery", "camera", PeerRole::Camera).await;

        assert!(others.is_empty());
        assert_eq!(registry.total_peer_count().await, 1);
        assert!(old_media.lock().await.is_closed());
        // The fresh session has a clean tree
        let new_media = peer_media_of(&registry, "nursery", "camera").await;
        assert_eq!(new_media.lock().await.transport_count(), 0);
    }

    #[tokio::test]
    async fn stale_connection_cannot_remove_replacing_peer() {
        let registry = test_registry(45220).await;
        let old_sender = test_sender();
        registry
            .join_room("nursery", "camera", "cam".into(), PeerRole::Camera, old_sender.clone())
            .await
            .unwrap();
        join(&registry, "nursery", "camera", PeerRole::Camera).await;

        // The replaced connection's disconnect path must not evict the new one
        registry
            .remove_peer_if_attached("nursery", "camera", &old_sender)
            .await;
        assert_eq!(registry.total_peer_count().await, 1);
    }

    #[tokio::test]
    async fn close_producer_removes_discovery_entry() {
        let registry = test_registry(45230).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        let send =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        let producer_id = registry
            .produce(
                "nursery",
                "camera",
                &send.id,
                MediaKind::Audio,
                audio_rtp_parameters(),
            )
            .await
            .unwrap();

        registry
            .close_producer("nursery", "camera", &producer_id)
            .await
            .unwrap();

        let others = join(&registry, "nursery", "viewer", PeerRole::Viewer).await;
        assert!(others[0].producers.is_empty());

        let err = registry
            .close_producer("nursery", "camera", &producer_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn rejoin_announces_closure_of_replaced_producers() {
        let registry = test_registry(45240).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        let send =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        let producer_id = registry
            .produce(
                "nursery",
                "camera",
                &send.id,
                MediaKind::Video,
                video_rtp_parameters(),
            )
            .await
            .unwrap();

        let (viewer_tx, mut viewer_rx) = mpsc::channel::<Arc<String>>(64);
        registry
            .join_room(
                "nursery",
                "viewer",
                "viewer".into(),
                PeerRole::Viewer,
                viewer_tx,
            )
            .await
            .unwrap();

        join(&registry, "nursery", "camera", PeerRole::Camera).await;

        // The viewer must hear that the old session's producer is gone
        let mut saw_producer_closed = false;
        while let Ok(json) = viewer_rx.try_recv() {
            if json.contains("producer-closed") && json.contains(&producer_id) {
                saw_producer_closed = true;
            }
        }
        assert!(saw_producer_closed);
    }

    #[tokio::test]
    async fn requests_against_closing_room_are_rejected() {
        let registry = test_registry(45250).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;

        let room_lock = registry.get_room("nursery").unwrap();
        room_lock.write().await.closing = true;

        let err = registry
            .join_room(
                "nursery",
                "viewer",
                "viewer".into(),
                PeerRole::Viewer,
                test_sender(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoomClosing);

        let err = registry
            .create_transport("nursery", "camera", TransportDirection::Send)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoomClosing);
    }

    #[tokio::test]
    async fn capabilities_are_available_without_a_session() {
        let registry = test_registry(45260).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;

        // Any client that knows the room id can fetch capabilities
        let caps = registry.router_rtp_capabilities("nursery").await.unwrap();
        assert!(!caps.codecs.is_empty());

        let err = registry
            .router_rtp_capabilities("no-such-room")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn resuming_consumer_of_closed_producer_is_not_found() {
        let registry = test_registry(45270).await;
        join(&registry, "nursery", "camera", PeerRole::Camera).await;
        join(&registry, "nursery", "viewer", PeerRole::Viewer).await;

        let send =
            connected_transport(&registry, "nursery", "camera", TransportDirection::Send).await;
        let producer_id = registry
            .produce(
                "nursery",
                "camera",
                &send.id,
                MediaKind::Video,
                video_rtp_parameters(),
            )
            .await
            .unwrap();
        let recv =
            connected_transport(&registry, "nursery", "viewer", TransportDirection::Recv).await;
        let info = registry
            .consume(
                "nursery",
                "viewer",
                &recv.id,
                &producer_id,
                viewer_rtp_capabilities(),
            )
            .await
            .unwrap();

        let media = peer_media_of(&registry, "nursery", "viewer").await;
        let consumer = media.lock().await.consumer(&info.id).unwrap();

        registry
            .close_producer("nursery", "camera", &producer_id)
            .await
            .unwrap();
        assert!(wait_until(|| consumer.closed()).await);

        let err = registry
            .resume_consumer("nursery", "viewer", &info.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        // The stale handle is dropped along the way
        assert_eq!(media.lock().await.consumer_count(), 0);
    }
}
