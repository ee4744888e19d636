#![forbid(unsafe_code)]

// Per-peer media ownership tree: transports own their producers and consumers

use super::types::{SessionError, SessionResult, TransportDirection, TransportState};
use mediasoup::data_structures::DtlsState;
use mediasoup::prelude::*;
use mediasoup::producer::ProducerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One WebRTC transport plus everything it carries.
pub struct TransportSlot {
    transport: WebRtcTransport,
    direction: TransportDirection,
    state: Arc<AtomicU8>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

impl TransportSlot {
    /// Wraps a fresh transport and wires its engine callbacks.
    /// Handlers are detached so they persist for the transport's lifetime.
    fn new(transport: WebRtcTransport, direction: TransportDirection, peer_id: &str) -> Self {
        let state = Arc::new(AtomicU8::new(TransportState::Created as u8));
        let transport_id = transport.id().to_string();

        transport
            .on_dtls_state_change({
                let state = state.clone();
                let transport_id = transport_id.clone();
                let peer_id = peer_id.to_string();
                move |dtls_state| {
                    if dtls_state == DtlsState::Connected {
                        state.store(TransportState::Connected as u8, Ordering::SeqCst);
                        debug!("Transport {} connected for peer {}", transport_id, peer_id);
                    }
                }
            })
            .detach();

        transport
            .on_ice_state_change({
                let transport_id = transport_id.clone();
                let peer_id = peer_id.to_string();
                move |ice_state| {
                    debug!(
                        "ICE state {:?} on transport {} (peer {})",
                        ice_state, transport_id, peer_id
                    );
                }
            })
            .detach();

        transport
            .on_close({
                let state = state.clone();
                let peer_id = peer_id.to_string();
                Box::new(move || {
                    state.store(TransportState::Closed as u8, Ordering::SeqCst);
                    debug!("Transport {} closed by engine for peer {}", transport_id, peer_id);
                })
            })
            .detach();

        Self {
            transport,
            direction,
            state,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn require_negotiating(&self, transport_id: &str) -> SessionResult<()> {
        match self.state() {
            TransportState::Created => Err(SessionError::InvalidState(format!(
                "transport {transport_id} has not begun DTLS negotiation"
            ))),
            TransportState::Closed => Err(SessionError::InvalidState(format!(
                "transport {transport_id} is closed"
            ))),
            TransportState::Connecting | TransportState::Connected => Ok(()),
        }
    }

    /// Closes this transport and everything it owns. Dropping the last handle
    /// of each engine object closes it server-side; the transport goes last so
    /// the engine sees producers and consumers released under a live parent.
    fn close(mut self) {
        self.state.store(TransportState::Closed as u8, Ordering::SeqCst);
        self.consumers.clear();
        self.producers.clear();
    }
}

/// Media state owned by a single peer.
///
/// Guarded by the owning peer's mutex; engine round-trips here block only this
/// peer. The `closed` flag rejects results of engine calls that complete after
/// the peer was removed, so no orphan transports survive a racing disconnect.
pub struct PeerMedia {
    peer_id: String,
    closed: bool,
    transports: HashMap<String, TransportSlot>,
}

impl PeerMedia {
    pub fn new(peer_id: String) -> Self {
        Self {
            peer_id,
            closed: false,
            transports: HashMap::new(),
        }
    }

    fn live(&self) -> SessionResult<()> {
        if self.closed {
            return Err(SessionError::PeerNotFound(self.peer_id.clone()));
        }
        Ok(())
    }

    fn slot_mut(&mut self, transport_id: &str) -> SessionResult<&mut TransportSlot> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| SessionError::ResourceNotFound("transport", transport_id.to_string()))
    }

    /// Registers a freshly created transport. Fails when the peer was removed
    /// while the engine call was in flight; the caller then drops the
    /// transport, which closes it.
    pub fn insert_transport(
        &mut self,
        transport: WebRtcTransport,
        direction: TransportDirection,
    ) -> SessionResult<String> {
        self.live()?;
        let transport_id = transport.id().to_string();
        let slot = TransportSlot::new(transport, direction, &self.peer_id);
        debug!(
            "Registered {:?} transport {} for peer {}",
            direction, transport_id, self.peer_id
        );
        self.transports.insert(transport_id.clone(), slot);
        Ok(transport_id)
    }

    /// Applies client DTLS parameters, moving the transport into `connecting`.
    /// `connected` is reached asynchronously via the DTLS state callback.
    pub async fn connect(
        &mut self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> SessionResult<()> {
        self.live()?;
        let slot = self.slot_mut(transport_id)?;
        if slot.state() == TransportState::Closed {
            return Err(SessionError::InvalidState(format!(
                "transport {transport_id} is closed"
            )));
        }

        slot.transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))?;

        // The engine may have reported DTLS completion already; never move the
        // state backwards.
        let _ = slot.state.compare_exchange(
            TransportState::Created as u8,
            TransportState::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }

    /// Creates a producer on a send transport that has begun negotiation.
    pub async fn produce(
        &mut self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> SessionResult<String> {
        self.live()?;
        let peer_id = self.peer_id.clone();
        let slot = self.slot_mut(transport_id)?;
        if slot.direction != TransportDirection::Send {
            return Err(SessionError::InvalidState(
                "produce requires a send transport".into(),
            ));
        }
        slot.require_negotiating(transport_id)?;

        let producer = slot
            .transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))?;
        let producer_id = producer.id().to_string();

        producer
            .on_close({
                let peer_id = peer_id.clone();
                let producer_id = producer_id.clone();
                move || {
                    debug!("Producer {} closed for peer {}", producer_id, peer_id);
                }
            })
            .detach();

        debug!(
            "Created {:?} producer {} for peer {}",
            kind, producer_id, peer_id
        );
        slot.producers.insert(producer_id.clone(), producer);
        Ok(producer_id)
    }

    /// Creates a consumer on a recv transport. Consumers always start paused;
    /// the client resumes once its receiving pipeline is wired up.
    pub async fn consume(
        &mut self,
        transport_id: &str,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> SessionResult<Consumer> {
        self.live()?;
        let peer_id = self.peer_id.clone();
        let slot = self.slot_mut(transport_id)?;
        if slot.direction != TransportDirection::Recv {
            return Err(SessionError::InvalidState(
                "consume requires a recv transport".into(),
            ));
        }
        slot.require_negotiating(transport_id)?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;

        let consumer = slot
            .transport
            .consume(options)
            .await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))?;
        let consumer_id = consumer.id().to_string();

        consumer
            .on_producer_close({
                let peer_id = peer_id.clone();
                let consumer_id = consumer_id.clone();
                move || {
                    debug!(
                        "Source producer gone, consumer {} of peer {} closed",
                        consumer_id, peer_id
                    );
                }
            })
            .detach();

        debug!("Created consumer {} for peer {}", consumer_id, peer_id);
        slot.consumers.insert(consumer_id, consumer.clone());
        Ok(consumer)
    }

    pub async fn resume_consumer(&mut self, consumer_id: &str) -> SessionResult<()> {
        self.live()?;
        let consumer = self
            .transports
            .values()
            .find_map(|slot| slot.consumers.get(consumer_id))
            .cloned()
            .ok_or_else(|| SessionError::ResourceNotFound("consumer", consumer_id.to_string()))?;
        // The engine's producer-close cascade may have closed it already;
        // drop the stale handle and report the consumer gone.
        if consumer.closed() {
            for slot in self.transports.values_mut() {
                slot.consumers.remove(consumer_id);
            }
            return Err(SessionError::ResourceNotFound(
                "consumer",
                consumer_id.to_string(),
            ));
        }
        consumer
            .resume()
            .await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))?;
        Ok(())
    }

    /// Closes one producer, wherever it lives. The engine cascades the close
    /// to all consumers fed by it.
    pub fn close_producer(&mut self, producer_id: &str) -> SessionResult<MediaKind> {
        self.live()?;
        for slot in self.transports.values_mut() {
            if let Some(producer) = slot.producers.remove(producer_id) {
                let kind = producer.kind();
                debug!(
                    "Closing producer {} for peer {}",
                    producer_id, self.peer_id
                );
                drop(producer);
                return Ok(kind);
            }
        }
        Err(SessionError::ResourceNotFound(
            "producer",
            producer_id.to_string(),
        ))
    }

    /// Closes a transport and, structurally, every producer and consumer it
    /// carries.
    pub fn close_transport(&mut self, transport_id: &str) -> SessionResult<()> {
        self.live()?;
        let slot = self
            .transports
            .remove(transport_id)
            .ok_or_else(|| SessionError::ResourceNotFound("transport", transport_id.to_string()))?;
        debug!(
            "Closing transport {} for peer {} ({} producers, {} consumers)",
            transport_id,
            self.peer_id,
            slot.producers.len(),
            slot.consumers.len()
        );
        slot.close();
        Ok(())
    }

    /// Tears down the whole tree and rejects all further operations.
    /// Safe to call more than once.
    pub fn close_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let count = self.transports.len();
        for (_, slot) in self.transports.drain() {
            slot.close();
        }
        if count > 0 {
            debug!("Closed {} transports for peer {}", count, self.peer_id);
        } else {
            debug!("Peer {} had no media to close", self.peer_id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// This peer's consumers fed by the given producer.
    pub fn consumers_of(&self, producer_id: ProducerId) -> Vec<Consumer> {
        self.transports
            .values()
            .flat_map(|slot| slot.consumers.values())
            .filter(|consumer| consumer.producer_id() == producer_id && !consumer.closed())
            .cloned()
            .collect()
    }

    pub fn transport_state(&self, transport_id: &str) -> Option<TransportState> {
        self.transports.get(transport_id).map(TransportSlot::state)
    }

    pub fn producer(&self, producer_id: &str) -> Option<Producer> {
        self.transports
            .values()
            .find_map(|slot| slot.producers.get(producer_id))
            .cloned()
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<Consumer> {
        self.transports
            .values()
            .find_map(|slot| slot.consumers.get(consumer_id))
            .cloned()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.transports.values().map(|s| s.consumers.len()).sum()
    }
}

impl Drop for PeerMedia {
    fn drop(&mut self) {
        if !self.closed && !self.transports.is_empty() {
            warn!(
                "PeerMedia for {} dropped with {} open transports",
                self.peer_id,
                self.transports.len()
            );
        }
    }
}
