#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::media::types::{ErrorKind, SessionError, SessionResult};
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_ID_LEN: usize = 128;
const MAX_NAME_LEN: usize = 64;

/// Token bucket over integer microseconds; no floats, no drift.
struct TokenBucket {
    tokens_us: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);
        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            true
        } else {
            false
        }
    }
}

/// Room/peer identity established by a successful join
struct Session {
    room_id: String,
    peer_id: String,
}

/// Serialize a ServerMessage and queue it as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

fn send_error(sender: &mpsc::Sender<Arc<String>>, kind: ErrorKind, message: String) {
    let _ = send_json(sender, &ServerMessage::Error { kind, message });
}

fn validate_identifier(value: &str, what: &str) -> SessionResult<()> {
    if value.is_empty() || value.len() > MAX_ID_LEN {
        return Err(SessionError::InvalidState(format!(
            "{what} must be 1-{MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_connection_id = connection_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Send task finished for connection {}", send_connection_id);
    });

    let mut session: Option<Session> = None;
    let mut bucket = TokenBucket::new();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                if bucket.allow(Instant::now()) {
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        send_error(
                            &tx,
                            ErrorKind::ServerBusy,
                            format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                        );
                    }
                    continue;
                }

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", connection_id, e);
                        metrics.inc_errors();
                        send_error(
                            &tx,
                            ErrorKind::InvalidState,
                            format!("Invalid message format: {e}"),
                        );
                        continue;
                    }
                };

                let start = Instant::now();
                let result =
                    handle_client_message(client_msg, &mut session, &tx, &registry).await;
                metrics.observe_message_handling(start.elapsed());

                if let Err(e) = result {
                    debug!("Request failed on connection {}: {}", connection_id, e);
                    metrics.inc_errors();
                    // If channel is closed, send task has exited — break
                    if tx.is_closed() {
                        break;
                    }
                    send_error(&tx, e.kind(), e.to_string());
                }
            }
            Message::Close(_) => {
                info!("Connection {} closed by client", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type on connection {}", connection_id);
            }
        }
    }

    // Peers are removed the moment their connection goes away. A rejoin under
    // the same peer id replaces the session, so the removal is guarded by
    // channel identity to avoid evicting a replacement.
    if let Some(session) = session.take() {
        registry
            .remove_peer_if_attached(&session.room_id, &session.peer_id, &tx)
            .await;
    }

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished: {}", connection_id);
}

fn require_session(session: &Option<Session>) -> SessionResult<&Session> {
    session
        .as_ref()
        .ok_or_else(|| SessionError::InvalidState("not in a room".into()))
}

/// Handle a single client message
async fn handle_client_message(
    message: ClientMessage,
    session: &mut Option<Session>,
    sender: &mpsc::Sender<Arc<String>>,
    registry: &Arc<RoomRegistry>,
) -> SessionResult<()> {
    match message {
        ClientMessage::JoinRoom {
            room_id,
            peer_id,
            display_name,
            role,
        } => {
            validate_identifier(&room_id, "roomId")?;
            validate_identifier(&peer_id, "peerId")?;
            if display_name.is_empty() || display_name.len() > MAX_NAME_LEN {
                return Err(SessionError::InvalidState(format!(
                    "displayName must be 1-{MAX_NAME_LEN} characters"
                )));
            }

            // One session per connection: leave the old room first
            if let Some(old) = session.take() {
                registry
                    .remove_peer_if_attached(&old.room_id, &old.peer_id, sender)
                    .await;
            }

            let peers = registry
                .join_room(&room_id, &peer_id, display_name, role, sender.clone())
                .await?;

            *session = Some(Session {
                room_id,
                peer_id: peer_id.clone(),
            });

            let _ = send_json(sender, &ServerMessage::RoomJoined { peer_id, peers });
        }

        ClientMessage::LeaveRoom => {
            if let Some(old) = session.take() {
                registry
                    .remove_peer_if_attached(&old.room_id, &old.peer_id, sender)
                    .await;
            }
        }

        ClientMessage::GetRouterRtpCapabilities { room_id } => {
            // Needs no session: clients fetch capabilities to load their
            // device before joining
            validate_identifier(&room_id, "roomId")?;
            let rtp_capabilities = registry.router_rtp_capabilities(&room_id).await?;
            let _ = send_json(
                sender,
                &ServerMessage::RouterRtpCapabilities { rtp_capabilities },
            );
        }

        ClientMessage::CreateWebrtcTransport { direction } => {
            let s = require_session(session)?;
            let info = registry
                .create_transport(&s.room_id, &s.peer_id, direction)
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::TransportCreated {
                    transport_id: info.id,
                    direction: info.direction,
                    ice_parameters: info.ice_parameters,
                    ice_candidates: info.ice_candidates,
                    dtls_parameters: info.dtls_parameters,
                },
            );
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            let s = require_session(session)?;
            registry
                .connect_transport(&s.room_id, &s.peer_id, &transport_id, dtls_parameters)
                .await?;
            let _ = send_json(sender, &ServerMessage::TransportConnected { transport_id });
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let s = require_session(session)?;
            let producer_id = registry
                .produce(&s.room_id, &s.peer_id, &transport_id, kind, rtp_parameters)
                .await?;
            let _ = send_json(sender, &ServerMessage::ProducerCreated { producer_id });
        }

        ClientMessage::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let s = require_session(session)?;
            let info = registry
                .consume(
                    &s.room_id,
                    &s.peer_id,
                    &transport_id,
                    &producer_id,
                    rtp_capabilities,
                )
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::ConsumerCreated {
                    consumer_id: info.id,
                    producer_id: info.producer_id,
                    kind: info.kind,
                    rtp_parameters: info.rtp_parameters,
                    paused: info.paused,
                },
            );
        }

        ClientMessage::ResumeConsumer { consumer_id } => {
            let s = require_session(session)?;
            registry
                .resume_consumer(&s.room_id, &s.peer_id, &consumer_id)
                .await?;
            let _ = send_json(sender, &ServerMessage::ConsumerResumed { consumer_id });
        }

        ClientMessage::RequestKeyframe { producer_id } => {
            // Fire-and-forget: no reply, failures are logged server-side
            let s = require_session(session)?;
            registry
                .request_keyframe(&s.room_id, &s.peer_id, &producer_id)
                .await;
        }

        ClientMessage::CloseProducer { producer_id } => {
            let s = require_session(session)?;
            registry
                .close_producer(&s.room_id, &s.peer_id, &producer_id)
                .await?;
        }
    }

    Ok(())
}
