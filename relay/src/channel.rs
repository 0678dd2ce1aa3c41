//! Server-side channel endpoint: the WebSocket connection a tunnel client
//! holds open, multiplexing forwarded requests and control traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use relaymux_shared::protocol::{
    self, ControlAction, ControlPayload, DisconnectReason, Envelope, EnvelopeBody, ErrorCode,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::allocator::SubdomainAllocator;
use crate::forwarder::Forwarder;
use crate::registry::SessionRegistry;

const MISSED_PONG_LIMIT: u32 = 2;
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Sends an explicit WebSocket close frame before dropping the connection.
/// Used on handshake failures, which carry a specific closure code (1008
/// policy violation, 1011 internal error) rather than an abrupt disconnect.
async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// A channel endpoint's lifecycle, mirrored here mostly for logging —
/// the state itself lives in which task is still running and whether the
/// subdomain is still present in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Handshaking,
    Open,
    Closing,
}

/// Drives one client's WebSocket connection end to end: handshake, register
/// with the registry, split into a reader task and a writer task (per the
/// two-task-per-channel scheduling model), and run both until either side
/// closes or the heartbeat gives up on the peer.
pub async fn run(
    mut socket: WebSocket,
    secret_keys: Option<std::collections::HashSet<String>>,
    presented_secret: Option<String>,
    requested_subdomain: Option<String>,
    domain: String,
    registry: Arc<SessionRegistry>,
    forwarder: Arc<Forwarder>,
    allocator: Arc<SubdomainAllocator>,
    heartbeat_interval: Duration,
) {
    let mut state = ChannelState::Handshaking;

    if let Some(allowed) = &secret_keys {
        match &presented_secret {
            Some(key) if allowed.contains(key) => {}
            _ => {
                warn!("channel rejected: secret key mismatch");
                close_with(&mut socket, close_code::POLICY, "invalid secret key").await;
                return;
            }
        }
    }

    let subdomain = match allocator.allocate_preferring(&registry, requested_subdomain.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "channel rejected: subdomain allocation failed");
            close_with(&mut socket, close_code::ERROR, "subdomain allocation failed").await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_DEPTH);
    if !registry.register(subdomain.clone(), outbound_tx.clone()) {
        warn!(subdomain = %subdomain, "channel rejected: allocator raced and lost");
        close_with(&mut socket, close_code::ERROR, "subdomain allocation failed").await;
        return;
    }
    state = ChannelState::Open;
    debug!(subdomain = %subdomain, state = ?state, "channel handshake complete");

    let public_url = format!("https://{subdomain}.{domain}");
    let registered = Envelope::control(
        Envelope::new_correlation_id(),
        ControlPayload {
            action: ControlAction::Registered,
            subdomain: Some(subdomain.clone()),
            public_url: Some(public_url.clone()),
            reason: None,
        },
    );

    let (mut sender, mut receiver) = socket.split();
    let hello = match protocol::encode(&registered) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode REGISTERED control message");
            registry.unregister(&subdomain);
            return;
        }
    };
    if sender.send(Message::Text(hello.into())).await.is_err() {
        registry.unregister(&subdomain);
        return;
    }
    info!(subdomain = %subdomain, url = %public_url, "channel open");

    let missed_pongs = Arc::new(AtomicU32::new(0));
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&text, &forwarder, &outbound_tx, &missed_pongs).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs.store(0, Ordering::SeqCst);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        debug!(subdomain = %subdomain, "ignoring unexpected binary frame");
                    }
                    Some(Err(e)) => {
                        warn!(subdomain = %subdomain, error = %e, "channel read error");
                        break;
                    }
                }
            }
            Some(envelope) = outbound_rx.recv() => {
                match protocol::encode(&envelope) {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(subdomain = %subdomain, error = %e, "failed to encode outbound envelope"),
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs.fetch_add(1, Ordering::SeqCst) + 1 >= MISSED_PONG_LIMIT {
                    warn!(subdomain = %subdomain, "channel missed {} heartbeats, closing", MISSED_PONG_LIMIT);
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state = ChannelState::Closing;
    debug!(subdomain = %subdomain, state = ?state, "channel closing");
    registry.unregister(&subdomain);
    let _ = sender
        .send(Message::Close(None))
        .await;
    info!(subdomain = %subdomain, "channel closed");
}

async fn handle_inbound_text(
    text: &str,
    forwarder: &Arc<Forwarder>,
    outbound_tx: &mpsc::Sender<Envelope>,
    missed_pongs: &Arc<AtomicU32>,
) {
    let envelope = match protocol::decode(text) {
        Ok(e) => e,
        Err(_) => {
            // malformed/unknown envelopes get a targeted ERROR reply and
            // are otherwise ignored, never treated as a reason to close.
            let reply = Envelope::error(
                "unknown".to_string(),
                ErrorCode::InvalidRequest,
                "could not parse envelope",
            );
            let _ = outbound_tx.try_send(reply);
            return;
        }
    };

    match &envelope.body {
        EnvelopeBody::Response(_) | EnvelopeBody::Error(_) => {
            forwarder.handle_inbound(envelope);
        }
        EnvelopeBody::Control(payload) if payload.action == ControlAction::Ping => {
            let pong = Envelope::control(
                envelope.correlation_id.clone(),
                ControlPayload {
                    action: ControlAction::Pong,
                    subdomain: None,
                    public_url: None,
                    reason: None,
                },
            );
            let _ = outbound_tx.try_send(pong);
        }
        EnvelopeBody::Control(payload) if payload.action == ControlAction::Pong => {
            missed_pongs.store(0, Ordering::SeqCst);
        }
        // Everything else a client could send here — HEARTBEAT, UNREGISTER,
        // DISCONNECT, a stray REGISTER/REGISTERED, or a REQUEST (the relay
        // never originates requests inbound) — is rejected per the channel
        // dispatch rule rather than silently accepted.
        _ => {
            debug!(correlation_id = %envelope.correlation_id, "rejecting envelope outside the dispatch table");
            let reply = Envelope::error(
                envelope.correlation_id.clone(),
                ErrorCode::InvalidRequest,
                "unexpected envelope type or control action",
            );
            let _ = outbound_tx.try_send(reply);
        }
    }
}

/// Builds the control message the writer side sends just before closing a
/// session it is tearing down on its own initiative (shutdown), as opposed
/// to the peer closing first.
pub fn shutdown_notice() -> Envelope {
    Envelope::control(
        Envelope::new_correlation_id(),
        ControlPayload {
            action: ControlAction::Disconnect,
            subdomain: None,
            public_url: None,
            reason: Some(DisconnectReason::Shutdown),
        },
    )
}
