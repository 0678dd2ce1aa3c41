//! Client-side channel endpoint: the WebSocket connection held open to the
//! relay, dispatching inbound REQUEST envelopes to the Local Origin Proxy
//! under a bounded worker pool and sending their RESPONSE back.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use relaymux_shared::protocol::{
    self, ControlAction, ControlPayload, Envelope, EnvelopeBody, ErrorCode,
};
use relaymux_shared::{Error, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tracing::{debug, info, warn};

use crate::origin_proxy::OriginProxy;

/// Runs one tunnel channel end to end: connect, handshake, dispatch loop.
/// Returns once the connection is no longer usable — on a clean server
/// DISCONNECT, a socket error, or the peer closing first — at which point
/// the caller (the reconnection controller) decides what happens next.
/// Every one of those outcomes is treated the same way: backoff and retry,
/// unless reconnection is disabled entirely.
pub async fn run(
    server_url: &str,
    secret_key: Option<&str>,
    requested_subdomain: Option<&str>,
    origin: Arc<OriginProxy>,
    max_concurrent: usize,
) -> Result<()> {
    let url = build_connect_url(server_url, requested_subdomain);
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::Connection(e.to_string()))?;
    if let Some(key) = secret_key {
        request.headers_mut().insert(
            "X-Relay-Secret-Key",
            key.parse().map_err(|_| Error::Connection("invalid secret key header value".into()))?,
        );
    }
    // Not required for a single-hop WebSocket client, but matches the
    // shape of a standard handshake request for proxies that inspect it.
    request
        .headers_mut()
        .insert("Sec-WebSocket-Key", generate_key().parse().unwrap());

    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    let _subdomain = match read.next().await {
        Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
            Ok(env) => match env.body {
                EnvelopeBody::Control(ControlPayload {
                    action: ControlAction::Registered,
                    subdomain: Some(subdomain),
                    public_url,
                    ..
                }) => {
                    info!(
                        subdomain = %subdomain,
                        public_url = public_url.as_deref().unwrap_or(""),
                        "tunnel registered"
                    );
                    subdomain
                }
                _ => return Err(Error::Protocol("expected CONTROL/REGISTERED handshake reply".into())),
            },
            Err(_) => return Err(Error::InvalidMessage),
        },
        Some(Ok(Message::Close(frame))) => {
            use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
            let is_policy_violation = frame
                .as_ref()
                .map(|f| f.code == CloseCode::Policy)
                .unwrap_or(false);
            return if is_policy_violation {
                Err(Error::AuthFailed)
            } else {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                Err(Error::Connection(format!("channel closed during handshake: {reason}")))
            };
        }
        Some(Err(e)) => return Err(Error::Connection(e.to_string())),
        _ => return Err(Error::Connection("channel closed before handshake completed".into())),
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(256);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if dispatch_inbound(&text, &origin, &outbound_tx, &semaphore).is_disconnect() {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {
                        debug!("ignoring unexpected binary/raw frame");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "channel read error");
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
            Some(envelope) = outbound_rx.recv() => {
                if let Ok(text) = protocol::encode(&envelope) {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down tunnel");
                let _ = write.send(Message::Close(None)).await;
                return Err(Error::ShutdownRequested);
            }
        }
    }
}

/// Whether an inbound control message means this end should stop the
/// dispatch loop and let the reconnection controller take over.
enum Dispatched {
    Continue,
    Disconnect,
}

impl Dispatched {
    fn is_disconnect(&self) -> bool {
        matches!(self, Dispatched::Disconnect)
    }
}

/// Handles one inbound text frame: parses it, and for a REQUEST spawns a
/// worker (bounded by `semaphore`) that calls the Local Origin Proxy and
/// posts the RESPONSE back onto `outbound_tx`. Anything else recognized
/// (PING) gets an immediate reply; anything unrecognized gets
/// ERROR/INVALID_REQUEST back without tearing down the channel.
fn dispatch_inbound(
    text: &str,
    origin: &Arc<OriginProxy>,
    outbound_tx: &mpsc::Sender<Envelope>,
    semaphore: &Arc<Semaphore>,
) -> Dispatched {
    let envelope = match protocol::decode(text) {
        Ok(e) => e,
        Err(_) => {
            let reply = Envelope::error("unknown".to_string(), ErrorCode::InvalidRequest, "could not parse envelope");
            let _ = outbound_tx.try_send(reply);
            return Dispatched::Continue;
        }
    };

    match envelope.body {
        EnvelopeBody::Request(payload) => {
            let correlation_id = envelope.correlation_id.clone();
            let origin = origin.clone();
            let outbound_tx = outbound_tx.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let response = origin.forward(payload).await;
                let envelope = Envelope::response(correlation_id, response);
                let _ = outbound_tx.send(envelope).await;
            });
            Dispatched::Continue
        }
        EnvelopeBody::Control(ControlPayload { action: ControlAction::Ping, .. }) => {
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
            Dispatched::Continue
        }
        EnvelopeBody::Control(ControlPayload { action: ControlAction::Disconnect, reason, .. }) => {
            info!(reason = ?reason, "relay requested disconnect");
            Dispatched::Disconnect
        }
        EnvelopeBody::Control(_) => {
            debug!("ignoring control message outside handshake/ping/disconnect");
            Dispatched::Continue
        }
        EnvelopeBody::Response(_) | EnvelopeBody::Error(_) => {
            debug!("ignoring RESPONSE/ERROR envelope; client never originates requests on this channel");
            Dispatched::Continue
        }
    }
}

fn build_connect_url(server_url: &str, requested_subdomain: Option<&str>) -> String {
    match requested_subdomain {
        Some(s) => format!("{server_url}?subdomain={s}"),
        None => server_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> Arc<OriginProxy> {
        Arc::new(OriginProxy::new(
            "http://127.0.0.1:1".into(),
            std::time::Duration::from_millis(50),
        ))
    }

    #[test]
    fn connect_url_appends_requested_subdomain() {
        assert_eq!(
            build_connect_url("wss://relay.example.com/ws", Some("my-app")),
            "wss://relay.example.com/ws?subdomain=my-app"
        );
        assert_eq!(build_connect_url("wss://relay.example.com/ws", None), "wss://relay.example.com/ws");
    }

    #[tokio::test]
    async fn ping_gets_an_immediate_pong() {
        let (tx, mut rx) = mpsc::channel(4);
        let semaphore = Arc::new(Semaphore::new(4));
        let ping = Envelope::control(
            "c-1",
            ControlPayload {
                action: ControlAction::Ping,
                subdomain: None,
                public_url: None,
                reason: None,
            },
        );
        let text = protocol::encode(&ping).unwrap();

        let outcome = dispatch_inbound(&text, &proxy(), &tx, &semaphore);
        assert!(!outcome.is_disconnect());

        let reply = rx.recv().await.unwrap();
        match reply.body {
            EnvelopeBody::Control(p) => assert_eq!(p.action, ControlAction::Pong),
            other => panic!("expected CONTROL/PONG, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_gets_invalid_request_error_without_disconnecting() {
        let (tx, mut rx) = mpsc::channel(4);
        let semaphore = Arc::new(Semaphore::new(4));

        let outcome = dispatch_inbound("not json", &proxy(), &tx, &semaphore);
        assert!(!outcome.is_disconnect());

        let reply = rx.recv().await.unwrap();
        match reply.body {
            EnvelopeBody::Error(p) => assert_eq!(p.code, ErrorCode::InvalidRequest),
            other => panic!("expected ERROR/INVALID_REQUEST, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_control_message_ends_the_dispatch_loop() {
        use relaymux_shared::protocol::DisconnectReason;

        let (tx, _rx) = mpsc::channel(4);
        let semaphore = Arc::new(Semaphore::new(4));
        let disconnect = Envelope::control(
            "c-2",
            ControlPayload {
                action: ControlAction::Disconnect,
                subdomain: None,
                public_url: None,
                reason: Some(DisconnectReason::Shutdown),
            },
        );
        let text = protocol::encode(&disconnect).unwrap();

        let outcome = dispatch_inbound(&text, &proxy(), &tx, &semaphore);
        assert!(outcome.is_disconnect());
    }
}
