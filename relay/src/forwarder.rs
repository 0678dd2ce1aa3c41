//! Request forwarder: turns an inbound HTTP request into a REQUEST envelope
//! on a session's channel, and resolves the matching RESPONSE/ERROR back to
//! the waiting router.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relaymux_shared::protocol::{Envelope, EnvelopeBody, ErrorCode, RequestPayload, ResponsePayload};
use tokio::sync::oneshot;
use tracing::warn;

use crate::registry::{PendingCompleter, SessionRegistry};

/// What a pending request resolves to: either the client's response, or a
/// server-side error kind to translate into an HTTP status.
pub enum PendingOutcome {
    Response(ResponsePayload),
    Error(ErrorCode),
}

struct PendingEntry {
    subdomain: String,
    reply: oneshot::Sender<PendingOutcome>,
}

/// Owns the pending-request table (correlation id → waiting router call)
/// and the logic to forward a request, complete it, or fail it out from
/// under a session teardown. Built around a oneshot-channel-per-request
/// pattern. Every entry is mirrored into the registry's subdomain→id index
/// via `track`/`untrack`, so a session teardown can fail exactly its own
/// in-flight requests without the forwarder scanning its whole table.
pub struct Forwarder {
    pending: DashMap<String, PendingEntry>,
    registry: Arc<SessionRegistry>,
}

impl Forwarder {
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            registry,
        })
    }

    /// Sends `payload` to the session behind `subdomain` and waits up to
    /// `timeout` for a reply. Every exit path removes the pending entry
    /// before returning, so a request is completed at most once.
    pub async fn forward(
        &self,
        subdomain: &str,
        payload: RequestPayload,
        timeout: Duration,
    ) -> PendingOutcome {
        let session = match self.registry.get(subdomain) {
            Some(s) => s,
            None => return PendingOutcome::Error(ErrorCode::UpstreamError),
        };

        let correlation_id = Envelope::new_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingEntry {
                subdomain: subdomain.to_string(),
                reply: tx,
            },
        );
        self.registry.track(subdomain, &correlation_id);

        let envelope = Envelope::request(correlation_id.clone(), payload);
        if session.outbound.send(envelope).await.is_err() {
            self.remove_pending(&correlation_id);
            return PendingOutcome::Error(ErrorCode::UpstreamError);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Sender dropped without completing: treat like a session
                // teardown that raced the reply (same outcome either way).
                self.remove_pending(&correlation_id);
                PendingOutcome::Error(ErrorCode::UpstreamError)
            }
            Err(_) => {
                self.remove_pending(&correlation_id);
                PendingOutcome::Error(ErrorCode::Timeout)
            }
        }
    }

    /// Removes a pending entry and untracks it from the registry's
    /// subdomain index in one step, whatever path completed it.
    fn remove_pending(&self, correlation_id: &str) -> Option<PendingEntry> {
        let (_, entry) = self.pending.remove(correlation_id)?;
        self.registry.untrack(&entry.subdomain, correlation_id);
        Some(entry)
    }

    /// Completes a pending request with the client's response.
    pub fn complete_response(&self, correlation_id: &str, payload: ResponsePayload) {
        if let Some(entry) = self.remove_pending(correlation_id) {
            let _ = entry.reply.send(PendingOutcome::Response(payload));
        }
    }

    /// Completes a pending request with a server-originated error kind
    /// reported on the channel itself (rare: the client's own envelope
    /// codec rejected something).
    pub fn complete_error(&self, correlation_id: &str, code: ErrorCode) {
        if let Some(entry) = self.remove_pending(correlation_id) {
            let _ = entry.reply.send(PendingOutcome::Error(code));
        }
    }

    /// Routes an inbound RESPONSE or ERROR envelope from a client to its
    /// pending entry. Unknown correlation ids (already timed out, or never
    /// ours) are logged and dropped rather than treated as fatal — the
    /// channel stays open.
    pub fn handle_inbound(&self, envelope: Envelope) {
        match envelope.body {
            EnvelopeBody::Response(payload) => {
                self.complete_response(&envelope.correlation_id, payload);
            }
            EnvelopeBody::Error(payload) => {
                self.complete_error(&envelope.correlation_id, payload.code);
            }
            other => {
                warn!(correlation_id = %envelope.correlation_id, kind = ?std::mem::discriminant(&other), "unexpected envelope routed to forwarder");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forcibly completes every still-pending request with `code`. Used by
    /// the server shutdown sequence: immediate mode calls this right away,
    /// graceful mode calls it only for whatever is left once the drain
    /// deadline passes.
    pub fn fail_all(&self, code: ErrorCode) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for correlation_id in ids {
            if let Some(entry) = self.remove_pending(&correlation_id) {
                let _ = entry.reply.send(PendingOutcome::Error(code));
            }
        }
    }
}

impl PendingCompleter for Forwarder {
    /// Fails exactly the one correlation id the registry names — called
    /// once per id drawn from a torn-down session's own tracked set, so a
    /// single session's disconnect never costs more than its own in-flight
    /// request count.
    fn fail_pending(&self, correlation_id: &str) {
        if let Some((_, entry)) = self.pending.remove(correlation_id) {
            let _ = entry.reply.send(PendingOutcome::Error(ErrorCode::UpstreamError));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry_with_session(subdomain: &str) -> (Arc<SessionRegistry>, mpsc::Receiver<Envelope>) {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        registry.register(subdomain.to_string(), tx);
        (registry, rx)
    }

    fn sample_request() -> RequestPayload {
        RequestPayload {
            method: "GET".into(),
            path: "/".into(),
            query: None,
            headers: vec![],
            body: None,
            websocket_upgrade: false,
        }
    }

    #[tokio::test]
    async fn forward_completes_on_response() {
        let (registry, mut rx) = registry_with_session("alpha");
        let forwarder = Forwarder::new(registry);

        let fwd = forwarder.clone();
        let handle = tokio::spawn(async move {
            fwd.forward("alpha", sample_request(), Duration::from_secs(5)).await
        });

        let sent = rx.recv().await.expect("request envelope sent");
        let correlation_id = sent.correlation_id.clone();
        forwarder.complete_response(
            &correlation_id,
            ResponsePayload {
                status_code: 200,
                headers: vec![],
                body: None,
            },
        );

        match handle.await.unwrap() {
            PendingOutcome::Response(p) => assert_eq!(p.status_code, 200),
            PendingOutcome::Error(_) => panic!("expected response"),
        }
        assert_eq!(forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn forward_times_out_without_reply() {
        let (registry, _rx) = registry_with_session("alpha");
        let forwarder = Forwarder::new(registry);
        let outcome = forwarder
            .forward("alpha", sample_request(), Duration::from_millis(20))
            .await;
        assert!(matches!(outcome, PendingOutcome::Error(ErrorCode::Timeout)));
        assert_eq!(forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn unregister_forces_completion_of_in_flight_requests() {
        let (registry, mut rx) = registry_with_session("alpha");
        let forwarder = Forwarder::new(registry.clone());
        registry.install_completer(forwarder.clone());

        let fwd = forwarder.clone();
        let handle = tokio::spawn(async move {
            fwd.forward("alpha", sample_request(), Duration::from_secs(5)).await
        });

        let _ = rx.recv().await.expect("request envelope sent");
        registry.unregister("alpha");

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, PendingOutcome::Error(ErrorCode::UpstreamError)));
    }

    #[tokio::test]
    async fn unregister_only_fails_its_own_sessions_requests() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.register("alpha".to_string(), tx_a);
        registry.register("beta".to_string(), tx_b);
        let forwarder = Forwarder::new(registry.clone());
        registry.install_completer(forwarder.clone());

        let fwd_a = forwarder.clone();
        let handle_a = tokio::spawn(async move {
            fwd_a.forward("alpha", sample_request(), Duration::from_secs(5)).await
        });
        let fwd_b = forwarder.clone();
        let handle_b = tokio::spawn(async move {
            fwd_b.forward("beta", sample_request(), Duration::from_secs(5)).await
        });

        let _ = rx_a.recv().await.expect("request envelope sent on alpha");
        let sent_b = rx_b.recv().await.expect("request envelope sent on beta");

        registry.unregister("alpha");
        assert!(matches!(
            handle_a.await.unwrap(),
            PendingOutcome::Error(ErrorCode::UpstreamError)
        ));

        // beta's request is untouched by alpha's teardown.
        assert_eq!(forwarder.pending_count(), 1);
        forwarder.complete_response(
            &sent_b.correlation_id,
            ResponsePayload {
                status_code: 200,
                headers: vec![],
                body: None,
            },
        );
        assert!(matches!(handle_b.await.unwrap(), PendingOutcome::Response(p) if p.status_code == 200));
    }

    #[tokio::test]
    async fn unknown_subdomain_fails_immediately() {
        let registry = Arc::new(SessionRegistry::new());
        let forwarder = Forwarder::new(registry);
        let outcome = forwarder
            .forward("ghost", sample_request(), Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, PendingOutcome::Error(ErrorCode::UpstreamError)));
    }
}
