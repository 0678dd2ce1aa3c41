//! Session registry: the single source of truth for which subdomains have
//! a connected tunnel client, and the channel used to reach it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use relaymux_shared::protocol::Envelope;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Narrow handle the registry uses to force-complete a single pending
/// request when the session it belongs to is torn down, without holding a
/// direct `Arc` back to the forwarder. The forwarder owns the pending
/// table; the registry only needs to tell it "this one correlation id is
/// never getting a reply, fail it". Registry and forwarder would otherwise
/// form an ownership cycle (each needs to call the other), so this is
/// wired once at startup via `SessionRegistry::install_completer` after
/// both are constructed.
pub trait PendingCompleter: Send + Sync {
    fn fail_pending(&self, correlation_id: &str);
}

/// An active tunnel client's channel endpoint, as seen by the registry.
#[derive(Clone)]
pub struct TunnelSession {
    pub subdomain: String,
    pub outbound: mpsc::Sender<Envelope>,
    pub connected_at: Instant,
}

/// Maps subdomains to connected tunnel sessions.
///
/// `register`/`unregister` are the only mutation points and both behave as
/// atomic compare-and-set operations: `register` refuses to overwrite an
/// existing entry for a subdomain (subdomain→session stays injective) and
/// `unregister` removes the entry and forces completion of anything still
/// pending against it as a single logical step. No I/O happens while the
/// map is touched — only the `DashMap` shard lock is held.
///
/// Alongside the subdomain→session map, the registry keeps a secondary
/// subdomain→{correlation-id} index via `track`/`untrack`. The forwarder
/// reports every correlation id it opens and closes against a session, so
/// that `unregister` can fail exactly that session's in-flight requests
/// without scanning the whole pending table.
pub struct SessionRegistry {
    sessions: DashMap<String, TunnelSession>,
    tracked: DashMap<String, DashSet<String>>,
    completer: OnceLock<Arc<dyn PendingCompleter>>,
    generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            tracked: DashMap::new(),
            completer: OnceLock::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Records that `correlation_id` is now pending against `subdomain`.
    pub fn track(&self, subdomain: &str, correlation_id: &str) {
        self.tracked
            .entry(subdomain.to_string())
            .or_insert_with(DashSet::new)
            .insert(correlation_id.to_string());
    }

    /// Removes `correlation_id` from `subdomain`'s tracked set, once it has
    /// completed through any path (response, error, or timeout).
    pub fn untrack(&self, subdomain: &str, correlation_id: &str) {
        if let Some(ids) = self.tracked.get(subdomain) {
            ids.remove(correlation_id);
        }
    }

    /// Wires the pending-completion callback. Must be called exactly once,
    /// after the forwarder has been constructed, before any session is
    /// registered.
    pub fn install_completer(&self, completer: Arc<dyn PendingCompleter>) {
        if self.completer.set(completer).is_err() {
            panic!("SessionRegistry::install_completer called more than once");
        }
    }

    /// Attempts to register a new session under `subdomain`. Returns `false`
    /// without modifying anything if the subdomain is already taken — the
    /// caller (the allocator) is expected to retry with a different name.
    pub fn register(&self, subdomain: String, outbound: mpsc::Sender<Envelope>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(subdomain.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(TunnelSession {
                    subdomain: subdomain.clone(),
                    outbound,
                    connected_at: Instant::now(),
                });
                self.generation.fetch_add(1, Ordering::Relaxed);
                info!(subdomain = %subdomain, "session registered");
                true
            }
        }
    }

    /// Removes the session, if present, and forces completion of any request
    /// still pending against it — drawn directly from this session's own
    /// tracked correlation-id set, not a scan of every pending request on
    /// the relay. Idempotent: unregistering a subdomain that isn't present
    /// is a no-op.
    pub fn unregister(&self, subdomain: &str) {
        if self.sessions.remove(subdomain).is_some() {
            info!(subdomain = %subdomain, "session unregistered");
            if let Some((_, ids)) = self.tracked.remove(subdomain) {
                if let Some(completer) = self.completer.get() {
                    for correlation_id in ids.into_iter() {
                        completer.fail_pending(&correlation_id);
                    }
                }
            }
        }
    }

    pub fn get(&self, subdomain: &str) -> Option<TunnelSession> {
        self.sessions.get(subdomain).map(|s| s.clone())
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.sessions.contains_key(subdomain)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every currently registered session, for broadcast-style
    /// operations (shutdown notices) that shouldn't hold the map locked
    /// while they send.
    pub fn list(&self) -> Vec<TunnelSession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Best-effort shutdown notice: drops every session's sender, which the
    /// writer task for each channel observes as a closed queue and turns
    /// into a DISCONNECT control message.
    pub fn clear(&self) {
        let subdomains: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for subdomain in subdomains {
            self.unregister(&subdomain);
        }
        warn!("all sessions cleared during shutdown");
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
