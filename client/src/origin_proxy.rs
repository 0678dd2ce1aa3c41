//! Local origin proxy: re-issues a forwarded request against the local
//! service and turns whatever happens into a RESPONSE payload.
//!
//! Failures here never cross the channel as ERROR envelopes — only the
//! relay originates those (timeout, forced completion, protocol hygiene).
//! A local service refusing the connection, timing out, or returning
//! garbage is still an HTTP outcome from the public caller's point of
//! view, so it always comes back as a RESPONSE with a status code.

use std::time::Duration;

use relaymux_shared::protocol::{self, RequestPayload, ResponsePayload};
use reqwest::{Client, Method};
use tracing::warn;

/// Thin wrapper around a shared `reqwest::Client`, grounded on the
/// reqwest-based reverse-proxy pattern used elsewhere in the retrieval
/// pack (forwarding through one pooled client rather than opening a raw
/// socket per request, the way this system's own relay-side forwarder
/// once did).
pub struct OriginProxy {
    client: Client,
    base_url: String,
}

impl OriginProxy {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Issues `payload` against the configured local origin and always
    /// returns a `ResponsePayload` — transport failures become 502s,
    /// anything else unexpected becomes a 500, never a propagated error.
    pub async fn forward(&self, payload: RequestPayload) -> ResponsePayload {
        let method = match Method::from_bytes(payload.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return text_response(400, format!("invalid method: {}", payload.method));
            }
        };

        let url = match self.build_url(&payload) {
            Ok(u) => u,
            Err(e) => return text_response(500, format!("failed to build origin url: {e}")),
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &payload.headers {
            if protocol::is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }

        if let Some(encoded) = &payload.body {
            match protocol::decode_body(encoded) {
                Ok(raw) => builder = builder.body(raw),
                Err(e) => return text_response(400, format!("invalid base64 body: {e}")),
            }
        }

        match builder.send().await {
            Ok(response) => self.translate(response).await,
            Err(e) => {
                warn!(error = %e, "origin request failed");
                text_response(502, format!("origin unreachable: {e}"))
            }
        }
    }

    fn build_url(&self, payload: &RequestPayload) -> Result<String, std::fmt::Error> {
        use std::fmt::Write;
        let mut url = format!("{}{}", self.base_url, payload.path);
        if let Some(query) = &payload.query {
            if !query.is_empty() {
                write!(url, "?")?;
                for (i, (k, v)) in query.iter().enumerate() {
                    if i > 0 {
                        write!(url, "&")?;
                    }
                    write!(url, "{k}={v}")?;
                }
            }
        }
        Ok(url)
    }

    async fn translate(&self, response: reqwest::Response) -> ResponsePayload {
        let status_code = response.status().as_u16();
        let mut by_name: Vec<(String, Vec<String>)> = Vec::new();
        for (name, value) in response.headers() {
            let name = name.as_str();
            if protocol::is_hop_by_hop(name) {
                continue;
            }
            let value = match value.to_str() {
                Ok(v) => v.to_string(),
                Err(_) => continue,
            };
            match by_name.iter_mut().find(|(n, _)| n == name) {
                Some((_, values)) => values.push(value),
                None => by_name.push((name.to_string(), vec![value])),
            }
        }
        let headers: Vec<(String, String)> = by_name
            .into_iter()
            .map(|(name, values)| (name, protocol::join_multi_value(values.iter().map(|s| s.as_str()))))
            .collect();

        match response.bytes().await {
            Ok(bytes) if bytes.is_empty() => ResponsePayload {
                status_code,
                headers,
                body: None,
            },
            Ok(bytes) => ResponsePayload {
                status_code,
                headers,
                body: Some(protocol::encode_body(&bytes)),
            },
            Err(e) => {
                warn!(error = %e, "failed to read origin response body");
                text_response(502, format!("failed to read origin response: {e}"))
            }
        }
    }
}

fn text_response(status_code: u16, message: String) -> ResponsePayload {
    ResponsePayload {
        status_code,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: Some(protocol::encode_body(message.as_bytes())),
    }
}
