//! Public request router: the `axum` fallback handler that receives every
//! inbound HTTP request, resolves its subdomain, and forwards it over the
//! matching session's channel.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Request, StatusCode, header::HOST};
use axum::response::{IntoResponse, Response};
use relaymux_shared::protocol::{self, ErrorCode, RequestPayload};
use tracing::warn;

use crate::forwarder::PendingOutcome;
use crate::AppState;

/// Strips the leftmost DNS label off a `Host` header value, ignoring any
/// port suffix. `api.myapp.tunnels.example.com` with base domain
/// `tunnels.example.com` yields `api.myapp`; this relay only allocates
/// single-label subdomains, but reading the full prefix lets a caller
/// report a clearer 404 for stray multi-label hosts.
fn subdomain_from_host(host: &str, base_domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{base_domain}");
    host.strip_suffix(&suffix).map(|s| s.to_string())
}

pub async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let subdomain = match subdomain_from_host(&host, &state.config.domain) {
        Some(s) if !s.is_empty() => s,
        _ => return (StatusCode::NOT_FOUND, "unknown subdomain").into_response(),
    };

    if !state.registry.contains(&subdomain) {
        return (StatusCode::NOT_FOUND, "unknown subdomain").into_response();
    }

    let is_websocket_upgrade = req
        .headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
        && req
            .headers()
            .get(axum::http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("upgrade"))
            .unwrap_or(false);

    let method = req.method().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| parse_query(q));

    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            let name = k.as_str();
            if protocol::is_hop_by_hop(name) {
                return None;
            }
            v.to_str().ok().map(|val| (name.to_string(), val.to_string()))
        })
        .collect();

    let body_bytes = match axum::body::to_bytes(req.into_body(), state.config.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };
    let body = if body_bytes.is_empty() {
        None
    } else {
        Some(protocol::encode_body(&body_bytes))
    };

    let payload = RequestPayload {
        method,
        path,
        query,
        headers,
        body,
        websocket_upgrade: is_websocket_upgrade,
    };

    let outcome = state
        .forwarder
        .forward(&subdomain, payload, state.config.request_timeout())
        .await;

    // A REQUEST sent with websocket-upgrade=true that comes back with a 101
    // is the point where this router would hand off to WebSocket frame
    // multiplexing over the channel, which this relay doesn't implement.
    // Every other status (including a plain non-101 refusal from the
    // origin) is forwarded to the public caller exactly like any other
    // response.
    if is_websocket_upgrade {
        if let PendingOutcome::Response(ref payload) = outcome {
            if payload.status_code == 101 {
                return (
                    StatusCode::NOT_IMPLEMENTED,
                    "websocket frame multiplexing is not implemented",
                )
                    .into_response();
            }
        }
    }

    response_from_outcome(outcome, &path_and_query, &subdomain)
}

fn response_from_outcome(outcome: PendingOutcome, path: &str, subdomain: &str) -> Response {
    match outcome {
        PendingOutcome::Response(payload) => {
            let status = StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::OK);
            let mut builder = Response::builder().status(status);
            if let Some(headers_mut) = builder.headers_mut() {
                for (k, v) in &payload.headers {
                    if protocol::is_hop_by_hop(k) {
                        continue;
                    }
                    if let (Ok(name), Ok(value)) =
                        (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v))
                    {
                        headers_mut.insert(name, value);
                    }
                }
            }
            let body = match payload.body {
                Some(encoded) => match protocol::decode_body(&encoded) {
                    Ok(raw) => Body::from(raw),
                    Err(_) => Body::empty(),
                },
                None => Body::empty(),
            };
            builder
                .body(body)
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response())
        }
        PendingOutcome::Error(code) => {
            warn!(subdomain = %subdomain, path = %path, error = ?code, "request forwarding failed");
            let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, error_message(code)).into_response()
        }
    }
}

fn error_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Timeout => "tunnel client did not respond in time",
        ErrorCode::UpstreamError => "tunnel client is unavailable",
        ErrorCode::InvalidRequest => "invalid request",
        ErrorCode::ServerError => "internal relay error",
        ErrorCode::RateLimited => "rate limited",
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_extraction_strips_base_domain() {
        assert_eq!(
            subdomain_from_host("myapp.relaymux.local", "relaymux.local"),
            Some("myapp".to_string())
        );
        assert_eq!(
            subdomain_from_host("myapp.relaymux.local:8080", "relaymux.local"),
            Some("myapp".to_string())
        );
        assert_eq!(subdomain_from_host("relaymux.local", "relaymux.local"), None);
        assert_eq!(subdomain_from_host("other.com", "relaymux.local"), None);
    }

    #[test]
    fn query_string_parses_pairs() {
        assert_eq!(
            parse_query("a=1&b=2"),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert_eq!(parse_query("flag"), vec![("flag".to_string(), String::new())]);
    }
}
