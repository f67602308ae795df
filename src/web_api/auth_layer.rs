//! HMAC authentication middleware.
//!
//! Buffers the request body so the signature covers the exact bytes, runs
//! the full verification chain and re-injects the body for the handler.
//! On success the authenticated client rides along as a request
//! extension.

use crate::audit::log_deny;
use crate::auth::{
    verify_request, RequestAuth, HEADER_CLIENT_ID, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use crate::error::Error;
use crate::state::AppState;
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

/// Request bodies past this size cannot be signed requests we expect.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn require_auth(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer request body");
            return Error::InvalidRequest("missing_required_fields").into_response();
        }
    };

    let verdict = {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| parts.uri.path());

        let auth = RequestAuth {
            method: parts.method.as_str(),
            path_and_query,
            client_id: header_str(&parts.headers, HEADER_CLIENT_ID),
            timestamp: header_str(&parts.headers, HEADER_TIMESTAMP),
            nonce: header_str(&parts.headers, HEADER_NONCE),
            signature: header_str(&parts.headers, HEADER_SIGNATURE),
            forwarded_for: header_str(&parts.headers, "x-forwarded-for"),
            peer_addr: peer.ip(),
            body: &bytes,
        };

        verify_request(
            &auth,
            state.credentials(),
            &state.nonce_cache,
            &state.rate_limiter,
        )
    };

    match verdict {
        Ok(client) => {
            parts.extensions.insert(client);
            let request = Request::from_parts(parts, Body::from(bytes));
            next.run(request).await
        }
        Err(err) => {
            let client_id = header_str(&parts.headers, HEADER_CLIENT_ID).unwrap_or("unknown");
            log_deny(
                client_id,
                "",
                parts.uri.path(),
                err.kind(),
                None,
                Some(peer.ip()),
            );
            err.into_response()
        }
    }
}
