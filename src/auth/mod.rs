//! Request authentication: HMAC signatures, replay protection, source-IP
//! policy and rate limiting.
//!
//! The canonical signing string is byte-exact:
//!
//! ```text
//! METHOD \n PATH_WITH_QUERY \n TIMESTAMP \n NONCE \n SHA256_HEX(body)
//! ```
//!
//! with `PATH_WITH_QUERY` taken from the request line as received, no
//! re-encoding. Signatures are lowercase hex and every comparison is
//! timing-safe.

mod nonce;
mod rate_limit;

pub use nonce::{NonceCache, NONCE_TTL, SWEEP_INTERVAL};
pub use rate_limit::{RateDecision, RateLimiter, RATE_LIMIT, RATE_WINDOW};

use crate::credentials::{is_private_ip, is_public_net, Credentials, TrustProxyMode};
use crate::error::{DenyReason, Error, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use subtle::ConstantTimeEq;

pub const HEADER_CLIENT_ID: &str = "x-client-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGNATURE: &str = "x-signature";
pub const HEADER_HA_INSTANCE_ID: &str = "x-ha-instance-id";

/// Accepted clock skew between platform and bridge, in seconds.
pub const TIMESTAMP_TOLERANCE: i64 = 30;

type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller attached to a request after verification.
#[derive(Debug, Clone)]
pub struct AuthedClient {
    pub client_id: String,
    pub source_ip: IpAddr,
}

/// The pieces of an inbound request that authentication inspects.
pub struct RequestAuth<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub client_id: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub forwarded_for: Option<&'a str>,
    pub peer_addr: IpAddr,
    pub body: &'a [u8],
}

/// Compute the HMAC-SHA256 signature over the canonical string.
pub fn compute_signature(
    secret: &str,
    method: &str,
    path_and_query: &str,
    timestamp: &str,
    nonce: &str,
    body: &[u8],
) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    let message = format!("{method}\n{path_and_query}\n{timestamp}\n{nonce}\n{body_hash}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Timing-safe signature verification.
pub fn verify_signature(
    secret: &str,
    method: &str,
    path_and_query: &str,
    timestamp: &str,
    nonce: &str,
    body: &[u8],
    provided: &str,
) -> bool {
    let expected = compute_signature(secret, method, path_and_query, timestamp, nonce, body);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

fn check_timestamp_at(timestamp: &str, now: i64) -> bool {
    match timestamp.parse::<i64>() {
        Ok(ts) => (now - ts).abs() <= TIMESTAMP_TOLERANCE,
        Err(_) => false,
    }
}

/// Whether the timestamp header falls within the accepted skew.
pub fn check_timestamp(timestamp: &str) -> bool {
    check_timestamp_at(timestamp, chrono::Utc::now().timestamp())
}

/// X-Forwarded-For is trusted in auto mode only when the direct peer is a
/// private address and the allow-list names at least one public network
/// (i.e. the bridge plausibly sits behind a reverse proxy).
fn should_trust_proxy(peer: IpAddr, allowed_cidrs: &[ipnet::IpNet]) -> bool {
    is_private_ip(peer) && allowed_cidrs.iter().any(is_public_net)
}

/// Resolve the request source IP under the configured trust-proxy policy.
pub fn resolve_source_ip(
    peer: IpAddr,
    forwarded_for: Option<&str>,
    mode: TrustProxyMode,
    allowed_cidrs: &[ipnet::IpNet],
) -> IpAddr {
    let trust = match mode {
        TrustProxyMode::Always => true,
        TrustProxyMode::Never => false,
        TrustProxyMode::Auto => should_trust_proxy(peer, allowed_cidrs),
    };

    if trust {
        if let Some(first) = forwarded_for
            .and_then(|raw| raw.split(',').next())
            .map(str::trim)
        {
            if let Ok(ip) = first.parse::<IpAddr>() {
                return ip;
            }
        }
    }

    peer
}

/// Whether the source IP passes the CIDR allow-list. An empty list allows
/// everything.
pub fn ip_allowed(ip: IpAddr, allowed_cidrs: &[ipnet::IpNet]) -> bool {
    allowed_cidrs.is_empty() || allowed_cidrs.iter().any(|net| net.contains(&ip))
}

/// Full inbound verification, in fail-fast order: CIDR filter, header
/// presence, client match, timestamp skew, nonce freshness, signature,
/// rate limit.
pub fn verify_request(
    request: &RequestAuth<'_>,
    credentials: &Credentials,
    nonces: &NonceCache,
    limiter: &RateLimiter,
) -> Result<AuthedClient> {
    let source_ip = resolve_source_ip(
        request.peer_addr,
        request.forwarded_for,
        credentials.trust_proxy,
        &credentials.allowed_cidrs,
    );
    if !ip_allowed(source_ip, &credentials.allowed_cidrs) {
        return Err(Error::AuthDenied(DenyReason::IpNotAllowed));
    }

    let (client_id, timestamp, nonce, signature) = match (
        request.client_id,
        request.timestamp,
        request.nonce,
        request.signature,
    ) {
        (Some(c), Some(t), Some(n), Some(s)) => (c, t, n, s),
        _ => return Err(Error::AuthDenied(DenyReason::MissingHeaders)),
    };

    let client_match: bool = client_id
        .as_bytes()
        .ct_eq(credentials.client_id.as_bytes())
        .into();
    if !client_match {
        return Err(Error::AuthDenied(DenyReason::InvalidClientId));
    }

    if !check_timestamp(timestamp) {
        return Err(Error::AuthDenied(DenyReason::InvalidTimestamp));
    }

    if !nonces.check_and_add(nonce) {
        return Err(Error::AuthDenied(DenyReason::NonceReused));
    }

    if !verify_signature(
        &credentials.client_secret,
        request.method,
        request.path_and_query,
        timestamp,
        nonce,
        request.body,
        signature,
    ) {
        return Err(Error::AuthDenied(DenyReason::InvalidSignature));
    }

    match limiter.check(client_id) {
        RateDecision::Allowed { .. } => Ok(AuthedClient {
            client_id: client_id.to_string(),
            source_ip,
        }),
        RateDecision::Limited { retry_after } => Err(Error::RateLimited {
            retry_after,
            limit: limiter.limit(),
        }),
    }
}

/// Headers for an outbound signed request to the platform webhook.
pub fn sign_outgoing_request(
    secret: &str,
    instance_id: &str,
    path: &str,
    body: &[u8],
) -> Vec<(&'static str, String)> {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let nonce = uuid::Uuid::new_v4().to_string();
    let signature = compute_signature(secret, "POST", path, &timestamp, &nonce, body);

    vec![
        ("X-HA-Instance-Id", instance_id.to_string()),
        ("X-Timestamp", timestamp),
        ("X-Nonce", nonce),
        ("X-Signature", signature),
        ("Content-Type", "application/json".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::parse_cidrs;

    const SECRET: &str = "test-secret";

    fn credentials(cidrs: &str, trust_proxy: TrustProxyMode) -> Credentials {
        Credentials {
            instance_id: "home-1".into(),
            client_id: "ha_test_client".into(),
            client_secret: SECRET.into(),
            allowed_cidrs: parse_cidrs(cidrs),
            webhook_url: String::new(),
            trust_proxy,
            turn: None,
        }
    }

    fn signed_request<'a>(
        method: &'a str,
        path: &'a str,
        timestamp: &'a str,
        nonce: &'a str,
        body: &'a [u8],
        signature: &'a str,
    ) -> RequestAuth<'a> {
        RequestAuth {
            method,
            path_and_query: path,
            client_id: Some("ha_test_client"),
            timestamp: Some(timestamp),
            nonce: Some(nonce),
            signature: Some(signature),
            forwarded_for: None,
            peer_addr: "192.168.1.50".parse().unwrap(),
            body,
        }
    }

    #[test]
    fn signature_matches_reference_shape() {
        let sig = compute_signature(SECRET, "POST", "/api/smartly/control", "1700000000", "n1", b"{}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // deterministic
        let again =
            compute_signature(SECRET, "POST", "/api/smartly/control", "1700000000", "n1", b"{}");
        assert_eq!(sig, again);
    }

    #[test]
    fn any_single_field_mutation_breaks_the_signature() {
        let sig = compute_signature(SECRET, "POST", "/api/x?a=1", "1700000000", "nonce", b"body");
        assert!(verify_signature(SECRET, "POST", "/api/x?a=1", "1700000000", "nonce", b"body", &sig));
        assert!(!verify_signature(SECRET, "GET", "/api/x?a=1", "1700000000", "nonce", b"body", &sig));
        assert!(!verify_signature(SECRET, "POST", "/api/x?a=2", "1700000000", "nonce", b"body", &sig));
        assert!(!verify_signature(SECRET, "POST", "/api/x?a=1", "1700000001", "nonce", b"body", &sig));
        assert!(!verify_signature(SECRET, "POST", "/api/x?a=1", "1700000000", "nonc_", b"body", &sig));
        assert!(!verify_signature(SECRET, "POST", "/api/x?a=1", "1700000000", "nonce", b"bodz", &sig));
        assert!(!verify_signature("other", "POST", "/api/x?a=1", "1700000000", "nonce", b"body", &sig));
    }

    #[test]
    fn empty_body_hashes_the_empty_string() {
        // SHA256("") is the well-known e3b0c442... digest
        let sig_a = compute_signature(SECRET, "GET", "/api/smartly/sync/states", "1", "n", b"");
        let message = format!(
            "GET\n/api/smartly/sync/states\n1\nn\n{}",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(message.as_bytes());
        assert_eq!(sig_a, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn timestamp_window() {
        assert!(check_timestamp_at("1000", 1000));
        assert!(check_timestamp_at("1000", 1030));
        assert!(check_timestamp_at("1030", 1000));
        assert!(!check_timestamp_at("1000", 1031));
        assert!(!check_timestamp_at("1031", 1000));
        assert!(!check_timestamp_at("not-a-number", 1000));
        assert!(!check_timestamp_at("", 1000));
    }

    #[test]
    fn trust_proxy_never_uses_peer() {
        let ip = resolve_source_ip(
            "203.0.113.7".parse().unwrap(),
            Some("8.8.8.8"),
            TrustProxyMode::Never,
            &[],
        );
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn trust_proxy_always_prefers_first_forwarded_hop() {
        let ip = resolve_source_ip(
            "127.0.0.1".parse().unwrap(),
            Some("198.51.100.4, 10.0.0.1"),
            TrustProxyMode::Always,
            &[],
        );
        assert_eq!(ip, "198.51.100.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn trust_proxy_auto_requires_private_peer_and_public_cidr() {
        let public_cidrs = parse_cidrs("198.51.100.0/24");
        let private_cidrs = parse_cidrs("192.168.0.0/16");

        // public peer: X-Forwarded-For is forgeable, use the peer
        let ip = resolve_source_ip(
            "203.0.113.7".parse().unwrap(),
            Some("198.51.100.4"),
            TrustProxyMode::Auto,
            &public_cidrs,
        );
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());

        // private peer + public allow-list: header wins
        let ip = resolve_source_ip(
            "127.0.0.1".parse().unwrap(),
            Some("198.51.100.4"),
            TrustProxyMode::Auto,
            &public_cidrs,
        );
        assert_eq!(ip, "198.51.100.4".parse::<IpAddr>().unwrap());

        // private peer but only private allow-list: no proxy assumed
        let ip = resolve_source_ip(
            "127.0.0.1".parse().unwrap(),
            Some("198.51.100.4"),
            TrustProxyMode::Auto,
            &private_cidrs,
        );
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn cidr_filter_rejects_outsiders() {
        let cidrs = parse_cidrs("192.168.1.0/24");
        assert!(ip_allowed("192.168.1.10".parse().unwrap(), &cidrs));
        assert!(!ip_allowed("192.168.2.10".parse().unwrap(), &cidrs));
        assert!(ip_allowed("192.168.2.10".parse().unwrap(), &[]));
    }

    #[test]
    fn verify_request_happy_path_and_replay() {
        let creds = credentials("", TrustProxyMode::Never);
        let nonces = NonceCache::new();
        let limiter = RateLimiter::new(RATE_LIMIT, RATE_WINDOW);

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let body = br#"{"entity_id":"light.bedroom","action":"turn_on"}"#;
        let sig = compute_signature(SECRET, "POST", "/api/smartly/control", &timestamp, "n-1", body);

        let request = signed_request("POST", "/api/smartly/control", &timestamp, "n-1", body, &sig);
        let authed = verify_request(&request, &creds, &nonces, &limiter).unwrap();
        assert_eq!(authed.client_id, "ha_test_client");

        // identical request replayed: nonce check fires before the signature
        let replay = signed_request("POST", "/api/smartly/control", &timestamp, "n-1", body, &sig);
        match verify_request(&replay, &creds, &nonces, &limiter) {
            Err(Error::AuthDenied(DenyReason::NonceReused)) => {}
            other => panic!("expected nonce_reused, got {other:?}"),
        }
    }

    #[test]
    fn verify_request_fail_fast_order() {
        let creds = credentials("10.0.0.0/8", TrustProxyMode::Never);
        let nonces = NonceCache::new();
        let limiter = RateLimiter::new(RATE_LIMIT, RATE_WINDOW);

        // source IP outside the allow-list fails before header checks
        let request = RequestAuth {
            method: "GET",
            path_and_query: "/api/smartly/sync/states",
            client_id: None,
            timestamp: None,
            nonce: None,
            signature: None,
            forwarded_for: None,
            peer_addr: "203.0.113.9".parse().unwrap(),
            body: b"",
        };
        match verify_request(&request, &creds, &nonces, &limiter) {
            Err(Error::AuthDenied(DenyReason::IpNotAllowed)) => {}
            other => panic!("expected ip_not_allowed, got {other:?}"),
        }

        // allowed IP but missing headers
        let request = RequestAuth {
            peer_addr: "10.1.2.3".parse().unwrap(),
            ..request
        };
        match verify_request(&request, &creds, &nonces, &limiter) {
            Err(Error::AuthDenied(DenyReason::MissingHeaders)) => {}
            other => panic!("expected missing_headers, got {other:?}"),
        }
    }

    #[test]
    fn verify_request_rejects_wrong_client_id() {
        let creds = credentials("", TrustProxyMode::Never);
        let nonces = NonceCache::new();
        let limiter = RateLimiter::new(RATE_LIMIT, RATE_WINDOW);
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let sig = compute_signature(SECRET, "GET", "/x", &timestamp, "n", b"");

        let mut request = signed_request("GET", "/x", &timestamp, "n", b"", &sig);
        request.client_id = Some("someone_else");
        match verify_request(&request, &creds, &nonces, &limiter) {
            Err(Error::AuthDenied(DenyReason::InvalidClientId)) => {}
            other => panic!("expected invalid_client_id, got {other:?}"),
        }
    }

    #[test]
    fn verify_request_rejects_bad_signature_without_consuming_rate() {
        let creds = credentials("", TrustProxyMode::Never);
        let nonces = NonceCache::new();
        let limiter = RateLimiter::new(RATE_LIMIT, RATE_WINDOW);
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let request = signed_request("GET", "/x", &timestamp, "n", b"", "deadbeef");
        match verify_request(&request, &creds, &nonces, &limiter) {
            Err(Error::AuthDenied(DenyReason::InvalidSignature)) => {}
            other => panic!("expected invalid_signature, got {other:?}"),
        }
        assert_eq!(limiter.remaining("ha_test_client"), RATE_LIMIT);
    }

    #[test]
    fn outgoing_headers_round_trip() {
        let headers = sign_outgoing_request(SECRET, "home-1", "/events", b"{\"events\":[]}");
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("X-HA-Instance-Id"), "home-1");
        let ok = verify_signature(
            SECRET,
            "POST",
            "/events",
            &get("X-Timestamp"),
            &get("X-Nonce"),
            b"{\"events\":[]}",
            &get("X-Signature"),
        );
        assert!(ok);
    }
}
