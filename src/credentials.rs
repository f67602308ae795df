//! Bridge credentials and client-facing configuration.
//!
//! The credential record is created once at install time and owned by the
//! config layer. The secret never appears in logs; regenerating it
//! invalidates the previous one immediately.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ipnet::IpNet;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How the bridge resolves the request source IP behind proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustProxyMode {
    /// Trust X-Forwarded-For only when the direct peer is private and the
    /// CIDR allow-list names a public network.
    #[default]
    Auto,
    /// Always prefer X-Forwarded-For when present.
    Always,
    /// Always use the direct peer address.
    Never,
}

impl TrustProxyMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => TrustProxyMode::Always,
            "never" => TrustProxyMode::Never,
            _ => TrustProxyMode::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustProxyMode::Auto => "auto",
            TrustProxyMode::Always => "always",
            TrustProxyMode::Never => "never",
        }
    }
}

/// Optional TURN relay appended to the fixed STUN set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Credential record for the platform client.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub instance_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub allowed_cidrs: Vec<IpNet>,
    pub webhook_url: String,
    pub trust_proxy: TrustProxyMode,
    pub turn: Option<TurnServer>,
}

impl Credentials {
    /// Replace the secret with a freshly generated one. The old secret
    /// stops verifying on the next request.
    pub fn regenerate_secret(&mut self) {
        self.client_secret = generate_client_secret();
    }
}

/// Generate a prefixed client id (CSPRNG, URL-safe).
pub fn generate_client_id() -> String {
    format!("ha_{}", random_urlsafe(16))
}

/// Generate a client secret of at least 32 random bytes, URL-safe encoded.
pub fn generate_client_secret() -> String {
    random_urlsafe(32)
}

fn random_urlsafe(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(&buf)
}

/// Parse a comma-separated CIDR allow-list. Malformed entries are dropped
/// with a warning so a typo cannot lock the operator out silently.
pub fn parse_cidrs(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                // Bare addresses are accepted as host networks.
                match s.parse::<IpAddr>() {
                    Ok(ip) => Some(IpNet::from(ip)),
                    Err(err) => {
                        tracing::warn!(cidr = s, error = %err, "ignoring malformed CIDR entry");
                        None
                    }
                }
            }
        })
        .collect()
}

/// Whether an address falls in a private, loopback or link-local range.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local, fe80::/10 link-local
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Whether a network covers public address space.
pub fn is_public_net(net: &IpNet) -> bool {
    !is_private_ip(net.addr())
}
