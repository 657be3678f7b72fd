// crates/service-gate-server/src/headers.rs
// ============================================================================
// Module: Header Contract
// Description: Header, cookie, and marker names shared by every surface.
// Purpose: Keep the wire contract in one place.
// Dependencies: axum
// ============================================================================

//! ## Overview
//! Names of the headers the gateway reads and injects, plus the hop-by-hop
//! set that is never relayed through a proxy hop.

use std::net::IpAddr;

use axum::http::HeaderMap;
use axum::http::HeaderName;

/// User identity token.
pub const AUTHORIZATION_TOKEN: &str = "X-Authorization";
/// Trusted user name injected for backends.
pub const BFL_USER: &str = "X-BFL-USER";
/// Cookie carrying the user identity token.
pub const AUTH_TOKEN_COOKIE: &str = "auth_token";
/// Nonce challenge presented to the gateway.
pub const AUTHELIA_NONCE: &str = "Authelia-Nonce";
/// Scoped access token for data routes.
pub const ACCESS_TOKEN: &str = "X-Access-Token";
/// Internal service-auth header carrying the shared nonce.
pub const BACKEND_NONCE: &str = "Terminus-Nonce";
/// Public application key on signed requests.
pub const APP_KEY: &str = "X-App-Key";
/// Minute-bucket signature on signed requests.
pub const AUTH_SIGNATURE: &str = "X-Auth-Signature";
/// Preferred source of the provider binding host.
pub const PROVIDER_PROXY: &str = "X-Provider-Proxy";
/// Fallback source of the provider binding host.
pub const FORWARDED_HOST: &str = "X-Forwarded-Host";
/// Temporary credential promoted to `Authorization` by the gateway.
pub const TEMP_AUTHORIZATION: &str = "Temp-Authorization";
/// Group prefix that marks websocket legacy providers.
pub const WEBSOCKET_GROUP_PREFIX: &str = "websocket.";

/// Client address chain header.
pub const FORWARDED_FOR: &str = "X-Forwarded-For";

/// Connection-scoped headers that a proxy must not forward.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returns true when `name` is connection-scoped.
#[must_use]
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Reads a header as UTF-8, treating empty values as absent.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).filter(|value| !value.is_empty())
}

/// Reads a cookie value from the `Cookie` header.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Prior `X-Forwarded-For` values joined with `peer`.
#[must_use]
pub fn forwarded_for(inbound: &HeaderMap, peer: IpAddr) -> String {
    let prior: Vec<&str> =
        inbound.get_all(FORWARDED_FOR).iter().filter_map(|value| value.to_str().ok()).collect();
    if prior.is_empty() { peer.to_string() } else { format!("{}, {peer}", prior.join(", ")) }
}
