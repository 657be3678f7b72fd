// crates/service-gate-server/src/jwt.rs
// ============================================================================
// Module: Identity Tokens
// Description: Compact JWT claim parsing and HS256 verification.
// Purpose: Read identity claims from user tokens.
// Dependencies: base64, hmac, sha2, serde_json
// ============================================================================

//! ## Overview
//! Two entry points: [`verify_hs256`] checks the signature and `exp` before
//! returning claims, and [`decode_unverified`] only parses the payload. The
//! unverified form is used after an external verifier has already accepted
//! the token.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::Hmac;
use hmac::Mac;
use serde_json::Map;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

/// Claims object of a token.
pub type Claims = Map<String, Value>;

/// Identity token failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JwtError {
    /// Token is not three dot-separated base64url segments.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// Algorithm other than HS256.
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Signature does not verify.
    #[error("invalid token signature")]
    InvalidSignature,
    /// `exp` is in the past.
    #[error("token expired")]
    Expired,
}

/// Verifies an HS256 token and returns its claims.
///
/// # Errors
///
/// Returns [`JwtError`] when the token is malformed, signed with another
/// algorithm, fails verification, or has expired at `now_unix`.
pub fn verify_hs256(token: &str, secret: &[u8], now_unix: i64) -> Result<Claims, JwtError> {
    let (header, payload, signature) = split(token)?;
    let header_json = decode_segment(header)?;
    let alg = header_json.get("alg").and_then(Value::as_str).unwrap_or_default();
    if alg != "HS256" {
        return Err(JwtError::UnsupportedAlgorithm(alg.to_string()));
    }
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|err| JwtError::Malformed(err.to_string()))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|err| JwtError::Malformed(err.to_string()))?;
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature).map_err(|_| JwtError::InvalidSignature)?;
    let claims = decode_segment(payload)?;
    if let Some(exp) = claims.get("exp").and_then(Value::as_i64)
        && exp < now_unix
    {
        return Err(JwtError::Expired);
    }
    Ok(claims)
}

/// Parses claims without checking the signature.
///
/// # Errors
///
/// Returns [`JwtError::Malformed`] when the payload cannot be decoded.
pub fn decode_unverified(token: &str) -> Result<Claims, JwtError> {
    let (_, payload, _) = split(token)?;
    decode_segment(payload)
}

/// Splits a compact token into its three segments.
fn split(token: &str) -> Result<(&str, &str, &str), JwtError> {
    let mut parts = token.trim().splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature)) if !payload.is_empty() => {
            Ok((header, payload, signature))
        }
        _ => Err(JwtError::Malformed("expected three segments".to_string())),
    }
}

/// Decodes one base64url JSON object segment.
fn decode_segment(segment: &str) -> Result<Claims, JwtError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|err| JwtError::Malformed(err.to_string()))?;
    match serde_json::from_slice(&bytes).map_err(|err| JwtError::Malformed(err.to_string()))? {
        Value::Object(claims) => Ok(claims),
        _ => Err(JwtError::Malformed("claims are not an object".to_string())),
    }
}

/// Builds an HS256 token; used by tests and tooling.
#[must_use]
pub fn sign_hs256(claims: &Value, secret: &[u8]) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    let signature = Hmac::<Sha256>::new_from_slice(secret)
        .map(|mut mac| {
            mac.update(header.as_bytes());
            mac.update(b".");
            mac.update(payload.as_bytes());
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        })
        .unwrap_or_default();
    format!("{header}.{payload}.{signature}")
}
