//! Privacy-preserving client fingerprints
//!
//! A fingerprint is the SHA-256 of a handful of request headers and the best-effort
//! client IP. Only the digest is ever stored; the raw header values never leave this
//! module.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Joins the fingerprint inputs. ASCII unit separator is a control character and
/// cannot occur inside a valid header value.
const DELIMITER: &str = "\u{1f}";

/// Resolves the client IP from proxy headers
///
/// Order: first entry of `x-forwarded-for`, then `x-real-ip`, then
/// `cf-connecting-ip`, else `"unknown"`.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| non_empty(header_str(headers, "x-real-ip")))
        .or_else(|| non_empty(header_str(headers, "cf-connecting-ip")))
        .unwrap_or("unknown")
        .to_string()
}

/// Computes the fingerprint of the requesting client as 64 lowercase hex characters
pub fn fingerprint(headers: &HeaderMap) -> String {
    let ip = client_ip(headers);
    fingerprint_parts(
        header_str(headers, "user-agent").unwrap_or_default(),
        header_str(headers, "accept-language").unwrap_or_default(),
        header_str(headers, "accept-encoding").unwrap_or_default(),
        &ip,
    )
}

/// Digest of the already extracted inputs
pub fn fingerprint_parts(
    user_agent: &str,
    accept_language: &str,
    accept_encoding: &str,
    ip: &str,
) -> String {
    let joined = [user_agent, accept_language, accept_encoding, ip].join(DELIMITER);
    hex::encode(Sha256::digest(joined.as_bytes()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
