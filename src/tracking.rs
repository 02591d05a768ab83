//! Engagement tracking: pixel injection and link rewriting
//!
//! Outbound HTML gets a 1×1 pixel pointing at `/track/pixel/{token}` and every link
//! to an appointment (`/termine/<id>`) or status report (`#report-<id>`) is routed
//! through `/track/click/{token}`. The original target travels base64url encoded in
//! the `url` query parameter.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::{Captures, Regex};
use url::Url;

use crate::model::LinkType;

/// Smallest transparent GIF (43 bytes)
pub const TRANSPARENT_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(href\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).expect("href pattern is valid")
});

static APPOINTMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/termine/([^/?#\s]+)").expect("appointment pattern is valid"));

static STATUS_REPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#report-([^/?#&\s]+)").expect("report pattern is valid"));

static BODY_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</body\s*>").expect("body pattern is valid"));

/// A link worth tracking, as found in outbound content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedLink {
    pub link_type: LinkType,
    pub link_id: Option<String>,
}

/// Classifies a URL as an appointment or status report link
pub fn classify_link(url: &str) -> Option<TrackedLink> {
    if let Some(caps) = APPOINTMENT_RE.captures(url) {
        return Some(TrackedLink {
            link_type: LinkType::Appointment,
            link_id: caps.get(1).map(|m| m.as_str().to_string()),
        });
    }
    if let Some(caps) = STATUS_REPORT_RE.captures(url) {
        return Some(TrackedLink {
            link_type: LinkType::StatusReport,
            link_id: caps.get(1).map(|m| m.as_str().to_string()),
        });
    }
    None
}

pub fn pixel_url(base_url: &str, token: &str) -> String {
    format!("{base_url}/track/pixel/{token}")
}

/// Redirect URL for one tracked link
pub fn click_url(base_url: &str, token: &str, original: &str, link: &TrackedLink) -> String {
    let mut url = format!(
        "{base_url}/track/click/{token}?url={}&type={}",
        encode_target(original),
        link.link_type.as_str()
    );
    if let Some(id) = &link.link_id {
        url.push_str("&id=");
        url.push_str(&urlencoding::encode(id));
    }
    url
}

pub fn encode_target(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Decodes a base64url click target, accepting padded and unpadded input
pub fn decode_target(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(encoded))
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Resolves a link against the service base URL
///
/// Relative paths and fragments land on the service's own host. Anything that is
/// not http(s) afterwards is rejected.
pub fn resolve_target(url: &str, base_url: &str) -> Option<Url> {
    let resolved = Url::parse(base_url).ok()?.join(url).ok()?;
    matches!(resolved.scheme(), "http" | "https").then_some(resolved)
}

/// Hosts of every trackable link in `html`
pub fn link_hosts(html: &str, base_url: &str) -> BTreeSet<String> {
    HREF_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(2).or_else(|| caps.get(3)))
        .map(|m| m.as_str())
        .filter(|target| classify_link(target).is_some())
        .filter_map(|target| resolve_target(target, base_url))
        .filter_map(|url| url.host_str().map(str::to_string))
        .collect()
}

/// Injects the open pixel and rewrites trackable links
///
/// Content already carrying this token's pixel is returned unchanged, so the
/// function is safe to call once per chunk on the same newsletter body.
pub fn add_tracking_to_newsletter(html: &str, token: &str, base_url: &str) -> String {
    let pixel_src = pixel_url(base_url, token);
    if html.contains(&pixel_src) {
        return html.to_string();
    }

    let click_prefix = format!("{base_url}/track/click/");
    let rewritten = HREF_RE.replace_all(html, |caps: &Captures| {
        let (quote, target) = match (caps.get(2), caps.get(3)) {
            (Some(m), _) => ('"', m.as_str()),
            (None, Some(m)) => ('\'', m.as_str()),
            (None, None) => return caps[0].to_string(),
        };
        if target.starts_with(&click_prefix) {
            return caps[0].to_string();
        }
        match classify_link(target) {
            Some(link) => format!(
                "{}{quote}{}{quote}",
                &caps[1],
                click_url(base_url, token, target, &link)
            ),
            None => caps[0].to_string(),
        }
    });

    let pixel = format!(
        r#"<img src="{pixel_src}" width="1" height="1" alt="" style="display:none;border:0" />"#
    );

    match BODY_CLOSE_RE.find_iter(&rewritten).last() {
        Some(close) => {
            let mut out = String::with_capacity(rewritten.len() + pixel.len());
            out.push_str(&rewritten[..close.start()]);
            out.push_str(&pixel);
            out.push_str(&rewritten[close.start()..]);
            out
        }
        None => format!("{rewritten}{pixel}"),
    }
}
