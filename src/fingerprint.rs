//! Client fingerprint headers
//!
//! Both the accounts service and the broker's edge authorizer only accept
//! requests that look like they come from the vendor's iOS app. The values
//! below must stay byte-identical to what that app sends.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub const ORIGIN: &str = "app://ios.neasmart.de";

pub const USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_7 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";

const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Headers sent with every HTTPS request to the accounts and installation APIs
pub fn http_headers() -> HeaderMap {
    build(&[
        ("user-agent", USER_AGENT),
        ("accept", "application/json, text/plain, */*"),
        ("accept-language", ACCEPT_LANGUAGE),
        ("origin", ORIGIN),
    ])
}

/// Headers added to the WebSocket upgrade request
///
/// The fetch-metadata triple marks the request as a cross-site WebSocket
/// request; the edge drops upgrades without it before MQTT negotiation.
pub fn websocket_headers() -> HeaderMap {
    build(&[
        ("origin", ORIGIN),
        ("user-agent", USER_AGENT),
        ("pragma", "no-cache"),
        ("cache-control", "no-cache"),
        ("accept", "*/*"),
        ("accept-language", ACCEPT_LANGUAGE),
        ("sec-fetch-site", "cross-site"),
        ("sec-fetch-mode", "websocket"),
        ("sec-fetch-dest", "websocket"),
    ])
}

fn build(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers
}
