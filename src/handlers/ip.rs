//! Client address extraction for flood control
//!
//! Proxy headers are only honoured when the server is configured to trust
//! them; otherwise a client could pick its own flood-control identity.

use std::net::{IpAddr, SocketAddr};

use log::{debug, warn};
use warp::http::HeaderMap;

// Checked in order; the first valid address wins
const PROXY_HEADERS: [&str; 3] = ["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    // X-Forwarded-For can hold "client, proxy1, proxy2"; the leftmost is the client
    let candidate = value.split(',').next().unwrap_or("").trim();
    match candidate.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(_) => {
            warn!("Invalid IP format in {} header: {}", name, candidate);
            None
        }
    }
}

/// The address used to identify a client
pub fn extract_client_ip(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> Option<IpAddr> {
    if trust_proxy_headers {
        for name in PROXY_HEADERS {
            if let Some(ip) = header_ip(headers, name) {
                debug!("Extracted IP from {}: {}", name, ip);
                return Some(ip);
            }
        }
    }
    remote_addr.map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::http::HeaderValue;

    fn remote() -> Option<SocketAddr> {
        Some("203.0.113.9:5555".parse().unwrap())
    }

    #[test]
    fn test_direct_address_without_trust() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        let ip = extract_client_ip(&headers, remote(), false).unwrap();
        assert_eq!(ip.to_string(), "203.0.113.9");
    }

    #[test]
    fn test_header_priority_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.1, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.2"));
        assert_eq!(
            extract_client_ip(&headers, remote(), true).unwrap().to_string(),
            "192.0.2.2"
        );

        headers.insert("cf-connecting-ip", HeaderValue::from_static("192.0.2.3"));
        assert_eq!(
            extract_client_ip(&headers, remote(), true).unwrap().to_string(),
            "192.0.2.3"
        );
    }

    #[test]
    fn test_forwarded_for_uses_leftmost() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.1, 10.0.0.1"));
        assert_eq!(
            extract_client_ip(&headers, None, true).unwrap().to_string(),
            "192.0.2.1"
        );
    }

    #[test]
    fn test_invalid_header_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(
            extract_client_ip(&headers, remote(), true).unwrap().to_string(),
            "203.0.113.9"
        );
        assert!(extract_client_ip(&HeaderMap::new(), None, false).is_none());
    }
}
