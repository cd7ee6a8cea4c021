//! Request metadata: client address, device class, idempotency key and callback base URL.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, request::Parts},
};
use std::{convert::Infallible, net::SocketAddr};
use url::Url;

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Best-effort client address for rate limiting and audit logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(client_ip(&parts.headers, peer.as_deref())))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<&str>) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty())
    {
        return first.to_string();
    }
    header_str(headers, "x-real-ip")
        .or(peer)
        .unwrap_or_default()
        .to_string()
}

#[must_use]
pub fn idempotency_key(headers: &HeaderMap) -> String {
    header_str(headers, IDEMPOTENCY_KEY)
        .unwrap_or_default()
        .to_string()
}

/// Device class passed to payment providers, derived from the `User-Agent`.
#[must_use]
pub fn detect_device(user_agent: &str) -> &'static str {
    let ua = user_agent.trim().to_lowercase();
    if ua.is_empty() {
        return "mobile";
    }
    if ua.contains("micromessenger") {
        "wechat"
    } else if ua.contains("alipayclient") {
        "alipay"
    } else if ua.contains("mqqbrowser") || ua.contains(" qq/") {
        "qq"
    } else if ["mobile", "android", "iphone", "ipad"]
        .iter()
        .any(|marker| ua.contains(marker))
    {
        "mobile"
    } else {
        "pc"
    }
}

/// Base URL for provider callbacks.
///
/// `site_url` wins when it is an absolute http(s) URL; otherwise the scheme and host come from
/// the proxy headers or `Host`. Query, fragment and trailing `/` are dropped.
#[must_use]
pub fn callback_base_url(headers: &HeaderMap, site_url: Option<&str>) -> String {
    if let Some(site) = site_url.map(str::trim).filter(|value| !value.is_empty())
        && let Ok(mut parsed) = Url::parse(site)
        && matches!(parsed.scheme(), "http" | "https")
        && parsed.host_str().is_some()
    {
        parsed.set_query(None);
        parsed.set_fragment(None);
        return parsed.as_str().trim_end_matches('/').to_string();
    }
    let scheme = header_str(headers, "x-forwarded-proto")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .unwrap_or("http");
    let host = header_str(headers, "x-forwarded-host")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .or_else(|| header_str(headers, "host"))
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
            ("x-real-ip", "10.0.0.2"),
        ]);
        assert_eq!(client_ip(&map, Some("127.0.0.1")), "203.0.113.9");
        assert_eq!(
            client_ip(&headers(&[("x-real-ip", "10.0.0.2")]), None),
            "10.0.0.2"
        );
        assert_eq!(client_ip(&HeaderMap::new(), Some("::1")), "::1");
    }

    #[test]
    fn device_classes() {
        assert_eq!(detect_device(""), "mobile");
        assert_eq!(detect_device("Mozilla/5.0 MicroMessenger/8.0"), "wechat");
        assert_eq!(detect_device("AlipayClient/10"), "alipay");
        assert_eq!(detect_device("Mozilla/5.0 (iPhone) Mobile"), "mobile");
        assert_eq!(detect_device("Mozilla/5.0 (X11; Linux x86_64)"), "pc");
    }

    #[test]
    fn callback_base_prefers_site_url() {
        let map = headers(&[("host", "internal:8080")]);
        assert_eq!(
            callback_base_url(&map, Some("https://shop.example.com/?a=1#x")),
            "https://shop.example.com"
        );
        assert_eq!(
            callback_base_url(&map, Some("shop.example.com")),
            "http://internal:8080"
        );
        let proxied = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "pay.example.com"),
            ("host", "internal:8080"),
        ]);
        assert_eq!(callback_base_url(&proxied, None), "https://pay.example.com");
    }
}
