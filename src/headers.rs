//! Header rewriting policy for both directions of the proxy
//! Deny lists are data; comparisons ride on the header map's lowercase names

use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, REFERER};
use url::Url;

/// Client network metadata the backend must never see
const EDGE_REQUEST_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "cf-ray",
    "cf-visitor",
    "cf-request-id",
];

/// Headers that describe the inbound hop or are recomputed by the outbound client
const TRANSPORT_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "content-length",
    "accept-encoding",
    "expect",
];

/// Response headers that would leak the backend identity or break the client hop
const EXCLUDED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "server",
    "x-powered-by",
    "connection",
    "keep-alive",
];

/// Edge headers on the response side are matched by prefix
const EDGE_RESPONSE_PREFIX: &str = "cf-";

/// Marker header identifying responses that passed through the proxy
pub const PROXY_MARKER_HEADER: &str = "x-proxy-by";
pub const PROXY_MARKER_VALUE: &str = "veilproxy";

/// Origin form of a URL: scheme://host[:port], no trailing slash
pub fn origin_string(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Build the outbound header map: copy everything except the deny lists,
/// then force Referer to the backend origin when configured
pub fn outbound_request_headers(
    inbound: &HeaderMap,
    backend: &Url,
    set_referer: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);

    for (name, value) in inbound.iter() {
        let lower = name.as_str();
        if EDGE_REQUEST_HEADERS.contains(&lower) || TRANSPORT_REQUEST_HEADERS.contains(&lower) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if set_referer {
        if let Ok(value) = HeaderValue::from_str(&origin_string(backend)) {
            headers.insert(REFERER, value);
        }
    }

    headers
}

/// Outbound headers for a WebSocket upgrade: same deny lists, but the
/// upgrade negotiation headers must travel through
pub fn websocket_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound.iter() {
        let lower = name.as_str();
        if EDGE_REQUEST_HEADERS.contains(&lower) {
            continue;
        }
        if TRANSPORT_REQUEST_HEADERS.contains(&lower) && lower != "connection" && lower != "upgrade"
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers
}

/// Rewrite backend response headers for the client hop. `body_rewritten`
/// marks responses whose body was changed, so the copied length is stale.
pub fn rewrite_response_headers(
    upstream: &HeaderMap,
    backend: &Url,
    body_rewritten: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 2);

    for (name, value) in upstream.iter() {
        let lower = name.as_str();
        if EXCLUDED_RESPONSE_HEADERS.contains(&lower) || lower.starts_with(EDGE_RESPONSE_PREFIX) {
            continue;
        }
        if body_rewritten && lower == "content-length" {
            continue;
        }
        if lower == "location" {
            headers.append(name.clone(), rewrite_location(value, backend));
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        HeaderName::from_static(PROXY_MARKER_HEADER),
        HeaderValue::from_static(PROXY_MARKER_VALUE),
    );

    headers
}

/// Relativize a Location that points back at the backend host, so the next
/// request also flows through the proxy. Values that do not resolve, or
/// resolve to another host, pass through unchanged.
fn rewrite_location(value: &HeaderValue, backend: &Url) -> HeaderValue {
    let raw = match value.to_str() {
        Ok(s) => s,
        Err(_) => return value.clone(),
    };

    let resolved = match backend.join(raw) {
        Ok(url) => url,
        Err(_) => return value.clone(),
    };

    if resolved.host_str() != backend.host_str() {
        return value.clone();
    }

    let mut relative = resolved.path().to_string();
    if let Some(query) = resolved.query() {
        relative.push('?');
        relative.push_str(query);
    }

    HeaderValue::from_str(&relative).unwrap_or_else(|_| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Url {
        Url::parse("https://backend.example").unwrap()
    }

    fn location(value: &str) -> Option<String> {
        let rewritten = rewrite_location(&HeaderValue::from_str(value).unwrap(), &backend());
        Some(rewritten.to_str().ok()?.to_string())
    }

    #[test]
    fn test_edge_request_headers_stripped() {
        let mut inbound = HeaderMap::new();
        inbound.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.9"));
        inbound.insert("cf-ray", HeaderValue::from_static("8a1b2c3d"));
        inbound.insert("cf-visitor", HeaderValue::from_static("{\"scheme\":\"https\"}"));
        inbound.insert("cf-request-id", HeaderValue::from_static("04bd"));
        inbound.insert("accept", HeaderValue::from_static("text/html"));

        let out = outbound_request_headers(&inbound, &backend(), false);

        assert!(out.get("cf-connecting-ip").is_none());
        assert!(out.get("cf-ray").is_none());
        assert!(out.get("cf-visitor").is_none());
        assert!(out.get("cf-request-id").is_none());
        assert_eq!(out.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_transport_request_headers_stripped() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", HeaderValue::from_static("public.example"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("accept-encoding", HeaderValue::from_static("gzip, br"));
        inbound.insert("content-length", HeaderValue::from_static("12"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let out = outbound_request_headers(&inbound, &backend(), false);

        assert!(out.get("host").is_none());
        assert!(out.get("connection").is_none());
        assert!(out.get("accept-encoding").is_none());
        assert!(out.get("content-length").is_none());
        assert_eq!(out.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_referer_forced_to_backend_origin() {
        let mut inbound = HeaderMap::new();
        inbound.insert("referer", HeaderValue::from_static("http://public.example/page"));

        let out = outbound_request_headers(&inbound, &backend(), true);
        assert_eq!(out.get("referer").unwrap(), "https://backend.example");
    }

    #[test]
    fn test_referer_left_alone_when_disabled() {
        let mut inbound = HeaderMap::new();
        inbound.insert("referer", HeaderValue::from_static("http://public.example/page"));

        let out = outbound_request_headers(&inbound, &backend(), false);
        assert_eq!(out.get("referer").unwrap(), "http://public.example/page");
    }

    #[test]
    fn test_multi_value_headers_preserved_in_order() {
        let mut inbound = HeaderMap::new();
        inbound.append("x-tag", HeaderValue::from_static("one"));
        inbound.append("x-tag", HeaderValue::from_static("two"));

        let out = outbound_request_headers(&inbound, &backend(), false);
        let values: Vec<_> = out.get_all("x-tag").iter().collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[test]
    fn test_websocket_headers_keep_upgrade_negotiation() {
        let mut inbound = HeaderMap::new();
        inbound.insert("connection", HeaderValue::from_static("Upgrade"));
        inbound.insert("upgrade", HeaderValue::from_static("websocket"));
        inbound.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZQ=="));
        inbound.insert("sec-websocket-version", HeaderValue::from_static("13"));
        inbound.insert("host", HeaderValue::from_static("public.example"));
        inbound.insert("cf-ray", HeaderValue::from_static("8a1b2c3d"));

        let out = websocket_request_headers(&inbound);

        assert_eq!(out.get("connection").unwrap(), "Upgrade");
        assert_eq!(out.get("upgrade").unwrap(), "websocket");
        assert_eq!(out.get("sec-websocket-key").unwrap(), "dGhlIHNhbXBsZQ==");
        assert!(out.get("host").is_none());
        assert!(out.get("cf-ray").is_none());
    }

    #[test]
    fn test_response_deny_list() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-encoding", HeaderValue::from_static("gzip"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("server", HeaderValue::from_static("nginx/1.25"));
        upstream.insert("x-powered-by", HeaderValue::from_static("Express"));
        upstream.insert("content-type", HeaderValue::from_static("text/html"));

        let out = rewrite_response_headers(&upstream, &backend(), false);

        assert!(out.get("content-encoding").is_none());
        assert!(out.get("transfer-encoding").is_none());
        assert!(out.get("server").is_none());
        assert!(out.get("x-powered-by").is_none());
        assert_eq!(out.get("content-type").unwrap(), "text/html");
    }

    #[test]
    fn test_cf_prefixed_response_headers_stripped() {
        let mut upstream = HeaderMap::new();
        upstream.insert("cf-cache-status", HeaderValue::from_static("HIT"));
        upstream.insert("cf-ray", HeaderValue::from_static("8a1b2c3d"));
        upstream.insert("x-cache", HeaderValue::from_static("MISS"));

        let out = rewrite_response_headers(&upstream, &backend(), false);

        assert!(out.get("cf-cache-status").is_none());
        assert!(out.get("cf-ray").is_none());
        assert_eq!(out.get("x-cache").unwrap(), "MISS");
    }

    #[test]
    fn test_cors_and_marker_always_added() {
        let out = rewrite_response_headers(&HeaderMap::new(), &backend(), false);

        assert_eq!(out.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(out.get(PROXY_MARKER_HEADER).unwrap(), PROXY_MARKER_VALUE);
    }

    #[test]
    fn test_backend_cors_header_overridden() {
        let mut upstream = HeaderMap::new();
        upstream.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("https://backend.example"),
        );

        let out = rewrite_response_headers(&upstream, &backend(), false);
        let values: Vec<_> = out.get_all("access-control-allow-origin").iter().collect();
        assert_eq!(values, vec!["*"]);
    }

    #[test]
    fn test_content_length_dropped_when_body_rewritten() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-length", HeaderValue::from_static("1234"));

        let rewritten = rewrite_response_headers(&upstream, &backend(), true);
        assert!(rewritten.get("content-length").is_none());

        let streamed = rewrite_response_headers(&upstream, &backend(), false);
        assert_eq!(streamed.get("content-length").unwrap(), "1234");
    }

    #[test]
    fn test_set_cookie_values_all_preserved() {
        let mut upstream = HeaderMap::new();
        upstream.append("set-cookie", HeaderValue::from_static("a=1; Path=/"));
        upstream.append("set-cookie", HeaderValue::from_static("b=2; Path=/"));

        let out = rewrite_response_headers(&upstream, &backend(), false);
        let values: Vec<_> = out.get_all("set-cookie").iter().collect();
        assert_eq!(values, vec!["a=1; Path=/", "b=2; Path=/"]);
    }

    #[test]
    fn test_location_relativized_for_backend_host() {
        assert_eq!(
            location("https://backend.example/login?next=%2Fhome").unwrap(),
            "/login?next=%2Fhome"
        );
    }

    #[test]
    fn test_location_fragment_dropped() {
        assert_eq!(
            location("https://backend.example/docs?page=2#section").unwrap(),
            "/docs?page=2"
        );
    }

    #[test]
    fn test_location_bare_origin_becomes_root() {
        assert_eq!(location("https://backend.example").unwrap(), "/");
    }

    #[test]
    fn test_location_relative_value_normalized() {
        assert_eq!(location("/next").unwrap(), "/next");
    }

    #[test]
    fn test_location_foreign_host_unchanged() {
        assert_eq!(
            location("https://elsewhere.example/x").unwrap(),
            "https://elsewhere.example/x"
        );
    }

    #[test]
    fn test_location_unparseable_unchanged() {
        assert_eq!(location("http://[").unwrap(), "http://[");
    }
}
