use http::header::{HeaderMap, HeaderName};

use crate::http1::header_has_token;

pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const MITM_HEADER: &str = "mitm";
pub const MITM_HEADER_ENABLED: &str = "Enabled";

pub fn remove_connection_listed(headers: &mut HeaderMap) {
    let listed = headers
        .get_all("connection")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| {
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            HeaderName::from_bytes(token.as_bytes()).ok()
        })
        .collect::<Vec<_>>();
    for name in listed {
        headers.remove(name);
    }
}

pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

pub fn remove_mitm_marker(headers: &mut HeaderMap) {
    headers.remove(MITM_HEADER);
}

pub fn is_mitm_enabled(headers: &HeaderMap) -> bool {
    headers
        .get(MITM_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == MITM_HEADER_ENABLED)
        .unwrap_or(false)
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_has_token(headers, "connection", "upgrade")
        && header_has_token(headers, "upgrade", "websocket")
}

pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use http::header::HeaderMap;
    use http::HeaderValue;

    use super::{
        copy_headers, is_mitm_enabled, is_websocket_upgrade, remove_connection_listed,
        remove_hop_by_hop, remove_mitm_marker,
    };

    fn headers(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).expect("name"),
                HeaderValue::from_str(value).expect("value"),
            );
        }
        map
    }

    #[test]
    fn connection_listed_headers_are_stripped() {
        let mut map = headers(&[
            ("connection", "X-Session-Token, , keep-alive"),
            ("x-session-token", "abc"),
            ("keep-alive", "timeout=5"),
            ("accept", "*/*"),
        ]);
        remove_connection_listed(&mut map);
        assert!(map.get("x-session-token").is_none());
        assert!(map.get("keep-alive").is_none());
        assert!(map.get("accept").is_some());
    }

    #[test]
    fn hop_by_hop_set_is_stripped() {
        let mut map = headers(&[
            ("proxy-connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("host", "example.com"),
        ]);
        remove_hop_by_hop(&mut map);
        assert!(map.get("proxy-connection").is_none());
        assert!(map.get("transfer-encoding").is_none());
        assert!(map.get("upgrade").is_none());
        assert_eq!(map.get("host").expect("host"), "example.com");
    }

    #[test]
    fn mitm_marker_detection_and_removal() {
        let mut map = headers(&[("mitm", "Enabled")]);
        assert!(is_mitm_enabled(&map));
        remove_mitm_marker(&mut map);
        assert!(!is_mitm_enabled(&map));

        let map = headers(&[("mitm", "enabled")]);
        assert!(!is_mitm_enabled(&map), "marker value is case-sensitive");
    }

    #[test]
    fn websocket_upgrade_requires_both_tokens() {
        let map = headers(&[("connection", "keep-alive, Upgrade"), ("upgrade", "WebSocket")]);
        assert!(is_websocket_upgrade(&map));

        let map = headers(&[("connection", "upgrade")]);
        assert!(!is_websocket_upgrade(&map));

        let map = headers(&[("upgrade", "websocket")]);
        assert!(!is_websocket_upgrade(&map));
    }

    #[test]
    fn copy_headers_keeps_repeated_values() {
        let src = headers(&[("set-cookie", "a=1"), ("set-cookie", "b=2")]);
        let mut dst = HeaderMap::new();
        copy_headers(&mut dst, &src);
        assert_eq!(dst.get_all("set-cookie").iter().count(), 2);
    }
}
