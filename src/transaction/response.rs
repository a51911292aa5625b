//! Response assembly: hop-by-hop stripping, keep-alive disposition,
//! `Via`-based self-loop detection, and websocket upgrade handling.

use uuid::Uuid;

use crate::header::HttpHeader;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Removes headers that are meaningful only between one hop and the next,
/// per RFC 7230 §6.1, plus the nonstandard `Proxy-Connection` the upstream
/// plumbing elsewhere in this crate already special-cases. `Transfer-Encoding` is
/// deliberately excluded — the transform chain manages chunking explicitly
/// rather than having it stripped here.
pub fn strip_hop_by_hop(header: &mut HttpHeader) {
    for name in HOP_BY_HOP {
        header.remove(name);
    }
}

/// Whether this transaction should keep the client connection open once
/// the response completes, following RFC 7230 §6.3: HTTP/1.1 defaults to
/// keep-alive unless `Connection: close` is present (on either side);
/// HTTP/1.0 defaults to close unless `Connection: keep-alive` is present.
pub fn decide_keep_alive(request: &HttpHeader, response: &HttpHeader) -> bool {
    let says_close = |h: &HttpHeader| h.csv_iter("connection", b',', true).any(|v| v.eq_ignore_ascii_case("close"));
    let says_keep_alive = |h: &HttpHeader| {
        h.csv_iter("connection", b',', true).any(|v| v.eq_ignore_ascii_case("keep-alive"))
    };

    if says_close(request) || says_close(response) {
        return false;
    }

    if request.is_http_11_or_later() {
        true
    } else {
        says_keep_alive(request) && says_keep_alive(response)
    }
}

/// Sets the outgoing `Connection` header (and, for non-HTTP/1.1 downstream
/// peers, a `Proxy-Connection` echo, matching the source's compatibility
/// behavior for old HTTP/1.0 clients/proxies) to reflect `keep_alive`.
pub fn apply_keep_alive_header(response: &mut HttpHeader, request_is_11: bool, keep_alive: bool) {
    let value = if keep_alive { "keep-alive" } else { "close" };
    response.set("connection", value);
    if !request_is_11 {
        response.set("proxy-connection", value);
    }
}

/// True if this request is asking to switch to the WebSocket protocol:
/// `Upgrade: websocket` plus `Connection` containing the `upgrade` token
/// (RFC 6455 §4.1).
pub fn is_websocket_upgrade(request: &HttpHeader) -> bool {
    let upgrades_to_ws = request
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrades =
        request.csv_iter("connection", b',', true).any(|v| v.eq_ignore_ascii_case("upgrade"));
    upgrades_to_ws && connection_upgrades
}

/// Detects a request that looped back to this same proxy process: the
/// source checks the proxy's own address/port in `Via`; this crate has no
/// real wire-level `Via` chain to compare addresses against, so it follows
/// the simpler, equally valid check of looking for this process's own
/// per-run UUID token (assigned once at startup, see `TransactionState::id`
/// for the per-*transaction* ID, which is distinct) among the `Via` values
/// already seen on the request.
pub fn detect_self_loop(request: &HttpHeader, this_process_id: &Uuid) -> bool {
    let marker = this_process_id.to_string();
    request.csv_iter("via", b',', true).any(|v| v.contains(&marker))
}

/// The value this proxy appends to outgoing `Via` headers, carrying the
/// per-process marker `detect_self_loop` looks for on the way back in.
pub fn via_value(this_process_id: &Uuid, version: (u8, u8)) -> String {
    format!("{}.{} loomgate-{}", version.0, version.1, this_process_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Method, Scheme, Url};

    fn req(version: (u8, u8)) -> HttpHeader {
        HttpHeader::new_request(Method::parse("GET"), Url::new(Scheme::Http, "h", "/"), version)
    }

    fn resp() -> HttpHeader {
        HttpHeader::new_response(200, "OK", (1, 1))
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        assert!(decide_keep_alive(&req((1, 1)), &resp()));
    }

    #[test]
    fn explicit_close_wins() {
        let mut r = req((1, 1));
        r.set("connection", "close");
        assert!(!decide_keep_alive(&r, &resp()));
    }

    #[test]
    fn http10_requires_explicit_keep_alive_both_sides() {
        let mut r = req((1, 0));
        let mut response = resp();
        assert!(!decide_keep_alive(&r, &response));
        r.set("connection", "keep-alive");
        response.set("connection", "keep-alive");
        assert!(decide_keep_alive(&r, &response));
    }

    #[test]
    fn websocket_upgrade_requires_both_headers() {
        let mut r = req((1, 1));
        r.set("upgrade", "websocket");
        r.set("connection", "Upgrade");
        assert!(is_websocket_upgrade(&r));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut response = resp();
        response.set("connection", "close");
        response.set("trailer", "x");
        response.set("content-type", "text/plain");
        strip_hop_by_hop(&mut response);
        assert!(!response.has("connection"));
        assert!(!response.has("trailer"));
        assert!(response.has("content-type"));
    }

    #[test]
    fn self_loop_detected_via_via_header() {
        let id = Uuid::new_v4();
        let mut r = req((1, 1));
        r.set("via", via_value(&id, (1, 1)));
        assert!(detect_self_loop(&r, &id));
        assert!(!detect_self_loop(&r, &Uuid::new_v4()));
    }
}
