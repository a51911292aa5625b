//! HTTP header/request/response data model.
//!
//! This is the logical model the transaction state machine and its
//! collaborators operate on. Wire parsing (HTTP/1, /2, /3, WebSocket
//! frames) is out of scope — [`HttpHeader`] is built from and rendered back
//! to `pingora_http::{RequestHeader, ResponseHeader}` at the proxy boundary
//! (`service/http.rs`), treating actual wire parsing as an external
//! service.

pub mod csv_iter;
pub mod url;

pub use csv_iter::CsvIter;
pub use url::{Scheme, Url};

use std::collections::HashMap;

/// Well-known HTTP methods, each assigned a stable small index so that
/// [`crate::ip_allow`]'s method mask (`1 << idx`) stays cheap to compute
/// and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WksMethod {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Post,
    Purge,
    Put,
    Trace,
    Push,
}

pub const WKS_METHOD_COUNT: usize = 10;
pub const ALL_METHOD_MASK: u32 = (1 << WKS_METHOD_COUNT) - 1;

impl WksMethod {
    pub const ALL: [WksMethod; WKS_METHOD_COUNT] = [
        WksMethod::Connect,
        WksMethod::Delete,
        WksMethod::Get,
        WksMethod::Head,
        WksMethod::Options,
        WksMethod::Post,
        WksMethod::Purge,
        WksMethod::Put,
        WksMethod::Trace,
        WksMethod::Push,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn mask(self) -> u32 {
        1 << self.index()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WksMethod::Connect => "CONNECT",
            WksMethod::Delete => "DELETE",
            WksMethod::Get => "GET",
            WksMethod::Head => "HEAD",
            WksMethod::Options => "OPTIONS",
            WksMethod::Post => "POST",
            WksMethod::Purge => "PURGE",
            WksMethod::Put => "PUT",
            WksMethod::Trace => "TRACE",
            WksMethod::Push => "PUSH",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str().eq_ignore_ascii_case(s))
    }
}

/// A request method: a well-known verb (fast path, mask-addressable) or an
/// arbitrary nonstandard token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Wks(WksMethod),
    Nonstandard(String),
}

impl Method {
    pub fn parse(s: &str) -> Self {
        match WksMethod::from_str(s) {
            Some(wks) => Method::Wks(wks),
            None => Method::Nonstandard(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Wks(m) => m.as_str(),
            Method::Nonstandard(s) => s.as_str(),
        }
    }

    pub fn wks(&self) -> Option<WksMethod> {
        match self {
            Method::Wks(m) => Some(*m),
            Method::Nonstandard(_) => None,
        }
    }

    /// "Safe" per RFC 7231 §4.2.1 — used by `ConnectionPlanner` to decide
    /// whether a failed hop is retryable.
    pub fn is_safe(&self) -> bool {
        matches!(
            self.wks(),
            Some(WksMethod::Get | WksMethod::Head | WksMethod::Options | WksMethod::Trace)
        )
    }
}

/// Bitmask of frequently-inspected fields, cached on every mutation so
/// hot-path checks (does this request carry a Range header?) never scan
/// the multimap.
pub mod presence {
    pub const HOST: u32 = 1 << 0;
    pub const CONTENT_LENGTH: u32 = 1 << 1;
    pub const TRANSFER_ENCODING: u32 = 1 << 2;
    pub const IF_MODIFIED_SINCE: u32 = 1 << 3;
    pub const IF_NONE_MATCH: u32 = 1 << 4;
    pub const RANGE: u32 = 1 << 5;
    pub const AUTHORIZATION: u32 = 1 << 6;
    pub const MAX_FORWARDS: u32 = 1 << 7;
    pub const CACHE_CONTROL: u32 = 1 << 8;
    pub const EXPIRES: u32 = 1 << 9;
    pub const DATE: u32 = 1 << 10;
    pub const LAST_MODIFIED: u32 = 1 << 11;
    pub const VIA: u32 = 1 << 12;
    pub const UPGRADE: u32 = 1 << 13;
    pub const CONNECTION: u32 = 1 << 14;
    pub const PROXY_CONNECTION: u32 = 1 << 15;
    pub const TE: u32 = 1 << 16;
    pub const AGE: u32 = 1 << 17;
    pub const ETAG: u32 = 1 << 18;
    pub const WARNING: u32 = 1 << 19;

    pub fn for_name(name: &str) -> Option<u32> {
        Some(match_name(name)?)
    }

    fn match_name(name: &str) -> Option<u32> {
        Some(match () {
            _ if name.eq_ignore_ascii_case("host") => HOST,
            _ if name.eq_ignore_ascii_case("content-length") => CONTENT_LENGTH,
            _ if name.eq_ignore_ascii_case("transfer-encoding") => TRANSFER_ENCODING,
            _ if name.eq_ignore_ascii_case("if-modified-since") => IF_MODIFIED_SINCE,
            _ if name.eq_ignore_ascii_case("if-none-match") => IF_NONE_MATCH,
            _ if name.eq_ignore_ascii_case("range") => RANGE,
            _ if name.eq_ignore_ascii_case("authorization") => AUTHORIZATION,
            _ if name.eq_ignore_ascii_case("max-forwards") => MAX_FORWARDS,
            _ if name.eq_ignore_ascii_case("cache-control") => CACHE_CONTROL,
            _ if name.eq_ignore_ascii_case("expires") => EXPIRES,
            _ if name.eq_ignore_ascii_case("date") => DATE,
            _ if name.eq_ignore_ascii_case("last-modified") => LAST_MODIFIED,
            _ if name.eq_ignore_ascii_case("via") => VIA,
            _ if name.eq_ignore_ascii_case("upgrade") => UPGRADE,
            _ if name.eq_ignore_ascii_case("connection") => CONNECTION,
            _ if name.eq_ignore_ascii_case("proxy-connection") => PROXY_CONNECTION,
            _ if name.eq_ignore_ascii_case("te") => TE,
            _ if name.eq_ignore_ascii_case("age") => AGE,
            _ if name.eq_ignore_ascii_case("etag") => ETAG,
            _ if name.eq_ignore_ascii_case("warning") => WARNING,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpKind {
    Request { method: Method, url: Url },
    Response { status: u16, reason: String },
}

/// The logical header model: request or response, version, the ordered
/// field multimap, and the presence bitmask.
#[derive(Debug, Clone)]
pub struct HttpHeader {
    pub kind: HttpKind,
    pub version: (u8, u8),
    /// Ordered `(name, value)` pairs, in wire order. Duplicate names are
    /// kept as separate entries so they can be addressed either as one
    /// multi-valued field (via [`HttpHeader::duplicates`]) or as
    /// independent singletons (via index into this vector, exposed
    /// through [`HttpHeader::fields`]).
    fields: Vec<(String, String)>,
    presence: u32,
}

impl HttpHeader {
    pub fn new_request(method: Method, url: Url, version: (u8, u8)) -> Self {
        Self {
            kind: HttpKind::Request { method, url },
            version,
            fields: Vec::new(),
            presence: 0,
        }
    }

    pub fn new_response(status: u16, reason: impl Into<String>, version: (u8, u8)) -> Self {
        Self {
            kind: HttpKind::Response { status, reason: reason.into() },
            version,
            fields: Vec::new(),
            presence: 0,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, HttpKind::Request { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.kind {
            HttpKind::Request { method, .. } => Some(method),
            HttpKind::Response { .. } => None,
        }
    }

    pub fn url(&self) -> Option<&Url> {
        match &self.kind {
            HttpKind::Request { url, .. } => Some(url),
            HttpKind::Response { .. } => None,
        }
    }

    pub fn url_mut(&mut self) -> Option<&mut Url> {
        match &mut self.kind {
            HttpKind::Request { url, .. } => Some(url),
            HttpKind::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.kind {
            HttpKind::Response { status, .. } => Some(*status),
            HttpKind::Request { .. } => None,
        }
    }

    pub fn set_status(&mut self, status: u16, reason: impl Into<String>) {
        if let HttpKind::Response { status: s, reason: r } = &mut self.kind {
            *s = status;
            *r = reason.into();
        }
    }

    pub fn is_http_09(&self) -> bool {
        self.version == (0, 9)
    }

    pub fn is_http_11_or_later(&self) -> bool {
        self.version >= (1, 1)
    }

    /// Appends a field, preserving duplicates and updating presence.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(bit) = presence::for_name(&name) {
            self.presence |= bit;
        }
        self.fields.push((name, value.into()));
    }

    /// Replaces all occurrences of `name` with a single new value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.append(name, value);
    }

    /// Removes every occurrence of `name`, clearing its presence bit if no
    /// occurrence remains (it never does, since we remove all of them).
    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        if let Some(bit) = presence::for_name(name) {
            self.presence &= !bit;
        }
    }

    pub fn has(&self, name: &str) -> bool {
        match presence::for_name(name) {
            Some(bit) => self.presence & bit != 0,
            None => self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)),
        }
    }

    /// First value for `name`, or `None` if absent. Present-but-empty
    /// fields (`Vary:`) return `Some("")`, preserving presence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All duplicate values for `name`, in header order.
    pub fn duplicates<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All `(name, value)` pairs, in wire order — including duplicates as
    /// independent singletons.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn presence_mask(&self) -> u32 {
        self.presence
    }

    /// Build a [`CsvIter`] over `name`'s sub-values. `separator` is
    /// usually `,`; pass `;` for Cookie/Set-Cookie. When `follow_dups` is
    /// set and the field's own value runs out without any data, scanning
    /// continues into the next duplicate field of the same name.
    pub fn csv_iter<'a>(&'a self, name: &str, separator: u8, follow_dups: bool) -> CsvIter<'a> {
        CsvIter::new(self.duplicates(name), separator, follow_dups)
    }

    /// Integer value of a field's Nth (first, here) sub-value, RFC 7234
    /// style (`Age:`, `max-age=` components handled by callers that split
    /// on `=` first).
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.trim().parse().ok()
    }

    /// Parses a `Cache-Control`-shaped field into its directive map
    /// (`name` -> optional argument), used by freshness evaluation and
    /// the cache plugin. Directives without a value map to `""`.
    pub fn directive_map(&self, name: &str) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for sub in self.csv_iter(name, b',', true) {
            let sub = sub.trim();
            if sub.is_empty() {
                continue;
            }
            match sub.split_once('=') {
                Some((k, v)) => {
                    out.insert(k.trim().to_ascii_lowercase(), v.trim().trim_matches('"').to_string())
                }
                None => out.insert(sub.to_ascii_lowercase(), String::new()),
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_tracks_insert_and_remove() {
        let mut h = HttpHeader::new_request(
            Method::Wks(WksMethod::Get),
            Url::new(Scheme::Http, "ex.test", "/a"),
            (1, 1),
        );
        assert!(!h.has("host"));
        h.append("Host", "ex.test");
        assert!(h.has("host"));
        assert_eq!(h.presence_mask() & presence::HOST, presence::HOST);
        h.remove("Host");
        assert!(!h.has("host"));
    }

    #[test]
    fn duplicate_fields_addressable_both_ways() {
        let mut h = HttpHeader::new_response(200, "OK", (1, 1));
        h.append("Set-Cookie", "a=1");
        h.append("Set-Cookie", "b=2");
        let dups: Vec<&str> = h.duplicates("set-cookie").collect();
        assert_eq!(dups, vec!["a=1", "b=2"]);
        assert_eq!(h.fields().iter().filter(|(n, _)| n == "Set-Cookie").count(), 2);
    }

    #[test]
    fn empty_value_field_preserves_presence() {
        let mut h = HttpHeader::new_response(200, "OK", (1, 1));
        h.append("Vary", "");
        assert!(h.has("vary"));
        assert_eq!(h.get("vary"), Some(""));
    }

    #[test]
    fn directive_map_parses_cache_control() {
        let mut h = HttpHeader::new_response(200, "OK", (1, 1));
        h.append("Cache-Control", "max-age=60, must-revalidate");
        let dirs = h.directive_map("cache-control");
        assert_eq!(dirs.get("max-age").map(String::as_str), Some("60"));
        assert!(dirs.contains_key("must-revalidate"));
    }

    #[test]
    fn safe_methods_per_rfc7231() {
        assert!(Method::Wks(WksMethod::Get).is_safe());
        assert!(!Method::Wks(WksMethod::Post).is_safe());
        assert!(!Method::Nonstandard("FOO".into()).is_safe());
    }
}
