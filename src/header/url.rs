//! URL data model.

use serde::{Deserialize, Serialize};

/// Well-known schemes, given the same well-known-index treatment as
/// well-known HTTP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
    Other,
}

impl Scheme {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => Scheme::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Other => "",
        }
    }

    /// Default port implied by this scheme, used whenever a `Url` carries
    /// no explicit port. Once a scheme is set, it determines this default;
    /// changing the scheme later recomputes it.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
            Scheme::Other => 0,
        }
    }

    /// The counterpart used by the websocket upgrade dance
    /// (`ws` <-> `http`, `wss` <-> `https`).
    pub fn upgrade_to_ws(&self) -> Self {
        match self {
            Scheme::Http => Scheme::Ws,
            Scheme::Https => Scheme::Wss,
            other => *other,
        }
    }

    pub fn downgrade_from_ws(&self) -> Self {
        match self {
            Scheme::Ws => Scheme::Http,
            Scheme::Wss => Scheme::Https,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Url {
    pub scheme: Scheme,
    pub host: Vec<u8>,
    port: Option<u16>,
    pub path: String,
    pub params: String,
    pub query: String,
    pub fragment: String,
}

impl Url {
    pub fn new(scheme: Scheme, host: impl Into<Vec<u8>>, path: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port: None,
            path: path.into(),
            params: String::new(),
            query: String::new(),
            fragment: String::new(),
        }
    }

    /// Set an explicit, non-default port.
    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    /// The effective port: explicit if set, else the scheme's default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn host_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.host)
    }

    /// Parses an absolute or authority-relative URL as seen on an HTTP/1
    /// request line. Falls back to treating the whole string as a path
    /// when no scheme/authority is present (origin-form request).
    pub fn parse(raw: &str, default_host: Option<&str>) -> Self {
        if let Some(rest) = raw
            .strip_prefix("http://")
            .or_else(|| raw.strip_prefix("https://"))
            .or_else(|| raw.strip_prefix("ws://"))
            .or_else(|| raw.strip_prefix("wss://"))
        {
            let scheme = Scheme::parse(raw.split("://").next().unwrap_or("http"));
            let (authority, path_and_rest) = rest.split_once('/').unwrap_or((rest, ""));
            let (host, port) = split_authority(authority);
            let mut url = Url::new(scheme, host, format!("/{path_and_rest}"));
            split_path_query_fragment(&mut url);
            if let Some(port) = port {
                url.set_port(port);
            }
            return url;
        }

        let host = default_host.unwrap_or("").as_bytes().to_vec();
        let mut url = Url::new(Scheme::Http, host, raw.to_string());
        split_path_query_fragment(&mut url);
        url
    }
}

fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some((host, port)) = authority.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host, Some(port));
        }
    }
    (authority, None)
}

fn split_path_query_fragment(url: &mut Url) {
    let raw = std::mem::take(&mut url.path);
    let (path_and_query, fragment) = raw.split_once('#').unwrap_or((raw.as_str(), ""));
    let (path, query) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
    url.path = path.to_string();
    url.query = query.to_string();
    url.fragment = fragment.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_follows_scheme() {
        let url = Url::new(Scheme::Https, "example.test", "/a");
        assert_eq!(url.port(), 443);
    }

    #[test]
    fn explicit_port_overrides_default() {
        let mut url = Url::new(Scheme::Http, "example.test", "/a");
        url.set_port(8080);
        assert_eq!(url.port(), 8080);
    }

    #[test]
    fn parse_splits_query_and_fragment() {
        let url = Url::parse("http://example.test/a/b?x=1#frag", None);
        assert_eq!(url.path, "/a/b");
        assert_eq!(url.query, "x=1");
        assert_eq!(url.fragment, "frag");
        assert_eq!(url.host_str(), "example.test");
    }

    #[test]
    fn origin_form_uses_default_host() {
        let url = Url::parse("/a/b", Some("example.test"));
        assert_eq!(url.host_str(), "example.test");
        assert_eq!(url.path, "/a/b");
    }

    #[test]
    fn websocket_scheme_round_trips() {
        let scheme = Scheme::Https;
        let ws = scheme.upgrade_to_ws();
        assert_eq!(ws, Scheme::Wss);
        assert_eq!(ws.downgrade_from_ws(), Scheme::Https);
    }
}
