//! Request validation.
//!
//! Each rule maps to a specific rejection: a status code plus the
//! body-factory tag the synthesized error page is built from, a
//! `category#reason` shape (`connect#failed_connect` in `crate::planner`
//! follows the same convention).

use crate::header::{HttpHeader, HttpKind, Method};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    MissingHost,
    UnsupportedScheme,
    InvalidConnectPort,
    MissingContentLength,
    TeIdentityRejected,
}

impl ValidationError {
    pub fn status(&self) -> u16 {
        match self {
            ValidationError::MissingHost => 400,
            ValidationError::UnsupportedScheme => 400,
            ValidationError::InvalidConnectPort => 403,
            ValidationError::MissingContentLength => 411,
            ValidationError::TeIdentityRejected => 400,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ValidationError::MissingHost => "request#no_host",
            ValidationError::UnsupportedScheme => "request#scheme_unsupported",
            ValidationError::InvalidConnectPort => "access#connect_port_forbidden",
            ValidationError::MissingContentLength => "request#no_content_length",
            ValidationError::TeIdentityRejected => "request#te_identity_rejected",
        }
    }
}

/// Ports a `CONNECT` request is permitted to tunnel to, per
/// `RecordsConfig::connect_ports` (default `{443, 563}`).
pub fn validate_request(
    request: &HttpHeader,
    connect_ports: &[u16],
) -> Result<(), ValidationError> {
    let HttpKind::Request { method, url } = &request.kind else {
        return Ok(());
    };

    // HTTP/0.9 requests carry no headers at all and are exempt from the
    // Host requirement.
    if !request.is_http_09() && !request.has("host") {
        return Err(ValidationError::MissingHost);
    }

    if matches!(method, Method::Wks(crate::header::WksMethod::Connect)) {
        if !connect_ports.contains(&url.port()) {
            return Err(ValidationError::InvalidConnectPort);
        }
    } else if !matches!(url.scheme, crate::header::Scheme::Http | crate::header::Scheme::Https) {
        return Err(ValidationError::UnsupportedScheme);
    }

    let requires_length = matches!(
        method,
        Method::Wks(crate::header::WksMethod::Post)
            | Method::Wks(crate::header::WksMethod::Put)
            | Method::Wks(crate::header::WksMethod::Push)
    );
    if requires_length && !request.has("content-length") && !request.has("transfer-encoding") {
        return Err(ValidationError::MissingContentLength);
    }

    if te_rejects_identity(request) {
        return Err(ValidationError::TeIdentityRejected);
    }

    Ok(())
}

/// `TE: identity;q=0` (or `identity;q=0.000`) means the client refuses an
/// untransformed response body — something this proxy cannot honor for a
/// request it intends to pass through untransformed, so it is rejected
/// outright rather than silently ignored.
fn te_rejects_identity(request: &HttpHeader) -> bool {
    for value in request.csv_iter("te", b',', true) {
        let mut parts = value.split(';').map(str::trim);
        let Some(name) = parts.next() else { continue };
        if !name.eq_ignore_ascii_case("identity") {
            continue;
        }
        for param in parts {
            if let Some(q) = param.strip_prefix("q=").or_else(|| param.strip_prefix("Q=")) {
                if q.trim().parse::<f64>().map(|v| v == 0.0).unwrap_or(false) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Scheme, Url};

    fn request(method: &str, url: Url) -> HttpHeader {
        HttpHeader::new_request(Method::parse(method), url, (1, 1))
    }

    #[test]
    fn missing_host_is_rejected_on_http11() {
        let req = request("GET", Url::new(Scheme::Http, "", "/"));
        assert_eq!(validate_request(&req, &[443, 563]), Err(ValidationError::MissingHost));
    }

    #[test]
    fn http09_is_exempt_from_host_requirement() {
        let mut req = request("GET", Url::new(Scheme::Http, "", "/"));
        req.version = (0, 9);
        assert!(validate_request(&req, &[443, 563]).is_ok());
    }

    #[test]
    fn connect_to_disallowed_port_is_rejected() {
        let mut url = Url::new(Scheme::Http, "example.test", "/");
        url.set_port(8080);
        let mut req = request("CONNECT", url);
        req.set("host", "example.test:8080");
        assert_eq!(
            validate_request(&req, &[443, 563]),
            Err(ValidationError::InvalidConnectPort)
        );
    }

    #[test]
    fn connect_to_allowed_port_passes() {
        let mut url = Url::new(Scheme::Http, "example.test", "/");
        url.set_port(443);
        let mut req = request("CONNECT", url);
        req.set("host", "example.test:443");
        assert!(validate_request(&req, &[443, 563]).is_ok());
    }

    #[test]
    fn post_without_length_is_rejected() {
        let mut req = request("POST", Url::new(Scheme::Http, "example.test", "/"));
        req.set("host", "example.test");
        assert_eq!(
            validate_request(&req, &[443, 563]),
            Err(ValidationError::MissingContentLength)
        );
    }

    #[test]
    fn post_with_chunked_transfer_encoding_passes() {
        let mut req = request("POST", Url::new(Scheme::Http, "example.test", "/"));
        req.set("host", "example.test");
        req.set("transfer-encoding", "chunked");
        assert!(validate_request(&req, &[443, 563]).is_ok());
    }

    #[test]
    fn te_identity_q_zero_is_rejected() {
        let mut req = request("GET", Url::new(Scheme::Http, "example.test", "/"));
        req.set("host", "example.test");
        req.set("te", "trailers, identity;q=0");
        assert_eq!(
            validate_request(&req, &[443, 563]),
            Err(ValidationError::TeIdentityRejected)
        );
    }

    #[test]
    fn te_with_nonzero_identity_weight_passes() {
        let mut req = request("GET", Url::new(Scheme::Http, "example.test", "/"));
        req.set("host", "example.test");
        req.set("te", "identity;q=0.5");
        assert!(validate_request(&req, &[443, 563]).is_ok());
    }
}
