//! RFC 7234 cache freshness computation.
//!
//! The algorithm below follows RFC 7234 §4; directive parsing reuses
//! [`crate::header::HttpHeader::directive_map`] rather than the ad hoc
//! regex/`HashSet` checks `plugin::cache` uses, since this crate's header
//! model already tracks field presence. `Duration`-typed config knobs
//! follow that same plugin's idiom.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::header::HttpHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Stale by HTTP rules but the origin did not mandate revalidation.
    Warning,
    Stale,
}

/// `via` detail code set on the evaluation for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaDetail {
    FreshTtlInCache,
    StaleTtlInCache,
    FreshHeuristic,
    Fresh,
    Warning,
    StaleAgeLimit,
    StaleMandatory,
}

#[derive(Debug, Clone)]
pub struct FreshnessConfig {
    pub cache_guaranteed_max_lifetime: Duration,
    pub heuristic_lm_factor: f64,
    pub heuristic_min_lifetime: Duration,
    pub heuristic_max_lifetime: Duration,
    pub ignore_client_cache_control: bool,
    pub cacheable_methods: Vec<String>,
    pub ignore_set_cookie: bool,
    pub ignore_www_authenticate: bool,
    /// Status -> TTL for negative caching (promotes an otherwise
    /// uncacheable 5xx to cacheable for a short, configured lifetime).
    pub negative_caching_statuses: HashMap<u16, Duration>,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            cache_guaranteed_max_lifetime: Duration::from_secs(86400 * 365),
            heuristic_lm_factor: 0.1,
            heuristic_min_lifetime: Duration::from_secs(0),
            heuristic_max_lifetime: Duration::from_secs(86400),
            ignore_client_cache_control: false,
            cacheable_methods: vec!["GET".to_string(), "HEAD".to_string()],
            ignore_set_cookie: false,
            ignore_www_authenticate: false,
            negative_caching_statuses: HashMap::new(),
        }
    }
}

pub struct FreshnessInputs<'a> {
    pub request: &'a HttpHeader,
    pub response: &'a HttpHeader,
    pub request_sent_time: DateTime<Utc>,
    pub response_received_time: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// How long the object has sat in cache storage; only consulted by
    /// the `ttl-in-cache` shortcut.
    pub resident_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub freshness: Freshness,
    pub heuristic: bool,
    pub via_detail: ViaDetail,
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim()).ok().map(|dt| dt.with_timezone(&Utc))
}

fn directive_duration(dirs: &HashMap<String, String>, name: &str) -> Option<Duration> {
    dirs.get(name).and_then(|v| v.trim().parse::<i64>().ok()).map(|secs| Duration::from_secs(secs.max(0) as u64))
}

/// RFC 7234 §4.2.3 current age computation.
fn compute_current_age(inputs: &FreshnessInputs) -> Duration {
    let response_dirs_age = inputs.response.get_int("age").unwrap_or(0).max(0);
    let age_value = Duration::from_secs(response_dirs_age as u64);

    let date_value = inputs
        .response
        .get("date")
        .and_then(parse_http_date)
        .unwrap_or(inputs.response_received_time);

    let apparent_age = inputs
        .response_received_time
        .signed_duration_since(date_value)
        .to_std()
        .unwrap_or(Duration::ZERO);

    let response_delay = inputs
        .response_received_time
        .signed_duration_since(inputs.request_sent_time)
        .to_std()
        .unwrap_or(Duration::ZERO);

    let corrected_age_value = age_value + response_delay;
    let corrected_initial_age = apparent_age.max(corrected_age_value);

    corrected_initial_age + inputs.resident_time
}

struct FreshLimit {
    value: Duration,
    heuristic: bool,
}

fn compute_fresh_limit(config: &FreshnessConfig, inputs: &FreshnessInputs, response_dirs: &HashMap<String, String>) -> FreshLimit {
    if let Some(limit) = directive_duration(response_dirs, "s-maxage").or_else(|| directive_duration(response_dirs, "max-age")) {
        return FreshLimit { value: limit.min(config.cache_guaranteed_max_lifetime), heuristic: false };
    }

    let date_value = inputs.response.get("date").and_then(parse_http_date).unwrap_or(inputs.response_received_time);

    if let Some(expires) = inputs.response.get("expires").and_then(parse_http_date) {
        if expires > date_value {
            let limit = (expires - date_value).to_std().unwrap_or(Duration::ZERO);
            return FreshLimit { value: limit.min(config.cache_guaranteed_max_lifetime), heuristic: false };
        }
    }

    let last_modified = inputs.response.get("last-modified").and_then(parse_http_date);
    let heuristic_limit = match last_modified {
        Some(lm) if date_value > lm => {
            let base = (date_value - lm).to_std().unwrap_or(Duration::ZERO);
            Duration::from_secs_f64(base.as_secs_f64() * config.heuristic_lm_factor)
        }
        _ => Duration::ZERO,
    };
    let clamped = heuristic_limit.clamp(config.heuristic_min_lifetime, config.heuristic_max_lifetime);
    FreshLimit { value: clamped, heuristic: true }
}

/// Runs the full freshness decision chain, RFC 7234 §4 steps 1-6.
pub fn evaluate(config: &FreshnessConfig, inputs: &FreshnessInputs) -> Evaluation {
    let request_dirs = inputs.request.directive_map("cache-control");

    // Step 1: ttl-in-cache shortcut bypasses all HTTP freshness rules.
    if let Some(ttl) = directive_duration(&request_dirs, "ttl-in-cache") {
        if ttl > Duration::ZERO {
            return if inputs.resident_time <= ttl {
                Evaluation { freshness: Freshness::Fresh, heuristic: false, via_detail: ViaDetail::FreshTtlInCache }
            } else {
                Evaluation { freshness: Freshness::Stale, heuristic: false, via_detail: ViaDetail::StaleTtlInCache }
            };
        }
    }

    let response_dirs = inputs.response.directive_map("cache-control");
    let current_age = compute_current_age(inputs);
    let fresh_limit = compute_fresh_limit(config, inputs, &response_dirs);

    let origin_mandates_revalidate = response_dirs.contains_key("must-revalidate") || response_dirs.contains_key("proxy-revalidate");

    let mut age_limit = fresh_limit.value;
    if !config.ignore_client_cache_control {
        if let Some(max_age) = directive_duration(&request_dirs, "max-age") {
            age_limit = age_limit.min(max_age);
        }
        if let Some(min_fresh) = directive_duration(&request_dirs, "min-fresh") {
            age_limit = age_limit.min(fresh_limit.value.saturating_sub(min_fresh));
        }
        if !origin_mandates_revalidate {
            if let Some(raw) = request_dirs.get("max-stale") {
                let max_stale = if raw.is_empty() {
                    config.cache_guaranteed_max_lifetime
                } else {
                    raw.trim().parse::<i64>().ok().map(|s| Duration::from_secs(s.max(0) as u64)).unwrap_or(Duration::ZERO)
                };
                age_limit = age_limit.max(fresh_limit.value + max_stale);
            }
        }
    }

    let (freshness, via_detail) = if current_age > age_limit {
        (Freshness::Stale, ViaDetail::StaleAgeLimit)
    } else if current_age > fresh_limit.value {
        if origin_mandates_revalidate {
            (Freshness::Stale, ViaDetail::StaleMandatory)
        } else {
            (Freshness::Warning, ViaDetail::Warning)
        }
    } else if fresh_limit.heuristic {
        (Freshness::Fresh, ViaDetail::FreshHeuristic)
    } else {
        (Freshness::Fresh, ViaDetail::Fresh)
    };

    Evaluation { freshness, heuristic: fresh_limit.heuristic, via_detail }
}

/// Whether a response may be stored at all.
pub fn is_response_cacheable(config: &FreshnessConfig, request: &HttpHeader, response: &HttpHeader) -> bool {
    let resp_dirs = response.directive_map("cache-control");

    if resp_dirs.contains_key("no-store") || resp_dirs.contains_key("private") {
        return false;
    }

    let status = response.status().unwrap_or(0);
    if status == 206 || status == 416 {
        return false;
    }

    let explicit_cacheable = resp_dirs.contains_key("public")
        || resp_dirs.contains_key("max-age")
        || resp_dirs.contains_key("s-maxage")
        || resp_dirs.contains_key("must-revalidate")
        || resp_dirs.contains_key("proxy-revalidate");

    if request.has("authorization") && !explicit_cacheable {
        return false;
    }

    let method = request.method().map(|m| m.as_str()).unwrap_or("");
    let method_ok = config.cacheable_methods.iter().any(|m| m.eq_ignore_ascii_case(method));
    if !method_ok {
        let post_with_explicit_lifetime =
            method.eq_ignore_ascii_case("POST") && (response.has("expires") || resp_dirs.contains_key("max-age"));
        if !post_with_explicit_lifetime {
            return false;
        }
    }

    if response.has("set-cookie") {
        let is_text = response.get("content-type").map(|ct| ct.starts_with("text/")).unwrap_or(false);
        if is_text && !resp_dirs.contains_key("public") && !config.ignore_set_cookie {
            return false;
        }
    }

    if response.has("www-authenticate") && !config.ignore_www_authenticate {
        return false;
    }

    if !(100..400).contains(&status) {
        if config.negative_caching_statuses.contains_key(&status) {
            return true;
        }
        if status >= 500 {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Method, Url, WksMethod};
    use chrono::TimeZone;

    fn req() -> HttpHeader {
        HttpHeader::new_request(Method::Wks(WksMethod::Get), Url::new(crate::header::Scheme::Http, "ex.test", "/a"), (1, 1))
    }

    fn resp() -> HttpHeader {
        HttpHeader::new_response(200, "OK", (1, 1))
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn max_age_governs_fresh_limit() {
        let mut response = resp();
        response.append("Cache-Control", "max-age=100");
        response.append("Date", t(0).to_rfc2822());

        let inputs = FreshnessInputs {
            request: &req(),
            response: &response,
            request_sent_time: t(0),
            response_received_time: t(0),
            now: t(50),
            resident_time: Duration::from_secs(50),
        };
        let eval = evaluate(&FreshnessConfig::default(), &inputs);
        assert_eq!(eval.freshness, Freshness::Fresh);
    }

    #[test]
    fn stale_past_max_age_without_revalidate_is_warning() {
        let mut response = resp();
        response.append("Cache-Control", "max-age=10");
        response.append("Date", t(0).to_rfc2822());

        let inputs = FreshnessInputs {
            request: &req(),
            response: &response,
            request_sent_time: t(0),
            response_received_time: t(0),
            now: t(20),
            resident_time: Duration::from_secs(20),
        };
        let eval = evaluate(&FreshnessConfig::default(), &inputs);
        assert_eq!(eval.freshness, Freshness::Warning);
    }

    #[test]
    fn must_revalidate_forces_stale_instead_of_warning() {
        let mut response = resp();
        response.append("Cache-Control", "max-age=10, must-revalidate");
        response.append("Date", t(0).to_rfc2822());

        let inputs = FreshnessInputs {
            request: &req(),
            response: &response,
            request_sent_time: t(0),
            response_received_time: t(0),
            now: t(20),
            resident_time: Duration::from_secs(20),
        };
        let eval = evaluate(&FreshnessConfig::default(), &inputs);
        assert_eq!(eval.freshness, Freshness::Stale);
        assert_eq!(eval.via_detail, ViaDetail::StaleMandatory);
    }

    #[test]
    fn heuristic_freshness_from_last_modified() {
        let mut response = resp();
        response.append("Date", t(1000).to_rfc2822());
        response.append("Last-Modified", t(0).to_rfc2822());

        let config = FreshnessConfig { heuristic_lm_factor: 0.1, heuristic_max_lifetime: Duration::from_secs(10_000), ..Default::default() };
        let inputs = FreshnessInputs {
            request: &req(),
            response: &response,
            request_sent_time: t(1000),
            response_received_time: t(1000),
            now: t(1050),
            resident_time: Duration::from_secs(50),
        };
        let eval = evaluate(&config, &inputs);
        assert!(eval.heuristic);
        assert_eq!(eval.freshness, Freshness::Fresh);
    }

    #[test]
    fn ttl_in_cache_bypasses_everything() {
        let mut request = req();
        request.append("Cache-Control", "ttl-in-cache=30");
        let mut response = resp();
        response.append("Cache-Control", "max-age=1"); // would otherwise be stale

        let inputs = FreshnessInputs {
            request: &request,
            response: &response,
            request_sent_time: t(0),
            response_received_time: t(0),
            now: t(20),
            resident_time: Duration::from_secs(20),
        };
        let eval = evaluate(&FreshnessConfig::default(), &inputs);
        assert_eq!(eval.freshness, Freshness::Fresh);
        assert_eq!(eval.via_detail, ViaDetail::FreshTtlInCache);
    }

    #[test]
    fn no_store_blocks_cacheability() {
        let mut response = resp();
        response.append("Cache-Control", "no-store");
        assert!(!is_response_cacheable(&FreshnessConfig::default(), &req(), &response));
    }

    #[test]
    fn authorization_without_explicit_directive_blocks_cacheability() {
        let mut request = req();
        request.append("Authorization", "Basic xyz");
        let response = resp();
        assert!(!is_response_cacheable(&FreshnessConfig::default(), &request, &response));
    }

    #[test]
    fn explicit_public_overrides_authorization() {
        let mut request = req();
        request.append("Authorization", "Basic xyz");
        let mut response = resp();
        response.append("Cache-Control", "public, max-age=60");
        assert!(is_response_cacheable(&FreshnessConfig::default(), &request, &response));
    }

    #[test]
    fn partial_content_never_cacheable() {
        let mut response = resp();
        response.set_status(206, "Partial Content");
        assert!(!is_response_cacheable(&FreshnessConfig::default(), &req(), &response));
    }

    #[test]
    fn negative_caching_promotes_5xx() {
        let mut response = resp();
        response.set_status(503, "Service Unavailable");
        let mut config = FreshnessConfig::default();
        config.negative_caching_statuses.insert(503, Duration::from_secs(5));
        assert!(is_response_cacheable(&config, &req(), &response));
    }

    #[test]
    fn uncacheable_5xx_without_negative_caching_config() {
        let mut response = resp();
        response.set_status(503, "Service Unavailable");
        assert!(!is_response_cacheable(&FreshnessConfig::default(), &req(), &response));
    }
}
