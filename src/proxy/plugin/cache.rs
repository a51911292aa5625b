//! Wraps `CacheFreshnessEvaluator`/`CacheStore` in the plugin hook points,
//! the same short-circuit-from-`request_filter` idiom `redirect.rs` uses
//! for its own synthetic responses, plus a
//! `response_filter`/`response_body_filter` pair that captures a cacheable
//! upstream response or merges a `304` onto a stored one.
//!
//! The on-disk storage engine is out of scope (see `crate::cache`); this
//! plugin only ever talks to the in-process `MemoryCacheStore` reference
//! implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http::StatusCode;
use once_cell::sync::Lazy;
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cache::{CacheStore, CachedObject, MemoryCacheStore, WriteLockTable};
use crate::freshness::{self, Freshness, FreshnessConfig, FreshnessInputs};
use crate::header::{HttpHeader, Method, Url};
use crate::proxy::ProxyContext;
use crate::utils::request::get_request_host;

use super::ProxyPlugin;

pub const PLUGIN_NAME: &str = "cache";

static CACHE_STORE: Lazy<MemoryCacheStore> = Lazy::new(MemoryCacheStore::new);
static WRITE_LOCKS: Lazy<WriteLockTable> = Lazy::new(WriteLockTable::new);

/// Number of objects currently resident in the shared cache store, exposed
/// for the admin stats snapshot.
pub fn cache_entries() -> usize {
    CACHE_STORE.len()
}

/// State stashed in `ProxyContext` while a miss's response body is streamed
/// back to the client and simultaneously accumulated for storage.
pub struct CacheWriteState {
    key: String,
    request: HttpHeader,
    request_sent_time: chrono::DateTime<Utc>,
    cacheable: bool,
    buffer: BytesMut,
}

/// State stashed in `ProxyContext` while a stale hit is being revalidated
/// upstream.
pub struct CacheRevalidateState {
    key: String,
    stored: Arc<CachedObject>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PluginConfig {
    #[serde(default)]
    freshness: FreshnessOverrides,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FreshnessOverrides {
    #[serde(default)]
    ignore_client_cache_control: bool,
}

pub fn create_cache_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    let config: PluginConfig =
        serde_json::from_value(cfg).or_err_with(ReadError, || "Invalid cache plugin config")?;
    let mut freshness = FreshnessConfig::default();
    freshness.ignore_client_cache_control = config.freshness.ignore_client_cache_control;
    Ok(Arc::new(PluginCache { freshness }))
}

pub struct PluginCache {
    freshness: FreshnessConfig,
}

fn cache_key(req: &RequestHeader, host: &str) -> String {
    let path_and_query = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri.path());
    format!("{host}{path_and_query}")
}

fn to_http_header_request(req: &RequestHeader, host: &str) -> HttpHeader {
    let method = Method::parse(req.method.as_str());
    let path_and_query = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri.path());
    let url = Url::parse(path_and_query, Some(host));
    let mut header = HttpHeader::new_request(method, url, (1, 1));
    for (name, value) in req.headers.iter() {
        if let Ok(v) = value.to_str() {
            header.append(name.as_str(), v);
        }
    }
    header
}

fn to_http_header_response(resp: &ResponseHeader) -> HttpHeader {
    let status = resp.status.as_u16();
    let reason = resp.status.canonical_reason().unwrap_or("").to_string();
    let mut header = HttpHeader::new_response(status, reason, (1, 1));
    for (name, value) in resp.headers.iter() {
        if let Ok(v) = value.to_str() {
            header.append(name.as_str(), v);
        }
    }
    header
}

/// Renders a stored object's response header back into a `pingora_http`
/// header for a cache hit, adding `Age` the way RFC 7234 §5.1 requires.
fn cached_response_header(object: &CachedObject, age: Duration) -> Result<ResponseHeader> {
    let status = object.response.status().unwrap_or(200);
    let mut built = ResponseHeader::build(status, Some(object.response.fields().len() + 1))?;
    for (name, value) in object.response.fields() {
        if name.eq_ignore_ascii_case("age") {
            continue;
        }
        built.append_header(name.clone(), value.clone())?;
    }
    built.append_header("Age", age.as_secs().to_string())?;
    Ok(built)
}

#[async_trait]
impl ProxyPlugin for PluginCache {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn priority(&self) -> i32 {
        900
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let req = session.req_header();
        if !matches!(req.method.as_str(), "GET" | "HEAD") {
            return Ok(false);
        }
        let host = get_request_host(req).unwrap_or("").to_string();
        let key = cache_key(req, &host);

        let Some(stored) = CACHE_STORE.get(&key) else {
            return Ok(false);
        };
        if stored.is_being_written() {
            return Ok(false);
        }

        let now = Utc::now();
        let inputs = FreshnessInputs {
            request: &to_http_header_request(req, &host),
            response: &stored.response,
            request_sent_time: stored.request_sent_time,
            response_received_time: stored.response_received_time,
            now,
            resident_time: stored.resident_time(now),
        };
        let eval = freshness::evaluate(&self.freshness, &inputs);

        match eval.freshness {
            Freshness::Fresh | Freshness::Warning => {
                let age = now
                    .signed_duration_since(stored.response_received_time)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let header = cached_response_header(&stored, age)?;
                let is_head = req.method.as_str() == "HEAD";
                session
                    .write_response_header(Box::new(header), false)
                    .await?;
                if is_head {
                    session.write_response_body(Some(Bytes::new()), true).await?;
                } else {
                    session
                        .write_response_body(Some(stored.body.clone()), true)
                        .await?;
                }
                Ok(true)
            }
            Freshness::Stale => {
                ctx.cache_revalidate = Some(CacheRevalidateState { key, stored });
                Ok(false)
            }
        }
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        if let Some(revalidate) = ctx.cache_revalidate.as_ref() {
            if let Some(etag) = revalidate.stored.response.get("etag") {
                upstream_request.insert_header("If-None-Match", etag)?;
            }
            if let Some(lm) = revalidate.stored.response.get("last-modified") {
                upstream_request.insert_header("If-Modified-Since", lm)?;
            }
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        if let Some(revalidate) = ctx.cache_revalidate.take() {
            if upstream_response.status == StatusCode::NOT_MODIFIED {
                let merged = merge_304(&revalidate.stored, upstream_response);
                *upstream_response = cached_response_header(&merged, Duration::ZERO)?;
                CACHE_STORE.put(&revalidate.key, merged);
                return Ok(());
            }
            // Origin sent a full response instead of 304 — fall through to
            // the ordinary miss/write path below, replacing the old entry.
        }

        let req = session.req_header();
        if !matches!(req.method.as_str(), "GET" | "HEAD") {
            return Ok(());
        }
        let host = get_request_host(req).unwrap_or("").to_string();
        let key = cache_key(req, &host);
        let request = to_http_header_request(req, &host);
        let response = to_http_header_response(upstream_response);
        let cacheable = freshness::is_response_cacheable(&self.freshness, &request, &response);

        if cacheable && !WRITE_LOCKS.try_acquire(&key) {
            // Another writer already owns this key; don't double-store.
            return Ok(());
        }

        ctx.cache_write = Some(CacheWriteState {
            key,
            request,
            request_sent_time: Utc::now(),
            cacheable,
            buffer: BytesMut::new(),
        });
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        let Some(state) = ctx.cache_write.as_mut() else {
            return Ok(());
        };
        if let Some(chunk) = body {
            state.buffer.extend_from_slice(chunk);
        }
        if end_of_stream {
            let state = ctx.cache_write.take().unwrap();
            if state.cacheable {
                let object = CachedObject {
                    request: state.request,
                    response: HttpHeader::new_response(200, "OK", (1, 1)),
                    request_sent_time: state.request_sent_time,
                    response_received_time: Utc::now(),
                    object_size: state.buffer.len() as i64,
                    stored_at: Utc::now(),
                    body: state.buffer.freeze(),
                };
                CACHE_STORE.put(&state.key, object);
            }
            WRITE_LOCKS.release(&state.key);
        }
        Ok(())
    }
}

/// Applies the RFC 7232 §4.1 header-merge rule: every header in the `304`
/// response replaces the corresponding stored header, except `Content-Length`
/// (meaningless on a `304`) and the stored body is kept unchanged.
fn merge_304(stored: &CachedObject, not_modified: &ResponseHeader) -> CachedObject {
    let mut response = stored.response.clone();
    for (name, value) in not_modified.headers.iter() {
        if name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let Ok(v) = value.to_str() {
            response.set(name.as_str(), v);
        }
    }
    CachedObject {
        request: stored.request.clone(),
        response,
        request_sent_time: stored.request_sent_time,
        response_received_time: Utc::now(),
        object_size: stored.object_size,
        stored_at: Utc::now(),
        body: stored.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Scheme, WksMethod};

    fn object() -> CachedObject {
        let now = Utc::now();
        CachedObject {
            request: HttpHeader::new_request(
                Method::Wks(WksMethod::Get),
                Url::new(Scheme::Http, "ex.test", "/a"),
                (1, 1),
            ),
            response: HttpHeader::new_response(200, "OK", (1, 1)),
            request_sent_time: now,
            response_received_time: now,
            object_size: 3,
            stored_at: now,
            body: Bytes::from_static(b"abc"),
        }
    }

    #[test]
    fn merge_304_keeps_body_and_drops_content_length() {
        let stored = object();
        let mut not_modified = ResponseHeader::build(304, None).unwrap();
        not_modified.append_header("ETag", "\"v2\"").unwrap();
        not_modified
            .append_header("Content-Length", "0")
            .unwrap();

        let merged = merge_304(&stored, &not_modified);
        assert_eq!(merged.body, Bytes::from_static(b"abc"));
        assert_eq!(merged.response.get("etag"), Some("\"v2\""));
    }
}
