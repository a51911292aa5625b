//! The transaction state machine driver.
//!
//! Each method corresponds to one named state and returns the `NextAction`
//! the caller (`service::http::HttpService` in a live deployment) should
//! take next. Wire I/O, DNS, and the actual upstream connection are out of
//! scope here — those steps are represented as
//! `NextAction::DnsLookup`/`ConnectUpstream` for the caller to perform and
//! report back into `handle_response`, treating the connection itself as
//! an external capability the same way `CacheStore` stands in for real
//! cache storage.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::cache::{CacheStore, CachedObject, WriteLockTable};
use crate::config::RecordsConfig;
use crate::freshness::{evaluate, is_response_cacheable, Freshness, FreshnessConfig, FreshnessInputs};
use crate::header::{HttpHeader, Method, WksMethod};
use crate::ip_allow::{Acl, IpAllow};
use crate::planner::{ConnectionPlanner, ParentDownTable, ParentProxy, RetryDisposition, Target};
use crate::prewarm::{PreWarmDst, PreWarmPool};
use crate::stats;
use crate::transform::{parse_ranges, RangeTransform, TransformStageImpl};

use super::response::{apply_keep_alive_header, decide_keep_alive, detect_self_loop, is_websocket_upgrade, strip_hop_by_hop, via_value};
use super::state::{CacheAction, CacheWriteLock, NextAction, Source, TransactionState};
use super::validation::validate_request;

/// The host that answers to the proxy's own built-in stats page instead of
/// being forwarded upstream.
const INTERNAL_HOST: &str = "$internal$";

pub struct TransactionFsm {
    pub freshness_config: FreshnessConfig,
    pub cache: Arc<dyn CacheStore>,
    pub write_locks: Arc<WriteLockTable>,
    pub ip_allow: Arc<IpAllow>,
    pub connect_ports: Vec<u16>,
    pub process_id: uuid::Uuid,
    pub records: RecordsConfig,
    pub parents: Vec<ParentProxy>,
    pub parent_down: Arc<ParentDownTable>,
    pub prewarm: Arc<PreWarmPool>,
    /// Concurrently-open websocket upgrades, enforced against
    /// `records.websocket_max_concurrency`. A transaction that takes the
    /// `ConnectUpstream` path for an upgrade must eventually call
    /// [`TransactionFsm::release_websocket_slot`] once the upgraded
    /// connection closes; tracking that closure is wire I/O the caller
    /// owns (see module docs).
    websocket_active: AtomicU32,
}

impl TransactionFsm {
    /// `ReadRequestHdr` done, ACL already resolved onto `state.acl` by the
    /// caller (it needs the accepted connection's peer address, which this
    /// module has no access to). Validates the request, checks for a
    /// self-loop, enforces the ACL, and decides whether this request is a
    /// cache candidate at all.
    pub fn handle_request(&self, state: &mut TransactionState) -> NextAction {
        let Some(request) = state.client_request.clone() else {
            return NextAction::ErrorResponse(400, "request#no_request_line");
        };
        let request = &request;

        if let Err(e) = validate_request(request, &self.connect_ports) {
            return NextAction::ErrorResponse(e.status(), e.tag());
        }

        if detect_self_loop(request, &self.process_id) {
            return NextAction::ErrorResponse(400, "request#cycle_detected");
        }

        let method = request.method().cloned();
        let allowed = match &method {
            Some(Method::Wks(wks)) => state.acl.is_method_allowed(*wks),
            Some(Method::Nonstandard(name)) => state.acl.is_nonstandard_allowed(name),
            None => false,
        };
        if !allowed {
            return NextAction::ErrorResponse(403, "access#denied");
        }

        if self.records.max_post_size > 0 {
            if let Some(len) = request.get_int("content-length") {
                if len as u64 > self.records.max_post_size {
                    return NextAction::ErrorResponse(413, "request#post_too_large");
                }
            }
        }

        if !self.records.expect_100_continue_enabled && expects_100_continue(request) {
            return NextAction::ErrorResponse(405, "request#expect_continue_disabled");
        }

        if let Some(wks) = method.as_ref().and_then(Method::wks) {
            if matches!(wks, WksMethod::Trace | WksMethod::Options) && max_forwards_is_zero(request) {
                return self.answer_max_forwards_zero(state, request, wks);
            }
        }

        if is_internal_host(request) {
            let mut response = HttpHeader::new_response(200, "OK", (1, 1));
            response.set("content-type", "text/plain; version=0.0.4");
            state.internal_response_body = Some(bytes::Bytes::from(stats::gather_text()));
            state.client_response = Some(response);
            state.source = Source::Internal;
            return NextAction::SendResponse;
        }

        state.is_websocket = is_websocket_upgrade(request);

        if state.is_websocket {
            if self.records.websocket_max_concurrency > 0
                && self.websocket_active.load(Ordering::SeqCst) >= self.records.websocket_max_concurrency
            {
                return NextAction::ErrorResponse(503, "request#websocket_concurrency_exceeded");
            }
            self.websocket_active.fetch_add(1, Ordering::SeqCst);
            state.cache_action = CacheAction::NoAction;
            return NextAction::ConnectUpstream;
        }

        let cacheable_method =
            matches!(method, Some(Method::Wks(WksMethod::Get)) | Some(Method::Wks(WksMethod::Head)));
        if !cacheable_method {
            state.cache_action = CacheAction::NoAction;
            return NextAction::ConnectUpstream;
        }

        state.cache_action = CacheAction::Lookup;
        NextAction::CacheLookup
    }

    /// Appends this process's `Via` marker when `records.insert_response_via_str`
    /// is enabled (any nonzero value — the source's more/less verbose detail
    /// levels aren't distinguishable from the data this crate tracks).
    fn append_via(&self, response: &mut HttpHeader) {
        if self.records.insert_response_via_str > 0 {
            response.append("via", via_value(&self.process_id, response.version));
        }
    }

    /// Releases a previously-claimed websocket concurrency slot. The
    /// caller owns the upgraded connection's lifetime and must call this
    /// exactly once it closes.
    pub fn release_websocket_slot(&self) {
        self.websocket_active.fetch_sub(1, Ordering::SeqCst);
    }

    /// `TRACE`/`OPTIONS` carrying `Max-Forwards: 0` are answered locally
    /// instead of forwarded, per RFC 7231 §5.1.2.
    fn answer_max_forwards_zero(
        &self,
        state: &mut TransactionState,
        request: &HttpHeader,
        wks: WksMethod,
    ) -> NextAction {
        let mut response = HttpHeader::new_response(200, "OK", (1, 1));
        match wks {
            WksMethod::Trace => {
                response.set("content-type", "message/http");
                state.internal_response_body = Some(render_request_line(request));
            }
            WksMethod::Options => {
                response.set("allow", allowed_methods_header(&state.acl));
            }
            _ => unreachable!("only Trace/Options reach this branch"),
        }
        state.client_response = Some(response);
        state.source = Source::Internal;
        NextAction::SendResponse
    }

    pub fn cache_lookup(&self, state: &mut TransactionState) -> NextAction {
        let key = state.cache_key.clone().unwrap_or_default();
        match self.cache.get(&key) {
            Some(object) => {
                state.cached_object = Some((*object).clone());
                NextAction::CacheOpenReadHit
            }
            None => NextAction::CacheOpenReadMiss,
        }
    }

    /// A cache hit: evaluate freshness and either serve directly or
    /// kick off a conditional revalidation upstream.
    pub fn cache_open_read_hit(&self, state: &mut TransactionState) -> NextAction {
        let object = state.cached_object.clone().expect("cache_open_read_hit without a cached object");
        let now = Utc::now();
        let resident_time = object.resident_time(now);
        let evaluation = evaluate(
            &self.freshness_config,
            &FreshnessInputs {
                request: &object.request,
                response: &object.response,
                request_sent_time: object.request_sent_time,
                response_received_time: object.response_received_time,
                now,
                resident_time,
            },
        );

        match evaluation.freshness {
            Freshness::Fresh | Freshness::Warning => {
                let mut response = object.response.clone();
                self.append_via(&mut response);

                let is_get = matches!(
                    state.client_request.as_ref().and_then(HttpHeader::method),
                    Some(Method::Wks(WksMethod::Get))
                );
                let range_value = state.client_request.as_ref().and_then(|r| r.get("range")).map(str::to_string);

                if is_get {
                    if let Some(range_value) = range_value {
                        let content_length =
                            response.get_int("content-length").unwrap_or(object.body.len() as i64);
                        if let Some(ranges) = parse_ranges(&range_value, content_length) {
                            let content_type =
                                response.get("content-type").unwrap_or("application/octet-stream").to_string();
                            let mut transform = RangeTransform::new(ranges, content_length, content_type);
                            transform.prepare_header(&mut response);
                            let mut body = transform.process(&object.body);
                            body.extend(transform.finish());

                            state.cache_action = CacheAction::Serve;
                            state.internal_response_body = Some(bytes::Bytes::from(body));
                            state.client_response = Some(response);
                            state.source = Source::Transform;
                            stats::CACHE_HITS.inc();
                            return NextAction::SendResponse;
                        }
                    }
                }

                state.cache_action = CacheAction::Serve;
                state.client_response = Some(response);
                state.source = Source::Cache;
                stats::CACHE_HITS.inc();
                NextAction::SendResponse
            }
            Freshness::Stale => {
                state.cache_action = CacheAction::PrepareToUpdate;
                if let Some(mut conditional) = state.client_request.clone() {
                    if let Some(etag) = object.response.get("etag") {
                        conditional.set("if-none-match", etag.to_string());
                    }
                    if let Some(last_modified) = object.response.get("last-modified") {
                        conditional.set("if-modified-since", last_modified.to_string());
                    }
                    state.server_request = Some(conditional);
                }
                NextAction::ConnectUpstream
            }
        }
    }

    /// A cache miss: try to become the writer for this key. A transaction
    /// that loses the race reads through without caching rather than
    /// stampeding the origin alongside the winner.
    pub fn cache_open_read_miss(&self, state: &mut TransactionState) -> NextAction {
        stats::CACHE_MISSES.inc();
        let key = state.cache_key.clone().unwrap_or_default();
        if self.write_locks.try_acquire(&key) {
            state.cache_write_lock = CacheWriteLock::Holder;
            state.cache_action = CacheAction::PrepareToWrite;
        } else {
            state.cache_write_lock = CacheWriteLock::ReadRetry;
            state.cache_action = CacheAction::NoAction;
        }
        NextAction::ConnectUpstream
    }

    /// Selects the next upstream candidate (a configured parent, then the
    /// origin) for this transaction, lazily creating its `ConnectionPlanner`
    /// on first use, and tries to borrow an already-open connection from the
    /// pre-warm pool for it. Returns `NextAction::ConnectUpstream` with
    /// `state.server.addr` set to the chosen target (and
    /// `state.borrowed_netvc` set when the pool had a connection ready), or
    /// a 502 once every parent and the origin have been ruled out.
    pub async fn connect_upstream(&self, state: &mut TransactionState, origin: SocketAddr) -> NextAction {
        if state.planner.is_none() {
            state.planner = Some(ConnectionPlanner::new(
                self.records.clone(),
                self.parents.clone(),
                origin,
                self.parent_down.clone(),
            ));
        }
        self.pick_next_target(state).await
    }

    /// Reports that the connect/send attempt against the target
    /// `connect_upstream` selected has failed. Advances the per-request
    /// `ConnectionPlanner` and either retries the same target, fails over to
    /// the next candidate (borrowing again from the pre-warm pool), or gives
    /// up with a 502.
    pub async fn handle_connect_failure(&self, state: &mut TransactionState, dead_server: bool) -> NextAction {
        let Some(method) = state.client_request.as_ref().and_then(HttpHeader::method).cloned() else {
            return NextAction::ErrorResponse(502, ConnectionPlanner::failed_connect_tag());
        };
        let target_kind = match state.planner.as_ref().and_then(ConnectionPlanner::current_target) {
            Some(Target::Parent(_)) => "parent",
            Some(Target::Origin(_)) => "origin",
            None => "unknown",
        };
        stats::CONNECT_FAILURES.with_label_values(&[target_kind]).inc();

        let Some(planner) = state.planner.as_mut() else {
            return NextAction::ErrorResponse(502, ConnectionPlanner::failed_connect_tag());
        };

        match planner.on_connect_failure(&method, dead_server) {
            RetryDisposition::RetrySameTarget => NextAction::ConnectUpstream,
            RetryDisposition::Failover => self.pick_next_target(state).await,
            RetryDisposition::GiveUp => NextAction::ErrorResponse(502, ConnectionPlanner::failed_connect_tag()),
        }
    }

    /// Advances `state.planner` to the next candidate and tries to borrow a
    /// pre-warmed connection for it.
    async fn pick_next_target(&self, state: &mut TransactionState) -> NextAction {
        let Some(planner) = state.planner.as_mut() else {
            return NextAction::ErrorResponse(502, ConnectionPlanner::failed_connect_tag());
        };
        let Some(target) = planner.find_server_and_update_current_info() else {
            return NextAction::ErrorResponse(502, ConnectionPlanner::failed_connect_tag());
        };

        let addr = match target {
            Target::Parent(parent) => parent.address,
            Target::Origin(addr) => addr,
        };
        state.server.addr = Some(addr);

        let dst = PreWarmDst { host: addr.ip().to_string(), port: addr.port(), alpn_id: 1 };
        state.borrowed_netvc = self.prewarm.borrow(&dst).await;

        NextAction::ConnectUpstream
    }

    /// The upstream response has arrived: settle the cache write (if this
    /// transaction holds the lock), decide keep-alive, and strip
    /// hop-by-hop headers before handing the result to the caller.
    pub fn handle_response(&self, state: &mut TransactionState) -> NextAction {
        let Some(request) = state.client_request.clone() else {
            return NextAction::ErrorResponse(400, "request#no_request_line");
        };
        let Some(response) = state.server_response.clone() else {
            return NextAction::ErrorResponse(502, ConnectionPlanner::failed_connect_tag());
        };

        if state.cache_action == CacheAction::PrepareToUpdate && response.status() == Some(304) {
            if let Some(cached) = state.cached_object.clone() {
                let refreshed_response = merge_not_modified(&cached.response, &response);
                let cacheable = is_response_cacheable(&self.freshness_config, &request, &refreshed_response);
                let key = state.cache_key.clone().unwrap_or_default();
                if cacheable {
                    state.cache_action = CacheAction::Update;
                    self.cache.put(
                        &key,
                        CachedObject { response: refreshed_response.clone(), stored_at: Utc::now(), ..cached },
                    );
                } else {
                    state.cache_action = CacheAction::Delete;
                    self.cache.remove(&key);
                }
                let mut refreshed_response = refreshed_response;
                self.append_via(&mut refreshed_response);
                state.client_response = Some(refreshed_response);
                state.source = Source::Cache;
                stats::CACHE_HITS.inc();
                return NextAction::SendResponse;
            }
        }

        let cacheable = is_response_cacheable(&self.freshness_config, &request, &response);

        if state.cache_action == CacheAction::PrepareToUpdate {
            // Revalidation came back with a full response rather than a
            // 304: the stale object is replaced outright, or dropped if the
            // new response turned out not to be cacheable.
            let key = state.cache_key.clone().unwrap_or_default();
            if cacheable {
                state.cache_action = CacheAction::Replace;
                let now = Utc::now();
                self.cache.put(
                    &key,
                    CachedObject {
                        request: request.clone(),
                        response: response.clone(),
                        request_sent_time: now,
                        response_received_time: now,
                        object_size: response.get_int("content-length").unwrap_or(0),
                        stored_at: now,
                        body: bytes::Bytes::new(),
                    },
                );
                stats::CACHE_WRITES.inc();
            } else {
                state.cache_action = CacheAction::Delete;
                self.cache.remove(&key);
            }
        } else if state.cache_write_lock == CacheWriteLock::Holder {
            let key = state.cache_key.clone().unwrap_or_default();
            if cacheable {
                state.cache_action = CacheAction::Write;
                let now = Utc::now();
                self.cache.put(
                    &key,
                    CachedObject {
                        request: request.clone(),
                        response: response.clone(),
                        request_sent_time: now,
                        response_received_time: now,
                        object_size: response.get_int("content-length").unwrap_or(0),
                        stored_at: now,
                        // Body bytes are wire I/O (out of scope here, see
                        // module docs); `proxy::plugin::cache` is what
                        // actually captures and serves a response body.
                        body: bytes::Bytes::new(),
                    },
                );
                stats::CACHE_WRITES.inc();
            } else {
                state.cache_action = CacheAction::NoAction;
            }
            self.write_locks.release(&key);
        }

        let mut out = response;
        strip_hop_by_hop(&mut out);
        state.keep_alive = decide_keep_alive(&request, &out);
        apply_keep_alive_header(&mut out, request.is_http_11_or_later(), state.keep_alive);
        self.append_via(&mut out);
        state.client_response = Some(out);
        state.source = Source::Origin;
        stats::REQUEST_SIZE_BYTES
            .with_label_values(&["client"])
            .observe(request.get_int("content-length").unwrap_or(0) as f64);
        NextAction::SendResponse
    }
}

fn max_forwards_is_zero(request: &HttpHeader) -> bool {
    request.get("max-forwards").and_then(|v| v.trim().parse::<i64>().ok()) == Some(0)
}

fn expects_100_continue(request: &HttpHeader) -> bool {
    request.get("expect").map(|v| v.eq_ignore_ascii_case("100-continue")).unwrap_or(false)
}

fn is_internal_host(request: &HttpHeader) -> bool {
    request.url().map(|u| u.host_str() == INTERNAL_HOST).unwrap_or(false)
}

/// Lists the methods `acl` permits, for the `Allow` header an `OPTIONS`
/// with `Max-Forwards: 0` is answered with.
fn allowed_methods_header(acl: &Acl) -> String {
    WksMethod::ALL
        .into_iter()
        .filter(|m| acl.is_method_allowed(*m))
        .map(WksMethod::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders the request line and fields back out, for `TRACE`'s "echo the
/// request as the response body" contract.
fn render_request_line(request: &HttpHeader) -> bytes::Bytes {
    let mut out = String::new();
    if let (Some(method), Some(url)) = (request.method(), request.url()) {
        out.push_str(&format!(
            "{} {} HTTP/{}.{}\r\n",
            method.as_str(),
            url.path,
            request.version.0,
            request.version.1
        ));
    }
    for (name, value) in request.fields() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    bytes::Bytes::from(out)
}

/// RFC 7232 §4.1: a 304 carries the headers that should replace the
/// corresponding ones in the stored representation; everything else in the
/// stored response is kept as-is.
fn merge_not_modified(stored: &HttpHeader, not_modified: &HttpHeader) -> HttpHeader {
    let mut merged = stored.clone();
    for (name, value) in not_modified.fields() {
        merged.set(name.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::header::{Scheme, Url};
    use crate::ip_allow::Acl;
    use crate::planner::ParentDownTable;
    use crate::prewarm::{PreWarmConnector, PreWarmPoolConfig};
    use std::net::{IpAddr, Ipv4Addr};

    struct NeverConnects;

    #[async_trait::async_trait]
    impl PreWarmConnector for NeverConnects {
        async fn resolve_and_connect(&self, _dst: &PreWarmDst) -> Result<crate::prewarm::NetVc, crate::error::LoomError> {
            Err(crate::error::LoomError::config("no network in tests"))
        }
    }

    fn origin_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 80)
    }

    fn fsm() -> TransactionFsm {
        TransactionFsm {
            freshness_config: FreshnessConfig::default(),
            cache: Arc::new(MemoryCacheStore::new()),
            write_locks: Arc::new(WriteLockTable::new()),
            ip_allow: Arc::new(IpAllow::deny_all()),
            connect_ports: vec![443, 563],
            process_id: uuid::Uuid::new_v4(),
            records: RecordsConfig::default(),
            parents: vec![],
            parent_down: Arc::new(ParentDownTable::new()),
            prewarm: Arc::new(PreWarmPool::new(PreWarmPoolConfig::default(), Arc::new(NeverConnects))),
            websocket_active: AtomicU32::new(0),
        }
    }

    fn get_request() -> HttpHeader {
        let mut req = HttpHeader::new_request(
            Method::parse("GET"),
            Url::new(Scheme::Http, "example.test", "/a"),
            (1, 1),
        );
        req.set("host", "example.test");
        req
    }

    fn state_with_request() -> TransactionState {
        let mut state = TransactionState::new(uuid::Uuid::new_v4());
        state.client_request = Some(get_request());
        state.acl = Acl::allow_all();
        state.cache_key = Some("/a".to_string());
        state
    }

    #[test]
    fn cache_miss_then_write_on_cacheable_response() {
        let fsm = fsm();
        let mut state = state_with_request();

        assert_eq!(fsm.handle_request(&mut state), NextAction::CacheLookup);
        assert_eq!(fsm.cache_lookup(&mut state), NextAction::CacheOpenReadMiss);
        assert_eq!(fsm.cache_open_read_miss(&mut state), NextAction::ConnectUpstream);
        assert_eq!(state.cache_write_lock, CacheWriteLock::Holder);

        let mut response = HttpHeader::new_response(200, "OK", (1, 1));
        response.set("cache-control", "max-age=60");
        response.set("content-length", "5");
        state.server_response = Some(response);

        assert_eq!(fsm.handle_response(&mut state), NextAction::SendResponse);
        assert!(fsm.cache.get("/a").is_some());
        assert!(!fsm.write_locks.is_locked("/a"));
    }

    #[test]
    fn fresh_hit_is_served_without_revalidation() {
        let fsm = fsm();
        let now = Utc::now();
        fsm.cache.put(
            "/a",
            CachedObject {
                request: get_request(),
                response: {
                    let mut r = HttpHeader::new_response(200, "OK", (1, 1));
                    r.set("cache-control", "max-age=3600");
                    r
                },
                request_sent_time: now,
                response_received_time: now,
                object_size: 10,
                stored_at: now,
                body: bytes::Bytes::new(),
            },
        );

        let mut state = state_with_request();
        assert_eq!(fsm.handle_request(&mut state), NextAction::CacheLookup);
        assert_eq!(fsm.cache_lookup(&mut state), NextAction::CacheOpenReadHit);
        assert_eq!(fsm.cache_open_read_hit(&mut state), NextAction::SendResponse);
        assert_eq!(state.cache_action, CacheAction::Serve);
        assert_eq!(state.source, Source::Cache);
    }

    #[test]
    fn stale_hit_revalidates_and_304_refreshes_cache() {
        let fsm = fsm();
        let past = Utc::now() - chrono::Duration::seconds(120);
        fsm.cache.put(
            "/a",
            CachedObject {
                request: get_request(),
                response: {
                    let mut r = HttpHeader::new_response(200, "OK", (1, 1));
                    r.set("cache-control", "max-age=10");
                    r.set("etag", "\"v1\"");
                    r
                },
                request_sent_time: past,
                response_received_time: past,
                object_size: 10,
                stored_at: past,
                body: bytes::Bytes::new(),
            },
        );

        let mut state = state_with_request();
        fsm.handle_request(&mut state);
        fsm.cache_lookup(&mut state);
        assert_eq!(fsm.cache_open_read_hit(&mut state), NextAction::ConnectUpstream);
        assert_eq!(state.cache_action, CacheAction::PrepareToUpdate);
        assert_eq!(state.server_request.as_ref().unwrap().get("if-none-match"), Some("\"v1\""));

        let mut not_modified = HttpHeader::new_response(304, "Not Modified", (1, 1));
        not_modified.set("etag", "\"v1\"");
        state.server_response = Some(not_modified);

        assert_eq!(fsm.handle_response(&mut state), NextAction::SendResponse);
        assert_eq!(state.cache_action, CacheAction::Update);
        assert_eq!(state.source, Source::Cache);
        assert_eq!(state.client_response.as_ref().unwrap().status(), Some(200));
    }

    #[test]
    fn stale_hit_revalidation_deletes_when_refreshed_response_uncacheable() {
        let fsm = fsm();
        let past = Utc::now() - chrono::Duration::seconds(120);
        fsm.cache.put(
            "/a",
            CachedObject {
                request: get_request(),
                response: {
                    let mut r = HttpHeader::new_response(200, "OK", (1, 1));
                    r.set("cache-control", "max-age=10");
                    r.set("etag", "\"v1\"");
                    r
                },
                request_sent_time: past,
                response_received_time: past,
                object_size: 10,
                stored_at: past,
                body: bytes::Bytes::new(),
            },
        );

        let mut state = state_with_request();
        fsm.handle_request(&mut state);
        fsm.cache_lookup(&mut state);
        fsm.cache_open_read_hit(&mut state);

        let mut not_modified = HttpHeader::new_response(304, "Not Modified", (1, 1));
        not_modified.set("etag", "\"v1\"");
        not_modified.set("cache-control", "no-store");
        state.server_response = Some(not_modified);

        assert_eq!(fsm.handle_response(&mut state), NextAction::SendResponse);
        assert_eq!(state.cache_action, CacheAction::Delete);
        assert!(fsm.cache.get("/a").is_none());
    }

    #[test]
    fn range_request_against_fresh_hit_splices_partial_content() {
        let fsm = fsm();
        let now = Utc::now();
        fsm.cache.put(
            "/a",
            CachedObject {
                request: get_request(),
                response: {
                    let mut r = HttpHeader::new_response(200, "OK", (1, 1));
                    r.set("cache-control", "max-age=3600");
                    r.set("content-length", "10");
                    r.set("content-type", "text/plain");
                    r
                },
                request_sent_time: now,
                response_received_time: now,
                object_size: 10,
                stored_at: now,
                body: bytes::Bytes::from_static(b"0123456789"),
            },
        );

        let mut state = state_with_request();
        state.client_request.as_mut().unwrap().set("range", "bytes=2-4");
        fsm.handle_request(&mut state);
        fsm.cache_lookup(&mut state);

        assert_eq!(fsm.cache_open_read_hit(&mut state), NextAction::SendResponse);
        assert_eq!(state.source, Source::Transform);
        let response = state.client_response.as_ref().unwrap();
        assert_eq!(response.status(), Some(206));
        assert_eq!(response.get("content-range"), Some("bytes 2-4/10"));
        assert_eq!(state.internal_response_body.as_deref(), Some(&b"234"[..]));
    }

    #[tokio::test]
    async fn connect_upstream_picks_origin_when_no_parents_configured() {
        let fsm = fsm();
        let mut state = state_with_request();
        assert_eq!(fsm.connect_upstream(&mut state, origin_addr()).await, NextAction::ConnectUpstream);
        assert_eq!(state.server.addr, Some(origin_addr()));
    }

    #[tokio::test]
    async fn connect_failure_fails_over_to_origin_after_parent_exhausted() {
        let mut fsm = fsm();
        fsm.parents = vec![ParentProxy {
            name: "p1".to_string(),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)), 3128),
        }];
        fsm.records.parent_per_parent_connect_attempts = 1;
        fsm.records.connect_attempts_max_retries = 1;
        fsm.records.parent_total_connect_attempts = 10;

        let mut state = state_with_request();
        assert_eq!(fsm.connect_upstream(&mut state, origin_addr()).await, NextAction::ConnectUpstream);
        assert_eq!(state.server.addr.unwrap().port(), 3128);

        assert_eq!(fsm.handle_connect_failure(&mut state, false).await, NextAction::ConnectUpstream);
        assert_eq!(state.server.addr, Some(origin_addr()));
    }

    #[tokio::test]
    async fn connect_failure_gives_up_once_every_candidate_exhausted() {
        let fsm = fsm();
        let mut state = state_with_request();
        fsm.connect_upstream(&mut state, origin_addr()).await;
        let mut last = fsm.handle_connect_failure(&mut state, true).await;
        for _ in 0..5 {
            if matches!(last, NextAction::ErrorResponse(502, _)) {
                break;
            }
            last = fsm.handle_connect_failure(&mut state, true).await;
        }
        assert_eq!(last, NextAction::ErrorResponse(502, ConnectionPlanner::failed_connect_tag()));
    }

    #[test]
    fn denied_method_short_circuits_before_cache_lookup() {
        let fsm = fsm();
        let mut state = state_with_request();
        state.acl = Acl::deny_all();
        assert_eq!(fsm.handle_request(&mut state), NextAction::ErrorResponse(403, "access#denied"));
    }

    #[test]
    fn missing_host_is_rejected_before_acl_check() {
        let fsm = fsm();
        let mut state = state_with_request();
        state.client_request.as_mut().unwrap().remove("host");
        assert_eq!(
            fsm.handle_request(&mut state),
            NextAction::ErrorResponse(400, "request#no_host")
        );
    }

    #[test]
    fn trace_with_max_forwards_zero_echoes_request() {
        let fsm = fsm();
        let mut state = state_with_request();
        let req = state.client_request.as_mut().unwrap();
        *req = HttpHeader::new_request(Method::parse("TRACE"), Url::new(Scheme::Http, "example.test", "/a"), (1, 1));
        req.set("host", "example.test");
        req.set("max-forwards", "0");

        assert_eq!(fsm.handle_request(&mut state), NextAction::SendResponse);
        assert_eq!(state.source, Source::Internal);
        let body = state.internal_response_body.as_ref().unwrap();
        assert!(body.starts_with(b"TRACE /a HTTP/1.1\r\n"));
        assert!(String::from_utf8_lossy(body).contains("max-forwards: 0"));
    }

    #[test]
    fn options_with_max_forwards_zero_lists_allowed_methods() {
        let fsm = fsm();
        let mut state = state_with_request();
        let req = state.client_request.as_mut().unwrap();
        *req = HttpHeader::new_request(Method::parse("OPTIONS"), Url::new(Scheme::Http, "example.test", "/a"), (1, 1));
        req.set("host", "example.test");
        req.set("max-forwards", "0");

        assert_eq!(fsm.handle_request(&mut state), NextAction::SendResponse);
        assert_eq!(state.source, Source::Internal);
        let allow = state.client_response.as_ref().unwrap().get("allow").unwrap();
        assert!(allow.contains("GET"));
        assert!(allow.contains("OPTIONS"));
    }

    #[test]
    fn oversized_post_is_rejected() {
        let mut fsm = fsm();
        fsm.records.max_post_size = 10;
        let mut state = state_with_request();
        let req = state.client_request.as_mut().unwrap();
        *req = HttpHeader::new_request(Method::parse("POST"), Url::new(Scheme::Http, "example.test", "/a"), (1, 1));
        req.set("host", "example.test");
        req.set("content-length", "100");

        assert_eq!(
            fsm.handle_request(&mut state),
            NextAction::ErrorResponse(413, "request#post_too_large")
        );
    }

    #[test]
    fn expect_100_continue_rejected_when_disabled() {
        let mut fsm = fsm();
        fsm.records.expect_100_continue_enabled = false;
        let mut state = state_with_request();
        state.client_request.as_mut().unwrap().set("expect", "100-continue");

        assert_eq!(
            fsm.handle_request(&mut state),
            NextAction::ErrorResponse(405, "request#expect_continue_disabled")
        );
    }

    #[test]
    fn websocket_upgrade_respects_max_concurrency() {
        let mut fsm = fsm();
        fsm.records.websocket_max_concurrency = 1;

        let mut first = state_with_request();
        let req = first.client_request.as_mut().unwrap();
        req.set("upgrade", "websocket");
        req.set("connection", "Upgrade");
        assert_eq!(fsm.handle_request(&mut first), NextAction::ConnectUpstream);

        let mut second = state_with_request();
        let req = second.client_request.as_mut().unwrap();
        req.set("upgrade", "websocket");
        req.set("connection", "Upgrade");
        assert_eq!(
            fsm.handle_request(&mut second),
            NextAction::ErrorResponse(503, "request#websocket_concurrency_exceeded")
        );

        fsm.release_websocket_slot();
        assert_eq!(fsm.handle_request(&mut second), NextAction::ConnectUpstream);
    }

    #[test]
    fn internal_host_serves_stats_page() {
        let fsm = fsm();
        let mut state = state_with_request();
        let req = state.client_request.as_mut().unwrap();
        *req = HttpHeader::new_request(Method::parse("GET"), Url::new(Scheme::Http, "$internal$", "/stats"), (1, 1));
        req.set("host", "$internal$");

        assert_eq!(fsm.handle_request(&mut state), NextAction::SendResponse);
        assert_eq!(state.source, Source::Internal);
        assert!(state.internal_response_body.is_some());
    }

    #[test]
    fn via_header_appended_when_enabled() {
        let mut fsm = fsm();
        fsm.records.insert_response_via_str = 1;
        let mut state = state_with_request();

        assert_eq!(fsm.handle_request(&mut state), NextAction::CacheLookup);
        assert_eq!(fsm.cache_lookup(&mut state), NextAction::CacheOpenReadMiss);
        assert_eq!(fsm.cache_open_read_miss(&mut state), NextAction::ConnectUpstream);

        let mut response = HttpHeader::new_response(200, "OK", (1, 1));
        response.set("cache-control", "max-age=60");
        state.server_response = Some(response);

        assert_eq!(fsm.handle_response(&mut state), NextAction::SendResponse);
        let via = state.client_response.as_ref().unwrap().get("via").unwrap();
        assert!(via.contains(&fsm.process_id.to_string()));
    }
}
