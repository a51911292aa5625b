//! Per-transaction state.
//!
//! Flattened into plain Rust structs instead of one God object:
//! client/server/cached/transform headers, cache disposition, parent/DNS
//! info, and the redirect/keep-alive bookkeeping the FSM consults at each
//! step.

use std::net::SocketAddr;
use std::time::Instant;

use uuid::Uuid;

use crate::cache::CachedObject;
use crate::header::HttpHeader;
use crate::ip_allow::Acl;
use crate::planner::ConnectionPlanner;
use crate::prewarm::NetVc;

/// Which collaborator most recently produced the response currently in
/// flight to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    None,
    Origin,
    Cache,
    Transform,
    Internal,
}

/// What the transaction intends to do with the cache for this request.
///
/// `PrepareToWrite`/`PrepareToUpdate` are provisional: nothing is
/// committed to storage until the upstream response actually arrives and
/// its cacheability is known, at which point they resolve down to a
/// final action (`Write`/`NoAction`, or `Replace`/`Delete`/`Update`/
/// `NoAction` respectively).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// No decision made yet, or the final decision was to do nothing.
    NoAction,
    /// About to perform the initial cache lookup.
    Lookup,
    /// Serve the response straight from `cached_object`.
    Serve,
    /// Remove a stored object (it is being replaced or found uncacheable).
    Delete,
    /// A stale object's full body is being replaced by a new upstream
    /// response.
    Replace,
    /// A stale object's metadata is being refreshed from a 304.
    Update,
    /// Store a new object from a cache-miss upstream response.
    Write,
    /// Served from cache, and the stored object will also be deleted.
    ServeAndDelete,
    /// Served from cache, and the stored object will also be updated.
    ServeAndUpdate,
    /// Revalidation is in flight; deletion is provisional on the
    /// response's cacheability.
    PrepareToDelete,
    /// Revalidation is in flight; the final disposition (`Update`,
    /// `Replace`, or `Delete`) depends on the response that arrives.
    PrepareToUpdate,
    /// A cache-miss write is in flight; whether it actually commits
    /// depends on the response's cacheability.
    PrepareToWrite,
}

/// Write-lock disposition for a cache miss. The storage engine itself is
/// external; this only tracks who gets to originate the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWriteLock {
    NotApplicable,
    /// This transaction acquired the lock and will write the object.
    Holder,
    /// Another transaction holds the lock; this one should read-retry
    /// rather than stampede the origin.
    ReadRetry,
}

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct ParentInfo {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DnsInfo {
    pub resolved: Vec<SocketAddr>,
}

/// The driver's next instruction to the caller. Distinct from the
/// error-tag strings used in responses — this is purely the control-flow
/// signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    HandleRequest,
    DnsLookup,
    ConnectUpstream,
    CacheLookup,
    CacheOpenReadHit,
    CacheOpenReadMiss,
    HandleResponse,
    SendResponse,
    Done,
    /// Terminate with a synthesized error response: status, body-factory tag.
    ErrorResponse(u16, &'static str),
}

/// The full per-request state threaded through `TransactionFsm::advance`.
pub struct TransactionState {
    pub id: Uuid,
    pub client_request: Option<HttpHeader>,
    pub server_request: Option<HttpHeader>,
    pub server_response: Option<HttpHeader>,
    pub client_response: Option<HttpHeader>,
    pub cached_object: Option<CachedObject>,
    pub cache_action: CacheAction,
    pub cache_write_lock: CacheWriteLock,
    pub source: Source,
    pub client: ClientInfo,
    pub server: ServerInfo,
    pub parent: ParentInfo,
    pub dns: DnsInfo,
    pub acl: Acl,
    pub redirect_count: u32,
    pub start: Instant,
    pub keep_alive: bool,
    pub is_websocket: bool,
    pub cache_key: Option<String>,
    /// Body bytes for a response the FSM assembled itself, rather than one
    /// streamed from the cache store or the origin wholesale: the stats
    /// page, a `TRACE` echo, or the output of a `RangeTransform` spliced
    /// onto a cache hit (wire streaming of that body stays out of scope
    /// for this module, see module docs).
    pub internal_response_body: Option<bytes::Bytes>,
    /// Per-request upstream connection plan, built once the first
    /// `ConnectUpstream` step is reached. `None` before that point.
    pub planner: Option<ConnectionPlanner>,
    /// A connection handle borrowed from the pre-warm pool for the
    /// currently planned target, if one was available.
    pub borrowed_netvc: Option<NetVc>,
}

impl TransactionState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            client_request: None,
            server_request: None,
            server_response: None,
            client_response: None,
            cached_object: None,
            cache_action: CacheAction::NoAction,
            cache_write_lock: CacheWriteLock::NotApplicable,
            source: Source::None,
            client: ClientInfo::default(),
            server: ServerInfo::default(),
            parent: ParentInfo::default(),
            dns: DnsInfo::default(),
            acl: Acl::deny_all(),
            redirect_count: 0,
            start: Instant::now(),
            keep_alive: true,
            is_websocket: false,
            cache_key: None,
            internal_response_body: None,
            planner: None,
            borrowed_netvc: None,
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}
