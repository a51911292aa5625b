//! Pre-warmed outbound connection pool: maintains, per destination,
//! connections at various stages of establishment so a transaction can
//! `borrow` an already-open one instead of paying connect/handshake latency
//! inline on the request path.
//!
//! The periodic-tick/background-service shape follows
//! `proxy::upstream::ProxyUpstream::start_health_check` elsewhere in this
//! crate (`background_service` + `pingora_runtime::Runtime`, `watch`
//! shutdown). Actual DNS resolution and TLS/TCP handshaking are out of
//! scope for this module; they're represented by the [`PreWarmConnector`]
//! capability, the same way `CacheStore` stands in for real cache storage.

pub mod algorithm;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use tokio::sync::Mutex;

pub use algorithm::Algorithm;

use crate::error::LoomError;

/// A pre-warm target: an origin host/port plus the negotiated ALPN
/// protocol id, so HTTP/1 and HTTP/2 pools to the same host stay separate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreWarmDst {
    pub host: String,
    pub port: u16,
    pub alpn_id: u16,
}

/// An established, idle connection handle. Wire-level I/O on it is out of
/// scope here; this is the bookkeeping handle a transaction takes
/// ownership of via [`PreWarmPool::borrow`].
#[derive(Debug)]
pub struct NetVc {
    pub id: u64,
}

/// Capability used to actually resolve and connect. Kept as a trait so
/// tests can supply a fake without touching real sockets or DNS.
#[async_trait]
pub trait PreWarmConnector: Send + Sync {
    async fn resolve_and_connect(&self, dst: &PreWarmDst) -> Result<NetVc, LoomError>;
}

/// Resolves via the shared `hickory-resolver` instance (same one
/// `proxy::discovery::DnsDiscovery` uses) and opens a plain TCP connection
/// to the first address returned. The socket is then dropped: `NetVc` is a
/// bookkeeping handle, not a live connection, so this connector's only job
/// is to prove the destination is currently reachable before the pool
/// counts it as `Open`.
pub struct DnsTcpConnector {
    resolver: Arc<hickory_resolver::TokioAsyncResolver>,
    next_id: std::sync::atomic::AtomicU64,
}

impl DnsTcpConnector {
    pub fn new(resolver: Arc<hickory_resolver::TokioAsyncResolver>) -> Self {
        Self { resolver, next_id: std::sync::atomic::AtomicU64::new(1) }
    }
}

#[async_trait]
impl PreWarmConnector for DnsTcpConnector {
    async fn resolve_and_connect(&self, dst: &PreWarmDst) -> Result<NetVc, LoomError> {
        let ip = self
            .resolver
            .lookup_ip(dst.host.as_str())
            .await
            .map_err(|e| LoomError::config(format!("dns lookup failed for {}: {e}", dst.host)))?
            .iter()
            .next()
            .ok_or_else(|| LoomError::config(format!("no addresses for {}", dst.host)))?;

        tokio::net::TcpStream::connect((ip, dst.port))
            .await
            .map_err(|e| LoomError::config(format!("connect to {}:{} failed: {e}", dst.host, dst.port)))?;

        Ok(NetVc { id: self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmState {
    Init,
    DnsLookup,
    Open,
    Closed,
}

struct PreWarmSm {
    state: SmState,
    retry_count: u32,
    last_transition: Instant,
    netvc: Option<NetVc>,
}

impl PreWarmSm {
    fn new() -> Self {
        Self { state: SmState::Init, retry_count: 0, last_transition: Instant::now(), netvc: None }
    }

    fn transition(&mut self, state: SmState) {
        self.state = state;
        self.last_transition = Instant::now();
    }
}

/// Per-destination bookkeeping: SMs not yet fully connected (`init_list`)
/// and idle, fully handshaken connections (`open_list`).
#[derive(Default)]
struct DstPool {
    init_list: Vec<PreWarmSm>,
    open_list: Vec<PreWarmSm>,
}

impl DstPool {
    fn open_count(&self) -> u32 {
        self.open_list.len() as u32
    }
}

#[derive(Default)]
struct DstStats {
    hit: u32,
    miss: u32,
}

#[derive(Debug, Clone)]
pub struct PreWarmPoolConfig {
    pub algorithm: Algorithm,
    pub min: u32,
    pub max: Option<u32>,
    pub rate: f64,
    pub max_retries: u32,
    pub tick_interval: Duration,
    /// Connections idle longer than this are dropped at the next tick; the
    /// sizing algorithm naturally re-opens the room this frees up.
    pub max_idle: Duration,
}

impl Default for PreWarmPoolConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::V1,
            min: 0,
            max: None,
            rate: 1.0,
            max_retries: 3,
            tick_interval: Duration::from_secs(1),
            max_idle: Duration::from_secs(60),
        }
    }
}

/// The pool: one [`DstPool`] plus hit/miss counters per [`PreWarmDst`],
/// guarded by a single async mutex. A production deployment would shard
/// this per worker thread; this reference implementation keeps one shared
/// instance, which is what the transaction state machine and its tests
/// drive against.
pub struct PreWarmPool {
    config: PreWarmPoolConfig,
    connector: Arc<dyn PreWarmConnector>,
    dsts: Mutex<HashMap<PreWarmDst, (DstPool, DstStats)>>,
}

impl PreWarmPool {
    pub fn new(config: PreWarmPoolConfig, connector: Arc<dyn PreWarmConnector>) -> Self {
        Self { config, connector, dsts: Mutex::new(HashMap::new()) }
    }

    /// Removes and returns one open, idle connection for `dst`. A hit is
    /// counted and does not trigger any top-up. A miss is counted and, for
    /// `Algorithm::V2`, immediately starts a replacement SM if the
    /// configured ceiling allows it; V1 only tops up on the periodic tick.
    pub async fn borrow(&self, dst: &PreWarmDst) -> Option<NetVc> {
        let should_start_now = {
            let mut dsts = self.dsts.lock().await;
            let entry = dsts.entry(dst.clone()).or_default();
            if let Some(mut sm) = entry.0.open_list.pop() {
                entry.1.hit += 1;
                return sm.netvc.take();
            }
            entry.1.miss += 1;
            let current = entry.0.open_count() + entry.0.init_list.len() as u32;
            let room = self.config.max.map(|max| current < max).unwrap_or(true);
            self.config.algorithm == Algorithm::V2 && room
        };

        if should_start_now {
            self.start_sm(dst).await;
        }
        None
    }

    /// One sizing tick for `dst`: evicts stale idle connections, computes
    /// how many new SMs to start via the configured algorithm, and kicks
    /// them off through the connector.
    async fn tick_dst(&self, dst: &PreWarmDst) {
        let to_start = {
            let mut dsts = self.dsts.lock().await;
            let entry = dsts.entry(dst.clone()).or_default();

            entry.0.init_list.retain(|sm| sm.state != SmState::Closed);
            let max_idle = self.config.max_idle;
            entry.0.open_list.retain(|sm| sm.last_transition.elapsed() < max_idle);

            let current = entry.0.open_count();
            let n = match self.config.algorithm {
                Algorithm::V1 => algorithm::size_v1(self.config.min, current, self.config.min, self.config.max),
                Algorithm::V2 => algorithm::size_v2(
                    entry.1.hit,
                    entry.1.miss,
                    current,
                    self.config.min,
                    self.config.max,
                    self.config.rate,
                ),
            };
            entry.1.hit = 0;
            entry.1.miss = 0;
            n
        };

        for _ in 0..to_start {
            self.start_sm(dst).await;
        }
    }

    async fn start_sm(&self, dst: &PreWarmDst) {
        let mut sm = PreWarmSm::new();
        sm.transition(SmState::DnsLookup);
        match self.connector.resolve_and_connect(dst).await {
            Ok(netvc) => {
                sm.netvc = Some(netvc);
                sm.transition(SmState::Open);
                let mut dsts = self.dsts.lock().await;
                dsts.entry(dst.clone()).or_default().0.open_list.push(sm);
            }
            Err(_) => {
                sm.retry_count += 1;
                if sm.retry_count >= self.config.max_retries {
                    sm.transition(SmState::Closed);
                    // Dropped here: a `Closed` SM never re-enters a list,
                    // so the pool never stalls waiting on it.
                } else {
                    sm.transition(SmState::Init);
                    let mut dsts = self.dsts.lock().await;
                    dsts.entry(dst.clone()).or_default().0.init_list.push(sm);
                }
            }
        }
    }

    /// Runs one sizing tick across every destination currently tracked.
    pub async fn tick_all(&self) {
        let dsts: Vec<PreWarmDst> = self.dsts.lock().await.keys().cloned().collect();
        for dst in dsts {
            self.tick_dst(&dst).await;
        }
    }

    /// Ensures `dst` is tracked (so the next tick sizes it), used when a
    /// route first references a destination that hasn't been borrowed
    /// from yet.
    pub async fn touch(&self, dst: &PreWarmDst) {
        self.dsts.lock().await.entry(dst.clone()).or_default();
    }
}

#[async_trait]
impl BackgroundService for PreWarmPool {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_all().await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct AlwaysConnects {
        next_id: AtomicU64,
        calls: AtomicUsize,
    }

    impl AlwaysConnects {
        fn new() -> Self {
            Self { next_id: AtomicU64::new(1), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl PreWarmConnector for AlwaysConnects {
        async fn resolve_and_connect(&self, _dst: &PreWarmDst) -> Result<NetVc, LoomError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(NetVc { id: self.next_id.fetch_add(1, Ordering::SeqCst) })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl PreWarmConnector for AlwaysFails {
        async fn resolve_and_connect(&self, _dst: &PreWarmDst) -> Result<NetVc, LoomError> {
            Err(LoomError::config("simulated connect failure"))
        }
    }

    fn dst() -> PreWarmDst {
        PreWarmDst { host: "origin.test".to_string(), port: 443, alpn_id: 2 }
    }

    #[tokio::test]
    async fn borrow_on_empty_pool_misses() {
        let pool = PreWarmPool::new(PreWarmPoolConfig::default(), Arc::new(AlwaysConnects::new()));
        assert!(pool.borrow(&dst()).await.is_none());
    }

    #[tokio::test]
    async fn tick_fills_pool_to_min_with_v1() {
        let config = PreWarmPoolConfig { algorithm: Algorithm::V1, min: 3, ..Default::default() };
        let pool = PreWarmPool::new(config, Arc::new(AlwaysConnects::new()));
        pool.touch(&dst()).await;
        pool.tick_all().await;

        let mut borrowed = Vec::new();
        while let Some(vc) = pool.borrow(&dst()).await {
            borrowed.push(vc);
        }
        assert_eq!(borrowed.len(), 3);
    }

    #[tokio::test]
    async fn borrow_never_hands_out_same_connection_twice() {
        let config = PreWarmPoolConfig { algorithm: Algorithm::V1, min: 2, ..Default::default() };
        let pool = PreWarmPool::new(config, Arc::new(AlwaysConnects::new()));
        pool.touch(&dst()).await;
        pool.tick_all().await;

        let a = pool.borrow(&dst()).await.unwrap();
        let b = pool.borrow(&dst()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(pool.borrow(&dst()).await.is_none());
    }

    #[tokio::test]
    async fn v2_event_path_tops_up_on_miss() {
        let connector = Arc::new(AlwaysConnects::new());
        let config = PreWarmPoolConfig { algorithm: Algorithm::V2, min: 0, max: Some(5), ..Default::default() };
        let pool = PreWarmPool::new(config, connector.clone());

        // First borrow misses and, under V2, immediately starts one SM.
        assert!(pool.borrow(&dst()).await.is_none());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_close_without_stalling() {
        let config = PreWarmPoolConfig { algorithm: Algorithm::V1, min: 1, max_retries: 1, ..Default::default() };
        let pool = PreWarmPool::new(config, Arc::new(AlwaysFails));
        pool.touch(&dst()).await;
        pool.tick_all().await;
        // Failing SM is closed, not retried forever; pool stays empty but responsive.
        assert!(pool.borrow(&dst()).await.is_none());
    }
}
