//! Module for proxy context and resource management.
//!
//! This module defines resource management and the generic
//! `MapOperations` trait for managing resources in a thread-safe map.

pub mod discovery;
pub mod global_rule;
pub mod health_check;
pub mod plugin;
pub mod route;
pub mod service;
pub mod ssl;
pub mod upstream;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use dashmap::DashMap;

use crate::config::Identifiable;
use crate::proxy::plugin::cache::{CacheRevalidateState, CacheWriteState};

/// Per-request state threaded through every proxy filter hook.
///
/// One instance is created per downstream request (`ProxyHttp::new_ctx`) and
/// lives for the lifetime of that transaction.
pub struct ProxyContext {
    /// Route matched for this request, set once routing has run.
    pub route: Option<Arc<route::ProxyRoute>>,
    /// Path/host parameters captured while matching `route`.
    pub route_params: BTreeMap<String, String>,
    /// Merged plugin chain (route + service + global) for this request.
    pub plugin: Arc<plugin::ProxyPluginExecutor>,
    /// Number of upstream connection attempts made so far.
    pub tries: usize,
    /// Wall-clock start of the request, used for latency metrics.
    pub request_start: Instant,
    /// Free-form key/value bag plugins and the proxy core can stash state in.
    pub vars: HashMap<String, String>,
    /// Set by the cache plugin while accumulating an upstream response body
    /// destined for `CacheStore`, carried across `response_filter` and the
    /// body-filter hooks that follow it.
    pub cache_write: Option<CacheWriteState>,
    /// Set by the cache plugin when a stale hit was sent upstream for
    /// revalidation, so `response_filter`/`response_body_filter` can merge a
    /// `304` onto the stored object instead of treating it as a fresh write.
    pub cache_revalidate: Option<CacheRevalidateState>,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            route: None,
            route_params: BTreeMap::new(),
            plugin: Arc::new(plugin::ProxyPluginExecutor::default()),
            tries: 0,
            request_start: Instant::now(),
            vars: HashMap::new(),
            cache_write: None,
            cache_revalidate: None,
        }
    }
}

/// Trait for performing common operations on a map of resources.
///
/// Provides methods to fetch, bulk reload, and insert individual resources.
pub trait MapOperations<T> {
    /// Get a resource by its identifier.
    ///
    /// Returns `Some(Arc<T>)` if found, otherwise logs a warning and returns `None`.
    fn get(&self, id: &str) -> Option<Arc<T>>;

    /// Reload the entire set of resources.
    ///
    /// Removes entries not present in `resources`, and inserts or updates all given resources.
    fn reload_resources(&self, resources: Vec<Arc<T>>);

    /// Insert or update a single resource.
    fn insert_resource(&self, resource: Arc<T>);
}

impl<T> MapOperations<T> for DashMap<String, Arc<T>>
where
    T: Identifiable,
{
    fn get(&self, id: &str) -> Option<Arc<T>> {
        if let Some(entry) = self.get(id) {
            Some(entry.clone())
        } else {
            log::debug!("Resource '{}' not found in cache", id);
            None
        }
    }

    fn reload_resources(&self, resources: Vec<Arc<T>>) {
        // Log incoming resources for debug
        for resource in &resources {
            log::debug!("Reloading resource: {}", resource.id());
        }

        // Build a set of IDs to keep
        let valid_ids: HashSet<String> = resources.iter().map(|r| r.id().to_string()).collect();

        // Remove entries not in the new set
        self.retain(|key, _| valid_ids.contains(key));

        // Insert or update all resources
        for resource in resources {
            let key = resource.id().to_string();
            log::debug!("Inserting or updating resource '{}'", key);
            self.insert(key, resource);
        }
    }

    fn insert_resource(&self, resource: Arc<T>) {
        let key = resource.id();
        log::debug!("Inserting resource '{}'", key);
        self.insert(key.to_string(), resource);
    }
}
