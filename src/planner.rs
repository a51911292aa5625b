//! Upstream connection planning and parent-proxy failover.
//!
//! Builds on the backend-selection/retry plumbing elsewhere in this crate
//! (`proxy::upstream::ProxyUpstream::select_backend`,
//! `service::http::HttpService::fail_to_connect`), generalized from "retry
//! the same upstream group" to "walk an ordered parent-proxy chain, falling
//! back to the origin." The parent-down table follows the same shared
//! mutable registry idiom used there (`DashMap` behind a struct, see
//! `proxy::route::ROUTE_MAP`) rather than per-host bookkeeping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RecordsConfig;
use crate::header::Method;
use crate::stats;

/// One configured parent proxy, tried in list order before falling back to
/// the origin (or failing outright, depending on config).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentProxy {
    pub name: String,
    pub address: SocketAddr,
}

/// Where the planner currently intends to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Parent(ParentProxy),
    Origin(SocketAddr),
}

/// What the caller should do after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Try the same target again (it may have been a transient failure and
    /// this attempt is still within its per-target budget).
    RetrySameTarget,
    /// Move on to the next candidate (next parent, or the origin).
    Failover,
    /// No candidates left; emit a gateway failure to the client.
    GiveUp,
}

/// Per-request planning state: which parents/origin remain to try and how
/// many attempts have been spent on the current one.
pub struct ConnectionPlanner {
    config: RecordsConfig,
    parents: Vec<ParentProxy>,
    origin: SocketAddr,
    parent_down: Arc<ParentDownTable>,
    next_parent_index: usize,
    current: Option<Target>,
    attempts_on_current: u32,
    total_attempts: u32,
    bytes_sent_to_current: u64,
}

impl ConnectionPlanner {
    pub fn new(
        config: RecordsConfig,
        parents: Vec<ParentProxy>,
        origin: SocketAddr,
        parent_down: Arc<ParentDownTable>,
    ) -> Self {
        Self {
            config,
            parents,
            origin,
            parent_down,
            next_parent_index: 0,
            current: None,
            attempts_on_current: 0,
            total_attempts: 0,
            bytes_sent_to_current: 0,
        }
    }

    /// Picks the next candidate to connect to, skipping parents currently
    /// marked down, and records it as `current`. Returns `None` once every
    /// parent has been exhausted and direct-to-origin is not permitted.
    pub fn find_server_and_update_current_info(&mut self) -> Option<Target> {
        while self.next_parent_index < self.parents.len() {
            let candidate = self.parents[self.next_parent_index].clone();
            self.next_parent_index += 1;
            if self.parent_down.is_down(&candidate.name) {
                continue;
            }
            self.attempts_on_current = 0;
            self.bytes_sent_to_current = 0;
            let target = Target::Parent(candidate);
            self.current = Some(target.clone());
            return Some(target);
        }

        if self.next_parent_index == self.parents.len() {
            // All configured parents exhausted (or none configured).
            let all_parents_down = !self.parents.is_empty()
                && self.parents.iter().all(|p| self.parent_down.is_down(&p.name));
            if !self.parents.is_empty() && all_parents_down && !self.config.go_direct_if_parent_dead
            {
                return None;
            }
            // Only fall through to origin once (guarded by bumping the index
            // past the parent list so repeated calls don't loop forever).
            self.next_parent_index += 1;
            self.attempts_on_current = 0;
            self.bytes_sent_to_current = 0;
            let target = Target::Origin(self.origin);
            self.current = Some(target.clone());
            return Some(target);
        }

        None
    }

    pub fn note_bytes_sent(&mut self, n: u64) {
        self.bytes_sent_to_current += n;
    }

    /// The candidate currently selected by the last
    /// `find_server_and_update_current_info` call, if any.
    pub fn current_target(&self) -> Option<&Target> {
        self.current.as_ref()
    }

    /// A failed attempt is retryable without failing over when the request
    /// is idempotent-safe or no request bytes have reached the peer yet.
    fn is_retryable(&self, method: &Method) -> bool {
        method.is_safe() || self.bytes_sent_to_current == 0
    }

    /// Called after a connect/send failure against `current`. Decides
    /// whether to retry the same target, fail over to the next candidate,
    /// or give up, and updates the parent-down table when a parent is
    /// being abandoned.
    pub fn on_connect_failure(&mut self, method: &Method, dead_server: bool) -> RetryDisposition {
        self.attempts_on_current += 1;
        self.total_attempts += 1;

        let per_target_limit = match &self.current {
            Some(Target::Parent(_)) => self.config.parent_per_parent_connect_attempts,
            _ => self.config.connect_attempts_max_retries,
        };
        let retry_limit = if dead_server {
            self.config.connect_attempts_max_retries_dead_server
        } else {
            per_target_limit
        };

        if let Some(Target::Parent(parent)) = &self.current {
            if self.attempts_on_current >= self.config.parent_per_parent_connect_attempts {
                self.parent_down.mark_down(
                    &parent.name,
                    Duration::from_secs(self.config.parent_down_seconds),
                );
                stats::PARENT_MARKED_DOWN.inc();
            }
        }

        if self.is_retryable(method)
            && self.attempts_on_current < retry_limit
            && self.total_attempts < self.config.parent_total_connect_attempts.max(retry_limit)
        {
            return RetryDisposition::RetrySameTarget;
        }

        let exhausted_parents = self.next_parent_index >= self.parents.len() + 1;
        if exhausted_parents {
            return RetryDisposition::GiveUp;
        }
        stats::PARENT_SWITCHES.inc();
        RetryDisposition::Failover
    }

    /// Body-factory tag used for the 502 response emitted once every
    /// candidate has failed.
    pub fn failed_connect_tag() -> &'static str {
        "connect#failed_connect"
    }
}

/// Tracks parents temporarily removed from rotation after repeated connect
/// failures, shared across all `ConnectionPlanner`s for a given route.
#[derive(Default)]
pub struct ParentDownTable {
    down_until: DashMap<String, Instant>,
}

impl ParentDownTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_down(&self, parent: &str, for_how_long: Duration) {
        self.down_until.insert(parent.to_string(), Instant::now() + for_how_long);
    }

    pub fn is_down(&self, parent: &str) -> bool {
        match self.down_until.get(parent) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                self.down_until.remove(parent);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn origin() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 80)
    }

    fn parent(name: &str, port: u16) -> ParentProxy {
        ParentProxy {
            name: name.to_string(),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)), port),
        }
    }

    #[test]
    fn walks_parents_then_origin() {
        let table = Arc::new(ParentDownTable::new());
        let mut planner = ConnectionPlanner::new(
            RecordsConfig::default(),
            vec![parent("p1", 3128), parent("p2", 3129)],
            origin(),
            table,
        );

        assert_eq!(
            planner.find_server_and_update_current_info(),
            Some(Target::Parent(parent("p1", 3128)))
        );
        assert_eq!(
            planner.find_server_and_update_current_info(),
            Some(Target::Parent(parent("p2", 3129)))
        );
        assert_eq!(
            planner.find_server_and_update_current_info(),
            Some(Target::Origin(origin()))
        );
        assert_eq!(planner.find_server_and_update_current_info(), None);
    }

    #[test]
    fn dead_parent_is_skipped_after_markdown() {
        let table = Arc::new(ParentDownTable::new());
        table.mark_down("p1", Duration::from_secs(60));
        let mut planner = ConnectionPlanner::new(
            RecordsConfig::default(),
            vec![parent("p1", 3128), parent("p2", 3129)],
            origin(),
            table,
        );

        assert_eq!(
            planner.find_server_and_update_current_info(),
            Some(Target::Parent(parent("p2", 3129)))
        );
    }

    #[test]
    fn safe_method_is_retryable_even_with_bytes_sent() {
        let table = Arc::new(ParentDownTable::new());
        let mut planner =
            ConnectionPlanner::new(RecordsConfig::default(), vec![], origin(), table);
        planner.find_server_and_update_current_info();
        planner.note_bytes_sent(128);
        let disposition = planner.on_connect_failure(&Method::parse("GET"), false);
        assert_eq!(disposition, RetryDisposition::RetrySameTarget);
    }

    #[test]
    fn no_candidates_left_gives_up() {
        let table = Arc::new(ParentDownTable::new());
        let mut planner =
            ConnectionPlanner::new(RecordsConfig::default(), vec![], origin(), table);
        planner.find_server_and_update_current_info();
        for _ in 0..10 {
            let d = planner.on_connect_failure(&Method::parse("POST"), true);
            if d == RetryDisposition::GiveUp {
                return;
            }
        }
        panic!("expected planner to give up eventually");
    }
}
