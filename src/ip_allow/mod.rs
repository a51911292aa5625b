//! Per-address allow/deny of HTTP methods.
//!
//! `Record` is the POD access-control entry, `Acl` is the ref-counted handle
//! a transaction holds for the lifetime of a request, and `IpMap` is the
//! longest-prefix address range map behind the two directions
//! (source/destination). Config hot-reload follows the pattern used
//! elsewhere in this crate of swapping a shared registry under `ArcSwap`
//! (see `proxy::route::ROUTE_MAP`), rather than manual acquire/release
//! counting — Rust's `Arc` already gives us that for free.

mod config;
mod map;

pub use config::{load_legacy, load_yaml, IpAllowBuild};
pub use map::IpMap;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

use crate::header::{WksMethod, ALL_METHOD_MASK};

/// An access control record: the methods permitted (as a well-known-method
/// bitmask plus a nonstandard-method name list) and the config source line
/// it came from, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct Record {
    pub method_mask: u32,
    pub nonstandard: Vec<String>,
    pub deny_nonstandard: bool,
    pub source_line: u32,
}

impl Record {
    pub fn deny_all() -> Self {
        Self { method_mask: 0, nonstandard: Vec::new(), deny_nonstandard: true, source_line: 0 }
    }

    pub fn allow_all() -> Self {
        Self {
            method_mask: ALL_METHOD_MASK,
            nonstandard: Vec::new(),
            deny_nonstandard: false,
            source_line: 0,
        }
    }

    /// A mask of 0 with no nonstandard methods listed denies everything.
    pub fn is_deny_all(&self) -> bool {
        self.method_mask == 0 && self.nonstandard.is_empty()
    }
}

/// A ref-counted handle to a matched `Record`, held by a transaction for as
/// long as it needs to make allow/deny decisions. `None` means "no match",
/// which is treated as deny-all.
#[derive(Debug, Clone)]
pub struct Acl {
    record: Option<Arc<Record>>,
}

impl Acl {
    pub fn deny_all() -> Self {
        Self { record: None }
    }

    pub fn allow_all() -> Self {
        Self { record: Some(Arc::new(Record::allow_all())) }
    }

    fn from_record(record: Arc<Record>) -> Self {
        Self { record: Some(record) }
    }

    pub fn is_valid(&self) -> bool {
        self.record.is_some()
    }

    pub fn is_deny_all(&self) -> bool {
        match &self.record {
            None => true,
            Some(r) => r.is_deny_all(),
        }
    }

    pub fn is_allow_all(&self) -> bool {
        matches!(&self.record, Some(r) if r.method_mask == ALL_METHOD_MASK)
    }

    pub fn is_method_allowed(&self, method: WksMethod) -> bool {
        match &self.record {
            Some(r) => r.method_mask & method.mask() != 0,
            None => false,
        }
    }

    /// Case-insensitive lookup in the nonstandard list, inverted by
    /// `deny_nonstandard`. An allow-all record permits any nonstandard verb.
    pub fn is_nonstandard_allowed(&self, name: &str) -> bool {
        match &self.record {
            None => false,
            Some(r) => {
                if r.method_mask == ALL_METHOD_MASK {
                    return true;
                }
                let in_set = r.nonstandard.iter().any(|s| s.eq_ignore_ascii_case(name));
                if r.deny_nonstandard {
                    !in_set
                } else {
                    in_set
                }
            }
        }
    }

    pub fn source_line(&self) -> u32 {
        self.record.as_ref().map(|r| r.source_line).unwrap_or(0)
    }
}

/// Which direction a record matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    Src,
    Dst,
}

/// One generation of the access-control configuration: two independent
/// longest-prefix maps, keyed by client address (`src`) and by chosen
/// origin address (`dst`).
#[derive(Debug, Default)]
pub struct IpAllow {
    src_map: IpMap,
    dst_map: IpMap,
}

static ACCEPT_CHECK: AtomicBool = AtomicBool::new(false);

/// Enables or disables the accept-time deny-all shortcut globally,
/// independent of which configuration generation is live. Returns the
/// previous state.
pub fn enable_accept_check(state: bool) -> bool {
    ACCEPT_CHECK.swap(state, Ordering::SeqCst)
}

pub fn is_accept_check_enabled() -> bool {
    ACCEPT_CHECK.load(Ordering::SeqCst)
}

impl IpAllow {
    pub fn new(src_map: IpMap, dst_map: IpMap) -> Self {
        Self { src_map, dst_map }
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Looks up `addr` in the source map. If the matching record denies all
    /// methods and the global accept-check is enabled, the result degrades
    /// to deny-all so the connection can be rejected immediately at accept
    /// time, before any request has been read.
    pub fn match_src(&self, addr: IpAddr) -> Acl {
        let acl = match self.src_map.lookup(addr) {
            Some(record) => Acl::from_record(record),
            None => Acl::deny_all(),
        };
        if acl.is_deny_all() && is_accept_check_enabled() {
            Acl::deny_all()
        } else {
            acl
        }
    }

    /// Looks up `addr` in the destination map. No accept-check shortcut —
    /// remap may still refine the outcome.
    pub fn match_dst(&self, addr: IpAddr) -> Acl {
        match self.dst_map.lookup(addr) {
            Some(record) => Acl::from_record(record),
            None => Acl::deny_all(),
        }
    }
}

/// The live configuration generation, consulted by `ip_restriction` and any
/// other call site that needs an up-to-date `IpAllow` without threading one
/// through every call, the same `ArcSwap`-backed-global idiom as
/// `proxy::route::GLOBAL_MATCH`. Starts deny-all until `reload_global_ip_allow`
/// is called at startup.
static GLOBAL_IP_ALLOW: Lazy<ArcSwap<IpAllow>> =
    Lazy::new(|| ArcSwap::new(Arc::new(IpAllow::deny_all())));

pub fn global_ip_allow_fetch() -> Arc<IpAllow> {
    GLOBAL_IP_ALLOW.load().clone()
}

pub fn reload_global_ip_allow(build: IpAllowBuild) {
    GLOBAL_IP_ALLOW.store(Arc::new(build.build()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn unmatched_address_denies_all() {
        let allow = IpAllow::deny_all();
        let acl = allow.match_src(addr("10.0.0.1"));
        assert!(acl.is_deny_all());
        assert!(!acl.is_method_allowed(WksMethod::Get));
    }

    #[test]
    fn allow_all_permits_any_method() {
        let acl = Acl::allow_all();
        assert!(acl.is_allow_all());
        assert!(acl.is_method_allowed(WksMethod::Purge));
        assert!(acl.is_nonstandard_allowed("PROPFIND"));
    }

    #[test]
    fn nonstandard_deny_inverts_membership() {
        let record = Arc::new(Record {
            method_mask: WksMethod::Get.mask(),
            nonstandard: vec!["PROPFIND".to_string()],
            deny_nonstandard: true,
            source_line: 12,
        });
        let acl = Acl::from_record(record);
        assert!(!acl.is_nonstandard_allowed("PROPFIND"));
        assert!(acl.is_nonstandard_allowed("REPORT"));
        assert_eq!(acl.source_line(), 12);
    }

    #[test]
    fn accept_check_degrades_deny_all_src_match() {
        let mut map = IpMap::default();
        map.insert("10.0.0.0/8".parse().unwrap(), Arc::new(Record::deny_all()));
        let allow = IpAllow::new(map, IpMap::default());

        enable_accept_check(false);
        let acl = allow.match_src(addr("10.1.2.3"));
        assert!(acl.is_deny_all());

        enable_accept_check(true);
        let acl = allow.match_src(addr("10.1.2.3"));
        assert!(acl.is_deny_all());
        enable_accept_check(false);
    }

    #[test]
    fn dst_map_has_no_accept_check_shortcut() {
        let mut map = IpMap::default();
        map.insert(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)).to_string().parse().unwrap(),
            Arc::new(Record::allow_all()),
        );
        let allow = IpAllow::new(IpMap::default(), map);
        let acl = allow.match_dst(addr("192.168.1.0"));
        assert!(acl.is_allow_all());
    }
}
