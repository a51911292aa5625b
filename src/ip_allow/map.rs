//! Longest-prefix IP range map, unifying IPv4 and IPv6 behind `IpNetwork`.
//!
//! A patricia-style radix tree is the classic structure for this job, but
//! `ipnetwork` has no radix map of its own, so overlap resolution here is a
//! linear scan picking the most specific (longest-prefix) match, breaking
//! ties by latest insertion — the same overlap rule a radix tree would give.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;

use super::Record;

#[derive(Debug, Default)]
pub struct IpMap {
    entries: Vec<(IpNetwork, Arc<Record>)>,
}

impl IpMap {
    pub fn insert(&mut self, network: IpNetwork, record: Arc<Record>) {
        self.entries.push((network, record));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the record for the most specific network containing `addr`,
    /// or `None` if no entry matches.
    pub fn lookup(&self, addr: IpAddr) -> Option<Arc<Record>> {
        let mut best: Option<(u8, usize)> = None;
        for (idx, (network, _)) in self.entries.iter().enumerate() {
            if !network.contains(addr) {
                continue;
            }
            let prefix = network.prefix();
            let is_better = match best {
                None => true,
                Some((best_prefix, best_idx)) => {
                    prefix > best_prefix || (prefix == best_prefix && idx > best_idx)
                }
            };
            if is_better {
                best = Some((prefix, idx));
            }
        }
        best.map(|(_, idx)| self.entries[idx].1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut map = IpMap::default();
        map.insert("10.0.0.0/8".parse().unwrap(), Arc::new(Record { source_line: 1, ..Record::deny_all() }));
        map.insert("10.1.0.0/16".parse().unwrap(), Arc::new(Record { source_line: 2, ..Record::allow_all() }));

        let record = map.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(record.source_line, 2);
    }

    #[test]
    fn later_insertion_wins_on_tie() {
        let mut map = IpMap::default();
        map.insert("10.0.0.0/8".parse().unwrap(), Arc::new(Record { source_line: 1, ..Record::deny_all() }));
        map.insert("10.0.0.0/8".parse().unwrap(), Arc::new(Record { source_line: 2, ..Record::allow_all() }));

        let record = map.lookup("10.5.5.5".parse().unwrap()).unwrap();
        assert_eq!(record.source_line, 2);
    }

    #[test]
    fn no_match_returns_none() {
        let map = IpMap::default();
        assert!(map.lookup("192.168.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn ipv6_supported_alongside_ipv4() {
        let mut map = IpMap::default();
        map.insert("2001:db8::/32".parse().unwrap(), Arc::new(Record::allow_all()));
        assert!(map.lookup("2001:db8::1".parse().unwrap()).is_some());
        assert!(map.lookup("10.0.0.1".parse().unwrap()).is_none());
    }
}
