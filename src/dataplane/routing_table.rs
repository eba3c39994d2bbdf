//! The routing information base
//!
//! Routes are keyed by non-overlapping network ranges. RTMP reception
//! inserts and refreshes entries, the ager walks them through
//! Good, Suspect, Bad, and Zombie before removal, and forwarding looks
//! them up by destination network. A single reader-writer lock guards
//! the table; lookups are readers, everything else is a writer.

use crate::port::{same_port, Port};
use crate::protocol::{NetworkRange, STARTUP_NETWORK_MIN};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A route to a network range.
#[derive(Clone)]
pub struct RouteEntry {
    pub extended: bool,
    pub range: NetworkRange,
    /// 0 for directly-connected networks.
    pub distance: u8,
    pub port: Arc<dyn Port>,
    /// 0 when directly connected.
    pub next_network: u16,
    /// 0 when directly connected.
    pub next_node: u8,
}

impl RouteEntry {
    pub fn direct(port: Arc<dyn Port>, range: NetworkRange) -> Self {
        Self {
            extended: port.extended_network(),
            range,
            distance: 0,
            port,
            next_network: 0,
            next_node: 0,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.distance == 0
    }
}

impl PartialEq for RouteEntry {
    fn eq(&self, other: &Self) -> bool {
        self.extended == other.extended
            && self.range == other.range
            && self.distance == other.distance
            && self.next_network == other.next_network
            && self.next_node == other.next_node
            && same_port(&self.port, &other.port)
    }
}

impl Eq for RouteEntry {}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RouteEntry(net {} distance {} via {}.{} on {})",
            self.range,
            self.distance,
            self.next_network,
            self.next_node,
            self.port.short_str()
        )
    }
}

/// Ageing state of a route. Only moves forward, or resets to Good on a
/// refreshing advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Good,
    Suspect,
    Bad,
    /// Advertised as unreachable so neighbors hear of the loss, then
    /// removed on the next ageing pass.
    Zombie,
}

impl RouteState {
    /// Bad and Zombie routes no longer carry traffic.
    pub fn is_bad(&self) -> bool {
        matches!(self, RouteState::Bad | RouteState::Zombie)
    }
}

struct RouteRecord {
    entry: RouteEntry,
    state: RouteState,
}

/// The routing table.
#[derive(Default)]
pub struct RoutingTable {
    // keyed by range.first; ranges never overlap
    records: RwLock<BTreeMap<u16, RouteRecord>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up the route whose range contains `network`. Returns the
    /// entry and whether it is in a bad state.
    pub fn lookup(&self, network: u16) -> Option<(RouteEntry, bool)> {
        let records = self.records.read().unwrap();
        let (_, record) = records.range(..=network).next_back()?;
        if record.entry.range.contains(network) {
            Some((record.entry.clone(), record.state.is_bad()))
        } else {
            None
        }
    }

    fn overlapping_firsts(records: &BTreeMap<u16, RouteRecord>, range: &NetworkRange) -> Vec<u16> {
        records
            .values()
            .filter(|record| record.entry.range.overlaps(range))
            .map(|record| record.entry.range.first)
            .collect()
    }

    /// Consider a learned route for addition. Returns true when the
    /// table was updated (inserted, replaced, or refreshed to Good).
    pub fn consider(&self, entry: RouteEntry) -> bool {
        let mut records = self.records.write().unwrap();

        if let Some(record) = records.get_mut(&entry.range.first) {
            if record.entry == entry {
                record.state = RouteState::Good;
                return true;
            }
        }

        // some routers leak tuples in the transient startup range
        if entry.next_network >= STARTUP_NETWORK_MIN || entry.range.touches_startup_range() {
            return false;
        }

        let overlapping = Self::overlapping_firsts(&records, &entry.range);
        match overlapping.as_slice() {
            [] => {}
            [first] => {
                let current = &records[first];
                if current.entry.range != entry.range {
                    // overlapping but not coincident; nothing sane to do
                    return false;
                }
                // a strictly better route supersedes; an equal-distance
                // route via a different neighbor does not (first wins)
                let replace = entry.distance < current.entry.distance
                    || current.state.is_bad()
                    || (current.entry.next_network == entry.next_network
                        && current.entry.next_node == entry.next_node
                        && same_port(&current.entry.port, &entry.port));
                if !replace {
                    return false;
                }
                records.remove(first);
            }
            _ => return false,
        }

        debug!("adding {:?}", entry);
        records.insert(
            entry.range.first,
            RouteRecord {
                entry,
                state: RouteState::Good,
            },
        );
        true
    }

    /// Mark the route covering `range` as Bad (a neighbor advertised it
    /// unreachable). Returns true when such a route existed.
    pub fn mark_bad(&self, range: NetworkRange) -> bool {
        let mut records = self.records.write().unwrap();
        let overlapping = Self::overlapping_firsts(&records, &range);
        let [first] = overlapping.as_slice() else {
            return false;
        };
        let record = records.get_mut(first).unwrap();
        if !(record.entry.range.first <= range.first && range.last <= record.entry.range.last) {
            return false;
        }
        if record.state != RouteState::Zombie {
            record.state = RouteState::Bad;
        }
        true
    }

    /// One ageing pass. Non-direct routes advance one state; Zombies are
    /// removed and their ranges returned so zone bindings can be dropped.
    pub fn age(&self) -> Vec<NetworkRange> {
        let mut removed = Vec::new();
        let mut records = self.records.write().unwrap();
        let firsts: Vec<u16> = records.keys().copied().collect();
        for first in firsts {
            let record = records.get_mut(&first).unwrap();
            match record.state {
                RouteState::Zombie => {
                    debug!("aging out {:?}", record.entry);
                    removed.push(record.entry.range);
                    records.remove(&first);
                }
                RouteState::Bad => record.state = RouteState::Zombie,
                RouteState::Suspect => record.state = RouteState::Bad,
                RouteState::Good => {
                    if !record.entry.is_direct() {
                        record.state = RouteState::Suspect;
                    }
                }
            }
        }
        removed
    }

    /// Install the directly-connected route for a port, replacing any
    /// previous direct entry for that port. Returns the ranges whose
    /// zone bindings should be dropped.
    pub fn set_port_range(&self, port: &Arc<dyn Port>, range: NetworkRange) -> Vec<NetworkRange> {
        let mut records = self.records.write().unwrap();
        let stale: Vec<u16> = records
            .values()
            .filter(|record| record.entry.is_direct() && same_port(&record.entry.port, port))
            .map(|record| record.entry.range.first)
            .collect();
        let mut removed = Vec::new();
        for first in stale {
            if let Some(record) = records.remove(&first) {
                debug!("deleting {:?}", record.entry);
                removed.push(record.entry.range);
            }
        }
        let entry = RouteEntry::direct(Arc::clone(port), range);
        debug!("adding {:?}", entry);
        records.insert(
            range.first,
            RouteRecord {
                entry,
                state: RouteState::Good,
            },
        );
        removed
    }

    /// Withdraw every route whose egress is `port` (the port stopped).
    /// Returns the ranges whose zone bindings should be dropped.
    pub fn remove_port_routes(&self, port: &Arc<dyn Port>) -> Vec<NetworkRange> {
        let mut records = self.records.write().unwrap();
        let stale: Vec<u16> = records
            .values()
            .filter(|record| same_port(&record.entry.port, port))
            .map(|record| record.entry.range.first)
            .collect();
        let mut removed = Vec::new();
        for first in stale {
            if let Some(record) = records.remove(&first) {
                debug!("withdrawing {:?}", record.entry);
                removed.push(record.entry.range);
            }
        }
        removed
    }

    /// Snapshot of all entries with their states.
    pub fn entries(&self) -> Vec<(RouteEntry, RouteState)> {
        let records = self.records.read().unwrap();
        records
            .values()
            .map(|record| (record.entry.clone(), record.state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::testing::TestPort;

    fn remote(
        port: &Arc<dyn Port>,
        range: NetworkRange,
        distance: u8,
        next_network: u16,
        next_node: u8,
    ) -> RouteEntry {
        RouteEntry {
            extended: false,
            range,
            distance,
            port: Arc::clone(port),
            next_network,
            next_node,
        }
    }

    fn port() -> Arc<dyn Port> {
        TestPort::online(1, 220, NetworkRange::single(1))
    }

    #[test]
    fn test_lookup_by_contained_network() {
        let table = RoutingTable::new();
        let port = port();
        table.set_port_range(&port, NetworkRange::new(3, 5));
        assert!(table.lookup(2).is_none());
        for network in 3..=5 {
            let (entry, is_bad) = table.lookup(network).unwrap();
            assert_eq!(entry.range, NetworkRange::new(3, 5));
            assert!(!is_bad);
        }
        assert!(table.lookup(6).is_none());
    }

    #[test]
    fn test_consider_inserts_new_route() {
        let table = RoutingTable::new();
        let port = port();
        assert!(table.consider(remote(&port, NetworkRange::single(10), 1, 2, 100)));
        let (entry, _) = table.lookup(10).unwrap();
        assert_eq!(entry.distance, 1);
        assert_eq!(entry.next_node, 100);
    }

    #[test]
    fn test_consider_rejects_startup_range() {
        let table = RoutingTable::new();
        let port = port();
        assert!(!table.consider(remote(&port, NetworkRange::single(0xFF42), 1, 2, 100)));
        assert!(!table.consider(remote(&port, NetworkRange::single(10), 1, 0xFF42, 100)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_consider_rejects_overlap() {
        let table = RoutingTable::new();
        let port = port();
        assert!(table.consider(remote(&port, NetworkRange::new(10, 20), 1, 2, 100)));
        assert!(!table.consider(remote(&port, NetworkRange::new(15, 25), 1, 2, 101)));
        let (entry, _) = table.lookup(15).unwrap();
        assert_eq!(entry.next_node, 100);
    }

    #[test]
    fn test_consider_first_wins_tie_break() {
        let table = RoutingTable::new();
        let port = port();
        assert!(table.consider(remote(&port, NetworkRange::single(10), 2, 2, 100)));
        // equal distance via a different neighbor does not flap the route
        assert!(!table.consider(remote(&port, NetworkRange::single(10), 2, 2, 101)));
        // neither does a strictly worse one
        assert!(!table.consider(remote(&port, NetworkRange::single(10), 3, 2, 102)));
        let (entry, _) = table.lookup(10).unwrap();
        assert_eq!(entry.next_node, 100);
        // a strictly better route supersedes
        assert!(table.consider(remote(&port, NetworkRange::single(10), 1, 2, 103)));
        let (entry, _) = table.lookup(10).unwrap();
        assert_eq!(entry.next_node, 103);
    }

    #[test]
    fn test_consider_same_neighbor_updates_distance() {
        let table = RoutingTable::new();
        let port = port();
        assert!(table.consider(remote(&port, NetworkRange::single(10), 1, 2, 100)));
        // the same neighbor now reports the route further away
        assert!(table.consider(remote(&port, NetworkRange::single(10), 4, 2, 100)));
        let (entry, _) = table.lookup(10).unwrap();
        assert_eq!(entry.distance, 4);
    }

    #[test]
    fn test_consider_refreshes_identical_route() {
        let table = RoutingTable::new();
        let port = port();
        let entry = remote(&port, NetworkRange::single(10), 1, 2, 100);
        assert!(table.consider(entry.clone()));
        // walk it toward removal, then refresh
        table.age();
        table.age();
        let (_, is_bad) = table.lookup(10).unwrap();
        assert!(is_bad);
        assert!(table.consider(entry));
        let (_, is_bad) = table.lookup(10).unwrap();
        assert!(!is_bad);
    }

    #[test]
    fn test_consider_replaces_bad_route() {
        let table = RoutingTable::new();
        let port = port();
        assert!(table.consider(remote(&port, NetworkRange::single(10), 1, 2, 100)));
        table.age();
        table.age(); // Suspect -> Bad
        assert!(table.consider(remote(&port, NetworkRange::single(10), 4, 2, 101)));
        let (entry, is_bad) = table.lookup(10).unwrap();
        assert_eq!(entry.next_node, 101);
        assert!(!is_bad);
    }

    #[test]
    fn test_age_progression_and_removal() {
        let table = RoutingTable::new();
        let port = port();
        table.consider(remote(&port, NetworkRange::single(10), 1, 2, 100));

        let state = |table: &RoutingTable| table.entries()[0].1;
        assert_eq!(state(&table), RouteState::Good);
        assert!(table.age().is_empty()); // -> Suspect
        assert_eq!(state(&table), RouteState::Suspect);
        assert!(table.age().is_empty()); // -> Bad
        assert_eq!(state(&table), RouteState::Bad);
        assert!(table.age().is_empty()); // -> Zombie
        assert_eq!(state(&table), RouteState::Zombie);
        let removed = table.age(); // removed
        assert_eq!(removed, vec![NetworkRange::single(10)]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_direct_routes_do_not_age() {
        let table = RoutingTable::new();
        let port = port();
        table.set_port_range(&port, NetworkRange::single(1));
        for _ in 0..5 {
            assert!(table.age().is_empty());
        }
        let (entry, is_bad) = table.lookup(1).unwrap();
        assert!(entry.is_direct());
        assert!(!is_bad);
    }

    #[test]
    fn test_mark_bad() {
        let table = RoutingTable::new();
        let port = port();
        table.consider(remote(&port, NetworkRange::new(10, 12), 1, 2, 100));
        assert!(table.mark_bad(NetworkRange::new(10, 12)));
        let (_, is_bad) = table.lookup(11).unwrap();
        assert!(is_bad);
        assert!(!table.mark_bad(NetworkRange::single(50)));
    }

    #[test]
    fn test_set_port_range_replaces_previous_direct_entry() {
        let table = RoutingTable::new();
        let port = port();
        table.set_port_range(&port, NetworkRange::single(1));
        let removed = table.set_port_range(&port, NetworkRange::single(7));
        assert_eq!(removed, vec![NetworkRange::single(1)]);
        assert!(table.lookup(1).is_none());
        assert!(table.lookup(7).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_port_routes() {
        let table = RoutingTable::new();
        let port_a = port();
        let port_b: Arc<dyn Port> = TestPort::online(2, 221, NetworkRange::single(2));
        table.set_port_range(&port_a, NetworkRange::single(1));
        table.set_port_range(&port_b, NetworkRange::single(2));
        table.consider(remote(&port_b, NetworkRange::single(10), 1, 2, 100));
        let removed = table.remove_port_routes(&port_b);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.lookup(1).is_some());
    }
}
