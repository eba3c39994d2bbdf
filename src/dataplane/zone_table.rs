//! The zone information base
//!
//! Maps network ranges to their zone lists. The first zone recorded for
//! a range is its default zone. Zone names join case-insensitively but
//! keep the spelling first seen. Bindings disappear together with the
//! last route reaching their range.

use crate::protocol::{NetworkRange, ZoneName};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

struct RangeZones {
    range: NetworkRange,
    // index 0 is the default zone
    zones: Vec<ZoneName>,
}

/// The zone table.
#[derive(Default)]
pub struct ZoneTable {
    // keyed by range.first, same keying as the routing table
    ranges: RwLock<BTreeMap<u16, RangeZones>>,
}

impl ZoneTable {
    pub fn new() -> Self {
        Self {
            ranges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Bind a zone to a network range. The first zone bound to a range
    /// becomes its default. Binding the same zone again is a no-op.
    pub fn add_zone(&self, zone_name: ZoneName, range: NetworkRange) -> Result<()> {
        let mut ranges = self.ranges.write().unwrap();
        match ranges.get_mut(&range.first) {
            Some(record) => {
                if record.range != range {
                    return Err(Error::ZoneRangeConflict {
                        existing: record.range,
                        given: range,
                    });
                }
                if !record.zones.contains(&zone_name) {
                    record.zones.push(zone_name);
                }
            }
            None => {
                ranges.insert(
                    range.first,
                    RangeZones {
                        range,
                        zones: vec![zone_name],
                    },
                );
            }
        }
        Ok(())
    }

    /// Drop all zone bindings for a range; called when the last route to
    /// it goes away.
    pub fn remove_networks(&self, range: NetworkRange) {
        let mut ranges = self.ranges.write().unwrap();
        if let Some(record) = ranges.get(&range.first) {
            if record.range == range {
                ranges.remove(&range.first);
            }
        }
    }

    /// Zones of every range overlapping `range`, default zones first,
    /// deduplicated.
    pub fn zones_in_range(&self, range: NetworkRange) -> Vec<ZoneName> {
        let ranges = self.ranges.read().unwrap();
        let mut zones: Vec<ZoneName> = Vec::new();
        for record in ranges.values() {
            if !record.range.overlaps(&range) {
                continue;
            }
            for zone in &record.zones {
                if !zones.contains(zone) {
                    zones.push(zone.clone());
                }
            }
        }
        zones
    }

    /// The default zone of the range starting at `range.first`.
    pub fn default_zone(&self, range: NetworkRange) -> Option<ZoneName> {
        let ranges = self.ranges.read().unwrap();
        let record = ranges.get(&range.first)?;
        record.zones.first().cloned()
    }

    /// Whether any zone is bound anywhere in `range`.
    pub fn has_zones_for(&self, range: NetworkRange) -> bool {
        !self.zones_in_range(range).is_empty()
    }

    /// The union of all known zones, deduplicated, in range order.
    pub fn zones(&self) -> Vec<ZoneName> {
        let ranges = self.ranges.read().unwrap();
        let mut zones: Vec<ZoneName> = Vec::new();
        for record in ranges.values() {
            for zone in &record.zones {
                if !zones.contains(zone) {
                    zones.push(zone.clone());
                }
            }
        }
        zones
    }

    /// Ranges that serve the given zone.
    pub fn ranges_in_zone(&self, zone_name: &ZoneName) -> Vec<NetworkRange> {
        let ranges = self.ranges.read().unwrap();
        ranges
            .values()
            .filter(|record| record.zones.contains(zone_name))
            .map(|record| record.range)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(name: &[u8]) -> ZoneName {
        ZoneName::new(name).unwrap()
    }

    #[test]
    fn test_default_zone_is_first_bound() {
        let table = ZoneTable::new();
        let range = NetworkRange::new(3, 5);
        table.add_zone(zone(b"Finance"), range).unwrap();
        table.add_zone(zone(b"Marketing"), range).unwrap();
        assert_eq!(table.default_zone(range), Some(zone(b"Finance")));
        assert_eq!(
            table.zones_in_range(range),
            vec![zone(b"Finance"), zone(b"Marketing")]
        );
    }

    #[test]
    fn test_case_insensitive_join() {
        let table = ZoneTable::new();
        let range = NetworkRange::single(10);
        table.add_zone(zone(b"Finance"), range).unwrap();
        table.add_zone(zone(b"FINANCE"), range).unwrap();
        let zones = table.zones_in_range(range);
        assert_eq!(zones.len(), 1);
        // the first-seen spelling is kept
        assert_eq!(zones[0].as_bytes(), b"Finance");
    }

    #[test]
    fn test_range_conflict_rejected() {
        let table = ZoneTable::new();
        table
            .add_zone(zone(b"Finance"), NetworkRange::new(3, 5))
            .unwrap();
        let result = table.add_zone(zone(b"Finance"), NetworkRange::new(3, 7));
        assert!(matches!(result, Err(Error::ZoneRangeConflict { .. })));
    }

    #[test]
    fn test_remove_networks() {
        let table = ZoneTable::new();
        let range = NetworkRange::single(10);
        table.add_zone(zone(b"Finance"), range).unwrap();
        assert!(table.has_zones_for(range));
        // a non-coincident range does not remove anything
        table.remove_networks(NetworkRange::new(10, 12));
        assert!(table.has_zones_for(range));
        table.remove_networks(range);
        assert!(!table.has_zones_for(range));
        assert!(table.is_empty());
    }

    #[test]
    fn test_zone_union_deduplicates() {
        let table = ZoneTable::new();
        table
            .add_zone(zone(b"Finance"), NetworkRange::single(10))
            .unwrap();
        table
            .add_zone(zone(b"finance"), NetworkRange::single(20))
            .unwrap();
        table
            .add_zone(zone(b"Marketing"), NetworkRange::single(20))
            .unwrap();
        assert_eq!(table.zones().len(), 2);
    }

    #[test]
    fn test_ranges_in_zone() {
        let table = ZoneTable::new();
        table
            .add_zone(zone(b"Finance"), NetworkRange::single(10))
            .unwrap();
        table
            .add_zone(zone(b"Finance"), NetworkRange::new(20, 25))
            .unwrap();
        table
            .add_zone(zone(b"Marketing"), NetworkRange::single(30))
            .unwrap();
        let ranges = table.ranges_in_zone(&zone(b"FINANCE"));
        assert_eq!(
            ranges,
            vec![NetworkRange::single(10), NetworkRange::new(20, 25)]
        );
    }
}
