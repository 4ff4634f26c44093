//! Host-managed Device Memory range decoder and CXL.cache snoop-id table:
//! address -> vppb and snoop id -> vppb, each populated at runtime rather
//! than scattering address matching across the routers.
//!
//! Both tables are populated by the virtual switch's control API
//! (`VirtualSwitch::set_hdm_range`, `VirtualSwitch::set_snoop_id`) and
//! consulted read-only by the mem/cache routers on every packet.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy)]
struct HdmRange {
    base: u64,
    size: u64,
    vppb: usize,
}

/// Address -> vPPB range map consulted by the CXL.mem and CXL.io-MMIO
/// routing paths.
pub struct HdmDecoder {
    ranges: RwLock<Vec<HdmRange>>,
}

impl HdmDecoder {
    pub fn new() -> Self {
        HdmDecoder {
            ranges: RwLock::new(Vec::new()),
        }
    }

    /// Installs (or replaces, if `vppb` already owns a range) the HDM range
    /// routing decoded addresses in `[base, base + size)` to `vppb`.
    pub fn set_range(&self, base: u64, size: u64, vppb: usize) {
        let mut ranges = self.ranges.write().unwrap();
        ranges.retain(|r| r.vppb != vppb);
        ranges.push(HdmRange { base, size, vppb });
    }

    pub fn clear_range(&self, vppb: usize) {
        self.ranges.write().unwrap().retain(|r| r.vppb != vppb);
    }

    pub fn resolve(&self, address: u64) -> Option<usize> {
        self.ranges
            .read()
            .unwrap()
            .iter()
            .find(|r| address >= r.base && address < r.base + r.size)
            .map(|r| r.vppb)
    }
}

impl Default for HdmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// CXL.cache snoop-id -> vPPB table consulted by the cache router.
pub struct SnoopTable {
    map: RwLock<HashMap<u16, usize>>,
}

impl SnoopTable {
    pub fn new() -> Self {
        SnoopTable {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, snoop_id: u16, vppb: usize) {
        self.map.write().unwrap().insert(snoop_id, vppb);
    }

    pub fn clear(&self, snoop_id: u16) {
        self.map.write().unwrap().remove(&snoop_id);
    }

    pub fn resolve(&self, snoop_id: u16) -> Option<usize> {
        self.map.read().unwrap().get(&snoop_id).copied()
    }
}

impl Default for SnoopTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_address_inside_range() {
        let hdm = HdmDecoder::new();
        hdm.set_range(0xFE000000, 256 * 1024 * 1024, 2);
        assert_eq!(hdm.resolve(0xFE000000), Some(2));
        assert_eq!(hdm.resolve(0xFE000000 + 0x1000), Some(2));
        assert_eq!(hdm.resolve(0xFE000000 - 1), None);
    }

    #[test]
    fn replacing_a_vppbs_range_drops_the_old_one() {
        let hdm = HdmDecoder::new();
        hdm.set_range(0x1000, 0x1000, 1);
        hdm.set_range(0x5000, 0x1000, 1);
        assert_eq!(hdm.resolve(0x1000), None);
        assert_eq!(hdm.resolve(0x5000), Some(1));
    }

    #[test]
    fn snoop_table_roundtrips() {
        let snoop = SnoopTable::new();
        snoop.set(9, 3);
        assert_eq!(snoop.resolve(9), Some(3));
        snoop.clear(9);
        assert_eq!(snoop.resolve(9), None);
    }
}
