//! vPPB -> physical-port forwarding map. `lookup` is the only thing
//! routers ever call; everything else is switch control-plane machinery.
//! Each entry updates atomically so a router reading mid-rebind never
//! observes a torn `{active, target}` pair.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub type PortId = usize;

/// Sentinel stored in `target` while an entry is inactive. Readers must
/// check `active` first; this value is never exposed through `lookup`.
const NO_TARGET: usize = usize::MAX;

struct Entry {
    active: AtomicBool,
    target: AtomicUsize,
}

/// Array indexed by vPPB id of `{active, target_port}`.
pub struct RoutingTable {
    entries: Vec<Entry>,
}

impl RoutingTable {
    pub fn new(vppb_count: usize) -> Self {
        let entries = (0..vppb_count)
            .map(|_| Entry {
                active: AtomicBool::new(false),
                target: AtomicUsize::new(NO_TARGET),
            })
            .collect();
        RoutingTable { entries }
    }

    pub fn vppb_count(&self) -> usize {
        self.entries.len()
    }

    /// Only active entries forward traffic.
    pub fn lookup(&self, vppb: usize) -> Option<PortId> {
        let entry = self.entries.get(vppb)?;
        if entry.active.load(Ordering::Acquire) {
            Some(entry.target.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn set_target(&self, vppb: usize, port: PortId) {
        if let Some(entry) = self.entries.get(vppb) {
            entry.target.store(port, Ordering::Release);
        }
    }

    pub fn activate(&self, vppb: usize) {
        if let Some(entry) = self.entries.get(vppb) {
            entry.active.store(true, Ordering::Release);
        }
    }

    pub fn deactivate(&self, vppb: usize) {
        if let Some(entry) = self.entries.get(vppb) {
            entry.active.store(false, Ordering::Release);
        }
    }

    pub fn is_active(&self, vppb: usize) -> bool {
        self.entries
            .get(vppb)
            .map(|e| e.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_entry_never_forwards() {
        let table = RoutingTable::new(4);
        table.set_target(1, 7);
        assert_eq!(table.lookup(1), None);
        table.activate(1);
        assert_eq!(table.lookup(1), Some(7));
    }

    #[test]
    fn deactivate_hides_target_without_clearing_it() {
        let table = RoutingTable::new(2);
        table.set_target(0, 3);
        table.activate(0);
        table.deactivate(0);
        assert_eq!(table.lookup(0), None);
        table.activate(0);
        assert_eq!(table.lookup(0), Some(3));
    }

    #[test]
    fn out_of_range_vppb_is_harmless() {
        let table = RoutingTable::new(1);
        table.activate(5);
        table.set_target(5, 1);
        assert_eq!(table.lookup(5), None);
    }
}
