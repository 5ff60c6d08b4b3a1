use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use super::jit_section::JitSection;

/// A runtime-generated native region without pc metadata: stubs, adapters,
/// trampolines announced by dynamic_code_generated records.
#[derive(Debug)]
pub struct DynamicCode {
    pub begin: u64,
    pub size: u64,
    pub name: String,
}

impl DynamicCode {
    fn end(&self) -> u64 {
        self.begin + self.size
    }
}

#[derive(Debug, Clone)]
enum Region {
    Compiled(Arc<JitSection>),
    Dynamic(Arc<DynamicCode>),
}

impl Region {
    fn end(&self) -> u64 {
        match self {
            Region::Compiled(section) => section.code_end(),
            Region::Dynamic(dynamic) => dynamic.end(),
        }
    }
}

/// The live set of JIT code regions, keyed by start address.
///
/// The dump is authoritative: a new load silently evicts everything it
/// overlaps (any byte in common, last writer wins). Evicted sections stay
/// alive for whoever still holds an `Arc` handle.
#[derive(Debug, Default)]
pub struct JitRegistry {
    regions: BTreeMap<u64, Region>,
}

impl JitRegistry {
    pub fn new() -> Self {
        JitRegistry::default()
    }

    fn evict_overlapping(&mut self, begin: u64, end: u64) {
        let mut doomed = Vec::new();
        for (&start, region) in self.regions.range(..end).rev() {
            if region.end() <= begin {
                // Live regions never overlap each other, so everything
                // below this one ends below it too.
                break;
            }
            doomed.push(start);
        }
        for start in doomed {
            debug!("code region at {start:#x} replaced by load at {begin:#x}");
            self.regions.remove(&start);
        }
    }

    pub fn load(&mut self, section: JitSection) -> Arc<JitSection> {
        let section = Arc::new(section);
        self.evict_overlapping(section.code_begin(), section.code_end());
        self.regions.insert(
            section.code_begin(),
            Region::Compiled(Arc::clone(&section)),
        );
        section
    }

    pub fn dyn_load(&mut self, dynamic: DynamicCode) {
        if dynamic.size == 0 {
            return;
        }
        let end = dynamic.end();
        self.evict_overlapping(dynamic.begin, end);
        self.regions
            .insert(dynamic.begin, Region::Dynamic(Arc::new(dynamic)));
    }

    /// Removes the region starting exactly at `begin`, if any. Outstanding
    /// handles keep the storage alive.
    pub fn unload(&mut self, begin: u64) {
        if self.regions.remove(&begin).is_none() {
            debug!("unload for unknown code region at {begin:#x}");
        }
    }

    /// The compiled section containing `ip`, if any.
    pub fn find_section(&self, ip: u64) -> Option<&Arc<JitSection>> {
        match self.find_region(ip)? {
            Region::Compiled(section) => Some(section),
            Region::Dynamic(_) => None,
        }
    }

    /// Whether `ip` falls inside any live region, compiled or dynamic.
    pub fn covers(&self, ip: u64) -> bool {
        self.find_region(ip).is_some()
    }

    fn find_region(&self, ip: u64) -> Option<&Region> {
        let (_, region) = self.regions.range(..=ip).next_back()?;
        (region.end() > ip).then_some(region)
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Verifies the no-overlap invariant; used by tests.
    #[cfg(test)]
    pub fn check_no_overlap(&self) {
        let mut previous_end = 0u64;
        for (&start, region) in &self.regions {
            assert!(start >= previous_end, "regions overlap at {start:#x}");
            previous_end = region.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::jit_section::testutil::section;
    use super::*;

    fn dynamic(begin: u64, size: u64) -> DynamicCode {
        DynamicCode {
            begin,
            size,
            name: "I2C/C2I adapters".into(),
        }
    }

    #[test]
    fn finds_by_floor_lookup() {
        let mut registry = JitRegistry::new();
        registry.load(section(0x1000, 0x100, &[]));
        registry.load(section(0x3000, 0x100, &[]));
        assert!(registry.find_section(0x1000).is_some());
        assert!(registry.find_section(0x10ff).is_some());
        assert!(registry.find_section(0x1100).is_none());
        assert!(registry.find_section(0x0fff).is_none());
        assert!(registry.find_section(0x3050).is_some());
    }

    #[test]
    fn reload_at_same_address_replaces() {
        // Two loads at the same address with different sizes: only the
        // second survives, and the original-only range no longer hits.
        let mut registry = JitRegistry::new();
        registry.load(section(0x1000, 0x1000, &[]));
        registry.load(section(0x1000, 0x800, &[]));
        assert_eq!(registry.len(), 1);
        assert!(registry.find_section(0x1400).is_some());
        assert!(registry.find_section(0x1900).is_none());
        registry.check_no_overlap();
    }

    #[test]
    fn partial_overlap_evicts_all_touched_regions() {
        let mut registry = JitRegistry::new();
        registry.load(section(0x1000, 0x100, &[]));
        registry.load(section(0x1100, 0x100, &[]));
        registry.load(section(0x1200, 0x100, &[]));
        // Straddles the tail of the first and the head of the third.
        registry.load(section(0x10f0, 0x120, &[]));
        assert_eq!(registry.len(), 1);
        registry.check_no_overlap();
        let live = registry.find_section(0x1100).unwrap();
        assert_eq!(live.code_begin(), 0x10f0);
    }

    #[test]
    fn dynamic_code_participates_in_overlap_rule() {
        let mut registry = JitRegistry::new();
        registry.load(section(0x1000, 0x100, &[]));
        registry.dyn_load(dynamic(0x1080, 0x100));
        assert_eq!(registry.len(), 1);
        assert!(registry.find_section(0x1090).is_none());
        assert!(registry.covers(0x1090));
        registry.check_no_overlap();
    }

    #[test]
    fn unload_removes_only_exact_start() {
        let mut registry = JitRegistry::new();
        let handle = registry.load(section(0x1000, 0x100, &[0x40]));
        registry.unload(0x1004);
        assert_eq!(registry.len(), 1);
        registry.unload(0x1000);
        assert!(registry.is_empty());
        // The outstanding handle still resolves pcs.
        assert_eq!(handle.find_pc(0x1040), Some(0));
    }

    #[test]
    fn overlap_invariant_holds_under_churn() {
        let mut registry = JitRegistry::new();
        for i in 0..32u64 {
            let begin = 0x1000 + (i * 0x37) % 0x400;
            registry.load(section(begin, 0x80, &[]));
            registry.check_no_overlap();
        }
        for i in 0..16u64 {
            registry.unload(0x1000 + i * 8);
            registry.check_no_overlap();
        }
    }
}
