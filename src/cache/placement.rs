use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::{TagArray, Way};
use crate::config::PlacementKind;

/// Admission decision for direct-mapped line caches. LRU and FBR always
/// admit; Random admits half the misses to cut thrashing under conflict.
#[derive(Debug)]
pub struct LinePlacement {
    kind: PlacementKind,
    rng: StdRng,
}

impl LinePlacement {
    pub fn new(kind: PlacementKind) -> Self {
        Self {
            kind,
            rng: StdRng::seed_from_u64(0x11ab_71ed),
        }
    }

    pub fn handle_miss(&mut self, _victim: &Way) -> bool {
        match self.kind {
            PlacementKind::Lru | PlacementKind::Fbr => true,
            PlacementKind::Random => self.rng.gen_bool(0.5),
        }
    }
}

/// Victim selection for the page-granular schemes. LRU keeps per-way
/// timestamps; FBR keeps frequency counters that live in the in-cache tag
/// metadata, so consulting them costs a counter access in near memory.
#[derive(Debug)]
pub struct PagePlacement {
    kind: PlacementKind,
    num_ways: u64,
    /// Per (set, way): last-access stamp for LRU, frequency for FBR.
    meta: Vec<u64>,
    clock: u64,
    rng: StdRng,
}

const FBR_COUNTER_MAX: u64 = u16::MAX as u64;

impl PagePlacement {
    pub fn new(kind: PlacementKind, num_sets: u64, num_ways: u64) -> Self {
        Self {
            kind,
            num_ways,
            meta: vec![0; (num_sets * num_ways) as usize],
            clock: 0,
            rng: StdRng::seed_from_u64(0x9a6e_914c),
        }
    }

    fn slot(&mut self, set: u64, way: u64) -> &mut u64 {
        &mut self.meta[(set * self.num_ways + way) as usize]
    }

    /// Record a hit. Returns whether the policy consulted an in-memory
    /// counter (FBR keeps its frequencies next to the tags).
    pub fn handle_hit(&mut self, set: u64, way: u64) -> bool {
        self.clock += 1;
        match self.kind {
            PlacementKind::Lru => {
                let clock = self.clock;
                *self.slot(set, way) = clock;
                false
            }
            PlacementKind::Fbr => {
                let slot = self.slot(set, way);
                *slot = (*slot + 1).min(FBR_COUNTER_MAX);
                true
            }
            PlacementKind::Random => false,
        }
    }

    /// Pick a victim way for a miss, or `num_ways` to bypass the cache.
    /// Invalid ways win first; ties break by policy metadata.
    pub fn handle_miss(&mut self, set: u64, tags: &TagArray, counter_access: &mut bool) -> u64 {
        self.clock += 1;
        if let Some(way) = tags.empty_way(set) {
            let clock = self.clock;
            *self.slot(set, way) = match self.kind {
                PlacementKind::Lru => clock,
                _ => 1,
            };
            return way;
        }
        match self.kind {
            PlacementKind::Lru => {
                let victim = (0..self.num_ways)
                    .min_by_key(|&w| self.meta[(set * self.num_ways + w) as usize])
                    .unwrap_or(0);
                let clock = self.clock;
                *self.slot(set, victim) = clock;
                victim
            }
            PlacementKind::Fbr => {
                *counter_access = true;
                let victim = (0..self.num_ways)
                    .min_by_key(|&w| self.meta[(set * self.num_ways + w) as usize])
                    .unwrap_or(0);
                *self.slot(set, victim) = 1;
                victim
            }
            PlacementKind::Random => self.rng.gen_range(0..self.num_ways),
        }
    }

    /// Forget everything about a set; used when the bandwidth balancer
    /// sweeps it out.
    pub fn flush_set(&mut self, set: u64) {
        for way in 0..self.num_ways {
            *self.slot(set, way) = 0;
        }
    }
}
