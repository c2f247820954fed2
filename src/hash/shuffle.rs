use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Shuffle-vector bucket hasher: the mapping unit is partitioned into
/// `nr_shuffle_entry` chunks and each hash function applies a precomputed
/// permutation of the chunks, leaving the offset inside a chunk untouched.
#[derive(Debug, Clone)]
pub struct ShuffleHasher {
    nr_set_per_page: u64,
    nr_shuffle_entry: u64,
    nr_cache_per_entry: u64,
    vectors: Vec<Vec<u64>>,
}

const NR_SHUFFLE_VEC: usize = 32;

impl ShuffleHasher {
    /// Seeded so identical configs reproduce identical mappings.
    pub fn new(nr_set_per_page: u64, nr_shuffle_entry: u64, seed: u64) -> Self {
        assert!(nr_shuffle_entry > 0 && nr_set_per_page % nr_shuffle_entry == 0);
        let mut vectors = Vec::with_capacity(NR_SHUFFLE_VEC);
        for vec_idx in 0..NR_SHUFFLE_VEC {
            let mut rng = StdRng::seed_from_u64(seed ^ (vec_idx as u64).wrapping_mul(0x9E37_79B9));
            let mut perm: Vec<u64> = (0..nr_shuffle_entry).collect();
            perm.shuffle(&mut rng);
            vectors.push(perm);
        }
        Self {
            nr_set_per_page,
            nr_shuffle_entry,
            nr_cache_per_entry: nr_set_per_page / nr_shuffle_entry,
            vectors,
        }
    }

    pub fn hash(&self, key: u64, map_hash_idx: u64, map_unit_idx: u64) -> u64 {
        debug_assert!(map_hash_idx < 2);
        let idx_in_unit = key % self.nr_set_per_page;
        let shuffle_idx = idx_in_unit / self.nr_cache_per_entry;
        let idx_in_entry = idx_in_unit % self.nr_cache_per_entry;

        let hash_idx = (map_unit_idx * 2 + map_hash_idx) as usize;
        debug_assert!(hash_idx < self.vectors.len());
        let target_entry = self.vectors[hash_idx][shuffle_idx as usize];
        debug_assert!(target_entry < self.nr_shuffle_entry);

        let out = target_entry * self.nr_cache_per_entry + idx_in_entry;
        debug_assert!(out < self.nr_set_per_page);
        out
    }
}
