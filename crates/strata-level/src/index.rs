use strata_core::SmallKeyHashSet;

use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt::Display;
use std::sync::Arc;
use std::thread;

/// Number of levels: level `L` holds every cell key shifted right by `L` bits, so level 32 is the single root node.
const NUM_LEVELS: usize = 33;

/// Maps signed coordinates onto unsigned keys with the same ordering.
#[inline]
fn to_key(c: i32) -> u32 {
    (c as u32) ^ 0x8000_0000
}

#[inline]
fn from_key(k: u32) -> i32 {
    (k ^ 0x8000_0000) as i32
}

/// A sparse set of `D`-dimensional integer cells that answers "is any cell present in this box?"
///
/// Stored as a layered segment tree: every ancestor node (coordinate prefix) of a present cell is also present. Range
/// queries descend from the root and stop at the first absent node, so large empty ranges are rejected after a handful
/// of hash lookups. Cells are never removed.
#[derive(Clone, Debug)]
pub struct SpatialIndex<const D: usize> {
    levels: Vec<SmallKeyHashSet<[u32; D]>>,
}

impl<const D: usize> Default for SpatialIndex<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize> SpatialIndex<D> {
    pub fn new() -> Self {
        Self {
            levels: (0..NUM_LEVELS).map(|_| SmallKeyHashSet::default()).collect(),
        }
    }

    /// Returns `true` if the cell was not already present.
    pub fn add(&mut self, cell: [i32; D]) -> bool {
        let mut node = cell.map(to_key);
        for (level, nodes) in self.levels.iter_mut().enumerate() {
            if !nodes.insert(node) {
                // Every ancestor of an existing node already exists.
                return level > 0;
            }
            node = node.map(|k| k >> 1);
        }
        true
    }

    pub fn extend(&mut self, cells: impl IntoIterator<Item = [i32; D]>) {
        for cell in cells {
            self.add(cell);
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.extend(other.iter());
    }

    pub fn contains(&self, cell: [i32; D]) -> bool {
        self.levels[0].contains(&cell.map(to_key))
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = [i32; D]> + '_ {
        self.levels[0].iter().map(|node| node.map(from_key))
    }

    pub fn for_each(&self, mut f: impl FnMut([i32; D])) {
        for cell in self.iter() {
            f(cell);
        }
    }

    /// True iff some cell lies in the half-open box `[min, lub)`.
    pub fn contains_any(&self, min: [i32; D], lub: [i32; D]) -> bool {
        if (0..D).any(|i| min[i] >= lub[i]) {
            return false;
        }
        let lo = min.map(|c| to_key(c) as u64);
        let hi: [u64; D] = std::array::from_fn(|i| to_key(lub[i]) as u64 - 1);
        self.search(NUM_LEVELS - 1, [0; D], &lo, &hi)
    }

    /// True iff some cell lies in the closed box `[min, max]`.
    pub fn contains_any_inclusive(&self, min: [i32; D], max: [i32; D]) -> bool {
        if (0..D).any(|i| min[i] > max[i]) {
            return false;
        }
        let lo = min.map(|c| to_key(c) as u64);
        let hi = max.map(|c| to_key(c) as u64);
        self.search(NUM_LEVELS - 1, [0; D], &lo, &hi)
    }

    /// `lo` and `hi` are inclusive bounds in key space.
    fn search(&self, level: usize, node: [u32; D], lo: &[u64; D], hi: &[u64; D]) -> bool {
        if !self.levels[level].contains(&node) {
            return false;
        }

        let mut fully_covered = true;
        for i in 0..D {
            let node_min = (node[i] as u64) << level;
            let node_max = node_min + ((1u64 << level) - 1);
            if node_max < lo[i] || node_min > hi[i] {
                return false;
            }
            if node_min < lo[i] || node_max > hi[i] {
                fully_covered = false;
            }
        }
        // A present node implies a present cell somewhere inside of it.
        if fully_covered || level == 0 {
            return true;
        }

        (0..1usize << D).any(|octant| {
            let child = std::array::from_fn(|i| (node[i] << 1) | ((octant >> i) & 1) as u32);
            self.search(level - 1, child, lo, hi)
        })
    }
}

/// A thread-safe [`SpatialIndex`] that can be seeded from a slow source in the background.
///
/// Additions are accepted immediately, even while seeding is in progress. Queries block until seeding finishes. If
/// seeding fails, every non-empty query answers `true` from then on: a false positive only costs a storage lookup,
/// while a false negative would hide data.
pub struct ConcurrentSpatialIndex<const D: usize> {
    shared: Arc<SharedIndex<D>>,
}

struct SharedIndex<const D: usize> {
    index: RwLock<SpatialIndex<D>>,
    seed_state: Mutex<SeedState>,
    seeded: Condvar,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SeedState {
    Seeding,
    Ready,
    Failed,
}

impl<const D: usize> Clone for ConcurrentSpatialIndex<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<const D: usize> Default for ConcurrentSpatialIndex<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize> ConcurrentSpatialIndex<D> {
    pub fn new() -> Self {
        Self::with_state(SeedState::Ready)
    }

    fn with_state(state: SeedState) -> Self {
        Self {
            shared: Arc::new(SharedIndex {
                index: RwLock::new(SpatialIndex::new()),
                seed_state: Mutex::new(state),
                seeded: Condvar::new(),
            }),
        }
    }

    /// Creates an index and seeds it on a background thread with the cells produced by `load`.
    pub fn with_initial_points<F, I, E>(load: F) -> Self
    where
        F: FnOnce() -> Result<I, E> + Send + 'static,
        I: IntoIterator<Item = [i32; D]>,
        E: Display,
    {
        let this = Self::with_state(SeedState::Seeding);
        let shared = Arc::clone(&this.shared);
        let spawned = thread::Builder::new()
            .name("strata-index-seed".into())
            .spawn(move || {
                // Build privately so concurrent adds only wait for the final merge.
                let result = load().map(|cells| {
                    let mut seed = SpatialIndex::new();
                    seed.extend(cells);
                    seed
                });
                let state = match result {
                    Ok(seed) => {
                        let mut index = shared.index.write();
                        index.merge(&seed);
                        log::info!("Seeded spatial index with {} cells", seed.len());
                        SeedState::Ready
                    }
                    Err(e) => {
                        log::error!("Failed to seed spatial index, all queries will report data: {}", e);
                        SeedState::Failed
                    }
                };
                shared.finish_seeding(state);
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn spatial index seeding thread: {}", e);
            this.shared.finish_seeding(SeedState::Failed);
        }
        this
    }

    /// Returns `true` if the cell was not already present.
    pub fn add(&self, cell: [i32; D]) -> bool {
        self.shared.index.write().add(cell)
    }

    pub fn contains(&self, cell: [i32; D]) -> bool {
        match self.wait_for_seed() {
            SeedState::Failed => true,
            _ => self.shared.index.read().contains(cell),
        }
    }

    /// See [`SpatialIndex::contains_any`].
    pub fn contains_any(&self, min: [i32; D], lub: [i32; D]) -> bool {
        if (0..D).any(|i| min[i] >= lub[i]) {
            return false;
        }
        match self.wait_for_seed() {
            SeedState::Failed => true,
            _ => self.shared.index.read().contains_any(min, lub),
        }
    }

    /// Blocks until seeding finishes. Returns `false` if seeding failed.
    pub fn wait_until_seeded(&self) -> bool {
        self.wait_for_seed() == SeedState::Ready
    }

    pub fn is_seeding(&self) -> bool {
        *self.shared.seed_state.lock() == SeedState::Seeding
    }

    /// Number of cells known so far. Does not wait for seeding.
    pub fn len(&self) -> usize {
        self.shared.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out the current cells. Does not wait for seeding.
    pub fn snapshot(&self) -> SpatialIndex<D> {
        self.shared.index.read().clone()
    }

    fn wait_for_seed(&self) -> SeedState {
        let mut state = self.shared.seed_state.lock();
        while *state == SeedState::Seeding {
            self.shared.seeded.wait(&mut state);
        }
        *state
    }
}

impl<const D: usize> SharedIndex<D> {
    fn finish_seeding(&self, state: SeedState) {
        *self.seed_state.lock() = state;
        self.seeded.notify_all();
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
